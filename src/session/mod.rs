//! Sensing session lifecycle and status.

pub mod controller;
pub mod error;
pub mod state;

pub use controller::{SessionController, SessionRequest, SessionSettings};
pub use error::SessionError;
pub use state::{SessionEvent, SessionState};
