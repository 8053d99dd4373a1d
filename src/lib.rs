//! IMU Sync Gateway - synchronized motion capture from multiple sensor nodes.
//!
//! This library collects inertial samples from several independent wireless
//! sensor nodes and joins them into time-aligned frames: one row per device
//! timestamp, with every device represented. Frames can optionally be fed to a
//! classifier, either one at a time or in fixed-length windows.
//!
//! # Guarantees
//!
//! - **Exactly once**: a frame is emitted once per timestamp, and only when every device reported
//! - **Stable columns**: devices are always ordered by name, never by arrival
//! - **Shared start**: configuration and clock reset reach every device concurrently
//! - **Total cleanup**: every device is released at session end, even after failures
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                       IMU Sync Gateway                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │  Transport  │──▶│  Timestamp  │──▶│  Inference  │         │
//! │  │ (per node)  │   │ Aggregator  │   │   Router    │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! │         ▲                 │                 │                │
//! │         │                 ▼                 ▼                │
//! │  ┌─────────────┐   ┌─────────────┐   ┌─────────────┐         │
//! │  │   Session   │   │  Frame Log  │   │   Latest    │         │
//! │  │ Controller  │   │ (CSV/JSON)  │   │   Result    │         │
//! │  └─────────────┘   └─────────────┘   └─────────────┘         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use imu_sync_gateway::device::{DeviceRegistry, SimDevice, SimulatedTransport};
//! use imu_sync_gateway::session::{SessionController, SessionRequest, SessionSettings};
//! use imu_sync_gateway::stats::create_shared_stats;
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let registry = DeviceRegistry::parse("AA:01 J\nAA:02 K\n")?;
//! let transport = SimulatedTransport::new(vec![
//!     SimDevice::new("AA:01", b'J'),
//!     SimDevice::new("AA:02", b'K'),
//! ]);
//! let controller = SessionController::new(
//!     Arc::new(transport),
//!     Arc::new(registry),
//!     SessionSettings::default(),
//!     create_shared_stats(),
//! );
//!
//! let log = controller
//!     .start_session(SessionRequest::new(["J", "K"], Duration::from_secs(10)))
//!     .await?;
//! println!("{} frames", log.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod device;
pub mod session;
pub mod stats;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use config::{Config, ConfigError, Profile};
pub use crate::core::{
    Classification, ExportFormat, Frame, FrameLog, InferencePlan, LatestResult, SensingMode,
    TimestampAggregator,
};
pub use device::{DeviceId, DeviceRegistry, Sample, Transport};
pub use session::{SessionController, SessionError, SessionRequest, SessionState};
pub use stats::{CollectionStats, SharedStats, StatsSnapshot};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
