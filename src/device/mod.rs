//! Sensor nodes: identities, wire records, the link abstraction and the registry.

pub mod registry;
pub mod sim;
pub mod transport;
pub mod types;

pub use registry::{DeviceRegistry, RegistryError};
pub use sim::{SimDevice, SimulatedTransport};
pub use transport::{Connection, DisconnectNotifier, NotificationSink, Transport, TransportError};
pub use types::{
    Command, DecodeError, DeviceAddress, DeviceId, Payload, Sample, WireRecord, AXIS_LABELS,
    DEFAULT_SAMPLE_PERIOD_MS, PAYLOAD_LEN,
};
