//! In-process stand-in for the radio link.
//!
//! Each simulated node behaves like the sensor firmware: it samples on a
//! fixed period, stays silent until the first reset command, then notifies one
//! record per period with a timestamp that advances by the period. Failure
//! modes (refused connections, stalled commands, link loss) can be switched on
//! per node so session behaviour can be exercised without hardware.

use crate::device::transport::{
    Connection, DisconnectNotifier, NotificationSink, Transport, TransportError,
};
use crate::device::types::{Command, DeviceAddress, Payload, WireRecord, DEFAULT_SAMPLE_PERIOD_MS};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Behaviour of one simulated node.
#[derive(Debug, Clone)]
pub struct SimDevice {
    pub address: DeviceAddress,
    pub tag: u8,
    pub online: bool,
    pub refuse_connect: bool,
    pub stall_commands: bool,
    pub fail_disconnect: bool,
    /// Drop the link once the device clock passes this many milliseconds.
    pub drop_after_ms: Option<u32>,
}

impl SimDevice {
    pub fn new(address: &str, tag: u8) -> Self {
        Self {
            address: DeviceAddress::new(address),
            tag,
            online: true,
            refuse_connect: false,
            stall_commands: false,
            fail_disconnect: false,
            drop_after_ms: None,
        }
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    pub fn refusing_connect(mut self) -> Self {
        self.refuse_connect = true;
        self
    }

    pub fn stalling_commands(mut self) -> Self {
        self.stall_commands = true;
        self
    }

    pub fn failing_disconnect(mut self) -> Self {
        self.fail_disconnect = true;
        self
    }

    pub fn dropping_after(mut self, ms: u32) -> Self {
        self.drop_after_ms = Some(ms);
        self
    }
}

/// A command as observed by a simulated node.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRecord {
    pub address: DeviceAddress,
    pub command: Command,
    pub at: tokio::time::Instant,
}

/// Simulated transport over a fixed set of nodes.
#[derive(Debug, Clone, Default)]
pub struct SimulatedTransport {
    devices: Arc<Mutex<HashMap<DeviceAddress, SimDevice>>>,
    commands: Arc<Mutex<Vec<CommandRecord>>>,
    disconnects: Arc<Mutex<Vec<DeviceAddress>>>,
}

impl SimulatedTransport {
    pub fn new(devices: Vec<SimDevice>) -> Self {
        let devices = devices
            .into_iter()
            .map(|d| (d.address.clone(), d))
            .collect();
        Self {
            devices: Arc::new(Mutex::new(devices)),
            ..Self::default()
        }
    }

    /// Every command any node has received, in arrival order.
    pub fn command_log(&self) -> Vec<CommandRecord> {
        lock(&self.commands).clone()
    }

    /// Addresses that were explicitly disconnected, in order.
    pub fn disconnect_log(&self) -> Vec<DeviceAddress> {
        lock(&self.disconnects).clone()
    }

    fn device(&self, address: &DeviceAddress) -> Option<SimDevice> {
        lock(&self.devices).get(address).cloned()
    }
}

#[async_trait]
impl Transport for SimulatedTransport {
    type Connection = SimConnection;

    async fn connect(
        &self,
        address: &DeviceAddress,
        on_disconnect: DisconnectNotifier,
    ) -> Result<SimConnection, TransportError> {
        let device = match self.device(address) {
            Some(d) if d.online => d,
            _ => return Err(TransportError::NotFound(address.clone())),
        };
        if device.refuse_connect {
            return Err(TransportError::Link(format!("{address} refused the connection")));
        }

        let link = Arc::new(Mutex::new(LinkState {
            connected: true,
            started: false,
            period_ms: DEFAULT_SAMPLE_PERIOD_MS,
            clock_ms: 0,
            sink: None,
        }));
        let ticker = tokio::spawn(run_firmware(
            device.clone(),
            link.clone(),
            on_disconnect.clone(),
        ));

        Ok(SimConnection {
            device,
            link,
            ticker: Mutex::new(Some(ticker)),
            on_disconnect,
            transport: self.clone(),
        })
    }

    async fn discover(&self, timeout: Duration) -> Result<HashSet<DeviceAddress>, TransportError> {
        tokio::time::sleep(timeout).await;
        Ok(lock(&self.devices)
            .values()
            .filter(|d| d.online)
            .map(|d| d.address.clone())
            .collect())
    }
}

#[derive(Debug)]
struct LinkState {
    connected: bool,
    started: bool,
    period_ms: u16,
    clock_ms: u32,
    sink: Option<NotificationSink>,
}

/// Open link to a simulated node.
#[derive(Debug)]
pub struct SimConnection {
    device: SimDevice,
    link: Arc<Mutex<LinkState>>,
    ticker: Mutex<Option<JoinHandle<()>>>,
    on_disconnect: DisconnectNotifier,
    transport: SimulatedTransport,
}

impl SimConnection {
    fn ensure_connected(&self) -> Result<(), TransportError> {
        if lock(&self.link).connected {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }

    /// Restart the sampling loop so the first record lands one period after now.
    fn restart_firmware(&self) {
        let ticker = tokio::spawn(run_firmware(
            self.device.clone(),
            self.link.clone(),
            self.on_disconnect.clone(),
        ));
        if let Some(old) = lock(&self.ticker).replace(ticker) {
            old.abort();
        }
    }

    fn stop_firmware(&self) {
        let mut link = lock(&self.link);
        link.connected = false;
        link.sink = None;
        drop(link);
        if let Some(ticker) = lock(&self.ticker).take() {
            ticker.abort();
        }
    }
}

#[async_trait]
impl Connection for SimConnection {
    fn address(&self) -> &DeviceAddress {
        &self.device.address
    }

    async fn subscribe(&self, sink: NotificationSink) -> Result<(), TransportError> {
        self.ensure_connected()?;
        lock(&self.link).sink = Some(sink);
        Ok(())
    }

    async fn unsubscribe(&self) -> Result<(), TransportError> {
        lock(&self.link).sink = None;
        Ok(())
    }

    async fn send_command(&self, command: Command) -> Result<(), TransportError> {
        self.ensure_connected()?;
        if self.device.stall_commands {
            std::future::pending::<()>().await;
        }

        lock(&self.transport.commands).push(CommandRecord {
            address: self.device.address.clone(),
            command,
            at: tokio::time::Instant::now(),
        });

        match command {
            Command::ResetTimestamp => {
                {
                    let mut link = lock(&self.link);
                    link.clock_ms = 0;
                    link.started = true;
                }
                self.restart_firmware();
            }
            Command::SetSamplePeriod(ms) => lock(&self.link).period_ms = ms.max(1),
            Command::DeepSleep => {
                self.stop_firmware();
                if let Some(d) = lock(&self.transport.devices).get_mut(&self.device.address) {
                    d.online = false;
                }
            }
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.stop_firmware();
        lock(&self.transport.disconnects).push(self.device.address.clone());
        if self.device.fail_disconnect {
            return Err(TransportError::Link("disconnect was not acknowledged".into()));
        }
        Ok(())
    }
}

/// Sampling loop of one node.
async fn run_firmware(
    device: SimDevice,
    link: Arc<Mutex<LinkState>>,
    on_disconnect: DisconnectNotifier,
) {
    loop {
        let period = lock(&link).period_ms;
        tokio::time::sleep(Duration::from_millis(u64::from(period))).await;

        let mut state = lock(&link);
        if !state.connected {
            return;
        }
        if state.started {
            if let Some(limit) = device.drop_after_ms {
                if state.clock_ms > limit {
                    state.connected = false;
                    state.sink = None;
                    drop(state);
                    tracing::debug!(address = %device.address, "simulated link loss");
                    on_disconnect.notify();
                    return;
                }
            }
            if let Some(sink) = state.sink.as_ref() {
                let record = WireRecord {
                    tag: device.tag,
                    timestamp_ms: state.clock_ms,
                    payload: motion(device.tag, state.clock_ms),
                };
                sink.try_deliver(record.encode().to_vec());
            }
        }
        state.clock_ms = state.clock_ms.wrapping_add(u32::from(state.period_ms));
    }
}

/// Smooth synthetic motion, distinct per node.
fn motion(tag: u8, clock_ms: u32) -> Payload {
    let t = clock_ms as f32 / 1000.0;
    let phase = f32::from(tag) * 0.1;
    [
        0.5 * (t + phase).sin(),
        0.5 * (t + phase).cos(),
        9.81,
        10.0 * (0.5 * t + phase).sin(),
        5.0 * (0.5 * t + phase).cos(),
        0.0,
    ]
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
