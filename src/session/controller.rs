//! Session lifecycle: connect, broadcast configuration, collect, tear down.
//!
//! A [`SessionController`] is shared by whatever drives it (the CLI, the HTTP
//! server) and runs at most one session at a time. Status is published through
//! a watch channel so pollers never block the session.
//!
//! Each session runs on its own task. Dropping the future returned by
//! [`SessionController::start_session`] stops collection early, but teardown
//! still runs to completion and the frames go to the recovery directory.

use crate::config::Config;
use crate::core::aggregator::{IngestOutcome, TimestampAggregator};
use crate::core::frame::{ExportFormat, FrameLog};
use crate::core::inference::{InferencePlan, InferenceRouter, LatestResult};
use crate::device::registry::DeviceRegistry;
use crate::device::transport::{Connection, DisconnectNotifier, NotificationSink, Transport};
use crate::device::types::{
    Command, DeviceAddress, DeviceId, WireRecord, DEFAULT_SAMPLE_PERIOD_MS,
};
use crate::session::error::{BroadcastFailure, SessionError};
use crate::session::state::{SessionEvent, SessionState};
use crate::stats::{DropReason, SharedStats};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, OwnedMutexGuard};
use tokio::task::JoinSet;

/// Timing and buffering knobs for sessions.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    /// Pause before each configuration broadcast.
    pub settle_delay: Duration,
    pub notification_capacity: usize,
    /// How often collection progress is logged.
    pub progress_interval: Duration,
    /// Where frames of a session nobody waited for are written.
    pub recovery_dir: Option<PathBuf>,
    pub recovery_format: ExportFormat,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            command_timeout: config.command_timeout,
            settle_delay: config.settle_delay,
            notification_capacity: config.notification_capacity,
            recovery_dir: Some(config.export_path.join("recovered")),
            recovery_format: config.export_format,
            ..Self::default()
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(5),
            settle_delay: Duration::from_secs(1),
            notification_capacity: 1024,
            progress_interval: Duration::from_secs(1),
            recovery_dir: None,
            recovery_format: ExportFormat::Csv,
        }
    }
}

/// What to collect.
#[derive(Debug)]
pub struct SessionRequest {
    pub devices: BTreeSet<DeviceId>,
    pub duration: Duration,
    /// Sampling period broadcast to every device.
    pub sampling_ms: u16,
    /// Classifier to feed frames to. `None` collects only.
    pub plan: Option<InferencePlan>,
}

impl SessionRequest {
    pub fn new<I, D>(devices: I, duration: Duration) -> Self
    where
        I: IntoIterator<Item = D>,
        D: Into<DeviceId>,
    {
        Self {
            devices: devices.into_iter().map(Into::into).collect(),
            duration,
            sampling_ms: DEFAULT_SAMPLE_PERIOD_MS,
            plan: None,
        }
    }

    pub fn with_sampling_ms(mut self, sampling_ms: u16) -> Self {
        self.sampling_ms = sampling_ms;
        self
    }

    pub fn with_plan(mut self, plan: InferencePlan) -> Self {
        self.plan = Some(plan);
        self
    }
}

/// Per-session state shared by every device task.
struct Pipeline {
    aggregator: TimestampAggregator,
    log: Mutex<FrameLog>,
    router: Option<InferenceRouter>,
    state: watch::Receiver<SessionState>,
    stats: SharedStats,
}

impl Pipeline {
    fn handle_record(&self, device: &DeviceId, bytes: &[u8]) {
        if !self.state.borrow().accepts_samples() {
            self.stats.record_drop(DropReason::NotCollecting);
            return;
        }

        let record = match WireRecord::decode(bytes) {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(device = %device, "dropping malformed record: {}", e);
                self.stats.record_drop(DropReason::Malformed);
                return;
            }
        };
        if device.as_str().as_bytes().first() != Some(&record.tag) {
            tracing::debug!(device = %device, tag = record.tag, "record tag differs from device name");
        }
        self.stats.record_sample();

        let sample = record.into_sample(device.clone());
        let ts = sample.timestamp_ms;
        let frame = match self.aggregator.offer(sample) {
            IngestOutcome::Completed(frame) => frame,
            IngestOutcome::Pending { .. } => return,
            IngestOutcome::Duplicate => {
                tracing::debug!(device = %device, ts, "duplicate report");
                self.stats.record_drop(DropReason::Duplicate);
                return;
            }
            IngestOutcome::Late => {
                tracing::debug!(device = %device, ts, "late report");
                self.stats.record_drop(DropReason::Late);
                return;
            }
        };

        self.stats.record_frame();
        if let Some(router) = &self.router {
            router.route(&frame);
        }
        self.log
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame);
    }
}

/// Requests stop of its session when dropped while armed.
struct StopOnDrop {
    stop: Arc<watch::Sender<bool>>,
    armed: bool,
}

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("session caller went away, stopping collection");
            self.stop.send_replace(true);
        }
    }
}

/// Everything a session task needs from its controller.
struct Shared<T: Transport> {
    transport: Arc<T>,
    registry: Arc<DeviceRegistry>,
    settings: SessionSettings,
    state: watch::Sender<SessionState>,
    latest: LatestResult,
    stats: SharedStats,
    /// Held for the whole lifetime of a session, teardown included.
    running: Arc<tokio::sync::Mutex<()>>,
    /// Stop switch of the current session, if any.
    stop: Mutex<Option<Arc<watch::Sender<bool>>>>,
}

/// Drives sensing sessions over a transport.
pub struct SessionController<T: Transport> {
    shared: Arc<Shared<T>>,
}

impl<T: Transport> SessionController<T> {
    pub fn new(
        transport: Arc<T>,
        registry: Arc<DeviceRegistry>,
        settings: SessionSettings,
        stats: SharedStats,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Ready);
        Self {
            shared: Arc::new(Shared {
                transport,
                registry,
                settings,
                state,
                latest: LatestResult::new(),
                stats,
                running: Arc::new(tokio::sync::Mutex::new(())),
                stop: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.shared.state.subscribe()
    }

    pub fn latest_result(&self) -> &LatestResult {
        &self.shared.latest
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.shared.registry
    }

    pub fn stats(&self) -> &SharedStats {
        &self.shared.stats
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.shared.settings
    }

    /// Whether a session currently holds the controller.
    pub fn is_running(&self) -> bool {
        self.shared.running.try_lock().is_err()
    }

    /// Ask a running session to end collection now. Returns false when idle.
    pub fn stop(&self) -> bool {
        match self.shared.current_stop() {
            Some(stop) => {
                tracing::info!("stop requested");
                stop.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Refresh online status of every registered device.
    pub async fn scan(&self, timeout: Duration) -> Result<BTreeMap<DeviceId, bool>, SessionError> {
        let shared = &self.shared;
        Ok(shared.registry.scan(shared.transport.as_ref(), timeout).await?)
    }

    /// Run one complete session and return its frames in timestamp order.
    ///
    /// The session itself runs on a spawned task. If this future is dropped
    /// before it resolves, collection is stopped, every link is still
    /// released, and the partial log is handed to the recovery directory.
    pub async fn start_session(&self, request: SessionRequest) -> Result<FrameLog, SessionError> {
        let guard = self
            .shared
            .running
            .clone()
            .try_lock_owned()
            .map_err(|_| SessionError::InvalidCommandState(self.state()))?;

        if request.devices.is_empty() {
            return Err(SessionError::NoDevices);
        }
        let mut targets = Vec::with_capacity(request.devices.len());
        for id in &request.devices {
            let address = self.shared.registry.lookup(id)?;
            targets.push((id.clone(), address.clone()));
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        self.shared.set_stop(Some(stop_tx.clone()));
        let mut abandon = StopOnDrop {
            stop: stop_tx,
            armed: true,
        };

        let (done_tx, done_rx) = oneshot::channel();
        let shared = self.shared.clone();
        tokio::spawn(async move {
            let result = shared.run_session(guard, targets, request, stop_rx).await;
            if let Err(unclaimed) = done_tx.send(result) {
                shared.recover(unclaimed);
            }
        });

        let outcome = done_rx.await;
        abandon.armed = false;
        outcome.map_err(|_| SessionError::Interrupted)?
    }

    /// Put devices into deep sleep. Per-device failures are logged and skipped,
    /// since a sleeping node drops its link without a clean disconnect.
    ///
    /// Returns the devices that acknowledged the command.
    pub async fn sleep_devices(
        &self,
        devices: &BTreeSet<DeviceId>,
    ) -> Result<BTreeSet<DeviceId>, SessionError> {
        let _guard = self
            .shared
            .running
            .try_lock()
            .map_err(|_| SessionError::InvalidCommandState(self.state()))?;

        let settings = &self.shared.settings;
        let mut pending = JoinSet::new();
        for id in devices {
            let address = self.shared.registry.lookup(id)?.clone();
            let transport = self.shared.transport.clone();
            let id = id.clone();
            let connect_timeout = settings.connect_timeout;
            let command_timeout = settings.command_timeout;
            pending.spawn(async move {
                let notifier = DisconnectNotifier::detached(id.clone());
                let conn =
                    match tokio::time::timeout(connect_timeout, transport.connect(&address, notifier))
                        .await
                    {
                        Ok(Ok(conn)) => conn,
                        Ok(Err(e)) => {
                            tracing::warn!(device = %id, "sleep: connect failed: {}", e);
                            return None;
                        }
                        Err(_) => {
                            tracing::warn!(device = %id, "sleep: connect timed out");
                            return None;
                        }
                    };
                let sent = tokio::time::timeout(command_timeout, conn.send_command(Command::DeepSleep))
                    .await;
                let _ = conn.disconnect().await;
                match sent {
                    Ok(Ok(())) => Some(id),
                    Ok(Err(e)) => {
                        tracing::warn!(device = %id, "sleep command failed: {}", e);
                        None
                    }
                    Err(_) => {
                        tracing::warn!(device = %id, "sleep command timed out");
                        None
                    }
                }
            });
        }

        let mut asleep = BTreeSet::new();
        while let Some(joined) = pending.join_next().await {
            if let Ok(Some(id)) = joined {
                asleep.insert(id);
            }
        }
        tracing::info!(requested = devices.len(), asleep = asleep.len(), "deep sleep sent");
        Ok(asleep)
    }
}

impl<T: Transport> Shared<T> {
    fn current_stop(&self) -> Option<Arc<watch::Sender<bool>>> {
        self.stop.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_stop(&self, stop: Option<Arc<watch::Sender<bool>>>) {
        *self.stop.lock().unwrap_or_else(|e| e.into_inner()) = stop;
    }

    fn transition(&self, event: SessionEvent) -> SessionState {
        let mut next = SessionState::Ready;
        self.state.send_modify(|state| {
            let before = *state;
            *state = state.apply(&event);
            next = *state;
            if before != next {
                tracing::info!(from = %before, to = %next, "session state changed");
            }
        });
        next
    }

    /// The body of one session. `guard` is released once every link is closed
    /// and the final state is published.
    async fn run_session(
        &self,
        guard: OwnedMutexGuard<()>,
        targets: Vec<(DeviceId, DeviceAddress)>,
        request: SessionRequest,
        stop: watch::Receiver<bool>,
    ) -> Result<FrameLog, SessionError> {
        let result = self.drive(&targets, request, stop).await;
        self.set_stop(None);
        drop(guard);
        result
    }

    async fn drive(
        &self,
        targets: &[(DeviceId, DeviceAddress)],
        request: SessionRequest,
        stop: watch::Receiver<bool>,
    ) -> Result<FrameLog, SessionError> {
        self.latest.clear();
        self.transition(SessionEvent::Started);

        let router = request
            .plan
            .map(|plan| InferenceRouter::new(plan, self.latest.clone(), self.stats.clone()));
        let pipeline = Arc::new(Pipeline {
            aggregator: TimestampAggregator::new(targets.len()),
            log: Mutex::new(FrameLog::new(request.devices.iter().cloned())),
            router,
            state: self.state.subscribe(),
            stats: self.stats.clone(),
        });

        tracing::info!(
            devices = targets.len(),
            duration_secs = request.duration.as_secs_f64(),
            sampling_ms = request.sampling_ms,
            "starting session"
        );

        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let mut links: Vec<(DeviceId, Arc<T::Connection>)> = Vec::with_capacity(targets.len());
        let mut readers = JoinSet::new();

        let configured = self
            .connect_and_configure(
                targets,
                request.sampling_ms,
                &lost_tx,
                &pipeline,
                &mut links,
                &mut readers,
            )
            .await;
        if let Err(e) = configured {
            tracing::warn!("session aborted: {}", e);
            self.teardown(&links).await;
            readers.abort_all();
            self.transition(SessionEvent::Aborted);
            return Err(e);
        }
        drop(lost_tx);

        self.transition(SessionEvent::Activated);
        self.collect(request.duration, lost_rx, stop).await;

        self.teardown(&links).await;
        let drained = tokio::time::timeout(self.settings.command_timeout, async {
            while readers.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            tracing::debug!("notification readers still open after teardown, aborting");
            readers.abort_all();
        }

        let incomplete = pipeline.aggregator.discard_pending();
        if incomplete > 0 {
            tracing::info!(incomplete, "discarding incomplete timestamps");
            self.stats.record_incomplete(incomplete as u64);
        }
        if let Some(router) = &pipeline.router {
            let leftover = router.window_len();
            if leftover > 0 {
                tracing::debug!(leftover, "partial classification window discarded");
            }
        }

        let final_state = self.transition(SessionEvent::Finished);
        self.stats.record_session_completed();
        if let Err(e) = self.stats.save() {
            tracing::warn!("Failed to save stats: {}", e);
        }

        drop(readers);
        let log = match Arc::try_unwrap(pipeline) {
            Ok(pipeline) => pipeline.log.into_inner().unwrap_or_else(|e| e.into_inner()),
            Err(shared) => {
                let guard = shared.log.lock().unwrap_or_else(|e| e.into_inner());
                guard.clone()
            }
        };
        let log = log.finalize();
        tracing::info!(frames = log.len(), state = %final_state, "session finished");
        Ok(log)
    }

    /// Connect every target in order, wire its notifications, then broadcast
    /// the sampling period and the timestamp reset.
    ///
    /// Links opened so far are left in `links` for the caller to release.
    async fn connect_and_configure(
        &self,
        targets: &[(DeviceId, DeviceAddress)],
        sampling_ms: u16,
        lost_tx: &mpsc::UnboundedSender<DeviceId>,
        pipeline: &Arc<Pipeline>,
        links: &mut Vec<(DeviceId, Arc<T::Connection>)>,
        readers: &mut JoinSet<()>,
    ) -> Result<(), SessionError> {
        for (id, address) in targets {
            let notifier = DisconnectNotifier::new(id.clone(), lost_tx.clone());
            let conn = tokio::time::timeout(
                self.settings.connect_timeout,
                self.transport.connect(address, notifier),
            )
            .await
            .map_err(|_| SessionError::connection(id, "connect timed out"))?
            .map_err(|e| SessionError::connection(id, e))?;
            let conn = Arc::new(conn);
            links.push((id.clone(), conn.clone()));
            tracing::info!(device = %id, address = %address, "connected");

            let (tx, mut rx) = mpsc::channel::<Vec<u8>>(self.settings.notification_capacity);
            conn.subscribe(NotificationSink::new(id.clone(), tx))
                .await
                .map_err(|e| SessionError::connection(id, e))?;

            let pipeline = pipeline.clone();
            let device = id.clone();
            readers.spawn(async move {
                while let Some(bytes) = rx.recv().await {
                    pipeline.handle_record(&device, &bytes);
                }
            });
        }

        self.broadcast(links, Command::SetSamplePeriod(sampling_ms))
            .await?;
        self.broadcast(links, Command::ResetTimestamp).await?;
        Ok(())
    }

    /// Send `command` to every link at once and wait for all acknowledgments.
    async fn broadcast(
        &self,
        links: &[(DeviceId, Arc<T::Connection>)],
        command: Command,
    ) -> Result<(), SessionError> {
        if !self.settings.settle_delay.is_zero() {
            tokio::time::sleep(self.settings.settle_delay).await;
        }
        tracing::info!(%command, devices = links.len(), "broadcasting");

        let mut pending = JoinSet::new();
        for (id, conn) in links {
            let id = id.clone();
            let conn = conn.clone();
            let limit = self.settings.command_timeout;
            pending.spawn(async move {
                match tokio::time::timeout(limit, conn.send_command(command)).await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(BroadcastFailure::Transport(id, e)),
                    Err(_) => Err(BroadcastFailure::Timeout(id)),
                }
            });
        }

        let mut first_failure = None;
        while let Some(joined) = pending.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(failure)) => {
                    first_failure.get_or_insert(failure);
                }
                Err(e) => tracing::error!("broadcast task failed: {}", e),
            }
        }
        match first_failure {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }

    /// Wait out the collection period, handling link loss and stop requests.
    async fn collect(
        &self,
        duration: Duration,
        mut lost: mpsc::UnboundedReceiver<DeviceId>,
        mut stop: watch::Receiver<bool>,
    ) {
        let deadline = tokio::time::sleep(duration);
        tokio::pin!(deadline);

        let started = tokio::time::Instant::now();
        let mut ticker =
            tokio::time::interval(self.settings.progress_interval.max(Duration::from_millis(1)));
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = &mut deadline => break,
                _ = stop.wait_for(|stopped| *stopped) => {
                    tracing::info!("collection stopped early");
                    break;
                }
                Some(device) = lost.recv() => {
                    tracing::warn!(device = %device, "device disconnected unexpectedly");
                    self.transition(SessionEvent::UnexpectedDisconnect(device));
                }
                _ = ticker.tick() => {
                    tracing::info!(
                        elapsed_secs = started.elapsed().as_secs(),
                        total_secs = duration.as_secs(),
                        frames = self.stats.stats().frames_emitted,
                        "collecting"
                    );
                }
            }
        }
    }

    /// Unsubscribe and disconnect every link. Failures are logged, never propagated.
    async fn teardown(&self, links: &[(DeviceId, Arc<T::Connection>)]) {
        for (id, conn) in links {
            if let Err(e) = conn.unsubscribe().await {
                tracing::warn!(device = %id, "unsubscribe failed: {}", e);
            }
        }
        for (id, conn) in links {
            match tokio::time::timeout(self.settings.command_timeout, conn.disconnect()).await {
                Ok(Ok(())) => tracing::info!(device = %id, "disconnected"),
                Ok(Err(e)) => tracing::warn!(device = %id, "disconnect failed: {}", e),
                Err(_) => tracing::warn!(device = %id, "disconnect timed out"),
            }
        }
    }

    /// Keep the result of a session whose caller went away.
    fn recover(&self, result: Result<FrameLog, SessionError>) {
        let log = match result {
            Ok(log) => log,
            Err(e) => {
                tracing::warn!("abandoned session failed: {}", e);
                return;
            }
        };
        let Some(dir) = &self.settings.recovery_dir else {
            tracing::warn!(frames = log.len(), "abandoned session discarded, no recovery directory");
            return;
        };
        let format = self.settings.recovery_format;
        let path = dir.join(log.file_name(format));
        match log.save(&path, format) {
            Ok(()) => tracing::warn!(frames = log.len(), "abandoned session saved to {:?}", path),
            Err(e) => tracing::error!("Failed to save abandoned session to {:?}: {}", path, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::inference::{ClassifierError, Label};
    use crate::device::sim::{SimDevice, SimulatedTransport};
    use crate::device::transport::TransportError;
    use crate::device::types::PAYLOAD_LEN;
    use crate::stats::create_shared_stats;
    use async_trait::async_trait;
    use std::collections::HashSet;

    fn controller(devices: Vec<SimDevice>) -> SessionController<SimulatedTransport> {
        let registry = DeviceRegistry::new(
            devices
                .iter()
                .map(|d| (DeviceId::new((d.tag as char).to_string()), d.address.clone())),
        )
        .unwrap();
        SessionController::new(
            Arc::new(SimulatedTransport::new(devices)),
            Arc::new(registry),
            SessionSettings::default(),
            create_shared_stats(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_device_session_collects_complete_frames() {
        let ctl = controller(vec![
            SimDevice::new("AA:00", b'A'),
            SimDevice::new("BB:00", b'B'),
        ]);

        let log = ctl
            .start_session(SessionRequest::new(["A", "B"], Duration::from_secs(2)))
            .await
            .unwrap();

        assert!(log.len() >= 30, "got {} frames", log.len());
        assert!(log.frames().iter().all(|f| f.device_count() == 2));
        assert_eq!(log.frames()[0].timestamp_ms, 0);
        assert!(log
            .frames()
            .windows(2)
            .all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
        assert_eq!(ctl.state(), SessionState::Ready);
        assert!(!ctl.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejects_empty_and_unknown_devices() {
        let ctl = controller(vec![SimDevice::new("AA:00", b'A')]);

        let empty = SessionRequest::new(Vec::<DeviceId>::new(), Duration::from_secs(1));
        assert_eq!(ctl.start_session(empty).await.unwrap_err(), SessionError::NoDevices);

        let unknown = SessionRequest::new(["Z"], Duration::from_secs(1));
        assert_eq!(
            ctl.start_session(unknown).await.unwrap_err(),
            SessionError::UnknownDevice(DeviceId::new("Z"))
        );
        assert_eq!(ctl.state(), SessionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_failure_aborts_to_ready() {
        let ctl = controller(vec![
            SimDevice::new("AA:00", b'A'),
            SimDevice::new("BB:00", b'B').refusing_connect(),
        ]);

        let err = ctl
            .start_session(SessionRequest::new(["A", "B"], Duration::from_secs(1)))
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::ConnectionFailed { ref device, .. } if device.as_str() == "B"));
        assert_eq!(ctl.state(), SessionState::Ready);
        assert_eq!(
            ctl.shared.transport.disconnect_log(),
            vec![DeviceAddress::new("AA:00")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_command_is_configuration_timeout() {
        let ctl = controller(vec![
            SimDevice::new("AA:00", b'A'),
            SimDevice::new("BB:00", b'B').stalling_commands(),
        ]);

        let err = ctl
            .start_session(SessionRequest::new(["A", "B"], Duration::from_secs(1)))
            .await
            .unwrap_err();

        assert_eq!(err, SessionError::ConfigurationTimeout(DeviceId::new("B")));
        assert_eq!(ctl.state(), SessionState::Ready);
        assert_eq!(ctl.shared.transport.disconnect_log().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_windowed_plan_publishes_results() {
        let ctl = controller(vec![SimDevice::new("AA:00", b'A')]);
        let plan = InferencePlan::windowed(
            10,
            |rows: &[Vec<f32>]| -> Result<Label, ClassifierError> { Ok(format!("n{}", rows.len())) },
        )
        .unwrap();

        let log = ctl
            .start_session(
                SessionRequest::new(["A"], Duration::from_secs(2))
                    .with_sampling_ms(100)
                    .with_plan(plan),
            )
            .await
            .unwrap();

        assert!(log.len() >= 19);
        let latest = ctl.latest_result().get().expect("a window completed");
        assert_eq!(latest.label, "n10");
        assert!(ctl.stats().stats().classifications >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_when_idle_is_noop() {
        let ctl = controller(vec![SimDevice::new("AA:00", b'A')]);
        assert!(!ctl.stop());
        assert_eq!(ctl.state(), SessionState::Ready);
    }

    fn record(tag: u8, ts: u32) -> Vec<u8> {
        WireRecord {
            tag,
            timestamp_ms: ts,
            payload: [0.5; PAYLOAD_LEN],
        }
        .encode()
        .to_vec()
    }

    /// A node that reports before its clock reset, then sends one truncated
    /// record and one good one 100ms after it.
    struct ChattyTransport;

    struct ChattyConnection {
        address: DeviceAddress,
        sink: Arc<Mutex<Option<NotificationSink>>>,
    }

    #[async_trait]
    impl Transport for ChattyTransport {
        type Connection = ChattyConnection;

        async fn connect(
            &self,
            address: &DeviceAddress,
            _on_disconnect: DisconnectNotifier,
        ) -> Result<ChattyConnection, TransportError> {
            Ok(ChattyConnection {
                address: address.clone(),
                sink: Arc::new(Mutex::new(None)),
            })
        }

        async fn discover(&self, _timeout: Duration) -> Result<HashSet<DeviceAddress>, TransportError> {
            Ok(HashSet::new())
        }
    }

    #[async_trait]
    impl Connection for ChattyConnection {
        fn address(&self) -> &DeviceAddress {
            &self.address
        }

        async fn subscribe(&self, sink: NotificationSink) -> Result<(), TransportError> {
            assert!(sink.try_deliver(record(b'A', 999)));
            *self.sink.lock().unwrap() = Some(sink);
            Ok(())
        }

        async fn unsubscribe(&self) -> Result<(), TransportError> {
            self.sink.lock().unwrap().take();
            Ok(())
        }

        async fn send_command(&self, command: Command) -> Result<(), TransportError> {
            if command == Command::ResetTimestamp {
                let sink = self.sink.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    if let Some(sink) = sink.lock().unwrap().as_ref() {
                        let mut truncated = record(b'A', 0);
                        truncated.truncate(29);
                        sink.try_deliver(truncated);
                        sink.try_deliver(record(b'A', 0));
                    }
                });
            }
            Ok(())
        }

        async fn disconnect(&self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_and_malformed_records_are_dropped() {
        let registry =
            DeviceRegistry::new([(DeviceId::new("A"), DeviceAddress::new("AA:00"))]).unwrap();
        let ctl = SessionController::new(
            Arc::new(ChattyTransport),
            Arc::new(registry),
            SessionSettings::default(),
            create_shared_stats(),
        );

        let log = ctl
            .start_session(SessionRequest::new(["A"], Duration::from_secs(1)))
            .await
            .unwrap();

        assert_eq!(log.len(), 1);
        assert_eq!(log.frames()[0].timestamp_ms, 0);

        let stats = ctl.stats().stats();
        assert_eq!(stats.samples_ignored, 1);
        assert_eq!(stats.samples_malformed, 1);
        assert_eq!(stats.samples_received, 1);
        assert_eq!(stats.frames_emitted, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_configuration_skips_collection() {
        let ctl = Arc::new(controller(vec![SimDevice::new("AA:00", b'A')]));

        let running = {
            let ctl = ctl.clone();
            tokio::spawn(async move {
                ctl.start_session(SessionRequest::new(["A"], Duration::from_secs(60)))
                    .await
            })
        };
        let mut state = ctl.subscribe_state();
        state
            .wait_for(|s| *s == SessionState::AwaitingStart)
            .await
            .unwrap();
        assert!(ctl.stop());

        let log = running.await.unwrap().unwrap();
        assert!(log.len() <= 1, "got {} frames", log.len());
        assert_eq!(ctl.state(), SessionState::Ready);
        assert_eq!(ctl.shared.transport.disconnect_log().len(), 1);
    }
}
