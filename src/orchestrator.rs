//! Reconnection orchestrator for a single Pressensor.
//!
//! The device sleeps most of the time and only advertises when it has
//! something to report, so the link is (re)established opportunistically:
//!
//! - on every advertisement sighting,
//! - on a long fallback timer in case a sighting was missed,
//! - on explicit request,
//! - on a daily maintenance timer that keeps the battery level fresh.
//!
//! All triggers funnel through one guarded entry point so that at most one
//! attempt is ever in flight. State lives in a single control task; radio
//! work runs in spawned tasks whose results are posted back as messages.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::ble::radio::{LinkEvent, PeripheralHandle, Radio};
use crate::config::OrchestratorConfig;
use crate::data::Reading;
use crate::diagnostics::Diagnostics;
use crate::error::{Error, Result};
use crate::session::{BatteryOutcome, CallbackHandle, ConnectOutcome, ConnectionSession, SessionState};

/// What started a connection attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Startup,
    Advertisement,
    Fallback,
    Manual,
    Maintenance,
    Reenabled,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Startup => write!(f, "startup"),
            Trigger::Advertisement => write!(f, "advertisement"),
            Trigger::Fallback => write!(f, "fallback timer"),
            Trigger::Manual => write!(f, "manual request"),
            Trigger::Maintenance => write!(f, "maintenance timer"),
            Trigger::Reenabled => write!(f, "re-enable"),
        }
    }
}

/// Requests from the public handle.
enum Command {
    RequestConnect(oneshot::Sender<Result<()>>),
    SendZeroCalibration(oneshot::Sender<Result<()>>),
    SetConnectionEnabled(bool, oneshot::Sender<()>),
    Diagnostics(oneshot::Sender<Diagnostics>),
    Shutdown(oneshot::Sender<()>),
}

/// Completions posted back by spawned radio work.
enum Event<R: Radio> {
    Located(Option<R::Peripheral>),
    Connected(ConnectOutcome<R::Link>),
    BatteryRead(BatteryOutcome),
    Disconnected,
    LinkLost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Tracks when the battery level was last confirmed.
#[derive(Debug, Clone)]
struct MaintenanceSchedule {
    interval: Duration,
    last_success: Option<Instant>,
    last_success_wall: Option<DateTime<Utc>>,
}

impl MaintenanceSchedule {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_success: None,
            last_success_wall: None,
        }
    }

    /// A check is due if none succeeded yet or the last one is older than the interval.
    fn is_due(&self, now: Instant) -> bool {
        match self.last_success {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    fn record_success(&mut self, now: Instant) {
        self.last_success = Some(now);
        self.last_success_wall = Some(Utc::now());
    }
}

/// Shared snapshot plus the update channel.
#[derive(Clone)]
struct Publisher {
    snapshot: Arc<RwLock<Reading>>,
    updates: broadcast::Sender<Reading>,
}

impl Publisher {
    fn publish(&self, reading: &Reading) {
        *self.snapshot.write() = *reading;
        // No receivers is fine.
        let _ = self.updates.send(*reading);
    }

    fn current(&self) -> Reading {
        *self.snapshot.read()
    }
}

/// A connection attempt in flight.
struct Attempt {
    trigger: Trigger,
    reply: Option<oneshot::Sender<Result<()>>>,
}

fn respond<T>(reply: Option<oneshot::Sender<T>>, value: T) {
    if let Some(reply) = reply {
        let _ = reply.send(value);
    }
}

/// Handle to a running orchestrator.
///
/// Dropping the handle shuts the orchestrator down.
pub struct Orchestrator {
    /// Device address.
    address: String,
    /// Command channel into the control task.
    commands: mpsc::UnboundedSender<Command>,
    /// Latest published reading.
    publisher: Publisher,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Control task handle.
    task: Mutex<Option<JoinHandle<()>>>,
}

impl Orchestrator {
    /// Start managing the device at `address`.
    ///
    /// Spawns the control task, arms the advertisement watch and both
    /// timers, and, if configured, makes one opportunistic connection
    /// attempt.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn start<R: Radio>(radio: Arc<R>, address: impl Into<String>, config: OrchestratorConfig) -> Self {
        let address = address.into();
        let config = config.sanitized();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (link_events_tx, link_events_rx) = mpsc::unbounded_channel();
        let (sightings_tx, sightings_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(64);

        let publisher = Publisher {
            snapshot: Arc::new(RwLock::new(Reading::seeded(config.session.battery_seed))),
            updates,
        };

        info!("Starting orchestrator for Pressensor {}", address);

        let controller = Controller {
            schedule: MaintenanceSchedule::new(config.maintenance_interval),
            radio,
            address: address.clone(),
            config,
            session: None,
            connecting: false,
            attempt: None,
            maintenance_failures: 0,
            was_available: false,
            enabled: true,
            expected_disconnect: false,
            shutting_down: false,
            commands_closed: false,
            shutdown_waiters: Vec::new(),
            advertisements: None,
            publisher: publisher.clone(),
            events: events_tx,
            link_events: link_events_tx,
            sightings: sightings_tx,
        };

        let task = tokio::spawn(controller.run(commands_rx, events_rx, link_events_rx, sightings_rx));

        Self {
            address,
            commands: commands_tx,
            publisher,
            callback_counter: AtomicU64::new(0),
            task: Mutex::new(Some(task)),
        }
    }

    /// Get the device address.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Get the latest reading. Never blocks on radio I/O.
    pub fn current_reading(&self) -> Reading {
        self.publisher.current()
    }

    /// Connect now, surfacing failures.
    ///
    /// Returns `Ok` without touching the radio if the device is already
    /// connected or an attempt is already running.
    ///
    /// # Errors
    ///
    /// - [`Error::DeviceNotFound`] if the radio cannot see the device
    /// - [`Error::ConnectionFailed`] if the handshake or subscription failed
    /// - [`Error::ConnectionDisabled`] if the connection toggle is off
    /// - [`Error::ShutDown`] after [`shutdown`](Self::shutdown)
    pub async fn request_connect(&self) -> Result<()> {
        self.call(Command::RequestConnect).await?
    }

    /// Zero the pressure sensor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] without a live link, or
    /// [`Error::CommandFailed`] / [`Error::Timeout`] if the device did not
    /// acknowledge the write.
    pub async fn send_zero_calibration(&self) -> Result<()> {
        self.call(Command::SendZeroCalibration).await?
    }

    /// Enable or disable connecting to the device.
    pub async fn set_connection_enabled(&self, enabled: bool) -> Result<()> {
        self.call(|reply| Command::SetConnectionEnabled(enabled, reply)).await
    }

    /// Get a diagnostics snapshot.
    pub async fn diagnostics(&self) -> Result<Diagnostics> {
        self.call(Command::Diagnostics).await
    }

    /// Subscribe to every published reading.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<Reading> {
        self.publisher.updates.subscribe()
    }

    /// Register a callback for every published reading.
    ///
    /// Returns a handle that can be used to unregister the callback.
    pub fn subscribe_to_updates<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(&Reading) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.publisher.updates.subscribe();

        let handle = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(reading) => callback(&reading),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Update callback lagged, skipped {} readings", skipped)
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Shut down: stop timers and the advertisement watch, wait for an
    /// attempt in flight, then disconnect.
    ///
    /// Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        match self.call(Command::Shutdown).await {
            Ok(()) | Err(Error::ShutDown) => {}
            Err(e) => return Err(e),
        }

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                return Err(Error::Internal(format!("control task failed: {}", e)));
            }
        }
        Ok(())
    }

    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands.send(command(tx)).map_err(|_| Error::ShutDown)?;
        rx.await.map_err(|_| Error::ShutDown)
    }
}

/// State owned by the control task.
struct Controller<R: Radio> {
    radio: Arc<R>,
    address: String,
    config: OrchestratorConfig,
    /// Created on the first successful lookup, reused afterwards.
    session: Option<ConnectionSession<R>>,
    /// Attempt guard.
    connecting: bool,
    attempt: Option<Attempt>,
    schedule: MaintenanceSchedule,
    maintenance_failures: u32,
    was_available: bool,
    enabled: bool,
    /// Next link loss is ours and must not be reported.
    expected_disconnect: bool,
    shutting_down: bool,
    commands_closed: bool,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
    advertisements: Option<CallbackHandle>,
    publisher: Publisher,
    events: mpsc::UnboundedSender<Event<R>>,
    link_events: mpsc::UnboundedSender<LinkEvent>,
    sightings: mpsc::UnboundedSender<R::Peripheral>,
}

impl<R: Radio> Controller<R> {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut events: mpsc::UnboundedReceiver<Event<R>>,
        mut link_events: mpsc::UnboundedReceiver<LinkEvent>,
        mut sightings: mpsc::UnboundedReceiver<R::Peripheral>,
    ) {
        self.arm_advertisements().await;
        if self.config.connect_on_start {
            self.try_connect(Trigger::Startup, None, None);
        }

        let mut fallback = interval_at(
            Instant::now() + self.config.fallback_interval,
            self.config.fallback_interval,
        );
        fallback.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut maintenance = interval_at(
            Instant::now() + self.config.maintenance_interval,
            self.config.maintenance_interval,
        );
        maintenance.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            // Completions and link events first so commands see settled state.
            let flow = tokio::select! {
                biased;
                Some(event) = events.recv() => self.handle_event(event).await,
                Some(event) = link_events.recv() => {
                    if let Some(session) = self.session.as_mut() {
                        session.handle_link_event(event);
                    }
                    Flow::Continue
                }
                command = commands.recv(), if !self.commands_closed => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("Orchestrator handle dropped");
                        self.commands_closed = true;
                        self.begin_shutdown(None).await
                    }
                },
                Some(peripheral) = sightings.recv() => {
                    self.on_advertisement(peripheral);
                    Flow::Continue
                }
                _ = fallback.tick(), if !self.shutting_down => {
                    self.on_fallback_timer();
                    Flow::Continue
                }
                _ = maintenance.tick(), if !self.shutting_down => {
                    self.on_maintenance_timer(Instant::now());
                    Flow::Continue
                }
            };

            if flow == Flow::Stop {
                break;
            }
        }

        debug!("Orchestrator control task for {} ended", self.address);
    }

    async fn handle_command(&mut self, command: Command) -> Flow {
        match command {
            Command::RequestConnect(reply) => {
                self.try_connect(Trigger::Manual, None, Some(reply));
            }
            Command::SendZeroCalibration(reply) => {
                let operation = match self.session.as_ref() {
                    Some(session) => session.begin_zero_calibration(),
                    None => {
                        warn!("Cannot zero pressure: Pressensor is not connected");
                        Err(Error::NotConnected)
                    }
                };
                match operation {
                    Ok(operation) => {
                        tokio::spawn(async move {
                            let _ = reply.send(operation.await);
                        });
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::SetConnectionEnabled(enabled, reply) => {
                self.set_connection_enabled(enabled).await;
                let _ = reply.send(());
            }
            Command::Diagnostics(reply) => {
                let _ = reply.send(self.diagnostics());
            }
            Command::Shutdown(reply) => return self.begin_shutdown(Some(reply)).await,
        }
        Flow::Continue
    }

    async fn handle_event(&mut self, event: Event<R>) -> Flow {
        match event {
            Event::Located(None) => {
                debug!("Pressensor {} not found by the radio", self.address);
                self.finish_attempt(Err(Error::DeviceNotFound {
                    address: self.address.clone(),
                }));
            }
            Event::Located(Some(peripheral)) => {
                if self.shutting_down {
                    self.finish_attempt(Err(Error::ShutDown));
                } else if !self.enabled {
                    self.finish_attempt(Err(Error::ConnectionDisabled));
                } else {
                    self.start_session_connect(peripheral);
                }
            }
            Event::Connected(outcome) => {
                let result = match self.session.as_mut() {
                    Some(session) => session.finish_connect(outcome),
                    None => Err(Error::Internal("connect finished without a session".to_string())),
                };
                match result {
                    Ok(true) if !self.shutting_down => {
                        self.schedule.record_success(Instant::now());
                        self.maintenance_failures = 0;
                        self.mark_available();
                    }
                    Ok(false) if !self.shutting_down => {
                        self.mark_available();
                        self.battery_not_refreshed();
                    }
                    _ => {}
                }
                self.finish_attempt(result.map(|_| ()));
                if !self.enabled && !self.shutting_down {
                    debug!("Connection disabled while connecting, dropping link");
                    self.start_teardown();
                }
            }
            Event::BatteryRead(outcome) => {
                let result = match self.session.as_mut() {
                    Some(session) => session.finish_read_battery(outcome),
                    None => Ok(false),
                };
                match result {
                    Ok(true) => {
                        self.schedule.record_success(Instant::now());
                        self.maintenance_failures = 0;
                        debug!("Battery maintenance check done");
                    }
                    Ok(false) => debug!("Battery maintenance read returned no level"),
                    Err(e) => {
                        self.maintenance_failures += 1;
                        warn!(
                            "Battery maintenance read for Pressensor {} failed: {}",
                            self.address, e
                        );
                    }
                }
            }
            Event::Disconnected => {
                if let Some(session) = self.session.as_mut() {
                    session.finish_disconnect();
                }
                // Re-enabled while the teardown was running.
                if self.enabled && !self.shutting_down {
                    self.try_connect(Trigger::Reenabled, None, None);
                }
            }
            Event::LinkLost => {
                if self.expected_disconnect {
                    debug!("Expected disconnect from Pressensor {}", self.address);
                } else if self.was_available {
                    info!(
                        "Pressensor {} disconnected, waiting for next advertisement",
                        self.address
                    );
                    self.was_available = false;
                }
            }
        }

        if self.shutting_down {
            return self.try_finish_shutdown().await;
        }
        Flow::Continue
    }

    /// Single guarded entry point for every trigger.
    fn try_connect(
        &mut self,
        trigger: Trigger,
        peripheral: Option<R::Peripheral>,
        reply: Option<oneshot::Sender<Result<()>>>,
    ) {
        if self.shutting_down {
            respond(reply, Err(Error::ShutDown));
            return;
        }
        if !self.enabled {
            trace!("Connection disabled, ignoring {}", trigger);
            respond(reply, Err(Error::ConnectionDisabled));
            return;
        }
        if self.connecting {
            debug!("Connection attempt already in progress, ignoring {}", trigger);
            respond(reply, Ok(()));
            return;
        }
        if let Some(session) = self.session.as_ref() {
            if session.state() != SessionState::Idle {
                trace!("Session is {}, ignoring {}", session.state(), trigger);
                respond(reply, Ok(()));
                return;
            }
        }

        debug!("Connecting to Pressensor {} ({})", self.address, trigger);
        self.connecting = true;
        self.attempt = Some(Attempt { trigger, reply });

        match peripheral {
            Some(peripheral) => self.start_session_connect(peripheral),
            None => self.spawn_locate(),
        }
    }

    fn spawn_locate(&self) {
        let radio = self.radio.clone();
        let address = self.address.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let peripheral = radio.find_peripheral(&address).await;
            let _ = events.send(Event::Located(peripheral));
        });
    }

    fn start_session_connect(&mut self, peripheral: R::Peripheral) {
        let session = match self.session.take() {
            Some(mut session) => {
                session.update_peripheral_handle(peripheral);
                session
            }
            None => self.build_session(peripheral),
        };

        match self.session.insert(session).begin_connect() {
            Ok(operation) => {
                let events = self.events.clone();
                tokio::spawn(async move {
                    let outcome = operation.await;
                    let _ = events.send(Event::Connected(outcome));
                });
            }
            Err(e) => self.finish_attempt(Err(e)),
        }
    }

    fn build_session(&self, peripheral: R::Peripheral) -> ConnectionSession<R> {
        debug!("Creating session for Pressensor {}", peripheral.address());
        let publisher = self.publisher.clone();
        let events = self.events.clone();
        ConnectionSession::new(
            self.radio.clone(),
            peripheral,
            self.config.session.clone(),
            self.link_events.clone(),
        )
        .on_state_change(move |reading| publisher.publish(reading))
        .on_disconnect(move || {
            let _ = events.send(Event::LinkLost);
        })
    }

    fn finish_attempt(&mut self, result: Result<()>) {
        self.connecting = false;
        let Some(attempt) = self.attempt.take() else {
            return;
        };

        if let Err(e) = &result {
            match attempt.trigger {
                Trigger::Maintenance => {
                    self.maintenance_failures += 1;
                    warn!(
                        "Pressensor {} unreachable for battery check ({} in a row), the battery may be depleted: {}",
                        self.address, self.maintenance_failures, e
                    );
                }
                trigger => debug!("Connection attempt from {} failed: {}", trigger, e),
            }
        }

        respond(attempt.reply, result);
    }

    /// A maintenance connect that came up without a battery level does not
    /// count as a check.
    fn battery_not_refreshed(&mut self) {
        let maintenance = self
            .attempt
            .as_ref()
            .is_some_and(|attempt| attempt.trigger == Trigger::Maintenance);
        if maintenance {
            self.maintenance_failures += 1;
            warn!(
                "Connected to Pressensor {} for a battery check but could not read the level ({} in a row)",
                self.address, self.maintenance_failures
            );
        } else {
            debug!("Connected without a battery reading, maintenance check still due");
        }
    }

    fn mark_available(&mut self) {
        if !self.was_available {
            info!("Pressensor {} is available", self.address);
            self.was_available = true;
        }
    }

    fn on_advertisement(&mut self, peripheral: R::Peripheral) {
        trace!("Advertisement from {}", peripheral.address());
        if let Some(session) = self.session.as_mut() {
            session.update_peripheral_handle(peripheral.clone());
        }
        self.try_connect(Trigger::Advertisement, Some(peripheral), None);
    }

    fn on_fallback_timer(&mut self) {
        self.try_connect(Trigger::Fallback, None, None);
    }

    fn on_maintenance_timer(&mut self, now: Instant) {
        if !self.enabled {
            return;
        }
        if !self.schedule.is_due(now) {
            debug!("Battery checked within the maintenance interval, skipping");
            return;
        }

        if let Some(session) = self.session.as_ref().filter(|s| s.is_connected()) {
            if let Some(operation) = session.begin_read_battery() {
                let events = self.events.clone();
                tokio::spawn(async move {
                    let outcome = operation.await;
                    let _ = events.send(Event::BatteryRead(outcome));
                });
            }
            return;
        }

        self.try_connect(Trigger::Maintenance, None, None);
    }

    async fn set_connection_enabled(&mut self, enabled: bool) {
        if self.enabled == enabled || self.shutting_down {
            return;
        }
        self.enabled = enabled;

        if enabled {
            info!("Connection to Pressensor {} enabled", self.address);
            self.expected_disconnect = false;
            self.arm_advertisements().await;
            self.try_connect(Trigger::Reenabled, None, None);
        } else {
            info!("Connection to Pressensor {} disabled", self.address);
            self.expected_disconnect = true;
            self.advertisements = None;
            self.start_teardown();
        }
    }

    async fn arm_advertisements(&mut self) {
        match self
            .radio
            .watch_advertisements(&self.address, self.sightings.clone())
            .await
        {
            Ok(handle) => self.advertisements = Some(handle),
            Err(e) => warn!(
                "Could not watch advertisements for Pressensor {}, relying on the fallback timer: {}",
                self.address, e
            ),
        }
    }

    fn start_teardown(&mut self) {
        let Some(session) = self.session.as_mut().filter(|s| s.is_connected()) else {
            return;
        };
        let operation = session.begin_disconnect();
        let events = self.events.clone();
        tokio::spawn(async move {
            operation.await;
            let _ = events.send(Event::Disconnected);
        });
    }

    async fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<()>>) -> Flow {
        if let Some(reply) = reply {
            self.shutdown_waiters.push(reply);
        }
        if !self.shutting_down {
            info!("Shutting down orchestrator for Pressensor {}", self.address);
            self.shutting_down = true;
            self.expected_disconnect = true;
            self.advertisements = None;
        }
        self.try_finish_shutdown().await
    }

    async fn try_finish_shutdown(&mut self) -> Flow {
        if self.connecting {
            debug!("Waiting for the connection attempt in flight before shutting down");
            return Flow::Continue;
        }
        if self.session.as_ref().map(|s| s.state()) == Some(SessionState::Closing) {
            return Flow::Continue;
        }

        if let Some(mut session) = self.session.take() {
            session.disconnect().await;
        }

        for waiter in self.shutdown_waiters.drain(..) {
            let _ = waiter.send(());
        }
        Flow::Stop
    }

    fn diagnostics(&self) -> Diagnostics {
        Diagnostics {
            address: Diagnostics::redacted_address(),
            reading: self.publisher.current(),
            session_state: self.session.as_ref().map(|s| s.state()),
            connecting: self.connecting,
            was_available: self.was_available,
            connection_enabled: self.enabled,
            last_battery_check: self.schedule.last_success_wall,
            maintenance_failures: self.maintenance_failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, FakePeripheral, FakeRadio, ADDRESS};
    use pretty_assertions::assert_eq;
    use tokio_test::{assert_err, assert_ok};

    fn quiet_config() -> OrchestratorConfig {
        OrchestratorConfig::default().with_connect_on_start(false)
    }

    fn pressure(raw: i16) -> Vec<u8> {
        raw.to_be_bytes().to_vec()
    }

    async fn wait_for_watch(radio: &Arc<FakeRadio>) {
        let observed = radio.clone();
        wait_until(move || observed.is_watching()).await;
    }

    #[test]
    fn test_maintenance_schedule() {
        let start = Instant::now();
        let mut schedule = MaintenanceSchedule::new(Duration::from_secs(60));
        assert!(schedule.is_due(start));

        schedule.record_success(start);
        assert!(!schedule.is_due(start + Duration::from_secs(59)));
        assert!(schedule.is_due(start + Duration::from_secs(60)));
        assert!(schedule.last_success_wall.is_some());
    }

    #[tokio::test]
    async fn test_request_connect() {
        let radio = Arc::new(FakeRadio::new());
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());

        assert_ok!(orchestrator.request_connect().await);

        let reading = orchestrator.current_reading();
        assert!(reading.connected);
        assert_eq!(reading.battery_percent(), Some(85));
        assert_eq!(radio.connect_calls.load(Ordering::SeqCst), 1);

        let diagnostics = orchestrator.diagnostics().await.unwrap();
        assert!(diagnostics.was_available);
        assert!(diagnostics.last_battery_check.is_some());
        assert_eq!(diagnostics.session_state, Some(SessionState::Live));
        assert_eq!(diagnostics.address, "**REDACTED**");

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_connect_when_connected_skips_radio() {
        let radio = Arc::new(FakeRadio::new());
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());
        orchestrator.request_connect().await.unwrap();
        let finds = radio.find_calls.load(Ordering::SeqCst);

        assert_ok!(orchestrator.request_connect().await);

        assert_eq!(radio.find_calls.load(Ordering::SeqCst), finds);
        assert_eq!(radio.connect_calls.load(Ordering::SeqCst), 1);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_connect_device_not_found() {
        let radio = Arc::new(FakeRadio::absent());
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());

        let err = assert_err!(orchestrator.request_connect().await);
        assert!(matches!(err, Error::DeviceNotFound { .. }));

        let diagnostics = orchestrator.diagnostics().await.unwrap();
        assert_eq!(diagnostics.session_state, None);
        assert!(!diagnostics.connecting);
        assert_eq!(radio.connect_calls.load(Ordering::SeqCst), 0);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_request_connect_failure() {
        let radio = Arc::new(FakeRadio::new());
        radio.fail_connect.store(true, Ordering::SeqCst);
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());

        let err = assert_err!(orchestrator.request_connect().await);
        assert!(matches!(err, Error::ConnectionFailed { .. }));
        assert!(!orchestrator.current_reading().connected);

        // The guard is released and the next attempt goes through.
        radio.fail_connect.store(false, Ordering::SeqCst);
        assert_ok!(orchestrator.request_connect().await);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_simultaneous_advertisements_connect_once() {
        let radio = Arc::new(FakeRadio::new());
        radio.hold_connects();
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());
        wait_for_watch(&radio).await;

        assert!(radio.advertise(FakePeripheral::new("hci0")));
        assert!(radio.advertise(FakePeripheral::new("hci1")));
        let observed = radio.clone();
        wait_until(move || observed.connect_calls.load(Ordering::SeqCst) == 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(radio.connect_calls.load(Ordering::SeqCst), 1);

        let mut updates = orchestrator.subscribe_updates();
        radio.release_connects(1);
        let reading = updates.recv().await.unwrap();
        assert!(reading.connected);
        assert_eq!(radio.connect_calls.load(Ordering::SeqCst), 1);

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_advertisement_refreshes_handle() {
        let radio = Arc::new(FakeRadio::new());
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());
        wait_for_watch(&radio).await;
        orchestrator.request_connect().await.unwrap();

        radio.drop_link();
        let observed = orchestrator.publisher.clone();
        wait_until(move || !observed.current().connected).await;

        radio.advertise(FakePeripheral::new("hci1"));
        let observed = radio.clone();
        wait_until(move || observed.connect_calls.load(Ordering::SeqCst) == 2).await;
        assert_eq!(radio.connected_with.lock()[1].adapter, "hci1");

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_updates_reach_subscribers() {
        let radio = Arc::new(FakeRadio::new());
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _handle = orchestrator.subscribe_to_updates(move |reading| sink.lock().push(*reading));

        orchestrator.request_connect().await.unwrap();
        radio.notify(&pressure(1016));

        let observed = seen.clone();
        wait_until(move || observed.lock().iter().any(|r| r.pressure_mbar == 1020)).await;
        assert_eq!(orchestrator.current_reading().pressure_mbar, 1020);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_calibration() {
        let radio = Arc::new(FakeRadio::new());
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());

        let err = assert_err!(orchestrator.send_zero_calibration().await);
        assert!(err.is_not_connected());

        orchestrator.request_connect().await.unwrap();
        assert_ok!(orchestrator.send_zero_calibration().await);
        assert_eq!(radio.device.writes.lock()[0].1, vec![0x00]);
        assert!(radio.device.writes.lock()[0].2);

        radio.device.fail_write.store(true, Ordering::SeqCst);
        let err = assert_err!(orchestrator.send_zero_calibration().await);
        assert!(err.is_command_failure());

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_during_connect() {
        let radio = Arc::new(FakeRadio::new());
        radio.hold_connects();
        let orchestrator = Arc::new(Orchestrator::start(radio.clone(), ADDRESS, OrchestratorConfig::default()));
        let observed = radio.clone();
        wait_until(move || observed.connect_calls.load(Ordering::SeqCst) == 1).await;

        let shutdown = {
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move { orchestrator.shutdown().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!shutdown.is_finished());

        radio.release_connects(1);
        shutdown.await.unwrap().unwrap();

        assert!(!orchestrator.current_reading().connected);
        assert_eq!(radio.device.disconnects.load(Ordering::SeqCst), 1);
        assert!(!radio.is_watching());
        assert_eq!(radio.connect_calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            orchestrator.request_connect().await,
            Err(Error::ShutDown)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let radio = Arc::new(FakeRadio::new());
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());
        orchestrator.request_connect().await.unwrap();

        orchestrator.shutdown().await.unwrap();
        orchestrator.shutdown().await.unwrap();
        assert!(!orchestrator.current_reading().connected);
        assert_eq!(radio.device.disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_connection_toggle() {
        let radio = Arc::new(FakeRadio::new());
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());
        orchestrator.request_connect().await.unwrap();

        orchestrator.set_connection_enabled(false).await.unwrap();
        let observed = orchestrator.publisher.clone();
        wait_until(move || !observed.current().connected).await;
        assert!(!radio.is_watching());
        assert!(matches!(
            orchestrator.request_connect().await,
            Err(Error::ConnectionDisabled)
        ));
        // Expected disconnect: availability is not flipped.
        assert!(orchestrator.diagnostics().await.unwrap().was_available);

        orchestrator.set_connection_enabled(true).await.unwrap();
        assert!(radio.is_watching());
        let observed = orchestrator.publisher.clone();
        wait_until(move || observed.current().connected).await;
        assert_eq!(radio.connect_calls.load(Ordering::SeqCst), 2);
        assert_eq!(radio.watch_calls.load(Ordering::SeqCst), 2);

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_reenable_during_teardown_reconnects() {
        let radio = Arc::new(FakeRadio::new());
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());
        orchestrator.request_connect().await.unwrap();

        radio.hold_disconnects();
        orchestrator.set_connection_enabled(false).await.unwrap();
        orchestrator.set_connection_enabled(true).await.unwrap();
        let diagnostics = orchestrator.diagnostics().await.unwrap();
        assert_eq!(diagnostics.session_state, Some(SessionState::Closing));
        assert_eq!(radio.connect_calls.load(Ordering::SeqCst), 1);

        radio.release_disconnect();
        let observed = radio.clone();
        wait_until(move || observed.connect_calls.load(Ordering::SeqCst) == 2).await;
        let observed = orchestrator.publisher.clone();
        wait_until(move || observed.current().connected).await;
        assert_eq!(radio.device.disconnects.load(Ordering::SeqCst), 1);

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_intervals_keep_orchestrator_running() {
        let radio = Arc::new(FakeRadio::new());
        let config = quiet_config()
            .with_fallback_interval(Duration::ZERO)
            .with_maintenance_interval(Duration::ZERO);
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, config);

        assert_ok!(orchestrator.request_connect().await);
        assert!(orchestrator.current_reading().connected);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_unexpected_disconnect_clears_availability() {
        let radio = Arc::new(FakeRadio::new());
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());
        orchestrator.request_connect().await.unwrap();

        radio.drop_link();
        let observed = orchestrator.publisher.clone();
        wait_until(move || !observed.current().connected).await;

        let diagnostics = orchestrator.diagnostics().await.unwrap();
        assert!(!diagnostics.was_available);
        assert_eq!(diagnostics.session_state, Some(SessionState::Idle));
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_fallback_timer_connects() {
        let radio = Arc::new(FakeRadio::new());
        let config = quiet_config().with_fallback_interval(Duration::from_millis(30));
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, config);

        let observed = orchestrator.publisher.clone();
        wait_until(move || observed.current().connected).await;
        assert_eq!(radio.connect_calls.load(Ordering::SeqCst), 1);

        // Further ticks while connected are no-ops.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(radio.connect_calls.load(Ordering::SeqCst), 1);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_maintenance_reads_battery_when_connected() {
        let radio = Arc::new(FakeRadio::new());
        let config = quiet_config().with_maintenance_interval(Duration::from_millis(50));
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, config);
        orchestrator.request_connect().await.unwrap();
        radio.set_battery(40);

        let observed = orchestrator.publisher.clone();
        wait_until(move || observed.current().battery_percent() == Some(40)).await;
        assert_eq!(radio.connect_calls.load(Ordering::SeqCst), 1);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_maintenance_skipped_after_recent_connect() {
        let radio = Arc::new(FakeRadio::new());
        let config = quiet_config().with_maintenance_interval(Duration::from_millis(150));
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, config);

        // Connect just before the first tick so the check is not yet due.
        tokio::time::sleep(Duration::from_millis(100)).await;
        orchestrator.request_connect().await.unwrap();
        let reads = radio.device.battery_reads.load(Ordering::SeqCst);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(radio.device.battery_reads.load(Ordering::SeqCst), reads);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_maintenance_connects_when_offline() {
        let radio = Arc::new(FakeRadio::new());
        let config = quiet_config().with_maintenance_interval(Duration::from_millis(30));
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, config);

        let observed = orchestrator.publisher.clone();
        wait_until(move || observed.current().battery_is_live()).await;
        assert_eq!(radio.connect_calls.load(Ordering::SeqCst), 1);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_without_battery_read_keeps_maintenance_due() {
        let radio = Arc::new(FakeRadio::new());
        radio.device.fail_read.store(true, Ordering::SeqCst);
        let config = quiet_config().with_maintenance_interval(Duration::from_millis(50));
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, config);

        assert_ok!(orchestrator.request_connect().await);
        let diagnostics = orchestrator.diagnostics().await.unwrap();
        assert_eq!(diagnostics.last_battery_check, None);
        assert!(!orchestrator.current_reading().battery_is_live());

        // The next tick must retry the read instead of trusting the connect.
        radio.device.fail_read.store(false, Ordering::SeqCst);
        let observed = orchestrator.publisher.clone();
        wait_until(move || observed.current().battery_is_live()).await;
        assert!(radio.device.battery_reads.load(Ordering::SeqCst) >= 2);
        assert!(orchestrator
            .diagnostics()
            .await
            .unwrap()
            .last_battery_check
            .is_some());

        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_maintenance_failure_is_not_fatal() {
        let radio = Arc::new(FakeRadio::absent());
        let config = quiet_config().with_maintenance_interval(Duration::from_millis(20));
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, config);

        let observed = radio.clone();
        wait_until(move || observed.find_calls.load(Ordering::SeqCst) >= 2).await;
        let diagnostics = orchestrator.diagnostics().await.unwrap();
        assert!(diagnostics.maintenance_failures >= 1);
        assert!(diagnostics.battery_maybe_depleted());
        assert_eq!(diagnostics.last_battery_check, None);

        // Still operable once the device shows up.
        radio.set_present(Some(FakePeripheral::new("hci0")));
        assert_ok!(orchestrator.request_connect().await);
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_battery_seed_is_stale_until_read() {
        let radio = Arc::new(FakeRadio::new());
        let orchestrator = Orchestrator::start(
            radio.clone(),
            ADDRESS,
            quiet_config().with_battery_seed(70),
        );

        let reading = orchestrator.current_reading();
        assert_eq!(reading.battery_percent(), Some(70));
        assert!(!reading.battery_is_live());

        orchestrator.request_connect().await.unwrap();
        let reading = orchestrator.current_reading();
        assert_eq!(reading.battery_percent(), Some(85));
        assert!(reading.battery_is_live());
        orchestrator.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropping_handle_shuts_down() {
        let radio = Arc::new(FakeRadio::new());
        let orchestrator = Orchestrator::start(radio.clone(), ADDRESS, quiet_config());
        orchestrator.request_connect().await.unwrap();

        drop(orchestrator);

        let observed = radio.clone();
        wait_until(move || observed.device.disconnects.load(Ordering::SeqCst) == 1).await;
        assert!(!radio.is_watching());
    }
}
