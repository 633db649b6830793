//! Connection session for a single Pressensor.
//!
//! A [`ConnectionSession`] owns at most one live link, the subscription on
//! the telemetry characteristic and the current [`Reading`]. It is driven
//! from a single control context: radio work is handed out as futures via
//! the `begin_*` methods and its results are fed back through the matching
//! `finish_*` methods, so state is only ever touched between awaits.
//! The plain async methods (`connect`, `disconnect`, ...) combine both
//! halves for callers that own the session directly.

use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::ble::radio::{Link, LinkEvent, LinkEventKind, LinkEventSink, PeripheralHandle, Radio};
use crate::config::{Characteristics, SessionConfig};
use crate::data::{BatteryLevel, Reading};
use crate::error::{Error, Result};
use crate::protocol::{decode_battery, encode_zero_command, TelemetryDecoder};

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle that runs `unregister_fn` once, either on
    /// [`unregister`](Self::unregister) or when dropped.
    pub fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

impl std::fmt::Debug for CallbackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackHandle")
            .field("id", &self.id)
            .field("registered", &self.unregister_fn.is_some())
            .finish()
    }
}

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// No link.
    #[default]
    Idle,
    /// Handshake in progress.
    Connecting,
    /// Link up and telemetry subscribed.
    Live,
    /// Teardown in progress.
    Closing,
}

impl SessionState {
    /// Check if the link is live.
    pub fn is_live(&self) -> bool {
        matches!(self, SessionState::Live)
    }

    /// Check if the session is between states.
    pub fn is_transitioning(&self) -> bool {
        matches!(self, SessionState::Connecting | SessionState::Closing)
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Idle => write!(f, "Idle"),
            SessionState::Connecting => write!(f, "Connecting"),
            SessionState::Live => write!(f, "Live"),
            SessionState::Closing => write!(f, "Closing"),
        }
    }
}

/// Notifications kept while the handshake is still running.
const MAX_BACKLOG: usize = 64;

/// Link that finished the handshake.
pub struct EstablishedLink<L> {
    link: Arc<L>,
    battery: Option<Vec<u8>>,
}

/// Result of a connection attempt started by [`ConnectionSession::begin_connect`].
pub struct ConnectOutcome<L> {
    generation: u64,
    result: Result<EstablishedLink<L>>,
}

impl<L> ConnectOutcome<L> {
    /// Get the connection attempt this outcome belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check if the handshake completed.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

impl<L> std::fmt::Debug for ConnectOutcome<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectOutcome")
            .field("generation", &self.generation)
            .field("success", &self.result.is_ok())
            .finish()
    }
}

/// Result of a battery read started by [`ConnectionSession::begin_read_battery`].
#[derive(Debug)]
pub struct BatteryOutcome {
    generation: u64,
    result: Result<Vec<u8>>,
}

impl BatteryOutcome {
    /// Get the connection attempt the read ran on.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Pending connection handshake.
pub type ConnectOperation<L> = BoxFuture<'static, ConnectOutcome<L>>;
/// Pending battery read.
pub type BatteryOperation = BoxFuture<'static, BatteryOutcome>;
/// Pending zero calibration write.
pub type CommandOperation = BoxFuture<'static, Result<()>>;
/// Pending teardown.
pub type DisconnectOperation = BoxFuture<'static, ()>;

type StateCallback = Box<dyn Fn(&Reading) + Send + Sync>;
type DisconnectCallback = Box<dyn Fn() + Send + Sync>;

/// A connection to one Pressensor.
pub struct ConnectionSession<R: Radio> {
    /// Radio used to establish links.
    radio: Arc<R>,
    /// Most recent handle for the device.
    peripheral: R::Peripheral,
    /// Session settings.
    config: SessionConfig,
    /// Current lifecycle state.
    state: SessionState,
    /// Incremented on every connection attempt; events from older links are dropped.
    generation: u64,
    /// The live link, if any.
    link: Option<Arc<R::Link>>,
    /// Latest snapshot.
    reading: Reading,
    /// Rounding and dead-band state.
    decoder: TelemetryDecoder,
    /// Notifications received during the handshake.
    backlog: VecDeque<Bytes>,
    /// The link dropped before the handshake finished.
    lost_while_connecting: bool,
    /// Channel the radio reports link events on.
    link_events: mpsc::UnboundedSender<LinkEvent>,
    /// Called with every new snapshot.
    on_state_change: Option<StateCallback>,
    /// Called when a live link drops without being asked to.
    on_disconnect: Option<DisconnectCallback>,
}

impl<R: Radio> ConnectionSession<R> {
    /// Create an idle session.
    ///
    /// # Arguments
    ///
    /// * `radio` - Radio used to establish links
    /// * `peripheral` - Handle for the device
    /// * `config` - Session settings
    /// * `link_events` - Channel the radio reports notifications and link loss on;
    ///   the owner drains it into [`handle_link_event`](Self::handle_link_event)
    pub fn new(
        radio: Arc<R>,
        peripheral: R::Peripheral,
        config: SessionConfig,
        link_events: mpsc::UnboundedSender<LinkEvent>,
    ) -> Self {
        let reading = Reading::seeded(config.battery_seed);
        let decoder = TelemetryDecoder::new(config.dead_band_mbar);
        Self {
            radio,
            peripheral,
            config,
            state: SessionState::Idle,
            generation: 0,
            link: None,
            reading,
            decoder,
            backlog: VecDeque::new(),
            lost_while_connecting: false,
            link_events,
            on_state_change: None,
            on_disconnect: None,
        }
    }

    /// Register the state-change notifier.
    pub fn on_state_change<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Reading) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(callback));
        self
    }

    /// Register the notifier for links that drop on their own.
    pub fn on_disconnect<F>(mut self, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Box::new(callback));
        self
    }

    /// Get the current snapshot.
    pub fn reading(&self) -> Reading {
        self.reading
    }

    /// Get the lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Check if the link is live.
    pub fn is_connected(&self) -> bool {
        self.state.is_live()
    }

    /// Get the current peripheral handle.
    pub fn peripheral(&self) -> &R::Peripheral {
        &self.peripheral
    }

    /// Get the current connection attempt number.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Replace the peripheral handle with a fresher one.
    ///
    /// Takes effect on the next connect; a live link is left alone.
    pub fn update_peripheral_handle(&mut self, peripheral: R::Peripheral) {
        trace!("Updating peripheral handle for {}", peripheral.address());
        self.peripheral = peripheral;
    }

    /// Connect and subscribe to telemetry.
    ///
    /// Returns `Ok` right away if the link is already live.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] if the link or the subscription
    /// could not be established. The session is idle and disconnected
    /// afterwards, and a state change has been published.
    pub async fn connect(&mut self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        let operation = self.begin_connect()?;
        let outcome = operation.await;
        self.finish_connect(outcome).map(|_| ())
    }

    /// Start a connection attempt.
    ///
    /// The returned future performs all radio I/O and must be passed back
    /// to [`finish_connect`](Self::finish_connect).
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionFailed`] if the session is not idle.
    pub fn begin_connect(&mut self) -> Result<ConnectOperation<R::Link>> {
        if self.state != SessionState::Idle {
            return Err(Error::ConnectionFailed {
                reason: format!("session is {}", self.state),
            });
        }

        self.generation += 1;
        self.state = SessionState::Connecting;
        self.lost_while_connecting = false;
        self.backlog.clear();

        let generation = self.generation;
        let sink = LinkEventSink::new(generation, self.link_events.clone());
        let radio = self.radio.clone();
        let peripheral = self.peripheral.clone();
        let characteristics = self.config.characteristics;
        let timeout = self.config.operation_timeout;

        debug!(
            "Connecting to Pressensor {} (attempt {})",
            peripheral.address(),
            generation
        );

        Ok(async move {
            let result = establish(
                radio.as_ref(),
                &peripheral,
                sink,
                characteristics,
                timeout,
            )
            .await;
            ConnectOutcome { generation, result }
        }
        .boxed())
    }

    /// Apply the result of a connection attempt.
    ///
    /// On success the session goes live, notifications buffered during the
    /// handshake are decoded and one state change is published. The returned
    /// flag tells whether the handshake also read a battery level.
    pub fn finish_connect(&mut self, outcome: ConnectOutcome<R::Link>) -> Result<bool> {
        if outcome.generation != self.generation || self.state != SessionState::Connecting {
            debug!(
                "Discarding outcome of superseded connection attempt {}",
                outcome.generation
            );
            if let Ok(established) = outcome.result {
                tokio::spawn(teardown(
                    established.link,
                    self.config.characteristics.telemetry,
                    self.config.operation_timeout,
                ));
            }
            return Err(Error::ConnectionFailed {
                reason: "connection attempt superseded".to_string(),
            });
        }

        let backlog = std::mem::take(&mut self.backlog);

        match outcome.result {
            Ok(established) if !self.lost_while_connecting => {
                self.link = Some(established.link);
                self.state = SessionState::Live;

                let mut next = self.reading;
                let battery = established.battery.as_deref().and_then(decode_battery);
                if let Some(percent) = battery {
                    next = next.with_live_battery(percent);
                }
                for data in backlog {
                    let update = self.decoder.decode(&data, &next);
                    next = next.apply(&update);
                }
                self.reading = next.with_connected(true);

                info!(
                    "Connected to Pressensor {}, battery: {:?}%",
                    self.peripheral.address(),
                    self.reading.battery_percent()
                );
                self.publish();
                Ok(battery.is_some())
            }
            Ok(_) => {
                debug!(
                    "Pressensor {} dropped the link during the handshake",
                    self.peripheral.address()
                );
                self.enter_idle();
                Err(Error::ConnectionFailed {
                    reason: "link dropped during handshake".to_string(),
                })
            }
            Err(e) => {
                debug!(
                    "Failed to connect to Pressensor {}: {}",
                    self.peripheral.address(),
                    e
                );
                self.enter_idle();
                Err(e)
            }
        }
    }

    /// Disconnect from the device.
    ///
    /// Always ends with `connected == false` and a published state change,
    /// even if there was no link or a teardown step failed.
    pub async fn disconnect(&mut self) {
        let operation = self.begin_disconnect();
        operation.await;
        self.finish_disconnect();
    }

    /// Start a teardown. Pass control back to
    /// [`finish_disconnect`](Self::finish_disconnect) once the future completes.
    pub fn begin_disconnect(&mut self) -> DisconnectOperation {
        let link = self.link.take();
        self.state = SessionState::Closing;
        let telemetry = self.config.characteristics.telemetry;
        let timeout = self.config.operation_timeout;

        async move {
            if let Some(link) = link {
                teardown(link, telemetry, timeout).await;
            }
        }
        .boxed()
    }

    /// Finish a teardown started with [`begin_disconnect`](Self::begin_disconnect).
    pub fn finish_disconnect(&mut self) {
        debug!("Disconnected from Pressensor {}", self.peripheral.address());
        self.enter_idle();
    }

    /// Read the battery level from the device.
    ///
    /// Does nothing (apart from a warning) if the device is not connected.
    pub async fn read_battery(&mut self) -> Result<()> {
        let Some(operation) = self.begin_read_battery() else {
            return Ok(());
        };
        let outcome = operation.await;
        self.finish_read_battery(outcome).map(|_| ())
    }

    /// Start a battery read. Returns `None` if the device is not connected.
    pub fn begin_read_battery(&self) -> Option<BatteryOperation> {
        let Some(link) = self.live_link() else {
            warn!("Cannot read battery: Pressensor is not connected");
            return None;
        };
        let generation = self.generation;
        let characteristic = self.config.characteristics.battery;
        let timeout = self.config.operation_timeout;

        Some(
            async move {
                let result = with_timeout(timeout, "battery read", link.read(characteristic)).await;
                BatteryOutcome { generation, result }
            }
            .boxed(),
        )
    }

    /// Apply a battery read. Publishes a state change if the level changed.
    ///
    /// Returns `Ok(true)` if a level was decoded for the current link, and
    /// `Ok(false)` for an empty payload or a read from a previous link.
    ///
    /// # Errors
    ///
    /// Returns [`Error::CommandFailed`] or [`Error::Timeout`] if the read failed.
    pub fn finish_read_battery(&mut self, outcome: BatteryOutcome) -> Result<bool> {
        let data = outcome.result.map_err(into_command_failure)?;

        if outcome.generation != self.generation || !self.state.is_live() {
            debug!("Ignoring battery read from a previous link");
            return Ok(false);
        }

        match decode_battery(&data) {
            Some(percent) => {
                let level = BatteryLevel {
                    percent,
                    live: true,
                };
                if self.reading.battery != Some(level) {
                    debug!("Battery level: {}%", percent);
                    self.reading = self.reading.with_live_battery(percent);
                    self.publish();
                }
                Ok(true)
            }
            None => {
                debug!("Battery read returned no data");
                Ok(false)
            }
        }
    }

    /// Zero the pressure sensor at the current ambient pressure.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] if there is no live link, or
    /// [`Error::CommandFailed`] / [`Error::Timeout`] if the write was not
    /// acknowledged.
    pub async fn send_zero_calibration(&self) -> Result<()> {
        self.begin_zero_calibration()?.await
    }

    /// Start a zero calibration write.
    pub fn begin_zero_calibration(&self) -> Result<CommandOperation> {
        let Some(link) = self.live_link() else {
            warn!("Cannot zero pressure: Pressensor is not connected");
            return Err(Error::NotConnected);
        };
        let characteristic = self.config.characteristics.calibration;
        let timeout = self.config.operation_timeout;

        Ok(async move {
            let command = encode_zero_command();
            match with_timeout(
                timeout,
                "zero calibration",
                link.write(characteristic, &command, true),
            )
            .await
            {
                Ok(()) => {
                    info!("Zero pressure command sent");
                    Ok(())
                }
                Err(e) => {
                    warn!("Failed to send zero pressure command: {}", e);
                    Err(into_command_failure(e))
                }
            }
        }
        .boxed())
    }

    /// Process an event reported by the radio.
    ///
    /// Events from links of earlier connection attempts are dropped.
    pub fn handle_link_event(&mut self, event: LinkEvent) {
        if event.generation != self.generation {
            trace!("Dropping event from stale link {}", event.generation);
            return;
        }

        match event.kind {
            LinkEventKind::Notification {
                characteristic,
                data,
            } => {
                if characteristic != self.config.characteristics.telemetry {
                    trace!("Ignoring notification from {}", characteristic);
                    return;
                }
                match self.state {
                    SessionState::Connecting => {
                        if self.backlog.len() == MAX_BACKLOG {
                            self.backlog.pop_front();
                        }
                        self.backlog.push_back(data);
                    }
                    SessionState::Live => self.process_notification(&data),
                    SessionState::Idle | SessionState::Closing => {
                        trace!("Ignoring notification while {}", self.state)
                    }
                }
            }
            LinkEventKind::Disconnected => match self.state {
                SessionState::Connecting => self.lost_while_connecting = true,
                SessionState::Live => {
                    debug!("Pressensor {} disconnected", self.peripheral.address());
                    self.link = None;
                    self.enter_idle();
                    if let Some(callback) = &self.on_disconnect {
                        callback();
                    }
                }
                SessionState::Idle | SessionState::Closing => {}
            },
        }
    }

    fn process_notification(&mut self, data: &[u8]) {
        let update = self.decoder.decode(data, &self.reading);
        if update.is_empty() {
            return;
        }
        self.reading = self.reading.apply(&update);
        self.publish();
    }

    fn enter_idle(&mut self) {
        self.state = SessionState::Idle;
        self.reading = self.reading.with_connected(false);
        self.publish();
    }

    fn live_link(&self) -> Option<Arc<R::Link>> {
        if self.state.is_live() {
            self.link.clone()
        } else {
            None
        }
    }

    fn publish(&self) {
        if let Some(callback) = &self.on_state_change {
            callback(&self.reading);
        }
    }
}

/// Connect, subscribe to telemetry, then read the battery once.
async fn establish<R: Radio>(
    radio: &R,
    peripheral: &R::Peripheral,
    sink: LinkEventSink,
    characteristics: Characteristics,
    timeout: Duration,
) -> Result<EstablishedLink<R::Link>> {
    let link = with_timeout(timeout, "connect", radio.connect_with_retry(peripheral, sink))
        .await
        .map_err(into_connection_failure)?;
    let link = Arc::new(link);

    if let Err(e) = with_timeout(timeout, "subscribe", link.subscribe(characteristics.telemetry)).await {
        if let Err(err) = link.disconnect().await {
            debug!("Error dropping link after failed subscribe: {}", err);
        }
        return Err(Error::ConnectionFailed {
            reason: format!("telemetry subscription failed: {}", e),
        });
    }

    let battery = match with_timeout(timeout, "battery read", link.read(characteristics.battery)).await {
        Ok(data) => Some(data),
        Err(e) => {
            warn!("Initial battery read failed: {}", e);
            None
        }
    };

    Ok(EstablishedLink { link, battery })
}

/// Unsubscribe and disconnect, logging but otherwise ignoring failures.
async fn teardown<L: Link>(link: Arc<L>, telemetry: Uuid, timeout: Duration) {
    if let Err(e) = with_timeout(timeout, "unsubscribe", link.unsubscribe(telemetry)).await {
        debug!("Error stopping notifications during disconnect: {}", e);
    }
    if let Err(e) = with_timeout(timeout, "disconnect", link.disconnect()).await {
        debug!("Error during disconnect: {}", e);
    }
}

async fn with_timeout<T>(
    limit: Duration,
    operation: &str,
    future: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
        }),
    }
}

fn into_connection_failure(err: Error) -> Error {
    match err {
        Error::ConnectionFailed { .. } => err,
        other => Error::connection_failed(other),
    }
}

fn into_command_failure(err: Error) -> Error {
    match err {
        Error::CommandFailed { .. } | Error::Timeout { .. } | Error::NotConnected => err,
        other => Error::command_failed(other),
    }
}
