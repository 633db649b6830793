//! In-memory radio used by unit tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify, Semaphore};
use uuid::Uuid;

use crate::ble::radio::{Link, LinkEventSink, PeripheralHandle, Radio};
use crate::ble::uuids::PRESSURE_CHARACTERISTIC_UUID;
use crate::error::{Error, Result};
use crate::session::CallbackHandle;

pub(crate) const ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakePeripheral {
    pub address: String,
    pub adapter: String,
}

impl FakePeripheral {
    pub fn new(adapter: &str) -> Self {
        Self {
            address: ADDRESS.to_string(),
            adapter: adapter.to_string(),
        }
    }
}

impl PeripheralHandle for FakePeripheral {
    fn address(&self) -> &str {
        &self.address
    }
}

/// Counters and failure switches shared by every link of a [`FakeRadio`].
#[derive(Default)]
pub(crate) struct FakeDevice {
    pub subscribes: AtomicUsize,
    pub unsubscribes: AtomicUsize,
    pub battery_reads: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub writes: Mutex<Vec<(Uuid, Vec<u8>, bool)>>,
    pub fail_subscribe: AtomicBool,
    pub fail_read: AtomicBool,
    pub fail_write: AtomicBool,
    pub battery: AtomicU8,
    hold_disconnects: AtomicBool,
    disconnect_gate: Notify,
}

pub(crate) struct FakeLink {
    device: Arc<FakeDevice>,
    sink: LinkEventSink,
}

#[async_trait]
impl Link for FakeLink {
    async fn subscribe(&self, _characteristic: Uuid) -> Result<()> {
        if self.device.fail_subscribe.load(Ordering::SeqCst) {
            return Err(Error::command_failed("subscribe rejected"));
        }
        self.device.subscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn unsubscribe(&self, _characteristic: Uuid) -> Result<()> {
        self.device.unsubscribes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read(&self, _characteristic: Uuid) -> Result<Vec<u8>> {
        self.device.battery_reads.fetch_add(1, Ordering::SeqCst);
        if self.device.fail_read.load(Ordering::SeqCst) {
            return Err(Error::command_failed("read rejected"));
        }
        Ok(vec![self.device.battery.load(Ordering::SeqCst)])
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()> {
        if self.device.fail_write.load(Ordering::SeqCst) {
            return Err(Error::command_failed("write not acknowledged"));
        }
        self.device
            .writes
            .lock()
            .push((characteristic, data.to_vec(), with_response));
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if self.device.hold_disconnects.load(Ordering::SeqCst) {
            self.device.disconnect_gate.notified().await;
        }
        self.device.disconnects.fetch_add(1, Ordering::SeqCst);
        self.sink.disconnected();
        Ok(())
    }
}

/// Scriptable radio with a single device.
pub(crate) struct FakeRadio {
    pub device: Arc<FakeDevice>,
    present: Mutex<Option<FakePeripheral>>,
    pub find_calls: AtomicUsize,
    pub connect_calls: AtomicUsize,
    pub watch_calls: AtomicUsize,
    pub connected_with: Mutex<Vec<FakePeripheral>>,
    pub fail_connect: AtomicBool,
    hold: AtomicBool,
    gate: Semaphore,
    sinks: Mutex<Vec<LinkEventSink>>,
    sightings: Arc<Mutex<Option<mpsc::UnboundedSender<FakePeripheral>>>>,
    watch_ids: AtomicU64,
}

impl FakeRadio {
    /// Radio that can see the device on `hci0` with a battery at 85%.
    pub fn new() -> Self {
        let device = FakeDevice::default();
        device.battery.store(85, Ordering::SeqCst);
        Self {
            device: Arc::new(device),
            present: Mutex::new(Some(FakePeripheral::new("hci0"))),
            find_calls: AtomicUsize::new(0),
            connect_calls: AtomicUsize::new(0),
            watch_calls: AtomicUsize::new(0),
            connected_with: Mutex::new(Vec::new()),
            fail_connect: AtomicBool::new(false),
            hold: AtomicBool::new(false),
            gate: Semaphore::new(0),
            sinks: Mutex::new(Vec::new()),
            sightings: Arc::new(Mutex::new(None)),
            watch_ids: AtomicU64::new(0),
        }
    }

    /// Radio that cannot see the device.
    pub fn absent() -> Self {
        let radio = Self::new();
        radio.set_present(None);
        radio
    }

    pub fn set_present(&self, peripheral: Option<FakePeripheral>) {
        *self.present.lock() = peripheral;
    }

    pub fn set_battery(&self, percent: u8) {
        self.device.battery.store(percent, Ordering::SeqCst);
    }

    /// Make connects block until [`release_connects`](Self::release_connects).
    pub fn hold_connects(&self) {
        self.hold.store(true, Ordering::SeqCst);
    }

    pub fn release_connects(&self, count: usize) {
        self.gate.add_permits(count);
    }

    /// Make link teardown block until [`release_disconnect`](Self::release_disconnect).
    pub fn hold_disconnects(&self) {
        self.device.hold_disconnects.store(true, Ordering::SeqCst);
    }

    pub fn release_disconnect(&self) {
        self.device.hold_disconnects.store(false, Ordering::SeqCst);
        self.device.disconnect_gate.notify_one();
    }

    pub fn is_watching(&self) -> bool {
        self.sightings.lock().is_some()
    }

    /// Deliver an advertisement. Returns `false` if nobody is watching.
    pub fn advertise(&self, peripheral: FakePeripheral) -> bool {
        match self.sightings.lock().as_ref() {
            Some(tx) => tx.send(peripheral).is_ok(),
            None => false,
        }
    }

    /// Send a telemetry notification on the most recent link.
    pub fn notify(&self, data: &[u8]) -> bool {
        match self.sinks.lock().last() {
            Some(sink) => sink.notification(PRESSURE_CHARACTERISTIC_UUID, data.to_vec()),
            None => false,
        }
    }

    /// Drop the most recent link from the device side.
    pub fn drop_link(&self) -> bool {
        match self.sinks.lock().last() {
            Some(sink) => sink.disconnected(),
            None => false,
        }
    }
}

#[async_trait]
impl Radio for FakeRadio {
    type Peripheral = FakePeripheral;
    type Link = FakeLink;

    async fn find_peripheral(&self, _address: &str) -> Option<FakePeripheral> {
        self.find_calls.fetch_add(1, Ordering::SeqCst);
        self.present.lock().clone()
    }

    async fn connect_with_retry(
        &self,
        peripheral: &FakePeripheral,
        events: LinkEventSink,
    ) -> Result<FakeLink> {
        self.sinks.lock().push(events.clone());
        self.connected_with.lock().push(peripheral.clone());
        self.connect_calls.fetch_add(1, Ordering::SeqCst);

        if self.hold.load(Ordering::SeqCst) {
            self.gate
                .acquire()
                .await
                .map_err(|e| Error::Internal(e.to_string()))?
                .forget();
        }

        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(Error::connection_failed("device did not respond"));
        }
        Ok(FakeLink {
            device: self.device.clone(),
            sink: events,
        })
    }

    async fn watch_advertisements(
        &self,
        _address: &str,
        sightings: mpsc::UnboundedSender<FakePeripheral>,
    ) -> Result<CallbackHandle> {
        self.watch_calls.fetch_add(1, Ordering::SeqCst);
        *self.sightings.lock() = Some(sightings);
        let slot = self.sightings.clone();
        Ok(CallbackHandle::new(
            self.watch_ids.fetch_add(1, Ordering::SeqCst),
            move || {
                slot.lock().take();
            },
        ))
    }
}

/// Radio handing out prepared links, one per connect.
pub(crate) struct StubRadio<L> {
    links: Mutex<VecDeque<L>>,
}

impl<L: Link + 'static> StubRadio<L> {
    pub fn with_links(links: Vec<L>) -> Self {
        Self {
            links: Mutex::new(links.into()),
        }
    }
}

#[async_trait]
impl<L: Link + 'static> Radio for StubRadio<L> {
    type Peripheral = FakePeripheral;
    type Link = L;

    async fn find_peripheral(&self, _address: &str) -> Option<FakePeripheral> {
        Some(FakePeripheral::new("hci0"))
    }

    async fn connect_with_retry(
        &self,
        _peripheral: &FakePeripheral,
        _events: LinkEventSink,
    ) -> Result<L> {
        self.links
            .lock()
            .pop_front()
            .ok_or_else(|| Error::connection_failed("no link available"))
    }

    async fn watch_advertisements(
        &self,
        _address: &str,
        _sightings: mpsc::UnboundedSender<FakePeripheral>,
    ) -> Result<CallbackHandle> {
        Ok(CallbackHandle::new(0, || {}))
    }
}

/// Poll `condition` until it holds, panicking after two seconds.
pub(crate) async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not met within 2s");
}
