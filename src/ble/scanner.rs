//! BLE scanning functionality.
//!
//! Locates a Pressensor by address across every adapter, watches for its
//! advertisements and lists nearby devices.

use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use crate::ble::radio::PeripheralHandle;
use crate::ble::uuids::is_pressensor_advertisement;
use crate::error::{Error, Result};
use crate::session::CallbackHandle;
use crate::utils::same_address;

/// A sighting of a peripheral on a specific adapter.
#[derive(Clone)]
pub struct BtleplugPeripheral {
    /// Address (or platform identifier where the address is hidden).
    address: String,
    /// Advertised local name.
    local_name: Option<String>,
    /// Signal strength in dBm.
    rssi: Option<i16>,
    /// Adapter the peripheral was seen on.
    adapter: Adapter,
    /// The peripheral handle.
    peripheral: Peripheral,
}

impl BtleplugPeripheral {
    fn new(adapter: Adapter, peripheral: Peripheral, properties: Option<&PeripheralProperties>) -> Self {
        Self {
            address: address_of(&peripheral),
            local_name: properties.and_then(|p| p.local_name.clone()),
            rssi: properties.and_then(|p| p.rssi),
            adapter,
            peripheral,
        }
    }

    /// Get the advertised local name.
    pub fn local_name(&self) -> Option<&str> {
        self.local_name.as_deref()
    }

    /// Get the signal strength at the time of the sighting.
    pub fn rssi(&self) -> Option<i16> {
        self.rssi
    }

    /// Get the adapter the peripheral was seen on.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Get the underlying peripheral.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }
}

impl std::fmt::Debug for BtleplugPeripheral {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtleplugPeripheral")
            .field("address", &self.address)
            .field("local_name", &self.local_name)
            .field("rssi", &self.rssi)
            .finish()
    }
}

impl PeripheralHandle for BtleplugPeripheral {
    fn address(&self) -> &str {
        &self.address
    }
}

/// A nearby Pressensor found by [`BleScanner::discover`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredDevice {
    /// Address to pass to the orchestrator.
    pub address: String,
    /// Advertised local name.
    pub name: Option<String>,
    /// Signal strength in dBm.
    pub rssi: Option<i16>,
}

/// BLE scanner spanning every available adapter.
pub struct BleScanner {
    /// Adapters to scan on.
    adapters: Vec<Adapter>,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Advertisement watch ID counter.
    watch_counter: AtomicU64,
}

impl BleScanner {
    /// Create a scanner on every adapter of the system.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BluetoothUnavailable`] if there is no adapter.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;
        if adapters.is_empty() {
            return Err(Error::BluetoothUnavailable);
        }

        for adapter in &adapters {
            info!(
                "Using Bluetooth adapter: {:?}",
                adapter.adapter_info().await.ok()
            );
        }

        Ok(Self::with_adapters(adapters))
    }

    /// Create a scanner with specific adapters.
    pub fn with_adapters(adapters: Vec<Adapter>) -> Self {
        Self {
            adapters,
            is_scanning: Arc::new(RwLock::new(false)),
            watch_counter: AtomicU64::new(0),
        }
    }

    /// Start scanning on every adapter. Does nothing if already scanning.
    ///
    /// # Errors
    ///
    /// Returns an error if no adapter could start scanning.
    pub async fn start_scanning(&self) -> Result<()> {
        if *self.is_scanning.read() {
            return Ok(());
        }

        info!("Starting BLE scan on {} adapter(s)", self.adapters.len());

        let mut last_error = None;
        let mut started = 0;
        for adapter in &self.adapters {
            match adapter.start_scan(ScanFilter::default()).await {
                Ok(()) => started += 1,
                Err(e) => {
                    warn!("Failed to start scan on adapter: {}", e);
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if started == 0 => Err(Error::Bluetooth(e)),
            _ => {
                *self.is_scanning.write() = true;
                Ok(())
            }
        }
    }

    /// Stop scanning on every adapter.
    pub async fn stop_scanning(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");
        *self.is_scanning.write() = false;

        for adapter in &self.adapters {
            adapter.stop_scan().await.map_err(Error::Bluetooth)?;
        }
        Ok(())
    }

    /// Check if currently scanning.
    pub fn is_scanning(&self) -> bool {
        *self.is_scanning.read()
    }

    /// Find a peripheral by address on any adapter.
    ///
    /// If several adapters see it, the strongest signal wins.
    pub async fn find(&self, address: &str) -> Option<BtleplugPeripheral> {
        if let Err(e) = self.start_scanning().await {
            warn!("Cannot scan for {}: {}", address, e);
        }

        let mut best: Option<BtleplugPeripheral> = None;
        for adapter in &self.adapters {
            let peripherals = match adapter.peripherals().await {
                Ok(peripherals) => peripherals,
                Err(e) => {
                    debug!("Failed to list peripherals: {}", e);
                    continue;
                }
            };

            for peripheral in peripherals {
                if !same_address(&address_of(&peripheral), address) {
                    continue;
                }
                let properties = peripheral.properties().await.ok().flatten();
                let candidate = BtleplugPeripheral::new(adapter.clone(), peripheral, properties.as_ref());
                if best.as_ref().map_or(true, |b| candidate.rssi > b.rssi) {
                    best = Some(candidate);
                }
            }
        }

        match &best {
            Some(found) => debug!("Found {} (RSSI {:?})", address, found.rssi),
            None => debug!("{} is not visible on any adapter", address),
        }
        best
    }

    /// Send every advertisement from `address` to `sightings` until the
    /// returned handle is dropped.
    pub async fn watch(
        &self,
        address: &str,
        sightings: mpsc::UnboundedSender<BtleplugPeripheral>,
    ) -> Result<CallbackHandle> {
        self.start_scanning().await?;

        let mut tasks = Vec::with_capacity(self.adapters.len());
        for adapter in &self.adapters {
            let mut events = adapter.events().await.map_err(Error::Bluetooth)?;
            let adapter = adapter.clone();
            let sightings = sightings.clone();
            let address = address.to_string();

            tasks.push(tokio::spawn(async move {
                while let Some(event) = events.next().await {
                    let Some(id) = advertised_id(event) else {
                        continue;
                    };
                    let Ok(peripheral) = adapter.peripheral(&id).await else {
                        continue;
                    };
                    if !same_address(&address_of(&peripheral), &address) {
                        continue;
                    }

                    trace!("Advertisement from {}", address);
                    let properties = peripheral.properties().await.ok().flatten();
                    let sighting = BtleplugPeripheral::new(adapter.clone(), peripheral, properties.as_ref());
                    if sightings.send(sighting).is_err() {
                        break;
                    }
                }
                debug!("Advertisement watch for {} ended", address);
            }));
        }

        let watch_id = self.watch_counter.fetch_add(1, Ordering::SeqCst);
        Ok(CallbackHandle::new(watch_id, move || {
            for task in tasks {
                task.abort();
            }
        }))
    }

    /// Scan for `duration` and list every Pressensor seen.
    pub async fn discover(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.start_scanning().await?;
        tokio::time::sleep(duration).await;

        let mut devices: Vec<DiscoveredDevice> = Vec::new();
        for adapter in &self.adapters {
            for peripheral in adapter.peripherals().await.map_err(Error::Bluetooth)? {
                let Some(properties) = peripheral.properties().await.ok().flatten() else {
                    continue;
                };
                if !is_pressensor_advertisement(properties.local_name.as_deref(), &properties.services) {
                    continue;
                }

                let address = address_of(&peripheral);
                if devices.iter().any(|d| same_address(&d.address, &address)) {
                    continue;
                }
                devices.push(DiscoveredDevice {
                    address,
                    name: properties.local_name,
                    rssi: properties.rssi,
                });
            }
        }

        info!("Discovered {} Pressensor(s)", devices.len());
        Ok(devices)
    }
}

impl Drop for BleScanner {
    fn drop(&mut self) {
        *self.is_scanning.write() = false;
    }
}

/// Peripheral behind an advertisement-type event.
fn advertised_id(event: CentralEvent) -> Option<PeripheralId> {
    match event {
        CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => Some(id),
        CentralEvent::ManufacturerDataAdvertisement { id, .. }
        | CentralEvent::ServiceDataAdvertisement { id, .. }
        | CentralEvent::ServicesAdvertisement { id, .. } => Some(id),
        _ => None,
    }
}

/// Bluetooth address, or the platform identifier where the OS hides it.
fn address_of(peripheral: &Peripheral) -> String {
    let address = peripheral.address();
    if address.into_inner() == [0u8; 6] {
        peripheral.id().to_string()
    } else {
        address.to_string()
    }
}
