//! [`Radio`] implementation backed by btleplug.

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::ble::characteristics::BtleplugLink;
use crate::ble::connection;
use crate::ble::radio::{LinkEventSink, Radio};
use crate::ble::scanner::{BleScanner, BtleplugPeripheral, DiscoveredDevice};
use crate::config::BtleplugConfig;
use crate::error::Result;
use crate::session::CallbackHandle;

/// The system Bluetooth stack.
pub struct BtleplugRadio {
    /// Scanner over every adapter.
    scanner: BleScanner,
    /// Connection retry settings.
    config: BtleplugConfig,
}

impl BtleplugRadio {
    /// Open the system Bluetooth stack with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        Self::with_config(BtleplugConfig::default()).await
    }

    /// Open the system Bluetooth stack.
    pub async fn with_config(config: BtleplugConfig) -> Result<Self> {
        Ok(Self {
            scanner: BleScanner::new().await?,
            config,
        })
    }

    /// Get the scanner.
    pub fn scanner(&self) -> &BleScanner {
        &self.scanner
    }

    /// Scan for `duration` and list nearby Pressensors.
    pub async fn discover(&self, duration: Duration) -> Result<Vec<DiscoveredDevice>> {
        self.scanner.discover(duration).await
    }
}

#[async_trait]
impl Radio for BtleplugRadio {
    type Peripheral = BtleplugPeripheral;
    type Link = BtleplugLink;

    async fn find_peripheral(&self, address: &str) -> Option<BtleplugPeripheral> {
        self.scanner.find(address).await
    }

    async fn connect_with_retry(
        &self,
        peripheral: &BtleplugPeripheral,
        events: LinkEventSink,
    ) -> Result<BtleplugLink> {
        connection::connect_with_retry(peripheral, events, &self.config).await
    }

    async fn watch_advertisements(
        &self,
        address: &str,
        sightings: mpsc::UnboundedSender<BtleplugPeripheral>,
    ) -> Result<CallbackHandle> {
        self.scanner.watch(address, sightings).await
    }
}
