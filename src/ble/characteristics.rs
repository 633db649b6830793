//! GATT link on a connected btleplug peripheral.
//!
//! Caches the discovered characteristics, forwards notifications and watches
//! the adapter for the peripheral dropping off.

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Peripheral as _, WriteType};
use btleplug::platform::{Adapter, Peripheral};
use futures::stream::StreamExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::ble::radio::{Link, LinkEventSink};
use crate::error::{Error, Result};

/// Established link to a Pressensor through btleplug.
pub struct BtleplugLink {
    /// The connected peripheral.
    peripheral: Peripheral,
    /// Cached characteristics by UUID.
    characteristics: HashMap<Uuid, Characteristic>,
    /// Notification forwarder and disconnect watcher.
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BtleplugLink {
    /// Wrap a peripheral whose services have been discovered.
    ///
    /// Starts forwarding notifications and link loss to `events`.
    pub(crate) async fn start(
        peripheral: Peripheral,
        adapter: Adapter,
        events: LinkEventSink,
    ) -> Result<Self> {
        let mut characteristics = HashMap::new();
        for service in peripheral.services() {
            for characteristic in service.characteristics {
                trace!(
                    "Found characteristic: {} in service {}",
                    characteristic.uuid,
                    service.uuid
                );
                characteristics.insert(characteristic.uuid, characteristic);
            }
        }
        debug!("Discovered {} characteristics", characteristics.len());

        let mut notifications = peripheral.notifications().await?;
        let mut adapter_events = adapter.events().await?;

        let sink = events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                trace!(
                    "Notification from {}: {} bytes",
                    notification.uuid,
                    notification.value.len()
                );
                if !sink.notification(notification.uuid, notification.value) {
                    break;
                }
            }
            debug!("Notification stream ended");
        });

        let id = peripheral.id();
        let watcher = tokio::spawn(async move {
            while let Some(event) = adapter_events.next().await {
                if let CentralEvent::DeviceDisconnected(disconnected) = event {
                    if disconnected == id {
                        debug!("Peripheral {} disconnected", disconnected);
                        events.disconnected();
                        break;
                    }
                }
            }
        });

        Ok(Self {
            peripheral,
            characteristics,
            tasks: Mutex::new(vec![forwarder, watcher]),
        })
    }

    fn characteristic(&self, uuid: Uuid) -> Result<&Characteristic> {
        self.characteristics.get(&uuid).ok_or_else(|| {
            debug!("Characteristic {} not found on device", uuid);
            Error::CharacteristicNotFound {
                uuid: uuid.to_string(),
            }
        })
    }

    fn stop_tasks(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

#[async_trait]
impl Link for BtleplugLink {
    async fn subscribe(&self, characteristic: Uuid) -> Result<()> {
        let target = self.characteristic(characteristic)?;
        debug!(
            "Subscribing to {}, properties: {:?}",
            characteristic, target.properties
        );
        self.peripheral.subscribe(target).await?;
        Ok(())
    }

    async fn unsubscribe(&self, characteristic: Uuid) -> Result<()> {
        let target = self.characteristic(characteristic)?;
        self.peripheral.unsubscribe(target).await?;
        debug!("Unsubscribed from notifications from {}", characteristic);
        Ok(())
    }

    async fn read(&self, characteristic: Uuid) -> Result<Vec<u8>> {
        let target = self.characteristic(characteristic)?;
        let data = self.peripheral.read(target).await?;
        trace!("Read {} bytes from characteristic {}", data.len(), characteristic);
        Ok(data)
    }

    async fn write(&self, characteristic: Uuid, data: &[u8], with_response: bool) -> Result<()> {
        let target = self.characteristic(characteristic)?;
        let write_type = if with_response {
            WriteType::WithResponse
        } else {
            WriteType::WithoutResponse
        };
        self.peripheral.write(target, data, write_type).await?;
        trace!("Wrote {} bytes to characteristic {}", data.len(), characteristic);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.stop_tasks();
        self.peripheral.disconnect().await?;
        debug!("Disconnected peripheral {}", self.peripheral.id());
        Ok(())
    }
}

impl Drop for BtleplugLink {
    fn drop(&mut self) {
        self.stop_tasks();
    }
}
