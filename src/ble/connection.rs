//! BLE connection establishment.
//!
//! Connects to a located Pressensor with bounded retries and hands back a
//! ready [`BtleplugLink`].

use btleplug::api::Peripheral as _;
use tracing::{debug, info, warn};

use crate::ble::characteristics::BtleplugLink;
use crate::ble::radio::LinkEventSink;
use crate::ble::scanner::BtleplugPeripheral;
use crate::config::BtleplugConfig;
use crate::error::{Error, Result};

/// Connect to the peripheral and discover its services.
///
/// Transient handshake failures are retried up to
/// `config.max_connect_attempts` times with `config.retry_delay` in between.
///
/// # Arguments
///
/// * `target` - The peripheral sighting to connect to
/// * `events` - Sink for notifications and link loss on the new link
/// * `config` - Retry settings
pub async fn connect_with_retry(
    target: &BtleplugPeripheral,
    events: LinkEventSink,
    config: &BtleplugConfig,
) -> Result<BtleplugLink> {
    let peripheral = target.peripheral();

    // Check if already connected at BLE level
    if peripheral.is_connected().await.unwrap_or(false) {
        info!("Peripheral already connected at BLE level");
    } else {
        let max_attempts = config.max_connect_attempts.max(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            debug!("Connection attempt {} of {}", attempts, max_attempts);

            match peripheral.connect().await {
                Ok(()) => break,
                Err(e) => {
                    warn!("Connection attempt {} failed: {}", attempts, e);
                    if attempts >= max_attempts {
                        return Err(Error::ConnectionFailed {
                            reason: format!("Failed after {} attempts: {}", max_attempts, e),
                        });
                    }
                    tokio::time::sleep(config.retry_delay).await;
                }
            }
        }
    }

    let link = match peripheral.discover_services().await {
        Ok(()) => BtleplugLink::start(peripheral.clone(), target.adapter().clone(), events).await,
        Err(e) => Err(Error::ConnectionFailed {
            reason: format!("service discovery failed: {}", e),
        }),
    };

    if link.is_err() {
        if let Err(e) = peripheral.disconnect().await {
            debug!("Error dropping half-open connection: {}", e);
        }
    }
    link
}
