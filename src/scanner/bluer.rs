//! BlueZ D-Bus backend.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.
//!
//! Advertisements are reported from two BlueZ sources at once: an
//! advertisement monitor matching the iBeacon marker inside manufacturer data,
//! and a discovery session. The discovery session also keeps the adapter's
//! device cache fresh for [`AdvertisementSource::cached`].

use super::{
    ADVERTISEMENT_CHANNEL_BUFFER_SIZE, Advertisement, AdvertisementSource, MANUFACTURER_DATA_TYPE,
    ScanError, ScanFuture, forward_advertisement,
};
use crate::beacon::IBEACON_PREFIX;
use crate::diagnostics::Diagnostics;
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, AdapterEvent, Address, Session};
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::{OnceCell, mpsc};

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Offset of the iBeacon marker inside manufacturer data (after the 2-byte company id).
const IBEACON_MARKER_OFFSET: u8 = 2;

/// Monitor pattern matching iBeacon frames under any company id.
fn ibeacon_pattern() -> Pattern {
    Pattern {
        data_type: MANUFACTURER_DATA_TYPE,
        start_position: IBEACON_MARKER_OFFSET,
        content: IBEACON_PREFIX.to_vec(),
    }
}

/// BlueZ scanner. The session is opened on first use.
pub struct BluerScanner {
    adapter_name: Option<String>,
    state: OnceCell<(Session, Adapter)>,
}

impl BluerScanner {
    pub fn new(adapter_name: Option<String>) -> Self {
        Self {
            adapter_name,
            state: OnceCell::new(),
        }
    }

    async fn adapter(&self) -> Result<&Adapter, ScanError> {
        let (_session, adapter) = self
            .state
            .get_or_try_init(|| async {
                let session = Session::new().await?;
                let adapter = match &self.adapter_name {
                    Some(name) => session.adapter(name)?,
                    None => session.default_adapter().await?,
                };
                adapter.set_powered(true).await?;
                tracing::info!(adapter = adapter.name(), "bluetooth adapter ready");
                Ok::<_, ScanError>((session, adapter))
            })
            .await?;
        Ok(adapter)
    }
}

impl AdvertisementSource for BluerScanner {
    fn subscribe(&self, diagnostics: Arc<Diagnostics>) -> ScanFuture<'_, mpsc::Receiver<Advertisement>> {
        Box::pin(async move {
            let adapter = self.adapter().await?.clone();
            let (tx, rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_BUFFER_SIZE);

            let monitor_manager = adapter.monitor().await?;
            let mut monitor_handle = monitor_manager
                .register(Monitor {
                    patterns: Some(vec![ibeacon_pattern()]),
                    ..Default::default()
                })
                .await?;
            let mut discovery = Box::pin(adapter.discover_devices_with_changes().await?);

            // The task owns the monitor and discovery session; dropping either stops it.
            tokio::spawn(async move {
                let _monitor_manager = monitor_manager;

                loop {
                    let address = tokio::select! {
                        Some(event) = monitor_handle.next() => match event {
                            MonitorEvent::DeviceFound(id) => id.device,
                            _ => continue,
                        },
                        Some(event) = discovery.next() => match event {
                            AdapterEvent::DeviceAdded(address) => address,
                            _ => continue,
                        },
                        else => break,
                    };

                    let advertisement = match read_advertisement(&adapter, address).await {
                        Ok(Some(advertisement)) => advertisement,
                        Ok(None) => continue,
                        Err(error) => {
                            tracing::debug!(%address, %error, "failed to read advertisement");
                            continue;
                        }
                    };

                    if !forward_advertisement(&tx, advertisement, &diagnostics) {
                        break;
                    }
                }

                tracing::debug!("bluetooth event loop finished");
            });

            Ok(rx)
        })
    }

    fn cached(&self) -> ScanFuture<'_, Vec<Advertisement>> {
        Box::pin(async move {
            let adapter = self.adapter().await?;
            let mut advertisements = Vec::new();

            for address in adapter.device_addresses().await? {
                match read_advertisement(adapter, address).await {
                    Ok(Some(advertisement)) => advertisements.push(advertisement),
                    Ok(None) => {}
                    // Devices can disappear between listing and reading
                    Err(error) => tracing::trace!(%address, %error, "skipping cached device"),
                }
            }

            Ok(advertisements)
        })
    }
}

/// Read the current RSSI and manufacturer data of a device.
///
/// Returns `Ok(None)` when BlueZ has no recent RSSI for it (stale cache entry).
async fn read_advertisement(
    adapter: &Adapter,
    address: Address,
) -> Result<Option<Advertisement>, ScanError> {
    let device = adapter.device(address)?;

    let Some(rssi) = device.rssi().await? else {
        return Ok(None);
    };
    let manufacturer_data = device.manufacturer_data().await?.unwrap_or_default();

    Ok(Some(Advertisement {
        address: address.into(),
        rssi,
        manufacturer_data: manufacturer_data.into_iter().collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matches_marker_after_company_id() {
        let pattern = ibeacon_pattern();
        assert_eq!(pattern.data_type, 0xff);
        assert_eq!(pattern.start_position, 2);
        assert_eq!(pattern.content, vec![0x02, 0x15]);
    }
}
