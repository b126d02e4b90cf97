//! Advertisement capture boundary.
//!
//! A scanner backend delivers raw advertisements two ways: as a stream of
//! events while scanning ([`AdvertisementSource::subscribe`]) and as a snapshot
//! of its own device cache ([`AdvertisementSource::cached`]). The second one
//! exists because event delivery from BlueZ is not reliable on every setup;
//! polling the cache catches sightings the event stream missed.

#[cfg(feature = "bluer")]
pub mod bluer;

use crate::diagnostics::Diagnostics;
use crate::mac_address::MacAddress;
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Channel buffer size for captured advertisements.
pub const ADVERTISEMENT_CHANNEL_BUFFER_SIZE: usize = 256;

/// Bluetooth manufacturer-specific data type (AD type 0xFF)
pub const MANUFACTURER_DATA_TYPE: u8 = 0xff;

/// One received advertisement.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advertisement {
    pub address: MacAddress,
    /// Received signal strength in dBm
    pub rssi: i16,
    /// Manufacturer-specific payloads keyed by company id, without the id bytes
    pub manufacturer_data: BTreeMap<u16, Vec<u8>>,
}

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
    /// Backend not available (not compiled in)
    #[error("Backend '{0}' not available (not compiled in)")]
    BackendNotAvailable(String),
}

pub type ScanFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ScanError>> + Send + 'a>>;

/// Source of raw advertisements. Implemented by the Bluetooth backends and by test fakes.
pub trait AdvertisementSource: Send + Sync {
    /// Start scanning and stream advertisements as they are reported.
    ///
    /// Advertisements that do not fit into the channel are dropped and counted
    /// in `diagnostics`.
    fn subscribe(&self, diagnostics: Arc<Diagnostics>) -> ScanFuture<'_, mpsc::Receiver<Advertisement>>;

    /// Snapshot of the devices the scanner currently knows about.
    fn cached(&self) -> ScanFuture<'_, Vec<Advertisement>>;
}

/// Hand a captured advertisement over without waiting.
///
/// A full channel drops the advertisement and counts it. Returns `false` once
/// the receiving side is gone.
pub fn forward_advertisement(
    tx: &mpsc::Sender<Advertisement>,
    advertisement: Advertisement,
    diagnostics: &Diagnostics,
) -> bool {
    match tx.try_send(advertisement) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(advertisement)) => {
            diagnostics.record_capture_dropped();
            tracing::debug!(address = %advertisement.address, "advertisement channel full, dropping event");
            true
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Open the compiled-in scanner backend.
///
/// Nothing touches the radio until [`AdvertisementSource::subscribe`] or
/// [`AdvertisementSource::cached`] is first called.
///
/// # Arguments
/// * `adapter` - Adapter name such as `hci0`; `None` selects the default adapter
///
/// # Errors
/// Returns [`ScanError::BackendNotAvailable`] when built without a backend.
pub fn open(adapter: Option<String>) -> Result<Box<dyn AdvertisementSource>, ScanError> {
    #[cfg(feature = "bluer")]
    {
        Ok(Box::new(bluer::BluerScanner::new(adapter)))
    }
    #[cfg(not(feature = "bluer"))]
    {
        let _ = adapter;
        Err(ScanError::BackendNotAvailable("bluer".to_string()))
    }
}
