//! Decode → throttle → enqueue, shared by every advertisement producer.
//!
//! Both the event-driven capture path and the cache poller feed the same
//! [`Pipeline`]. Handling an advertisement is synchronous and never waits on
//! the verification side: a full queue drops the frame and counts it.

use crate::beacon::{BeaconFrame, IBEACON_PREFIX, decode_ibeacon};
use crate::diagnostics::Diagnostics;
use crate::queue::{EnqueueError, QueueProducer};
use crate::scanner::Advertisement;
use crate::throttle::ThrottleStore;
use std::sync::{Arc, Mutex, PoisonError};

/// Which producer an advertisement came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Reported by the scanner as it happened
    Capture,
    /// Re-read from the scanner's device cache
    Poll,
}

/// What happened to one advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    NoVendorData,
    NoFrame,
    Throttled,
    Enqueued(BeaconFrame),
    Dropped(BeaconFrame),
}

/// Settings for advertisement filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PipelineConfig {
    /// Only consider manufacturer data from this company id
    pub strict_vendor: Option<u16>,
    /// Trace every manufacturer payload seen
    pub debug_advertisements: bool,
}

/// The producer side of the scanner.
#[derive(Debug)]
pub struct Pipeline {
    config: PipelineConfig,
    throttle: Mutex<ThrottleStore>,
    queue: QueueProducer,
    diagnostics: Arc<Diagnostics>,
}

impl Pipeline {
    pub fn new(
        config: PipelineConfig,
        throttle: ThrottleStore,
        queue: QueueProducer,
        diagnostics: Arc<Diagnostics>,
    ) -> Self {
        Self {
            config,
            throttle: Mutex::new(throttle),
            queue,
            diagnostics,
        }
    }

    /// Run one advertisement through decode, throttle and the hand-off queue.
    pub fn handle_advertisement(&self, adv: &Advertisement, origin: Origin) -> Disposition {
        if origin == Origin::Capture {
            self.diagnostics.record_advertisement();
        }
        if adv.manufacturer_data.is_empty() {
            return Disposition::NoVendorData;
        }
        self.diagnostics.record_vendor_data();

        let Some(frame) = self.decode_first(adv) else {
            return Disposition::NoFrame;
        };
        self.diagnostics.record_decoded();

        let forward = {
            let mut throttle = self.throttle.lock().unwrap_or_else(PoisonError::into_inner);
            let forward = throttle.should_forward(&frame);
            self.diagnostics.record_throttle_keys(throttle.tracked_keys());
            forward
        };
        if !forward {
            return Disposition::Throttled;
        }

        match self.queue.try_enqueue(frame) {
            Ok(()) => {
                self.diagnostics.record_enqueued();
                tracing::debug!(user_id = %frame.user_id(), token = frame.token(), rssi = frame.rssi(), "frame queued");
                Disposition::Enqueued(frame)
            }
            Err(EnqueueError::Full(frame) | EnqueueError::Closed(frame)) => {
                self.diagnostics.record_dropped();
                tracing::warn!(user_id = %frame.user_id(), token = frame.token(), "verification queue full, dropping frame");
                Disposition::Dropped(frame)
            }
        }
    }

    /// First manufacturer payload (in company id order) that decodes as an iBeacon.
    fn decode_first(&self, adv: &Advertisement) -> Option<BeaconFrame> {
        let entries = adv
            .manufacturer_data
            .iter()
            .filter(|(vendor, _)| self.config.strict_vendor.is_none_or(|only| only == **vendor));

        for (vendor, payload) in entries {
            if payload.starts_with(&IBEACON_PREFIX) {
                self.diagnostics.record_marker_prefix();
            }
            if self.config.debug_advertisements {
                let head: String = payload.iter().take(8).map(|b| format!("{b:02x}")).collect();
                tracing::debug!(
                    address = %adv.address,
                    rssi = adv.rssi,
                    company = %format!("0x{vendor:04x}"),
                    bytes = payload.len(),
                    %head,
                    "manufacturer data"
                );
            }
            if let Some(frame) = decode_ibeacon(payload, adv.rssi) {
                return Some(frame);
            }
        }
        None
    }
}
