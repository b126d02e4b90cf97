//! Process-wide scanner counters.
//!
//! Every pipeline stage writes its own counters into a shared [`Diagnostics`]
//! aggregate. Nothing in the pipeline reads them back to make decisions; they
//! exist so a presentation layer can poll [`Diagnostics::snapshot`].

use crate::beacon::BeaconFrame;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use uuid::Uuid;

/// Number of successful verifications kept for display.
pub const RECENT_VERIFIED_LEN: usize = 5;

/// Shared counter aggregate. Create once per process and hand out behind an `Arc`.
#[derive(Debug, Default)]
pub struct Diagnostics {
    advertisements_seen: AtomicU64,
    capture_dropped: AtomicU64,
    advertisements_with_vendor_data: AtomicU64,
    marker_prefix_seen: AtomicU64,
    frames_decoded: AtomicU64,
    frames_seen: AtomicU64,
    throttle_keys: AtomicU64,
    frames_enqueued: AtomicU64,
    frames_dropped_queue_full: AtomicU64,
    verify_sent: AtomicU64,
    verify_ok: AtomicU64,
    verify_err: AtomicU64,
    poll_cycles: AtomicU64,
    poll_devices: AtomicU64,
    last: Mutex<LastEvents>,
}

#[derive(Debug, Default, Clone)]
struct LastEvents {
    seen_frame: Option<BeaconFrame>,
    ok_at: Option<DateTime<Utc>>,
    ok_message: Option<String>,
    err_at: Option<DateTime<Utc>>,
    error_message: Option<String>,
    http_status: Option<u16>,
    key_hint: Option<String>,
    poll_at: Option<DateTime<Utc>>,
    recent_verified: VecDeque<RecentVerification>,
}

/// A successful verification, as shown in the "latest verified" list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentVerification {
    pub at: DateTime<Utc>,
    pub user_id: Uuid,
    pub rssi: i16,
    pub status_code: u16,
}

/// Point-in-time copy of [`Diagnostics`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub advertisements_seen: u64,
    /// Advertisements lost because the capture channel was full
    pub capture_dropped: u64,
    pub advertisements_with_vendor_data: u64,
    pub marker_prefix_seen: u64,
    pub frames_decoded: u64,
    pub frames_seen: u64,
    /// Distinct `(user_id, token)` keys the throttle has forwarded
    pub throttle_keys: u64,
    pub frames_enqueued: u64,
    pub frames_dropped_queue_full: u64,
    pub verify_sent: u64,
    pub verify_ok: u64,
    pub verify_err: u64,
    pub poll_cycles: u64,
    pub poll_devices: u64,
    pub last_seen_frame: Option<BeaconFrame>,
    pub last_ok_at: Option<DateTime<Utc>>,
    pub last_ok_message: Option<String>,
    pub last_err_at: Option<DateTime<Utc>>,
    pub last_error_message: Option<String>,
    pub last_http_status: Option<u16>,
    pub key_hint: Option<String>,
    pub last_poll_at: Option<DateTime<Utc>>,
    /// Newest first
    pub recent_verified: Vec<RecentVerification>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    fn last(&self) -> MutexGuard<'_, LastEvents> {
        self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Capture stage

    pub fn record_advertisement(&self) {
        bump(&self.advertisements_seen);
    }

    pub fn record_capture_dropped(&self) {
        bump(&self.capture_dropped);
    }

    pub fn record_vendor_data(&self) {
        bump(&self.advertisements_with_vendor_data);
    }

    pub fn record_marker_prefix(&self) {
        bump(&self.marker_prefix_seen);
    }

    pub fn record_decoded(&self) {
        bump(&self.frames_decoded);
    }

    pub fn record_poll_cycle(&self, devices: usize) {
        bump(&self.poll_cycles);
        self.poll_devices.store(devices as u64, Ordering::Relaxed);
        self.last().poll_at = Some(Utc::now());
    }

    /// A poll cycle that could not read the device cache. Still counts as a cycle.
    pub fn record_poll_error(&self, message: impl Into<String>) {
        bump(&self.poll_cycles);
        let now = Utc::now();
        let mut last = self.last();
        last.poll_at = Some(now);
        last.err_at = Some(now);
        last.error_message = Some(message.into());
    }

    // Throttle stage

    pub fn record_frame_seen(&self, frame: &BeaconFrame) {
        bump(&self.frames_seen);
        self.last().seen_frame = Some(*frame);
    }

    pub fn record_throttle_keys(&self, keys: usize) {
        self.throttle_keys.store(keys as u64, Ordering::Relaxed);
    }

    // Queue stage

    pub fn record_enqueued(&self) {
        bump(&self.frames_enqueued);
    }

    pub fn record_dropped(&self) {
        bump(&self.frames_dropped_queue_full);
    }

    // Verification stage

    pub fn record_verify_sent(&self) {
        bump(&self.verify_sent);
    }

    pub fn record_verify_ok(&self, status_code: u16, message: impl Into<String>) {
        bump(&self.verify_ok);
        self.record_remote_ok(Some(status_code), message);
    }

    pub fn record_verify_err(&self, status_code: Option<u16>, message: impl Into<String>) {
        bump(&self.verify_err);
        self.record_remote_err(status_code, message);
    }

    /// Record a successful remote call without touching the verify counters.
    pub fn record_remote_ok(&self, status_code: Option<u16>, message: impl Into<String>) {
        let mut last = self.last();
        last.ok_at = Some(Utc::now());
        last.ok_message = Some(message.into());
        last.http_status = status_code;
    }

    /// Record a failed remote call without touching the verify counters.
    pub fn record_remote_err(&self, status_code: Option<u16>, message: impl Into<String>) {
        let mut last = self.last();
        last.err_at = Some(Utc::now());
        last.error_message = Some(message.into());
        last.http_status = status_code;
    }

    pub fn record_key_hint(&self, hint: Option<String>) {
        self.last().key_hint = hint;
    }

    pub fn record_recent_verified(&self, frame: &BeaconFrame, status_code: u16) {
        let mut last = self.last();
        last.recent_verified.push_front(RecentVerification {
            at: Utc::now(),
            user_id: frame.user_id(),
            rssi: frame.rssi(),
            status_code,
        });
        last.recent_verified.truncate(RECENT_VERIFIED_LEN);
    }

    /// Copy all counters and "last event" fields.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let last = self.last().clone();

        DiagnosticsSnapshot {
            advertisements_seen: load(&self.advertisements_seen),
            capture_dropped: load(&self.capture_dropped),
            advertisements_with_vendor_data: load(&self.advertisements_with_vendor_data),
            marker_prefix_seen: load(&self.marker_prefix_seen),
            frames_decoded: load(&self.frames_decoded),
            frames_seen: load(&self.frames_seen),
            throttle_keys: load(&self.throttle_keys),
            frames_enqueued: load(&self.frames_enqueued),
            frames_dropped_queue_full: load(&self.frames_dropped_queue_full),
            verify_sent: load(&self.verify_sent),
            verify_ok: load(&self.verify_ok),
            verify_err: load(&self.verify_err),
            poll_cycles: load(&self.poll_cycles),
            poll_devices: load(&self.poll_devices),
            last_seen_frame: last.seen_frame,
            last_ok_at: last.ok_at,
            last_ok_message: last.ok_message,
            last_err_at: last.err_at,
            last_error_message: last.error_message,
            last_http_status: last.http_status,
            key_hint: last.key_hint,
            last_poll_at: last.poll_at,
            recent_verified: last.recent_verified.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_frame;

    #[test]
    fn fresh_snapshot_is_empty() {
        assert_eq!(Diagnostics::new().snapshot(), DiagnosticsSnapshot::default());
    }

    #[test]
    fn counters_accumulate() {
        let diag = Diagnostics::new();
        diag.record_advertisement();
        diag.record_advertisement();
        diag.record_vendor_data();
        diag.record_enqueued();
        diag.record_dropped();
        diag.record_dropped();
        diag.record_capture_dropped();
        diag.record_throttle_keys(3);

        let snap = diag.snapshot();
        assert_eq!(snap.advertisements_seen, 2);
        assert_eq!(snap.capture_dropped, 1);
        assert_eq!(snap.throttle_keys, 3);
        assert_eq!(snap.advertisements_with_vendor_data, 1);
        assert_eq!(snap.frames_enqueued, 1);
        assert_eq!(snap.frames_dropped_queue_full, 2);
    }

    #[test]
    fn verify_results_update_last_fields() {
        let diag = Diagnostics::new();
        diag.record_verify_ok(200, "{\"ok\":true}");
        diag.record_verify_err(Some(401), "Unauthorized (401)");

        let snap = diag.snapshot();
        assert_eq!(snap.verify_ok, 1);
        assert_eq!(snap.verify_err, 1);
        assert_eq!(snap.last_http_status, Some(401));
        assert_eq!(snap.last_ok_message.as_deref(), Some("{\"ok\":true}"));
        assert_eq!(snap.last_error_message.as_deref(), Some("Unauthorized (401)"));
        assert!(snap.last_ok_at.is_some());
        assert!(snap.last_err_at.is_some());
    }

    #[test]
    fn network_error_clears_last_status() {
        let diag = Diagnostics::new();
        diag.record_verify_ok(200, "ok");
        diag.record_verify_err(None, "network error: timed out");
        assert_eq!(diag.snapshot().last_http_status, None);
    }

    #[test]
    fn recent_verified_keeps_newest_five() {
        let diag = Diagnostics::new();
        for rssi in 0..7 {
            diag.record_recent_verified(&test_frame(1, -rssi), 200);
        }

        let recent = diag.snapshot().recent_verified;
        assert_eq!(recent.len(), RECENT_VERIFIED_LEN);
        assert_eq!(recent[0].rssi, -6);
        assert_eq!(recent[4].rssi, -2);
    }

    #[test]
    fn poll_cycle_sets_device_gauge() {
        let diag = Diagnostics::new();
        diag.record_poll_cycle(4);
        diag.record_poll_cycle(2);

        let snap = diag.snapshot();
        assert_eq!(snap.poll_cycles, 2);
        assert_eq!(snap.poll_devices, 2);
        assert!(snap.last_poll_at.is_some());

        diag.record_poll_error("poll error: adapter gone");
        let snap = diag.snapshot();
        assert_eq!(snap.poll_cycles, 3);
        assert_eq!(snap.poll_devices, 2);
        assert_eq!(snap.last_error_message.as_deref(), Some("poll error: adapter gone"));
    }
}
