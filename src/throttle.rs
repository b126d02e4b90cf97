//! Sighting throttling for decoded beacon frames.
//!
//! A phone advertises the same frame many times per second. The throttle store
//! lets at most one frame per `(user_id, token)` through per window, so each
//! physical presence turns into a single verification request.

use crate::beacon::BeaconFrame;
use crate::diagnostics::Diagnostics;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Default spacing between forwarded frames for the same key.
pub const DEFAULT_THROTTLE_WINDOW: Duration = Duration::from_secs(25);

/// Default minimum signal strength (dBm) for a frame to be forwarded.
pub const DEFAULT_MIN_RSSI: i16 = -85;

/// Identity of a sighting for throttling purposes.
pub type ThrottleKey = (Uuid, u32);

/// Per-key throttle with a signal strength floor.
///
/// Keys are tracked independently. The first frame for a key is always
/// forwarded (given a strong enough signal); later frames are forwarded once
/// `window` has passed since the last *forwarded* frame for that key. Entries
/// are never evicted.
#[derive(Debug)]
pub struct ThrottleStore {
    window: Duration,
    min_rssi: i16,
    last_forwarded: HashMap<ThrottleKey, Instant>,
    diagnostics: Arc<Diagnostics>,
}

impl ThrottleStore {
    /// Create a throttle store.
    ///
    /// # Example
    /// ```
    /// use std::sync::Arc;
    /// use std::time::Duration;
    /// use attendance_scanner::diagnostics::Diagnostics;
    /// use attendance_scanner::throttle::ThrottleStore;
    ///
    /// let store = ThrottleStore::new(Duration::from_secs(25), -85, Arc::new(Diagnostics::new()));
    /// ```
    pub fn new(window: Duration, min_rssi: i16, diagnostics: Arc<Diagnostics>) -> Self {
        ThrottleStore {
            window,
            min_rssi,
            last_forwarded: HashMap::new(),
            diagnostics,
        }
    }

    /// Decide whether `frame` should be forwarded, using the current time.
    pub fn should_forward(&mut self, frame: &BeaconFrame) -> bool {
        self.should_forward_at(frame, Instant::now())
    }

    /// Decide whether `frame` should be forwarded at time `now`.
    ///
    /// Every call counts the frame as seen. Frames below the RSSI floor are
    /// rejected without touching the key's timer, and so are frames arriving
    /// within the window.
    pub fn should_forward_at(&mut self, frame: &BeaconFrame, now: Instant) -> bool {
        self.diagnostics.record_frame_seen(frame);

        if frame.rssi() < self.min_rssi {
            return false;
        }

        let key = (frame.user_id(), frame.token());
        match self.last_forwarded.get(&key) {
            Some(last) if now.saturating_duration_since(*last) < self.window => false,
            _ => {
                self.last_forwarded.insert(key, now);
                true
            }
        }
    }

    /// Number of distinct keys forwarded so far.
    pub fn tracked_keys(&self) -> usize {
        self.last_forwarded.len()
    }
}

/// Parse a duration from a human-readable string.
///
/// Supports the following suffixes:
/// - `s` or no suffix: seconds
/// - `m`: minutes
/// - `h`: hours
/// - `ms`: milliseconds
///
/// # Examples
/// ```
/// use attendance_scanner::throttle::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("25s").unwrap(), Duration::from_secs(25));
/// assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
/// assert_eq!(parse_duration("750ms").unwrap(), Duration::from_millis(750));
/// ```
pub fn parse_duration(src: &str) -> Result<Duration, String> {
    let src = src.trim();

    if src.is_empty() {
        return Err("empty duration string".to_string());
    }

    let (num, unit_secs, unit_name) = if let Some(num) = src.strip_suffix("ms") {
        return num
            .trim()
            .parse()
            .map(Duration::from_millis)
            .map_err(|_| format!("invalid milliseconds: {num}"));
    } else if let Some(num) = src.strip_suffix('h') {
        (num, 3600, "hours")
    } else if let Some(num) = src.strip_suffix('m') {
        (num, 60, "minutes")
    } else if let Some(num) = src.strip_suffix('s') {
        (num, 1, "seconds")
    } else {
        (src, 1, "duration")
    };

    let value: u64 = num
        .trim()
        .parse()
        .map_err(|_| format!("invalid {unit_name}: {num}"))?;
    value
        .checked_mul(unit_secs)
        .map(Duration::from_secs)
        .ok_or_else(|| format!("{unit_name} out of range: {num}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::test_frame;

    fn store(window: Duration) -> ThrottleStore {
        ThrottleStore::new(window, DEFAULT_MIN_RSSI, Arc::new(Diagnostics::new()))
    }

    #[test]
    fn first_frame_forwarded_second_within_window_rejected() {
        let mut throttle = store(DEFAULT_THROTTLE_WINDOW);
        let frame = test_frame(42, -60);
        let t0 = Instant::now();

        assert!(throttle.should_forward_at(&frame, t0));
        assert!(!throttle.should_forward_at(&frame, t0 + Duration::from_secs(24)));
    }

    #[test]
    fn forwarded_again_once_window_elapses() {
        let mut throttle = store(DEFAULT_THROTTLE_WINDOW);
        let frame = test_frame(42, -60);
        let t0 = Instant::now();

        assert!(throttle.should_forward_at(&frame, t0));
        assert!(!throttle.should_forward_at(&frame, t0 + Duration::from_secs(10)));
        assert!(throttle.should_forward_at(&frame, t0 + Duration::from_secs(25)));
        assert!(!throttle.should_forward_at(&frame, t0 + Duration::from_secs(26)));
    }

    #[test]
    fn rejected_sighting_does_not_reset_timer() {
        let mut throttle = store(Duration::from_secs(25));
        let frame = test_frame(42, -60);
        let t0 = Instant::now();

        assert!(throttle.should_forward_at(&frame, t0));
        for secs in [5, 10, 20, 24] {
            assert!(!throttle.should_forward_at(&frame, t0 + Duration::from_secs(secs)));
        }
        assert!(throttle.should_forward_at(&frame, t0 + Duration::from_secs(25)));
    }

    #[test]
    fn weak_signal_rejected_regardless_of_state() {
        let mut throttle = store(DEFAULT_THROTTLE_WINDOW);
        let t0 = Instant::now();

        assert!(!throttle.should_forward_at(&test_frame(42, -86), t0));
        // The weak sighting did not claim the key
        assert!(throttle.should_forward_at(&test_frame(42, -85), t0));
        assert!(!throttle.should_forward_at(&test_frame(7, -100), t0 + Duration::from_secs(60)));
        assert_eq!(throttle.tracked_keys(), 1);
    }

    #[test]
    fn distinct_tokens_are_independent_keys() {
        let mut throttle = store(DEFAULT_THROTTLE_WINDOW);
        let t0 = Instant::now();

        assert!(throttle.should_forward_at(&test_frame(1, -60), t0));
        assert!(throttle.should_forward_at(&test_frame(2, -60), t0));
        assert!(!throttle.should_forward_at(&test_frame(1, -60), t0));
        assert_eq!(throttle.tracked_keys(), 2);
    }

    #[test]
    fn every_call_counts_frame_seen() {
        let diagnostics = Arc::new(Diagnostics::new());
        let mut throttle = ThrottleStore::new(DEFAULT_THROTTLE_WINDOW, -85, diagnostics.clone());
        let t0 = Instant::now();

        throttle.should_forward_at(&test_frame(1, -60), t0);
        throttle.should_forward_at(&test_frame(1, -60), t0);
        throttle.should_forward_at(&test_frame(2, -99), t0);

        let snap = diagnostics.snapshot();
        assert_eq!(snap.frames_seen, 3);
        assert_eq!(snap.last_seen_frame, Some(test_frame(2, -99)));
    }

    #[test]
    fn zero_window_forwards_everything() {
        let mut throttle = store(Duration::ZERO);
        let frame = test_frame(42, -60);
        assert!(throttle.should_forward(&frame));
        assert!(throttle.should_forward(&frame));
    }

    #[test]
    fn test_parse_duration_units() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("1m").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("10").unwrap(), Duration::from_secs(10));
    }

    #[test]
    fn test_parse_duration_with_whitespace() {
        assert_eq!(parse_duration(" 3s ").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("3 s").unwrap(), Duration::from_secs(3));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("-1s").is_err());
        assert!(parse_duration(&format!("{}h", u64::MAX)).is_err());
    }
}
