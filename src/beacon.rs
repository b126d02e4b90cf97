//! iBeacon frame decoding.
//!
//! The broadcasting app encodes a user id in the iBeacon proximity UUID and a
//! rotating 32-bit token split across the `major` and `minor` fields. This
//! module turns raw manufacturer-specific payloads into [`BeaconFrame`] values.

use serde::Serialize;
use uuid::Uuid;

/// Marker bytes that open every iBeacon payload (type 0x02, length 0x15).
pub const IBEACON_PREFIX: [u8; 2] = [0x02, 0x15];

/// Apple's Bluetooth SIG company identifier, the vendor id iBeacons are broadcast under.
pub const APPLE_COMPANY_ID: u16 = 0x004C;

/// Shortest payload accepted by [`decode_ibeacon`].
pub const MIN_FRAME_LEN: usize = 21;

const UUID_RANGE: std::ops::Range<usize> = 2..18;
const MAJOR_RANGE: std::ops::Range<usize> = 18..20;
const MINOR_RANGE: std::ops::Range<usize> = 20..22;

/// A decoded iBeacon sighting.
///
/// Only [`decode_ibeacon`] constructs frames, so every value satisfies
/// `token == (major << 16) | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct BeaconFrame {
    /// Identity carried in the proximity UUID
    user_id: Uuid,
    major: u16,
    minor: u16,
    /// Rotating token checked by the verifier
    token: u32,
    /// Received signal strength in dBm
    rssi: i16,
}

impl BeaconFrame {
    pub fn user_id(&self) -> Uuid {
        self.user_id
    }

    pub fn major(&self) -> u16 {
        self.major
    }

    pub fn minor(&self) -> u16 {
        self.minor
    }

    pub fn token(&self) -> u32 {
        self.token
    }

    pub fn rssi(&self) -> i16 {
        self.rssi
    }
}

/// Decode an iBeacon manufacturer payload (without the company id) into a frame.
///
/// Returns `None` when the payload is shorter than [`MIN_FRAME_LEN`] bytes or
/// does not start with [`IBEACON_PREFIX`]. Never panics, whatever the input.
///
/// # Example
/// ```
/// use attendance_scanner::beacon::decode_ibeacon;
///
/// let mut payload = vec![0x02, 0x15];
/// payload.extend_from_slice(&[0x11; 16]);
/// payload.extend_from_slice(&[0x00, 0x05, 0x00, 0x2A, 0xC5]);
///
/// let frame = decode_ibeacon(&payload, -60).unwrap();
/// assert_eq!(frame.major(), 5);
/// assert_eq!(frame.minor(), 42);
/// assert_eq!(frame.token(), 327_722);
/// ```
pub fn decode_ibeacon(payload: &[u8], rssi: i16) -> Option<BeaconFrame> {
    if payload.len() < MIN_FRAME_LEN || !payload.starts_with(&IBEACON_PREFIX) {
        return None;
    }

    let uuid_bytes: [u8; 16] = payload.get(UUID_RANGE)?.try_into().ok()?;
    let major = read_be_u16(payload, MAJOR_RANGE);
    let minor = read_be_u16(payload, MINOR_RANGE);

    Some(BeaconFrame {
        user_id: Uuid::from_bytes(uuid_bytes),
        major,
        minor,
        token: (u32::from(major) << 16) | u32::from(minor),
        rssi,
    })
}

/// Big-endian read of whatever part of `range` the payload actually holds.
fn read_be_u16(payload: &[u8], range: std::ops::Range<usize>) -> u16 {
    let end = range.end.min(payload.len());
    payload
        .get(range.start..end)
        .unwrap_or_default()
        .iter()
        .fold(0u16, |acc, &b| (acc << 8) | u16::from(b))
}
