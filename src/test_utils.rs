use crate::beacon::{BeaconFrame, IBEACON_PREFIX, decode_ibeacon};
use crate::mac_address::MacAddress;
use crate::scanner::Advertisement;

/// A stable MAC address for unit tests.
pub const TEST_MAC: MacAddress = MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

/// Identity bytes of the test phone, `0f1e2d3c-4b5a-6978-8796-a5b4c3d2e1f0`.
pub const TEST_IDENTITY: [u8; 16] = [
    0x0f, 0x1e, 0x2d, 0x3c, 0x4b, 0x5a, 0x69, 0x78, 0x87, 0x96, 0xa5, 0xb4, 0xc3, 0xd2, 0xe1, 0xf0,
];

/// Measured power byte appended to every test frame.
const TEST_TX_POWER: u8 = 0xC5;

/// Full 23-byte iBeacon manufacturer payload (company id excluded).
pub fn ibeacon_payload(identity: [u8; 16], major: u16, minor: u16) -> Vec<u8> {
    let mut payload = Vec::with_capacity(23);
    payload.extend_from_slice(&IBEACON_PREFIX);
    payload.extend_from_slice(&identity);
    payload.extend_from_slice(&major.to_be_bytes());
    payload.extend_from_slice(&minor.to_be_bytes());
    payload.push(TEST_TX_POWER);
    payload
}

/// Frame for [`TEST_IDENTITY`] with major 0, so the token equals `minor`.
pub fn test_frame(minor: u16, rssi: i16) -> BeaconFrame {
    decode_ibeacon(&ibeacon_payload(TEST_IDENTITY, 0, minor), rssi)
        .expect("test payload is a valid iBeacon frame")
}

/// Advertisement from [`TEST_MAC`] carrying the given manufacturer payloads.
pub fn advertisement(rssi: i16, manufacturer_data: &[(u16, Vec<u8>)]) -> Advertisement {
    Advertisement {
        address: TEST_MAC,
        rssi,
        manufacturer_data: manufacturer_data.iter().cloned().collect(),
    }
}
