//! Bluetooth device address of an advertisement.
//!
//! Kept independent of any Bluetooth library so the pipeline and its tests
//! build without a backend.

use std::fmt;

/// A Bluetooth MAC address stored as a compact 6-byte array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct MacAddress(pub [u8; 6]);

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }
}

#[cfg(feature = "bluer")]
impl From<bluer::Address> for MacAddress {
    fn from(addr: bluer::Address) -> Self {
        Self(addr.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_as_colon_separated_hex() {
        assert_eq!(
            MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]).to_string(),
            "AA:BB:CC:DD:EE:FF"
        );
        assert_eq!(MacAddress::from([0, 1, 2, 3, 4, 5]).to_string(), "00:01:02:03:04:05");
    }

    #[cfg(feature = "bluer")]
    #[test]
    fn converts_from_bluer_address() {
        let addr = bluer::Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        assert_eq!(MacAddress::from(addr), MacAddress([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]));
    }
}
