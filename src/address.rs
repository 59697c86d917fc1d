use std::fmt;
use std::str::FromStr;

use uuid::Uuid;

use crate::error::{Error, Result};

/// Link layer address of the robot.
///
/// On Linux and Windows this is the MAC address, on macOS the platform's peripheral UUID.
/// Stored upper case so the same robot always compares equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceAddress(String);

impl DeviceAddress {
    /// Accepts a MAC address (`AA:BB:CC:DD:EE:FF`, `AA-BB-..` or 12 bare hex digits) or a
    /// peripheral UUID. MACs are normalised to the colon form.
    pub fn parse(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::InvalidConfig("device address is empty".to_string()));
        }
        if let Some(octets) = mac_octets(trimmed) {
            return Ok(Self(octets.join(":").to_uppercase()));
        }
        if let Ok(uuid) = Uuid::parse_str(trimmed) {
            return Ok(Self(uuid.hyphenated().to_string().to_uppercase()));
        }
        Err(Error::InvalidConfig(format!(
            "device address {trimmed:?} is neither a MAC address nor a UUID"
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key under which this device's broadcast channels are registered, e.g. `aabbccddeeff`
    pub fn channel_key(&self) -> String {
        self.0
            .chars()
            .filter(|c| !matches!(c, ':' | '-'))
            .collect::<String>()
            .to_lowercase()
    }
}

fn mac_octets(s: &str) -> Option<Vec<&str>> {
    let octets: Vec<&str> = if s.contains(':') {
        s.split(':').collect()
    } else if s.contains('-') {
        s.split('-').collect()
    } else if s.len() == 12 && s.is_ascii() {
        (0..12).step_by(2).map(|i| &s[i..i + 2]).collect()
    } else {
        return None;
    };
    let valid = octets.len() == 6
        && octets
            .iter()
            .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()));
    valid.then_some(octets)
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for DeviceAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalises_case_and_whitespace() {
        let address = DeviceAddress::parse("  aa:bb:cc:dd:ee:ff ").unwrap();
        assert_eq!(address.as_str(), "AA:BB:CC:DD:EE:FF");
        assert_eq!(address, "AA:BB:CC:DD:EE:FF".parse().unwrap());
    }

    #[test]
    fn channel_key_drops_separators() {
        let address = DeviceAddress::parse("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(address.channel_key(), "aabbccddeeff");
    }

    #[test]
    fn rejects_empty_and_inner_whitespace() {
        assert!(matches!(DeviceAddress::parse(""), Err(Error::InvalidConfig(_))));
        assert!(matches!(DeviceAddress::parse("   "), Err(Error::InvalidConfig(_))));
        assert!(matches!(DeviceAddress::parse("AA BB"), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn rejects_fragments_of_an_address() {
        for raw in ["0", "E", "DE", "AA:BB:CC:DD:EE", "AA:BB:CC:DD:EE:FF:00", "AA:BB:CC:DD:EE:GG", "AABBCCDDEEF", "A:BB:CC:DD:EE:FFF"] {
            assert!(
                matches!(DeviceAddress::parse(raw), Err(Error::InvalidConfig(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn accepts_mac_spellings_and_uuids() {
        let colon = DeviceAddress::parse("c8:47:8c:00:12:34").unwrap();
        assert_eq!(DeviceAddress::parse("C8-47-8C-00-12-34").unwrap(), colon);
        assert_eq!(DeviceAddress::parse("c8478c001234").unwrap(), colon);
        assert_eq!(colon.channel_key(), "c8478c001234");

        let uuid = DeviceAddress::parse("5a1e0c3d-9f2b-4c1a-8e6f-0123456789ab").unwrap();
        assert_eq!(uuid.as_str(), "5A1E0C3D-9F2B-4C1A-8E6F-0123456789AB");
        assert_eq!(uuid.channel_key(), "5a1e0c3d9f2b4c1a8e6f0123456789ab");
    }
}
