//! KNX group and individual address types
//!
//! Group addresses use the 3-level form `main/middle/sub` and pack to the
//! 16-bit on-wire form `main<<11 | middle<<8 | sub`. Individual addresses use
//! `area.line.device`. Parsing rejects out-of-range fields.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A KNX group address (logical, one-to-many)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupAddress(u16);

impl GroupAddress {
    /// Build from 3-level parts: main 0–31, middle 0–7, sub 0–255
    pub fn new(main: u8, middle: u8, sub: u8) -> Result<Self, Error> {
        if main > 31 {
            return Err(Error::Validation(format!(
                "group address main {main} out of range 0-31"
            )));
        }
        if middle > 7 {
            return Err(Error::Validation(format!(
                "group address middle {middle} out of range 0-7"
            )));
        }
        Ok(Self(((main as u16) << 11) | ((middle as u16) << 8) | sub as u16))
    }

    /// The 16-bit on-wire representation
    #[must_use]
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Reconstruct from the on-wire form; every u16 is a valid group address
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Main group (0–31)
    #[must_use]
    pub fn main(&self) -> u8 {
        ((self.0 >> 11) & 0x1F) as u8
    }

    /// Middle group (0–7)
    #[must_use]
    pub fn middle(&self) -> u8 {
        ((self.0 >> 8) & 0x07) as u8
    }

    /// Sub group (0–255)
    #[must_use]
    pub fn sub(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

impl fmt::Display for GroupAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.main(), self.middle(), self.sub())
    }
}

impl FromStr for GroupAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let (main, middle, sub) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c), None) => (a, b, c),
            _ => {
                return Err(Error::Validation(format!(
                    "group address '{s}' is not main/middle/sub"
                )))
            }
        };
        let parse = |field: &str, what: &str| {
            field
                .parse::<u8>()
                .map_err(|_| Error::Validation(format!("group address {what} '{field}' invalid")))
        };
        Self::new(parse(main, "main")?, parse(middle, "middle")?, parse(sub, "sub")?)
    }
}

impl Serialize for GroupAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for GroupAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

/// A KNX individual (physical) address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IndividualAddress(u16);

impl IndividualAddress {
    /// Build from parts: area 0–15, line 0–15, device 0–255
    pub fn new(area: u8, line: u8, device: u8) -> Result<Self, Error> {
        if area > 15 {
            return Err(Error::Validation(format!(
                "individual address area {area} out of range 0-15"
            )));
        }
        if line > 15 {
            return Err(Error::Validation(format!(
                "individual address line {line} out of range 0-15"
            )));
        }
        Ok(Self(((area as u16) << 12) | ((line as u16) << 8) | device as u16))
    }

    /// The 16-bit on-wire representation
    #[must_use]
    pub fn raw(&self) -> u16 {
        self.0
    }

    /// Reconstruct from the on-wire form
    #[must_use]
    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    /// Area (0–15)
    #[must_use]
    pub fn area(&self) -> u8 {
        ((self.0 >> 12) & 0x0F) as u8
    }

    /// Line (0–15)
    #[must_use]
    pub fn line(&self) -> u8 {
        ((self.0 >> 8) & 0x0F) as u8
    }

    /// Device (0–255)
    #[must_use]
    pub fn device(&self) -> u8 {
        (self.0 & 0xFF) as u8
    }
}

impl fmt::Display for IndividualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.area(), self.line(), self.device())
    }
}

impl FromStr for IndividualAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('.');
        let (area, line, device) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c), None) => (a, b, c),
            _ => {
                return Err(Error::Validation(format!(
                    "individual address '{s}' is not area.line.device"
                )))
            }
        };
        let parse = |field: &str, what: &str| {
            field.parse::<u8>().map_err(|_| {
                Error::Validation(format!("individual address {what} '{field}' invalid"))
            })
        };
        Self::new(parse(area, "area")?, parse(line, "line")?, parse(device, "device")?)
    }
}

impl Serialize for IndividualAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for IndividualAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn group_address_round_trip() {
        for s in ["0/0/0", "1/2/3", "31/7/255", "15/0/99"] {
            let ga: GroupAddress = s.parse().unwrap();
            assert_eq!(ga.to_string(), s);
            assert_eq!(GroupAddress::from_raw(ga.raw()), ga);
        }
    }

    #[test]
    fn group_address_wire_format() {
        let ga: GroupAddress = "1/2/3".parse().unwrap();
        assert_eq!(ga.raw(), (1 << 11) | (2 << 8) | 3);
    }

    #[test]
    fn group_address_rejects_out_of_range() {
        assert!("32/0/0".parse::<GroupAddress>().is_err());
        assert!("0/8/0".parse::<GroupAddress>().is_err());
        assert!("0/0/256".parse::<GroupAddress>().is_err());
        assert!("1/2".parse::<GroupAddress>().is_err());
        assert!("1/2/3/4".parse::<GroupAddress>().is_err());
        assert!("a/b/c".parse::<GroupAddress>().is_err());
    }

    #[test]
    fn individual_address_round_trip() {
        for s in ["0.0.0", "1.1.5", "15.15.255"] {
            let ia: IndividualAddress = s.parse().unwrap();
            assert_eq!(ia.to_string(), s);
            assert_eq!(IndividualAddress::from_raw(ia.raw()), ia);
        }
    }

    #[test]
    fn individual_address_rejects_out_of_range() {
        assert!("16.0.0".parse::<IndividualAddress>().is_err());
        assert!("0.16.0".parse::<IndividualAddress>().is_err());
        assert!("1.1".parse::<IndividualAddress>().is_err());
    }

    #[test]
    fn serde_uses_string_form() {
        let ga: GroupAddress = "5/1/20".parse().unwrap();
        assert_eq!(serde_json::to_string(&ga).unwrap(), "\"5/1/20\"");
        let back: GroupAddress = serde_json::from_str("\"5/1/20\"").unwrap();
        assert_eq!(back, ga);
    }
}
