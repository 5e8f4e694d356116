//! KNX telegram framing for the daemon's group socket protocol
//!
//! The daemon speaks length-prefixed frames: a 2-byte big-endian length
//! followed by a 2-byte message code and the TPDU. Group telegrams carry the
//! APCI in the first two TPDU octets; values of six bits or fewer are packed
//! into the low bits of the second octet, larger payloads follow as whole
//! octets.

use std::fmt;

use crate::error::Error;
use crate::knx::address::{GroupAddress, IndividualAddress};

/// Message code for a group telegram on the daemon socket
pub const MSG_GROUP_PACKET: u16 = 0x0027;

/// Application-layer service selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Apci {
    /// Read request; carries no value
    GroupValueRead,
    /// Response to a read
    GroupValueResponse,
    /// Unsolicited write
    GroupValueWrite,
}

impl Apci {
    fn bits(self) -> u16 {
        match self {
            Self::GroupValueRead => 0x0000,
            Self::GroupValueResponse => 0x0040,
            Self::GroupValueWrite => 0x0080,
        }
    }

    fn from_bits(bits: u16) -> Result<Self, Error> {
        match bits & 0x03C0 {
            0x0000 => Ok(Self::GroupValueRead),
            0x0040 => Ok(Self::GroupValueResponse),
            0x0080 => Ok(Self::GroupValueWrite),
            other => Err(Error::Validation(format!("unsupported APCI {other:#06x}"))),
        }
    }
}

impl fmt::Display for Apci {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::GroupValueRead => write!(f, "GroupValue_Read"),
            Self::GroupValueResponse => write!(f, "GroupValue_Response"),
            Self::GroupValueWrite => write!(f, "GroupValue_Write"),
        }
    }
}

/// A decoded group telegram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Telegram {
    /// Sender's individual address; zero when we originate the frame
    pub source: IndividualAddress,
    /// Destination group address
    pub destination: GroupAddress,
    pub apci: Apci,
    /// DPT payload bytes; always empty for `GroupValue_Read`
    pub payload: Vec<u8>,
}

impl Telegram {
    /// Build a write telegram for sending
    #[must_use]
    pub fn write(destination: GroupAddress, payload: Vec<u8>) -> Self {
        Self {
            source: IndividualAddress::from_raw(0),
            destination,
            apci: Apci::GroupValueWrite,
            payload,
        }
    }

    /// Build a read-request telegram (no payload by definition)
    #[must_use]
    pub fn read(destination: GroupAddress) -> Self {
        Self {
            source: IndividualAddress::from_raw(0),
            destination,
            apci: Apci::GroupValueRead,
            payload: Vec::new(),
        }
    }

    /// Encode to a daemon-socket frame, including the length prefix
    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        if self.apci == Apci::GroupValueRead && !self.payload.is_empty() {
            return Err(Error::Validation(
                "GroupValue_Read carries no payload".to_string(),
            ));
        }

        let mut tpdu: Vec<u8> = Vec::with_capacity(2 + self.payload.len());
        let apci = self.apci.bits();
        match self.payload.as_slice() {
            // Six-bit values ride in the APCI octet itself
            [single] if *single <= 0x3F && self.apci != Apci::GroupValueRead => {
                tpdu.push((apci >> 8) as u8);
                tpdu.push((apci & 0xFF) as u8 | single);
            }
            [] => {
                tpdu.push((apci >> 8) as u8);
                tpdu.push((apci & 0xFF) as u8);
            }
            bytes => {
                tpdu.push((apci >> 8) as u8);
                tpdu.push((apci & 0xFF) as u8);
                tpdu.extend_from_slice(bytes);
            }
        }

        let body_len = 2 + 2 + 2 + tpdu.len(); // msg code + src + dst + tpdu
        let mut frame = Vec::with_capacity(2 + body_len);
        frame.extend_from_slice(&(body_len as u16).to_be_bytes());
        frame.extend_from_slice(&MSG_GROUP_PACKET.to_be_bytes());
        frame.extend_from_slice(&self.source.raw().to_be_bytes());
        frame.extend_from_slice(&self.destination.raw().to_be_bytes());
        frame.extend_from_slice(&tpdu);
        Ok(frame)
    }

    /// Decode a frame body (after the length prefix has been consumed)
    pub fn decode(body: &[u8]) -> Result<Self, Error> {
        if body.len() < 8 {
            return Err(Error::Validation(format!(
                "telegram body too short: {} bytes",
                body.len()
            )));
        }
        let code = u16::from_be_bytes([body[0], body[1]]);
        if code != MSG_GROUP_PACKET {
            return Err(Error::Validation(format!(
                "unexpected message code {code:#06x}"
            )));
        }
        let source = IndividualAddress::from_raw(u16::from_be_bytes([body[2], body[3]]));
        let destination = GroupAddress::from_raw(u16::from_be_bytes([body[4], body[5]]));
        let tpdu = &body[6..];
        let apci_raw = u16::from_be_bytes([tpdu[0], tpdu[1]]);
        let apci = Apci::from_bits(apci_raw)?;

        // A read never carries a value; do not attempt to extract one.
        let payload = if apci == Apci::GroupValueRead {
            Vec::new()
        } else if tpdu.len() > 2 {
            tpdu[2..].to_vec()
        } else {
            vec![(apci_raw & 0x003F) as u8]
        };

        Ok(Self {
            source,
            destination,
            apci,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ga(s: &str) -> GroupAddress {
        s.parse().unwrap()
    }

    #[test]
    fn write_small_value_round_trip() {
        let telegram = Telegram::write(ga("1/2/3"), vec![0x01]);
        let frame = telegram.encode().unwrap();
        // Length prefix covers the body exactly
        let len = u16::from_be_bytes([frame[0], frame[1]]) as usize;
        assert_eq!(len, frame.len() - 2);

        let decoded = Telegram::decode(&frame[2..]).unwrap();
        assert_eq!(decoded.destination, ga("1/2/3"));
        assert_eq!(decoded.apci, Apci::GroupValueWrite);
        assert_eq!(decoded.payload, vec![0x01]);
    }

    #[test]
    fn write_large_value_round_trip() {
        // 0xBF does not fit in six bits and must follow as a whole octet
        let telegram = Telegram::write(ga("1/2/4"), vec![0xBF]);
        let frame = telegram.encode().unwrap();
        let decoded = Telegram::decode(&frame[2..]).unwrap();
        assert_eq!(decoded.payload, vec![0xBF]);
        assert_eq!(decoded.apci, Apci::GroupValueWrite);
    }

    #[test]
    fn multi_byte_payload_round_trip() {
        let telegram = Telegram::write(ga("4/0/1"), vec![0x0C, 0x1A]);
        let frame = telegram.encode().unwrap();
        let decoded = Telegram::decode(&frame[2..]).unwrap();
        assert_eq!(decoded.payload, vec![0x0C, 0x1A]);
    }

    #[test]
    fn read_has_no_payload() {
        let telegram = Telegram::read(ga("2/2/2"));
        let frame = telegram.encode().unwrap();
        let decoded = Telegram::decode(&frame[2..]).unwrap();
        assert_eq!(decoded.apci, Apci::GroupValueRead);
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn read_with_payload_is_rejected() {
        let telegram = Telegram {
            source: IndividualAddress::from_raw(0),
            destination: ga("2/2/2"),
            apci: Apci::GroupValueRead,
            payload: vec![1],
        };
        assert!(telegram.encode().is_err());
    }

    #[test]
    fn response_round_trip() {
        let telegram = Telegram {
            source: "1.1.5".parse().unwrap(),
            destination: ga("3/1/0"),
            apci: Apci::GroupValueResponse,
            payload: vec![0x00],
        };
        let frame = telegram.encode().unwrap();
        let decoded = Telegram::decode(&frame[2..]).unwrap();
        assert_eq!(decoded.apci, Apci::GroupValueResponse);
        assert_eq!(decoded.source, "1.1.5".parse().unwrap());
        assert_eq!(decoded.payload, vec![0x00]);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(Telegram::decode(&[0x00]).is_err());
        assert!(Telegram::decode(&[0xFF, 0xFF, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
