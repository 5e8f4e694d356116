//! KNX datapoint type encode/decode
//!
//! Pure, allocation-light codec for the datapoint families the core speaks:
//! 1 (bool), 3 (dimming control), 5 (scaled 8-bit), 7 (u16), 9 (EIB float16),
//! 13 (i32), 14 (f32), 17/18 (scenes), 20 (HVAC mode), 232 (RGB).
//!
//! The float16 reserved pattern `0x7FFF` decodes to [`DptValue::Invalid`],
//! never to zero.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A datapoint type identifier, e.g. `5.001`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dpt {
    pub main: u16,
    pub sub: u16,
}

impl Dpt {
    pub const SWITCH: Dpt = Dpt { main: 1, sub: 1 };
    pub const DIMMING: Dpt = Dpt { main: 3, sub: 7 };
    pub const PERCENT: Dpt = Dpt { main: 5, sub: 1 };
    pub const ANGLE: Dpt = Dpt { main: 5, sub: 3 };
    pub const TEMPERATURE: Dpt = Dpt { main: 9, sub: 1 };
    pub const SCENE_NUMBER: Dpt = Dpt { main: 17, sub: 1 };
    pub const SCENE_CONTROL: Dpt = Dpt { main: 18, sub: 1 };
    pub const HVAC_MODE: Dpt = Dpt { main: 20, sub: 102 };
    pub const RGB: Dpt = Dpt { main: 232, sub: 600 };

    #[must_use]
    pub fn new(main: u16, sub: u16) -> Self {
        Self { main, sub }
    }
}

impl fmt::Display for Dpt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:03}", self.main, self.sub)
    }
}

impl FromStr for Dpt {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (main, sub) = s
            .split_once('.')
            .ok_or_else(|| Error::Validation(format!("DPT '{s}' is not main.sub")))?;
        let main = main
            .parse::<u16>()
            .map_err(|_| Error::Validation(format!("DPT main '{main}' invalid")))?;
        let sub = sub
            .parse::<u16>()
            .map_err(|_| Error::Validation(format!("DPT sub '{sub}' invalid")))?;
        Ok(Self { main, sub })
    }
}

impl Serialize for Dpt {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Dpt {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// A decoded datapoint value
#[derive(Debug, Clone, PartialEq)]
pub enum DptValue {
    Bool(bool),
    /// 4-bit dimming/blind control; step 0 means stop
    Control { control: bool, step: u8 },
    /// 0.0–100.0
    Percent(f64),
    /// 0.0–360.0
    Angle(f64),
    Unsigned(u16),
    Signed(i32),
    Float(f64),
    /// Scene number 1–64
    Scene(u8),
    /// Scene control: activate or learn scene 1–64
    SceneControl { learn: bool, scene: u8 },
    /// HVAC mode enumeration (0 auto, 1 comfort, 2 standby, 3 economy, 4 protection)
    HvacMode(u8),
    Rgb { r: u8, g: u8, b: u8 },
    /// Float16 reserved pattern: sensor reports invalid data
    Invalid,
}

impl DptValue {
    /// Convert to the JSON scalar used in device state maps.
    ///
    /// `Invalid` maps to JSON null so consumers can distinguish "no reading"
    /// from a real zero.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::json;
        match self {
            Self::Bool(b) => json!(b),
            Self::Control { control, step } => json!({ "control": control, "step": step }),
            Self::Percent(v) | Self::Angle(v) | Self::Float(v) => json!(v),
            Self::Unsigned(v) => json!(v),
            Self::Signed(v) => json!(v),
            Self::Scene(v) | Self::HvacMode(v) => json!(v),
            Self::SceneControl { learn, scene } => json!({ "learn": learn, "scene": scene }),
            Self::Rgb { r, g, b } => json!({ "r": r, "g": g, "b": b }),
            Self::Invalid => serde_json::Value::Null,
        }
    }

    /// Interpret a JSON command parameter as a value for the given DPT
    pub fn from_json(dpt: Dpt, value: &serde_json::Value) -> Result<Self, Error> {
        let num = |v: &serde_json::Value| {
            v.as_f64()
                .ok_or_else(|| Error::Validation(format!("expected number for DPT {dpt}")))
        };
        match dpt.main {
            1 => match value {
                serde_json::Value::Bool(b) => Ok(Self::Bool(*b)),
                v => Ok(Self::Bool(num(v)? != 0.0)),
            },
            3 => {
                let control = value
                    .get("control")
                    .and_then(|v| v.as_bool())
                    .ok_or_else(|| Error::Validation("dimming control requires 'control'".into()))?;
                let step = value.get("step").and_then(|v| v.as_u64()).unwrap_or(0) as u8;
                if step > 7 {
                    return Err(Error::Validation(format!("step {step} out of range 0-7")));
                }
                Ok(Self::Control { control, step })
            }
            5 if dpt.sub == 3 => Ok(Self::Angle(num(value)?)),
            5 => Ok(Self::Percent(num(value)?)),
            7 => Ok(Self::Unsigned(num(value)? as u16)),
            9 => Ok(Self::Float(num(value)?)),
            13 => Ok(Self::Signed(num(value)? as i32)),
            14 => Ok(Self::Float(num(value)?)),
            17 => Ok(Self::Scene(num(value)? as u8)),
            18 => {
                let learn = value.get("learn").and_then(|v| v.as_bool()).unwrap_or(false);
                let scene = value
                    .get("scene")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| Error::Validation("scene control requires 'scene'".into()))?
                    as u8;
                Ok(Self::SceneControl { learn, scene })
            }
            20 => Ok(Self::HvacMode(num(value)? as u8)),
            232 => {
                let channel = |name: &str| {
                    value
                        .get(name)
                        .and_then(|v| v.as_u64())
                        .ok_or_else(|| Error::Validation(format!("rgb requires '{name}'")))
                        .map(|v| v as u8)
                };
                Ok(Self::Rgb {
                    r: channel("r")?,
                    g: channel("g")?,
                    b: channel("b")?,
                })
            }
            other => Err(Error::Validation(format!("unsupported DPT main {other}"))),
        }
    }
}

/// Round half to even, the rounding the 5.001 inverse uses
fn round_half_even(v: f64) -> f64 {
    let floor = v.floor();
    let diff = v - floor;
    if (diff - 0.5).abs() < f64::EPSILON {
        if (floor as i64) % 2 == 0 {
            floor
        } else {
            floor + 1.0
        }
    } else {
        v.round()
    }
}

/// Encode a value into DPT payload bytes
pub fn encode(dpt: Dpt, value: &DptValue) -> Result<Vec<u8>, Error> {
    let mismatch = || Error::Validation(format!("value {value:?} does not fit DPT {dpt}"));
    match (dpt.main, value) {
        (1, DptValue::Bool(b)) => Ok(vec![u8::from(*b)]),
        (3, DptValue::Control { control, step }) => {
            if *step > 7 {
                return Err(Error::Validation(format!("step {step} out of range 0-7")));
            }
            Ok(vec![(u8::from(*control) << 3) | step])
        }
        (5, DptValue::Percent(v)) if dpt.sub != 3 => {
            if !(0.0..=100.0).contains(v) {
                return Err(Error::Validation(format!("percent {v} out of range 0-100")));
            }
            Ok(vec![(v * 2.55).round() as u8])
        }
        (5, DptValue::Angle(v)) if dpt.sub == 3 => {
            if !(0.0..=360.0).contains(v) {
                return Err(Error::Validation(format!("angle {v} out of range 0-360")));
            }
            Ok(vec![(v * 255.0 / 360.0).round() as u8])
        }
        (7, DptValue::Unsigned(v)) => Ok(v.to_be_bytes().to_vec()),
        (9, DptValue::Float(v)) => {
            let raw = encode_f16(*v)?;
            Ok(raw.to_be_bytes().to_vec())
        }
        (13, DptValue::Signed(v)) => Ok(v.to_be_bytes().to_vec()),
        (14, DptValue::Float(v)) => Ok((*v as f32).to_be_bytes().to_vec()),
        (17, DptValue::Scene(scene)) => {
            if !(1..=64).contains(scene) {
                return Err(Error::Validation(format!("scene {scene} out of range 1-64")));
            }
            Ok(vec![scene - 1])
        }
        (18, DptValue::SceneControl { learn, scene }) => {
            if !(1..=64).contains(scene) {
                return Err(Error::Validation(format!("scene {scene} out of range 1-64")));
            }
            Ok(vec![(u8::from(*learn) << 7) | (scene - 1)])
        }
        (20, DptValue::HvacMode(mode)) => Ok(vec![*mode]),
        (232, DptValue::Rgb { r, g, b }) => Ok(vec![*r, *g, *b]),
        _ => Err(mismatch()),
    }
}

/// Decode DPT payload bytes into a value
pub fn decode(dpt: Dpt, bytes: &[u8]) -> Result<DptValue, Error> {
    let short = || Error::Validation(format!("DPT {dpt} payload too short: {} bytes", bytes.len()));
    match dpt.main {
        1 => {
            let b = bytes.first().ok_or_else(short)?;
            Ok(DptValue::Bool(b & 0x01 != 0))
        }
        3 => {
            let b = bytes.first().ok_or_else(short)?;
            Ok(DptValue::Control {
                control: b & 0x08 != 0,
                step: b & 0x07,
            })
        }
        5 if dpt.sub == 3 => {
            let b = *bytes.first().ok_or_else(short)?;
            Ok(DptValue::Angle(round_half_even(b as f64 * 360.0 / 255.0 * 10.0) / 10.0))
        }
        5 => {
            let b = *bytes.first().ok_or_else(short)?;
            Ok(DptValue::Percent(round_half_even(b as f64 / 2.55 * 10.0) / 10.0))
        }
        7 => {
            let raw: [u8; 2] = bytes.get(..2).ok_or_else(short)?.try_into().map_err(|_| short())?;
            Ok(DptValue::Unsigned(u16::from_be_bytes(raw)))
        }
        9 => {
            let raw: [u8; 2] = bytes.get(..2).ok_or_else(short)?.try_into().map_err(|_| short())?;
            Ok(decode_f16(u16::from_be_bytes(raw)))
        }
        13 => {
            let raw: [u8; 4] = bytes.get(..4).ok_or_else(short)?.try_into().map_err(|_| short())?;
            Ok(DptValue::Signed(i32::from_be_bytes(raw)))
        }
        14 => {
            let raw: [u8; 4] = bytes.get(..4).ok_or_else(short)?.try_into().map_err(|_| short())?;
            Ok(DptValue::Float(f32::from_be_bytes(raw) as f64))
        }
        17 => {
            let b = bytes.first().ok_or_else(short)?;
            Ok(DptValue::Scene((b & 0x3F) + 1))
        }
        18 => {
            let b = bytes.first().ok_or_else(short)?;
            Ok(DptValue::SceneControl {
                learn: b & 0x80 != 0,
                scene: (b & 0x3F) + 1,
            })
        }
        20 => {
            let b = bytes.first().ok_or_else(short)?;
            Ok(DptValue::HvacMode(*b))
        }
        232 => {
            let raw = bytes.get(..3).ok_or_else(short)?;
            Ok(DptValue::Rgb {
                r: raw[0],
                g: raw[1],
                b: raw[2],
            })
        }
        other => Err(Error::Validation(format!("unsupported DPT main {other}"))),
    }
}

/// Reserved float16 pattern signalling invalid data (exp=15, mantissa=0x7FF)
const F16_INVALID: u16 = 0x7FFF;

fn encode_f16(value: f64) -> Result<u16, Error> {
    if !value.is_finite() {
        return Err(Error::Validation(format!("float16 cannot encode {value}")));
    }
    let mut scaled = (value * 100.0).round();
    let mut exp: u16 = 0;
    while scaled.round() > 2047.0 || scaled.round() < -2048.0 {
        scaled /= 2.0;
        exp += 1;
        if exp > 15 {
            return Err(Error::Validation(format!("{value} out of float16 range")));
        }
    }
    let mantissa = scaled.round() as i32;
    let sign = if mantissa < 0 { 0x8000u16 } else { 0 };
    let raw = sign | (exp << 11) | ((mantissa & 0x07FF) as u16);
    // The reserved pattern would be misread as invalid data downstream
    if raw == F16_INVALID {
        return Err(Error::Validation(format!("{value} encodes to reserved pattern")));
    }
    Ok(raw)
}

fn decode_f16(raw: u16) -> DptValue {
    if raw == F16_INVALID {
        return DptValue::Invalid;
    }
    let exp = ((raw >> 11) & 0x0F) as i32;
    let mut mantissa = (raw & 0x07FF) as i32;
    if raw & 0x8000 != 0 {
        mantissa -= 2048;
    }
    DptValue::Float(0.01 * mantissa as f64 * f64::powi(2.0, exp))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dpt_id_round_trip() {
        let dpt: Dpt = "5.001".parse().unwrap();
        assert_eq!(dpt, Dpt::PERCENT);
        assert_eq!(dpt.to_string(), "5.001");
        assert_eq!("20.102".parse::<Dpt>().unwrap(), Dpt::HVAC_MODE);
    }

    #[test]
    fn bool_round_trip() {
        for v in [true, false] {
            let bytes = encode(Dpt::SWITCH, &DptValue::Bool(v)).unwrap();
            assert_eq!(decode(Dpt::SWITCH, &bytes).unwrap(), DptValue::Bool(v));
        }
    }

    #[test]
    fn dimming_control_round_trip() {
        for control in [true, false] {
            for step in 0..=7u8 {
                let value = DptValue::Control { control, step };
                let bytes = encode(Dpt::DIMMING, &value).unwrap();
                assert_eq!(decode(Dpt::DIMMING, &bytes).unwrap(), value);
            }
        }
    }

    #[test]
    fn percent_75_encodes_to_0xbf() {
        let bytes = encode(Dpt::PERCENT, &DptValue::Percent(75.0)).unwrap();
        assert_eq!(bytes, vec![0xBF]);
        // The scaled byte only resolves to within one percent point
        match decode(Dpt::PERCENT, &bytes).unwrap() {
            DptValue::Percent(v) => assert!((v - 75.0).abs() <= 1.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn percent_bounds() {
        assert_eq!(encode(Dpt::PERCENT, &DptValue::Percent(0.0)).unwrap(), vec![0]);
        assert_eq!(encode(Dpt::PERCENT, &DptValue::Percent(100.0)).unwrap(), vec![255]);
        assert!(encode(Dpt::PERCENT, &DptValue::Percent(101.0)).is_err());
    }

    #[test]
    fn angle_round_trip() {
        let bytes = encode(Dpt::ANGLE, &DptValue::Angle(180.0)).unwrap();
        assert_eq!(bytes, vec![128]);
        match decode(Dpt::ANGLE, &bytes).unwrap() {
            DptValue::Angle(v) => assert!((v - 180.0).abs() <= 1.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unsigned16_is_big_endian() {
        let bytes = encode(Dpt::new(7, 1), &DptValue::Unsigned(0x1234)).unwrap();
        assert_eq!(bytes, vec![0x12, 0x34]);
        assert_eq!(decode(Dpt::new(7, 1), &bytes).unwrap(), DptValue::Unsigned(0x1234));
    }

    #[test]
    fn float16_round_trip_within_precision() {
        for v in [0.0, 21.5, -10.0, 670433.28, -671088.64, 0.01, -0.01, 100.37] {
            let bytes = encode(Dpt::TEMPERATURE, &DptValue::Float(v)).unwrap();
            match decode(Dpt::TEMPERATURE, &bytes).unwrap() {
                DptValue::Float(back) => {
                    let tolerance = (v.abs() * 0.001).max(0.01);
                    assert!((back - v).abs() <= tolerance, "{v} decoded to {back}");
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn float16_invalid_sentinel() {
        assert_eq!(decode(Dpt::TEMPERATURE, &[0x7F, 0xFF]).unwrap(), DptValue::Invalid);
        // And it is not silently zero
        assert_ne!(decode(Dpt::TEMPERATURE, &[0x7F, 0xFF]).unwrap(), DptValue::Float(0.0));
    }

    #[test]
    fn signed32_and_float32_round_trip() {
        let bytes = encode(Dpt::new(13, 1), &DptValue::Signed(-123456)).unwrap();
        assert_eq!(decode(Dpt::new(13, 1), &bytes).unwrap(), DptValue::Signed(-123456));

        let bytes = encode(Dpt::new(14, 56), &DptValue::Float(3.25)).unwrap();
        assert_eq!(decode(Dpt::new(14, 56), &bytes).unwrap(), DptValue::Float(3.25));
    }

    #[test]
    fn scene_number_offset() {
        let bytes = encode(Dpt::SCENE_NUMBER, &DptValue::Scene(1)).unwrap();
        assert_eq!(bytes, vec![0]);
        assert_eq!(decode(Dpt::SCENE_NUMBER, &bytes).unwrap(), DptValue::Scene(1));

        let bytes = encode(Dpt::SCENE_NUMBER, &DptValue::Scene(64)).unwrap();
        assert_eq!(bytes, vec![63]);
        assert!(encode(Dpt::SCENE_NUMBER, &DptValue::Scene(0)).is_err());
        assert!(encode(Dpt::SCENE_NUMBER, &DptValue::Scene(65)).is_err());
    }

    #[test]
    fn scene_control_learn_flag() {
        let value = DptValue::SceneControl { learn: true, scene: 12 };
        let bytes = encode(Dpt::SCENE_CONTROL, &value).unwrap();
        assert_eq!(bytes, vec![0x80 | 11]);
        assert_eq!(decode(Dpt::SCENE_CONTROL, &bytes).unwrap(), value);
    }

    #[test]
    fn rgb_round_trip() {
        let value = DptValue::Rgb { r: 255, g: 128, b: 0 };
        let bytes = encode(Dpt::RGB, &value).unwrap();
        assert_eq!(bytes, vec![255, 128, 0]);
        assert_eq!(decode(Dpt::RGB, &bytes).unwrap(), value);
    }

    #[test]
    fn hvac_mode_round_trip() {
        for mode in 0..=4u8 {
            let bytes = encode(Dpt::HVAC_MODE, &DptValue::HvacMode(mode)).unwrap();
            assert_eq!(decode(Dpt::HVAC_MODE, &bytes).unwrap(), DptValue::HvacMode(mode));
        }
    }

    #[test]
    fn short_payloads_are_rejected() {
        assert!(decode(Dpt::TEMPERATURE, &[0x0C]).is_err());
        assert!(decode(Dpt::new(13, 1), &[0, 0]).is_err());
        assert!(decode(Dpt::RGB, &[1, 2]).is_err());
        assert!(decode(Dpt::SWITCH, &[]).is_err());
    }

    #[test]
    fn json_command_values() {
        let v = DptValue::from_json(Dpt::PERCENT, &serde_json::json!(75)).unwrap();
        assert_eq!(v, DptValue::Percent(75.0));

        let v = DptValue::from_json(Dpt::SWITCH, &serde_json::json!(true)).unwrap();
        assert_eq!(v, DptValue::Bool(true));

        let v = DptValue::from_json(
            Dpt::RGB,
            &serde_json::json!({"r": 1, "g": 2, "b": 3}),
        )
        .unwrap();
        assert_eq!(v, DptValue::Rgb { r: 1, g: 2, b: 3 });
    }

    #[test]
    fn invalid_maps_to_json_null() {
        assert_eq!(DptValue::Invalid.to_json(), serde_json::Value::Null);
    }
}
