//! MQTT topic scheme
//!
//! All topic construction goes through this module; handlers never
//! concatenate topic strings themselves. The scheme is flat:
//!
//! - `graylogic/command/{protocol}/{device_id}`
//! - `graylogic/state/{protocol}/{device_id}`
//! - `graylogic/health/{protocol}` (and `graylogic/health/core`)
//! - `graylogic/core/scene/{scene_id}/activated`
//!
//! Every topic this module emits parses back to the same triple, and segment
//! validation rejects MQTT wildcards, separators and NUL.

use std::fmt;

use crate::error::Error;

const ROOT: &str = "graylogic";

/// A parsed topic in the Gray Logic namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    /// Inbound command for a bridge
    Command { protocol: String, device_id: String },
    /// Outbound device state snapshot
    State { protocol: String, device_id: String },
    /// Retained per-protocol bridge heartbeat
    Health { protocol: String },
    /// Retained core heartbeat / LWT target
    CoreHealth,
    /// Scene activation announcement
    SceneActivated { scene_id: String },
}

/// Validate a single topic segment: no wildcards, separators, or NUL, and
/// slug characters only (lowercase alphanumeric, dash, underscore).
pub fn validate_segment(segment: &str) -> Result<(), Error> {
    if segment.is_empty() {
        return Err(Error::Validation("empty topic segment".to_string()));
    }
    for c in segment.chars() {
        match c {
            '+' | '#' | '/' | '\0' => {
                return Err(Error::Validation(format!(
                    "topic segment '{segment}' contains reserved character '{}'",
                    c.escape_default()
                )))
            }
            'a'..='z' | '0'..='9' | '-' | '_' => {}
            other => {
                return Err(Error::Validation(format!(
                    "topic segment '{segment}' contains invalid character '{other}'"
                )))
            }
        }
    }
    Ok(())
}

impl Topic {
    /// Build a command topic
    pub fn command(protocol: &str, device_id: &str) -> Result<Self, Error> {
        validate_segment(protocol)?;
        validate_segment(device_id)?;
        Ok(Self::Command {
            protocol: protocol.to_string(),
            device_id: device_id.to_string(),
        })
    }

    /// Build a state topic
    pub fn state(protocol: &str, device_id: &str) -> Result<Self, Error> {
        validate_segment(protocol)?;
        validate_segment(device_id)?;
        Ok(Self::State {
            protocol: protocol.to_string(),
            device_id: device_id.to_string(),
        })
    }

    /// Build a bridge health topic
    pub fn health(protocol: &str) -> Result<Self, Error> {
        validate_segment(protocol)?;
        Ok(Self::Health {
            protocol: protocol.to_string(),
        })
    }

    /// Build a scene activation topic
    pub fn scene_activated(scene_id: &str) -> Result<Self, Error> {
        validate_segment(scene_id)?;
        Ok(Self::SceneActivated {
            scene_id: scene_id.to_string(),
        })
    }

    /// Parse a published topic back into its structured form
    pub fn parse(topic: &str) -> Result<Self, Error> {
        let segments: Vec<&str> = topic.split('/').collect();
        match segments.as_slice() {
            [ROOT, "command", protocol, device_id] => Self::command(protocol, device_id),
            [ROOT, "state", protocol, device_id] => Self::state(protocol, device_id),
            [ROOT, "health", "core"] => Ok(Self::CoreHealth),
            [ROOT, "health", protocol] => Self::health(protocol),
            [ROOT, "core", "scene", scene_id, "activated"] => Self::scene_activated(scene_id),
            _ => Err(Error::Validation(format!("unrecognized topic '{topic}'"))),
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command { protocol, device_id } => {
                write!(f, "{ROOT}/command/{protocol}/{device_id}")
            }
            Self::State { protocol, device_id } => {
                write!(f, "{ROOT}/state/{protocol}/{device_id}")
            }
            Self::Health { protocol } => write!(f, "{ROOT}/health/{protocol}"),
            Self::CoreHealth => write!(f, "{ROOT}/health/core"),
            Self::SceneActivated { scene_id } => {
                write!(f, "{ROOT}/core/scene/{scene_id}/activated")
            }
        }
    }
}

/// Subscription filter for all state topics of one protocol
#[must_use]
pub fn state_filter(protocol: &str) -> String {
    format!("{ROOT}/state/{protocol}/+")
}

/// Subscription filter for all command topics of one protocol
#[must_use]
pub fn command_filter(protocol: &str) -> String {
    format!("{ROOT}/command/{protocol}/+")
}

/// Match a single-level-wildcard filter against a concrete topic.
///
/// Supports `+` only; the core never subscribes with `#`.
#[must_use]
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_parts = filter.split('/');
    let mut topic_parts = topic.split('/');
    loop {
        match (filter_parts.next(), topic_parts.next()) {
            (None, None) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_round_trip() {
        let cases = [
            Topic::command("knx", "light-living-01").unwrap(),
            Topic::state("knx", "sensor_7").unwrap(),
            Topic::health("knx").unwrap(),
            Topic::CoreHealth,
            Topic::scene_activated("evening").unwrap(),
        ];
        for topic in cases {
            let rendered = topic.to_string();
            assert_eq!(Topic::parse(&rendered).unwrap(), topic, "{rendered}");
        }
    }

    #[test]
    fn wildcards_are_rejected() {
        assert!(Topic::command("knx", "light+1").is_err());
        assert!(Topic::command("knx", "light#").is_err());
        assert!(Topic::command("knx", "light/1").is_err());
        assert!(Topic::command("knx", "light\01").is_err());
        assert!(Topic::state("knx", "").is_err());
    }

    #[test]
    fn uppercase_is_rejected() {
        assert!(Topic::command("knx", "Light-1").is_err());
    }

    #[test]
    fn core_health_is_not_a_protocol() {
        assert_eq!(Topic::parse("graylogic/health/core").unwrap(), Topic::CoreHealth);
        assert_eq!(
            Topic::parse("graylogic/health/knx").unwrap(),
            Topic::health("knx").unwrap()
        );
    }

    #[test]
    fn foreign_topics_are_rejected()  {
        assert!(Topic::parse("other/state/knx/dev").is_err());
        assert!(Topic::parse("graylogic/state/knx").is_err());
        assert!(Topic::parse("graylogic/state/knx/a/b").is_err());
    }

    #[test]
    fn filter_matching() {
        assert!(filter_matches("graylogic/state/knx/+", "graylogic/state/knx/light-1"));
        assert!(!filter_matches("graylogic/state/knx/+", "graylogic/state/knx/light-1/x"));
        assert!(!filter_matches("graylogic/state/knx/+", "graylogic/command/knx/light-1"));
        assert!(filter_matches("graylogic/health/core", "graylogic/health/core"));
    }
}
