//! Registry entity types
//!
//! These mirror the SQLite schema. Device state is a flat map of string keys
//! to JSON scalars; function maps bind state keys to group addresses.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::knx::address::GroupAddress;
use crate::knx::dpt::Dpt;

/// Installation singleton
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Site {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub timezone: Option<String>,
    pub elevation_m: Option<f64>,
    pub current_mode: String,
    pub available_modes: Vec<String>,
    pub settings: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Top-level location grouping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Area {
    pub id: String,
    pub site_id: String,
    pub name: String,
    pub slug: String,
    pub sort_order: i64,
}

/// Leaf location; may reference climate and audio zones
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub area_id: String,
    pub name: String,
    pub slug: String,
    pub climate_zone_id: Option<String>,
    pub audio_zone_id: Option<String>,
    pub sort_order: i64,
}

/// Per-domain room grouping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InfrastructureZone {
    pub id: String,
    pub site_id: String,
    pub domain: Domain,
    pub name: String,
    pub slug: String,
}

/// Functional domain of a device or zone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Lighting,
    Climate,
    Audio,
    Security,
    Energy,
    Shading,
    Other,
}

impl Domain {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Lighting => "lighting",
            Self::Climate => "climate",
            Self::Audio => "audio",
            Self::Security => "security",
            Self::Energy => "energy",
            Self::Shading => "shading",
            Self::Other => "other",
        }
    }
}

impl FromStr for Domain {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lighting" => Ok(Self::Lighting),
            "climate" => Ok(Self::Climate),
            "audio" => Ok(Self::Audio),
            "security" => Ok(Self::Security),
            "energy" => Ok(Self::Energy),
            "shading" => Ok(Self::Shading),
            "other" => Ok(Self::Other),
            other => Err(Error::Validation(format!("unknown domain '{other}'"))),
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Light,
    DimmableLight,
    Blind,
    Sensor,
    Thermostat,
    Outlet,
    AudioZone,
    Other,
}

impl DeviceType {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Light => "light",
            Self::DimmableLight => "dimmable_light",
            Self::Blind => "blind",
            Self::Sensor => "sensor",
            Self::Thermostat => "thermostat",
            Self::Outlet => "outlet",
            Self::AudioZone => "audio_zone",
            Self::Other => "other",
        }
    }
}

impl FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "light" => Ok(Self::Light),
            "dimmable_light" => Ok(Self::DimmableLight),
            "blind" => Ok(Self::Blind),
            "sensor" => Ok(Self::Sensor),
            "thermostat" => Ok(Self::Thermostat),
            "outlet" => Ok(Self::Outlet),
            "audio_zone" => Ok(Self::AudioZone),
            "other" => Ok(Self::Other),
            other => Err(Error::Validation(format!("unknown device type '{other}'"))),
        }
    }
}

/// Field protocol a device speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Knx,
    Dali,
    Modbus,
}

impl Protocol {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Knx => "knx",
            Self::Dali => "dali",
            Self::Modbus => "modbus",
        }
    }
}

impl FromStr for Protocol {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "knx" => Ok(Self::Knx),
            "dali" => Ok(Self::Dali),
            "modbus" => Ok(Self::Modbus),
            other => Err(Error::Validation(format!("unknown protocol '{other}'"))),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device health derived from bus traffic and bridge state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Online,
    Offline,
    Degraded,
    Unknown,
}

impl HealthStatus {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Degraded => "degraded",
            Self::Unknown => "unknown",
        }
    }
}

impl FromStr for HealthStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(Self::Online),
            "offline" => Ok(Self::Offline),
            "degraded" => Ok(Self::Degraded),
            "unknown" => Ok(Self::Unknown),
            other => Err(Error::Validation(format!("unknown health status '{other}'"))),
        }
    }
}

/// Protocol binding for one device function
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFunction {
    /// Group address this function listens/talks on
    pub group_address: GroupAddress,
    /// Datapoint type; authoritative over the canonical registry default
    pub dpt: Option<Dpt>,
    /// Communication flags ("read"/"write"/"transmit")
    #[serde(default)]
    pub flags: Vec<String>,
}

/// The protocol-addressable leaf entity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub slug: String,
    /// Exactly one of room_id / area_id may be set
    pub room_id: Option<String>,
    pub area_id: Option<String>,
    pub device_type: DeviceType,
    pub domain: Domain,
    pub protocol: Protocol,
    /// Function name → protocol binding; authoritative for the bridge
    pub functions: HashMap<String, DeviceFunction>,
    pub capabilities: Vec<String>,
    pub config: serde_json::Map<String, serde_json::Value>,
    /// Current state: string key → JSON scalar
    pub state: serde_json::Map<String, serde_json::Value>,
    pub state_updated_at: Option<DateTime<Utc>>,
    pub health: HealthStatus,
    pub last_seen: Option<DateTime<Utc>>,
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Device {
    /// Enforce the room/area exclusivity invariant
    pub fn validate_placement(&self) -> Result<(), Error> {
        if self.room_id.is_some() && self.area_id.is_some() {
            return Err(Error::Validation(format!(
                "device '{}' sets both room_id and area_id",
                self.slug
            )));
        }
        Ok(())
    }
}

/// Membership rule set for dynamic groups
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GroupRules {
    /// Optional room/area scope
    #[serde(default)]
    pub room_ids: Vec<String>,
    #[serde(default)]
    pub domains: Vec<Domain>,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub exclude_tags: Vec<String>,
    #[serde(default)]
    pub device_types: Vec<DeviceType>,
}

impl GroupRules {
    /// Whether a device satisfies this rule set
    #[must_use]
    pub fn matches(&self, device: &Device) -> bool {
        if !self.room_ids.is_empty() {
            match &device.room_id {
                Some(room) if self.room_ids.contains(room) => {}
                _ => return false,
            }
        }
        if !self.domains.is_empty() && !self.domains.contains(&device.domain) {
            return false;
        }
        if !self
            .capabilities
            .iter()
            .all(|c| device.capabilities.contains(c))
        {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| device.tags.contains(t)) {
            return false;
        }
        if self.exclude_tags.iter().any(|t| device.tags.contains(t)) {
            return false;
        }
        if !self.device_types.is_empty() && !self.device_types.contains(&device.device_type) {
            return false;
        }
        true
    }
}

/// Static, dynamic, or hybrid device grouping
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceGroup {
    pub id: String,
    pub name: String,
    pub slug: String,
    /// Explicit members (static and hybrid groups)
    #[serde(default)]
    pub member_ids: Vec<String>,
    /// Filter rules (dynamic and hybrid groups)
    #[serde(default)]
    pub rules: Option<GroupRules>,
}

/// What a scene action targets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ActionTarget {
    Device { device_id: String },
    Group { group_id: String },
    RoomDomain { room_id: String, domain: Domain },
}

/// One step of a scene
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneAction {
    pub id: String,
    pub scene_id: String,
    pub target: ActionTarget,
    pub command: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub delay_ms: u64,
    pub fade_ms: u64,
    pub parallel: bool,
    pub continue_on_error: bool,
    pub sort_order: i64,
}

/// Ordered list of actions with UI metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub room_id: Option<String>,
    pub area_id: Option<String>,
    pub enabled: bool,
    /// 1–100
    pub priority: i64,
    pub icon: Option<String>,
    pub actions: Vec<SceneAction>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Passive discovery: a seen individual address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredIndividual {
    pub individual_address: String,
    pub last_seen: DateTime<Utc>,
    pub message_count: i64,
}

/// Passive discovery: a seen group address
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveredGroup {
    pub group_address: String,
    pub last_seen: DateTime<Utc>,
    pub message_count: i64,
    pub has_read_response: bool,
}

/// Append-only state snapshot row
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateHistoryEntry {
    pub id: i64,
    pub device_id: String,
    pub state: serde_json::Map<String, serde_json::Value>,
    pub source: StateSource,
    pub created_at: DateTime<Utc>,
}

/// Where a state change originated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StateSource {
    Mqtt,
    Command,
    Scene,
}

impl StateSource {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mqtt => "mqtt",
            Self::Command => "command",
            Self::Scene => "scene",
        }
    }
}

impl FromStr for StateSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mqtt" => Ok(Self::Mqtt),
            "command" => Ok(Self::Command),
            "scene" => Ok(Self::Scene),
            other => Err(Error::Validation(format!("unknown state source '{other}'"))),
        }
    }
}

/// Validate an entity slug: lowercase alphanumeric plus dash/underscore.
///
/// Slugs double as MQTT topic segments, so the rules match
/// [`crate::mqtt::topics::validate_segment`].
pub fn validate_slug(slug: &str) -> Result<(), Error> {
    if slug.is_empty() || slug.len() > 64 {
        return Err(Error::Validation(format!(
            "slug '{slug}' must be 1-64 characters"
        )));
    }
    if !slug
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
    {
        return Err(Error::Validation(format!(
            "slug '{slug}' may only contain lowercase alphanumerics, '-' and '_'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_device() -> Device {
        Device {
            id: "d1".into(),
            name: "Living Room Light".into(),
            slug: "light-living-01".into(),
            room_id: Some("room-a".into()),
            area_id: None,
            device_type: DeviceType::DimmableLight,
            domain: Domain::Lighting,
            protocol: Protocol::Knx,
            functions: HashMap::new(),
            capabilities: vec!["dim".into(), "switch".into()],
            config: serde_json::Map::new(),
            state: serde_json::Map::new(),
            state_updated_at: None,
            health: HealthStatus::Unknown,
            last_seen: None,
            tags: vec!["accent".into()],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn placement_exclusivity() {
        let mut device = sample_device();
        assert!(device.validate_placement().is_ok());
        device.area_id = Some("area-a".into());
        assert!(device.validate_placement().is_err());
    }

    #[test]
    fn slug_validation() {
        assert!(validate_slug("light-living-01").is_ok());
        assert!(validate_slug("a_b").is_ok());
        assert!(validate_slug("").is_err());
        assert!(validate_slug("Light").is_err());
        assert!(validate_slug("a b").is_err());
        assert!(validate_slug("a/b").is_err());
    }

    #[test]
    fn group_rules_match() {
        let device = sample_device();
        let mut rules = GroupRules {
            domains: vec![Domain::Lighting],
            ..Default::default()
        };
        assert!(rules.matches(&device));

        rules.tags = vec!["accent".into()];
        assert!(rules.matches(&device));

        rules.exclude_tags = vec!["accent".into()];
        assert!(!rules.matches(&device));

        let rules = GroupRules {
            room_ids: vec!["other-room".into()],
            ..Default::default()
        };
        assert!(!rules.matches(&device));

        let rules = GroupRules {
            device_types: vec![DeviceType::Sensor],
            ..Default::default()
        };
        assert!(!rules.matches(&device));
    }

    #[test]
    fn enum_round_trips() {
        for s in ["lighting", "climate", "audio"] {
            assert_eq!(Domain::from_str(s).unwrap().as_str(), s);
        }
        for s in ["online", "offline", "degraded", "unknown"] {
            assert_eq!(HealthStatus::from_str(s).unwrap().as_str(), s);
        }
        for s in ["mqtt", "command", "scene"] {
            assert_eq!(StateSource::from_str(s).unwrap().as_str(), s);
        }
    }

    #[test]
    fn action_target_serde() {
        let target = ActionTarget::RoomDomain {
            room_id: "r1".into(),
            domain: Domain::Lighting,
        };
        let json = serde_json::to_string(&target).unwrap();
        let back: ActionTarget = serde_json::from_str(&json).unwrap();
        assert_eq!(back, target);
    }
}
