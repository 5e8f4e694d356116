//! Canonical device-function registry
//!
//! Maps normalized function names ("switch", "brightness", "co2", ...) to a
//! default datapoint type and default communication flags. Lookup is
//! case-insensitive, resolves aliases, and strips channel prefixes such as
//! `Ch_A_Switch`. The table itself is never mutated; flag slices are returned
//! as fresh clones so callers cannot reach back into it.

use once_cell::sync::Lazy;
use std::collections::HashMap;

use crate::knx::dpt::Dpt;

/// Communication flags a function's group object carries
pub const FLAG_READ: &str = "read";
pub const FLAG_WRITE: &str = "write";
pub const FLAG_TRANSMIT: &str = "transmit";

/// Default binding for a canonical function name
#[derive(Debug, Clone)]
pub struct FunctionDefaults {
    /// Canonical function name
    pub name: &'static str,
    /// Default datapoint type
    pub dpt: Dpt,
    /// Default communication flags
    flags: &'static [&'static str],
}

impl FunctionDefaults {
    /// Default flags, cloned defensively
    #[must_use]
    pub fn flags(&self) -> Vec<String> {
        self.flags.iter().map(|f| (*f).to_string()).collect()
    }
}

const RW_T: &[&str] = &[FLAG_READ, FLAG_WRITE, FLAG_TRANSMIT];
const W: &[&str] = &[FLAG_WRITE];
const R_T: &[&str] = &[FLAG_READ, FLAG_TRANSMIT];

static CANONICAL: Lazy<HashMap<&'static str, FunctionDefaults>> = Lazy::new(|| {
    let entries: &[(&str, Dpt, &'static [&'static str])] = &[
        ("switch", Dpt::new(1, 1), RW_T),
        ("switch_status", Dpt::new(1, 1), R_T),
        ("dimming", Dpt::new(3, 7), W),
        ("brightness", Dpt::new(5, 1), RW_T),
        ("brightness_status", Dpt::new(5, 1), R_T),
        ("position", Dpt::new(5, 1), RW_T),
        ("position_status", Dpt::new(5, 1), R_T),
        ("slat_angle", Dpt::new(5, 3), RW_T),
        ("color_temperature", Dpt::new(7, 600), RW_T),
        ("color", Dpt::new(232, 600), RW_T),
        ("temperature", Dpt::new(9, 1), R_T),
        ("setpoint", Dpt::new(9, 1), RW_T),
        ("humidity", Dpt::new(9, 7), R_T),
        ("co2", Dpt::new(9, 8), R_T),
        ("illuminance", Dpt::new(9, 4), R_T),
        ("wind_speed", Dpt::new(9, 5), R_T),
        ("presence", Dpt::new(1, 18), R_T),
        ("occupancy", Dpt::new(1, 18), R_T),
        ("window_contact", Dpt::new(1, 19), R_T),
        ("energy", Dpt::new(13, 10), R_T),
        ("power", Dpt::new(14, 56), R_T),
        ("scene", Dpt::new(17, 1), W),
        ("scene_control", Dpt::new(18, 1), W),
        ("hvac_mode", Dpt::new(20, 102), RW_T),
        ("hvac_mode_status", Dpt::new(20, 102), R_T),
    ];

    entries
        .iter()
        .map(|&(name, dpt, flags)| (name, FunctionDefaults { name, dpt, flags }))
        .collect()
});

static ALIASES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    HashMap::from([
        ("on_off", "switch"),
        ("onoff", "switch"),
        ("state", "switch_status"),
        ("dim", "brightness"),
        ("level", "brightness"),
        ("dimming_value", "brightness"),
        ("shutter_position", "position"),
        ("blind_position", "position"),
        ("cct", "color_temperature"),
        ("colour_temperature", "color_temperature"),
        ("rgb", "color"),
        ("colour", "color"),
        ("temp", "temperature"),
        ("room_temperature", "temperature"),
        ("target_temperature", "setpoint"),
        ("motion", "presence"),
        ("pir", "presence"),
        ("co2_level", "co2"),
        ("lux", "illuminance"),
        ("operating_mode", "hvac_mode"),
    ])
});

/// Normalize a raw function name: lowercase, strip channel prefixes, resolve
/// aliases. `Ch_A_Switch` → `switch`; `Operating_Mode` → `hvac_mode`.
#[must_use]
pub fn normalize(raw: &str) -> String {
    let mut name = raw.trim().to_ascii_lowercase().replace([' ', '-'], "_");

    // Channel prefixes: ch_a_, ch_1_, channel_a_, ...
    for prefix in ["ch_", "channel_"] {
        if let Some(rest) = name.strip_prefix(prefix) {
            if let Some((channel, tail)) = rest.split_once('_') {
                if channel.len() <= 2 && !tail.is_empty() {
                    name = tail.to_string();
                }
            }
        }
    }

    match ALIASES.get(name.as_str()) {
        Some(canonical) => (*canonical).to_string(),
        None => name,
    }
}

/// Look up defaults for a function name after normalization
#[must_use]
pub fn lookup(raw: &str) -> Option<&'static FunctionDefaults> {
    CANONICAL.get(normalize(raw).as_str())
}

/// Last-resort DPT heuristic for unknown function names.
///
/// Matches exact canonical names first, then `_`-separated prefix/suffix
/// tokens of the normalized name. Substring matching of short tokens is
/// deliberately not done; "co" must not match "co2".
#[must_use]
pub fn guess_dpt(raw: &str) -> Option<Dpt> {
    let name = normalize(raw);
    if let Some(defaults) = CANONICAL.get(name.as_str()) {
        return Some(defaults.dpt);
    }

    // status suffix: "<base>_status" falls back to the base function
    if let Some(base) = name.strip_suffix("_status") {
        if let Some(defaults) = CANONICAL.get(base) {
            return Some(defaults.dpt);
        }
    }

    // Leading or trailing token match against canonical names
    let tokens: Vec<&str> = name.split('_').collect();
    if tokens.len() > 1 {
        for candidate in [tokens[0], tokens[tokens.len() - 1]] {
            if let Some(defaults) = CANONICAL.get(candidate) {
                return Some(defaults.dpt);
            }
        }
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_lookup() {
        let defaults = lookup("switch").unwrap();
        assert_eq!(defaults.dpt, Dpt::new(1, 1));
        assert_eq!(defaults.flags(), vec!["read", "write", "transmit"]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(lookup("Brightness").unwrap().name, "brightness");
        assert_eq!(lookup("CO2").unwrap().name, "co2");
    }

    #[test]
    fn channel_prefix_is_stripped() {
        assert_eq!(normalize("Ch_A_Switch"), "switch");
        assert_eq!(normalize("ch_1_brightness"), "brightness");
        assert_eq!(normalize("channel_b_dimming"), "dimming");
        // Not a channel prefix
        assert_eq!(normalize("chandelier_switch"), "chandelier_switch");
    }

    #[test]
    fn aliases_resolve() {
        assert_eq!(lookup("on_off").unwrap().name, "switch");
        assert_eq!(lookup("dim").unwrap().name, "brightness");
        assert_eq!(lookup("CCT").unwrap().name, "color_temperature");
        assert_eq!(lookup("motion").unwrap().name, "presence");
    }

    #[test]
    fn flags_are_fresh_clones() {
        let defaults = lookup("switch").unwrap();
        let mut flags = defaults.flags();
        flags.push("bogus".to_string());
        // The registry is unaffected
        assert_eq!(defaults.flags(), vec!["read", "write", "transmit"]);
    }

    #[test]
    fn guess_exact_and_affix() {
        assert_eq!(guess_dpt("switch"), Some(Dpt::new(1, 1)));
        assert_eq!(guess_dpt("kitchen_switch"), Some(Dpt::new(1, 1)));
        assert_eq!(guess_dpt("temperature_outside"), Some(Dpt::new(9, 1)));
        assert_eq!(guess_dpt("co2_status"), Some(Dpt::new(9, 8)));
    }

    #[test]
    fn guess_never_matches_substrings() {
        // "co" is not a token of the registry; must not resolve via "co2"
        assert_eq!(guess_dpt("co"), None);
        assert_eq!(guess_dpt("swit"), None);
    }

    #[test]
    fn unknown_names_yield_none() {
        assert!(lookup("frobnicator").is_none());
        assert!(guess_dpt("frobnicator_level_x").is_none());
    }
}
