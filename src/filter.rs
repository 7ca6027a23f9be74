// Discovery filter
//
// Predicate over the advertised name, MAC address or UUID of a peripheral.
// A scan without a filter matches everything.

use crate::ble_common::Advertisement;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FilterType {
    /// Advertised local name starts with the value.
    #[default]
    DeviceName,
    /// Bluetooth address starts with the value (separators and case ignored).
    Mac,
    /// Peripheral identifier or an advertised service UUID equals the value.
    Uuid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryFilter {
    pub filter_type: FilterType,
    pub value: String,
}

impl DiscoveryFilter {
    pub fn new(filter_type: FilterType, value: impl Into<String>) -> Self {
        Self {
            filter_type,
            value: value.into(),
        }
    }

    pub fn name_prefix(prefix: impl Into<String>) -> Self {
        Self::new(FilterType::DeviceName, prefix)
    }

    /// Build from optional user input; a blank value means "no filter".
    pub fn from_input(filter_type: FilterType, value: Option<&str>) -> Option<Self> {
        value
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Self::new(filter_type, v))
    }

    pub fn matches(&self, adv: &Advertisement) -> bool {
        match self.filter_type {
            FilterType::DeviceName => adv
                .local_name
                .as_deref()
                .is_some_and(|name| name.starts_with(&self.value)),
            FilterType::Mac => {
                let wanted = normalize_mac(&self.value);
                !wanted.is_empty()
                    && adv
                        .address
                        .as_deref()
                        .is_some_and(|addr| normalize_mac(addr).starts_with(&wanted))
            }
            FilterType::Uuid => {
                if adv.peripheral_id.eq_ignore_ascii_case(self.value.trim()) {
                    return true;
                }
                match Uuid::parse_str(self.value.trim()) {
                    Ok(uuid) => adv.services.contains(&uuid),
                    Err(_) => false,
                }
            }
        }
    }
}

/// Apply an optional filter.
pub fn accepts(filter: Option<&DiscoveryFilter>, adv: &Advertisement) -> bool {
    filter.map_or(true, |f| f.matches(adv))
}

/// Resolve a caller-supplied timeout, treating `None` and zero as `default`.
pub fn effective_timeout(timeout: Option<Duration>, default: Duration) -> Duration {
    match timeout {
        Some(t) if !t.is_zero() => t,
        _ => default,
    }
}

fn normalize_mac(s: &str) -> String {
    s.chars()
        .filter(|c| c.is_ascii_hexdigit())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}
