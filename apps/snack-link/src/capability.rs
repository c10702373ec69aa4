//! Maps a runtime's declared version to the protocol features it supports.

use std::collections::{BTreeMap, BTreeSet};

use semver::Version;
use serde::Deserialize;
use thiserror::Error;

pub mod features {
    /// Dependency payloads carrying resolved bundle URLs instead of bare versions.
    pub const PROJECT_DEPENDENCIES: &str = "PROJECT_DEPENDENCIES";
    /// Runtime accepts payloads relayed over the direct postMessage channel.
    pub const POSTMESSAGE_TRANSPORT: &str = "POSTMESSAGE_TRANSPORT";
    /// Runtime tears itself down when it receives a `stop` message.
    pub const STOP_MESSAGE: &str = "STOP_MESSAGE";
    /// Code payloads may carry base64 asset files next to source files.
    pub const BINARY_CODE_PAYLOAD: &str = "BINARY_CODE_PAYLOAD";
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CapabilityError {
    #[error("invalid capability version `{0}`")]
    InvalidVersion(String),
    #[error("failed to parse capability table: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
struct Row {
    #[serde(default)]
    add: BTreeSet<String>,
    #[serde(default)]
    remove: BTreeSet<String>,
}

/// Version rows applied in ascending order: each row adds features and may
/// explicitly withdraw features granted by an older row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityTable {
    rows: BTreeMap<Version, Row>,
}

impl CapabilityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feature rows for the runtimes the session layer knows how to talk to.
    pub fn builtin() -> Self {
        let mut table = Self::new();
        table.insert(Version::new(33, 0, 0), features::STOP_MESSAGE);
        table.insert(Version::new(35, 0, 0), features::POSTMESSAGE_TRANSPORT);
        table.insert(Version::new(37, 0, 0), features::PROJECT_DEPENDENCIES);
        table.insert(Version::new(39, 0, 0), features::BINARY_CODE_PAYLOAD);
        table
    }

    /// Parses `{ "<version>": { "add": [...], "remove": [...] } }`.
    pub fn from_json(raw: &str) -> Result<Self, CapabilityError> {
        let parsed: BTreeMap<String, Row> =
            serde_json::from_str(raw).map_err(|err| CapabilityError::Parse(err.to_string()))?;
        let mut rows = BTreeMap::new();
        for (version, row) in parsed {
            let version =
                parse_version(&version).ok_or(CapabilityError::InvalidVersion(version))?;
            rows.insert(version, row);
        }
        Ok(Self { rows })
    }

    pub fn with_feature(mut self, version: &str, feature: &str) -> Result<Self, CapabilityError> {
        let version =
            parse_version(version).ok_or_else(|| CapabilityError::InvalidVersion(version.into()))?;
        self.insert(version, feature);
        Ok(self)
    }

    /// Withdraws `feature` from `version` onwards until a newer row adds it again.
    pub fn with_override(mut self, version: &str, feature: &str) -> Result<Self, CapabilityError> {
        let version =
            parse_version(version).ok_or_else(|| CapabilityError::InvalidVersion(version.into()))?;
        self.rows
            .entry(version)
            .or_default()
            .remove
            .insert(feature.to_string());
        Ok(self)
    }

    fn insert(&mut self, version: Version, feature: &str) {
        self.rows
            .entry(version)
            .or_default()
            .add
            .insert(feature.to_string());
    }

    pub fn versions(&self) -> impl Iterator<Item = &Version> + '_ {
        self.rows.keys()
    }

    /// Unknown or unparseable versions support no optional features.
    pub fn get_feature_set(&self, version: &str) -> BTreeSet<String> {
        let Some(version) = parse_version(version) else {
            return BTreeSet::new();
        };
        let mut features = BTreeSet::new();
        for (_, row) in self.rows.range(..=version) {
            features.extend(row.add.iter().cloned());
            for removed in &row.remove {
                features.remove(removed);
            }
        }
        features
    }

    pub fn is_feature_supported(&self, version: &str, feature: &str) -> bool {
        self.get_feature_set(version).contains(feature)
    }
}

/// Accepts full semver plus the short `40` / `40.1` forms runtimes sometimes
/// report.
pub fn parse_version(raw: &str) -> Option<Version> {
    let raw = raw.trim();
    if let Ok(version) = Version::parse(raw) {
        return Some(version);
    }
    let parts: Vec<&str> = raw.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        *slot = part.parse().ok()?;
    }
    Some(Version::new(numbers[0], numbers[1], numbers[2]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use features::*;

    #[test]
    fn unknown_versions_fail_safe() {
        let table = CapabilityTable::builtin();
        assert!(table.get_feature_set("not-a-version").is_empty());
        assert!(table.get_feature_set("").is_empty());
        assert!(table.get_feature_set("20.0.0").is_empty());
    }

    #[test]
    fn postmessage_transport_gated_at_35() {
        let table = CapabilityTable::builtin();
        assert!(!table.is_feature_supported("30.0.0", POSTMESSAGE_TRANSPORT));
        assert!(table.is_feature_supported("35.0.0", POSTMESSAGE_TRANSPORT));
        assert!(table.is_feature_supported("35.4.1", POSTMESSAGE_TRANSPORT));
        assert!(table.is_feature_supported("36", POSTMESSAGE_TRANSPORT));
    }

    #[test]
    fn support_is_monotonic_without_overrides() {
        let table = CapabilityTable::builtin();
        let versions = [
            "30.0.0", "33.0.0", "33.1.0", "35.0.0", "36.0.0", "37.0.0", "40.0.0", "50.0.0",
        ];
        for feature in [
            STOP_MESSAGE,
            POSTMESSAGE_TRANSPORT,
            PROJECT_DEPENDENCIES,
            BINARY_CODE_PAYLOAD,
        ] {
            for (i, lower) in versions.iter().enumerate() {
                for higher in &versions[i..] {
                    if table.is_feature_supported(lower, feature) {
                        assert!(
                            table.is_feature_supported(higher, feature),
                            "{feature} supported at {lower} but not {higher}"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn overrides_withdraw_and_later_rows_restore() {
        let table = CapabilityTable::builtin()
            .with_override("38.0.0", POSTMESSAGE_TRANSPORT)
            .expect("override")
            .with_feature("39.0.0", POSTMESSAGE_TRANSPORT)
            .expect("restore");
        assert!(table.is_feature_supported("37.0.0", POSTMESSAGE_TRANSPORT));
        assert!(!table.is_feature_supported("38.2.0", POSTMESSAGE_TRANSPORT));
        assert!(table.is_feature_supported("39.0.0", POSTMESSAGE_TRANSPORT));
    }

    #[test]
    fn loads_rows_from_json() {
        let table = CapabilityTable::from_json(
            r#"{"35.0.0": {"add": ["POSTMESSAGE_TRANSPORT"]}, "36": {"remove": ["POSTMESSAGE_TRANSPORT"]}}"#,
        )
        .expect("parse");
        assert!(table.is_feature_supported("35.0.0", POSTMESSAGE_TRANSPORT));
        assert!(!table.is_feature_supported("36.0.0", POSTMESSAGE_TRANSPORT));

        let err = CapabilityTable::from_json(r#"{"next": {}}"#).expect_err("bad version");
        assert_eq!(err, CapabilityError::InvalidVersion("next".into()));
    }
}
