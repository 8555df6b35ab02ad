//! Whole-dataset snapshot document and its outbound sanitizer.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::meta::SYNC_META_PREFIX;
use crate::error::{Error, Result};

/// Settings key holding the device-local API key.
pub const API_KEY_SETTING: &str = "api_key";

/// Snapshot document version written by this build.
pub const SNAPSHOT_VERSION: u32 = 1;

const fn default_version() -> u32 {
    SNAPSHOT_VERSION
}

/// Full exportable copy of the local dataset.
///
/// `tables` maps a collection name to its records; every record is an
/// opaque JSON object. `settings` is the application key/value map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<Value>>,
    #[serde(default)]
    pub settings: BTreeMap<String, Value>,
}

impl Default for Snapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            tables: BTreeMap::new(),
            settings: BTreeMap::new(),
        }
    }
}

/// Keys that never leave the device: the API key and sync bookkeeping.
pub fn is_reserved_setting_key(key: &str) -> bool {
    key == API_KEY_SETTING || key.starts_with(SYNC_META_PREFIX)
}

impl Snapshot {
    /// Copy of this snapshot with device-local settings removed.
    #[must_use]
    pub fn sanitized_for_upload(&self) -> Self {
        let settings = self
            .settings
            .iter()
            .filter(|(key, _)| !is_reserved_setting_key(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        Self {
            version: self.version,
            tables: self.tables.clone(),
            settings,
        }
    }

    /// Encode as the JSON document stored in the remote `payload` column.
    pub fn to_payload(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Decode a remote `payload` column.
    pub fn from_payload(payload: Value) -> Result<Self> {
        if !payload.is_object() {
            return Err(Error::MalformedPayload(
                "snapshot payload must be a JSON object".to_string(),
            ));
        }

        let snapshot: Self = serde_json::from_value(payload)
            .map_err(|error| Error::MalformedPayload(error.to_string()))?;
        if snapshot.version > SNAPSHOT_VERSION {
            return Err(Error::MalformedPayload(format!(
                "unsupported snapshot version {} (expected <= {SNAPSHOT_VERSION})",
                snapshot.version
            )));
        }
        Ok(snapshot)
    }

    /// Number of records across all tables.
    pub fn record_count(&self) -> usize {
        self.tables.values().map(Vec::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn sample() -> Snapshot {
        let mut snapshot = Snapshot::default();
        snapshot.tables.insert(
            "decks".to_string(),
            vec![json!({"id": "d1", "title": "Organic chemistry"})],
        );
        snapshot
            .settings
            .insert("theme".to_string(), json!("dark"));
        snapshot
            .settings
            .insert(API_KEY_SETTING.to_string(), json!("sk-live"));
        snapshot.settings.insert(
            format!("{SYNC_META_PREFIX}last_sync_at"),
            json!("2024-05-01T10:00:00.000Z"),
        );
        snapshot
    }

    #[test]
    fn sanitizer_strips_secret_and_bookkeeping() {
        let sanitized = sample().sanitized_for_upload();
        assert_eq!(
            sanitized.settings.keys().collect::<Vec<_>>(),
            vec!["theme"]
        );
        assert_eq!(sanitized.tables, sample().tables);
    }

    #[test]
    fn reserved_keys_are_detected_by_prefix() {
        assert!(is_reserved_setting_key("api_key"));
        assert!(is_reserved_setting_key("__sync_anything"));
        assert!(!is_reserved_setting_key("api_key_hint"));
        assert!(!is_reserved_setting_key("sync_enabled"));
    }

    #[test]
    fn from_payload_accepts_missing_sections() {
        let snapshot = Snapshot::from_payload(json!({"tables": {}})).unwrap();
        assert_eq!(snapshot.version, SNAPSHOT_VERSION);
        assert!(snapshot.settings.is_empty());
    }

    #[test]
    fn from_payload_rejects_malformed_documents() {
        assert!(matches!(
            Snapshot::from_payload(json!("not a snapshot")),
            Err(Error::MalformedPayload(_))
        ));
        assert!(matches!(
            Snapshot::from_payload(json!({"tables": {"decks": "oops"}})),
            Err(Error::MalformedPayload(_))
        ));
        assert!(matches!(
            Snapshot::from_payload(json!({"version": 99})),
            Err(Error::MalformedPayload(_))
        ));
    }

    #[test]
    fn record_count_sums_tables() {
        let mut snapshot = sample();
        snapshot
            .tables
            .insert("cards".to_string(), vec![json!({"id": "c1"}), json!({"id": "c2"})]);
        assert_eq!(snapshot.record_count(), 3);
    }
}
