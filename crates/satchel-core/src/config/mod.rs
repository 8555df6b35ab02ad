//! Runtime configuration for the sync backend and trigger timings.
//!
//! The backend values are public endpoints/keys (Supabase URL and anon key).
//! Secret credentials must never be stored here.

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const ENV_SUPABASE_URL: &str = "SATCHEL_SUPABASE_URL";
pub const ENV_SUPABASE_ANON_KEY: &str = "SATCHEL_SUPABASE_ANON_KEY";
pub const ENV_SNAPSHOT_TABLE: &str = "SATCHEL_SNAPSHOT_TABLE";
pub const ENV_SYNC_DEBOUNCE_MS: &str = "SATCHEL_SYNC_DEBOUNCE_MS";
pub const ENV_SYNC_INTERVAL_SECS: &str = "SATCHEL_SYNC_INTERVAL_SECS";

pub const DEFAULT_SNAPSHOT_TABLE: &str = "user_snapshots";
const DEFAULT_DEBOUNCE_MS: u64 = 1500;
const DEFAULT_INTERVAL_SECS: u64 = 60;

/// Supabase project settings for auth and the snapshot table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    pub supabase_url: String,
    pub supabase_anon_key: String,
    #[serde(default = "default_snapshot_table")]
    pub snapshot_table: String,
}

fn default_snapshot_table() -> String {
    DEFAULT_SNAPSHOT_TABLE.to_string()
}

impl BackendConfig {
    /// Resolve backend config from optional raw values.
    ///
    /// Returns `Ok(None)` when neither URL nor key is set: the engine then runs
    /// in its disabled mode. A half-configured backend is an error.
    pub fn resolve(
        supabase_url: Option<String>,
        supabase_anon_key: Option<String>,
        snapshot_table: Option<String>,
    ) -> Result<Option<Self>, String> {
        let url = non_blank(supabase_url);
        let anon_key = non_blank(supabase_anon_key);

        let (url, anon_key) = match (url, anon_key) {
            (None, None) => return Ok(None),
            (Some(url), Some(anon_key)) => (url, anon_key),
            (Some(_), None) => return Err(format!("{ENV_SUPABASE_ANON_KEY} is required")),
            (None, Some(_)) => return Err(format!("{ENV_SUPABASE_URL} is required")),
        };

        if !has_http_scheme(&url) {
            return Err(format!("{ENV_SUPABASE_URL} must include http:// or https://"));
        }

        let snapshot_table =
            non_blank(snapshot_table).unwrap_or_else(default_snapshot_table);
        if !snapshot_table
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
        {
            return Err(format!(
                "{ENV_SNAPSHOT_TABLE} must only contain letters, digits, and underscores"
            ));
        }

        Ok(Some(Self {
            supabase_url: url.trim_end_matches('/').to_string(),
            supabase_anon_key: anon_key,
            snapshot_table,
        }))
    }

    /// Resolve backend config from process environment variables.
    pub fn from_env() -> Result<Option<Self>, String> {
        Self::resolve(
            std::env::var(ENV_SUPABASE_URL).ok(),
            std::env::var(ENV_SUPABASE_ANON_KEY).ok(),
            std::env::var(ENV_SNAPSHOT_TABLE).ok(),
        )
    }

    /// PostgREST base URL for this project.
    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.supabase_url)
    }
}

/// Timings for the debounced local-change trigger and the periodic trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncTimings {
    /// Quiet period after the last local write before a sync is requested
    pub debounce: Duration,
    /// Fixed period of the background trigger
    pub interval: Duration,
}

impl Default for SyncTimings {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(DEFAULT_DEBOUNCE_MS),
            interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
        }
    }
}

impl SyncTimings {
    /// Set the debounce quiet period
    #[must_use]
    pub const fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    /// Set the periodic trigger interval
    #[must_use]
    pub const fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Read overrides from the environment, falling back to defaults.
    ///
    /// Zero or unparsable values are ignored.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let debounce = parse_positive_u64(std::env::var(ENV_SYNC_DEBOUNCE_MS).ok())
            .map_or(defaults.debounce, Duration::from_millis);
        let interval = parse_positive_u64(std::env::var(ENV_SYNC_INTERVAL_SECS).ok())
            .map_or(defaults.interval, Duration::from_secs);
        Self { debounce, interval }
    }
}

/// Trimmed value, or `None` when missing or blank.
fn non_blank(raw: Option<String>) -> Option<String> {
    raw.map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub(crate) fn has_http_scheme(url: &str) -> bool {
    ["http://", "https://"]
        .iter()
        .any(|scheme| url.starts_with(scheme))
}

fn parse_positive_u64(raw: Option<String>) -> Option<u64> {
    non_blank(raw)?
        .parse::<u64>()
        .ok()
        .filter(|value| *value > 0)
}
