use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use satchel_core::config::{BackendConfig, SyncTimings};
use satchel_core::local::{LocalDatabase, StoredRecord};
use satchel_core::remote::SupabaseSnapshotStore;
use satchel_core::sync::memory::StaticIdentity;
use satchel_core::sync::{IdentityProvider, LocalStore, RemoteStore, SyncEngine, SyncInstant, SyncMeta};
use serde::Serialize;
use serde_json::Value;

use crate::auth::auth_client;
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct RecordListItem {
    pub collection: String,
    pub id: String,
    pub body: Value,
    pub updated_at: i64,
    pub relative_time: String,
}

pub async fn open_database(path: &Path) -> Result<LocalDatabase, CliError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(LocalDatabase::open(path).await?)
}

pub fn backend_config() -> Result<Option<BackendConfig>, CliError> {
    BackendConfig::from_env().map_err(CliError::Config)
}

/// Engine over `local`, wired to Supabase when a backend is configured.
pub fn build_engine(
    local: Arc<dyn LocalStore>,
    backend: Option<&BackendConfig>,
) -> Result<SyncEngine, CliError> {
    let builder = match backend {
        Some(config) => {
            let client = Arc::new(auth_client(config)?);
            let remote: Arc<dyn RemoteStore> =
                Arc::new(SupabaseSnapshotStore::new(config, client.clone())?);
            let identity: Arc<dyn IdentityProvider> = client;
            SyncEngine::builder(local, identity).remote(Some(remote))
        }
        None => SyncEngine::builder(local, Arc::new(StaticIdentity::default())),
    };
    Ok(builder.timings(SyncTimings::from_env()).build())
}

/// Stamp a user edit so the next `satchel sync` pushes it.
pub async fn mark_local_change(db: &LocalDatabase) -> Result<(), CliError> {
    SyncMeta::mark_local_change(db, SyncInstant::now()).await?;
    Ok(())
}

pub fn normalize_collection(collection: &str) -> Result<String, CliError> {
    let collection = collection.trim();
    if collection.is_empty() {
        return Err(CliError::EmptyCollection);
    }
    Ok(collection.to_string())
}

pub fn normalize_record_id(id: &str) -> Result<String, CliError> {
    let id = id.trim();
    if id.is_empty() {
        return Err(CliError::EmptyRecordId);
    }
    Ok(id.to_string())
}

/// Parse a record body and set its `"id"` field.
pub fn parse_record_body(id: &str, raw: &str) -> Result<Value, CliError> {
    let mut body: Value = serde_json::from_str(raw)
        .map_err(|error| CliError::InvalidRecordBody(error.to_string()))?;
    let Some(fields) = body.as_object_mut() else {
        return Err(CliError::InvalidRecordBody(format!("got {}", json_kind(&body))));
    };
    fields.insert("id".to_string(), Value::String(id.to_string()));
    Ok(body)
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

pub fn format_record_lines(records: &[StoredRecord]) -> Vec<String> {
    let now_ms = Utc::now().timestamp_millis();
    records
        .iter()
        .map(|record| {
            let key = format!("{}/{}", record.collection, record.id);
            let preview = record_preview(&record.body, 48);
            let relative_time = format_relative_time(record.updated_at, now_ms);
            format!("{key:<24}  {preview:<48}  {relative_time}")
        })
        .collect()
}

pub fn record_to_list_item(record: &StoredRecord) -> RecordListItem {
    let now_ms = Utc::now().timestamp_millis();
    RecordListItem {
        collection: record.collection.clone(),
        id: record.id.clone(),
        body: record.body.clone(),
        updated_at: record.updated_at,
        relative_time: format_relative_time(record.updated_at, now_ms),
    }
}

/// Compact JSON of the body without its `id`, truncated with an ellipsis.
pub fn record_preview(body: &Value, max_chars: usize) -> String {
    let rendered = match body {
        Value::Object(fields) => {
            let mut fields = fields.clone();
            fields.remove("id");
            Value::Object(fields).to_string()
        }
        other => other.to_string(),
    };

    if rendered.chars().count() <= max_chars {
        rendered
    } else {
        let truncated = rendered
            .chars()
            .take(max_chars.saturating_sub(3))
            .collect::<String>();
        format!("{truncated}...")
    }
}

pub fn format_relative_time(timestamp_ms: i64, now_ms: i64) -> String {
    let diff = now_ms.saturating_sub(timestamp_ms);
    let minute = 60_000;
    let hour = 60 * minute;
    let day = 24 * hour;
    let week = 7 * day;
    let month = 30 * day;
    let year = 365 * day;

    if diff < minute {
        "just now".to_string()
    } else if diff < hour {
        format!("{}m ago", diff / minute)
    } else if diff < day {
        format!("{}h ago", diff / hour)
    } else if diff < week {
        format!("{}d ago", diff / day)
    } else if diff < month {
        format!("{}w ago", diff / week)
    } else if diff < year {
        format!("{}mo ago", diff / month)
    } else {
        format!("{}y ago", diff / year)
    }
}

/// Show only the first and last few characters of a secret.
pub fn mask_secret(secret: &str) -> String {
    let chars = secret.chars().collect::<Vec<_>>();
    if chars.len() <= 8 {
        return "*".repeat(chars.len());
    }
    let head = chars[..4].iter().collect::<String>();
    let tail = chars[chars.len() - 4..].iter().collect::<String>();
    format!("{head}...{tail}")
}
