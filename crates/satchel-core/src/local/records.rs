//! Record and settings operations, and the sync engine's view of the store.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use super::connection::LocalDatabase;
use crate::error::{Error, Result};
use crate::sync::{
    is_reserved_setting_key, ImportOptions, LocalChange, LocalChangeFeed, LocalStore, Snapshot,
    SyncMetaKey, API_KEY_SETTING, SNAPSHOT_VERSION, SYNC_META_PREFIX,
};

/// A record row as stored locally.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredRecord {
    pub collection: String,
    pub id: String,
    pub body: Value,
    /// Unix milliseconds of the last local write
    pub updated_at: i64,
}

impl LocalDatabase {
    /// Insert or replace a record by its `"id"` field.
    pub async fn put_record(&self, collection: &str, body: Value) -> Result<StoredRecord> {
        let collection = validate_collection(collection)?;
        let id = record_id(&body)
            .ok_or_else(|| Error::InvalidInput("record must have a string \"id\" field".into()))?
            .to_string();
        let updated_at = chrono::Utc::now().timestamp_millis();

        {
            let _write = self.write_lock().await;
            self.connection()
                .execute(
                    "INSERT OR REPLACE INTO records (collection, id, body, updated_at) VALUES (?, ?, ?, ?)",
                    libsql::params![collection, id.as_str(), serde_json::to_string(&body)?, updated_at],
                )
                .await?;
        }

        self.feed().notify(LocalChange::Record {
            collection: collection.to_string(),
            id: id.clone(),
        });
        Ok(StoredRecord {
            collection: collection.to_string(),
            id,
            body,
            updated_at,
        })
    }

    pub async fn get_record(&self, collection: &str, id: &str) -> Result<Option<StoredRecord>> {
        let mut rows = self
            .connection()
            .query(
                "SELECT collection, id, body, updated_at FROM records WHERE collection = ? AND id = ?",
                [collection, id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(record_from_row(&row)?)),
            None => Ok(None),
        }
    }

    /// Returns `false` when the record did not exist.
    pub async fn delete_record(&self, collection: &str, id: &str) -> Result<bool> {
        let deleted = {
            let _write = self.write_lock().await;
            self.connection()
                .execute(
                    "DELETE FROM records WHERE collection = ? AND id = ?",
                    [collection, id],
                )
                .await?
        };

        if deleted > 0 {
            self.feed().notify(LocalChange::Record {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
        Ok(deleted > 0)
    }

    /// All records, or the records of one collection, ordered by collection and id.
    pub async fn list_records(&self, collection: Option<&str>) -> Result<Vec<StoredRecord>> {
        let mut rows = match collection {
            Some(collection) => {
                self.connection()
                    .query(
                        "SELECT collection, id, body, updated_at FROM records WHERE collection = ? ORDER BY id",
                        [collection],
                    )
                    .await?
            }
            None => {
                self.connection()
                    .query(
                        "SELECT collection, id, body, updated_at FROM records ORDER BY collection, id",
                        (),
                    )
                    .await?
            }
        };

        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(record_from_row(&row)?);
        }
        Ok(records)
    }

    /// Store a user setting. Device-local keys have dedicated methods.
    pub async fn set_setting(&self, key: &str, value: &Value) -> Result<()> {
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::InvalidInput("setting key must not be empty".into()));
        }
        if is_reserved_setting_key(key) {
            return Err(Error::InvalidInput(format!("setting key '{key}' is reserved")));
        }

        self.write_setting(key, value).await?;
        self.feed().notify(LocalChange::Setting {
            key: key.to_string(),
        });
        Ok(())
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read_setting(key).await?.map(decode_setting))
    }

    async fn read_setting(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .connection()
            .query("SELECT value FROM settings WHERE key = ?", [key])
            .await?;

        match rows.next().await? {
            Some(row) => Ok(Some(row.get::<String>(0)?)),
            None => Ok(None),
        }
    }

    async fn write_setting(&self, key: &str, value: &Value) -> Result<()> {
        let encoded = serde_json::to_string(value)?;
        let _write = self.write_lock().await;
        self.connection()
            .execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
                [key, encoded.as_str()],
            )
            .await?;
        Ok(())
    }

    async fn remove_setting(&self, key: &str) -> Result<()> {
        let _write = self.write_lock().await;
        self.connection()
            .execute("DELETE FROM settings WHERE key = ?", [key])
            .await?;
        Ok(())
    }

    async fn apply_snapshot(&self, snapshot: &Snapshot, options: ImportOptions) -> Result<()> {
        let conn = self.connection();
        if options.replace_existing {
            conn.execute("DELETE FROM records", ()).await?;
            conn.execute(
                "DELETE FROM settings WHERE substr(key, 1, length(?1)) != ?1",
                [SYNC_META_PREFIX],
            )
            .await?;
        }

        let imported_at = chrono::Utc::now().timestamp_millis();
        for (collection, records) in &snapshot.tables {
            let collection = validate_collection(collection)?;
            for body in records {
                let id = record_id(body).unwrap_or_default();
                conn.execute(
                    "INSERT OR REPLACE INTO records (collection, id, body, updated_at) VALUES (?, ?, ?, ?)",
                    libsql::params![collection, id, serde_json::to_string(body)?, imported_at],
                )
                .await?;
            }
        }

        for (key, value) in &snapshot.settings {
            if is_reserved_setting_key(key) {
                continue;
            }
            conn.execute(
                "INSERT OR REPLACE INTO settings (key, value) VALUES (?, ?)",
                [key.as_str(), serde_json::to_string(value)?.as_str()],
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait]
impl LocalStore for LocalDatabase {
    async fn export_all_data(&self) -> Result<Snapshot> {
        let mut tables: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for record in self.list_records(None).await? {
            tables.entry(record.collection).or_default().push(record.body);
        }

        let mut settings = BTreeMap::new();
        let mut rows = self
            .connection()
            .query("SELECT key, value FROM settings ORDER BY key", ())
            .await?;
        while let Some(row) = rows.next().await? {
            settings.insert(row.get::<String>(0)?, decode_setting(row.get::<String>(1)?));
        }

        Ok(Snapshot {
            version: SNAPSHOT_VERSION,
            tables,
            settings,
        })
    }

    async fn import_data(&self, snapshot: Snapshot, options: ImportOptions) -> Result<()> {
        for (collection, records) in &snapshot.tables {
            validate_collection(collection)
                .map_err(|_| Error::MalformedPayload("snapshot has an unnamed table".into()))?;
            if records.iter().any(|body| record_id(body).is_none()) {
                return Err(Error::MalformedPayload(format!(
                    "table '{collection}' has a record without a string id"
                )));
            }
        }

        {
            let _write = self.write_lock().await;
            let conn = self.connection();
            conn.execute("BEGIN TRANSACTION", ()).await?;
            if let Err(error) = self.apply_snapshot(&snapshot, options).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(error);
            }
            if let Err(error) = conn.execute("COMMIT", ()).await {
                conn.execute("ROLLBACK", ()).await.ok();
                return Err(error.into());
            }
        }

        tracing::debug!(records = snapshot.record_count(), "Imported snapshot");
        self.feed().notify(LocalChange::Setting {
            key: "*".to_string(),
        });
        Ok(())
    }

    async fn get_sync_meta(&self, key: SyncMetaKey) -> Result<Option<String>> {
        Ok(self.read_setting(key.as_str()).await?.and_then(decode_text))
    }

    async fn set_sync_meta(&self, key: SyncMetaKey, value: &str) -> Result<()> {
        self.write_setting(key.as_str(), &Value::String(value.to_string()))
            .await
    }

    async fn get_api_key(&self) -> Result<Option<String>> {
        Ok(self.read_setting(API_KEY_SETTING).await?.and_then(decode_text))
    }

    async fn save_api_key(&self, api_key: Option<&str>) -> Result<()> {
        match api_key.map(str::trim).filter(|value| !value.is_empty()) {
            Some(api_key) => {
                self.write_setting(API_KEY_SETTING, &Value::String(api_key.to_string()))
                    .await?;
            }
            None => self.remove_setting(API_KEY_SETTING).await?,
        }
        self.feed().notify(LocalChange::Setting {
            key: API_KEY_SETTING.to_string(),
        });
        Ok(())
    }

    fn change_feed(&self) -> &LocalChangeFeed {
        self.feed()
    }
}

fn validate_collection(collection: &str) -> Result<&str> {
    let collection = collection.trim();
    if collection.is_empty() {
        return Err(Error::InvalidInput("collection must not be empty".into()));
    }
    Ok(collection)
}

fn record_id(body: &Value) -> Option<&str> {
    body.get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
}

fn record_from_row(row: &libsql::Row) -> Result<StoredRecord> {
    let body: String = row.get(2)?;
    Ok(StoredRecord {
        collection: row.get(0)?,
        id: row.get(1)?,
        body: serde_json::from_str(&body)?,
        updated_at: row.get(3)?,
    })
}

/// Settings are JSON-encoded; tolerate raw text written by older tools.
fn decode_setting(raw: String) -> Value {
    serde_json::from_str(&raw).unwrap_or(Value::String(raw))
}

fn decode_text(raw: String) -> Option<String> {
    match decode_setting(raw) {
        Value::String(text) => Some(text),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    async fn setup() -> LocalDatabase {
        LocalDatabase::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn put_get_and_delete_record() {
        let db = setup().await;
        db.put_record("decks", json!({"id": "d1", "title": "Biology"}))
            .await
            .unwrap();
        db.put_record("decks", json!({"id": "d1", "title": "Chemistry"}))
            .await
            .unwrap();

        let record = db.get_record("decks", "d1").await.unwrap().unwrap();
        assert_eq!(record.body, json!({"id": "d1", "title": "Chemistry"}));
        assert_eq!(db.list_records(Some("decks")).await.unwrap().len(), 1);

        assert!(db.delete_record("decks", "d1").await.unwrap());
        assert!(!db.delete_record("decks", "d1").await.unwrap());
        assert!(db.get_record("decks", "d1").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn put_record_requires_string_id() {
        let db = setup().await;
        assert!(db.put_record("decks", json!({"id": 7})).await.is_err());
        assert!(db.put_record(" ", json!({"id": "x"})).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn writes_notify_change_feed() {
        let db = setup().await;
        let mut changes = db.subscribe_to_local_data_changes();

        db.put_record("cards", json!({"id": "c1"})).await.unwrap();
        db.set_setting("theme", &json!("dark")).await.unwrap();

        assert_eq!(
            changes.try_recv().unwrap(),
            LocalChange::Record {
                collection: "cards".to_string(),
                id: "c1".to_string()
            }
        );
        assert_eq!(
            changes.try_recv().unwrap(),
            LocalChange::Setting {
                key: "theme".to_string()
            }
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_meta_writes_are_silent() {
        let db = setup().await;
        let mut changes = db.subscribe_to_local_data_changes();

        db.set_sync_meta(SyncMetaKey::LastSyncAt, "2024-05-01T10:00:00.000Z")
            .await
            .unwrap();

        assert!(changes.try_recv().is_err());
        assert_eq!(
            db.get_sync_meta(SyncMetaKey::LastSyncAt).await.unwrap(),
            Some("2024-05-01T10:00:00.000Z".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn set_setting_rejects_reserved_keys() {
        let db = setup().await;
        assert!(db.set_setting(API_KEY_SETTING, &json!("k")).await.is_err());
        assert!(db
            .set_setting("__sync_last_sync_at", &json!("x"))
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn api_key_round_trip_and_clear() {
        let db = setup().await;
        db.save_api_key(Some(" sk-test ")).await.unwrap();
        assert_eq!(db.get_api_key().await.unwrap(), Some("sk-test".to_string()));

        db.save_api_key(None).await.unwrap();
        assert_eq!(db.get_api_key().await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn export_includes_records_and_settings() {
        let db = setup().await;
        db.put_record("decks", json!({"id": "d1"})).await.unwrap();
        db.set_setting("theme", &json!({"mode": "dark"}))
            .await
            .unwrap();
        db.save_api_key(Some("sk-test")).await.unwrap();

        let snapshot = db.export_all_data().await.unwrap();
        assert_eq!(snapshot.tables["decks"], vec![json!({"id": "d1"})]);
        assert_eq!(snapshot.settings["theme"], json!({"mode": "dark"}));
        assert!(!snapshot
            .sanitized_for_upload()
            .settings
            .contains_key(API_KEY_SETTING));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn import_replaces_data_and_keeps_bookkeeping() {
        let db = setup().await;
        db.put_record("decks", json!({"id": "old"})).await.unwrap();
        db.set_setting("theme", &json!("dark")).await.unwrap();
        db.set_sync_meta(SyncMetaKey::LastRemoteAt, "2024-05-01T10:00:00.000Z")
            .await
            .unwrap();

        let mut incoming = Snapshot::default();
        incoming
            .tables
            .insert("cards".to_string(), vec![json!({"id": "c1", "front": "Q"})]);
        incoming
            .settings
            .insert("locale".to_string(), json!("de"));
        incoming
            .settings
            .insert(API_KEY_SETTING.to_string(), json!("foreign"));
        incoming
            .settings
            .insert("__sync_last_remote_at".to_string(), json!("1970-01-01T00:00:00.000Z"));

        db.import_data(incoming, ImportOptions::default())
            .await
            .unwrap();

        assert!(db.list_records(Some("decks")).await.unwrap().is_empty());
        assert_eq!(db.list_records(Some("cards")).await.unwrap().len(), 1);
        assert_eq!(db.get_setting("theme").await.unwrap(), None);
        assert_eq!(db.get_setting("locale").await.unwrap(), Some(json!("de")));
        assert_eq!(db.get_api_key().await.unwrap(), None);
        assert_eq!(
            db.get_sync_meta(SyncMetaKey::LastRemoteAt).await.unwrap(),
            Some("2024-05-01T10:00:00.000Z".to_string())
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn import_trims_collection_names() {
        let db = setup().await;

        let mut incoming = Snapshot::default();
        incoming
            .tables
            .insert(" decks ".to_string(), vec![json!({"id": "d1"})]);
        db.import_data(incoming, ImportOptions::default())
            .await
            .unwrap();

        let decks = db.list_records(Some("decks")).await.unwrap();
        assert_eq!(decks.len(), 1);
        assert_eq!(decks[0].collection, "decks");
        assert!(db.get_record("decks", "d1").await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn malformed_import_leaves_data_untouched() {
        let db = setup().await;
        db.put_record("decks", json!({"id": "keep"})).await.unwrap();

        let mut incoming = Snapshot::default();
        incoming
            .tables
            .insert("decks".to_string(), vec![json!({"title": "no id"})]);

        let error = db
            .import_data(incoming, ImportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(error, Error::MalformedPayload(_)));
        assert_eq!(db.list_records(None).await.unwrap().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn suppressed_import_does_not_notify() {
        let db = setup().await;
        let mut changes = db.subscribe_to_local_data_changes();

        {
            let _untracked = db.change_feed().suppress();
            db.import_data(Snapshot::default(), ImportOptions::default())
                .await
                .unwrap();
        }

        assert!(changes.try_recv().is_err());
    }
}
