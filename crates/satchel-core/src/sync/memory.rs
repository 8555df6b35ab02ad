//! In-memory collaborators for tests and ephemeral sessions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use super::instant::{Clock, SyncInstant};
use super::meta::SyncMetaKey;
use super::snapshot::{is_reserved_setting_key, Snapshot, API_KEY_SETTING};
use super::store::{
    AuthEvent, IdentityProvider, ImportOptions, LocalChange, LocalChangeFeed, LocalStore,
    RemoteRecord, RemoteStore,
};
use crate::auth::AuthUser;
use crate::error::{Error, Result};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Local dataset kept in a [`Snapshot`]. Sync bookkeeping and the API key live
/// in the settings map, like they do in the libSQL store.
#[derive(Default)]
pub struct MemoryLocalStore {
    data: Mutex<Snapshot>,
    feed: LocalChangeFeed,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a record by its `"id"` field.
    pub fn put_record(&self, collection: &str, record: Value) -> Result<()> {
        let id = record_id(&record)?;
        {
            let mut data = lock(&self.data);
            let records = data.tables.entry(collection.to_string()).or_default();
            records.retain(|existing| {
                existing.get("id").and_then(Value::as_str) != Some(id.as_str())
            });
            records.push(record);
        }
        self.feed.notify(LocalChange::Record {
            collection: collection.to_string(),
            id,
        });
        Ok(())
    }

    pub fn delete_record(&self, collection: &str, id: &str) {
        let removed = {
            let mut data = lock(&self.data);
            data.tables.get_mut(collection).is_some_and(|records| {
                let before = records.len();
                records.retain(|existing| existing.get("id").and_then(Value::as_str) != Some(id));
                records.len() != before
            })
        };
        if removed {
            self.feed.notify(LocalChange::Record {
                collection: collection.to_string(),
                id: id.to_string(),
            });
        }
    }

    pub fn records(&self, collection: &str) -> Vec<Value> {
        lock(&self.data)
            .tables
            .get(collection)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_setting(&self, key: &str, value: Value) {
        lock(&self.data).settings.insert(key.to_string(), value);
        self.feed.notify(LocalChange::Setting {
            key: key.to_string(),
        });
    }

    pub fn setting(&self, key: &str) -> Option<Value> {
        lock(&self.data).settings.get(key).cloned()
    }

    /// Application data without device-local settings.
    pub fn user_data(&self) -> Snapshot {
        lock(&self.data).sanitized_for_upload()
    }
}

fn record_id(record: &Value) -> Result<String> {
    record
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| Error::InvalidInput("record must have a string \"id\" field".to_string()))
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn export_all_data(&self) -> Result<Snapshot> {
        Ok(lock(&self.data).clone())
    }

    async fn import_data(&self, snapshot: Snapshot, options: ImportOptions) -> Result<()> {
        let mut data = lock(&self.data);
        if options.replace_existing {
            data.tables.clear();
            data.settings.retain(|key, _| key.starts_with(super::SYNC_META_PREFIX));
        }
        for (collection, records) in snapshot.tables {
            data.tables.insert(collection, records);
        }
        for (key, value) in snapshot.settings {
            if !is_reserved_setting_key(&key) {
                data.settings.insert(key, value);
            }
        }
        drop(data);

        self.feed.notify(LocalChange::Setting {
            key: "*".to_string(),
        });
        Ok(())
    }

    async fn get_sync_meta(&self, key: SyncMetaKey) -> Result<Option<String>> {
        Ok(lock(&self.data)
            .settings
            .get(key.as_str())
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    async fn set_sync_meta(&self, key: SyncMetaKey, value: &str) -> Result<()> {
        lock(&self.data)
            .settings
            .insert(key.as_str().to_string(), Value::String(value.to_string()));
        Ok(())
    }

    async fn get_api_key(&self) -> Result<Option<String>> {
        Ok(self
            .setting(API_KEY_SETTING)
            .and_then(|value| value.as_str().map(str::to_string)))
    }

    async fn save_api_key(&self, api_key: Option<&str>) -> Result<()> {
        {
            let mut data = lock(&self.data);
            match api_key {
                Some(api_key) => {
                    data.settings
                        .insert(API_KEY_SETTING.to_string(), Value::String(api_key.to_string()));
                }
                None => {
                    data.settings.remove(API_KEY_SETTING);
                }
            }
        }
        self.feed.notify(LocalChange::Setting {
            key: API_KEY_SETTING.to_string(),
        });
        Ok(())
    }

    fn change_feed(&self) -> &LocalChangeFeed {
        &self.feed
    }
}

/// Snapshot table keyed by user id, with failure injection.
#[derive(Default)]
pub struct MemoryRemoteStore {
    rows: Mutex<HashMap<String, RemoteRecord>>,
    fail_next: Mutex<Option<String>>,
    latency: Option<Duration>,
    fetches: AtomicUsize,
    upserts: AtomicUsize,
}

impl MemoryRemoteStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call, to hold a pass open in concurrency tests.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make the next fetch or upsert fail with `message`.
    pub fn fail_next(&self, message: impl Into<String>) {
        *lock(&self.fail_next) = Some(message.into());
    }

    pub fn record(&self, user_id: &str) -> Option<RemoteRecord> {
        lock(&self.rows).get(user_id).cloned()
    }

    pub fn insert(&self, record: RemoteRecord) {
        lock(&self.rows).insert(record.user_id.clone(), record);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn upsert_count(&self) -> usize {
        self.upserts.load(Ordering::SeqCst)
    }

    async fn simulate_call(&self) -> Result<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        match lock(&self.fail_next).take() {
            Some(message) => Err(Error::Remote(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryRemoteStore {
    async fn fetch_remote_snapshot(&self, user_id: &str) -> Result<Option<RemoteRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await?;
        Ok(self.record(user_id))
    }

    async fn upsert_remote_snapshot(
        &self,
        user_id: &str,
        payload: &Value,
        updated_at: SyncInstant,
    ) -> Result<()> {
        self.upserts.fetch_add(1, Ordering::SeqCst);
        self.simulate_call().await?;
        self.insert(RemoteRecord {
            user_id: user_id.to_string(),
            payload: payload.clone(),
            updated_at: updated_at.to_rfc3339(),
        });
        Ok(())
    }
}

/// Identity that tests can sign in and out.
pub struct StaticIdentity {
    user: Mutex<Option<AuthUser>>,
    events: broadcast::Sender<AuthEvent>,
}

impl Default for StaticIdentity {
    fn default() -> Self {
        Self::new(None)
    }
}

impl StaticIdentity {
    pub fn new(user: Option<AuthUser>) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            user: Mutex::new(user),
            events,
        }
    }

    pub fn signed_in(id: &str) -> Self {
        Self::new(Some(AuthUser {
            id: id.to_string(),
            email: None,
        }))
    }

    pub fn sign_in(&self, user: AuthUser) {
        *lock(&self.user) = Some(user.clone());
        let _ = self.events.send(AuthEvent::SignedIn(user));
    }

    pub fn sign_out(&self) {
        *lock(&self.user) = None;
        let _ = self.events.send(AuthEvent::SignedOut);
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    async fn current_user(&self) -> Result<Option<AuthUser>> {
        Ok(lock(&self.user).clone())
    }

    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthEvent> {
        self.events.subscribe()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub const fn new(start: SyncInstant) -> Self {
        Self {
            millis: AtomicI64::new(start.as_millis()),
        }
    }

    pub fn set(&self, at: SyncInstant) {
        self.millis.store(at.as_millis(), Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let by = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.millis.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SyncInstant {
        SyncInstant::from_millis(self.millis.load(Ordering::SeqCst))
    }
}
