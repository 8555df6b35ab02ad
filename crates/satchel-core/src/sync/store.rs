//! Collaborator interfaces consumed by the sync engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;

use super::instant::SyncInstant;
use super::meta::SyncMetaKey;
use super::snapshot::Snapshot;
use crate::auth::AuthUser;
use crate::error::Result;

const CHANGE_FEED_CAPACITY: usize = 64;

/// A user-driven mutation of the local dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LocalChange {
    Record { collection: String, id: String },
    Setting { key: String },
}

/// Broadcast of local data changes with scoped suppression.
///
/// While any [`SuppressionGuard`] is alive, [`LocalChangeFeed::notify`] drops
/// notifications. Pulls hold a guard so applying a remote snapshot does not
/// feed back into the sync trigger.
#[derive(Clone)]
pub struct LocalChangeFeed {
    sender: broadcast::Sender<LocalChange>,
    suppressed: Arc<AtomicUsize>,
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            sender,
            suppressed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LocalChange> {
        self.sender.subscribe()
    }

    /// Publish a change. Returns `false` when tracking is suppressed.
    pub fn notify(&self, change: LocalChange) -> bool {
        if !self.is_tracking() {
            return false;
        }
        // No subscribers is fine: nobody is syncing right now.
        let _ = self.sender.send(change);
        true
    }

    pub fn is_tracking(&self) -> bool {
        self.suppressed.load(Ordering::SeqCst) == 0
    }

    pub fn suppress(&self) -> SuppressionGuard {
        self.suppressed.fetch_add(1, Ordering::SeqCst);
        SuppressionGuard {
            suppressed: Arc::clone(&self.suppressed),
        }
    }
}

/// Re-enables change tracking when dropped.
#[must_use = "change tracking resumes as soon as the guard is dropped"]
pub struct SuppressionGuard {
    suppressed: Arc<AtomicUsize>,
}

impl Drop for SuppressionGuard {
    fn drop(&mut self) {
        self.suppressed.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ImportOptions {
    /// Drop existing records and settings that the snapshot does not carry
    pub replace_existing: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            replace_existing: true,
        }
    }
}

/// Device-local dataset.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn export_all_data(&self) -> Result<Snapshot>;

    /// Apply a snapshot. Reserved settings (API key, sync bookkeeping) in the
    /// snapshot are ignored; existing sync bookkeeping is kept.
    async fn import_data(&self, snapshot: Snapshot, options: ImportOptions) -> Result<()>;

    async fn get_sync_meta(&self, key: SyncMetaKey) -> Result<Option<String>>;

    async fn set_sync_meta(&self, key: SyncMetaKey, value: &str) -> Result<()>;

    async fn get_api_key(&self) -> Result<Option<String>>;

    /// Store or clear the API key. Counts as a local change.
    async fn save_api_key(&self, api_key: Option<&str>) -> Result<()>;

    fn change_feed(&self) -> &LocalChangeFeed;

    /// Dropping the receiver unsubscribes.
    fn subscribe_to_local_data_changes(&self) -> broadcast::Receiver<LocalChange> {
        self.change_feed().subscribe()
    }
}

/// The single snapshot row stored remotely for a user.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub user_id: String,
    pub payload: Value,
    pub updated_at: String,
}

impl RemoteRecord {
    pub fn updated_at_instant(&self) -> SyncInstant {
        SyncInstant::parse(Some(&self.updated_at))
    }
}

/// One-row-per-user snapshot table.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn fetch_remote_snapshot(&self, user_id: &str) -> Result<Option<RemoteRecord>>;

    /// Replace the user's row.
    async fn upsert_remote_snapshot(
        &self,
        user_id: &str,
        payload: &Value,
        updated_at: SyncInstant,
    ) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AuthEvent {
    SignedIn(AuthUser),
    SignedOut,
}

/// Source of the signed-in identity.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn current_user(&self) -> Result<Option<AuthUser>>;

    fn subscribe_auth_changes(&self) -> broadcast::Receiver<AuthEvent>;
}
