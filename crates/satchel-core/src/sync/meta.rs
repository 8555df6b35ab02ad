//! Persisted sync bookkeeping timestamps.

use super::instant::SyncInstant;
use super::store::LocalStore;
use crate::error::Result;

/// Reserved settings prefix for sync bookkeeping keys.
pub const SYNC_META_PREFIX: &str = "__sync_";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncMetaKey {
    /// Last local mutation (or the remote instant a pull caught up to)
    LocalChangedAt,
    /// Last remote `updated_at` observed or produced by this device
    LastRemoteAt,
    /// Last completed reconciliation of any kind
    LastSyncAt,
}

impl SyncMetaKey {
    pub const ALL: [Self; 3] = [Self::LocalChangedAt, Self::LastRemoteAt, Self::LastSyncAt];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::LocalChangedAt => "__sync_local_changed_at",
            Self::LastRemoteAt => "__sync_last_remote_at",
            Self::LastSyncAt => "__sync_last_sync_at",
        }
    }
}

/// The three bookkeeping instants, read at the start of a pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncMeta {
    pub local_changed_at: SyncInstant,
    pub last_remote_at: SyncInstant,
    pub last_sync_at: SyncInstant,
    /// Whether `last_sync_at` was actually recorded
    pub has_synced: bool,
}

impl SyncMeta {
    pub async fn load(store: &dyn LocalStore) -> Result<Self> {
        let local_changed_at = store.get_sync_meta(SyncMetaKey::LocalChangedAt).await?;
        let last_remote_at = store.get_sync_meta(SyncMetaKey::LastRemoteAt).await?;
        let last_sync_at = store.get_sync_meta(SyncMetaKey::LastSyncAt).await?;

        let last_sync = SyncInstant::try_parse(last_sync_at.as_deref());
        Ok(Self {
            local_changed_at: SyncInstant::parse(local_changed_at.as_deref()),
            last_remote_at: SyncInstant::parse(last_remote_at.as_deref()),
            last_sync_at: last_sync.unwrap_or(SyncInstant::EPOCH),
            has_synced: last_sync.is_some(),
        })
    }

    /// Stamp `local_changed_at` after a user-driven write.
    pub async fn mark_local_change(store: &dyn LocalStore, at: SyncInstant) -> Result<()> {
        store
            .set_sync_meta(SyncMetaKey::LocalChangedAt, &at.to_rfc3339())
            .await
    }
}
