//! Push/pull/no-op decision and its two actions.

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use super::instant::{Clock, SyncInstant, SystemClock};
use super::meta::{SyncMeta, SyncMetaKey};
use super::snapshot::Snapshot;
use super::state::SyncStateHandle;
use super::store::{IdentityProvider, ImportOptions, LocalStore, RemoteRecord, RemoteStore};
use crate::auth::AuthUser;
use crate::error::Result;

/// Result of a sync request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    SkippedNotConfigured,
    SkippedNotAuthenticated,
    Pushed,
    Pulled,
    Noop,
    /// Another pass was running; the request was merged into the pending slot
    Queued,
}

impl SyncOutcome {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::SkippedNotConfigured => "skipped_not_configured",
            Self::SkippedNotAuthenticated => "skipped_not_authenticated",
            Self::Pushed => "pushed",
            Self::Pulled => "pulled",
            Self::Noop => "noop",
            Self::Queued => "queued",
        }
    }
}

impl fmt::Display for SyncOutcome {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncAction {
    Push,
    Pull,
    Noop,
}

/// Decide what a pass should do.
///
/// Whole-snapshot last-writer-wins: when both sides changed, the later of
/// `local_changed_at` and the remote `updated_at` wins, and local wins ties.
pub fn plan(meta: &SyncMeta, remote_updated_at: Option<SyncInstant>, force: bool) -> SyncAction {
    let Some(remote_updated_at) = remote_updated_at else {
        return SyncAction::Push;
    };

    let local_dirty = force || !meta.has_synced || meta.local_changed_at > meta.last_sync_at;
    let remote_dirty = force || remote_updated_at > meta.last_remote_at;

    match (local_dirty, remote_dirty) {
        (true, true) => {
            if meta.local_changed_at >= remote_updated_at {
                SyncAction::Push
            } else {
                SyncAction::Pull
            }
        }
        (true, false) => SyncAction::Push,
        (false, true) => SyncAction::Pull,
        (false, false) => SyncAction::Noop,
    }
}

/// Runs one reconciliation pass against the local and remote stores.
///
/// Owns every write to the sync bookkeeping and the observable state.
pub struct Reconciler {
    local: Arc<dyn LocalStore>,
    remote: Option<Arc<dyn RemoteStore>>,
    identity: Arc<dyn IdentityProvider>,
    state: SyncStateHandle,
    clock: Arc<dyn Clock>,
}

impl Reconciler {
    pub fn new(
        local: Arc<dyn LocalStore>,
        remote: Option<Arc<dyn RemoteStore>>,
        identity: Arc<dyn IdentityProvider>,
        state: SyncStateHandle,
    ) -> Self {
        Self {
            local,
            remote,
            identity,
            state,
            clock: Arc::new(SystemClock),
        }
    }

    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub const fn is_configured(&self) -> bool {
        self.remote.is_some()
    }

    pub const fn state(&self) -> &SyncStateHandle {
        &self.state
    }

    /// Stamp `local_changed_at` with the current time.
    pub async fn record_local_change(&self) -> Result<()> {
        SyncMeta::mark_local_change(self.local.as_ref(), self.clock.now()).await
    }

    pub async fn reconcile(&self, reason: &str, force: bool) -> Result<SyncOutcome> {
        let Some(remote) = self.remote.as_deref() else {
            tracing::debug!(reason, "Sync skipped: backend not configured");
            self.state.set_disabled();
            return Ok(SyncOutcome::SkippedNotConfigured);
        };

        let user = match self.identity.current_user().await {
            Ok(user) => user,
            Err(error) => {
                self.state.fail(error.to_string());
                return Err(error);
            }
        };
        let Some(user) = user else {
            tracing::debug!(reason, "Sync skipped: not signed in");
            self.state.set_signed_out();
            return Ok(SyncOutcome::SkippedNotAuthenticated);
        };

        self.state.begin_sync(&user);

        match self.run_pass(remote, &user, reason, force).await {
            Ok(outcome) => {
                self.state.finish_sync(self.clock.now());
                Ok(outcome)
            }
            Err(error) => {
                tracing::warn!(reason, %error, "Sync pass failed");
                self.state.fail(error.to_string());
                Err(error)
            }
        }
    }

    async fn run_pass(
        &self,
        remote: &dyn RemoteStore,
        user: &AuthUser,
        reason: &str,
        force: bool,
    ) -> Result<SyncOutcome> {
        let meta = SyncMeta::load(self.local.as_ref()).await?;
        let record = remote.fetch_remote_snapshot(&user.id).await?;
        let remote_updated_at = record.as_ref().map(RemoteRecord::updated_at_instant);

        let action = plan(&meta, remote_updated_at, force);
        tracing::debug!(
            reason,
            force,
            ?action,
            local_changed_at = %meta.local_changed_at,
            last_remote_at = %meta.last_remote_at,
            last_sync_at = %meta.last_sync_at,
            remote_updated_at = ?remote_updated_at.map(SyncInstant::to_rfc3339),
            "Reconciling"
        );

        match (action, record) {
            (SyncAction::Pull, Some(record)) => {
                self.pull(record).await?;
                Ok(SyncOutcome::Pulled)
            }
            (SyncAction::Push | SyncAction::Pull, _) => {
                self.push(remote, user).await?;
                Ok(SyncOutcome::Pushed)
            }
            (SyncAction::Noop, _) => {
                self.set_meta(SyncMetaKey::LastSyncAt, self.clock.now())
                    .await?;
                Ok(SyncOutcome::Noop)
            }
        }
    }

    async fn push(&self, remote: &dyn RemoteStore, user: &AuthUser) -> Result<()> {
        let snapshot = self.local.export_all_data().await?;
        let payload = snapshot.sanitized_for_upload().to_payload()?;
        let updated_at = self.clock.now();

        remote
            .upsert_remote_snapshot(&user.id, &payload, updated_at)
            .await?;

        self.set_meta(SyncMetaKey::LastRemoteAt, updated_at).await?;
        self.set_meta(SyncMetaKey::LastSyncAt, updated_at).await?;
        self.set_meta(SyncMetaKey::LocalChangedAt, updated_at)
            .await?;

        tracing::info!(
            records = snapshot.record_count(),
            updated_at = %updated_at,
            "Pushed local snapshot"
        );
        Ok(())
    }

    async fn pull(&self, record: RemoteRecord) -> Result<()> {
        let remote_updated_at = record.updated_at_instant();
        let snapshot = Snapshot::from_payload(record.payload)?;
        let records = snapshot.record_count();

        {
            let _untracked = self.local.change_feed().suppress();
            let api_key = self.local.get_api_key().await?;
            self.local
                .import_data(snapshot, ImportOptions::default())
                .await?;
            self.local.save_api_key(api_key.as_deref()).await?;
        }

        self.set_meta(SyncMetaKey::LastRemoteAt, remote_updated_at)
            .await?;
        self.set_meta(SyncMetaKey::LocalChangedAt, remote_updated_at)
            .await?;
        self.set_meta(SyncMetaKey::LastSyncAt, self.clock.now())
            .await?;

        tracing::info!(
            records,
            updated_at = %remote_updated_at,
            "Pulled remote snapshot"
        );
        Ok(())
    }

    async fn set_meta(&self, key: SyncMetaKey, at: SyncInstant) -> Result<()> {
        self.local.set_sync_meta(key, &at.to_rfc3339()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T1: SyncInstant = SyncInstant::from_millis(1_000);
    const T2: SyncInstant = SyncInstant::from_millis(2_000);
    const T3: SyncInstant = SyncInstant::from_millis(3_000);

    fn synced_at(at: SyncInstant) -> SyncMeta {
        SyncMeta {
            local_changed_at: at,
            last_remote_at: at,
            last_sync_at: at,
            has_synced: true,
        }
    }

    #[test]
    fn missing_remote_always_pushes() {
        assert_eq!(plan(&SyncMeta::default(), None, false), SyncAction::Push);
        assert_eq!(plan(&synced_at(T2), None, false), SyncAction::Push);
    }

    #[test]
    fn fresh_device_pulls_newer_remote() {
        assert_eq!(plan(&SyncMeta::default(), Some(T1), false), SyncAction::Pull);
    }

    #[test]
    fn fresh_device_pushes_when_remote_has_no_usable_timestamp() {
        assert_eq!(
            plan(&SyncMeta::default(), Some(SyncInstant::EPOCH), false),
            SyncAction::Push
        );
    }

    #[test]
    fn unchanged_sides_are_noop() {
        assert_eq!(plan(&synced_at(T2), Some(T2), false), SyncAction::Noop);
    }

    #[test]
    fn only_local_dirty_pushes() {
        let meta = SyncMeta {
            local_changed_at: T3,
            ..synced_at(T2)
        };
        assert_eq!(plan(&meta, Some(T2), false), SyncAction::Push);
    }

    #[test]
    fn only_remote_dirty_pulls() {
        assert_eq!(plan(&synced_at(T1), Some(T2), false), SyncAction::Pull);
    }

    #[test]
    fn conflict_goes_to_later_writer() {
        let meta = SyncMeta {
            local_changed_at: T2,
            ..synced_at(T1)
        };
        assert_eq!(plan(&meta, Some(T3), false), SyncAction::Pull);

        let meta = SyncMeta {
            local_changed_at: T3,
            ..synced_at(T1)
        };
        assert_eq!(plan(&meta, Some(T2), false), SyncAction::Push);
    }

    #[test]
    fn conflict_tie_pushes() {
        let meta = SyncMeta {
            local_changed_at: T2,
            ..synced_at(T1)
        };
        assert_eq!(plan(&meta, Some(T2), false), SyncAction::Push);
    }

    #[test]
    fn force_compares_timestamps_even_when_clean() {
        assert_eq!(plan(&synced_at(T2), Some(T2), true), SyncAction::Push);
        assert_eq!(plan(&synced_at(T1), Some(T1), true), SyncAction::Push);

        let stale_local = SyncMeta {
            local_changed_at: T1,
            ..synced_at(T2)
        };
        assert_eq!(plan(&stale_local, Some(T2), true), SyncAction::Pull);
    }

    #[test]
    fn outcome_labels_are_snake_case() {
        assert_eq!(SyncOutcome::SkippedNotAuthenticated.to_string(), "skipped_not_authenticated");
        assert_eq!(
            serde_json::to_value(SyncOutcome::Pulled).unwrap(),
            serde_json::json!("pulled")
        );
    }
}
