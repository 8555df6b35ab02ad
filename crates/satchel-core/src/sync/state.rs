//! Observable sync status for UI listeners.

use serde::Serialize;
use tokio::sync::watch;

use super::instant::SyncInstant;
use crate::auth::AuthUser;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    /// No backend configured for this build
    Disabled,
    /// Backend configured but nobody is signed in
    SignedOut,
    #[default]
    Idle,
    Syncing,
    Error,
}

impl SyncPhase {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::SignedOut => "signed_out",
            Self::Idle => "idle",
            Self::Syncing => "syncing",
            Self::Error => "error",
        }
    }
}

/// Process-local sync status. Never persisted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SyncState {
    pub configured: bool,
    pub authenticated: bool,
    pub user: Option<AuthUser>,
    pub in_progress: bool,
    pub phase: SyncPhase,
    pub message: Option<String>,
    /// RFC 3339 instant of the last completed pass
    pub last_sync_at: Option<String>,
    pub last_error: Option<String>,
}

/// Shared publisher of [`SyncState`].
///
/// Subscribers see the current value immediately and every later transition.
#[derive(Clone)]
pub struct SyncStateHandle {
    sender: watch::Sender<SyncState>,
}

impl SyncStateHandle {
    pub fn new(configured: bool) -> Self {
        let initial = SyncState {
            configured,
            phase: if configured {
                SyncPhase::Idle
            } else {
                SyncPhase::Disabled
            },
            ..SyncState::default()
        };
        let (sender, _) = watch::channel(initial);
        Self { sender }
    }

    pub fn current(&self) -> SyncState {
        self.sender.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.sender.subscribe()
    }

    pub(crate) fn set_disabled(&self) {
        self.sender.send_modify(|state| {
            state.configured = false;
            state.in_progress = false;
            state.phase = SyncPhase::Disabled;
            state.message = Some("Sync is not configured".to_string());
        });
    }

    pub(crate) fn set_signed_out(&self) {
        self.sender.send_modify(|state| {
            state.authenticated = false;
            state.user = None;
            state.in_progress = false;
            if state.configured {
                state.phase = SyncPhase::SignedOut;
                state.message = Some("Sign in to sync".to_string());
            }
        });
    }

    pub(crate) fn set_authenticated(&self, user: AuthUser) {
        self.sender.send_modify(|state| {
            state.authenticated = true;
            state.user = Some(user);
            if matches!(state.phase, SyncPhase::SignedOut) {
                state.phase = SyncPhase::Idle;
                state.message = None;
            }
        });
    }

    pub(crate) fn begin_sync(&self, user: &AuthUser) {
        self.sender.send_modify(|state| {
            state.configured = true;
            state.authenticated = true;
            state.user = Some(user.clone());
            state.in_progress = true;
            state.phase = SyncPhase::Syncing;
            state.message = Some("Syncing…".to_string());
        });
    }

    pub(crate) fn finish_sync(&self, at: SyncInstant) {
        let at = at.to_rfc3339();
        self.sender.send_modify(|state| {
            state.in_progress = false;
            state.phase = SyncPhase::Idle;
            state.message = Some(format!("Last synced {at}"));
            state.last_sync_at = Some(at);
            state.last_error = None;
        });
    }

    pub(crate) fn fail(&self, message: String) {
        self.sender.send_modify(|state| {
            state.in_progress = false;
            state.phase = SyncPhase::Error;
            state.message = Some(format!("Sync failed: {message}"));
            state.last_error = Some(message);
        });
    }
}
