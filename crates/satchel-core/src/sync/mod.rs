//! Local-first snapshot sync.
//!
//! A single remote row per user holds the latest full snapshot of the local
//! dataset. The [`Reconciler`] decides per pass whether to push, pull, or do
//! nothing; the [`SyncSequencer`] makes sure only one pass runs at a time; the
//! [`SyncEngine`] wires the trigger sources (startup, timer, local writes,
//! auth changes, connectivity, visibility) to the sequencer.

mod engine;
mod instant;
pub mod memory;
mod meta;
mod reconciler;
mod sequencer;
mod snapshot;
mod state;
mod store;

pub use engine::{SyncEngine, SyncEngineBuilder};
pub use instant::{Clock, SyncInstant, SystemClock};
pub use meta::{SyncMeta, SyncMetaKey, SYNC_META_PREFIX};
pub use reconciler::{plan, Reconciler, SyncAction, SyncOutcome};
pub use sequencer::{SyncRequest, SyncSequencer};
pub use snapshot::{is_reserved_setting_key, Snapshot, API_KEY_SETTING, SNAPSHOT_VERSION};
pub use state::{SyncPhase, SyncState, SyncStateHandle};
pub use store::{
    AuthEvent, IdentityProvider, ImportOptions, LocalChange, LocalChangeFeed, LocalStore,
    RemoteRecord, RemoteStore, SuppressionGuard,
};

/// Trigger reasons, used for logging only.
pub mod reason {
    pub const STARTUP: &str = "startup";
    pub const INTERVAL: &str = "interval";
    pub const LOCAL_CHANGE: &str = "local-change";
    pub const AUTH_CHANGE: &str = "auth-change";
    pub const ONLINE: &str = "online";
    pub const VISIBLE: &str = "visible";
    pub const MANUAL: &str = "manual";
}
