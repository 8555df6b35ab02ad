//! satchel-core - Core library for Satchel
//!
//! This crate contains the local-first sync engine, the local libSQL store,
//! and the Supabase identity and snapshot clients used by every Satchel
//! interface.

pub mod auth;
pub mod config;
pub mod error;
pub mod local;
pub mod remote;
pub mod sync;

pub use error::{Error, Result};
pub use sync::{SyncEngine, SyncOutcome, SyncPhase, SyncState};
