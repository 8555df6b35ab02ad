use std::path::Path;
use std::sync::Arc;

use satchel_core::config::SyncTimings;
use satchel_core::sync::memory::{MemoryLocalStore, MemoryRemoteStore, StaticIdentity};
use satchel_core::sync::{ImportOptions, LocalStore, RemoteStore, SyncEngine, SyncState};

use crate::commands::common::{backend_config, build_engine, open_database};
use crate::error::CliError;

const EPHEMERAL_USER: &str = "local-user";

pub async fn run_watch(ephemeral: bool, db_path: &Path) -> Result<(), CliError> {
    let db = open_database(db_path).await?;

    let engine = if ephemeral {
        let local = Arc::new(MemoryLocalStore::new());
        local
            .import_data(db.export_all_data().await?, ImportOptions::default())
            .await?;
        let remote: Arc<dyn RemoteStore> = Arc::new(MemoryRemoteStore::new());
        println!("Ephemeral mode: syncing a copy of local data against an in-memory backend");
        SyncEngine::builder(local, Arc::new(StaticIdentity::signed_in(EPHEMERAL_USER)))
            .remote(Some(remote))
            .timings(SyncTimings::from_env())
            .build()
    } else {
        let backend = backend_config()?;
        if backend.is_none() {
            println!("Sync is not configured; the engine stays disabled.");
        }
        build_engine(Arc::new(db), backend.as_ref())?
    };

    let mut states = engine.subscribe_state();
    engine.start();
    println!("{}", format_state_line(&states.borrow_and_update()));

    loop {
        tokio::select! {
            changed = states.changed() => {
                if changed.is_err() {
                    break;
                }
                println!("{}", format_state_line(&states.borrow_and_update()));
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                break;
            }
        }
    }

    engine.shutdown().await;
    println!("Stopped");
    Ok(())
}

pub fn format_state_line(state: &SyncState) -> String {
    let mut line = format!("[{}]", state.phase.as_str());
    if let Some(user) = &state.user {
        line.push_str(&format!(" {}", user.email.as_deref().unwrap_or(&user.id)));
    }
    if let Some(message) = &state.message {
        line.push_str(&format!(" {message}"));
    }
    line
}
