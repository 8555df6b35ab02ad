use std::path::Path;
use std::sync::Arc;

use satchel_core::SyncOutcome;

use crate::commands::common::{backend_config, build_engine, open_database};
use crate::error::CliError;

pub async fn run_sync(force: bool, db_path: &Path) -> Result<(), CliError> {
    let backend = backend_config()?.ok_or(CliError::SyncNotConfigured)?;
    let db = Arc::new(open_database(db_path).await?);
    let engine = build_engine(db, Some(&backend))?;

    let outcome = engine.sync_now(force).await?;
    if outcome == SyncOutcome::SkippedNotConfigured {
        return Err(CliError::SyncNotConfigured);
    }
    println!("{}", describe_outcome(outcome));
    Ok(())
}

pub const fn describe_outcome(outcome: SyncOutcome) -> &'static str {
    match outcome {
        SyncOutcome::SkippedNotConfigured => "Sync is not configured",
        SyncOutcome::SkippedNotAuthenticated => "Not signed in. Run `satchel auth login` first.",
        SyncOutcome::Pushed => "Pushed local data to the remote snapshot",
        SyncOutcome::Pulled => "Pulled the remote snapshot",
        SyncOutcome::Noop => "Already up to date",
        SyncOutcome::Queued => "A sync is already running; request queued",
    }
}
