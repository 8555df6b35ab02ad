use std::path::Path;

use satchel_core::auth::AuthUser;
use satchel_core::config::BackendConfig;
use satchel_core::local::LocalDatabase;
use satchel_core::sync::{LocalStore, SyncInstant, SyncMeta};
use serde::Serialize;

use crate::auth::auth_client;
use crate::commands::common::{backend_config, open_database};
use crate::error::CliError;

#[derive(Debug, Serialize)]
pub struct StatusReport {
    pub configured: bool,
    pub supabase_url: Option<String>,
    pub snapshot_table: Option<String>,
    pub user: Option<AuthUser>,
    pub records: usize,
    pub api_key_stored: bool,
    pub local_changed_at: Option<String>,
    pub last_remote_at: Option<String>,
    pub last_sync_at: Option<String>,
    pub pending_changes: bool,
}

pub async fn run_status(as_json: bool, db_path: &Path) -> Result<(), CliError> {
    let backend = backend_config()?;
    let db = open_database(db_path).await?;

    let user = match backend.as_ref() {
        Some(config) => auth_client(config)?
            .restore_session()
            .await?
            .map(|session| session.user),
        None => None,
    };
    let report = build_status_report(&db, backend.as_ref(), user).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        for line in format_status_lines(&report) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn build_status_report(
    db: &LocalDatabase,
    backend: Option<&BackendConfig>,
    user: Option<AuthUser>,
) -> Result<StatusReport, CliError> {
    let meta = SyncMeta::load(db).await?;
    let records = db.list_records(None).await?.len();

    Ok(StatusReport {
        configured: backend.is_some(),
        supabase_url: backend.map(|config| config.supabase_url.clone()),
        snapshot_table: backend.map(|config| config.snapshot_table.clone()),
        user,
        records,
        api_key_stored: db.get_api_key().await?.is_some(),
        local_changed_at: instant_label(meta.local_changed_at),
        last_remote_at: instant_label(meta.last_remote_at),
        last_sync_at: meta.has_synced.then(|| meta.last_sync_at.to_rfc3339()),
        pending_changes: !meta.has_synced || meta.local_changed_at > meta.last_sync_at,
    })
}

fn instant_label(at: SyncInstant) -> Option<String> {
    (at != SyncInstant::EPOCH).then(|| at.to_rfc3339())
}

pub fn format_status_lines(report: &StatusReport) -> Vec<String> {
    let backend = match (&report.supabase_url, &report.snapshot_table) {
        (Some(url), Some(table)) => format!("{url} (table {table})"),
        _ => "not configured".to_string(),
    };
    let signed_in = report.user.as_ref().map_or_else(
        || "no".to_string(),
        |user| user.email.clone().unwrap_or_else(|| user.id.clone()),
    );

    vec![
        format!("Backend:        {backend}"),
        format!("Signed in:      {signed_in}"),
        format!("Records:        {}", report.records),
        format!(
            "API key:        {}",
            if report.api_key_stored { "stored" } else { "not stored" }
        ),
        format!(
            "Last sync:      {}",
            report.last_sync_at.as_deref().unwrap_or("never")
        ),
        format!(
            "Remote seen:    {}",
            report.last_remote_at.as_deref().unwrap_or("never")
        ),
        format!(
            "Local changes:  {}",
            if report.pending_changes { "pending" } else { "none" }
        ),
    ]
}
