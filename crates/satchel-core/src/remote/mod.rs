//! Supabase (PostgREST) client for the per-user snapshot table.
//!
//! The table holds one row per user: `user_id` (primary key), `payload`
//! (jsonb) and `updated_at` (timestamptz). Row-level security restricts each
//! user to their own row, so every request carries the user's access token.

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;

use crate::auth::{parse_api_error, AccessTokenSource};
use crate::config::BackendConfig;
use crate::error::{Error, Result};
use crate::sync::{RemoteRecord, RemoteStore, SyncInstant};

const SNAPSHOT_COLUMNS: &str = "user_id,payload,updated_at";

#[derive(Clone)]
pub struct SupabaseSnapshotStore {
    rest_url: String,
    table: String,
    anon_key: String,
    client: Client,
    tokens: Arc<dyn AccessTokenSource>,
}

impl SupabaseSnapshotStore {
    pub fn new(config: &BackendConfig, tokens: Arc<dyn AccessTokenSource>) -> Result<Self> {
        Ok(Self {
            rest_url: config.rest_url(),
            table: config.snapshot_table.clone(),
            anon_key: config.supabase_anon_key.clone(),
            client: Client::builder().build()?,
            tokens,
        })
    }

    fn table_url(&self) -> String {
        format!("{}/{}", self.rest_url, self.table)
    }

    fn fetch_url(&self, user_id: &str) -> String {
        format!(
            "{}?user_id=eq.{}&select={SNAPSHOT_COLUMNS}&limit=1",
            self.table_url(),
            urlencoding::encode(user_id)
        )
    }

    fn upsert_url(&self) -> String {
        format!("{}?on_conflict=user_id", self.table_url())
    }

    async fn authorized(&self, request: RequestBuilder) -> Result<RequestBuilder> {
        let access_token = self.tokens.access_token().await?;
        Ok(request
            .header("apikey", &self.anon_key)
            .bearer_auth(access_token))
    }
}

impl std::fmt::Debug for SupabaseSnapshotStore {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("SupabaseSnapshotStore")
            .field("rest_url", &self.rest_url)
            .field("table", &self.table)
            .field("anon_key", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotRow {
    user_id: String,
    #[serde(default)]
    payload: Value,
    updated_at: Option<String>,
}

impl From<SnapshotRow> for RemoteRecord {
    fn from(row: SnapshotRow) -> Self {
        Self {
            user_id: row.user_id,
            payload: row.payload,
            updated_at: row.updated_at.unwrap_or_default(),
        }
    }
}

#[async_trait]
impl RemoteStore for SupabaseSnapshotStore {
    async fn fetch_remote_snapshot(&self, user_id: &str) -> Result<Option<RemoteRecord>> {
        let request = self
            .authorized(
                self.client
                    .get(self.fetch_url(user_id))
                    .header("Accept", "application/json"),
            )
            .await?;

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Remote(parse_api_error(status, &body)));
        }

        let rows = response.json::<Vec<SnapshotRow>>().await?;
        Ok(rows.into_iter().next().map(RemoteRecord::from))
    }

    async fn upsert_remote_snapshot(
        &self,
        user_id: &str,
        payload: &Value,
        updated_at: SyncInstant,
    ) -> Result<()> {
        let body = serde_json::json!({
            "user_id": user_id,
            "payload": payload,
            "updated_at": updated_at.to_rfc3339(),
        });
        let request = self
            .authorized(
                self.client
                    .post(self.upsert_url())
                    .header("Prefer", "resolution=merge-duplicates,return=minimal")
                    .json(&body),
            )
            .await?;

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Remote(parse_api_error(status, &body)));
        }

        tracing::debug!(user_id, updated_at = %updated_at, "Upserted remote snapshot");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::auth::AuthResult;

    struct FixedToken;

    #[async_trait]
    impl AccessTokenSource for FixedToken {
        async fn access_token(&self) -> AuthResult<String> {
            Ok("token".to_string())
        }
    }

    fn store() -> SupabaseSnapshotStore {
        let config = BackendConfig::resolve(
            Some("https://demo.supabase.co/".to_string()),
            Some("anon".to_string()),
            None,
        )
        .unwrap()
        .unwrap();
        SupabaseSnapshotStore::new(&config, Arc::new(FixedToken)).unwrap()
    }

    #[test]
    fn fetch_url_filters_by_user() {
        assert_eq!(
            store().fetch_url("user 1"),
            "https://demo.supabase.co/rest/v1/user_snapshots?user_id=eq.user%201&select=user_id,payload,updated_at&limit=1"
        );
    }

    #[test]
    fn upsert_url_targets_user_conflict() {
        assert_eq!(
            store().upsert_url(),
            "https://demo.supabase.co/rest/v1/user_snapshots?on_conflict=user_id"
        );
    }

    #[test]
    fn row_without_timestamp_maps_to_empty_string() {
        let row: SnapshotRow =
            serde_json::from_str(r#"{"user_id":"u1","payload":{"version":1},"updated_at":null}"#)
                .unwrap();
        let record = RemoteRecord::from(row);
        assert_eq!(record.updated_at, "");
        assert_eq!(record.updated_at_instant(), SyncInstant::EPOCH);
    }

    #[test]
    fn debug_hides_anon_key() {
        assert!(!format!("{:?}", store()).contains("anon\""));
    }
}
