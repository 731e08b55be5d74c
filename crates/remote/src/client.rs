//! REST client for the hosted remote store.
//!
//! Talks to a PostgREST-style API: one resource per table under
//! `{base}/rest/v1/{table}`, rows addressed with `?{key_field}=eq.{key}`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};

use sitesync_core::config::SyncConfig;
use sitesync_core::sync::{
    record_key_from_payload, RemoteError, RemoteRecord, RemoteStoreTrait, DEFAULT_KEY_FIELD,
};

use crate::error::{RemoteClientError, Result};

const REST_PATH: &str = "rest/v1";
const MAX_LOG_BODY_CHARS: usize = 512;
/// Payload field whose timestamp versions a pulled row.
const VERSION_FIELD: &str = "updated_at";

/// Prefer header for inserts: a replayed insert updates the row it created.
const PREFER_UPSERT: &str = "resolution=merge-duplicates,return=minimal";
const PREFER_MINIMAL: &str = "return=minimal";

fn log_response(status: reqwest::StatusCode, body: &str) {
    if status.is_success() {
        debug!("[Remote] Response status: {}", status);
        return;
    }

    let mut preview = body.chars().take(MAX_LOG_BODY_CHARS).collect::<String>();
    if body.chars().count() > MAX_LOG_BODY_CHARS {
        preview.push_str("...");
    }
    debug!("[Remote] Response error ({}): {}", status, preview);
}

/// Millisecond version of a row, taken from its `updated_at` column when present.
fn row_version(row: &serde_json::Value) -> i64 {
    row.get(VERSION_FIELD)
        .and_then(|value| value.as_str())
        .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
        .map(|at| at.timestamp_millis())
        .unwrap_or(0)
}

/// Error body shape returned by PostgREST.
#[derive(Debug, serde::Deserialize)]
struct ApiErrorResponse {
    #[serde(default)]
    code: Option<String>,
    message: String,
}

/// HTTP implementation of [`RemoteStoreTrait`].
///
/// Polling only: the store exposes no change feed, so remote edits reach the
/// device on the coordinator's periodic timer or on an explicit sync.
#[derive(Debug, Clone)]
pub struct RestRemoteStore {
    client: reqwest::Client,
    base_url: String,
    key_field: String,
}

impl RestRemoteStore {
    /// Create a client for `base_url` authenticating with `api_key`.
    ///
    /// The key is sent both as `apikey` and as a bearer token.
    pub fn new(base_url: &str, api_key: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(RemoteClientError::invalid_request("Remote URL is empty"));
        }

        let client = reqwest::Client::builder()
            .default_headers(Self::headers(api_key)?)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.to_string(),
            key_field: DEFAULT_KEY_FIELD.to_string(),
        })
    }

    /// Build from `SITESYNC_REMOTE_URL` / `SITESYNC_REMOTE_API_KEY` settings.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let base_url = config
            .remote_url
            .as_deref()
            .ok_or_else(|| RemoteClientError::invalid_request("Remote URL is not configured"))?;
        let api_key = config
            .remote_api_key
            .as_deref()
            .ok_or_else(|| RemoteClientError::invalid_request("Remote API key is not configured"))?;
        Ok(Self::new(base_url, api_key, config.request_timeout)?.with_key_field(&config.key_field))
    }

    pub fn with_key_field(mut self, key_field: &str) -> Self {
        self.key_field = key_field.to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn headers(api_key: &str) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let key_value = HeaderValue::from_str(api_key)
            .map_err(|_| RemoteClientError::invalid_request("Invalid API key format"))?;
        headers.insert("apikey", key_value);

        let auth_value = HeaderValue::from_str(&format!("Bearer {}", api_key))
            .map_err(|_| RemoteClientError::invalid_request("Invalid API key format"))?;
        headers.insert(AUTHORIZATION, auth_value);

        Ok(headers)
    }

    fn table_url(&self, table: &str) -> String {
        format!(
            "{}/{}/{}",
            self.base_url,
            REST_PATH,
            urlencoding::encode(table)
        )
    }

    fn row_url(&self, table: &str, key: &str) -> String {
        format!(
            "{}?{}=eq.{}",
            self.table_url(table),
            urlencoding::encode(&self.key_field),
            urlencoding::encode(key)
        )
    }

    /// Read the body, turning non-2xx responses into [`RemoteClientError::Api`].
    async fn read_body(response: reqwest::Response) -> Result<String> {
        let status = response.status();
        let body = response.text().await?;
        log_response(status, &body);

        if status.is_success() {
            return Ok(body);
        }
        if let Ok(error) = serde_json::from_str::<ApiErrorResponse>(&body) {
            let message = match error.code {
                Some(code) => format!("{}: {}", code, error.message),
                None => error.message,
            };
            return Err(RemoteClientError::api(status.as_u16(), message));
        }
        Err(RemoteClientError::api(
            status.as_u16(),
            format!("Request failed: {}", body),
        ))
    }

    /// Every row of `table`.
    pub async fn list_rows(&self, table: &str) -> Result<Vec<RemoteRecord>> {
        let url = format!("{}?select=*", self.table_url(table));
        debug!("[Remote] GET {}", url);
        let response = self.client.get(&url).send().await?;
        let body = Self::read_body(response).await?;
        let rows: Vec<serde_json::Value> = serde_json::from_str(&body)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            let Some(key) = record_key_from_payload(&row, &self.key_field) else {
                warn!(
                    "[Remote] Skipping '{}' row without a '{}' value",
                    table, self.key_field
                );
                continue;
            };
            records.push(RemoteRecord {
                key,
                version: row_version(&row),
                payload: row,
            });
        }
        Ok(records)
    }

    pub async fn upsert_row(&self, table: &str, payload: &serde_json::Value) -> Result<()> {
        let url = self.table_url(table);
        debug!("[Remote] POST {}", url);
        let response = self
            .client
            .post(&url)
            .header("Prefer", PREFER_UPSERT)
            .json(payload)
            .send()
            .await?;
        Self::read_body(response).await?;
        Ok(())
    }

    pub async fn patch_row(
        &self,
        table: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> Result<()> {
        let url = self.row_url(table, key);
        debug!("[Remote] PATCH {}", url);
        let response = self
            .client
            .patch(&url)
            .header("Prefer", PREFER_MINIMAL)
            .json(payload)
            .send()
            .await?;
        Self::read_body(response).await?;
        Ok(())
    }

    pub async fn delete_row(&self, table: &str, key: &str) -> Result<()> {
        let url = self.row_url(table, key);
        debug!("[Remote] DELETE {}", url);
        let response = self
            .client
            .delete(&url)
            .header("Prefer", PREFER_MINIMAL)
            .send()
            .await?;
        Self::read_body(response).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteStoreTrait for RestRemoteStore {
    async fn fetch_table(
        &self,
        table: &str,
    ) -> std::result::Result<Vec<RemoteRecord>, RemoteError> {
        self.list_rows(table).await.map_err(RemoteError::from)
    }

    async fn insert(
        &self,
        table: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<(), RemoteError> {
        // The row must carry its key so the upsert can match a replay.
        let mut body = payload.clone();
        if let Some(fields) = body.as_object_mut() {
            fields
                .entry(self.key_field.clone())
                .or_insert_with(|| serde_json::Value::String(key.to_string()));
        }
        self.upsert_row(table, &body).await.map_err(RemoteError::from)
    }

    async fn update(
        &self,
        table: &str,
        key: &str,
        payload: &serde_json::Value,
    ) -> std::result::Result<(), RemoteError> {
        self.patch_row(table, key, payload)
            .await
            .map_err(RemoteError::from)
    }

    async fn delete(&self, table: &str, key: &str) -> std::result::Result<(), RemoteError> {
        self.delete_row(table, key).await.map_err(RemoteError::from)
    }
}
