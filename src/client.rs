//! Read-only client for the source bookkeeping REST API.
//!
//! The API is session-based: an access token is exchanged for a short-lived
//! session token which every request carries. Collection endpoints page with
//! `limit`/`offset` and wrap results in an `items` array.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::{MigrationError, Result};
use crate::schema::{LedgerMeta, Mutation, RelationDetails};

/// Session tokens are valid for an hour; refresh ahead of that.
const SESSION_TTL: Duration = Duration::from_secs(55 * 60);

/// The API rejects page sizes above this.
pub const MAX_PAGE_LIMIT: usize = 500;

/// Anything capable of producing source mutations and their reference data.
#[async_trait]
pub trait MutationSource: Send + Sync {
    /// One page of mutations of the given type code. A page shorter than
    /// `limit` is the last page.
    async fn fetch_mutations_page(
        &self,
        type_code: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Mutation>>;

    async fn fetch_mutation(&self, id: i64) -> Result<Option<Mutation>>;

    async fn fetch_ledger(&self, id: i64) -> Result<Option<LedgerMeta>>;

    async fn fetch_relation(&self, id: i64) -> Result<Option<RelationDetails>>;
}

/// Fetch every mutation of one type, paging until a short page.
pub async fn fetch_all_of_type<S: MutationSource + ?Sized>(
    source: &S,
    type_code: i64,
    page_limit: usize,
) -> Result<Vec<Mutation>> {
    let limit = page_limit.clamp(1, MAX_PAGE_LIMIT);
    let mut all = Vec::new();
    let mut offset = 0;
    loop {
        let page = source.fetch_mutations_page(type_code, limit, offset).await?;
        let page_len = page.len();
        all.extend(page);
        if page_len < limit {
            break;
        }
        offset += limit;
    }
    info!("Fetched {} mutations of type {}", all.len(), type_code);
    Ok(all)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SessionRequest<'a> {
    access_token: &'a str,
    source: &'a str,
}

#[derive(Debug, Deserialize)]
struct SessionResponse {
    token: String,
}

#[derive(Debug, Deserialize)]
struct ItemsEnvelope<T> {
    items: Vec<T>,
}

#[derive(Debug)]
struct Session {
    token: String,
    obtained: Instant,
}

/// REST implementation of `MutationSource`.
pub struct RestClient {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    source_tag: String,
    max_retries: u32,
    session: Mutex<Option<Session>>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, access_token: impl Into<String>) -> Self {
        RestClient {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            access_token: access_token.into(),
            source_tag: "ledger-migrate".to_string(),
            max_retries: 3,
            session: Mutex::new(None),
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries.max(1);
        self
    }

    fn cached_token(&self) -> Option<String> {
        let guard = self.session.lock().unwrap();
        guard
            .as_ref()
            .filter(|s| s.obtained.elapsed() < SESSION_TTL)
            .map(|s| s.token.clone())
    }

    async fn session_token(&self) -> Result<String> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }
        debug!("Requesting new session token");
        let url = format!("{}/v1/session", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&SessionRequest {
                access_token: &self.access_token,
                source: &self.source_tag,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(MigrationError::ApiError {
                status: status.as_u16(),
                body,
            });
        }
        let session: SessionResponse = response.json().await?;
        let token = session.token.clone();
        *self.session.lock().unwrap() = Some(Session {
            token: session.token,
            obtained: Instant::now(),
        });
        Ok(token)
    }

    /// GET with session auth and bounded retry on transient failures.
    /// Returns `Ok(None)` on 404.
    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        let url = format!("{}{}", self.base_url, path);
        let mut last_error: Option<MigrationError> = None;

        for attempt in 1..=self.max_retries {
            let token = self.session_token().await?;
            let result = self
                .http
                .get(&url)
                .header("Authorization", &token)
                .send()
                .await;

            let error = match result {
                Ok(response) => {
                    let status = response.status();
                    if status.as_u16() == 404 {
                        return Ok(None);
                    }
                    if status.as_u16() == 401 {
                        // Session expired server-side; force a refresh.
                        *self.session.lock().unwrap() = None;
                        MigrationError::ApiError {
                            status: 401,
                            body: "session rejected".to_string(),
                        }
                    } else if status.is_success() {
                        return Ok(Some(response.json::<T>().await?));
                    } else {
                        let body = response.text().await.unwrap_or_default();
                        MigrationError::ApiError {
                            status: status.as_u16(),
                            body,
                        }
                    }
                }
                Err(e) => MigrationError::Http(e),
            };

            let retryable = error.is_transient()
                || matches!(&error, MigrationError::ApiError { status: 401, .. });
            if !retryable || attempt == self.max_retries {
                return Err(error);
            }
            warn!(
                "GET {} failed (attempt {}/{}): {}",
                path, attempt, self.max_retries, error
            );
            last_error = Some(error);
            tokio::time::sleep(Duration::from_millis(500 * u64::from(attempt))).await;
        }

        Err(last_error.unwrap_or(MigrationError::Transient {
            attempts: self.max_retries,
            reason: "retries exhausted".to_string(),
        }))
    }
}

#[async_trait]
impl MutationSource for RestClient {
    async fn fetch_mutations_page(
        &self,
        type_code: i64,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Mutation>> {
        let limit = limit.clamp(1, MAX_PAGE_LIMIT);
        let path = format!(
            "/v1/mutation?type={}&limit={}&offset={}",
            type_code, limit, offset
        );
        let envelope: Option<ItemsEnvelope<Mutation>> = self.get_json(&path).await?;
        Ok(envelope.map(|e| e.items).unwrap_or_default())
    }

    async fn fetch_mutation(&self, id: i64) -> Result<Option<Mutation>> {
        self.get_json(&format!("/v1/mutation/{}", id)).await
    }

    async fn fetch_ledger(&self, id: i64) -> Result<Option<LedgerMeta>> {
        self.get_json(&format!("/v1/ledger/{}", id)).await
    }

    async fn fetch_relation(&self, id: i64) -> Result<Option<RelationDetails>> {
        self.get_json(&format!("/v1/relation/{}", id)).await
    }
}
