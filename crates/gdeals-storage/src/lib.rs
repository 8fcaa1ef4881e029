//! Deal document storage + HTTP fetch utilities for gdeals.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gdeals_core::{Deal, Tag, TagKind};
use reqwest::{Method, StatusCode};
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

/// Key of the singleton row tracking the last tag catalog refresh.
pub const FETCH_TIME_ID: i16 = 0;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored document is malformed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DealFilter {
    pub active_only: bool,
}

impl DealFilter {
    pub fn all() -> Self {
        Self { active_only: false }
    }

    pub fn active() -> Self {
        Self { active_only: true }
    }
}

/// Document-style persistence for deals, the tag catalog and its fetch timestamp.
///
/// Every method is atomic on its own; callers get no cross-call transaction.
#[async_trait]
pub trait DealStore: Send + Sync {
    /// Inserts `deal` unless its id already exists. Returns whether a row was written.
    async fn insert_deal(&self, deal: &Deal) -> Result<bool, StoreError>;

    /// Replaces the stored document with the same id. With `upsert`, a missing id is inserted.
    async fn update_deal(&self, deal: &Deal, upsert: bool) -> Result<bool, StoreError>;

    async fn find_deals(&self, filter: DealFilter) -> Result<Vec<Deal>, StoreError>;

    async fn get_deal(&self, id: i64) -> Result<Option<Deal>, StoreError>;

    async fn delete_deal(&self, id: i64) -> Result<bool, StoreError>;

    /// Flips `active` to false. Returns false when the deal is missing or already inactive.
    async fn deactivate_deal(&self, id: i64) -> Result<bool, StoreError>;

    async fn load_tags(&self) -> Result<Vec<Tag>, StoreError>;

    /// Swaps the whole tag set and stamps the fetch time in one step.
    async fn replace_tags(&self, tags: &[Tag], fetched_at: DateTime<Utc>) -> Result<(), StoreError>;

    async fn tags_fetched_at(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    async fn close(&self);
}

#[derive(Debug, Clone)]
pub struct PgDealStore {
    pool: PgPool,
}

impl PgDealStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

fn decode_deal(row: &sqlx::postgres::PgRow) -> Result<Deal, StoreError> {
    let Json(deal): Json<Deal> = row.try_get("doc")?;
    Ok(deal)
}

#[async_trait]
impl DealStore for PgDealStore {
    async fn insert_deal(&self, deal: &Deal) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO deals (id, active, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(deal.id)
        .bind(deal.active)
        .bind(Json(deal))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn update_deal(&self, deal: &Deal, upsert: bool) -> Result<bool, StoreError> {
        let sql = if upsert {
            r#"
            INSERT INTO deals (id, active, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
               SET active = EXCLUDED.active,
                   doc = EXCLUDED.doc,
                   updated_at = NOW()
            "#
        } else {
            r#"
            UPDATE deals
               SET active = $2,
                   doc = $3,
                   updated_at = NOW()
             WHERE id = $1
            "#
        };
        let result = sqlx::query(sql)
            .bind(deal.id)
            .bind(deal.active)
            .bind(Json(deal))
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find_deals(&self, filter: DealFilter) -> Result<Vec<Deal>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc
              FROM deals
             WHERE ($1 = FALSE OR active)
             ORDER BY id
            "#,
        )
        .bind(filter.active_only)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(decode_deal).collect()
    }

    async fn get_deal(&self, id: i64) -> Result<Option<Deal>, StoreError> {
        let row = sqlx::query("SELECT doc FROM deals WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(decode_deal).transpose()
    }

    async fn delete_deal(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM deals WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn deactivate_deal(&self, id: i64) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE deals
               SET active = FALSE,
                   doc = jsonb_set(doc, '{active}', 'false'::jsonb),
                   updated_at = NOW()
             WHERE id = $1
               AND active
            "#,
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn load_tags(&self) -> Result<Vec<Tag>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT catalog_tag_id, kind, name
              FROM tags
             ORDER BY kind, catalog_tag_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.try_get("kind")?;
            let kind = TagKind::parse(&kind)
                .ok_or_else(|| StoreError::Decode(format!("unknown tag kind {kind}")))?;
            out.push(Tag {
                catalog_tag_id: row.try_get("catalog_tag_id")?,
                name: row.try_get("name")?,
                kind,
            });
        }
        Ok(out)
    }

    async fn replace_tags(&self, tags: &[Tag], fetched_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM tags").execute(&mut *tx).await?;
        for tag in tags {
            sqlx::query(
                r#"
                INSERT INTO tags (catalog_tag_id, kind, name)
                VALUES ($1, $2, $3)
                ON CONFLICT (catalog_tag_id, kind) DO UPDATE SET name = EXCLUDED.name
                "#,
            )
            .bind(tag.catalog_tag_id)
            .bind(tag.kind.as_str())
            .bind(&tag.name)
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            r#"
            INSERT INTO fetch_time (id, fetched_at)
            VALUES ($1, $2)
            ON CONFLICT (id) DO UPDATE SET fetched_at = EXCLUDED.fetched_at
            "#,
        )
        .bind(FETCH_TIME_ID)
        .bind(fetched_at)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn tags_fetched_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let row = sqlx::query("SELECT fetched_at FROM fetch_time WHERE id = $1")
            .bind(FETCH_TIME_ID)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row
            .map(|r| r.try_get::<DateTime<Utc>, _>("fetched_at"))
            .transpose()?)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    deals: BTreeMap<i64, Deal>,
    tags: Vec<Tag>,
    fetched_at: Option<DateTime<Utc>>,
}

/// In-process store backing the pipeline and API tests.
#[derive(Debug, Default)]
pub struct MemoryDealStore {
    state: Mutex<MemoryState>,
}

impl MemoryDealStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_deals(deals: impl IntoIterator<Item = Deal>) -> Self {
        let state = MemoryState {
            deals: deals.into_iter().map(|d| (d.id, d)).collect(),
            ..Default::default()
        };
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn snapshot(&self) -> Vec<Deal> {
        self.state.lock().await.deals.values().cloned().collect()
    }
}

#[async_trait]
impl DealStore for MemoryDealStore {
    async fn insert_deal(&self, deal: &Deal) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if state.deals.contains_key(&deal.id) {
            return Ok(false);
        }
        state.deals.insert(deal.id, deal.clone());
        Ok(true)
    }

    async fn update_deal(&self, deal: &Deal, upsert: bool) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !upsert && !state.deals.contains_key(&deal.id) {
            return Ok(false);
        }
        state.deals.insert(deal.id, deal.clone());
        Ok(true)
    }

    async fn find_deals(&self, filter: DealFilter) -> Result<Vec<Deal>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .deals
            .values()
            .filter(|d| !filter.active_only || d.active)
            .cloned()
            .collect())
    }

    async fn get_deal(&self, id: i64) -> Result<Option<Deal>, StoreError> {
        Ok(self.state.lock().await.deals.get(&id).cloned())
    }

    async fn delete_deal(&self, id: i64) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.deals.remove(&id).is_some())
    }

    async fn deactivate_deal(&self, id: i64) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.deals.get_mut(&id) {
            Some(deal) if deal.active => {
                deal.active = false;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn load_tags(&self) -> Result<Vec<Tag>, StoreError> {
        Ok(self.state.lock().await.tags.clone())
    }

    async fn replace_tags(&self, tags: &[Tag], fetched_at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.tags = tags.to_vec();
        state.fetched_at = Some(fetched_at);
        Ok(())
    }

    async fn tags_fetched_at(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.state.lock().await.fetched_at)
    }

    async fn close(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 1,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// `None` leaves the transport default in place.
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: None,
            user_agent: None,
            global_concurrency: 16,
            per_source_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub method: Method,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<String>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    pub fn post(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            method: Method::POST,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body.into()),
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("request limiter closed")]
    LimiterClosed,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
            FetchError::LimiterClosed => None,
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| anyhow::anyhow!("building reqwest client: {err}"))?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    fn build(&self, request: &FetchRequest) -> reqwest::RequestBuilder {
        let mut builder = self.client.request(request.method.clone(), &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            builder = builder.body(body.clone());
        }
        builder
    }

    /// Sends `request` under the global and per-source limits, retrying retryable failures.
    pub async fn execute(
        &self,
        source_id: &str,
        request: FetchRequest,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        let span = info_span!("http_fetch", source_id, method = %request.method, url = %request.url);
        self.execute_with_retries(&request).instrument(span).await
    }

    async fn execute_with_retries(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            match self.build(request).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        debug!(%status, attempt, "retrying after retryable status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries {
                        debug!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }

    pub async fn fetch_bytes(&self, source_id: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.execute(source_id, FetchRequest::get(url)).await
    }

    /// Follows redirects from `url` and returns the last URL reached, even when
    /// the destination answers with an error status. No retries, body is not read.
    pub async fn resolve_redirect(&self, source_id: &str, url: &str) -> Result<String, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        match self.client.get(url).send().await {
            Ok(resp) => Ok(resp.url().to_string()),
            Err(err) => match err.url() {
                Some(reached) if reached.as_str() != url => Ok(reached.to_string()),
                _ => Err(FetchError::Request(err)),
            },
        }
    }
}
