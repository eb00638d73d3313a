//! Remote store access for regsync: Notion page payloads, the paginated
//! database client, and atomic hand-off file writes.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "regsync-storage";

pub const NOTION_VERSION: &str = "2022-06-28";
pub const DEFAULT_API_BASE: &str = "https://api.notion.com/v1";
pub const QUERY_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RichTextItem {
    pub text: TextContent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub name: String,
}

/// Typed property value in the shape the pages endpoints expect, e.g.
/// `{"number": 85}` or `{"select": {"name": "Sold"}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PropertyValue {
    Title(Vec<RichTextItem>),
    RichText(Vec<RichTextItem>),
    Number(serde_json::Number),
    Select(SelectOption),
}

impl PropertyValue {
    pub fn title(content: impl Into<String>) -> Self {
        Self::Title(vec![RichTextItem {
            text: TextContent {
                content: content.into(),
            },
        }])
    }

    pub fn rich_text(content: impl Into<String>) -> Self {
        Self::RichText(vec![RichTextItem {
            text: TextContent {
                content: content.into(),
            },
        }])
    }

    pub fn select(name: impl Into<String>) -> Self {
        Self::Select(SelectOption { name: name.into() })
    }

    pub fn integer(value: i64) -> Self {
        Self::Number(value.into())
    }

    /// `None` for NaN and infinities, which JSON cannot carry.
    pub fn decimal(value: f64) -> Option<Self> {
        serde_json::Number::from_f64(value).map(Self::Number)
    }

    /// Remote property type name as reported by the database schema.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Title(_) => "title",
            Self::RichText(_) => "rich_text",
            Self::Number(_) => "number",
            Self::Select(_) => "select",
        }
    }

    pub fn plain_text(&self) -> Option<String> {
        match self {
            Self::Title(items) | Self::RichText(items) => Some(
                items
                    .iter()
                    .map(|item| item.text.content.as_str())
                    .collect::<String>(),
            ),
            Self::Select(option) => Some(option.name.clone()),
            Self::Number(_) => None,
        }
    }
}

/// Property name -> value. Keys absent from the map are left untouched remotely.
pub type PropertyMap = BTreeMap<String, PropertyValue>;

/// One page of the target database, reduced to what the upsert needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePage {
    pub id: String,
    pub title: Option<String>,
}

impl RemotePage {
    /// Extract the page id and the plain text of `title_property` from a
    /// query result. Returns `None` when the result carries no id.
    pub fn from_json(value: &JsonValue, title_property: &str) -> Option<Self> {
        let id = value.get("id")?.as_str()?.to_string();
        let title = value
            .get("properties")
            .and_then(|props| props.get(title_property))
            .and_then(|prop| prop.get("title"))
            .and_then(|items| items.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("plain_text").and_then(|t| t.as_str()))
                    .collect::<String>()
            })
            .filter(|text| !text.trim().is_empty());
        Some(Self { id, title })
    }
}

/// Result of a full paginated read. `truncated` carries the HTTP status of the
/// query that stopped the listing early, if any.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteListing {
    pub pages: Vec<RemotePage>,
    pub truncated: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryPage {
    Page {
        results: Vec<RemotePage>,
        has_more: bool,
        next_cursor: Option<String>,
    },
    Rejected {
        status: u16,
        body: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied { page_id: String },
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseSchema {
    pub title: String,
    pub properties: BTreeMap<String, String>,
}

#[derive(Debug, Error)]
pub enum NotionError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid api key header value")]
    InvalidApiKey(#[from] reqwest::header::InvalidHeaderValue),
    #[error("http status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Remote page store the sync orchestrator writes through.
#[async_trait]
pub trait PageStore: Send + Sync {
    async fn list_all(&self, database_id: &str) -> Result<RemoteListing, NotionError>;

    async fn create_page(
        &self,
        database_id: &str,
        properties: &PropertyMap,
    ) -> Result<WriteOutcome, NotionError>;

    async fn update_page(
        &self,
        page_id: &str,
        properties: &PropertyMap,
    ) -> Result<WriteOutcome, NotionError>;
}

/// Drive a cursor-paginated query to exhaustion.
///
/// A rejected page ends the listing with whatever was collected so far; the
/// rejection status is reported in [`RemoteListing::truncated`] rather than
/// as an error. `delay` is slept after every page request, rejected or not.
pub async fn paginate<F, Fut>(mut fetch_page: F, delay: Duration) -> Result<RemoteListing, NotionError>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<QueryPage, NotionError>>,
{
    let mut listing = RemoteListing::default();
    let mut cursor: Option<String> = None;

    loop {
        let page = fetch_page(cursor.take()).await?;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match page {
            QueryPage::Page {
                results,
                has_more,
                next_cursor,
            } => {
                listing.pages.extend(results);
                debug!(retrieved = listing.pages.len(), "retrieved remote pages so far");
                match (has_more, next_cursor) {
                    (true, Some(next)) => cursor = Some(next),
                    _ => break,
                }
            }
            QueryPage::Rejected { status, body } => {
                warn!(
                    status,
                    %body,
                    retrieved = listing.pages.len(),
                    "database query rejected; listing stops early"
                );
                listing.truncated = Some(status);
                break;
            }
        }
    }

    Ok(listing)
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket allowing bursts of `per_second` requests, refilled evenly.
    pub fn per_second(per_second: u32) -> Self {
        let per_second = per_second.max(1);
        Self {
            capacity: per_second,
            refill_every: Duration::from_secs(1) / per_second,
        }
    }
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
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
                let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
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

#[derive(Clone)]
pub struct NotionClientConfig {
    pub api_key: String,
    pub api_base: String,
    pub title_property: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub request_delay: Duration,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl NotionClientConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_base: DEFAULT_API_BASE.to_string(),
            title_property: "Address".to_string(),
            timeout: Duration::from_secs(20),
            user_agent: None,
            request_delay: Duration::from_millis(300),
            token_bucket: None,
        }
    }
}

impl fmt::Debug for NotionClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionClientConfig")
            .field("api_key", &"<redacted>")
            .field("api_base", &self.api_base)
            .field("title_property", &self.title_property)
            .field("timeout", &self.timeout)
            .field("user_agent", &self.user_agent)
            .field("request_delay", &self.request_delay)
            .field("token_bucket", &self.token_bucket)
            .finish()
    }
}

#[derive(Debug, Serialize)]
struct QueryBody<'a> {
    page_size: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_cursor: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<JsonValue>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

#[derive(Debug, Serialize)]
struct DatabaseParent<'a> {
    database_id: &'a str,
}

#[derive(Debug, Serialize)]
struct CreatePageBody<'a> {
    parent: DatabaseParent<'a>,
    properties: &'a PropertyMap,
}

#[derive(Debug, Serialize)]
struct UpdatePageBody<'a> {
    properties: &'a PropertyMap,
}

/// HTTP client for one Notion integration token. Requests are issued one at a
/// time in caller order.
#[derive(Debug)]
pub struct NotionClient {
    client: reqwest::Client,
    api_base: String,
    title_property: String,
    request_delay: Duration,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl NotionClient {
    pub fn new(config: NotionClientConfig) -> Result<Self, NotionError> {
        let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.api_key))?;
        auth.set_sensitive(true);

        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, auth);
        headers.insert("Notion-Version", HeaderValue::from_static(NOTION_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client: builder.build()?,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            title_property: config.title_property,
            request_delay: config.request_delay,
            token_bucket,
        })
    }

    async fn throttle(&self) {
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }
    }

    async fn query_page(
        &self,
        database_id: &str,
        cursor: Option<String>,
    ) -> Result<QueryPage, NotionError> {
        self.throttle().await;
        let url = format!("{}/databases/{}/query", self.api_base, database_id);
        let body = QueryBody {
            page_size: QUERY_PAGE_SIZE,
            start_cursor: cursor.as_deref(),
        };

        let resp = self.client.post(&url).json(&body).send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Ok(QueryPage::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: QueryResponse = serde_json::from_slice(&resp.bytes().await?)?;
        let results = parsed
            .results
            .iter()
            .filter_map(|value| RemotePage::from_json(value, &self.title_property))
            .collect();
        Ok(QueryPage::Page {
            results,
            has_more: parsed.has_more,
            next_cursor: parsed.next_cursor,
        })
    }

    async fn send_write(&self, request: reqwest::RequestBuilder) -> Result<WriteOutcome, NotionError> {
        self.throttle().await;
        let resp = request.send().await?;
        let status = resp.status();
        if status != StatusCode::OK {
            let body = resp.text().await.unwrap_or_default();
            return Ok(WriteOutcome::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let bytes = resp.bytes().await?;
        let page_id = match serde_json::from_slice::<JsonValue>(&bytes) {
            Ok(body) => body
                .get("id")
                .and_then(|id| id.as_str())
                .unwrap_or_default()
                .to_string(),
            Err(err) => {
                debug!(error = %err, "write accepted with undecodable body");
                String::new()
            }
        };
        Ok(WriteOutcome::Applied { page_id })
    }

    /// Fetch the database title and its property name -> type table.
    pub async fn retrieve_database(&self, database_id: &str) -> Result<DatabaseSchema, NotionError> {
        self.throttle().await;
        let url = format!("{}/databases/{}", self.api_base, database_id);
        let resp = self
            .client
            .get(&url)
            .send()
            .instrument(info_span!("notion_retrieve_database", database_id))
            .await?;
        let status = resp.status();
        if status != StatusCode::OK {
            return Err(NotionError::HttpStatus {
                status: status.as_u16(),
                body: resp.text().await.unwrap_or_default(),
            });
        }

        let body: JsonValue = serde_json::from_slice(&resp.bytes().await?)?;
        Ok(parse_database_schema(&body))
    }
}

fn parse_database_schema(body: &JsonValue) -> DatabaseSchema {
    let title = body
        .get("title")
        .and_then(|t| t.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.get("plain_text").and_then(|t| t.as_str()))
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| "Untitled".to_string());

    let properties = body
        .get("properties")
        .and_then(|p| p.as_object())
        .map(|props| {
            props
                .iter()
                .map(|(name, prop)| {
                    let kind = prop
                        .get("type")
                        .and_then(|t| t.as_str())
                        .unwrap_or("unknown")
                        .to_string();
                    (name.clone(), kind)
                })
                .collect()
        })
        .unwrap_or_default();

    DatabaseSchema { title, properties }
}

#[async_trait]
impl PageStore for NotionClient {
    async fn list_all(&self, database_id: &str) -> Result<RemoteListing, NotionError> {
        let span = info_span!("notion_list_all", database_id);
        paginate(
            |cursor| self.query_page(database_id, cursor),
            self.request_delay,
        )
        .instrument(span)
        .await
    }

    async fn create_page(
        &self,
        database_id: &str,
        properties: &PropertyMap,
    ) -> Result<WriteOutcome, NotionError> {
        let url = format!("{}/pages", self.api_base);
        let body = CreatePageBody {
            parent: DatabaseParent { database_id },
            properties,
        };
        self.send_write(self.client.post(&url).json(&body))
            .instrument(info_span!("notion_create_page", database_id))
            .await
    }

    async fn update_page(
        &self,
        page_id: &str,
        properties: &PropertyMap,
    ) -> Result<WriteOutcome, NotionError> {
        let url = format!("{}/pages/{}", self.api_base, page_id);
        let body = UpdatePageBody { properties };
        self.send_write(self.client.patch(&url).json(&body))
            .instrument(info_span!("notion_update_page", page_id))
            .await
    }
}

/// One pending write in the hand-off file consumed by `apply`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandoffEntry {
    pub address: String,
    pub notion_properties: PropertyMap,
}

#[derive(Debug, Clone)]
pub struct WrittenFile {
    pub path: PathBuf,
    pub content_hash: String,
    pub byte_size: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a sibling temp file and rename, so readers
/// never observe a half-written file.
pub async fn write_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> anyhow::Result<WrittenFile> {
    let path = path.as_ref();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }

    Ok(WrittenFile {
        path: path.to_path_buf(),
        content_hash: sha256_hex(bytes),
        byte_size: bytes.len(),
    })
}

pub async fn write_handoff_file(
    path: impl AsRef<Path>,
    entries: &[HandoffEntry],
) -> anyhow::Result<WrittenFile> {
    let bytes = serde_json::to_vec_pretty(entries).context("serializing hand-off entries")?;
    write_atomic(path, &bytes).await
}

pub async fn read_handoff_file(path: impl AsRef<Path>) -> anyhow::Result<Vec<HandoffEntry>> {
    let path = path.as_ref();
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
