//! HTTP transport, persisted vehicle store and health file storage for yardwatch.

mod pg;
mod store;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::CONTENT_TYPE;
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{info_span, warn, Instrument};
use uuid::Uuid;

pub use pg::PgVehicleStore;
pub use store::{open_store, InMemoryVehicleStore, JsonFileStore, VehicleStore};

pub const CRATE_NAME: &str = "yard-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: u16) -> RetryDisposition {
    if (500..600).contains(&status) || status == 429 {
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

/// Fixed-count, fixed-delay retry applied to base listing fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn single_attempt() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Empty,
    Form(String),
    Json(JsonValue),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Post,
            ..Self::get(url)
        }
    }

    pub fn post_form(url: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            body: RequestBody::Form(body.into()),
            ..Self::post(url)
        }
    }

    pub fn post_json(url: impl Into<String>, body: JsonValue) -> Self {
        Self {
            body: RequestBody::Json(body),
            ..Self::post(url)
        }
    }

    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    fn has_header(&self, name: &str) -> bool {
        self.headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.body)
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("transport unavailable: {0}")]
    Unavailable(String),
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => classify_status(*status),
            FetchError::Unavailable(_) => RetryDisposition::Retryable,
        }
    }
}

/// A single HTTP exchange. Implementations never retry; see [`execute_with_retry`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn execute(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError>;
}

/// Runs `request` under `policy`, sleeping `policy.backoff` between retryable failures.
pub async fn execute_with_retry(
    transport: &dyn Transport,
    request: &HttpRequest,
    policy: &RetryPolicy,
) -> Result<FetchedResponse, FetchError> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match transport.execute(request).await {
            Ok(response) => return Ok(response),
            Err(err)
                if attempt < max_attempts && err.disposition() == RetryDisposition::Retryable =>
            {
                warn!(
                    url = %request.url,
                    attempt,
                    max_attempts,
                    error = %err,
                    "base fetch failed; retrying in {:?}",
                    policy.backoff
                );
                tokio::time::sleep(policy.backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpFetcher {
    async fn execute(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", method = ?request.method, url = %request.url);
        async {
            let mut builder = match request.method {
                HttpMethod::Get => self.client.get(&request.url),
                HttpMethod::Post => self.client.post(&request.url),
            };
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            builder = match &request.body {
                RequestBody::Empty => builder,
                RequestBody::Form(body) => {
                    if !request.has_header("content-type") {
                        builder = builder.header(
                            CONTENT_TYPE,
                            "application/x-www-form-urlencoded; charset=UTF-8",
                        );
                    }
                    builder.body(body.clone())
                }
                RequestBody::Json(body) => builder.json(body),
            };

            let resp = builder.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status: status.as_u16(),
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Respond { status: u16, body: Vec<u8> },
    Fail(String),
}

#[derive(Debug)]
struct ReplayRoute {
    url_prefix: String,
    queue: VecDeque<Scripted>,
}

/// [`Transport`] that answers from canned responses keyed by URL prefix and records
/// every request it sees. Queued responses are served in order; the last one repeats.
#[derive(Debug, Default)]
pub struct ReplayTransport {
    routes: Mutex<Vec<ReplayRoute>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ReplayTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, url_prefix: &str, status: u16, body: impl Into<Vec<u8>>) -> Self {
        self.push(
            url_prefix,
            Scripted::Respond {
                status,
                body: body.into(),
            },
        );
        self
    }

    pub fn fail(self, url_prefix: &str, message: &str) -> Self {
        self.push(url_prefix, Scripted::Fail(message.to_string()));
        self
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn push(&self, url_prefix: &str, scripted: Scripted) {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        match routes.iter_mut().find(|r| r.url_prefix == url_prefix) {
            Some(route) => route.queue.push_back(scripted),
            None => routes.push(ReplayRoute {
                url_prefix: url_prefix.to_string(),
                queue: VecDeque::from([scripted]),
            }),
        }
    }

    fn next_for(&self, url: &str) -> Option<Scripted> {
        let mut routes = self.routes.lock().unwrap_or_else(PoisonError::into_inner);
        let route = routes
            .iter_mut()
            .filter(|r| url.starts_with(&r.url_prefix))
            .max_by_key(|r| r.url_prefix.len())?;
        if route.queue.len() > 1 {
            route.queue.pop_front()
        } else {
            route.queue.front().cloned()
        }
    }
}

#[async_trait]
impl Transport for ReplayTransport {
    async fn execute(&self, request: &HttpRequest) -> Result<FetchedResponse, FetchError> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(request.clone());

        match self.next_for(&request.url) {
            Some(Scripted::Respond { status, body }) if (200..300).contains(&status) => {
                Ok(FetchedResponse {
                    status,
                    final_url: request.url.clone(),
                    body,
                })
            }
            Some(Scripted::Respond { status, .. }) => Err(FetchError::HttpStatus {
                status,
                url: request.url.clone(),
            }),
            Some(Scripted::Fail(message)) => Err(FetchError::Unavailable(message)),
            None => Err(FetchError::Unavailable(format!(
                "no replay route for {}",
                request.url
            ))),
        }
    }
}

/// True when `value` parses as an absolute URL with both a scheme and a host.
pub fn is_well_formed_url(value: &str) -> bool {
    reqwest::Url::parse(value.trim())
        .map(|url| !url.scheme().is_empty() && url.host_str().is_some_and(|h| !h.is_empty()))
        .unwrap_or(false)
}

/// Filesystem-safe slug for partition ids.
pub fn path_slug(input: &str) -> String {
    let slug = input
        .trim()
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-");
    if slug.is_empty() {
        "unnamed".to_string()
    } else {
        slug
    }
}

/// Replace `path` with `bytes` through a temp file + rename in the same directory.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
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
    Ok(())
}

pub const HEALTH_FILE_NAME: &str = "health_status.txt";

/// Per-partition health token files, overwritten every run.
#[derive(Debug, Clone)]
pub struct HealthFileStore {
    root: PathBuf,
}

impl HealthFileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, partition: &str) -> PathBuf {
        self.root.join(path_slug(partition)).join(HEALTH_FILE_NAME)
    }

    pub async fn write(&self, partition: &str, token: &str) -> anyhow::Result<PathBuf> {
        let path = self.path_for(partition);
        write_atomic(&path, token.as_bytes()).await?;
        Ok(path)
    }

    pub async fn read(&self, partition: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_for(partition);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Ok(Some(text.trim().to_string()))
    }
}
