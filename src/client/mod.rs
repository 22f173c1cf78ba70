//! Replaying HTTP client
//!
//! `Client` answers requests from the active cache transaction when it can. On a
//! miss it waits for the access gate, performs the real request, stores the
//! response, and only then releases the gate. Every response, fresh or cached, is
//! read back from the cache entry so both paths look the same to the caller.

mod download;
mod local;

pub use download::download;

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use reqwest::header::{CONTENT_TYPE, TRANSFER_ENCODING};
use reqwest::{Method, Request, Response, Url, Version};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::cache::{CacheEntry, CacheError, CacheStore, CachedResponse, RequestView, ResponseHead, Transaction};
use crate::gate::{AccessGate, GateError};

/// Errors that can occur while issuing a request through the client
#[derive(Debug, Error)]
pub enum ClientError {
    /// No transaction has been selected yet
    #[error("not started transaction")]
    NoTransaction,

    /// Cache read or write failed
    #[error(transparent)]
    Cache(#[from] CacheError),

    /// Waiting for the access gate was cancelled
    #[error(transparent)]
    Gate(#[from] GateError),

    /// HTTP request failed
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Failed to encode a JSON payload
    #[error("Failed to encode JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    /// The URL could not be parsed
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    /// A `file://` URL did not map to a local path
    #[error("Invalid file URL: {0}")]
    InvalidFileUrl(String),

    /// The server answered with a status the caller did not accept
    #[error("Unexpected HTTP status: {0}")]
    UnexpectedStatus(u16),

    /// Local I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Settings used to build a `Client`
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Root directory of the response cache
    pub cache_dir: PathBuf,
    /// Minimum spacing between outbound requests
    pub interval: Duration,
    /// Number of transactions to keep
    pub retention: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            interval: Duration::from_secs(2),
            retention: 15,
        }
    }
}

/// XDG-compliant cache directory (`~/.cache/crawlcache/` on Linux)
///
/// Falls back to `.crawlcache` in the working directory when no home directory exists.
pub fn default_cache_dir() -> PathBuf {
    ProjectDirs::from("", "", "crawlcache")
        .map(|dirs| dirs.cache_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from(".crawlcache"))
}

/// HTTP client with a transaction cache and an access gate
#[derive(Debug)]
pub struct Client {
    http: reqwest::Client,
    gate: AccessGate,
    store: CacheStore,
    transaction: Option<Transaction>,
    cancel: CancellationToken,
}

impl Client {
    /// Opens the cache described by `config`
    ///
    /// `cancel` aborts pending waits on the access gate.
    pub fn new(config: &ClientConfig, cancel: CancellationToken) -> Result<Self, ClientError> {
        Self::with_http_client(config, cancel, reqwest::Client::new())
    }

    /// Like `new`, with a custom HTTP client
    pub fn with_http_client(
        config: &ClientConfig,
        cancel: CancellationToken,
        http: reqwest::Client,
    ) -> Result<Self, ClientError> {
        let store = CacheStore::open(&config.cache_dir, config.retention)?;
        Ok(Self {
            http,
            gate: AccessGate::new(config.interval),
            store,
            transaction: None,
            cancel,
        })
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    /// The transaction requests are currently answered from
    pub fn transaction(&self) -> Option<&Transaction> {
        self.transaction.as_ref()
    }

    /// Starts a new transaction and switches to it
    pub fn new_transaction(&mut self) -> Result<&Transaction, ClientError> {
        let tx = self.store.create_transaction()?.clone();
        Ok(&*self.transaction.insert(tx))
    }

    /// Resumes the most recent transaction, creating one if there is none
    pub fn last_transaction(&mut self) -> Result<&Transaction, ClientError> {
        let tx = self.store.last_transaction()?.clone();
        Ok(&*self.transaction.insert(tx))
    }

    /// Switches to a retained transaction by name
    pub fn set_transaction(&mut self, name: &str) -> Result<&Transaction, ClientError> {
        let tx = self.store.get_transaction(name)?.clone();
        Ok(&*self.transaction.insert(tx))
    }

    /// Sends a request, or replays it from the active transaction
    pub async fn execute(&self, request: Request) -> Result<CachedResponse, ClientError> {
        let tx = self.transaction.as_ref().ok_or(ClientError::NoTransaction)?;
        let entry = tx.entry_for(&request)?;

        if entry.exists() {
            debug!(method = %request.method(), url = %request.url(), "cache hit");
        } else {
            debug!(method = %request.method(), url = %request.url(), "cache miss");
            self.fetch_and_store(&entry, request).await?;
        }
        Ok(entry.load()?)
    }

    async fn fetch_and_store(&self, entry: &CacheEntry, request: Request) -> Result<(), ClientError> {
        let guard = self.gate.lock(&self.cancel).await?;

        // Another task may have stored the entry while this one was queued
        if entry.exists() {
            debug!(method = %request.method(), url = %request.url(), "stored while waiting for the gate");
            guard.unlock();
            return Ok(());
        }

        if *request.method() == Method::GET && request.url().scheme() == "file" {
            let path = request
                .url()
                .to_file_path()
                .map_err(|()| ClientError::InvalidFileUrl(request.url().to_string()))?;
            let (head, mut body) = local::file_response(&path)?;
            entry.store(&head, &mut body)?;
        } else {
            let response = self.http.execute(request).await?;
            let head = response_head(&response);
            let body = response.bytes().await?;
            entry.store(&head, &mut &body[..])?;
        }

        guard.unlock();
        Ok(())
    }

    /// Issues a GET request
    ///
    /// `file://` URLs are answered from the local filesystem.
    pub async fn get(&self, url: &str) -> Result<CachedResponse, ClientError> {
        let request = Request::new(Method::GET, Url::parse(url)?);
        self.execute(request).await
    }

    /// Issues a HEAD request
    pub async fn head(&self, url: &str) -> Result<CachedResponse, ClientError> {
        let request = Request::new(Method::HEAD, Url::parse(url)?);
        self.execute(request).await
    }

    /// Issues a POST request with the given content type
    ///
    /// For form and JSON payloads `post_form` and `post_json` are simpler.
    ///
    /// # Arguments
    /// * `url` - Target URL
    /// * `content_type` - Value of the `Content-Type` header
    /// * `body` - Request payload; in-memory bodies take part in the cache fingerprint
    ///
    /// # Returns
    /// * `Ok(CachedResponse)` read back from the active transaction
    /// * `Err` if no transaction is active, the gate is cancelled or the request fails
    pub async fn post(
        &self,
        url: &str,
        content_type: &str,
        body: impl Into<reqwest::Body>,
    ) -> Result<CachedResponse, ClientError> {
        let request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, content_type)
            .body(body)
            .build()?;
        self.execute(request).await
    }

    /// POSTs `application/x-www-form-urlencoded` data
    pub async fn post_form<K, V>(&self, url: &str, fields: &[(K, V)]) -> Result<CachedResponse, ClientError>
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(fields.iter().map(|(k, v)| (k.as_ref(), v.as_ref())))
            .finish();
        self.post(url, "application/x-www-form-urlencoded", body).await
    }

    /// POSTs `data` encoded as JSON
    pub async fn post_json<T: Serialize + ?Sized>(&self, url: &str, data: &T) -> Result<CachedResponse, ClientError> {
        let body = serde_json::to_vec(data)?;
        self.post(url, "application/json", body).await
    }
}

impl RequestView for Request {
    fn method(&self) -> &str {
        Request::method(self).as_str()
    }

    fn url(&self) -> &str {
        Request::url(self).as_str()
    }

    fn open_body(&self) -> Option<io::Result<Box<dyn Read + '_>>> {
        // Streaming bodies cannot be re-read and do not take part in the fingerprint
        self.body()
            .and_then(reqwest::Body::as_bytes)
            .map(|bytes| Ok(Box::new(bytes) as Box<dyn Read + '_>))
    }
}

/// Captures the status line, protocol and headers of a live response
fn response_head(response: &Response) -> ResponseHead {
    let status = response.status();
    let (proto, proto_major, proto_minor) = protocol(response.version());

    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in response.headers() {
        headers
            .entry(name.as_str().to_string())
            .or_default()
            .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
    }

    let transfer_encoding = response
        .headers()
        .get_all(TRANSFER_ENCODING)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|coding| coding.trim().to_string())
        .filter(|coding| !coding.is_empty())
        .collect();

    let status_text = match status.canonical_reason() {
        Some(reason) => format!("{} {}", status.as_u16(), reason),
        None => status.as_u16().to_string(),
    };

    ResponseHead {
        status: status_text,
        status_code: status.as_u16(),
        proto: proto.to_string(),
        proto_major,
        proto_minor,
        headers,
        content_length: response.content_length(),
        transfer_encoding,
        // Bodies are stored exactly as received; no transparent decompression is enabled
        uncompressed: false,
    }
}

fn protocol(version: Version) -> (&'static str, u8, u8) {
    match version {
        Version::HTTP_09 => ("HTTP/0.9", 0, 9),
        Version::HTTP_10 => ("HTTP/1.0", 1, 0),
        Version::HTTP_2 => ("HTTP/2.0", 2, 0),
        Version::HTTP_3 => ("HTTP/3.0", 3, 0),
        _ => ("HTTP/1.1", 1, 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn create_test_client() -> (Client, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = ClientConfig {
            cache_dir: temp_dir.path().join("cache"),
            interval: Duration::from_millis(10),
            retention: 3,
        };
        let http = reqwest::Client::builder().no_proxy().build().unwrap();
        let client = Client::with_http_client(&config, CancellationToken::new(), http).expect("Client should open");
        (client, temp_dir)
    }

    fn file_url(path: &std::path::Path) -> String {
        Url::from_file_path(path).unwrap().to_string()
    }

    #[test]
    fn test_default_config() {
        let config = ClientConfig::default();
        assert_eq!(config.interval, Duration::from_secs(2));
        assert_eq!(config.retention, 15);
        assert!(config.cache_dir.to_string_lossy().contains("crawlcache"));
    }

    #[test]
    fn test_protocol_mapping() {
        assert_eq!(protocol(Version::HTTP_11), ("HTTP/1.1", 1, 1));
        assert_eq!(protocol(Version::HTTP_10), ("HTTP/1.0", 1, 0));
        assert_eq!(protocol(Version::HTTP_2), ("HTTP/2.0", 2, 0));
    }

    #[test]
    fn test_request_view_uses_in_memory_body() {
        let client = reqwest::Client::new();
        let request = client
            .post("https://example.com/search")
            .body("q=rust")
            .build()
            .unwrap();

        assert_eq!(RequestView::method(&request), "POST");
        assert_eq!(RequestView::url(&request), "https://example.com/search");

        let mut payload = Vec::new();
        request.open_body().unwrap().unwrap().read_to_end(&mut payload).unwrap();
        assert_eq!(payload, b"q=rust");
    }

    #[test]
    fn test_request_view_without_body() {
        let request = reqwest::Client::new().get("https://example.com/").build().unwrap();
        assert!(request.open_body().is_none());
    }

    #[tokio::test]
    async fn test_execute_without_transaction_fails() {
        let (client, _temp_dir) = create_test_client();

        let result = client.get("https://example.com/").await;

        assert!(matches!(result, Err(ClientError::NoTransaction)));
    }

    #[tokio::test]
    async fn test_invalid_url_is_rejected() {
        let (mut client, _temp_dir) = create_test_client();
        client.last_transaction().unwrap();

        let result = client.get("not a url").await;

        assert!(matches!(result, Err(ClientError::InvalidUrl(_))));
    }

    #[tokio::test]
    async fn test_file_url_is_fetched_then_replayed() {
        let (mut client, temp_dir) = create_test_client();
        let source = temp_dir.path().join("data.csv");
        fs::write(&source, "a,b\n1,2\n").unwrap();
        let url = file_url(&source);
        client.last_transaction().unwrap();

        let mut first = client.get(&url).await.expect("First fetch should succeed");
        assert_eq!(first.status_code(), 200);
        assert_eq!(first.head.header("Content-Length"), Some("8"));
        assert_eq!(first.request.method, "GET");
        assert_eq!(first.request.url, url);
        assert_eq!(first.text().unwrap(), "a,b\n1,2\n");

        // The source is gone; the response must come from the cache
        fs::remove_file(&source).unwrap();
        let mut replay = client.get(&url).await.expect("Replay should succeed");
        assert_eq!(replay.text().unwrap(), "a,b\n1,2\n");
    }

    #[tokio::test]
    async fn test_new_transaction_starts_empty_generation() {
        let (mut client, temp_dir) = create_test_client();
        let source = temp_dir.path().join("page.html");
        fs::write(&source, "v1").unwrap();
        let url = file_url(&source);

        let first = client.new_transaction().unwrap().name().to_string();
        assert_eq!(client.get(&url).await.unwrap().text().unwrap(), "v1");

        fs::write(&source, "v2").unwrap();
        client.new_transaction().unwrap();
        assert_eq!(client.get(&url).await.unwrap().text().unwrap(), "v2");

        // The older generation still replays the old content
        client.set_transaction(&first).unwrap();
        assert_eq!(client.get(&url).await.unwrap().text().unwrap(), "v1");
    }

    #[tokio::test]
    async fn test_set_unknown_transaction_fails() {
        let (mut client, _temp_dir) = create_test_client();

        let result = client.set_transaction("nope");

        assert!(matches!(result, Err(ClientError::Cache(CacheError::NoSuchTransaction(_)))));
        assert!(client.transaction().is_none());
    }

    #[tokio::test]
    async fn test_missing_local_file_stores_nothing() {
        let (mut client, temp_dir) = create_test_client();
        client.last_transaction().unwrap();
        let url = file_url(&temp_dir.path().join("missing.txt"));

        let result = client.get(&url).await;

        assert!(matches!(result, Err(ClientError::Io(_))));
        let tx_dir = client.transaction().unwrap().dir().to_path_buf();
        assert_eq!(fs::read_dir(tx_dir).unwrap().count(), 0);
    }

    /// Serves `body` to every connection and counts the requests it answers
    async fn spawn_counting_server(body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();

        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    break;
                };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    let response = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                        body.len(),
                        body
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{}/page", addr), hits)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_misses_fetch_once() {
        let (mut client, _temp_dir) = create_test_client();
        client.last_transaction().unwrap();
        let (url, hits) = spawn_counting_server("hello").await;

        let (first, second) = tokio::join!(client.get(&url), client.get(&url));

        assert_eq!(first.unwrap().text().unwrap(), "hello");
        assert_eq!(second.unwrap().text().unwrap(), "hello");
        assert_eq!(hits.load(Ordering::SeqCst), 1, "The origin should be asked once");
    }

    #[tokio::test]
    async fn test_live_response_head_is_stored() {
        let (mut client, _temp_dir) = create_test_client();
        client.last_transaction().unwrap();
        let (url, hits) = spawn_counting_server("abc").await;

        let mut response = client.get(&url).await.unwrap();
        assert_eq!(response.status_code(), 200);
        assert_eq!(response.head.status, "200 OK");
        assert_eq!(response.head.proto, "HTTP/1.1");
        assert_eq!(response.head.content_length, Some(3));
        assert_eq!(response.text().unwrap(), "abc");

        // Replays do not reach the origin
        client.get(&url).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_client_does_not_fetch() {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = ClientConfig {
            cache_dir: temp_dir.path().join("cache"),
            interval: Duration::from_millis(10),
            retention: 3,
        };
        let cancel = CancellationToken::new();
        let mut client = Client::new(&config, cancel.clone()).unwrap();
        client.last_transaction().unwrap();
        let source = temp_dir.path().join("data.txt");
        fs::write(&source, "x").unwrap();

        cancel.cancel();
        let result = client.get(&file_url(&source)).await;

        assert!(matches!(result, Err(ClientError::Gate(GateError::Cancelled))));
    }
}
