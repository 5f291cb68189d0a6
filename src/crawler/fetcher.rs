//! HTTP fetcher implementation
//!
//! This module handles all outbound page requests for the workers:
//! - One HTTP client per proxy, built on first use and cached
//! - Browser-like headers with a rotating User-Agent
//! - Status classification into the crawl error taxonomy

use crate::proxy::ProxyInfo;
use crate::FetchError;
use async_trait::async_trait;
use rand::seq::IndexedRandom;
use reqwest::header::{self, HeaderMap, HeaderValue};
use reqwest::{Client, Proxy, StatusCode};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// User-Agent strings rotated across requests
pub const USER_AGENTS: [&str; 3] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:89.0) Gecko/20100101 Firefox/89.0",
];

const ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
const ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

/// A page body together with the status it was served with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    pub status: StatusCode,
    pub body: String,
}

impl FetchedPage {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }
}

/// Issues a single GET through a given proxy
///
/// Implementations return the page for any HTTP status; only failures to
/// obtain a response at all are errors.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn get(&self, url: &str, proxy: &ProxyInfo) -> Result<FetchedPage, FetchError>;
}

/// Maps an HTTP status to the crawl error taxonomy
///
/// | Status | Outcome |
/// |--------|---------|
/// | 2xx | Ok |
/// | 429 | `RateLimited` |
/// | 403 | `IpBlocked` |
/// | anything else | `Transient` |
pub fn classify_status(status: StatusCode) -> Result<(), FetchError> {
    if status.is_success() {
        return Ok(());
    }

    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(FetchError::RateLimited),
        StatusCode::FORBIDDEN => Err(FetchError::IpBlocked),
        other => Err(FetchError::Transient(format!("HTTP {}", other.as_u16()))),
    }
}

/// Picks a User-Agent at random
pub fn random_user_agent() -> &'static str {
    USER_AGENTS
        .choose(&mut rand::rng())
        .copied()
        .unwrap_or(USER_AGENTS[0])
}

/// reqwest-backed fetcher with a client cache keyed by proxy URL
pub struct HttpFetcher {
    timeout: Duration,
    clients: Mutex<HashMap<String, Client>>,
}

impl HttpFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the cached client for a proxy, building it on first use
    fn client_for(&self, proxy: &ProxyInfo) -> Result<Client, FetchError> {
        let key = proxy.url();
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(client) = clients.get(&key) {
            return Ok(client.clone());
        }

        let client = build_http_client(proxy, self.timeout)
            .map_err(|e| FetchError::Transient(format!("failed to build client: {e}")))?;
        clients.insert(key, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn get(&self, url: &str, proxy: &ProxyInfo) -> Result<FetchedPage, FetchError> {
        let client = self.client_for(proxy)?;

        let response = client
            .get(url)
            .header(header::USER_AGENT, random_user_agent())
            .send()
            .await
            .map_err(describe_request_error)?;

        let status = response.status();
        let body = response.text().await.map_err(describe_request_error)?;

        Ok(FetchedPage { status, body })
    }
}

/// Builds an HTTP client that routes every request through one proxy
pub fn build_http_client(proxy: &ProxyInfo, timeout: Duration) -> Result<Client, reqwest::Error> {
    let mut headers = HeaderMap::new();
    headers.insert(header::ACCEPT, HeaderValue::from_static(ACCEPT));
    headers.insert(
        header::ACCEPT_LANGUAGE,
        HeaderValue::from_static(ACCEPT_LANGUAGE),
    );
    headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));

    Client::builder()
        .proxy(Proxy::all(proxy.url())?)
        .default_headers(headers)
        .timeout(timeout)
        .gzip(true)
        .brotli(true)
        .build()
}

fn describe_request_error(err: reqwest::Error) -> FetchError {
    if err.is_timeout() {
        FetchError::Transient("request timeout".to_string())
    } else if err.is_connect() {
        FetchError::Transient(format!("connection failed: {err}"))
    } else {
        FetchError::Transient(err.to_string())
    }
}
