//! HTTP fetching with charset normalisation
//!
//! The [`Fetcher`] trait is what the worker pool calls; [`HttpFetcher`] is
//! the reqwest-backed implementation. Every body comes back as UTF-8 text
//! regardless of the page's declared encoding:
//! - byte-order mark
//! - `charset=` in the `Content-Type` header
//! - `<meta charset>` / `http-equiv` within the first 1024 bytes
//! - UTF-8 otherwise
//!
//! Failures are always retryable from the pipeline's point of view; this
//! fetcher does not retry on its own.

use async_trait::async_trait;
use encoding_rs::{Encoding, UTF_8};
use rand::seq::SliceRandom;
use regex::bytes::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, COOKIE, USER_AGENT};
use reqwest::Client;
use std::sync::OnceLock;
use std::time::Duration;

use super::error::FetchError;
use super::request::Request;

/// Pool of realistic User-Agent strings for rotation
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:109.0) Gecko/20100101 Firefox/117.0",
];

/// Number of leading bytes inspected for a meta charset
const SNIFF_LEN: usize = 1024;

/// Fetches one request and returns its decoded body
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn get(&self, request: &Request) -> Result<String, FetchError>;
}

/// reqwest-backed fetcher
pub struct HttpFetcher {
    client: Client,

    /// Fixed User-Agent; rotates through the built-in pool when unset
    user_agent: Option<String>,
}

impl HttpFetcher {
    /// Create a fetcher with the given request timeout
    ///
    /// # Errors
    ///
    /// Returns `FetchError::Http` if the HTTP client cannot be created
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).gzip(true).build()?;
        Ok(Self {
            client,
            user_agent: None,
        })
    }

    /// Use a fixed User-Agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    fn build_headers(&self, cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();

        let agent = match &self.user_agent {
            Some(agent) => HeaderValue::from_str(agent).ok(),
            None => Some(HeaderValue::from_static(random_user_agent())),
        };
        if let Some(agent) = agent {
            headers.insert(USER_AGENT, agent);
        }

        headers.insert(
            ACCEPT,
            HeaderValue::from_static(
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8",
            ),
        );

        if !cookie.is_empty() {
            if let Ok(value) = HeaderValue::from_str(cookie) {
                headers.insert(COOKIE, value);
            }
        }

        headers
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn get(&self, request: &Request) -> Result<String, FetchError> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| FetchError::InvalidUrl(format!("bad method {}", request.method)))?;
        let url = url::Url::parse(&request.url)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {e}", request.url)))?;

        let response = self
            .client
            .request(method, url)
            .headers(self.build_headers(&request.task.options().cookie))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        let bytes = response.bytes().await?;
        Ok(decode_body(&bytes, content_type.as_deref()))
    }
}

fn random_user_agent() -> &'static str {
    let mut rng = rand::thread_rng();
    USER_AGENTS.choose(&mut rng).copied().unwrap_or(USER_AGENTS[0])
}

/// Pick the encoding of a body
pub fn detect_encoding(bytes: &[u8], content_type: Option<&str>) -> &'static Encoding {
    if let Some((encoding, _)) = Encoding::for_bom(bytes) {
        return encoding;
    }

    if let Some(encoding) = content_type.and_then(charset_from_content_type) {
        return encoding;
    }

    static META_RE: OnceLock<Regex> = OnceLock::new();
    let re = META_RE.get_or_init(|| {
        Regex::new(r#"(?i)<meta[^>]+charset\s*=\s*["']?([a-zA-Z0-9_\-]+)"#)
            .expect("Invalid regex pattern")
    });
    let head = &bytes[..bytes.len().min(SNIFF_LEN)];
    re.captures(head)
        .and_then(|caps| caps.get(1))
        .and_then(|m| Encoding::for_label(m.as_bytes()))
        .unwrap_or(UTF_8)
}

fn charset_from_content_type(content_type: &str) -> Option<&'static Encoding> {
    content_type
        .split(';')
        .filter_map(|part| part.trim().split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("charset"))
        .and_then(|(_, value)| Encoding::for_label(value.trim().trim_matches('"').as_bytes()))
}

/// Decode a body to UTF-8, replacing malformed sequences
pub fn decode_body(bytes: &[u8], content_type: Option<&str>) -> String {
    let encoding = detect_encoding(bytes, content_type);
    let (text, _, had_errors) = encoding.decode(bytes);
    if had_errors {
        tracing::debug!(encoding = encoding.name(), "Body contained malformed sequences");
    }
    text.into_owned()
}
