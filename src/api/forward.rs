//! Relaying mutations from a follower to the leader

use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Header marking a request that was already relayed once
pub const FORWARDED_HEADER: &str = "x-crawlnet-forwarded";

#[derive(Error, Debug)]
pub enum ForwardError {
    #[error("Invalid leader address: {0}")]
    Address(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

/// URL of `segments` on the leader, each segment percent-encoded
pub fn leader_url(leader_address: &str, segments: &[&str]) -> Result<Url, ForwardError> {
    let mut url = Url::parse(&format!("http://{leader_address}/"))
        .map_err(|e| ForwardError::Address(format!("{leader_address}: {e}")))?;
    url.path_segments_mut()
        .map_err(|_| ForwardError::Address(leader_address.to_string()))?
        .pop_if_empty()
        .extend(segments);
    Ok(url)
}

/// HTTP client used to replay a request against the leader's API
#[derive(Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }

    /// Replay `method` on the leader's `segments` path and relay the answer verbatim
    pub async fn forward(
        &self,
        leader_address: &str,
        method: reqwest::Method,
        segments: &[&str],
        body: Option<serde_json::Value>,
    ) -> Result<Response, ForwardError> {
        let url = leader_url(leader_address, segments)?;
        tracing::info!(%url, %method, "Forwarding request to leader");

        let mut request = self
            .client
            .request(method, url)
            .header(FORWARDED_HEADER, "1");
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await?;
        let status =
            StatusCode::from_u16(response.status().as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        let text = response.text().await?;

        Ok((status, [(header::CONTENT_TYPE, "application/json")], text).into_response())
    }
}
