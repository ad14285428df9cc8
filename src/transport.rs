//! HTTP seam.
//!
//! Everything that talks to the network goes through [`Transport`], so the
//! pipeline can be driven by a scripted transport in tests.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, stream};
use reqwest::header::{
    ACCEPT_RANGES, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, HeaderName, RANGE,
};
use thiserror::Error;
use tracing::trace;

use crate::error::{Error, Result};
use crate::subset::{ByteRange, multi_range_header};

pub type BodyStream =
    Pin<Box<dyn Stream<Item = std::result::Result<Bytes, TransportError>> + Send>>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("body read failed: {0}")]
    Body(String),
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout(_) | TransportError::Connection(_) | TransportError::Body(_)
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            TransportError::Timeout(e.to_string())
        } else if e.is_connect() || e.is_request() {
            TransportError::Connection(e.to_string())
        } else if e.is_body() || e.is_decode() {
            TransportError::Body(e.to_string())
        } else if e.is_builder() {
            TransportError::InvalidUrl(e.to_string())
        } else {
            TransportError::Other(e.to_string())
        }
    }
}

pub struct TransportResponse {
    pub status: u16,
    pub content_type: Option<String>,
    /// Length of this response's body, when announced.
    pub content_length: Option<u64>,
    /// Size of the whole remote file (`Content-Range` total, or the
    /// `Content-Length` of a `200`).
    pub total_length: Option<u64>,
    pub accept_ranges: bool,
    pub body: BodyStream,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

impl std::fmt::Debug for TransportResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("content_length", &self.content_length)
            .field("total_length", &self.total_length)
            .field("accept_ranges", &self.accept_ranges)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// `HEAD url`; the body is empty.
    async fn head(&self, url: &str) -> std::result::Result<TransportResponse, TransportError>;

    /// `GET url`, with a `Range` header listing `ranges` when non-empty.
    async fn get(
        &self,
        url: &str,
        ranges: &[ByteRange],
    ) -> std::result::Result<TransportResponse, TransportError>;
}

/// Collect a body into memory.
pub async fn read_body(mut body: BodyStream) -> std::result::Result<Bytes, TransportError> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = body.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

pub fn empty_body() -> BodyStream {
    Box::pin(stream::empty())
}

/// `bytes 0-0/12345` -> `12345`
pub fn parse_content_range_total(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

/// reqwest backed [`Transport`].
#[derive(Debug, Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout: Duration, connect_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| Error::Config(format!("cannot build http client: {e}")))?;
        Ok(Self { http })
    }

    fn into_response(resp: reqwest::Response, with_body: bool) -> TransportResponse {
        let status = resp.status().as_u16();
        let headers = resp.headers();
        let header = |name: HeaderName| headers.get(name).and_then(|v| v.to_str().ok());

        let content_type = header(CONTENT_TYPE).map(str::to_string);
        let content_length = header(CONTENT_LENGTH).and_then(|v| v.trim().parse::<u64>().ok());
        let total_length = match header(CONTENT_RANGE) {
            Some(cr) => parse_content_range_total(cr),
            None if status == 200 => content_length,
            None => None,
        };
        let accept_ranges =
            status == 206 || header(ACCEPT_RANGES).is_some_and(|v| v.contains("bytes"));

        let body: BodyStream = if with_body {
            Box::pin(resp.bytes_stream().map(|r| r.map_err(TransportError::from)))
        } else {
            empty_body()
        };

        TransportResponse {
            status,
            content_type,
            content_length,
            total_length,
            accept_ranges,
            body,
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn head(&self, url: &str) -> std::result::Result<TransportResponse, TransportError> {
        trace!(url, "HEAD");
        let resp = self.http.head(url).send().await?;
        Ok(Self::into_response(resp, false))
    }

    async fn get(
        &self,
        url: &str,
        ranges: &[ByteRange],
    ) -> std::result::Result<TransportResponse, TransportError> {
        let mut req = self.http.get(url);
        match ranges {
            [] => {}
            [single] => req = req.header(RANGE, single.header_value()),
            many => req = req.header(RANGE, multi_range_header(many)),
        }
        trace!(url, ranges = ranges.len(), "GET");
        let resp = req.send().await?;
        Ok(Self::into_response(resp, true))
    }
}
