//! Response-size limiting for HTTP round trips.
//!
//! [`LimitedTransport`] forwards each request unchanged and, when the
//! request's [`RequestContext`] carries a byte limit, reads the response body
//! through a [`LimitedReader`]. Once the quota is spent the *next* read fails
//! with [`TransportError::ReadLimit`] without touching the underlying stream.

use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::TryStreamExt;
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf, Take};
use tokio_util::io::StreamReader;
use url::Url;

use evmrpc_core::context::RequestContext;
use evmrpc_core::error::TransportError;

/// Reader that serves at most `limit` bytes, then fails.
#[derive(Debug)]
pub struct LimitedReader<R> {
    inner: Take<R>,
    limit: u64,
}

impl<R: AsyncRead> LimitedReader<R> {
    pub fn new(inner: R, limit: u64) -> Self {
        Self {
            inner: inner.take(limit),
            limit,
        }
    }

    /// The configured limit in bytes.
    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Bytes still allowed to be read.
    pub fn remaining(&self) -> u64 {
        self.inner.limit()
    }

    pub fn into_inner(self) -> R {
        self.inner.into_inner()
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for LimitedReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.inner.limit() == 0 {
            return Poll::Ready(Err(io::Error::other(TransportError::read_limit(this.limit))));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// Returns `true` if `err` is the limit failure produced by [`LimitedReader`].
pub fn is_read_limit(err: &io::Error) -> bool {
    read_limit_of(err).is_some()
}

fn read_limit_of(err: &io::Error) -> Option<u64> {
    match err.get_ref()?.downcast_ref::<TransportError>()? {
        TransportError::ReadLimit { limit, .. } => Some(*limit),
        _ => None,
    }
}

/// A response body as read by [`LimitedTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseBody {
    pub bytes: Vec<u8>,
    /// Set to the limit when reading stopped because the quota ran out.
    /// `bytes` then holds the prefix delivered before the cut-off.
    pub truncated_at: Option<u64>,
}

/// HTTP round tripper enforcing the context's response-size limit.
#[derive(Debug, Clone)]
pub struct LimitedTransport {
    client: reqwest::Client,
}

impl LimitedTransport {
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Wrap an existing `reqwest` client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// POST `payload` as JSON and read the body, honouring the context limit.
    pub async fn round_trip(
        &self,
        ctx: &RequestContext,
        url: &Url,
        payload: Vec<u8>,
    ) -> Result<(StatusCode, ResponseBody), TransportError> {
        let resp = self
            .client
            .post(url.clone())
            .header(CONTENT_TYPE, "application/json")
            .body(payload)
            .send()
            .await
            .map_err(|e| TransportError::Http(e.without_url().to_string()))?;

        let status = resp.status();
        let stream = resp.bytes_stream().map_err(io::Error::other);
        let reader = Box::pin(StreamReader::new(stream));
        let body = match ctx.response_size_limit() {
            Some(limit) => read_body(LimitedReader::new(reader, u64::from(limit))).await?,
            None => read_body(reader).await?,
        };
        Ok((status, body))
    }
}

async fn read_body<R: AsyncRead + Unpin>(mut reader: R) -> Result<ResponseBody, TransportError> {
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 8 * 1024];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) => {
                return Ok(ResponseBody {
                    bytes,
                    truncated_at: None,
                })
            }
            Ok(n) => bytes.extend_from_slice(&chunk[..n]),
            Err(e) => {
                return match read_limit_of(&e) {
                    Some(limit) => Ok(ResponseBody {
                        bytes,
                        truncated_at: Some(limit),
                    }),
                    None => Err(TransportError::Http(format!(
                        "failed to read response body: {e}"
                    ))),
                }
            }
        }
    }
}
