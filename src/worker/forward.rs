//! Forwarding a queued request to a backend aggregator node.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::Method;

use crate::error::{FileMeshError, Result};
use crate::queue::{QueuedRequest, RequestKind};
use crate::registry::NodeHandle;

/// Default per-forward timeout.
pub const FORWARD_TIMEOUT: Duration = Duration::from_secs(60);

/// Result of a completed forward.
#[derive(Debug, Clone, Copy)]
pub struct ForwardReceipt {
    /// HTTP status the backend answered with.
    pub status: u16,
}

/// One-shot delivery of a request to a selected node.
///
/// Failures are surfaced to the caller and never flip node health; that is
/// the probe's authority.
#[async_trait]
pub trait Forwarder: Send + Sync {
    /// Perform the backend call for `request` against `node`.
    async fn forward(&self, request: &QueuedRequest, node: &NodeHandle) -> Result<ForwardReceipt>;
}

/// HTTP forwarder speaking the aggregator's file API.
pub struct HttpForwarder {
    client: reqwest::Client,
}

impl HttpForwarder {
    /// Forwarder with the default 60 s timeout.
    pub fn new() -> Result<Self> {
        Self::with_timeout(FORWARD_TIMEOUT)
    }

    /// Forwarder with a custom timeout (tests).
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| FileMeshError::Internal(format!("http client: {err}")))?;
        Ok(HttpForwarder { client })
    }

    fn route(request: &QueuedRequest, node: &NodeHandle) -> (Method, String) {
        let base = node.base_url();
        match request.kind {
            RequestKind::Upload => (Method::POST, format!("{base}/api/files/upload")),
            RequestKind::Download => (
                Method::GET,
                format!("{base}/api/files/{}/download", request.file_id),
            ),
            RequestKind::Delete => (Method::DELETE, format!("{base}/api/files/{}", request.file_id)),
        }
    }

    fn headers(request: &QueuedRequest) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let file_id = HeaderValue::from_str(&request.file_id)
            .map_err(|_| FileMeshError::BadRequest("file id is not a valid header".into()))?;
        headers.insert("X-File-ID", file_id);
        let request_id = HeaderValue::from_str(&request.id)
            .map_err(|_| FileMeshError::Internal("request id is not a valid header".into()))?;
        headers.insert("X-LB-Request-Id", request_id);
        if let Some(name) = &request.file_name {
            let name = HeaderValue::from_str(name)
                .map_err(|_| FileMeshError::BadRequest("file name is not a valid header".into()))?;
            headers.insert("X-File-Name", name);
        }
        if request.kind == RequestKind::Upload {
            headers.insert("X-File-Size", HeaderValue::from(request.size_bytes));
        }
        Ok(headers)
    }
}

#[async_trait]
impl Forwarder for HttpForwarder {
    async fn forward(&self, request: &QueuedRequest, node: &NodeHandle) -> Result<ForwardReceipt> {
        let (method, url) = Self::route(request, node);
        let mut call = self
            .client
            .request(method, &url)
            .headers(Self::headers(request)?);
        if let Some(body) = &request.body {
            call = call.body(body.clone());
        }

        let response = call.send().await.map_err(|err| {
            if err.is_timeout() {
                FileMeshError::UpstreamTimeout
            } else {
                FileMeshError::Upstream(err.to_string())
            }
        })?;

        let status = response.status();
        if status.is_server_error() {
            return Err(FileMeshError::Upstream(format!(
                "node {} returned {status}",
                node.id
            )));
        }
        Ok(ForwardReceipt {
            status: status.as_u16(),
        })
    }
}
