// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Ankit Kumar Pandey

//! HTTP client bound to a sandbox's `ol.sock`.
//!
//! The URI host is ignored by the connector; only the path and query reach
//! the in-sandbox runtime.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, Response, Uri};
use http_body_util::{BodyExt, Full};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use tokio::net::UnixStream;

use crate::error::{ForkliftResult, SandboxError};

/// Something that can carry one HTTP exchange to a sandbox.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, req: Request<Bytes>) -> ForkliftResult<Response<Bytes>>;

    /// Drop pooled connections, e.g. before a sandbox is frozen.
    fn close_idle_connections(&self) {}
}

/// Cloneable handle used by instances, installers and the fork path.
#[derive(Clone)]
pub struct SandboxClient {
    transport: Arc<dyn Transport>,
    timeout: Duration,
}

impl fmt::Debug for SandboxClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl SandboxClient {
    /// HTTP over the Unix socket at `sock_path`.
    pub fn unix(sock_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self::from_transport(Arc::new(UnixTransport::new(sock_path.into())), timeout)
    }

    pub fn from_transport(transport: Arc<dyn Transport>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `req` and collect the full response, bounded by the client timeout.
    pub async fn round_trip(&self, req: Request<Bytes>) -> ForkliftResult<Response<Bytes>> {
        match tokio::time::timeout(self.timeout, self.transport.send(req)).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::Timeout {
                secs: self.timeout.as_secs(),
            }
            .into()),
        }
    }

    /// POST `body` to `path` inside the sandbox.
    pub async fn post(&self, path: &str, body: impl Into<Bytes>) -> ForkliftResult<Response<Bytes>> {
        let req = Request::builder()
            .method(http::Method::POST)
            .uri(path)
            .header("Content-Type", "application/json")
            .body(body.into())
            .map_err(|e| SandboxError::Request {
                reason: format!("invalid request to {}: {}", path, e),
            })?;
        self.round_trip(req).await
    }

    pub fn close_idle_connections(&self) {
        self.transport.close_idle_connections();
    }
}

/// Connector that always dials the same Unix socket.
#[derive(Clone)]
struct UnixConnector {
    socket_path: PathBuf,
}

impl tower::Service<Uri> for UnixConnector {
    type Response = hyper_util::rt::TokioIo<UnixStream>;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _uri: Uri) -> Self::Future {
        let path = self.socket_path.clone();
        Box::pin(async move {
            let stream = UnixStream::connect(&path).await?;
            Ok(hyper_util::rt::TokioIo::new(stream))
        })
    }
}

struct UnixTransport {
    socket_path: PathBuf,
    client: parking_lot::RwLock<Client<UnixConnector, Full<Bytes>>>,
}

impl UnixTransport {
    fn new(socket_path: PathBuf) -> Self {
        let client = Self::build(&socket_path);
        Self {
            socket_path,
            client: parking_lot::RwLock::new(client),
        }
    }

    fn build(socket_path: &Path) -> Client<UnixConnector, Full<Bytes>> {
        let connector = UnixConnector {
            socket_path: socket_path.to_path_buf(),
        };
        Client::builder(TokioExecutor::new()).build(connector)
    }
}

#[async_trait]
impl Transport for UnixTransport {
    async fn send(&self, req: Request<Bytes>) -> ForkliftResult<Response<Bytes>> {
        let (mut parts, body) = req.into_parts();
        let path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());
        parts.uri = format!("http://container{}", path)
            .parse()
            .map_err(|e| SandboxError::Request {
                reason: format!("invalid request path {}: {}", path, e),
            })?;
        parts
            .headers
            .insert(http::header::HOST, http::HeaderValue::from_static("container"));

        let client = self.client.read().clone();
        let resp = client
            .request(Request::from_parts(parts, Full::new(body)))
            .await
            .map_err(|e| SandboxError::Request {
                reason: format!("{}: {}", self.socket_path.display(), e),
            })?;

        let (parts, body) = resp.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| SandboxError::Request {
                reason: format!("reading response body: {}", e),
            })?
            .to_bytes();
        Ok(Response::from_parts(parts, body))
    }

    fn close_idle_connections(&self) {
        // hyper's pool has no explicit flush, so start over with an empty one
        *self.client.write() = Self::build(&self.socket_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn test_round_trip_over_unix_socket() {
        let dir = tempfile::TempDir::new().unwrap();
        let sock = dir.path().join("ol.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let n = stream.read(&mut buf).await.unwrap();
            let head = String::from_utf8_lossy(&buf[..n]).to_string();
            assert!(head.starts_with("POST /run/echo HTTP/1.1"));
            stream
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 7\r\nconnection: close\r\n\r\n{\"x\":1}")
                .await
                .unwrap();
        });

        let client = SandboxClient::unix(&sock, Duration::from_secs(5));
        let resp = client.post("/run/echo", "{\"x\":1}").await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body().as_ref(), b"{\"x\":1}");
    }

    #[tokio::test]
    async fn test_timeout() {
        let dir = tempfile::TempDir::new().unwrap();
        let sock = dir.path().join("ol.sock");
        let listener = UnixListener::bind(&sock).unwrap();

        tokio::spawn(async move {
            let (_stream, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let client = SandboxClient::unix(&sock, Duration::from_millis(100));
        let err = client.post("/run/slow", "").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_missing_socket() {
        let client = SandboxClient::unix("/nonexistent/ol.sock", Duration::from_secs(1));
        client.close_idle_connections();
        assert!(client.post("/run/x", "").await.is_err());
    }
}
