//! HTTP/JSON compute backend client.
//!
//! One HTTP/1.1 connection per request, driven by hyper's low-level
//! `client::conn` API.
//!
//! | Call              | Request                                  | Response        |
//! |-------------------|------------------------------------------|-----------------|
//! | `deploy`          | `POST /nodes` with the [`NodeSpec`]      | `{"id"}`        |
//! | `shutdown`        | `POST /nodes/{id}/shutdown {"hard"}`     | empty           |
//! | `query`           | `GET /nodes/{id}`                        | `{"state","substate"}`, 404 when gone |
//! | `create_network`  | `POST /networks` with the [`NetworkSpec`]| `{"id"}`        |
//! | `delete_network`  | `DELETE /networks/{id}`                  | empty           |
//! | `chown` / `chmod` | `POST /nodes/{id}/chown`, `/chmod`       | empty           |
//! | `recover_warning` | `POST /nodes/{id}/recover`               | empty           |
//! | `schedule_action` | `POST /nodes/{id}/sched_action {"action","after_secs"}` | empty |

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, StatusCode};
use http_body_util::{BodyExt, Full};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use svcflow_core::{BackendConfig, NetworkId, NodeId};

use crate::error::{BackendError, BackendResult};
use crate::types::{NetworkSpec, NodeAction, NodeSpec, NodeState};
use crate::ComputeBackend;

#[derive(Debug, Deserialize)]
struct Created {
    id: u64,
}

/// Compute backend reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    address: String,
    timeout: Duration,
}

impl HttpBackend {
    /// `address` is `host:port`.
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            timeout,
        }
    }

    pub fn from_config(config: &BackendConfig) -> Self {
        Self::new(
            config.endpoint.clone(),
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send one request and return the status and the collected body.
    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> BackendResult<(StatusCode, Bytes)> {
        let payload = match &body {
            Some(value) => {
                Bytes::from(serde_json::to_vec(value).map_err(|e| BackendError::Decode(e.to_string()))?)
            }
            None => Bytes::new(),
        };

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&self.address)
                .await
                .map_err(|e| BackendError::Transport(e.to_string()))?;

            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
                .await
                .map_err(|e| BackendError::Transport(e.to_string()))?;

            // Drive the connection in the background.
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method(method.clone())
                // Origin-form request line; the authority goes in `host`.
                .uri(path)
                .header("host", &self.address)
                .header("user-agent", "svcflow-backend/0.1")
                .header("content-type", "application/json")
                .body(Full::new(payload))
                .map_err(|e| BackendError::Transport(e.to_string()))?;

            let resp = sender
                .send_request(req)
                .await
                .map_err(|e| BackendError::Transport(e.to_string()))?;
            let status = resp.status();
            let bytes = resp
                .into_body()
                .collect()
                .await
                .map_err(|e| BackendError::Transport(e.to_string()))?
                .to_bytes();
            Ok::<_, BackendError>((status, bytes))
        };

        let (status, bytes) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| BackendError::Timeout(self.timeout))??;

        debug!(%method, address = %self.address, path, %status, "backend request");
        Ok((status, bytes))
    }

    /// Like [`HttpBackend::request`] but maps non-2xx to an error.
    async fn call(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> BackendResult<Bytes> {
        let (status, bytes) = self.request(method, path, body).await?;
        if status.is_success() {
            Ok(bytes)
        } else {
            Err(rejected(status, &bytes))
        }
    }

    /// A node call that turns 404 into [`BackendError::NodeNotFound`].
    async fn node_call(
        &self,
        node: NodeId,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> BackendResult<Bytes> {
        let (status, bytes) = self.request(method, path, body).await?;
        match status {
            s if s.is_success() => Ok(bytes),
            StatusCode::NOT_FOUND => Err(BackendError::NodeNotFound(node)),
            s => Err(rejected(s, &bytes)),
        }
    }
}

fn rejected(status: StatusCode, body: &[u8]) -> BackendError {
    let text = String::from_utf8_lossy(body);
    if text.trim().is_empty() {
        BackendError::Rejected(status.to_string())
    } else {
        BackendError::Rejected(format!("{status}: {}", text.trim()))
    }
}

fn decode<T: for<'de> Deserialize<'de>>(bytes: &[u8]) -> BackendResult<T> {
    serde_json::from_slice(bytes).map_err(|e| BackendError::Decode(e.to_string()))
}

#[async_trait]
impl ComputeBackend for HttpBackend {
    async fn deploy(&self, spec: &NodeSpec) -> BackendResult<NodeId> {
        let body = serde_json::to_value(spec).map_err(|e| BackendError::Decode(e.to_string()))?;
        let bytes = self.call(Method::POST, "/nodes", Some(body)).await?;
        Ok(decode::<Created>(&bytes)?.id)
    }

    async fn shutdown(&self, node: NodeId, hard: bool) -> BackendResult<()> {
        let path = format!("/nodes/{node}/shutdown");
        self.node_call(node, Method::POST, &path, Some(json!({ "hard": hard })))
            .await?;
        Ok(())
    }

    async fn query(&self, node: NodeId) -> BackendResult<NodeState> {
        let path = format!("/nodes/{node}");
        let bytes = self.node_call(node, Method::GET, &path, None).await?;
        decode(&bytes)
    }

    async fn create_network(&self, spec: &NetworkSpec) -> BackendResult<NetworkId> {
        let body = serde_json::to_value(spec).map_err(|e| BackendError::Decode(e.to_string()))?;
        let bytes = self.call(Method::POST, "/networks", Some(body)).await?;
        Ok(decode::<Created>(&bytes)?.id)
    }

    async fn delete_network(&self, network: NetworkId) -> BackendResult<()> {
        let path = format!("/networks/{network}");
        let (status, bytes) = self.request(Method::DELETE, &path, None).await?;
        match status {
            s if s.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Err(BackendError::NetworkNotFound(network)),
            s => Err(rejected(s, &bytes)),
        }
    }

    async fn chown(&self, node: NodeId, uid: u32, gid: u32) -> BackendResult<()> {
        let path = format!("/nodes/{node}/chown");
        self.node_call(node, Method::POST, &path, Some(json!({ "uid": uid, "gid": gid })))
            .await?;
        Ok(())
    }

    async fn chmod(&self, node: NodeId, octet: &str) -> BackendResult<()> {
        let path = format!("/nodes/{node}/chmod");
        self.node_call(node, Method::POST, &path, Some(json!({ "octet": octet })))
            .await?;
        Ok(())
    }

    async fn schedule_action(
        &self,
        node: NodeId,
        action: NodeAction,
        after: Duration,
    ) -> BackendResult<()> {
        let path = format!("/nodes/{node}/sched_action");
        let body = json!({ "action": action, "after_secs": after.as_secs() });
        self.node_call(node, Method::POST, &path, Some(body)).await?;
        Ok(())
    }

    async fn recover_warning(&self, node: NodeId) -> BackendResult<()> {
        let path = format!("/nodes/{node}/recover");
        self.node_call(node, Method::POST, &path, None).await?;
        Ok(())
    }
}
