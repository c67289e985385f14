//! HTTP tunnel adapter
//!
//! Exposes the tunnel's unary operations over HTTP POST for environments
//! that cannot multiplex stdio. The main consumer is the in-container git
//! credential helper, which git invokes as a separate short-lived process
//! that reaches the agent over localhost.
//!
//! Requests and responses share one JSON shape: `{"kind": ..., "payload":
//! ...}`. Streaming operations are not exposed.

use crate::errors::{Result, TunnelError};
use crate::tunnel::messages::RequestKind;
use crate::tunnel::{Envelope, RequestHandler};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// The JSON body shared by requests and responses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpEnvelope {
    pub kind: RequestKind,
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Client side of the HTTP adapter.
#[derive(Debug, Clone)]
pub struct HttpTunnelClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTunnelClient {
    /// Client against `http://127.0.0.1:<port>`.
    pub fn local(port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: format!("http://127.0.0.1:{}", port),
        }
    }

    /// Issue one unary operation.
    #[instrument(skip_all, fields(kind = ?kind))]
    pub async fn call<T: Serialize>(
        &self,
        kind: RequestKind,
        data: &T,
    ) -> Result<serde_json::Value> {
        if kind.is_streaming() {
            return Err(TunnelError::Protocol {
                message: format!("{:?} is streaming; not available over HTTP", kind),
            }
            .into());
        }

        let body = HttpEnvelope {
            kind,
            payload: serde_json::to_value(data).map_err(|e| TunnelError::Protocol {
                message: format!("request serialization failed: {}", e),
            })?,
        };

        let response = self
            .client
            .post(&self.base_url)
            .json(&body)
            .send()
            .await
            .map_err(|e| TunnelError::Transport {
                message: format!("http tunnel request failed: {}", e),
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(TunnelError::Remote {
                message: format!("http tunnel returned {}: {}", status, text),
            }
            .into());
        }

        let envelope: HttpEnvelope =
            response.json().await.map_err(|e| TunnelError::Protocol {
                message: format!("invalid http tunnel response: {}", e),
            })?;
        Ok(envelope.payload)
    }
}

/// Server side: a minimal single-endpoint HTTP/1.1 listener dispatching
/// into a [`RequestHandler`].
pub struct HttpTunnelServer {
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
}

impl HttpTunnelServer {
    /// Bind to an ephemeral localhost port.
    pub async fn bind_local(handler: Arc<dyn RequestHandler>) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| TunnelError::Transport {
                message: format!("http tunnel bind failed: {}", e),
            })?;
        Ok(Self { listener, handler })
    }

    /// The bound address.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(|e| {
            TunnelError::Transport {
                message: format!("http tunnel address unavailable: {}", e),
            }
            .into()
        })
    }

    /// Accept loop; runs until `root` is cancelled.
    #[instrument(skip_all)]
    pub async fn serve(self, root: CancellationToken) {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = root.cancelled() => break,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "http tunnel accept failed");
                    continue;
                }
            };
            debug!(peer = %peer, "http tunnel connection");
            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, handler).await {
                    debug!(error = %e, "http tunnel connection failed");
                }
            });
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
) -> Result<()> {
    let body = read_request(&mut stream).await?;
    let envelope: HttpEnvelope =
        serde_json::from_slice(&body).map_err(|e| TunnelError::Protocol {
            message: format!("invalid http tunnel request: {}", e),
        })?;

    if envelope.kind.is_streaming() {
        write_response(&mut stream, 400, b"streaming operations are not exposed").await?;
        return Ok(());
    }

    let request = Envelope {
        kind: envelope.kind,
        data: envelope.payload,
    };
    match handler.handle_unary(envelope.kind, request).await {
        Ok(payload) => {
            let response = HttpEnvelope {
                kind: envelope.kind,
                payload: serde_json::from_slice(&payload).unwrap_or(serde_json::Value::Null),
            };
            let body = serde_json::to_vec(&response).map_err(|e| TunnelError::Protocol {
                message: format!("response serialization failed: {}", e),
            })?;
            write_response(&mut stream, 200, &body).await
        }
        Err(e) => write_response(&mut stream, 500, e.to_string().as_bytes()).await,
    }
}

/// Read one POST request: request line, headers, then a Content-Length body.
async fn read_request(stream: &mut TcpStream) -> Result<Vec<u8>> {
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    let header_end = loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| TunnelError::Transport {
                message: format!("http tunnel read failed: {}", e),
            })?;
        if n == 0 {
            return Err(TunnelError::Transport {
                message: "http tunnel connection closed mid-request".to_string(),
            }
            .into());
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buffer) {
            break pos;
        }
        if buffer.len() > 64 * 1024 {
            return Err(TunnelError::Protocol {
                message: "http tunnel headers too large".to_string(),
            }
            .into());
        }
    };

    let headers = String::from_utf8_lossy(&buffer[..header_end]).to_string();
    let content_length = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.trim().eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let mut body = buffer[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| TunnelError::Transport {
                message: format!("http tunnel read failed: {}", e),
            })?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);
    Ok(body)
}

fn find_header_end(buffer: &[u8]) -> Option<usize> {
    buffer.windows(4).position(|w| w == b"\r\n\r\n")
}

async fn write_response(stream: &mut TcpStream, status: u16, body: &[u8]) -> Result<()> {
    let reason = match status {
        200 => "OK",
        400 => "Bad Request",
        _ => "Internal Server Error",
    };
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        reason,
        body.len()
    );
    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|e| TunnelError::Transport {
            message: format!("http tunnel write failed: {}", e),
        })?;
    stream
        .write_all(body)
        .await
        .map_err(|e| TunnelError::Transport {
            message: format!("http tunnel write failed: {}", e),
        })?;
    let _ = stream.shutdown().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::messages::{self, GitUser};
    use async_trait::async_trait;
    use bytes::Bytes;

    struct GitUserHandler;

    #[async_trait]
    impl RequestHandler for GitUserHandler {
        async fn handle_unary(&self, kind: RequestKind, _envelope: Envelope) -> Result<Bytes> {
            match kind {
                RequestKind::GitUser => messages::encode_message(&GitUser {
                    name: Some("Dev".to_string()),
                    email: Some("dev@example.com".to_string()),
                }),
                _ => Err(TunnelError::Protocol {
                    message: "unsupported".to_string(),
                }
                .into()),
            }
        }

        async fn handle_stream(
            &self,
            _kind: RequestKind,
            _envelope: Envelope,
            _stream: crate::tunnel::StreamSender,
        ) -> Result<()> {
            unreachable!("streaming is rejected before dispatch")
        }
    }

    #[tokio::test]
    async fn unary_operation_over_http() {
        let server = HttpTunnelServer::bind_local(Arc::new(GitUserHandler))
            .await
            .unwrap();
        let port = server.local_addr().unwrap().port();
        let root = CancellationToken::new();
        let serve = tokio::spawn(server.serve(root.clone()));

        let client = HttpTunnelClient::local(port);
        let payload = client
            .call(RequestKind::GitUser, &serde_json::json!({}))
            .await
            .unwrap();
        let user: GitUser = serde_json::from_value(payload).unwrap();
        assert_eq!(user.name.as_deref(), Some("Dev"));
        assert_eq!(user.email.as_deref(), Some("dev@example.com"));

        root.cancel();
        let _ = serve.await;
    }

    #[tokio::test]
    async fn streaming_kinds_are_rejected() {
        let client = HttpTunnelClient::local(1);
        let err = client
            .call(RequestKind::StreamMount, &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not available over HTTP"));
    }
}
