//! Tunnel message catalogue
//!
//! The logical operations the tunnel carries. Request payloads are a
//! deterministic JSON envelope `{kind, data}`; responses are the bare
//! message. Streaming operations transfer raw byte chunks after the
//! envelope.

use crate::errors::{Result, TunnelError};
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Logical operation names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestKind {
    /// Health check; must answer within the configured deadline
    Ping,
    /// Fire-and-forget log line
    Log,
    /// Final payload of a setup run
    SendResult,
    /// Git identity lookup
    GitUser,
    /// Git credential lookup via the host helper chain
    GitCredentials,
    /// Docker registry credential lookup via the host keychain
    DockerCredentials,
    /// Platform configuration blob
    LoftConfig,
    /// Kubeconfig lookup
    KubeConfig,
    /// GPG public keys for commit signing
    GPGPublicKeys,
    /// SSH signature for git signing
    GitSSHSignature,
    /// Add a host-side port forward
    ForwardPort,
    /// Remove a host-side port forward
    StopForwardPort,
    /// Stream a git clone into the container (server-streaming)
    StreamGitClone,
    /// Stream the workspace content (server-streaming)
    StreamWorkspace,
    /// Stream one bind-mount's content (server-streaming)
    StreamMount,
}

impl RequestKind {
    /// Whether this operation is server-streaming.
    pub fn is_streaming(&self) -> bool {
        matches!(
            self,
            RequestKind::StreamGitClone | RequestKind::StreamWorkspace | RequestKind::StreamMount
        )
    }
}

/// Request envelope carried in unary/stream request payloads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: RequestKind,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    pub fn new<T: Serialize>(kind: RequestKind, data: &T) -> Result<Self> {
        Ok(Self {
            kind,
            data: serde_json::to_value(data).map_err(|e| TunnelError::Protocol {
                message: format!("request serialization failed: {}", e),
            })?,
        })
    }

    pub fn encode(&self) -> Result<Bytes> {
        let bytes = serde_json::to_vec(self).map_err(|e| TunnelError::Protocol {
            message: format!("envelope serialization failed: {}", e),
        })?;
        Ok(Bytes::from(bytes))
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| {
            TunnelError::Protocol {
                message: format!("invalid request envelope: {}", e),
            }
            .into()
        })
    }

    pub fn data_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.data.clone()).map_err(|e| {
            TunnelError::Protocol {
                message: format!("invalid request data: {}", e),
            }
            .into()
        })
    }
}

/// Encode a response message as a payload.
pub fn encode_message<T: Serialize>(message: &T) -> Result<Bytes> {
    let bytes = serde_json::to_vec(message).map_err(|e| TunnelError::Protocol {
        message: format!("response serialization failed: {}", e),
    })?;
    Ok(Bytes::from(bytes))
}

/// Decode a response payload.
pub fn decode_message<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| {
        TunnelError::Protocol {
            message: format!("invalid response message: {}", e),
        }
        .into()
    })
}

/// Log severity carried by [`RequestKind::Log`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// A log line shipped from the container to the host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
}

/// Git identity response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitUser {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Git credential request, mirroring the git-credential wire keys.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitCredentialsRequest {
    pub protocol: String,
    pub host: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// Git credential response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GitCredentialsResponse {
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Docker registry credential request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerCredentialsRequest {
    pub registry: String,
}

/// Docker registry credential response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DockerCredentialsResponse {
    pub username: Option<String>,
    pub secret: Option<String>,
}

/// Port-forward request: open `host_port` (or the container port when
/// absent) forwarding to `port` in the container.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardPortRequest {
    pub port: u16,
    #[serde(default)]
    pub host_port: Option<u16>,
}

/// Stop forwarding a port.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopForwardPortRequest {
    pub port: u16,
}

/// Stream request: which path (mount target, workspace, or clone URL) to
/// stream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamRequest {
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_round_trip() {
        let request = GitCredentialsRequest {
            protocol: "https".to_string(),
            host: "github.com".to_string(),
            path: None,
        };
        let envelope = Envelope::new(RequestKind::GitCredentials, &request).unwrap();
        let encoded = envelope.encode().unwrap();
        let decoded = Envelope::decode(&encoded).unwrap();
        assert_eq!(decoded.kind, RequestKind::GitCredentials);
        assert_eq!(decoded.data_as::<GitCredentialsRequest>().unwrap(), request);
    }

    #[test]
    fn encoding_is_deterministic() {
        let entry = LogEntry {
            level: LogLevel::Info,
            message: "hello".to_string(),
        };
        assert_eq!(
            encode_message(&entry).unwrap(),
            encode_message(&entry).unwrap()
        );
    }

    #[test]
    fn streaming_kinds_are_marked() {
        assert!(RequestKind::StreamMount.is_streaming());
        assert!(RequestKind::StreamWorkspace.is_streaming());
        assert!(RequestKind::StreamGitClone.is_streaming());
        assert!(!RequestKind::Ping.is_streaming());
        assert!(!RequestKind::SendResult.is_streaming());
    }

    #[test]
    fn invalid_envelope_is_protocol_error() {
        let err = Envelope::decode(b"not json").unwrap_err();
        assert!(err.to_string().contains("invalid request envelope"));
    }
}
