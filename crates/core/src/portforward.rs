//! Host-side port forwarding
//!
//! The in-container agent polls its own `/proc/net/tcp`, filters by the
//! allow-list, and asks the host to forward listening ports via the
//! `ForwardPort`/`StopForwardPort` operations. This module is the host
//! side: a local listener per forwarded port, each accepted connection
//! streamed into the container through a [`PortConnector`].
//!
//! Forwarding is best-effort: failures are reported and the run continues.
//! Each forward tracks its own last-activity instant and expires after its
//! idle timeout (0 disables expiry for that forward). All forwards are torn
//! down when the tunnel closes.

use crate::errors::{Result, TunnelError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Opens a connection to a port inside the container.
#[async_trait]
pub trait PortConnector: Send + Sync {
    async fn connect(
        &self,
        port: u16,
    ) -> Result<Box<dyn DuplexStream>>;
}

/// Object-safe duplex stream alias.
pub trait DuplexStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> DuplexStream for T {}

/// Connector over plain TCP; the remote driver exposes container ports on a
/// reachable address (SSH channels wrap this the same way).
#[derive(Debug, Clone)]
pub struct TcpConnector {
    host: String,
}

impl TcpConnector {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

#[async_trait]
impl PortConnector for TcpConnector {
    async fn connect(&self, port: u16) -> Result<Box<dyn DuplexStream>> {
        let stream = tokio::net::TcpStream::connect((self.host.as_str(), port))
            .await
            .map_err(|e| TunnelError::Transport {
                message: format!("connect to {}:{} failed: {}", self.host, port, e),
            })?;
        Ok(Box::new(stream))
    }
}

struct ForwardHandle {
    cancel: CancellationToken,
    local_port: u16,
}

/// Manages the set of active forwards.
pub struct PortForwarder {
    connector: Arc<dyn PortConnector>,
    forwards: Mutex<HashMap<u16, ForwardHandle>>,
    /// Idle timeout applied to new forwards; zero disables expiry
    idle_timeout: Duration,
    root: CancellationToken,
}

impl PortForwarder {
    pub fn new(
        connector: Arc<dyn PortConnector>,
        idle_timeout: Duration,
        root: CancellationToken,
    ) -> Self {
        Self {
            connector,
            forwards: Mutex::new(HashMap::new()),
            idle_timeout,
            root,
        }
    }

    /// Start forwarding `container_port`; the local listener binds
    /// `host_port` (or an ephemeral port when zero). Returns the local port.
    #[instrument(skip(self))]
    pub async fn add_forward(&self, container_port: u16, host_port: u16) -> Result<u16> {
        if let Some(existing) = self.forwards.lock().expect("forward map poisoned").get(&container_port)
        {
            return Ok(existing.local_port);
        }

        let listener = TcpListener::bind(("127.0.0.1", host_port))
            .await
            .map_err(|e| TunnelError::Transport {
                message: format!("bind 127.0.0.1:{} failed: {}", host_port, e),
            })?;
        let local_port = listener
            .local_addr()
            .map_err(|e| TunnelError::Transport {
                message: format!("listener address unavailable: {}", e),
            })?
            .port();

        let cancel = self.root.child_token();
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        // Idle watcher, per forward.
        if !self.idle_timeout.is_zero() {
            let watcher_cancel = cancel.clone();
            let watcher_activity = last_activity.clone();
            let idle_timeout = self.idle_timeout;
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(idle_timeout / 4) => {}
                        _ = watcher_cancel.cancelled() => break,
                    }
                    let idle = watcher_activity
                        .lock()
                        .expect("activity instant poisoned")
                        .elapsed();
                    if idle >= idle_timeout {
                        info!(container_port, "port forward idle, tearing down");
                        watcher_cancel.cancel();
                        break;
                    }
                }
            });
        }

        let accept_cancel = cancel.clone();
        let connector = self.connector.clone();
        tokio::spawn(async move {
            loop {
                let accepted = tokio::select! {
                    accepted = listener.accept() => accepted,
                    _ = accept_cancel.cancelled() => break,
                };
                let (mut local, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        warn!(error = %e, "port forward accept failed");
                        continue;
                    }
                };
                debug!(peer = %peer, container_port, "forwarding connection");
                *last_activity.lock().expect("activity instant poisoned") = Instant::now();

                let connector = connector.clone();
                let conn_cancel = accept_cancel.clone();
                let conn_activity = last_activity.clone();
                tokio::spawn(async move {
                    let mut remote = match connector.connect(container_port).await {
                        Ok(remote) => remote,
                        Err(e) => {
                            // Best-effort: report and keep the listener up.
                            warn!(container_port, error = %e, "port forward connect failed");
                            return;
                        }
                    };
                    tokio::select! {
                        result = tokio::io::copy_bidirectional(&mut local, &mut remote) => {
                            if let Err(e) = result {
                                debug!(container_port, error = %e, "forwarded connection ended");
                            }
                        }
                        _ = conn_cancel.cancelled() => {}
                    }
                    *conn_activity.lock().expect("activity instant poisoned") = Instant::now();
                });
            }
        });

        self.forwards
            .lock()
            .expect("forward map poisoned")
            .insert(container_port, ForwardHandle { cancel, local_port });
        info!(container_port, local_port, "port forward established");
        Ok(local_port)
    }

    /// Stop forwarding a port; unknown ports are a no-op.
    #[instrument(skip(self))]
    pub fn stop_forward(&self, container_port: u16) {
        if let Some(handle) = self
            .forwards
            .lock()
            .expect("forward map poisoned")
            .remove(&container_port)
        {
            handle.cancel.cancel();
            info!(container_port, "port forward stopped");
        }
    }

    /// Local port of an active forward.
    pub fn local_port(&self, container_port: u16) -> Option<u16> {
        self.forwards
            .lock()
            .expect("forward map poisoned")
            .get(&container_port)
            .map(|handle| handle.local_port)
    }

    /// Tear down every forward (tunnel close).
    pub fn shutdown(&self) {
        let mut forwards = self.forwards.lock().expect("forward map poisoned");
        for (port, handle) in forwards.drain() {
            debug!(port, "tearing down port forward");
            handle.cancel.cancel();
        }
    }
}

/// Parse listening TCP ports out of `/proc/net/tcp`-format content
/// (state 0A = LISTEN; local address column is `hexip:hexport`).
pub fn parse_listening_ports(proc_net_tcp: &str) -> Vec<u16> {
    let mut ports = Vec::new();
    for line in proc_net_tcp.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 || fields[3] != "0A" {
            continue;
        }
        let Some((_, port_hex)) = fields[1].rsplit_once(':') else {
            continue;
        };
        if let Ok(port) = u16::from_str_radix(port_hex, 16) {
            if !ports.contains(&port) {
                ports.push(port);
            }
        }
    }
    ports
}

/// Filter polled ports by the forward allow-list; an empty allow-list
/// forwards nothing automatically.
pub fn allowed_ports(listening: &[u16], allow_list: &[u16]) -> Vec<u16> {
    listening
        .iter()
        .copied()
        .filter(|port| allow_list.contains(port))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Echo server standing in for a container port.
    async fn start_echo_server() -> u16 {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    while let Ok(n) = stream.read(&mut buf).await {
                        if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        port
    }

    #[tokio::test]
    async fn forwards_bytes_both_ways() {
        let echo_port = start_echo_server().await;
        let forwarder = PortForwarder::new(
            Arc::new(TcpConnector::new("127.0.0.1")),
            Duration::ZERO,
            CancellationToken::new(),
        );

        let local_port = forwarder.add_forward(echo_port, 0).await.unwrap();
        let mut client = tokio::net::TcpStream::connect(("127.0.0.1", local_port))
            .await
            .unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        forwarder.stop_forward(echo_port);
        assert!(forwarder.local_port(echo_port).is_none());
    }

    #[tokio::test]
    async fn duplicate_forward_reuses_listener() {
        let echo_port = start_echo_server().await;
        let forwarder = PortForwarder::new(
            Arc::new(TcpConnector::new("127.0.0.1")),
            Duration::ZERO,
            CancellationToken::new(),
        );
        let first = forwarder.add_forward(echo_port, 0).await.unwrap();
        let second = forwarder.add_forward(echo_port, 0).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn idle_forward_expires() {
        let echo_port = start_echo_server().await;
        let forwarder = PortForwarder::new(
            Arc::new(TcpConnector::new("127.0.0.1")),
            Duration::from_millis(200),
            CancellationToken::new(),
        );
        let local_port = forwarder.add_forward(echo_port, 0).await.unwrap();

        tokio::time::sleep(Duration::from_millis(500)).await;
        // The listener task has exited; new connections are refused or
        // immediately closed.
        let attempt = tokio::net::TcpStream::connect(("127.0.0.1", local_port)).await;
        let dead = match attempt {
            Err(_) => true,
            Ok(mut stream) => {
                let mut buf = [0u8; 1];
                stream.write_all(b"x").await.ok();
                matches!(stream.read(&mut buf).await, Ok(0) | Err(_))
            }
        };
        assert!(dead, "idle forward should stop accepting");
    }

    #[tokio::test]
    async fn shutdown_tears_down_all_forwards() {
        let echo_port = start_echo_server().await;
        let root = CancellationToken::new();
        let forwarder = PortForwarder::new(
            Arc::new(TcpConnector::new("127.0.0.1")),
            Duration::ZERO,
            root,
        );
        forwarder.add_forward(echo_port, 0).await.unwrap();
        forwarder.shutdown();
        assert!(forwarder.local_port(echo_port).is_none());
    }

    #[test]
    fn parses_listening_ports_from_proc() {
        let content = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid
   0: 00000000:0BB8 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000
   1: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000  1000
   2: 0100007F:AAAA 0100007F:BBBB 01 00000000:00000000 00:00000000 00000000  1000
";
        let ports = parse_listening_ports(content);
        assert_eq!(ports, vec![0x0BB8, 0x1F90]);
    }

    #[test]
    fn allow_list_filters_ports() {
        let listening = vec![3000, 8080, 5432];
        assert_eq!(allowed_ports(&listening, &[3000, 5432]), vec![3000, 5432]);
        assert!(allowed_ports(&listening, &[]).is_empty());
    }
}
