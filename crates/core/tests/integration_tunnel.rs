//! Tunnel session integration tests
//!
//! Runs both tunnel endpoints over an in-memory duplex pipe and exercises
//! the host services handler the way the in-container agent does: mount
//! streaming with mid-stream cancellation, credential lookups, and result
//! delivery racing log traffic.

use async_trait::async_trait;
use bytes::Bytes;
use gantry_core::errors::Result;
use gantry_core::tunnel::messages::{self, StreamRequest};
use gantry_core::tunnel::{
    Envelope, LogEntry, LogLevel, RejectingHandler, RequestHandler, RequestKind, StreamSender,
    Tunnel,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Host-like handler: answers credentials, streams a fixed number of
/// chunks, and records logs and the delivered result.
struct FakeHost {
    chunks: usize,
    chunks_sent: Arc<AtomicUsize>,
    logs: Arc<Mutex<Vec<LogEntry>>>,
    result: Arc<Mutex<Option<serde_json::Value>>>,
}

impl FakeHost {
    fn new(chunks: usize) -> Self {
        Self {
            chunks,
            chunks_sent: Arc::new(AtomicUsize::new(0)),
            logs: Arc::new(Mutex::new(Vec::new())),
            result: Arc::new(Mutex::new(None)),
        }
    }
}

#[async_trait]
impl RequestHandler for FakeHost {
    async fn handle_unary(&self, kind: RequestKind, envelope: Envelope) -> Result<Bytes> {
        match kind {
            RequestKind::GitUser => messages::encode_message(&messages::GitUser {
                name: Some("Host User".to_string()),
                email: Some("host@example.com".to_string()),
            }),
            RequestKind::SendResult => {
                *self.result.lock().unwrap() = Some(envelope.data);
                messages::encode_message(&serde_json::json!({}))
            }
            _ => messages::encode_message(&serde_json::json!({})),
        }
    }

    async fn handle_stream(
        &self,
        _kind: RequestKind,
        _envelope: Envelope,
        stream: StreamSender,
    ) -> Result<()> {
        for i in 0..self.chunks {
            tokio::time::sleep(Duration::from_millis(2)).await;
            stream.send(Bytes::from(vec![i as u8; 1024])).await?;
            self.chunks_sent.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn handle_log(&self, entry: LogEntry) {
        self.logs.lock().unwrap().push(entry);
    }
}

fn session(
    host: Arc<FakeHost>,
    root: CancellationToken,
) -> (Arc<Tunnel>, Arc<Tunnel>) {
    let (agent_side, host_side) = tokio::io::duplex(256 * 1024);
    let agent = Tunnel::over_duplex(agent_side, Arc::new(RejectingHandler), root.clone());
    let host_tunnel = Tunnel::over_duplex(host_side, host, root);
    (agent, host_tunnel)
}

#[tokio::test]
async fn stream_mount_cancelled_midway() {
    // Scenario: a mount stream is cancelled at roughly half the payload.
    // The receiver observes Cancelled and the sender stops promptly.
    let host = Arc::new(FakeHost::new(200));
    let chunks_sent = host.chunks_sent.clone();
    let root = CancellationToken::new();
    let (agent, _host_tunnel) = session(host, root.clone());

    let mut stream = agent
        .open_stream(
            RequestKind::StreamMount,
            &StreamRequest {
                path: "/workspaces/data".to_string(),
            },
        )
        .await
        .unwrap();

    let mut received = 0usize;
    let error = loop {
        if received == 100 {
            root.cancel();
        }
        match stream.next_chunk().await {
            Ok(Some(_)) => received += 1,
            Ok(None) => panic!("stream finished despite cancellation"),
            Err(e) => break e,
        }
    };
    assert!(error.to_string().contains("Cancelled"));

    // The sender must stop; allow in-flight frames to settle first.
    tokio::time::sleep(Duration::from_millis(50)).await;
    let settled = chunks_sent.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(chunks_sent.load(Ordering::SeqCst), settled);
    assert!(settled < 200, "sender ran to completion despite cancel");
}

#[tokio::test]
async fn logs_issued_before_result_are_drained() {
    // Ordering rule: logs sent before SendResult may still be in flight
    // when the result lands; the host drains them before reporting success.
    let host = Arc::new(FakeHost::new(0));
    let logs = host.logs.clone();
    let result_slot = host.result.clone();
    let root = CancellationToken::new();
    let (agent, _host_tunnel) = session(host, root.clone());

    for i in 0..50 {
        agent
            .send_log(
                &LogEntry {
                    level: LogLevel::Info,
                    message: format!("setup-step-{}", i),
                },
                Duration::from_secs(5),
            )
            .await
            .unwrap();
    }
    agent
        .call(
            RequestKind::SendResult,
            &serde_json::json!({"workspaceFolder": "/workspaces/app"}),
        )
        .await
        .unwrap();

    // Writer ordering guarantees all 50 log frames precede the request on
    // the wire; once the response arrived, the logs are delivered.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(result_slot.lock().unwrap().is_some());
    assert_eq!(logs.lock().unwrap().len(), 50);
}

#[tokio::test]
async fn credential_lookups_complete_out_of_order_with_streams() {
    let host = Arc::new(FakeHost::new(50));
    let root = CancellationToken::new();
    let (agent, _host_tunnel) = session(host, root);

    let mut stream = agent
        .open_stream(
            RequestKind::StreamWorkspace,
            &StreamRequest {
                path: "/workspaces".to_string(),
            },
        )
        .await
        .unwrap();

    // Interleave unary calls with stream consumption.
    let mut chunks = 0;
    for _ in 0..10 {
        let user: messages::GitUser = agent
            .request(RequestKind::GitUser, &serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(user.email.as_deref(), Some("host@example.com"));
        if let Some(_chunk) = stream.next_chunk().await.unwrap() {
            chunks += 1;
        }
    }
    while let Some(_chunk) = stream.next_chunk().await.unwrap() {
        chunks += 1;
    }
    assert_eq!(chunks, 50);
}

#[tokio::test]
async fn tunnel_is_one_shot_after_close() {
    let host = Arc::new(FakeHost::new(0));
    let root = CancellationToken::new();
    let (agent, host_tunnel) = session(host, root);

    agent
        .call(RequestKind::GitUser, &serde_json::json!({}))
        .await
        .unwrap();

    host_tunnel.shutdown().await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let err = agent
        .call(RequestKind::GitUser, &serde_json::json!({}))
        .await
        .unwrap_err();
    let rendered = err.to_string().to_lowercase();
    assert!(
        rendered.contains("disconnected") || rendered.contains("deadline"),
        "unexpected error after close: {}",
        rendered
    );
}
