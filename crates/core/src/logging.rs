//! Logging and observability
//!
//! Subscriber setup for the host-side entrypoints only. The injected agent
//! never calls [`init`]: inside the container, stdout carries tunnel frames
//! and stderr is captured by the exec, so agent diagnostics travel through
//! [`crate::tunnel::RemoteLogger`] to the host instead of a local
//! subscriber.

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the host-side subscriber.
///
/// Events go to stderr; stdout is reserved for command output such as the
/// JSON the `up`/`status` commands print. The filter honors `RUST_LOG` and
/// falls back to `info`. Installing twice (tests, embedded use) reports an
/// error instead of panicking.
pub fn init() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging subscriber already installed: {}", e))
}
