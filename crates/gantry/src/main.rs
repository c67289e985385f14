use clap::Parser;
use tokio_util::sync::CancellationToken;

mod cli;
mod commands;

#[tokio::main]
async fn main() {
    if let Err(e) = gantry_core::logging::init() {
        eprintln!("failed to initialize logging: {}", e);
    }

    let root = CancellationToken::new();
    spawn_signal_handler(root.clone());

    let cli = cli::Cli::parse();
    let code = match cli.dispatch(root).await {
        Ok(()) => 0,
        Err(e) => {
            render_error(&e);
            exit_code(&e)
        }
    };
    std::process::exit(code);
}

/// Remote failures propagate the remote exit code; everything else is 1.
fn exit_code(error: &anyhow::Error) -> i32 {
    use gantry_core::errors::{AgentError, GantryError};
    for cause in error.chain() {
        if let Some(GantryError::Agent(AgentError::RemoteExit { code })) =
            cause.downcast_ref::<GantryError>()
        {
            return *code;
        }
    }
    1
}

/// First signal cancels the root context so in-flight tasks wind down; a
/// second signal forces a hard exit.
fn spawn_signal_handler(root: CancellationToken) {
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::warn!("interrupt received, cancelling (press again to force exit)");
        root.cancel();
        let _ = tokio::signal::ctrl_c().await;
        std::process::exit(130);
    });
}

/// One rendered line with the first error; the full cause chain at debug.
fn render_error(error: &anyhow::Error) {
    eprintln!("error: {}", error);
    for cause in error.chain().skip(1) {
        tracing::debug!(cause = %cause, "error cause");
    }
}
