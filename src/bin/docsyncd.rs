//! docsync daemon - document session synchronization server
//!
//! Serves applications over a Unix socket. Each client opens (or joins) a
//! session, pulls the document, and from then on exchanges patches with the
//! server and every other client attached to the same session.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (socket at /tmp/docsync.sock)
//! docsyncd
//!
//! # Custom config file and socket path
//! docsyncd --config ./docsync.toml --socket /run/docsync.sock
//!
//! # Socket path from the environment
//! DOCSYNC_SOCKET=/run/docsync.sock docsyncd
//!
//! # Enable debug logging
//! RUST_LOG=docsyncd=debug docsyncd
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown (unload hooks run, socket removed)

use std::path::PathBuf;
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use clap::Parser;
use serde_json::json;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use docsync_core::{ModelId, ModelJson};
use docsyncd::{
    Application, DaemonConfig, DaemonServer, FunctionHandler, Handler, HookResult, ServerContext,
    SessionContext,
};

/// docsync daemon - keeps server-side documents in sync with clients
#[derive(Parser, Debug)]
#[command(name = "docsyncd", version, about)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/docsync/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Unix socket to listen on
    #[arg(short, long)]
    socket: Option<PathBuf>,

    /// Milliseconds a session without connections is kept
    #[arg(long)]
    unused_session_lifetime_ms: Option<u64>,

    /// Milliseconds between unused session checks
    #[arg(long)]
    check_unused_sessions_ms: Option<u64>,
}

impl Args {
    fn into_config(self) -> Result<DaemonConfig> {
        let mut config = DaemonConfig::load_or_default(self.config.as_deref())
            .context("Failed to load configuration")?;
        if let Some(socket) = self.socket {
            config.socket_path = socket;
        }
        if let Some(lifetime) = self.unused_session_lifetime_ms {
            config.unused_session_lifetime_ms = lifetime;
        }
        if let Some(check) = self.check_unused_sessions_ms {
            config.check_unused_sessions_ms = check;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("docsyncd=info".parse()?)
                .add_directive("docsync_core=info".parse()?)
                .add_directive("docsync_protocol=info".parse()?),
        )
        .init();

    let config = Args::parse().into_config()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "docsync daemon starting"
    );

    let cancel_token = CancellationToken::new();
    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let mut server = DaemonServer::new(config, Handle::current(), cancel_token);
    server.add_application("/", sliders_app());

    info!(socket = %server.socket_path().display(), "Starting server");
    if let Err(e) = server.run().await {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("docsync daemon stopped");
    Ok(())
}

/// Demo application: a slider whose value is mirrored into a label, and a
/// ticking counter updated once a second.
fn sliders_app() -> Application {
    let document = FunctionHandler::new("sliders", |document, context| {
        let start = context
            .request()
            .argument("start")
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(0);

        document.set_title("Sliders");
        document.add_root(
            ModelJson::new("slider", "Slider").with_attribute("value", json!(start)),
        )?;
        document.add_root(
            ModelJson::new("label", "Div")
                .with_attribute("text", json!(format!("value: {start}"))),
        )?;
        document.add_root(ModelJson::new("ticks", "Div").with_attribute("text", json!(0)))?;

        document.on_event("value_changed", |doc, event| {
            let value = event.values.get("value").cloned().unwrap_or(json!(null));
            doc.set_attribute(&ModelId::new("slider"), "value", value.clone())?;
            doc.set_attribute(&ModelId::new("label"), "text", json!(format!("value: {value}")))?;
            Ok(())
        });

        let ticks = AtomicU64::new(0);
        document.add_periodic_callback(
            move |doc| {
                let n = ticks.fetch_add(1, Ordering::Relaxed) + 1;
                doc.set_attribute(&ModelId::new("ticks"), "text", json!(n))?;
                Ok(())
            },
            Duration::from_secs(1),
        );
        Ok(())
    });

    Application::new()
        .with_handler(document)
        .with_handler(LifecycleLogger)
}

/// Logs application lifecycle events.
struct LifecycleLogger;

#[async_trait]
impl Handler for LifecycleLogger {
    fn name(&self) -> &str {
        "lifecycle-logger"
    }

    async fn on_server_loaded(&self, context: &ServerContext) -> HookResult {
        info!(sessions = context.sessions().len(), "Application loaded");
        Ok(())
    }

    async fn on_server_unloaded(&self, _context: &ServerContext) -> HookResult {
        info!("Application unloaded");
        Ok(())
    }

    async fn on_session_created(&self, context: &SessionContext) -> HookResult {
        info!(session_id = %context.id(), "Session opened");
        Ok(())
    }

    async fn on_session_destroyed(&self, context: &SessionContext) -> HookResult {
        info!(
            session_id = %context.id(),
            lived_secs = (Utc::now() - context.created_at()).num_seconds(),
            "Session closed"
        );
        Ok(())
    }
}

/// Waits for a shutdown signal (SIGTERM or SIGINT).
async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
