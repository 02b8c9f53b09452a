//! Unix socket server for the docsync daemon.
//!
//! The server:
//! - Listens on a Unix socket for client connections
//! - Spawns a transport task per connection
//! - Runs application load/unload hooks at start and shutdown
//! - Periodically discards unused sessions
//! - Supports graceful shutdown via CancellationToken
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   DaemonServer  │
//! │  UnixListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐  OPEN   ┌──────────────────────┐
//! │ ConnectionTask  │────────▶│  ApplicationContext  │
//! │  (per client)   │         │  (session registry)  │
//! └───────┬─────────┘         └──────────┬───────────┘
//!         │ messages                     │ owns
//!         ▼                              ▼
//! ┌─────────────────┐  locked  ┌──────────────────────┐
//! │ ProtocolHandler │────────▶│    ServerSession     │
//! └─────────────────┘         └──────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Server errors are logged and allow continued operation

mod transport;

pub use transport::ConnectionTask;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{UnixListener, UnixStream};
use tokio::runtime::Handle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docsync_core::ConnectionId;

use crate::application::Application;
use crate::config::DaemonConfig;
use crate::contexts::ApplicationContext;
use crate::monitor::spawn_stats_task;
use crate::protocol_handler::ProtocolHandler;

/// Server version reported in SERVER-INFO-REPLY.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Applications served by one server, keyed by URL path.
pub type ApplicationMap = HashMap<String, Arc<ApplicationContext>>;

/// Unix socket server hosting one or more applications.
pub struct DaemonServer {
    config: DaemonConfig,
    runtime: Handle,
    apps: ApplicationMap,
    protocol: Arc<ProtocolHandler>,
    cancel_token: CancellationToken,
    connection_counter: AtomicU64,
    active_connections: Arc<AtomicUsize>,
}

impl DaemonServer {
    /// Creates a server. Applications are added with [`DaemonServer::add_application`].
    pub fn new(config: DaemonConfig, runtime: Handle, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            runtime,
            apps: HashMap::new(),
            protocol: Arc::new(ProtocolHandler::new(SERVER_VERSION)),
            cancel_token,
            connection_counter: AtomicU64::new(0),
            active_connections: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Serves `application` under `path`, replacing any previous one.
    pub fn add_application(
        &mut self,
        path: impl Into<String>,
        application: Application,
    ) -> Arc<ApplicationContext> {
        let path = path.into();
        let context = ApplicationContext::new(
            application,
            path.clone(),
            self.runtime.clone(),
            self.config.session_settings(),
        );
        if self.apps.insert(path.clone(), Arc::clone(&context)).is_some() {
            warn!(app = %path, "Replacing application");
        }
        context
    }

    pub fn application(&self, path: &str) -> Option<&Arc<ApplicationContext>> {
        self.apps.get(path)
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::SeqCst)
    }

    /// Runs the server until the cancellation token fires.
    pub async fn run(&self) -> Result<(), ServerError> {
        let listener = self.bind()?;
        info!(
            socket = %self.socket_path().display(),
            apps = self.apps.len(),
            "Daemon server listening"
        );

        for app in self.apps.values() {
            app.run_load_hook().await;
        }

        let apps: Vec<Arc<ApplicationContext>> = self.apps.values().cloned().collect();
        let cleanup = spawn_cleanup_task(
            apps.clone(),
            self.config.check_unused_sessions(),
            self.config.unused_session_lifetime(),
            self.cancel_token.clone(),
        );
        let stats = spawn_stats_task(
            apps,
            self.config.stats_log_frequency(),
            self.cancel_token.clone(),
        );

        let apps = Arc::new(self.apps.clone());
        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = listener.accept() => {
                    match result {
                        Ok((stream, _addr)) => self.handle_connection(stream, &apps),
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        if let Err(e) = cleanup.await {
            debug!(error = %e, "Cleanup task ended abnormally");
        }
        if let Err(e) = stats.await {
            debug!(error = %e, "Stats task ended abnormally");
        }
        self.shutdown().await;
        Ok(())
    }

    fn bind(&self) -> Result<UnixListener, ServerError> {
        let path = self.socket_path();
        let setup_error = |e: std::io::Error| ServerError::SocketSetup {
            path: path.to_path_buf(),
            error: e.to_string(),
        };

        if path.exists() {
            std::fs::remove_file(path).map_err(setup_error)?;
        }
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(setup_error)?;
            }
        }
        UnixListener::bind(path).map_err(setup_error)
    }

    fn handle_connection(&self, stream: UnixStream, apps: &Arc<ApplicationMap>) {
        let number = self.connection_counter.fetch_add(1, Ordering::Relaxed);
        let id = ConnectionId::new(number);

        let active = self.active_connections.fetch_add(1, Ordering::SeqCst);
        let slot = ConnectionSlot(Arc::clone(&self.active_connections));
        if active >= self.config.max_connections {
            let err = ServerError::TooManyConnections {
                max: self.config.max_connections,
            };
            warn!(connection = %id, error = %err, "Rejecting connection");
            return;
        }

        let task = ConnectionTask::new(
            stream,
            id,
            Arc::clone(apps),
            Arc::clone(&self.protocol),
            self.config.outbound_buffer,
            self.cancel_token.clone(),
        );
        tokio::spawn(async move {
            let _slot = slot;
            task.run().await;
        });
    }

    async fn shutdown(&self) {
        for app in self.apps.values() {
            app.run_unload_hook().await;
        }

        let path = self.socket_path();
        if path.exists() {
            if let Err(e) = std::fs::remove_file(path) {
                warn!(socket = %path.display(), error = %e, "Failed to remove socket file");
            }
        }

        info!("Server cleanup complete");
    }
}

/// Counts one live connection until dropped.
struct ConnectionSlot(Arc<AtomicUsize>);

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Spawns the unused-session cleanup task.
pub fn spawn_cleanup_task(
    apps: Vec<Arc<ApplicationContext>>,
    check_every: Duration,
    unused_lifetime: Duration,
    cancel_token: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = interval_at(Instant::now() + check_every, check_every);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel_token.cancelled() => break,

                _ = tick.tick() => {
                    for app in &apps {
                        app.cleanup_sessions(unused_lifetime).await;
                    }
                }
            }
        }

        debug!("Session cleanup task completed");
    })
}

/// Errors that can occur in server operations.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to setup socket at {path}: {error}")]
    SocketSetup { path: PathBuf, error: String },

    #[error("Too many connections (max: {max})")]
    TooManyConnections { max: usize },
}
