//! docsync daemon - session synchronization server
//!
//! This crate keeps server-side documents in sync with remote clients:
//! - `callbacks` - next-tick, timeout and periodic callbacks on the runtime
//! - `session` - a document plus the connections subscribed to it
//! - `contexts` - per-application session registry and hook contexts
//! - `protocol_handler` - dispatch of client messages to sessions
//! - `server` - Unix socket server and per-connection transport
//! - `monitor` - periodic server statistics
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      docsyncd daemon                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │  DaemonServer   │────▶│    ApplicationContext       │    │
//! │  │ (Unix Socket)   │     │  (one per URL path)         │    │
//! │  └────────┬────────┘     └──────────────┬──────────────┘    │
//! │           │ connections                 │ sessions          │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐    │
//! │  │ServerConnection │────▶│      ServerSession          │    │
//! │  │  (per client)   │◀────│  (locked Document, patches) │    │
//! │  └─────────────────┘     └─────────────────────────────┘    │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod application;
pub mod callbacks;
pub mod config;
pub mod connection;
pub mod contexts;
pub mod monitor;
pub mod protocol_handler;
pub mod server;
pub mod session;

pub use application::{Application, FunctionHandler, Handler, HookError, HookResult};
pub use callbacks::{Callback, CallbackError, CallbackGroup, CallbackOutcome};
pub use config::{ConfigError, DaemonConfig};
pub use connection::{ConnectionError, ConnectionHandle, ServerConnection};
pub use contexts::{ApplicationContext, ServerContext, SessionContext, SessionRequest};
pub use protocol_handler::ProtocolHandler;
pub use server::{DaemonServer, ServerError};
pub use session::{ServerSession, SessionError, SessionSettings};
