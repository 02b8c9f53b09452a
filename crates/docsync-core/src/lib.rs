//! docsync Core - Shared types for document session synchronization
//!
//! This crate provides the domain types shared between the daemon
//! (docsyncd) and the wire protocol (docsync-protocol):
//! - identifiers for sessions, connections and callbacks
//! - the synchronized [`Document`] and its change events
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod document;
pub mod error;
pub mod events;
pub mod ids;

// Re-exports for convenience
pub use document::{
    Document, DocumentCallback, EventHandler, SessionCallback, SessionDestroyedCallback,
};
pub use error::{DomainError, DomainResult};
pub use events::{
    CallbackSchedule, DocumentEvent, DocumentJson, DocumentPatchedEvent, ModelJson, PatchEvent,
    UiEvent,
};
pub use ids::{CallbackId, CallbackKind, ConnectionId, ModelId, SessionId};
