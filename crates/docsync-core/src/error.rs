//! Domain-specific error types following panic-free policy.

use crate::{CallbackId, CallbackKind, ModelId};
use thiserror::Error;

/// Errors that can occur in document operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    /// A patch or event referenced a model the document does not contain
    #[error("Unknown model: {model}")]
    UnknownModel { model: ModelId },

    /// A model with this id is already part of the document
    #[error("Model already exists: {model}")]
    ModelAlreadyExists { model: ModelId },

    /// The model is not one of the document roots
    #[error("Model {model} is not a root of this document")]
    NotARoot { model: ModelId },

    /// Roots leave the document through root removal, not model removal
    #[error("Model {model} is a root of this document")]
    IsARoot { model: ModelId },

    /// The callback already ran or was already removed
    #[error("{kind} callback {id} already ran or was already removed, cannot be removed again")]
    CallbackAlreadyRemoved { id: CallbackId, kind: CallbackKind },

    /// A document or event callback failed
    #[error("Callback failed: {reason}")]
    CallbackFailed { reason: String },

    /// Operation attempted on a destroyed document
    #[error("Document has been destroyed")]
    Destroyed,
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
