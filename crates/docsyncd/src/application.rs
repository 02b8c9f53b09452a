//! User applications and their lifecycle hooks.
//!
//! An [`Application`] is a list of [`Handler`]s. Each hook is fanned out to
//! the handlers in registration order; the first failure stops the fan-out
//! and is returned to the caller, which logs it.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::error;

use docsync_core::{Document, DomainError};

use crate::contexts::{ServerContext, SessionContext};

/// Failure reported by an application hook.
#[derive(Debug, Clone, Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Document(#[from] DomainError),
}

impl HookError {
    pub fn msg(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}

pub type HookResult = Result<(), HookError>;

/// Lifecycle hooks an application can implement. Every hook defaults to a
/// no-op.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str {
        "handler"
    }

    /// Populates the document of a freshly created session.
    async fn modify_document(
        &self,
        _document: &mut Document,
        _context: &SessionContext,
    ) -> HookResult {
        Ok(())
    }

    async fn on_server_loaded(&self, _context: &ServerContext) -> HookResult {
        Ok(())
    }

    async fn on_server_unloaded(&self, _context: &ServerContext) -> HookResult {
        Ok(())
    }

    async fn on_session_created(&self, _context: &SessionContext) -> HookResult {
        Ok(())
    }

    async fn on_session_destroyed(&self, _context: &SessionContext) -> HookResult {
        Ok(())
    }
}

type ModifyFn = dyn Fn(&mut Document, &SessionContext) -> HookResult + Send + Sync;

/// Handler that builds documents with a plain function.
pub struct FunctionHandler {
    name: String,
    modify: Box<ModifyFn>,
}

impl FunctionHandler {
    pub fn new<F>(name: impl Into<String>, modify: F) -> Self
    where
        F: Fn(&mut Document, &SessionContext) -> HookResult + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            modify: Box::new(modify),
        }
    }
}

#[async_trait]
impl Handler for FunctionHandler {
    fn name(&self) -> &str {
        &self.name
    }

    async fn modify_document(
        &self,
        document: &mut Document,
        context: &SessionContext,
    ) -> HookResult {
        (self.modify)(document, context)
    }
}

/// A set of handlers served under one URL path.
#[derive(Default, Clone)]
pub struct Application {
    handlers: Vec<Arc<dyn Handler>>,
}

impl Application {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(mut self, handler: impl Handler + 'static) -> Self {
        self.add(handler);
        self
    }

    pub fn add(&mut self, handler: impl Handler + 'static) {
        self.handlers.push(Arc::new(handler));
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Runs every handler's `modify_document`. Failures are logged and the
    /// remaining handlers still run.
    pub async fn initialize_document(&self, document: &mut Document, context: &SessionContext) {
        for handler in &self.handlers {
            if let Err(e) = handler.modify_document(document, context).await {
                error!(
                    handler = handler.name(),
                    session_id = %context.id(),
                    error = %e,
                    "Error running application handler"
                );
            }
        }
    }

    pub async fn on_server_loaded(&self, context: &ServerContext) -> HookResult {
        for handler in &self.handlers {
            handler.on_server_loaded(context).await?;
        }
        Ok(())
    }

    pub async fn on_server_unloaded(&self, context: &ServerContext) -> HookResult {
        for handler in &self.handlers {
            handler.on_server_unloaded(context).await?;
        }
        Ok(())
    }

    pub async fn on_session_created(&self, context: &SessionContext) -> HookResult {
        for handler in &self.handlers {
            handler.on_session_created(context).await?;
        }
        Ok(())
    }

    pub async fn on_session_destroyed(&self, context: &SessionContext) -> HookResult {
        for handler in &self.handlers {
            handler.on_session_destroyed(context).await?;
        }
        Ok(())
    }
}

impl fmt::Debug for Application {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.handlers.iter().map(|h| h.name()).collect();
        f.debug_struct("Application").field("handlers", &names).finish()
    }
}
