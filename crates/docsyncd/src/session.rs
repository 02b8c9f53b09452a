//! Server-side session: one [`Document`] shared by any number of connections.
//!
//! Every document access goes through the session lock. While a locked
//! operation runs, the document's change events pile up in a channel; when the
//! operation finishes they are drained, turned into outbound PATCH-DOC writes
//! and flushed before the lock is released. Patches are never echoed to the
//! connection that caused them.
//!
//! Lifecycle: `Created -> Active -> Destroyed`. Destruction is one-way and
//! every later operation is a logged no-op.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use docsync_core::{
    CallbackKind, CallbackSchedule, ConnectionId, Document, DocumentEvent, DocumentPatchedEvent,
    DomainError, PatchEvent, SessionCallback, SessionDestroyedCallback, SessionId, UiEvent,
};
use docsync_protocol::{Message, PatchDoc, ProtocolError, PushDoc};

use crate::callbacks::{Callback, CallbackError, CallbackGroup, CallbackOutcome};
use crate::connection::{ConnectionHandle, ServerConnection};

/// Errors raised by session operations.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Document(#[from] DomainError),

    #[error("unblock_expiration() called without a matching block_expiration()")]
    MismatchedExpirationBlock,

    #[error("session {session_id} still has {count} open connections")]
    OpenConnections { session_id: SessionId, count: usize },

    #[error("creation of session {0} was aborted")]
    CreationAborted(SessionId),

    #[error("connection is not attached to a session")]
    Detached,

    #[error("session {0} is destroyed")]
    Destroyed(SessionId),
}

/// Tunables applied to every session of an application.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    /// Locked operations slower than this are logged at warn level.
    pub slow_operation_warning: Duration,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            slow_operation_warning: Duration::from_millis(100),
        }
    }
}

/// State guarded by the session lock.
pub(crate) struct SessionState {
    /// None once the session is destroyed.
    document: Option<Document>,
    changes: mpsc::UnboundedReceiver<DocumentEvent>,
}

impl SessionState {
    fn document_mut(&mut self) -> Option<&mut Document> {
        self.document.as_mut()
    }
}

type PendingWrites = Vec<(ConnectionHandle, Vec<PatchEvent>)>;

/// A document and the connections subscribed to it.
pub struct ServerSession {
    id: SessionId,
    state: tokio::sync::Mutex<SessionState>,
    subscribed: Mutex<HashMap<ConnectionId, ConnectionHandle>>,
    last_unsubscribe: Mutex<Instant>,
    expiration_blocked: Mutex<usize>,
    expiration_requested: AtomicBool,
    destroyed: AtomicBool,
    callbacks: CallbackGroup,
    settings: SessionSettings,
    weak_self: Weak<ServerSession>,
}

/// Holds one expiration block for the lifetime of the guard.
struct ExpirationBlock<'a> {
    session: &'a ServerSession,
}

impl<'a> ExpirationBlock<'a> {
    fn new(session: &'a ServerSession) -> Self {
        session.block_expiration();
        Self { session }
    }
}

impl Drop for ExpirationBlock<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.session.unblock_expiration() {
            warn!(session_id = %self.session.id, error = %e, "Expiration block released twice");
        }
    }
}

impl ServerSession {
    /// Takes ownership of `document` and starts dispatching its changes.
    ///
    /// Session callbacks already registered on the document are scheduled
    /// right away on `runtime`.
    pub fn new(
        id: SessionId,
        mut document: Document,
        runtime: Handle,
        settings: SessionSettings,
    ) -> Result<Arc<Self>, SessionError> {
        if id.is_empty() {
            return Err(ProtocolError::EmptySessionId.into());
        }

        let (tx, rx) = mpsc::unbounded_channel();
        document.on_change_dispatch_to(tx);
        let existing: Vec<SessionCallback> = document.session_callbacks().to_vec();

        let session = Arc::new_cyclic(|weak_self| Self {
            id,
            state: tokio::sync::Mutex::new(SessionState {
                document: Some(document),
                changes: rx,
            }),
            subscribed: Mutex::new(HashMap::new()),
            last_unsubscribe: Mutex::new(Instant::now()),
            expiration_blocked: Mutex::new(0),
            expiration_requested: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            callbacks: CallbackGroup::new(runtime),
            settings,
            weak_self: weak_self.clone(),
        });

        for entry in &existing {
            session.schedule(entry);
        }
        debug!(
            session_id = %session.id,
            callbacks = existing.len(),
            "Session constructed"
        );
        Ok(session)
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Adds `connection` to the broadcast set.
    ///
    /// Fails once the session is destroyed. Checked under the same lock that
    /// destruction takes, so a subscribed connection always keeps the session
    /// alive against discard.
    pub fn subscribe(&self, connection: ConnectionHandle) -> Result<(), SessionError> {
        let count = {
            let mut subscribed = self.subscribed.lock();
            if self.is_destroyed() {
                return Err(SessionError::Destroyed(self.id.clone()));
            }
            subscribed.insert(connection.id(), connection);
            subscribed.len()
        };
        debug!(session_id = %self.id, connections = count, "Connection subscribed");
        Ok(())
    }

    pub fn unsubscribe(&self, connection: ConnectionId) {
        let removed = self.subscribed.lock().remove(&connection).is_some();
        *self.last_unsubscribe.lock() = Instant::now();
        if removed {
            debug!(session_id = %self.id, %connection, "Connection unsubscribed");
        }
    }

    pub fn connection_count(&self) -> usize {
        self.subscribed.lock().len()
    }

    /// Time since a connection last unsubscribed (or since construction).
    pub fn since_last_unsubscribe(&self) -> Duration {
        self.last_unsubscribe.lock().elapsed()
    }

    // ========================================================================
    // Expiration
    // ========================================================================

    /// Prevents the session from being discarded until the matching unblock.
    pub fn block_expiration(&self) {
        *self.expiration_blocked.lock() += 1;
    }

    pub fn unblock_expiration(&self) -> Result<(), SessionError> {
        let mut count = self.expiration_blocked.lock();
        if *count == 0 {
            return Err(SessionError::MismatchedExpirationBlock);
        }
        *count -= 1;
        Ok(())
    }

    pub fn expiration_blocked(&self) -> bool {
        self.expiration_blocked_count() > 0
    }

    pub fn expiration_blocked_count(&self) -> usize {
        *self.expiration_blocked.lock()
    }

    /// Marks the session for discard on the next cleanup pass, regardless of
    /// how recently a connection left.
    pub fn request_expiration(&self) {
        self.expiration_requested.store(true, Ordering::SeqCst);
    }

    pub fn expiration_requested(&self) -> bool {
        self.expiration_requested.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Locking
    // ========================================================================

    /// Runs `f` against the document while holding the session lock.
    ///
    /// Returns None without waiting if the session is destroyed. Patches
    /// produced by `f` are sent before this returns.
    pub async fn with_document_locked<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut Document) -> T + Send,
        T: Send,
    {
        self.locked(|state| state.document_mut().map(f))
            .await
            .flatten()
    }

    pub(crate) async fn locked<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut SessionState) -> T + Send,
        T: Send,
    {
        if self.is_destroyed() {
            debug!(session_id = %self.id, "Ignoring locked operation on destroyed session");
            return None;
        }

        let _block = ExpirationBlock::new(self);
        let mut state = self.state.lock().await;
        if self.is_destroyed() {
            debug!(session_id = %self.id, "Session destroyed while waiting for the lock");
            return None;
        }

        let started = Instant::now();
        let result = f(&mut state);
        let writes = self.collect_pending_writes(&mut state);

        let elapsed = started.elapsed();
        if elapsed > self.settings.slow_operation_warning {
            warn!(
                session_id = %self.id,
                elapsed_ms = elapsed.as_millis() as u64,
                "Slow locked document operation"
            );
        }

        self.flush_pending_writes(writes).await;
        drop(state);
        Some(result)
    }

    fn collect_pending_writes(&self, state: &mut SessionState) -> PendingWrites {
        let mut patches: Vec<DocumentPatchedEvent> = Vec::new();
        while let Ok(event) = state.changes.try_recv() {
            match event {
                DocumentEvent::Patched(patched) => patches.push(patched),
                DocumentEvent::SessionCallbackAdded(entry) => self.schedule(&entry),
                DocumentEvent::SessionCallbackRemoved { id, kind } => {
                    if let Err(e) = self.callbacks.remove(kind, id) {
                        debug!(session_id = %self.id, error = %e, "Session callback not scheduled");
                    }
                }
            }
        }
        if patches.is_empty() {
            return Vec::new();
        }

        let subscribers: Vec<ConnectionHandle> = self.subscribed.lock().values().cloned().collect();
        subscribers
            .into_iter()
            .filter_map(|connection| {
                let events: Vec<PatchEvent> = patches
                    .iter()
                    .filter(|p| p.setter != Some(connection.id()))
                    .map(|p| p.patch.clone())
                    .collect();
                (!events.is_empty()).then_some((connection, events))
            })
            .collect()
    }

    async fn flush_pending_writes(&self, writes: PendingWrites) {
        for (connection, events) in writes {
            if let Err(e) = connection.send_patch_document(events).await {
                warn!(
                    session_id = %self.id,
                    connection = %connection.id(),
                    error = %e,
                    "Failed sending patch"
                );
            }
        }
    }

    // ========================================================================
    // Session Callbacks
    // ========================================================================

    fn schedule(&self, entry: &SessionCallback) {
        let callback = self.wrap_document_callback(entry);
        match entry.schedule {
            CallbackSchedule::NextTick => {
                self.callbacks.add_next_tick_callback_with_id(entry.id, callback);
            }
            CallbackSchedule::Timeout(delay) => {
                self.callbacks
                    .add_timeout_callback_with_id(entry.id, callback, delay);
            }
            CallbackSchedule::Periodic(period) => {
                self.callbacks
                    .add_periodic_callback_with_id(entry.id, callback, period);
            }
        }
    }

    /// Runs a document callback under the session lock.
    fn wrap_document_callback(&self, entry: &SessionCallback) -> Callback {
        let weak = self.weak_self.clone();
        let id = entry.id;
        let one_shot = entry.kind() != CallbackKind::Periodic;
        let document_callback = Arc::clone(&entry.callback);

        Arc::new(move || {
            let weak = weak.clone();
            let document_callback = Arc::clone(&document_callback);
            CallbackOutcome::pending(async move {
                let Some(session) = weak.upgrade() else {
                    return Ok(());
                };
                session
                    .locked(|state| {
                        let Some(document) = state.document_mut() else {
                            return Ok(());
                        };
                        if one_shot {
                            document.forget_session_callback(id);
                        }
                        document_callback(document).map_err(CallbackError::from)
                    })
                    .await
                    .unwrap_or(Ok(()))
            })
        })
    }

    /// Outstanding scheduled callbacks.
    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    // ========================================================================
    // Destruction
    // ========================================================================

    /// Tears the session down. Must be called with the lock held.
    ///
    /// Returns the document's `session_destroyed` callbacks, to be run once
    /// the lock is released.
    pub(crate) fn destroy_locked(&self, state: &mut SessionState) -> Vec<SessionDestroyedCallback> {
        let first = {
            let _subscribed = self.subscribed.lock();
            !self.destroyed.swap(true, Ordering::SeqCst)
        };
        if !first {
            return Vec::new();
        }
        self.tear_down(state)
    }

    /// Like [`Self::destroy_locked`], but only while no connection is
    /// subscribed. Returns None and leaves the session alive otherwise.
    pub(crate) fn discard_locked(
        &self,
        state: &mut SessionState,
    ) -> Option<Vec<SessionDestroyedCallback>> {
        {
            let subscribed = self.subscribed.lock();
            if !subscribed.is_empty() || self.destroyed.swap(true, Ordering::SeqCst) {
                return None;
            }
        }
        Some(self.tear_down(state))
    }

    fn tear_down(&self, state: &mut SessionState) -> Vec<SessionDestroyedCallback> {
        self.callbacks.remove_all_callbacks();
        let destroyed_callbacks = match state.document.take() {
            Some(mut document) => document.destroy(&self.id),
            None => Vec::new(),
        };
        while state.changes.try_recv().is_ok() {}
        info!(session_id = %self.id, "Session destroyed");
        destroyed_callbacks
    }

    /// Destroys the session. Later calls do nothing.
    pub async fn destroy(&self) {
        let callbacks = self
            .locked(|state| self.destroy_locked(state))
            .await
            .unwrap_or_default();
        run_destroyed_callbacks(&self.id, callbacks);
    }

    // ========================================================================
    // Message Handlers
    // ========================================================================

    /// PULL-DOC-REQ: replies with the full document.
    pub async fn pull(
        &self,
        message: &Message,
        connection: &ServerConnection,
    ) -> Result<Option<Message>, SessionError> {
        let snapshot = self.with_document_locked(|document| document.to_json()).await;
        Ok(snapshot.map(|doc| {
            Message::pull_doc_reply(connection.handle().next_message_id(), message.msgid(), doc)
        }))
    }

    /// PUSH-DOC: replaces the document with the pushed snapshot.
    pub async fn push(
        &self,
        message: &Message,
        connection: &ServerConnection,
    ) -> Result<Option<Message>, SessionError> {
        let content: PushDoc = message.content_as()?;
        let setter = connection.id();
        let applied = self
            .with_document_locked(move |document| {
                document.replace_with_json(content.doc, Some(setter))
            })
            .await;
        self.reply_ok(applied, message, connection)
    }

    /// PATCH-DOC: applies the patch on behalf of `connection`, which is then
    /// excluded from the resulting broadcast.
    pub async fn patch(
        &self,
        message: &Message,
        connection: &ServerConnection,
    ) -> Result<Option<Message>, SessionError> {
        let content: PatchDoc = message.content_as()?;
        let setter = connection.id();
        let applied = self
            .with_document_locked(move |document| {
                document.apply_patch(&content.events, Some(setter))
            })
            .await;
        self.reply_ok(applied, message, connection)
    }

    /// EVENT: dispatches a UI event to the document's handlers.
    pub async fn event(
        &self,
        message: &Message,
        connection: &ServerConnection,
    ) -> Result<Option<Message>, SessionError> {
        let event: UiEvent = message.content_as()?;
        let applied = self
            .with_document_locked(move |document| document.apply_event(&event))
            .await;
        self.reply_ok(applied, message, connection)
    }

    fn reply_ok(
        &self,
        applied: Option<Result<(), DomainError>>,
        message: &Message,
        connection: &ServerConnection,
    ) -> Result<Option<Message>, SessionError> {
        match applied {
            Some(result) => {
                result?;
                Ok(Some(connection.ok(message)))
            }
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for ServerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerSession")
            .field("id", &self.id)
            .field("connections", &self.connection_count())
            .field("destroyed", &self.is_destroyed())
            .finish_non_exhaustive()
    }
}

pub(crate) fn run_destroyed_callbacks(id: &SessionId, callbacks: Vec<SessionDestroyedCallback>) {
    for callback in callbacks {
        callback(id);
    }
}
