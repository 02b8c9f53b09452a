//! Per-application session registry and the contexts handed to hooks.
//!
//! [`ApplicationContext`] is the single authority for session existence: at
//! most one [`ServerSession`] is ever constructed per id, even when several
//! connections ask for the same id concurrently. A creation in flight is
//! tracked as a pending entry whose outcome every concurrent caller shares.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use docsync_core::{CallbackId, Document, SessionId};
use docsync_protocol::{OpenRequest, ProtocolError};

use crate::application::Application;
use crate::callbacks::{Callback, CallbackError, CallbackGroup};
use crate::connection::{ConnectionHandle, ServerConnection};
use crate::session::{run_destroyed_callbacks, ServerSession, SessionError, SessionSettings};

/// Request argument carrying the session id; never exposed to applications.
pub const SESSION_ID_ARGUMENT: &str = "session-id";

/// Times a connection retries attaching when its session is destroyed underneath it.
const ATTACH_ATTEMPTS: u32 = 3;

// ============================================================================
// Session Request
// ============================================================================

/// Read-only view of the request that opened a session.
#[derive(Debug, Clone, Default)]
pub struct SessionRequest {
    arguments: HashMap<String, Vec<String>>,
    headers: HashMap<String, String>,
    cookies: HashMap<String, String>,
}

impl SessionRequest {
    pub fn new(
        mut arguments: HashMap<String, Vec<String>>,
        headers: HashMap<String, String>,
        cookies: HashMap<String, String>,
    ) -> Self {
        arguments.remove(SESSION_ID_ARGUMENT);
        Self {
            arguments,
            headers,
            cookies,
        }
    }

    pub fn from_open_request(request: &OpenRequest) -> Self {
        Self::new(
            request.arguments.clone(),
            request.headers.clone(),
            request.cookies.clone(),
        )
    }

    pub fn arguments(&self) -> &HashMap<String, Vec<String>> {
        &self.arguments
    }

    /// First value of a request argument.
    pub fn argument(&self, name: &str) -> Option<&str> {
        self.arguments
            .get(name)
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn cookies(&self) -> &HashMap<String, String> {
        &self.cookies
    }
}

// ============================================================================
// Session Context
// ============================================================================

/// What application hooks know about one session.
pub struct SessionContext {
    id: SessionId,
    server_context: ServerContext,
    request: SessionRequest,
    /// None while the session is still being created.
    session: Mutex<Option<Weak<ServerSession>>>,
    created_at: DateTime<Utc>,
}

impl SessionContext {
    pub fn new(id: SessionId, server_context: ServerContext, request: SessionRequest) -> Self {
        Self {
            id,
            server_context,
            request,
            session: Mutex::new(None),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn server_context(&self) -> &ServerContext {
        &self.server_context
    }

    pub fn request(&self) -> &SessionRequest {
        &self.request
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub(crate) fn attach(&self, session: &Arc<ServerSession>) {
        *self.session.lock() = Some(Arc::downgrade(session));
    }

    /// True once the session has been destroyed. False while it is still
    /// being created.
    pub fn destroyed(&self) -> bool {
        match self.session.lock().as_ref() {
            Some(weak) => weak
                .upgrade()
                .map_or(true, |session| session.is_destroyed()),
            None => false,
        }
    }

    /// Runs `f` against the session's document under the session lock.
    ///
    /// Returns None if the session is not available.
    pub async fn with_locked_document<F, T>(&self, f: F) -> Option<T>
    where
        F: FnOnce(&mut Document) -> T + Send,
        T: Send,
    {
        let session = self.session.lock().as_ref().and_then(Weak::upgrade)?;
        session.with_document_locked(f).await
    }
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Server Context
// ============================================================================

/// What application hooks know about the server, plus server-wide callbacks.
#[derive(Clone)]
pub struct ServerContext {
    application_context: Weak<ApplicationContext>,
    callbacks: CallbackGroup,
}

impl ServerContext {
    fn new(application_context: Weak<ApplicationContext>, runtime: Handle) -> Self {
        Self {
            application_context,
            callbacks: CallbackGroup::new(runtime),
        }
    }

    /// Contexts of this application's sessions, including pending ones.
    pub fn sessions(&self) -> Vec<Arc<SessionContext>> {
        self.application_context
            .upgrade()
            .map(|app| app.session_contexts())
            .unwrap_or_default()
    }

    pub fn add_next_tick_callback(&self, callback: Callback) -> CallbackId {
        self.callbacks.add_next_tick_callback(callback)
    }

    pub fn add_timeout_callback(&self, callback: Callback, delay: Duration) -> CallbackId {
        self.callbacks.add_timeout_callback(callback, delay)
    }

    pub fn add_periodic_callback(&self, callback: Callback, period: Duration) -> CallbackId {
        self.callbacks.add_periodic_callback(callback, period)
    }

    pub fn remove_next_tick_callback(&self, id: CallbackId) -> Result<(), CallbackError> {
        self.callbacks.remove_next_tick_callback(id)
    }

    pub fn remove_timeout_callback(&self, id: CallbackId) -> Result<(), CallbackError> {
        self.callbacks.remove_timeout_callback(id)
    }

    pub fn remove_periodic_callback(&self, id: CallbackId) -> Result<(), CallbackError> {
        self.callbacks.remove_periodic_callback(id)
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    pub(crate) fn remove_all_callbacks(&self) {
        self.callbacks.remove_all_callbacks();
    }
}

// ============================================================================
// Application Context
// ============================================================================

type CreationResult = Result<Arc<ServerSession>, SessionError>;

#[derive(Default)]
struct SessionRegistry {
    sessions: HashMap<SessionId, Arc<ServerSession>>,
    pending: HashMap<SessionId, watch::Receiver<Option<CreationResult>>>,
    contexts: HashMap<SessionId, Arc<SessionContext>>,
}

enum Creation<'a> {
    Wait(watch::Receiver<Option<CreationResult>>),
    Start(PendingCreation<'a>),
}

/// Ownership of one in-flight creation.
///
/// Dropping it unresolved (the creating task was cancelled) publishes
/// `CreationAborted` to every waiter and forgets the id.
/// The session context is registered together with the pending entry, so
/// hooks see it before the session itself exists.
struct PendingCreation<'a> {
    registry: &'a Mutex<SessionRegistry>,
    id: SessionId,
    context: Arc<SessionContext>,
    outcome: watch::Sender<Option<CreationResult>>,
    resolved: bool,
}

impl PendingCreation<'_> {
    fn resolve(mut self, result: CreationResult) {
        {
            let mut registry = self.registry.lock();
            registry.pending.remove(&self.id);
            match &result {
                Ok(session) => {
                    registry.sessions.insert(self.id.clone(), Arc::clone(session));
                }
                Err(_) => self.forget_context(&mut registry),
            }
        }
        self.outcome.send_replace(Some(result));
        self.resolved = true;
    }

    fn forget_context(&self, registry: &mut SessionRegistry) {
        let ours = registry
            .contexts
            .get(&self.id)
            .is_some_and(|current| Arc::ptr_eq(current, &self.context));
        if ours {
            registry.contexts.remove(&self.id);
        }
    }
}

impl Drop for PendingCreation<'_> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        warn!(session_id = %self.id, "Session creation aborted");
        {
            let mut registry = self.registry.lock();
            registry.pending.remove(&self.id);
            self.forget_context(&mut registry);
        }
        self.outcome
            .send_replace(Some(Err(SessionError::CreationAborted(self.id.clone()))));
    }
}

/// Sessions of one application, served under one URL path.
pub struct ApplicationContext {
    application: Application,
    url: String,
    runtime: Handle,
    settings: SessionSettings,
    server_context: ServerContext,
    registry: Mutex<SessionRegistry>,
}

impl ApplicationContext {
    pub fn new(
        application: Application,
        url: impl Into<String>,
        runtime: Handle,
        settings: SessionSettings,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            application,
            url: url.into(),
            server_context: ServerContext::new(weak.clone(), runtime.clone()),
            runtime,
            settings,
            registry: Mutex::new(SessionRegistry::default()),
        })
    }

    pub fn application(&self) -> &Application {
        &self.application
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn server_context(&self) -> &ServerContext {
        &self.server_context
    }

    // ------------------------------------------------------------------------
    // Lifecycle hooks
    // ------------------------------------------------------------------------

    /// Runs the application's load hook. Failures are logged.
    pub async fn run_load_hook(&self) {
        if let Err(e) = self.application.on_server_loaded(&self.server_context).await {
            error!(app = %self.url, error = %e, "Error running load hook");
        }
    }

    /// Runs the application's unload hook and drops server callbacks.
    pub async fn run_unload_hook(&self) {
        if let Err(e) = self.application.on_server_unloaded(&self.server_context).await {
            error!(app = %self.url, error = %e, "Error running unload hook");
        }
        self.server_context.remove_all_callbacks();
    }

    // ------------------------------------------------------------------------
    // Session creation
    // ------------------------------------------------------------------------

    /// Returns the session for `id`, creating it if nobody has yet.
    ///
    /// Concurrent calls for the same id all receive the same session, or all
    /// observe the same failure.
    pub async fn create_session_if_needed(
        &self,
        id: SessionId,
        request: SessionRequest,
    ) -> CreationResult {
        if id.is_empty() {
            return Err(ProtocolError::EmptySessionId.into());
        }

        let creation = {
            let mut registry = self.registry.lock();
            if let Some(session) = registry.sessions.get(&id) {
                return Ok(Arc::clone(session));
            }
            match registry.pending.get(&id) {
                Some(outcome) => Creation::Wait(outcome.clone()),
                None => {
                    let (tx, rx) = watch::channel(None);
                    let context = Arc::new(SessionContext::new(
                        id.clone(),
                        self.server_context.clone(),
                        request,
                    ));
                    registry.pending.insert(id.clone(), rx);
                    registry.contexts.insert(id.clone(), Arc::clone(&context));
                    Creation::Start(PendingCreation {
                        registry: &self.registry,
                        id: id.clone(),
                        context,
                        outcome: tx,
                        resolved: false,
                    })
                }
            }
        };

        match creation {
            Creation::Wait(outcome) => {
                debug!(session_id = %id, "Waiting for pending session creation");
                wait_for_creation(id, outcome).await
            }
            Creation::Start(pending) => self.create_session(pending).await,
        }
    }

    async fn create_session(&self, pending: PendingCreation<'_>) -> CreationResult {
        let id = pending.id.clone();
        let context = Arc::clone(&pending.context);

        if let Err(e) = self.application.on_session_created(&context).await {
            error!(session_id = %id, error = %e, "Failed running session creation hooks");
        }

        let mut document = Document::new();
        self.application
            .initialize_document(&mut document, &context)
            .await;

        let result = ServerSession::new(id.clone(), document, self.runtime.clone(), self.settings);
        if let Ok(session) = &result {
            context.attach(session);
            info!(app = %self.url, session_id = %id, "Session created");
        }
        pending.resolve(result.clone());
        result
    }

    /// Subscribes `handle` to session `id`, creating the session if needed.
    ///
    /// A session destroyed between lookup and subscription is dropped from the
    /// registry and the attach is retried with a fresh session.
    pub async fn attach_connection(
        &self,
        id: SessionId,
        request: SessionRequest,
        handle: ConnectionHandle,
    ) -> Result<ServerConnection, SessionError> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let session = self
                .create_session_if_needed(id.clone(), request.clone())
                .await?;
            match ServerConnection::new(&session, handle.clone()) {
                Err(SessionError::Destroyed(_)) if attempts < ATTACH_ATTEMPTS => {
                    debug!(
                        session_id = %id,
                        attempts,
                        "Session destroyed before attach, retrying"
                    );
                    self.forget_session(&session);
                }
                result => return result,
            }
        }
    }

    // ------------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------------

    /// Returns a live session. Sessions still being created are not visible.
    pub fn get_session(&self, id: &SessionId) -> Result<Arc<ServerSession>, SessionError> {
        self.registry
            .lock()
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| ProtocolError::NoSuchSession(id.to_string()).into())
    }

    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        self.registry.lock().sessions.values().cloned().collect()
    }

    /// Includes sessions that are still being created.
    pub fn session_contexts(&self) -> Vec<Arc<SessionContext>> {
        self.registry.lock().contexts.values().cloned().collect()
    }

    pub fn session_count(&self) -> usize {
        self.registry.lock().sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.sessions().iter().map(|s| s.connection_count()).sum()
    }

    // ------------------------------------------------------------------------
    // Discard
    // ------------------------------------------------------------------------

    /// Destroys `session` if `should_discard` still holds once its lock is
    /// acquired.
    ///
    /// Returns `Ok(false)` when the session came back to life while waiting
    /// for the lock. Fails if the session has open connections.
    pub async fn discard_session<F>(
        &self,
        session: &Arc<ServerSession>,
        should_discard: F,
    ) -> Result<bool, SessionError>
    where
        F: FnOnce(&ServerSession) -> bool + Send,
    {
        let count = session.connection_count();
        if count > 0 {
            return Err(SessionError::OpenConnections {
                session_id: session.id().clone(),
                count,
            });
        }

        let outcome = session
            .locked(|state| {
                // The only block left must be the one held by this operation
                if !should_discard(session.as_ref()) || session.expiration_blocked_count() != 1 {
                    return None;
                }
                let callbacks = session.discard_locked(state)?;
                Some((callbacks, self.forget_session(session)))
            })
            .await;

        let (callbacks, context) = match outcome {
            Some(Some(discarded)) => discarded,
            Some(None) => {
                warn!(
                    session_id = %session.id(),
                    "Session came back to life after discard was scheduled"
                );
                return Ok(false);
            }
            None => {
                // Already destroyed elsewhere
                self.forget_session(session);
                return Ok(false);
            }
        };

        run_destroyed_callbacks(session.id(), callbacks);
        if let Some(context) = context {
            if let Err(e) = self.application.on_session_destroyed(&context).await {
                error!(
                    session_id = %session.id(),
                    error = %e,
                    "Failed running session destroyed hooks"
                );
            }
        }
        Ok(true)
    }

    /// Drops the registry entries of `session`, leaving a newer session
    /// registered under the same id untouched.
    fn forget_session(&self, session: &Arc<ServerSession>) -> Option<Arc<SessionContext>> {
        let mut registry = self.registry.lock();
        let registered = registry
            .sessions
            .get(session.id())
            .is_some_and(|current| Arc::ptr_eq(current, session));
        if !registered {
            return None;
        }
        registry.sessions.remove(session.id());
        registry.contexts.remove(session.id())
    }

    /// Discards every session idle for at least `unused_lifetime`, plus those
    /// that requested expiration.
    ///
    /// Returns how many sessions were discarded.
    pub async fn cleanup_sessions(&self, unused_lifetime: Duration) -> usize {
        let expired = move |session: &ServerSession| {
            session.connection_count() == 0
                && (session.expiration_requested()
                    || session.since_last_unsubscribe() >= unused_lifetime)
        };

        let candidates: Vec<Arc<ServerSession>> = self
            .sessions()
            .into_iter()
            .filter(|session| !session.expiration_blocked() && expired(session.as_ref()))
            .collect();

        let mut discarded = 0;
        for session in candidates {
            debug!(session_id = %session.id(), "Discarding unused session");
            match self.discard_session(&session, expired).await {
                Ok(true) => discarded += 1,
                Ok(false) => {}
                Err(e) => warn!(session_id = %session.id(), error = %e, "Session not discarded"),
            }
        }
        if discarded > 0 {
            info!(app = %self.url, discarded, "Discarded unused sessions");
        }
        discarded
    }
}

impl std::fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("url", &self.url)
            .field("sessions", &self.session_count())
            .finish_non_exhaustive()
    }
}

async fn wait_for_creation(
    id: SessionId,
    mut outcome: watch::Receiver<Option<CreationResult>>,
) -> CreationResult {
    let resolved = match outcome.wait_for(Option::is_some).await {
        Ok(value) => value.clone(),
        Err(_) => None,
    };
    resolved.unwrap_or(Err(SessionError::CreationAborted(id)))
}
