//! Session Registry: session id -> running supervisor.

use crate::policy::SessionPolicy;
use crate::supervisor::{Collaborators, SessionHandle, Supervisor};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};
use uuid::Uuid;
use zap_core::{
    error::ZapError,
    message::IncomingMessage,
    traits::{CredentialStore, EventJournal, NoopJournal, TransportFactory},
};

/// Registry state shared with supervisors (they hold it weakly).
pub(crate) struct RegistryInner {
    sessions: RwLock<HashMap<String, SessionHandle>>,
    deps: Collaborators,
}

impl RegistryInner {
    /// Remove `session_id` if it still belongs to the supervisor `generation`.
    ///
    /// A supervisor that ended after its id was re-registered must not
    /// remove its successor.
    pub(crate) async fn deregister(&self, session_id: &str, generation: Uuid) {
        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session_id)
            .is_some_and(|h| h.generation() == generation)
        {
            sessions.remove(session_id);
            info!("session {session_id} removed from registry");
        }
    }
}

/// Maps session ids to their supervisors. At most one supervisor per id.
///
/// Cloning is cheap; clones share the same table.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Create a registry whose supervisors use the given transport factory
    /// and credential store.
    pub fn new(
        factory: Arc<dyn TransportFactory>,
        store: Arc<dyn CredentialStore>,
        policy: SessionPolicy,
    ) -> Self {
        Self::with_journal(factory, store, Arc::new(NoopJournal), policy)
    }

    /// Like [`Registry::new`], also recording session activity to `journal`.
    pub fn with_journal(
        factory: Arc<dyn TransportFactory>,
        store: Arc<dyn CredentialStore>,
        journal: Arc<dyn EventJournal>,
        policy: SessionPolicy,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: RwLock::new(HashMap::new()),
                deps: Collaborators {
                    factory,
                    store,
                    journal,
                    policy,
                },
            }),
        }
    }

    /// Register and start a supervisor for `session_id`.
    ///
    /// Resolves once stored credentials are loaded and the first transport
    /// is open (the connection itself may still be pairing). On
    /// [`ZapError::Initialization`] nothing stays registered, so the call can
    /// be retried.
    pub async fn initialize(&self, session_id: &str) -> Result<SessionHandle, ZapError> {
        if session_id.trim().is_empty() {
            return Err(ZapError::Initialization("session id must not be empty".into()));
        }

        let (handle, supervisor) = {
            let mut sessions = self.inner.sessions.write().await;
            if sessions.contains_key(session_id) {
                return Err(ZapError::AlreadyExists(session_id.to_string()));
            }
            let (handle, supervisor) = Supervisor::new(
                session_id,
                self.inner.deps.clone(),
                Arc::downgrade(&self.inner),
            );
            sessions.insert(session_id.to_string(), handle.clone());
            (handle, supervisor)
        };

        let (ready_tx, ready_rx) = oneshot::channel();
        tokio::spawn(supervisor.run(ready_tx));

        match ready_rx.await {
            Ok(Ok(())) => {
                info!("session {session_id} initialized");
                Ok(handle)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                self.inner
                    .deregister(session_id, handle.generation())
                    .await;
                Err(ZapError::Initialization(format!(
                    "supervisor for '{session_id}' exited during startup"
                )))
            }
        }
    }

    /// Look up a running supervisor.
    pub async fn get(&self, session_id: &str) -> Option<SessionHandle> {
        self.inner.sessions.read().await.get(session_id).cloned()
    }

    /// Stop the supervisor of `session_id` (keeping its credentials) and
    /// deregister it. No-op if absent.
    ///
    /// The id stays registered until the supervisor has stopped, so a
    /// concurrent `initialize` gets `AlreadyExists` rather than a second
    /// supervisor.
    pub async fn remove(&self, session_id: &str) {
        let Some(handle) = self.get(session_id).await else {
            return;
        };
        if let Err(e) = handle.shutdown().await {
            debug!("session {session_id} already stopped: {e}");
        }
        self.inner.deregister(session_id, handle.generation()).await;
    }

    pub async fn contains(&self, session_id: &str) -> bool {
        self.inner.sessions.read().await.contains_key(session_id)
    }

    /// Registered session ids, sorted.
    pub async fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn send_message(
        &self,
        session_id: &str,
        to: &str,
        text: &str,
    ) -> Result<String, ZapError> {
        let handle = self.handle(session_id).await?;
        handle.send_message(to, text).await.map_err(ended_as_not_found)
    }

    pub async fn logout(&self, session_id: &str) -> Result<(), ZapError> {
        let handle = self.handle(session_id).await?;
        handle.logout().await.map_err(ended_as_not_found)
    }

    pub async fn get_qr(&self, session_id: &str) -> Result<String, ZapError> {
        let handle = self.handle(session_id).await?;
        handle.qr().await.map_err(ended_as_not_found)
    }

    pub async fn get_messages(&self, session_id: &str) -> Result<Vec<IncomingMessage>, ZapError> {
        let handle = self.handle(session_id).await?;
        handle.messages().await.map_err(ended_as_not_found)
    }

    /// Stop every supervisor, keeping stored credentials.
    pub async fn shutdown(&self) {
        let handles: Vec<SessionHandle> = self
            .inner
            .sessions
            .write()
            .await
            .drain()
            .map(|(_, h)| h)
            .collect();

        for handle in handles {
            if let Err(e) = handle.shutdown().await {
                warn!("session {} already stopped: {e}", handle.session_id());
            }
        }
    }

    async fn handle(&self, session_id: &str) -> Result<SessionHandle, ZapError> {
        self.get(session_id)
            .await
            .ok_or_else(|| ZapError::NotFound(session_id.to_string()))
    }
}

/// A supervisor that ended between lookup and request has left the registry.
fn ended_as_not_found(e: ZapError) -> ZapError {
    match e {
        ZapError::SessionEnded(id) => ZapError::NotFound(id),
        other => other,
    }
}
