//! Session pool
//!
//! Owns every upstream session, keyed by small integer ids. The primary
//! (id 0) is required for a valid start; additional bot sessions and the
//! optional power session (id 99, authenticated as a user) are best-effort.
//! Handlers never hold a session across an await without re-resolving it
//! here first; pool entries are replaced wholesale on restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tracing::{info, warn};

use crate::error::{GatewayError, Result};
use crate::ledger::Ledger;
use crate::upstream::{Backend, UpstreamError, UpstreamSession};
use crate::{SessionId, PRIMARY_SESSION_ID};

/// Bounded wait for a single session start or restart.
const SESSION_START_TIMEOUT: Duration = Duration::from_secs(20);

/// Gap between consecutive secondary session starts, to avoid synchronized
/// rate limiting.
const SECONDARY_START_STAGGER: Duration = Duration::from_secs(2);

/// Upstream credential for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    /// Bot-token authentication.
    BotToken(String),
    /// Long-lived user session (the power session's credential).
    UserSession(String),
}

impl Credential {
    /// Classify a raw configured token.
    ///
    /// Bot tokens always contain a `:` between the bot id and the secret;
    /// anything else is treated as a persisted user session.
    pub fn from_raw(raw: &str) -> Self {
        if raw.contains(':') {
            Credential::BotToken(raw.to_string())
        } else {
            Credential::UserSession(raw.to_string())
        }
    }
}

/// Static description of one configured session.
#[derive(Debug, Clone)]
pub struct SessionSpec {
    /// Pool id. `0` primary, `99` reserved for the power session.
    pub id: SessionId,
    /// Credential used to authenticate the connection.
    pub credential: Credential,
}

/// Creates connected backends from session specs.
///
/// The production connector signs in to MTProto; tests register in-memory
/// backends instead.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect and authenticate a backend for `spec`.
    async fn connect(&self, spec: &SessionSpec) -> std::result::Result<Arc<dyn Backend>, UpstreamError>;
}

/// The pool of live upstream sessions.
pub struct SessionPool {
    archive_chat: i64,
    specs: BTreeMap<SessionId, SessionSpec>,
    connector: Arc<dyn Connector>,
    sessions: RwLock<HashMap<SessionId, Arc<UpstreamSession>>>,
}

impl SessionPool {
    /// Build an empty pool over the configured specs.
    pub fn new(archive_chat: i64, specs: Vec<SessionSpec>, connector: Arc<dyn Connector>) -> Self {
        let specs = specs.into_iter().map(|s| (s.id, s)).collect();
        Self {
            archive_chat,
            specs,
            connector,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Start the primary session, then every configured secondary.
    ///
    /// Primary failure is fatal. Secondary starts are bounded, staggered at
    /// least two seconds apart, and individually swallowed; each success
    /// registers a zeroed work-load entry.
    pub async fn start(&self, ledger: &Ledger) -> Result<()> {
        let primary = self
            .specs
            .get(&PRIMARY_SESSION_ID)
            .ok_or_else(|| GatewayError::Config("no primary session configured".into()))?;

        let session = self
            .connect_one(primary)
            .await
            .map_err(|e| GatewayError::PrimaryStart(e.to_string()))?;
        info!(session = PRIMARY_SESSION_ID, "primary session online");
        self.install(session);
        ledger.register(PRIMARY_SESSION_ID);

        let secondaries: Vec<&SessionSpec> = self
            .specs
            .values()
            .filter(|s| s.id != PRIMARY_SESSION_ID)
            .collect();

        let starts = secondaries.iter().enumerate().map(|(idx, spec)| async move {
            tokio::time::sleep(SECONDARY_START_STAGGER * idx as u32).await;
            match self.connect_one(spec).await {
                Ok(session) => Some(session),
                Err(e) => {
                    warn!(session = spec.id, error = %e, "secondary session failed to start");
                    None
                }
            }
        });

        for session in join_all(starts).await.into_iter().flatten() {
            let id = session.id();
            info!(session = id, "secondary session online");
            self.install(session);
            ledger.register(id);
        }
        Ok(())
    }

    async fn connect_one(
        &self,
        spec: &SessionSpec,
    ) -> std::result::Result<Arc<UpstreamSession>, UpstreamError> {
        let backend = tokio::time::timeout(SESSION_START_TIMEOUT, self.connector.connect(spec))
            .await
            .map_err(|_| UpstreamError::Timeout)??;
        Ok(Arc::new(UpstreamSession::new(
            spec.id,
            self.archive_chat,
            backend,
        )))
    }

    /// Re-connect one configured session, replacing the pool entry only on
    /// success. The old entry stays in place on failure, so a flapping
    /// primary degrades instead of disappearing.
    pub async fn restart(&self, id: SessionId) -> std::result::Result<(), UpstreamError> {
        let spec = self
            .specs
            .get(&id)
            .cloned()
            .ok_or_else(|| UpstreamError::Transport(format!("unknown session {id}")))?;
        let session = self.connect_one(&spec).await?;
        self.install(session);
        Ok(())
    }

    fn install(&self, session: Arc<UpstreamSession>) {
        self.sessions
            .write()
            .unwrap()
            .insert(session.id(), session);
    }

    /// Current binding for `id`. Callers re-read on every use; entries may
    /// be replaced by restart at any await point.
    pub fn get(&self, id: SessionId) -> Option<Arc<UpstreamSession>> {
        self.sessions.read().unwrap().get(&id).cloned()
    }

    /// Like [`SessionPool::get`] but falling back to the primary when the
    /// requested session is mid-restart.
    pub fn get_or_primary(&self, id: SessionId) -> Option<Arc<UpstreamSession>> {
        let sessions = self.sessions.read().unwrap();
        match sessions.get(&id) {
            Some(session) => Some(session.clone()),
            None => {
                warn!(session = id, "session missing from pool, using primary");
                sessions.get(&PRIMARY_SESSION_ID).cloned()
            }
        }
    }

    /// Remove a session from the pool, returning the old binding.
    pub fn remove(&self, id: SessionId) -> Option<Arc<UpstreamSession>> {
        self.sessions.write().unwrap().remove(&id)
    }

    /// Whether any session besides the primary is live.
    pub fn has_secondaries(&self) -> bool {
        self.sessions
            .read()
            .unwrap()
            .keys()
            .any(|id| *id != PRIMARY_SESSION_ID)
    }

    /// Number of live sessions.
    pub fn active_count(&self) -> usize {
        self.sessions.read().unwrap().len()
    }

    /// Sorted snapshot of the live sessions.
    pub fn active(&self) -> Vec<(SessionId, Arc<UpstreamSession>)> {
        let mut entries: Vec<_> = self
            .sessions
            .read()
            .unwrap()
            .iter()
            .map(|(id, s)| (*id, s.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Ids of every configured session, in id order.
    pub fn spec_ids(&self) -> Vec<SessionId> {
        self.specs.keys().copied().collect()
    }

    /// Username of the primary account, for `/status`.
    pub fn primary_username(&self) -> Option<String> {
        self.get(PRIMARY_SESSION_ID).and_then(|s| s.username())
    }

    /// Stop every session, best effort.
    pub async fn shutdown(&self) {
        let sessions = self.active();
        for (id, session) in sessions {
            info!(session = id, "stopping session");
            session.stop().await;
        }
    }
}
