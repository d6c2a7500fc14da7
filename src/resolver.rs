//! Metadata resolver
//!
//! Maps a message id to its [`FileDescriptor`] with a size-capped cache and
//! single-flight deduplication: concurrent lookups for the same id share one
//! upstream fetch, and the pending entry survives a few seconds past
//! completion so a failed fetch can be retried instead of negative-cached.
//!
//! Fetch order prefers the power session (it never suffers the per-message
//! propagation delay), then the primary, then the session the router already
//! picked for the request at hand.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use moka::sync::Cache;
use thiserror::Error;
use tracing::{debug, info};

use crate::error::{GatewayError, Result};
use crate::pool::SessionPool;
use crate::upstream::FileDescriptor;
use crate::{MessageId, SessionId, POWER_SESSION_ID, PRIMARY_SESSION_ID};

/// Maximum number of cached descriptors (LRU beyond this).
const DESCRIPTOR_CACHE_CAP: u64 = 10_000;

/// How long a completed single-flight entry lingers before removal.
const PENDING_GRACE: Duration = Duration::from_secs(5);

/// Deadline for the power and primary metadata attempts.
const PREFERRED_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for the router-selected last-resort attempt.
const ROUTED_FETCH_TIMEOUT: Duration = Duration::from_secs(8);

/// Clonable failure carried by shared fetch futures.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
struct FetchError(String);

type FetchFuture = Shared<BoxFuture<'static, std::result::Result<FileDescriptor, FetchError>>>;

/// The descriptor cache plus the in-flight fetch table.
pub struct Resolver {
    cache: Cache<MessageId, FileDescriptor>,
    pending: Arc<Mutex<HashMap<MessageId, FetchFuture>>>,
    pool: Arc<SessionPool>,
}

impl Resolver {
    /// Resolver over the given pool.
    pub fn new(pool: Arc<SessionPool>) -> Self {
        Self {
            cache: Cache::builder().max_capacity(DESCRIPTOR_CACHE_CAP).build(),
            pending: Arc::new(Mutex::new(HashMap::new())),
            pool,
        }
    }

    /// Resolve the descriptor for `message_id`.
    ///
    /// Cache hit, then single-flight join, then a fresh upstream fetch.
    /// `routed` is the session the router already selected for this request;
    /// the fetch ladder uses it as its last resort after the power and
    /// primary sessions. Total failure surfaces as
    /// [`GatewayError::DescriptorNotFound`].
    pub async fn resolve(
        &self,
        message_id: MessageId,
        routed: SessionId,
    ) -> Result<FileDescriptor> {
        if let Some(descriptor) = self.cache.get(&message_id) {
            debug!(message_id, "descriptor cache hit");
            return Ok(descriptor);
        }

        let fetch = {
            let mut pending = self.pending.lock().unwrap();
            if let Some(existing) = pending.get(&message_id) {
                debug!(message_id, "joining in-flight descriptor fetch");
                existing.clone()
            } else {
                let fut = fetch_descriptor(
                    self.pool.clone(),
                    self.cache.clone(),
                    message_id,
                    routed,
                )
                .boxed()
                .shared();
                pending.insert(message_id, fut.clone());

                // Remove the entry a little after the fetch settles, so a
                // failure can retry while a success keeps hitting the cache.
                let reaper_fut = fut.clone();
                let reaper_pending = self.pending.clone();
                tokio::spawn(async move {
                    let _ = reaper_fut.await;
                    tokio::time::sleep(PENDING_GRACE).await;
                    reaper_pending.lock().unwrap().remove(&message_id);
                });

                fut
            }
        };

        fetch
            .await
            .map_err(|e| {
                debug!(message_id, error = %e, "descriptor fetch failed");
                GatewayError::DescriptorNotFound(message_id)
            })
    }

    /// Number of cached descriptors. Diagnostics only.
    pub fn cached_entries(&self) -> u64 {
        self.cache.entry_count()
    }
}

/// One upstream fetch attempt ladder: power session, primary, routed pick.
async fn fetch_descriptor(
    pool: Arc<SessionPool>,
    cache: Cache<MessageId, FileDescriptor>,
    message_id: MessageId,
    routed: SessionId,
) -> std::result::Result<FileDescriptor, FetchError> {
    let mut attempts: Vec<(SessionId, Duration)> = Vec::new();
    if pool.get(POWER_SESSION_ID).is_some() {
        attempts.push((POWER_SESSION_ID, PREFERRED_FETCH_TIMEOUT));
    }
    attempts.push((PRIMARY_SESSION_ID, PREFERRED_FETCH_TIMEOUT));
    if !attempts.iter().any(|(id, _)| *id == routed) {
        attempts.push((routed, ROUTED_FETCH_TIMEOUT));
    }

    for (session_id, deadline) in attempts {
        let Some(session) = pool.get(session_id) else {
            continue;
        };
        let message = match tokio::time::timeout(deadline, session.get_message(message_id)).await
        {
            Ok(Ok(message)) => message,
            Ok(Err(e)) => {
                debug!(session = session_id, message_id, error = %e, "metadata fetch failed");
                continue;
            }
            Err(_) => {
                debug!(session = session_id, message_id, "metadata fetch timed out");
                continue;
            }
        };

        let descriptor = session.describe(&message);
        if descriptor.file_size == 0 || descriptor.unique_id.is_empty() {
            debug!(session = session_id, message_id, "degenerate descriptor, trying next session");
            continue;
        }
        info!(message_id, size = descriptor.file_size, "descriptor cached");
        cache.insert(message_id, descriptor.clone());
        return Ok(descriptor);
    }

    Err(FetchError(format!(
        "no session could describe message {message_id}"
    )))
}
