//! Maintenance loop
//!
//! A background task keeping the pool warm, independent of any request:
//! every minute it restarts configured sessions that fell out of the pool
//! or lost their connection, probes the live ones, and sweeps expired
//! ledger entries. Probe failures remove the session so the next tick can
//! bring it back clean. The primary is the exception: it is restarted in place
//! and never removed.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::ledger::Ledger;
use crate::pool::SessionPool;
use crate::PRIMARY_SESSION_ID;

/// Time between maintenance passes.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// Deadline for the per-session liveness probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Spawn the maintenance loop. Aborted on shutdown via the returned handle.
pub fn spawn(pool: Arc<SessionPool>, ledger: Arc<Ledger>) -> JoinHandle<()> {
    spawn_with_interval(pool, ledger, MAINTENANCE_INTERVAL)
}

/// Like [`spawn`] with a custom interval. Tests tighten the cadence.
pub fn spawn_with_interval(
    pool: Arc<SessionPool>,
    ledger: Arc<Ledger>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so startup state settles.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tick(&pool, &ledger).await;
        }
    })
}

/// One maintenance pass: restart, probe, sweep.
pub async fn tick(pool: &SessionPool, ledger: &Ledger) {
    revive_dead_sessions(pool, ledger).await;
    probe_live_sessions(pool).await;
    ledger.sweep_expired();
}

async fn revive_dead_sessions(pool: &SessionPool, ledger: &Ledger) {
    for id in pool.spec_ids() {
        let alive = pool.get(id).map(|s| s.is_connected()).unwrap_or(false);
        if alive {
            continue;
        }
        info!(session = id, "reconnecting session");
        match pool.restart(id).await {
            Ok(()) => {
                info!(session = id, "session back online");
                ledger.register(id);
            }
            Err(e) => {
                warn!(session = id, error = %e, "session reconnect failed");
            }
        }
    }
}

async fn probe_live_sessions(pool: &SessionPool) {
    for (id, session) in pool.active() {
        if !session.is_connected() {
            continue;
        }
        let probe = tokio::time::timeout(PROBE_TIMEOUT, session.probe()).await;
        match probe {
            Ok(Ok(())) => {
                debug!(session = id, "probe ok");
                continue;
            }
            Ok(Err(e)) => warn!(session = id, error = %e, "probe failed, recycling session"),
            Err(_) => warn!(session = id, "probe timed out, recycling session"),
        }
        session.stop().await;
        if id == PRIMARY_SESSION_ID {
            // Degrade rather than disappear: restart in place, keep the old
            // binding if the restart fails.
            if let Err(e) = pool.restart(id).await {
                warn!(session = id, error = %e, "primary restart failed");
            }
        } else {
            pool.remove(id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Credential, SessionSpec};
    use crate::upstream::memory::{MemoryBackend, MemoryConnector, MemoryStore};
    use std::collections::HashMap;
    use crate::SessionId;

    async fn fixture(
        ids: &[SessionId],
    ) -> (
        Arc<SessionPool>,
        Arc<Ledger>,
        Arc<MemoryConnector>,
        HashMap<SessionId, Arc<MemoryBackend>>,
    ) {
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(MemoryConnector::new());
        let mut backends = HashMap::new();
        let mut specs = Vec::new();
        for id in ids {
            let backend = Arc::new(MemoryBackend::new(store.clone()));
            connector.register(*id, backend.clone());
            backends.insert(*id, backend);
            specs.push(SessionSpec {
                id: *id,
                credential: Credential::BotToken(format!("{id}:x")),
            });
        }
        let pool = Arc::new(SessionPool::new(-100, specs, connector.clone()));
        let ledger = Arc::new(Ledger::new());
        pool.start(&ledger).await.unwrap();
        (pool, ledger, connector, backends)
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_revives_disconnected_session() {
        let (pool, ledger, _, backends) = fixture(&[0, 1]).await;
        backends[&1].set_connected(false);

        tick(&pool, &ledger).await;
        assert!(pool.get(1).unwrap().is_connected());
        assert_eq!(ledger.load_of(1), Some(0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_failure_removes_secondary() {
        let (pool, ledger, _connector, backends) = fixture(&[0, 1]).await;
        backends[&1].set_probe_failing(true);

        tick(&pool, &ledger).await;
        assert!(pool.get(1).is_none());

        // Next tick, with the probe healthy again, the session comes back.
        backends[&1].set_probe_failing(false);
        tick(&pool, &ledger).await;
        assert!(pool.get(1).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_primary_probe_failure_keeps_entry() {
        let (pool, ledger, connector, backends) = fixture(&[0]).await;
        backends[&0].set_probe_failing(true);
        connector.set_refused(0, true);

        tick(&pool, &ledger).await;
        // Restart failed, but the primary binding is still present.
        assert!(pool.get(0).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_sweeps_expired_entries() {
        let (pool, ledger, _, _) = fixture(&[0]).await;
        ledger.ban(7, Duration::from_secs(0));
        std::thread::sleep(Duration::from_millis(5));
        tick(&pool, &ledger).await;
        assert!(ledger.ban_expiry(7).is_none());
    }
}
