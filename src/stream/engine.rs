//! Streaming engine
//!
//! Drives the upstream chunk protocol for one HTTP response body. A
//! spawned task pumps chunks from the selected session through a bounded
//! channel into the response stream, trimming the fixed 1 MiB frames down
//! to the exact requested byte window.
//!
//! On an upstream error mid-stream the task classifies the failure into the
//! ledger (blind mark or blacklist), asks the router for a replacement
//! session, and resumes from the last forwarded offset. The per-request
//! [`LedgerGuard`] settles the work-load counters on every exit path,
//! including client disconnect.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, warn};

use crate::ledger::{Ledger, LedgerGuard, BLACKLIST_DEFAULT, BLIND_TTL};
use crate::pool::SessionPool;
use crate::router::select_session;
use crate::stream::range::{chunk_align, ByteRange};
use crate::upstream::UpstreamError;
use crate::{MessageId, SessionId, CHUNK_SIZE};

/// Frames buffered between the upstream pump and the HTTP writer.
const CHANNEL_DEPTH: usize = 8;

/// Pause before failing over after a visibility miss, to absorb upstream
/// propagation delay.
const PROPAGATION_PAUSE: Duration = Duration::from_secs(2);

/// Everything the engine needs to stream one byte window.
#[derive(Debug, Clone)]
pub struct StreamRequest {
    /// Message whose media is being streamed.
    pub message_id: MessageId,
    /// Resolved inclusive byte window.
    pub range: ByteRange,
    /// Session the router picked for the first attempt.
    pub initial_session: SessionId,
}

/// Build the response body for a streaming request.
///
/// The returned [`Body`] yields exactly `range.len()` bytes on success; on
/// an unrecoverable mid-stream failure the body errors out so the
/// connection closes early instead of lying about `Content-Length`.
pub fn body_for(
    pool: Arc<SessionPool>,
    ledger: Arc<Ledger>,
    request: StreamRequest,
    guard: LedgerGuard,
) -> Body {
    let (tx, rx) = mpsc::channel::<Result<Bytes, io::Error>>(CHANNEL_DEPTH);
    tokio::spawn(drive(pool, ledger, request, guard, tx));
    Body::from_stream(ReceiverStream::new(rx))
}

enum PumpOutcome {
    /// The full window was forwarded.
    Complete,
    /// The HTTP side hung up; stop silently.
    ClientGone,
}

async fn drive(
    pool: Arc<SessionPool>,
    ledger: Arc<Ledger>,
    request: StreamRequest,
    guard: LedgerGuard,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
) {
    let content_length = request.range.len();
    let mut bytes_sent: u64 = 0;
    let mut current = request.initial_session;
    let mut guard = guard;
    // One failover per live session at most; when the whole pool is
    // unhealthy the request fails instead of cycling forever.
    let max_recoveries = pool.active_count().max(1);
    let mut recoveries = 0usize;

    loop {
        match pump(
            &pool,
            &request,
            current,
            &tx,
            &mut bytes_sent,
            content_length,
        )
        .await
        {
            Ok(PumpOutcome::Complete) => {
                debug!(
                    message_id = request.message_id,
                    session = current,
                    bytes = bytes_sent,
                    "stream complete"
                );
                break;
            }
            Ok(PumpOutcome::ClientGone) => {
                debug!(
                    message_id = request.message_id,
                    session = current,
                    bytes = bytes_sent,
                    "client disconnected mid-stream"
                );
                break;
            }
            Err(cause) => {
                classify_failure(&ledger, &cause, request.message_id, current).await;
                recoveries += 1;
                if recoveries >= max_recoveries {
                    error!(
                        message_id = request.message_id,
                        session = current,
                        error = %cause,
                        "stream failed, recovery budget exhausted"
                    );
                    let _ = tx
                        .send(Err(io::Error::new(io::ErrorKind::Other, cause.to_string())))
                        .await;
                    break;
                }
                let next = select_session(&ledger, Some(request.message_id));
                if next == current {
                    error!(
                        message_id = request.message_id,
                        session = current,
                        error = %cause,
                        "no replacement session, surfacing stream error"
                    );
                    let _ = tx
                        .send(Err(io::Error::new(io::ErrorKind::Other, cause.to_string())))
                        .await;
                    break;
                }
                warn!(
                    message_id = request.message_id,
                    from = current,
                    to = next,
                    resume_at = request.range.start + bytes_sent,
                    "failing over mid-stream"
                );
                current = next;
                guard.borrow(next);
            }
        }
    }

    // Settle the counters before the channel closes.
    drop(guard);
}

/// Stream as much of the remaining window as the session will give us.
async fn pump(
    pool: &SessionPool,
    request: &StreamRequest,
    session_id: SessionId,
    tx: &mpsc::Sender<Result<Bytes, io::Error>>,
    bytes_sent: &mut u64,
    content_length: u64,
) -> Result<PumpOutcome, UpstreamError> {
    // Resolved fresh on every attempt; the pool entry may have been
    // replaced by a restart since the last await.
    let session = pool
        .get_or_primary(session_id)
        .ok_or_else(|| UpstreamError::Transport("session pool is empty".into()))?;

    let offset = request.range.start + *bytes_sent;
    let plan = chunk_align(offset, content_length - *bytes_sent, CHUNK_SIZE);
    let message = session.get_message(request.message_id).await?;
    let mut chunks = session
        .stream_media(&message, plan.chunk_offset, plan.chunk_limit)
        .await?;

    let mut skip = plan.head_skip;
    while let Some(frame) = chunks.next().await {
        let mut chunk = frame?;

        if skip > 0 {
            if (chunk.len() as u64) <= skip {
                skip -= chunk.len() as u64;
                continue;
            }
            chunk = chunk.slice(skip as usize..);
            skip = 0;
        }

        let remaining = content_length - *bytes_sent;
        if (chunk.len() as u64) > remaining {
            chunk = chunk.slice(..remaining as usize);
        }

        if !chunk.is_empty() {
            let len = chunk.len() as u64;
            if tx.send(Ok(chunk)).await.is_err() {
                return Ok(PumpOutcome::ClientGone);
            }
            *bytes_sent += len;
        }

        if *bytes_sent >= content_length {
            return Ok(PumpOutcome::Complete);
        }
    }

    if *bytes_sent >= content_length {
        Ok(PumpOutcome::Complete)
    } else {
        // The +1 chunk overshoot makes a clean early end impossible; running
        // dry short of the window means the upstream lost the stream.
        Err(UpstreamError::Transport("upstream ended before window".into()))
    }
}

/// Record a mid-stream failure in the ledger.
async fn classify_failure(
    ledger: &Ledger,
    cause: &UpstreamError,
    message_id: MessageId,
    session: SessionId,
) {
    match cause {
        UpstreamError::NotYetVisible => {
            warn!(message_id, session, "session blind to message, marking");
            ledger.mark_blind(message_id, session, BLIND_TTL);
            tokio::time::sleep(PROPAGATION_PAUSE).await;
        }
        UpstreamError::RateLimited { wait } => {
            warn!(session, wait_secs = wait.as_secs(), "session rate limited, cooling off");
            ledger.ban(session, *wait);
        }
        UpstreamError::Timeout | UpstreamError::Transport(_) | UpstreamError::NotFound => {
            warn!(session, error = %cause, "session failed, cooling off");
            ledger.ban(session, BLACKLIST_DEFAULT);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Credential, SessionSpec};
    use crate::upstream::memory::{MemoryBackend, MemoryConnector, MemoryStore};
    use crate::upstream::{MediaInfo, MediaKind};
    use std::collections::HashMap;

    const MIB: usize = 1024 * 1024;

    fn patterned_payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    struct Fixture {
        pool: Arc<SessionPool>,
        ledger: Arc<Ledger>,
        backends: HashMap<SessionId, Arc<MemoryBackend>>,
        payload: Vec<u8>,
    }

    async fn fixture(ids: &[SessionId], message_id: MessageId, len: usize) -> Fixture {
        let payload = patterned_payload(len);
        let mut store = MemoryStore::new();
        store.put_media(
            message_id,
            MediaInfo {
                kind: MediaKind::Video,
                file_size: len as u64,
                file_name: Some("clip.mp4".into()),
                mime_type: Some("video/mp4".into()),
                unique_id: "uq".into(),
            },
            payload.clone(),
        );
        let store = Arc::new(store);
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
        let pool = Arc::new(SessionPool::new(-100, specs, connector));
        let ledger = Arc::new(Ledger::new());
        pool.start(&ledger).await.unwrap();
        Fixture {
            pool,
            ledger,
            backends,
            payload,
        }
    }

    async fn collect(fix: &Fixture, message_id: MessageId, range: ByteRange, initial: SessionId) -> Vec<u8> {
        let mut guard = LedgerGuard::new(fix.ledger.clone());
        guard.borrow(initial);
        let body = body_for(
            fix.pool.clone(),
            fix.ledger.clone(),
            StreamRequest {
                message_id,
                range,
                initial_session: initial,
            },
            guard,
        );
        axum::body::to_bytes(body, usize::MAX).await.unwrap().to_vec()
    }

    async fn wait_for_settled(ledger: &Ledger, ids: &[SessionId]) {
        for _ in 0..100 {
            if ids.iter().all(|id| ledger.load_of(*id) == Some(0)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("work loads never settled: {:?}", ledger.snapshot());
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_window_with_head_skip() {
        let fix = fixture(&[0], 1, 3 * MIB).await;
        let start = MIB as u64 + 5;
        let body = collect(&fix, 1, ByteRange { start, end: start + 99 }, 0).await;
        assert_eq!(body, &fix.payload[start as usize..start as usize + 100]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_file_byte_identity() {
        let fix = fixture(&[0], 1, 2 * MIB + 777).await;
        let body = collect(
            &fix,
            1,
            ByteRange { start: 0, end: fix.payload.len() as u64 - 1 },
            0,
        )
        .await;
        assert_eq!(body, fix.payload);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_failover_is_byte_identical() {
        let fix = fixture(&[0, 1], 1, 8 * MIB).await;
        fix.backends[&1].fail_next_stream_after(3);

        let body = collect(
            &fix,
            1,
            ByteRange { start: 0, end: 8 * MIB as u64 - 1 },
            1,
        )
        .await;
        assert_eq!(body, fix.payload);

        // The failed session cooled off and both counters settled.
        assert!(fix.ledger.ban_expiry(1).is_some());
        wait_for_settled(&fix.ledger, &[0, 1]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_blind_session_fails_over_and_marks() {
        let fix = fixture(&[0, 1], 42, 2 * MIB).await;
        fix.backends[&1].set_invisible(42);

        let body = collect(
            &fix,
            42,
            ByteRange { start: 0, end: 2 * MIB as u64 - 1 },
            1,
        )
        .await;
        assert_eq!(body, fix.payload);
        assert!(fix
            .ledger
            .is_blind(42, 1, std::time::Instant::now()));
        wait_for_settled(&fix.ledger, &[0, 1]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limit_bans_for_advised_duration() {
        let fix = fixture(&[0, 1], 7, 2 * MIB).await;
        fix.backends[&1].flood_next_stream(Duration::from_secs(120));

        let body = collect(
            &fix,
            7,
            ByteRange { start: 0, end: 2 * MIB as u64 - 1 },
            1,
        )
        .await;
        assert_eq!(body, fix.payload);
        let expiry = fix.ledger.ban_expiry(1).expect("session banned");
        assert!(expiry > std::time::Instant::now() + Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_session_failure_surfaces_error() {
        let fix = fixture(&[0], 1, 4 * MIB).await;
        fix.backends[&0].fail_next_stream_after(1);

        let mut guard = LedgerGuard::new(fix.ledger.clone());
        guard.borrow(0);
        let body = body_for(
            fix.pool.clone(),
            fix.ledger.clone(),
            StreamRequest {
                message_id: 1,
                range: ByteRange { start: 0, end: 4 * MIB as u64 - 1 },
                initial_session: 0,
            },
            guard,
        );
        // Body errors out rather than under-delivering silently.
        assert!(axum::body::to_bytes(body, usize::MAX).await.is_err());
        wait_for_settled(&fix.ledger, &[0]).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_disconnect_settles_counters() {
        let fix = fixture(&[0], 1, 32 * MIB).await;
        let mut guard = LedgerGuard::new(fix.ledger.clone());
        guard.borrow(0);
        let body = body_for(
            fix.pool.clone(),
            fix.ledger.clone(),
            StreamRequest {
                message_id: 1,
                range: ByteRange { start: 0, end: 32 * MIB as u64 - 1 },
                initial_session: 0,
            },
            guard,
        );
        assert_eq!(fix.ledger.load_of(0), Some(1));

        let mut stream = body.into_data_stream();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.is_empty());
        drop(stream);

        wait_for_settled(&fix.ledger, &[0]).await;
    }
}
