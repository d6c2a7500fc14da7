//! In-process upstream backend
//!
//! A deterministic [`Backend`] over an in-memory archive, with enough fault
//! injection to exercise every failover path in the range engine: per-message
//! blindness, one-shot stream failures, flood waits, and probe failures.
//! The unit and integration tests stream against this backend; it is also
//! handy for driving the gateway locally without upstream credentials.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use crate::pool::{Connector, SessionSpec};
use crate::upstream::{
    Backend, ChunkStream, MediaInfo, MediaMessage, UpstreamError,
};
use crate::{MessageId, SessionId, CHUNK_SIZE};

/// Immutable in-memory archive shared between backends.
///
/// Sharing one store across several [`MemoryBackend`]s models several
/// upstream accounts reading the same archive chat.
#[derive(Default)]
pub struct MemoryStore {
    files: HashMap<MessageId, StoredMedia>,
}

struct StoredMedia {
    info: MediaInfo,
    payload: Bytes,
}

impl MemoryStore {
    /// Create an empty archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a media message with explicit attributes.
    pub fn put_media(
        &mut self,
        message_id: MessageId,
        info: MediaInfo,
        payload: impl Into<Bytes>,
    ) {
        self.files.insert(
            message_id,
            StoredMedia {
                info,
                payload: payload.into(),
            },
        );
    }

    /// Payload bytes of a stored message, when present.
    pub fn payload(&self, message_id: MessageId) -> Option<Bytes> {
        self.files.get(&message_id).map(|m| m.payload.clone())
    }
}

#[derive(Default)]
struct Faults {
    /// Messages this account cannot observe (propagation delay simulation).
    invisible: HashSet<MessageId>,
    /// One-shot: the next opened stream fails with `Transport` after
    /// yielding this many chunks.
    fail_stream_after: Option<u64>,
    /// One-shot: the next stream open fails with `RateLimited`.
    flood_next_stream: Option<Duration>,
    /// Probe calls fail until cleared.
    probe_failing: bool,
    /// Pause between chunks, for disconnect and backpressure tests.
    chunk_delay: Option<Duration>,
}

/// Fault-injectable in-memory [`Backend`].
pub struct MemoryBackend {
    store: Arc<MemoryStore>,
    connected: AtomicBool,
    username: Option<String>,
    fetch_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    faults: Mutex<Faults>,
}

impl MemoryBackend {
    /// Backend over a shared archive, initially connected.
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            connected: AtomicBool::new(true),
            username: Some("streamgate_bot".to_string()),
            fetch_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            faults: Mutex::new(Faults::default()),
        }
    }

    /// Mark a message invisible to this account.
    pub fn set_invisible(&self, message_id: MessageId) {
        self.faults.lock().unwrap().invisible.insert(message_id);
    }

    /// Restore visibility of a message.
    pub fn clear_invisible(&self, message_id: MessageId) {
        self.faults.lock().unwrap().invisible.remove(&message_id);
    }

    /// Fail the next opened stream after `chunks` chunks (one-shot).
    pub fn fail_next_stream_after(&self, chunks: u64) {
        self.faults.lock().unwrap().fail_stream_after = Some(chunks);
    }

    /// Fail the next stream open with a flood wait (one-shot).
    pub fn flood_next_stream(&self, wait: Duration) {
        self.faults.lock().unwrap().flood_next_stream = Some(wait);
    }

    /// Make probe calls fail or succeed.
    pub fn set_probe_failing(&self, failing: bool) {
        self.faults.lock().unwrap().probe_failing = failing;
    }

    /// Throttle emitted chunks.
    pub fn set_chunk_delay(&self, delay: Duration) {
        self.faults.lock().unwrap().chunk_delay = Some(delay);
    }

    /// Flip the connection flag.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Number of `fetch_message` calls seen so far.
    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    /// Number of `open_stream` calls seen so far.
    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    fn check_visible(&self, message_id: MessageId) -> Result<(), UpstreamError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport("backend disconnected".into()));
        }
        if self.faults.lock().unwrap().invisible.contains(&message_id) {
            return Err(UpstreamError::NotYetVisible);
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn fetch_message(
        &self,
        chat: i64,
        message_id: MessageId,
    ) -> Result<MediaMessage, UpstreamError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.check_visible(message_id)?;
        let media = self
            .store
            .files
            .get(&message_id)
            .map(|m| m.info.clone())
            .ok_or(UpstreamError::NotFound)?;
        Ok(MediaMessage {
            chat,
            id: message_id,
            media,
        })
    }

    async fn open_stream(
        &self,
        message: &MediaMessage,
        chunk_offset: u64,
        chunk_limit: u64,
    ) -> Result<ChunkStream, UpstreamError> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.check_visible(message.id)?;

        let (fail_after, delay) = {
            let mut faults = self.faults.lock().unwrap();
            if let Some(wait) = faults.flood_next_stream.take() {
                return Err(UpstreamError::RateLimited { wait });
            }
            (faults.fail_stream_after.take(), faults.chunk_delay)
        };

        let payload = self
            .store
            .payload(message.id)
            .ok_or(UpstreamError::NotFound)?;

        let chunk = CHUNK_SIZE as usize;
        let mut frames: Vec<Result<Bytes, UpstreamError>> = Vec::new();
        let mut emitted = 0u64;
        let mut pos = (chunk_offset as usize).saturating_mul(chunk);
        while pos < payload.len() {
            if chunk_limit > 0 && emitted >= chunk_limit {
                break;
            }
            if let Some(limit) = fail_after {
                if emitted >= limit {
                    frames.push(Err(UpstreamError::Transport(
                        "injected stream failure".into(),
                    )));
                    break;
                }
            }
            let end = (pos + chunk).min(payload.len());
            frames.push(Ok(payload.slice(pos..end)));
            pos = end;
            emitted += 1;
        }
        // A fail-after larger than the emitted window still fires at the end.
        if let Some(limit) = fail_after {
            if emitted < limit && pos >= payload.len() {
                frames.push(Err(UpstreamError::Transport(
                    "injected stream failure".into(),
                )));
            }
        }

        let stream = futures::stream::iter(frames);
        match delay {
            Some(pause) => Ok(stream
                .then(move |frame| async move {
                    tokio::time::sleep(pause).await;
                    frame
                })
                .boxed()),
            None => Ok(stream.boxed()),
        }
    }

    async fn probe(&self) -> Result<(), UpstreamError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(UpstreamError::Transport("backend disconnected".into()));
        }
        if self.faults.lock().unwrap().probe_failing {
            return Err(UpstreamError::Timeout);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn username(&self) -> Option<String> {
        self.username.clone()
    }
}

/// [`Connector`] handing out pre-built memory backends by session id.
///
/// Connect attempts can be refused per id to exercise the pool's restart
/// path.
#[derive(Default)]
pub struct MemoryConnector {
    backends: Mutex<HashMap<SessionId, Arc<MemoryBackend>>>,
    refused: Mutex<HashSet<SessionId>>,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    /// Empty connector; register backends with [`MemoryConnector::register`].
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the backend `connect` will hand out for `id`.
    pub fn register(&self, id: SessionId, backend: Arc<MemoryBackend>) {
        self.backends.lock().unwrap().insert(id, backend);
    }

    /// Refuse or allow connect attempts for `id`.
    pub fn set_refused(&self, id: SessionId, refused: bool) {
        let mut set = self.refused.lock().unwrap();
        if refused {
            set.insert(id);
        } else {
            set.remove(&id);
        }
    }

    /// Total connect attempts seen.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, spec: &SessionSpec) -> Result<Arc<dyn Backend>, UpstreamError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.refused.lock().unwrap().contains(&spec.id) {
            return Err(UpstreamError::Transport(format!(
                "connect refused for session {}",
                spec.id
            )));
        }
        let backend = self
            .backends
            .lock()
            .unwrap()
            .get(&spec.id)
            .cloned()
            .ok_or_else(|| {
                UpstreamError::Transport(format!("no backend registered for session {}", spec.id))
            })?;
        backend.set_connected(true);
        Ok(backend)
    }
}
