//! Upstream session wrapper
//!
//! [`UpstreamSession`] pairs a [`Backend`] with its pool id and the archive
//! chat identity, and applies the deadlines every caller depends on. The
//! upstream can silently stall; without a bounded wait the range engine
//! could never fail over.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::upstream::{Backend, ChunkStream, FileDescriptor, MediaMessage, UpstreamError};
use crate::upstream::SYNTHETIC_NAME_PREFIX;
use crate::{MessageId, SessionId};

/// Wall-clock deadline for a single message fetch.
const GET_MESSAGE_TIMEOUT: Duration = Duration::from_secs(15);

/// One authenticated upstream session as the rest of the gateway sees it.
///
/// The pool exclusively owns sessions; everything else holds `Arc` handles
/// resolved through [`crate::pool::SessionPool::get`] at use time.
pub struct UpstreamSession {
    id: SessionId,
    archive_chat: i64,
    backend: Arc<dyn Backend>,
}

impl UpstreamSession {
    /// Create a session wrapper around a connected backend.
    pub fn new(id: SessionId, archive_chat: i64, backend: Arc<dyn Backend>) -> Self {
        Self {
            id,
            archive_chat,
            backend,
        }
    }

    /// Pool id of this session (`0` primary, `99` power session).
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Whether the underlying connection believes it is alive.
    pub fn is_connected(&self) -> bool {
        self.backend.is_connected()
    }

    /// Account username, when known.
    pub fn username(&self) -> Option<String> {
        self.backend.username()
    }

    /// Fetch an archived message with a 15 s wall-clock deadline.
    ///
    /// An elapsed deadline maps to [`UpstreamError::Timeout`] so the caller
    /// can blacklist this session and move on.
    pub async fn get_message(
        &self,
        message_id: MessageId,
    ) -> Result<MediaMessage, UpstreamError> {
        match tokio::time::timeout(
            GET_MESSAGE_TIMEOUT,
            self.backend.fetch_message(self.archive_chat, message_id),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                debug!(session = self.id, message_id, "message fetch timed out");
                Err(UpstreamError::Timeout)
            }
        }
    }

    /// Open a chunked media stream on a fetched message.
    ///
    /// The stream is restartable only by calling this again; resuming after
    /// a failure means a fresh stream at a new chunk offset.
    pub async fn stream_media(
        &self,
        message: &MediaMessage,
        chunk_offset: u64,
        chunk_limit: u64,
    ) -> Result<ChunkStream, UpstreamError> {
        self.backend
            .open_stream(message, chunk_offset, chunk_limit)
            .await
    }

    /// Build a [`FileDescriptor`] from a message's media attributes.
    ///
    /// When the upstream omits `file_name` or `mime_type`, both are
    /// synthesized from the media kind using the fixed tables on
    /// [`crate::upstream::MediaKind`].
    pub fn describe(&self, message: &MediaMessage) -> FileDescriptor {
        let media = &message.media;
        let file_name = media.file_name.clone().unwrap_or_else(|| {
            format!(
                "{}_{}.{}",
                SYNTHETIC_NAME_PREFIX,
                message.id,
                media.kind.extension()
            )
        });
        let mime_type = media
            .mime_type
            .clone()
            .unwrap_or_else(|| media.kind.synthesized_mime().to_string());

        FileDescriptor {
            message_id: message.id,
            file_size: media.file_size,
            file_name,
            mime_type,
            unique_id: media.unique_id.clone(),
            media_kind: media.kind,
        }
    }

    /// Cheap self-identify call. The caller supplies the deadline.
    pub async fn probe(&self) -> Result<(), UpstreamError> {
        self.backend.probe().await
    }

    /// Stop the underlying connection, best effort.
    pub async fn stop(&self) {
        self.backend.stop().await;
    }
}

impl std::fmt::Debug for UpstreamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamSession")
            .field("id", &self.id)
            .field("archive_chat", &self.archive_chat)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upstream::memory::{MemoryBackend, MemoryStore};
    use crate::upstream::{MediaInfo, MediaKind};

    fn session_with(store: MemoryStore) -> UpstreamSession {
        UpstreamSession::new(0, -100, Arc::new(MemoryBackend::new(Arc::new(store))))
    }

    #[tokio::test]
    async fn test_describe_keeps_real_attributes() {
        let mut store = MemoryStore::new();
        store.put_media(
            7,
            MediaInfo {
                kind: MediaKind::Video,
                file_size: 10,
                file_name: Some("movie.mkv".into()),
                mime_type: Some("video/x-matroska".into()),
                unique_id: "u7".into(),
            },
            vec![0u8; 10],
        );
        let session = session_with(store);
        let message = session.get_message(7).await.unwrap();
        let descriptor = session.describe(&message);
        assert_eq!(descriptor.file_name, "movie.mkv");
        assert_eq!(descriptor.mime_type, "video/x-matroska");
        assert_eq!(descriptor.file_size, 10);
    }

    #[tokio::test]
    async fn test_describe_synthesizes_missing_attributes() {
        let mut store = MemoryStore::new();
        store.put_media(
            188,
            MediaInfo {
                kind: MediaKind::Voice,
                file_size: 4,
                file_name: None,
                mime_type: None,
                unique_id: "u188".into(),
            },
            vec![1, 2, 3, 4],
        );
        let session = session_with(store);
        let message = session.get_message(188).await.unwrap();
        let descriptor = session.describe(&message);
        assert_eq!(descriptor.file_name, "streamgate_188.ogg");
        assert_eq!(descriptor.mime_type, "audio/ogg");
    }

    #[tokio::test]
    async fn test_get_message_missing_is_not_found() {
        let session = session_with(MemoryStore::new());
        let err = session.get_message(1).await.unwrap_err();
        assert!(matches!(err, UpstreamError::NotFound));
    }
}
