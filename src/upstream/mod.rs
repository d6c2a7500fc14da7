//! Upstream session layer
//!
//! Everything the gateway knows about the chat object store lives behind the
//! [`Backend`] trait: fetching an archived message, opening a fixed-chunk
//! media stream on it, and cheap liveness probing. The production
//! implementation speaks MTProto through grammers (see [`telegram`], behind
//! the `telegram` cargo feature); [`memory`] is a deterministic in-process
//! backend used by the test suite and for local development.
//!
//! [`UpstreamSession`] wraps a backend with a session id, the archive chat
//! identity, and the deadlines and error normalisation the rest of the
//! gateway relies on.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::MessageId;

pub mod memory;
pub mod session;
#[cfg(feature = "telegram")]
pub mod telegram;

pub use session::UpstreamSession;

/// Prefix used when synthesizing a file name for media without one.
pub const SYNTHETIC_NAME_PREFIX: &str = "streamgate";

/// Errors produced by upstream sessions.
///
/// These never reach an HTTP client directly; the range engine and resolver
/// translate them into routing decisions (blind marks, blacklist entries,
/// failover) or a plain 404.
#[derive(Error, Debug, Clone)]
pub enum UpstreamError {
    /// The session cannot observe this message yet (propagation delay).
    #[error("message not yet visible to this session")]
    NotYetVisible,

    /// The upstream asked us to back off.
    #[error("rate limited, retry after {wait:?}")]
    RateLimited {
        /// Advised cool-off duration.
        wait: Duration,
    },

    /// A wall-clock deadline expired before the upstream answered.
    #[error("upstream call timed out")]
    Timeout,

    /// Connection-level failure (socket reset, RPC error, early EOF).
    #[error("upstream transport failure: {0}")]
    Transport(String),

    /// The message genuinely does not exist or carries no media.
    #[error("message not found")]
    NotFound,
}

/// Kind of media attached to an archived message.
///
/// Mirrors the upstream media classes; used only for name and mime
/// synthesis when the upstream omits the real attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Photo,
    Audio,
    Voice,
    Video,
    Animation,
    VideoNote,
    Sticker,
    Document,
}

impl MediaKind {
    /// File extension used when the upstream omits `file_name`.
    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Photo => "jpg",
            MediaKind::Audio => "mp3",
            MediaKind::Voice => "ogg",
            MediaKind::Video | MediaKind::Animation | MediaKind::VideoNote => "mp4",
            MediaKind::Sticker => "webp",
            MediaKind::Document => "bin",
        }
    }

    /// Mime type used when the upstream omits `mime_type`.
    pub fn synthesized_mime(self) -> &'static str {
        match self {
            MediaKind::Photo => "image/jpeg",
            MediaKind::Voice => "audio/ogg",
            MediaKind::VideoNote => "video/mp4",
            _ => "application/octet-stream",
        }
    }
}

/// Media attributes of an archived message as the upstream reports them.
///
/// Optional fields stay optional here; synthesis happens in
/// [`UpstreamSession::describe`] so the tables live in exactly one place.
#[derive(Debug, Clone)]
pub struct MediaInfo {
    /// Media class of the payload.
    pub kind: MediaKind,
    /// Payload size in bytes. Zero means the upstream could not size it.
    pub file_size: u64,
    /// Original file name, when the upstream kept one.
    pub file_name: Option<String>,
    /// Declared mime type, when the upstream kept one.
    pub mime_type: Option<String>,
    /// Opaque, session-local identity hash of the payload.
    pub unique_id: String,
}

/// An archived message that carries downloadable media.
#[derive(Debug, Clone)]
pub struct MediaMessage {
    /// Archive chat the message lives in.
    pub chat: i64,
    /// Message id within the archive chat.
    pub id: MessageId,
    /// Media attributes.
    pub media: MediaInfo,
}

/// Resolved file metadata served from the descriptor cache.
///
/// Invariant: cached descriptors always have `file_size >= 1` and a
/// non-empty `unique_id`; the resolver refuses to publish anything else.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    /// Message id the descriptor was resolved from.
    pub message_id: MessageId,
    /// Exact payload size in bytes.
    pub file_size: u64,
    /// Real or synthesized file name.
    pub file_name: String,
    /// Real or synthesized mime type.
    pub mime_type: String,
    /// Opaque identity hash.
    pub unique_id: String,
    /// Media class of the payload.
    pub media_kind: MediaKind,
}

/// Lazy sequence of fixed-size (1 MiB) byte chunks.
///
/// Restartable only by opening a new stream; the final chunk may be short.
pub type ChunkStream = BoxStream<'static, std::result::Result<Bytes, UpstreamError>>;

/// One authenticated connection to the chat object store.
///
/// Implementations must be cheap to probe and safe to drop mid-stream; the
/// pool replaces backends wholesale on restart, so nothing above this trait
/// may assume a backend instance outlives a single call sequence.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Fetch an archived message by id.
    ///
    /// Implementations signal a message that exists but is not visible to
    /// this particular account yet with [`UpstreamError::NotYetVisible`].
    async fn fetch_message(
        &self,
        chat: i64,
        message_id: MessageId,
    ) -> std::result::Result<MediaMessage, UpstreamError>;

    /// Open a chunked media stream on a previously fetched message.
    ///
    /// `chunk_offset` is counted in chunks, not bytes; `chunk_limit` bounds
    /// how many chunks the stream yields (0 means unbounded).
    async fn open_stream(
        &self,
        message: &MediaMessage,
        chunk_offset: u64,
        chunk_limit: u64,
    ) -> std::result::Result<ChunkStream, UpstreamError>;

    /// Cheap self-identify call used by the maintenance loop's health probe.
    async fn probe(&self) -> std::result::Result<(), UpstreamError>;

    /// Whether the underlying connection believes it is alive.
    fn is_connected(&self) -> bool;

    /// Stop the connection, best effort.
    async fn stop(&self);

    /// Account username, when known. Surfaced on `/status`.
    fn username(&self) -> Option<String> {
        None
    }
}
