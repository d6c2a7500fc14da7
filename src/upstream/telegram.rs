//! MTProto upstream backend
//!
//! Production implementation of [`Backend`] over grammers. One backend is
//! one signed-in account (bot token or persisted user session) with the
//! archive chat resolved at connect time; downloads use the library's
//! fixed 1 MiB chunk iterator, which matches the gateway's chunk protocol
//! one to one.
//!
//! Compiled behind the `telegram` cargo feature so the rest of the crate
//! (and its test suite, which streams against the in-memory backend) does
//! not need upstream credentials.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::StreamExt;
use grammers_client::types::{Chat, Downloadable, Media, Message};
use grammers_client::{Client, Config as ClientConfig, InitParams, InvocationError};
use grammers_session::Session;
use tracing::{debug, info};

use crate::config::Config;
use crate::pool::{Connector, Credential, SessionSpec};
use crate::upstream::{
    Backend, ChunkStream, MediaInfo, MediaKind, MediaMessage, UpstreamError,
};
use crate::MessageId;

/// Builds signed-in [`TelegramBackend`]s from session specs.
pub struct TelegramConnector {
    api_id: i32,
    api_hash: String,
    flood_sleep_threshold: u32,
    bin_channel: i64,
}

impl TelegramConnector {
    /// Connector over the configured upstream credentials.
    pub fn new(config: &Config) -> Self {
        Self {
            api_id: config.api_id,
            api_hash: config.api_hash.clone(),
            flood_sleep_threshold: config.sleep_threshold,
            bin_channel: config.bin_channel,
        }
    }
}

#[async_trait]
impl Connector for TelegramConnector {
    async fn connect(&self, spec: &SessionSpec) -> Result<Arc<dyn Backend>, UpstreamError> {
        let session = match &spec.credential {
            Credential::BotToken(_) => Session::new(),
            Credential::UserSession(encoded) => {
                let bytes = BASE64
                    .decode(encoded.trim())
                    .map_err(|e| UpstreamError::Transport(format!("bad session encoding: {e}")))?;
                Session::load(&bytes)
                    .map_err(|e| UpstreamError::Transport(format!("bad session data: {e}")))?
            }
        };

        let client = Client::connect(ClientConfig {
            session,
            api_id: self.api_id,
            api_hash: self.api_hash.clone(),
            params: InitParams {
                flood_sleep_threshold: self.flood_sleep_threshold,
                ..Default::default()
            },
        })
        .await
        .map_err(|e| UpstreamError::Transport(e.to_string()))?;

        if let Credential::BotToken(token) = &spec.credential {
            let authorized = client
                .is_authorized()
                .await
                .map_err(|e| UpstreamError::Transport(e.to_string()))?;
            if !authorized {
                client
                    .bot_sign_in(token)
                    .await
                    .map_err(|e| UpstreamError::Transport(e.to_string()))?;
            }
        }

        let me = client.get_me().await.map_err(invocation_error)?;
        let username = me.username().map(str::to_string);
        let chat = find_archive_chat(&client, self.bin_channel).await?;
        info!(session = spec.id, chat = chat.id(), "upstream session signed in");

        Ok(Arc::new(TelegramBackend {
            client,
            chat,
            username,
            connected: AtomicBool::new(true),
        }))
    }
}

/// One signed-in MTProto account.
pub struct TelegramBackend {
    client: Client,
    chat: Chat,
    username: Option<String>,
    connected: AtomicBool,
}

impl TelegramBackend {
    async fn message_by_id(&self, message_id: MessageId) -> Result<Message, UpstreamError> {
        let messages = self
            .client
            .get_messages_by_id(&self.chat, &[message_id])
            .await
            .map_err(invocation_error)?;
        // An empty slot usually means the message has not propagated to
        // this account yet, not that it never will.
        messages
            .into_iter()
            .next()
            .flatten()
            .ok_or(UpstreamError::NotYetVisible)
    }
}

#[async_trait]
impl Backend for TelegramBackend {
    async fn fetch_message(
        &self,
        chat: i64,
        message_id: MessageId,
    ) -> Result<MediaMessage, UpstreamError> {
        let message = self.message_by_id(message_id).await?;
        let media = message.media().ok_or(UpstreamError::NotYetVisible)?;
        let info = media_info(&media).ok_or(UpstreamError::NotYetVisible)?;
        Ok(MediaMessage {
            chat,
            id: message_id,
            media: info,
        })
    }

    async fn open_stream(
        &self,
        message: &MediaMessage,
        chunk_offset: u64,
        chunk_limit: u64,
    ) -> Result<ChunkStream, UpstreamError> {
        // Refetch rather than carrying library objects through the
        // gateway's message type; file references expire and a fresh fetch
        // renews them.
        let fetched = self.message_by_id(message.id).await?;
        let media = fetched.media().ok_or(UpstreamError::NotYetVisible)?;

        let mut download = self.client.iter_download(&Downloadable::Media(media));
        if chunk_offset > 0 {
            download = download.skip_chunks(chunk_offset as usize);
        }

        debug!(
            message_id = message.id,
            chunk_offset, chunk_limit, "opening media download"
        );
        let stream = futures::stream::unfold(
            (download, chunk_limit, 0u64),
            |(mut download, limit, yielded)| async move {
                if limit > 0 && yielded >= limit {
                    return None;
                }
                match download.next().await {
                    Ok(Some(chunk)) => {
                        Some((Ok(Bytes::from(chunk)), (download, limit, yielded + 1)))
                    }
                    Ok(None) => None,
                    Err(e) => Some((Err(invocation_error(e)), (download, limit, yielded + 1))),
                }
            },
        )
        .boxed();
        Ok(stream)
    }

    async fn probe(&self) -> Result<(), UpstreamError> {
        self.client.get_me().await.map_err(invocation_error)?;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        // grammers disconnects when the last client handle drops; the flag
        // stops the pool and maintenance loop from routing to us meanwhile.
        self.connected.store(false, Ordering::SeqCst);
    }

    fn username(&self) -> Option<String> {
        self.username.clone()
    }
}

/// Locate the archive chat among the account's dialogs.
async fn find_archive_chat(client: &Client, target: i64) -> Result<Chat, UpstreamError> {
    let wanted = normalized_chat_id(target);
    let mut dialogs = client.iter_dialogs();
    loop {
        match dialogs.next().await {
            Ok(Some(dialog)) => {
                let chat = dialog.chat();
                if chat.id() == wanted || chat.id() == target {
                    return Ok(chat.clone());
                }
            }
            Ok(None) => break,
            Err(e) => return Err(invocation_error(e)),
        }
    }
    Err(UpstreamError::Transport(format!(
        "archive chat {target} is not visible to this account"
    )))
}

/// Strip the `-100` channel marker convention from a configured chat id.
fn normalized_chat_id(target: i64) -> i64 {
    if target <= -1_000_000_000_000 {
        -target - 1_000_000_000_000
    } else {
        target.abs()
    }
}

fn media_info(media: &Media) -> Option<MediaInfo> {
    match media {
        Media::Photo(photo) => Some(MediaInfo {
            kind: MediaKind::Photo,
            file_size: photo.thumbs().largest().map(|t| t.size() as u64).unwrap_or(0),
            file_name: None,
            mime_type: None,
            unique_id: format!("{:x}", photo.id()),
        }),
        Media::Document(document) => {
            let name = document.name();
            Some(MediaInfo {
                kind: kind_from_mime(document.mime_type()),
                file_size: document.size() as u64,
                file_name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                mime_type: document.mime_type().map(str::to_string),
                unique_id: format!("{:x}", document.id()),
            })
        }
        _ => None,
    }
}

fn kind_from_mime(mime: Option<&str>) -> MediaKind {
    match mime {
        Some(m) if m.starts_with("video/") => MediaKind::Video,
        Some("audio/ogg") => MediaKind::Voice,
        Some(m) if m.starts_with("audio/") => MediaKind::Audio,
        Some(m) if m.starts_with("image/") => MediaKind::Photo,
        _ => MediaKind::Document,
    }
}

fn invocation_error(e: InvocationError) -> UpstreamError {
    match &e {
        InvocationError::Rpc(rpc) if rpc.name.starts_with("FLOOD_WAIT") => {
            UpstreamError::RateLimited {
                wait: Duration::from_secs(rpc.value.unwrap_or(60) as u64),
            }
        }
        _ => UpstreamError::Transport(e.to_string()),
    }
}
