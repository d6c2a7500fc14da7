//! Shared fixtures for integration tests
//!
//! Spins up the full gateway (memory backends, pool, ledger, resolver,
//! axum app) on an ephemeral listener and hands back the pieces the tests
//! poke at.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use streamgate::http::{app, AppState};
use streamgate::ledger::Ledger;
use streamgate::pool::{Credential, SessionPool, SessionSpec};
use streamgate::resolver::Resolver;
use streamgate::upstream::memory::{MemoryBackend, MemoryConnector, MemoryStore};
use streamgate::upstream::{MediaInfo, MediaKind};
use streamgate::{MessageId, SessionId};

pub struct TestGateway {
    pub base_url: String,
    pub ledger: Arc<Ledger>,
    pub pool: Arc<SessionPool>,
    pub backends: HashMap<SessionId, Arc<MemoryBackend>>,
    pub payloads: HashMap<MessageId, Vec<u8>>,
}

impl TestGateway {
    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub fn payload(&self, message_id: MessageId) -> &[u8] {
        &self.payloads[&message_id]
    }

    /// Wait until every listed session's in-flight counter reaches the
    /// expected value.
    pub async fn wait_for_loads(&self, expected: &[(SessionId, usize)]) {
        for _ in 0..200 {
            if expected
                .iter()
                .all(|(id, load)| self.ledger.load_of(*id) == Some(*load))
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("work loads never settled: {:?}", self.ledger.snapshot());
    }
}

pub fn patterned(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 256) as u8).collect()
}

/// Start a gateway with the given session ids and archived files.
pub async fn gateway(ids: &[SessionId], files: &[(MessageId, usize)]) -> TestGateway {
    let mut store = MemoryStore::new();
    let mut payloads = HashMap::new();
    for (message_id, len) in files {
        let payload = patterned(*len);
        store.put_media(
            *message_id,
            MediaInfo {
                kind: MediaKind::Video,
                file_size: *len as u64,
                file_name: Some(format!("file{message_id}.mp4")),
                mime_type: Some("video/mp4".to_string()),
                unique_id: format!("u{message_id}"),
            },
            payload.clone(),
        );
        payloads.insert(*message_id, payload);
    }
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
            credential: Credential::BotToken(format!("{id}:secret")),
        });
    }

    let pool = Arc::new(SessionPool::new(-1001, specs, connector));
    let ledger = Arc::new(Ledger::new());
    pool.start(&ledger).await.expect("pool start");
    let resolver = Arc::new(Resolver::new(pool.clone()));

    let state = AppState {
        pool: pool.clone(),
        ledger: ledger.clone(),
        resolver,
        started_at: Instant::now(),
        doc_url: "https://example.com/docs".to_string(),
    };

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind ephemeral listener");
    let addr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.expect("serve");
    });

    TestGateway {
        base_url: format!("http://{addr}"),
        ledger,
        pool,
        backends,
        payloads,
    }
}
