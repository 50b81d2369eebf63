#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use kotoba::chat;
use kotoba::config::IndexingConfig;
use kotoba::db::{self, SharedConnection};
use kotoba::relay::{Exchange, ExchangeOutcome, Relay, RelaySettings, StreamEvent};
use kotoba::upstream::{ChatTurn, CompletionProvider, FragmentStream, UpstreamError};
use kotoba::vocab::types::{JlptLevel, UnitMetadata};
use rusqlite::Connection;

/// Open a fresh in-memory database with schema and migrations applied.
pub fn test_db() -> Connection {
    db::open_memory_database().unwrap()
}

pub fn shared_test_db() -> SharedConnection {
    db::shared(test_db())
}

pub fn meta(readings: &[&str], meanings: &[&str], level: Option<JlptLevel>) -> UnitMetadata {
    UnitMetadata {
        readings: readings.iter().map(|s| s.to_string()).collect(),
        meanings: meanings.iter().map(|s| s.to_string()).collect(),
        level,
    }
}

/// In-process upstream that replays a fixed script.
///
/// With `then_hang` the stream never ends after the script, like a model that
/// is still generating.
pub struct ScriptedProvider {
    script: Vec<Result<String, UpstreamError>>,
    open_error: Option<UpstreamError>,
    then_hang: bool,
    calls: AtomicUsize,
    released: Arc<AtomicBool>,
}

impl ScriptedProvider {
    pub fn fragments(fragments: &[&str]) -> Self {
        Self {
            script: fragments.iter().map(|f| Ok(f.to_string())).collect(),
            open_error: None,
            then_hang: false,
            calls: AtomicUsize::new(0),
            released: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn hanging_after(fragments: &[&str]) -> Self {
        Self {
            then_hang: true,
            ..Self::fragments(fragments)
        }
    }

    pub fn failing_after(fragments: &[&str], error: UpstreamError) -> Self {
        let mut provider = Self::fragments(fragments);
        provider.script.push(Err(error));
        provider
    }

    pub fn failing_open(error: UpstreamError) -> Self {
        Self {
            open_error: Some(error),
            ..Self::fragments(&[])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Whether the last opened stream has been dropped.
    pub fn released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }
}

struct ReleaseGuard(Arc<AtomicBool>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl CompletionProvider for ScriptedProvider {
    async fn stream_completion(&self, _turns: Vec<ChatTurn>) -> Result<FragmentStream, UpstreamError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = &self.open_error {
            return Err(err.clone());
        }

        self.released.store(false, Ordering::SeqCst);
        let guard = ReleaseGuard(Arc::clone(&self.released));
        let scripted = futures::stream::iter(self.script.clone());
        let stream = if self.then_hang {
            scripted.chain(futures::stream::pending()).boxed()
        } else {
            scripted.boxed()
        };

        Ok(stream
            .map(move |item| {
                let _held = &guard;
                item
            })
            .boxed())
    }

    fn name(&self) -> &str {
        "scripted"
    }
}

pub fn test_relay(db: SharedConnection, provider: Arc<ScriptedProvider>) -> Relay {
    let settings = RelaySettings {
        system_prompt: "You are a Japanese tutor.".into(),
        indexing: IndexingConfig::default(),
    };
    Relay::new(db, provider, settings)
}

pub fn new_session(db: &SharedConnection, scope: &str) -> String {
    let conn = db.lock().unwrap();
    chat::store::create_session(&conn, scope).unwrap().id
}

/// Read every event, then wait for trailing persistence.
pub async fn run_to_end(exchange: Exchange) -> (Vec<StreamEvent>, ExchangeOutcome) {
    let events = exchange.events.collect().await;
    let outcome = exchange.outcome.await.unwrap();
    (events, outcome)
}
