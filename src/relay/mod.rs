//! Streaming Completion Relay.
//!
//! [`Relay::send_message`] records the user's message, derives the session
//! title on the first exchange, and hands the history to an exchange task
//! (see [`exchange`]) that streams the reply back and indexes it afterwards.

pub mod exchange;

pub use exchange::{AbortReason, Exchange, ExchangeOutcome, ExchangeState, StreamEvent};

use std::sync::Arc;

use crate::chat;
use crate::chat::types::Message;
use crate::config::{IndexingConfig, KotobaConfig};
use crate::db::{self, SharedConnection};
use crate::error::{RelayError, RelayResult};
use crate::upstream::{ChatTurn, CompletionProvider};

/// Relay settings taken from configuration.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    pub system_prompt: String,
    pub indexing: IndexingConfig,
}

impl RelaySettings {
    pub fn from_config(config: &KotobaConfig) -> Self {
        Self {
            system_prompt: config.upstream.system_prompt.clone(),
            indexing: config.indexing.clone(),
        }
    }
}

#[derive(Clone)]
pub struct Relay {
    db: SharedConnection,
    provider: Arc<dyn CompletionProvider>,
    settings: Arc<RelaySettings>,
}

impl Relay {
    pub fn new(db: SharedConnection, provider: Arc<dyn CompletionProvider>, settings: RelaySettings) -> Self {
        Self {
            db,
            provider,
            settings: Arc::new(settings),
        }
    }

    pub fn db(&self) -> &SharedConnection {
        &self.db
    }

    /// Append `content` to the session and start streaming the reply.
    ///
    /// Fails before anything is written if `content` is blank or the session is
    /// not in `scope`. On a session's first message the title is derived here,
    /// so it stays even if the exchange is later cancelled.
    pub async fn send_message(&self, scope: &str, session_id: &str, content: &str) -> RelayResult<Exchange> {
        if content.trim().is_empty() {
            return Err(RelayError::InvalidInput("message content must not be empty".into()));
        }

        let history = {
            let scope = scope.to_string();
            let session_id = session_id.to_string();
            let content = content.to_string();
            db::run_blocking(&self.db, move |conn| {
                let Some(session) = chat::store::get_session(conn, &scope, &session_id)? else {
                    return Ok(None);
                };

                let message = Message::user(content.clone());
                if !chat::store::append_message(conn, &scope, &session_id, &message)? {
                    return Ok(None);
                }
                if session.messages.is_empty() && chat::store::set_title_once(conn, &scope, &session_id, &content)? {
                    tracing::debug!(session = %session_id, "session title derived");
                }

                let mut history = session.messages;
                history.push(message);
                Ok(Some(history))
            })
            .await?
        };
        let history = history.ok_or_else(|| RelayError::session_not_found(session_id))?;

        let mut turns = Vec::with_capacity(history.len() + 1);
        turns.push(ChatTurn::system(self.settings.system_prompt.clone()));
        turns.extend(history.iter().map(ChatTurn::from));

        tracing::debug!(session = %session_id, turns = turns.len(), "starting exchange");

        let ctx = exchange::ExchangeContext {
            db: Arc::clone(&self.db),
            provider: Arc::clone(&self.provider),
            scope: scope.to_string(),
            session_id: session_id.to_string(),
            user_text: content.to_string(),
            indexing: self.settings.indexing.clone(),
        };
        Ok(exchange::spawn(ctx, turns))
    }
}
