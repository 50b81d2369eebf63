//! One streaming exchange: upstream fragments in, caller events out, then the
//! trailing persistence once the caller has seen `[DONE]`.
//!
//! The exchange task owns its reply accumulator. It forwards each fragment over
//! a bounded channel before polling upstream again, and treats the receiving
//! half going away as a disconnect.

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tracing::Instrument;

use crate::chat;
use crate::chat::types::Message;
use crate::config::IndexingConfig;
use crate::db::{self, SharedConnection};
use crate::upstream::{ChatTurn, CompletionProvider, UpstreamError};
use crate::vocab;
use crate::vocab::extract::{self, Strategy};
use crate::vocab::types::ExtractedUnit;

use std::sync::Arc;

/// Lifecycle of an exchange.
///
/// `Idle → AwaitingUpstream → Streaming → Finalizing → Done`, with `Aborted`
/// reachable from the two upstream-facing states. An empty reply skips
/// `Streaming`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Idle,
    AwaitingUpstream,
    Streaming,
    Finalizing,
    Done,
    Aborted,
}

impl ExchangeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::AwaitingUpstream => "awaiting_upstream",
            Self::Streaming => "streaming",
            Self::Finalizing => "finalizing",
            Self::Done => "done",
            Self::Aborted => "aborted",
        }
    }

    pub fn can_advance_to(self, next: ExchangeState) -> bool {
        use ExchangeState::*;
        matches!(
            (self, next),
            (Idle, AwaitingUpstream)
                | (AwaitingUpstream, Streaming)
                | (AwaitingUpstream, Finalizing)
                | (AwaitingUpstream, Aborted)
                | (Streaming, Finalizing)
                | (Streaming, Aborted)
                | (Finalizing, Done)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

impl std::fmt::Display for ExchangeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the caller receives, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Token(String),
    /// Sent exactly once, last, after a complete reply.
    Done,
    /// Sent instead of `Done` when the exchange aborts on an upstream failure.
    Error(String),
}

impl StreamEvent {
    pub const DONE_MARKER: &'static str = "[DONE]";

    /// The SSE `data:` payload: `{"token":…}`, `[DONE]`, or `{"error":…}`.
    pub fn data(&self) -> String {
        match self {
            Self::Token(token) => json!({ "token": token }).to_string(),
            Self::Done => Self::DONE_MARKER.to_string(),
            Self::Error(message) => json!({ "error": message }).to_string(),
        }
    }

    /// SSE event name; content and the terminal marker use the default.
    pub fn event_name(&self) -> Option<&'static str> {
        match self {
            Self::Error(_) => Some("error"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The caller stopped listening before the reply completed.
    Disconnected,
    Upstream(UpstreamError),
}

impl std::fmt::Display for AbortReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("caller disconnected"),
            Self::Upstream(e) => write!(f, "{e}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    /// The reply was streamed in full and stored; `indexed` counts the
    /// vocabulary units upserted from it.
    Completed { reply: String, indexed: usize },
    /// Nothing from this exchange was stored.
    Aborted { reason: AbortReason },
}

/// Handle to a running exchange.
///
/// Dropping `events` cancels the exchange if it has not finished streaming.
/// `outcome` resolves once trailing persistence is done.
pub struct Exchange {
    pub session_id: String,
    pub events: ReceiverStream<StreamEvent>,
    pub outcome: JoinHandle<ExchangeOutcome>,
}

pub(crate) struct ExchangeContext {
    pub db: SharedConnection,
    pub provider: Arc<dyn CompletionProvider>,
    pub scope: String,
    pub session_id: String,
    pub user_text: String,
    pub indexing: IndexingConfig,
}

pub(crate) fn spawn(ctx: ExchangeContext, turns: Vec<ChatTurn>) -> Exchange {
    let (tx, rx) = mpsc::channel(ctx.indexing.event_buffer.max(1));
    let session_id = ctx.session_id.clone();
    let span = tracing::info_span!("exchange", session = %session_id, provider = ctx.provider.name());
    let outcome = tokio::spawn(run(ctx, turns, tx).instrument(span));

    Exchange {
        session_id,
        events: ReceiverStream::new(rx),
        outcome,
    }
}

struct StateMachine {
    state: ExchangeState,
}

impl StateMachine {
    fn advance(&mut self, next: ExchangeState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "illegal transition {} -> {}",
            self.state,
            next
        );
        tracing::debug!(from = %self.state, state = %next, "exchange transition");
        self.state = next;
    }
}

async fn run(ctx: ExchangeContext, turns: Vec<ChatTurn>, tx: mpsc::Sender<StreamEvent>) -> ExchangeOutcome {
    let mut machine = StateMachine {
        state: ExchangeState::Idle,
    };
    machine.advance(ExchangeState::AwaitingUpstream);

    let opened = tokio::select! {
        biased;
        _ = tx.closed() => None,
        result = ctx.provider.stream_completion(turns) => Some(result),
    };
    let mut upstream = match opened {
        None => return abort(&mut machine, &tx, AbortReason::Disconnected, 0).await,
        Some(Err(e)) => return abort(&mut machine, &tx, AbortReason::Upstream(e), 0).await,
        Some(Ok(stream)) => stream,
    };

    let mut reply = String::new();
    let mut fragments = 0usize;

    loop {
        let next = tokio::select! {
            biased;
            _ = tx.closed() => {
                return abort(&mut machine, &tx, AbortReason::Disconnected, fragments).await;
            }
            item = upstream.next() => item,
        };

        match next {
            Some(Ok(fragment)) => {
                if machine.state == ExchangeState::AwaitingUpstream {
                    machine.advance(ExchangeState::Streaming);
                }
                reply.push_str(&fragment);
                fragments += 1;
                if tx.send(StreamEvent::Token(fragment)).await.is_err() {
                    return abort(&mut machine, &tx, AbortReason::Disconnected, fragments).await;
                }
            }
            Some(Err(e)) => {
                return abort(&mut machine, &tx, AbortReason::Upstream(e), fragments).await;
            }
            None => break,
        }
    }

    // release the upstream connection before any trailing work
    drop(upstream);
    machine.advance(ExchangeState::Finalizing);

    if tx.send(StreamEvent::Done).await.is_err() {
        tracing::debug!("caller left before the terminal marker");
    }
    drop(tx);

    let indexed = finalize(&ctx, &reply).await;
    machine.advance(ExchangeState::Done);
    tracing::info!(fragments, chars = reply.chars().count(), indexed, "exchange completed");

    ExchangeOutcome::Completed { reply, indexed }
}

async fn abort(
    machine: &mut StateMachine,
    tx: &mpsc::Sender<StreamEvent>,
    reason: AbortReason,
    fragments: usize,
) -> ExchangeOutcome {
    machine.advance(ExchangeState::Aborted);
    tracing::warn!(fragments, reason = %reason, "exchange aborted");

    if let AbortReason::Upstream(ref e) = reason {
        let _ = tx.send(StreamEvent::Error(e.to_string())).await;
    }
    ExchangeOutcome::Aborted { reason }
}

/// Store the assistant message, then index the exchange. Failures are logged;
/// the caller's stream has already ended.
async fn finalize(ctx: &ExchangeContext, reply: &str) -> usize {
    let message = Message::assistant(reply);
    let scope = ctx.scope.clone();
    let session_id = ctx.session_id.clone();
    match db::run_blocking(&ctx.db, move |conn| {
        chat::store::append_message(conn, &scope, &session_id, &message)
    })
    .await
    {
        Ok(true) => {}
        Ok(false) => tracing::warn!("session disappeared before the reply was stored"),
        Err(e) => tracing::error!(error = %e, "failed to store assistant message"),
    }

    let units = units_for_indexing(reply, &ctx.user_text, &ctx.indexing);
    if units.is_empty() {
        return 0;
    }
    let report = vocab::store::upsert_batch(&ctx.db, &ctx.scope, units).await;
    if report.failed > 0 {
        tracing::error!(failed = report.failed, upserted = report.upserted, "vocabulary indexing incomplete");
    }
    report.upserted
}

/// Units observed by one completed exchange, each at most once.
///
/// Structured blocks from the reply come first and keep their metadata; the
/// user's text and (when the reply had no blocks) the reply itself are
/// character-scanned underneath.
pub fn units_for_indexing(reply: &str, user_text: &str, settings: &IndexingConfig) -> Vec<ExtractedUnit> {
    let mut units = extract::extract(reply, Strategy::StructuredBlocks);
    let had_blocks = !units.is_empty();

    if settings.scan_user_text {
        units = extract::combine(units, extract::scan_characters(user_text));
    }
    if settings.scan_reply_fallback && !had_blocks {
        units = extract::combine(units, extract::scan_characters(reply));
    }
    units
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use ExchangeState::*;
        assert!(Idle.can_advance_to(AwaitingUpstream));
        assert!(AwaitingUpstream.can_advance_to(Streaming));
        assert!(AwaitingUpstream.can_advance_to(Finalizing));
        assert!(Streaming.can_advance_to(Aborted));
        assert!(Finalizing.can_advance_to(Done));

        assert!(!Finalizing.can_advance_to(Aborted));
        assert!(!Idle.can_advance_to(Streaming));
        assert!(!Done.can_advance_to(Idle));
        assert!(Aborted.is_terminal() && Done.is_terminal());
    }

    #[test]
    fn wire_payloads() {
        assert_eq!(StreamEvent::Token("日".into()).data(), r#"{"token":"日"}"#);
        assert_eq!(StreamEvent::Done.data(), "[DONE]");
        assert_eq!(StreamEvent::Error("boom".into()).data(), r#"{"error":"boom"}"#);
        assert_eq!(StreamEvent::Error("boom".into()).event_name(), Some("error"));
        assert_eq!(StreamEvent::Done.event_name(), None);
    }

    #[test]
    fn tokens_with_quotes_stay_valid_json() {
        let data = StreamEvent::Token("say \"hi\"\n".into()).data();
        let value: serde_json::Value = serde_json::from_str(&data).unwrap();
        assert_eq!(value["token"], "say \"hi\"\n");
    }

    #[test]
    fn structured_units_keep_metadata_over_scans() {
        let reply = "[東]\nReadings: とう\nJLPT: N4\nMeaning: east\n東京 is the capital.";
        let units = units_for_indexing(reply, "東京", &IndexingConfig::default());

        let names: Vec<&str> = units.iter().map(|u| u.unit.as_str()).collect();
        assert_eq!(names, vec!["東", "京"]);
        assert_eq!(units[0].metadata.meanings, vec!["east"]);
        assert!(units[1].metadata.is_empty());
    }

    #[test]
    fn reply_is_scanned_only_without_blocks() {
        let settings = IndexingConfig {
            scan_user_text: false,
            ..IndexingConfig::default()
        };

        let plain = units_for_indexing("東京に行きます", "", &settings);
        assert_eq!(plain.len(), 3);

        let structured = units_for_indexing("[水]\nJLPT: N5\nMeaning: water\n火", "", &settings);
        let names: Vec<&str> = structured.iter().map(|u| u.unit.as_str()).collect();
        assert_eq!(names, vec!["水"]);
    }

    #[test]
    fn scans_can_be_disabled() {
        let settings = IndexingConfig {
            scan_user_text: false,
            scan_reply_fallback: false,
            event_buffer: 1,
        };
        assert!(units_for_indexing("東京", "京都", &settings).is_empty());
    }
}
