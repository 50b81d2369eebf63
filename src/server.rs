//! HTTP surface: the JSON API, the SSE reply stream, and server startup.
//!
//! Everything under `/api` sits behind [`auth::require_api_key`]; `/health` is
//! open.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Extension, Path, Query, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::auth::{self, CallerScope, KeyGuard};
use crate::chat;
use crate::chat::types::{Session, SessionSummary};
use crate::config::KotobaConfig;
use crate::db::{self, SharedConnection};
use crate::error::{RelayError, RelayResult};
use crate::relay::{Relay, RelaySettings, StreamEvent};
use crate::upstream::{self, CompletionProvider};
use crate::vocab;
use crate::vocab::types::VocabularyUnit;

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = match &self {
            RelayError::NotFound { .. } => StatusCode::NOT_FOUND,
            RelayError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            RelayError::InvalidInput(_) | RelayError::InvalidUnit(_) => StatusCode::BAD_REQUEST,
            RelayError::UpstreamTransient(_) | RelayError::UpstreamFatal(_) => StatusCode::BAD_GATEWAY,
            RelayError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let message = match &self {
            RelayError::Storage(e) => {
                tracing::error!(error = %format!("{e:#}"), "request failed on storage");
                "internal storage error".to_string()
            }
            other => other.to_string(),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

/// Build the full router over an already-open database and provider.
pub fn app(db: SharedConnection, provider: Arc<dyn CompletionProvider>, config: &KotobaConfig) -> Router {
    let relay = Relay::new(Arc::clone(&db), provider, RelaySettings::from_config(config));
    let guard = KeyGuard {
        db,
        header: config.auth.header.clone(),
    };
    router(AppState { relay }, guard)
}

pub fn router(state: AppState, guard: KeyGuard) -> Router {
    let api = Router::new()
        .route("/api/chat/sessions", get(list_sessions).post(create_session))
        .route("/api/chat/sessions/{id}", get(get_session))
        .route("/api/chat/sessions/{id}/messages", post(send_message))
        .route("/api/vocab", get(list_vocab))
        .route("/api/vocab/search", get(search_vocab))
        .route_layer(middleware::from_fn_with_state(guard, auth::require_api_key))
        .with_state(state);

    Router::new().route("/health", get(health)).merge(api)
}

/// Open the database, seed the initial key, and serve until ctrl-c.
pub async fn serve(config: KotobaConfig) -> Result<()> {
    let db_path = config.resolved_db_path();
    let conn = db::open_database(&db_path)?;
    tracing::info!(db = %db_path.display(), "database ready");

    auth::seed_initial_key(&conn, config.auth.initial_access_key.as_deref())?;
    if config.upstream.api_key.is_empty() {
        tracing::warn!("no upstream API key configured; completions will be rejected upstream");
    }

    let provider: Arc<dyn CompletionProvider> = Arc::from(upstream::create_provider(&config.upstream)?);
    tracing::info!(provider = provider.name(), model = %config.upstream.model, "upstream provider ready");

    let router = app(db::shared(conn), provider, &config);

    let bind_addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "kotoba listening at http://{bind_addr}");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to listen for ctrl-c");
            tracing::info!("shutting down HTTP server");
        })
        .await?;

    Ok(())
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}

async fn list_sessions(
    State(state): State<AppState>,
    Extension(CallerScope(scope)): Extension<CallerScope>,
) -> RelayResult<Json<Vec<SessionSummary>>> {
    let sessions = db::run_blocking(state.relay.db(), move |conn| chat::store::list_sessions(conn, &scope)).await?;
    Ok(Json(sessions))
}

async fn create_session(
    State(state): State<AppState>,
    Extension(CallerScope(scope)): Extension<CallerScope>,
) -> RelayResult<(StatusCode, Json<Session>)> {
    let session = db::run_blocking(state.relay.db(), move |conn| chat::store::create_session(conn, &scope)).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(state): State<AppState>,
    Extension(CallerScope(scope)): Extension<CallerScope>,
    Path(id): Path<String>,
) -> RelayResult<Json<Session>> {
    let lookup = id.clone();
    let session = db::run_blocking(state.relay.db(), move |conn| chat::store::get_session(conn, &scope, &lookup)).await?;
    session.map(Json).ok_or_else(|| RelayError::session_not_found(id))
}

#[derive(Debug, Deserialize)]
struct SendMessageRequest {
    content: String,
}

async fn send_message(
    State(state): State<AppState>,
    Extension(CallerScope(scope)): Extension<CallerScope>,
    Path(id): Path<String>,
    Json(body): Json<SendMessageRequest>,
) -> RelayResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let exchange = state.relay.send_message(&scope, &id, &body.content).await?;
    // the exchange task outlives this handle; dropping the body stream cancels it
    let events = exchange.events.map(|event| Ok(sse_event(&event)));
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

fn sse_event(event: &StreamEvent) -> Event {
    let sse = Event::default().data(event.data());
    match event.event_name() {
        Some(name) => sse.event(name),
        None => sse,
    }
}

async fn list_vocab(
    State(state): State<AppState>,
    Extension(CallerScope(scope)): Extension<CallerScope>,
) -> RelayResult<Json<Vec<VocabularyUnit>>> {
    let units = db::run_blocking(state.relay.db(), move |conn| vocab::store::list_units(conn, &scope)).await?;
    Ok(Json(units))
}

#[derive(Debug, Deserialize)]
struct SearchParams {
    q: Option<String>,
}

async fn search_vocab(
    State(state): State<AppState>,
    Extension(CallerScope(scope)): Extension<CallerScope>,
    Query(params): Query<SearchParams>,
) -> RelayResult<Json<Vec<VocabularyUnit>>> {
    let query = params.q.unwrap_or_default();
    if query.trim().is_empty() {
        return Err(RelayError::InvalidInput("search query must not be empty".into()));
    }
    let units =
        db::run_blocking(state.relay.db(), move |conn| vocab::store::search_units(conn, &scope, &query)).await?;
    Ok(Json(units))
}
