mod helpers;

use std::sync::Arc;
use std::time::Duration;

use helpers::ScriptedProvider;
use kotoba::auth;
use kotoba::config::KotobaConfig;
use kotoba::db::SharedConnection;
use kotoba::server;
use kotoba::vocab;
use serde_json::Value;

const KEY: &str = "kt_test_key_a";

struct TestServer {
    base: String,
    db: SharedConnection,
    client: reqwest::Client,
}

impl TestServer {
    async fn start(provider: ScriptedProvider) -> Self {
        Self::start_with(Arc::new(provider)).await
    }

    async fn start_with(provider: Arc<ScriptedProvider>) -> Self {
        let db = helpers::shared_test_db();
        {
            let conn = db.lock().unwrap();
            auth::insert_key(&conn, KEY, "test").unwrap();
            let retired = auth::insert_key(&conn, "kt_retired", "old").unwrap();
            auth::deactivate_key(&conn, &retired.id).unwrap();
        }

        let app = server::app(Arc::clone(&db), provider, &KotobaConfig::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            db,
            client: reqwest::Client::new(),
        }
    }

    fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.get(format!("{}{path}", self.base)).header("X-Api-Key", KEY)
    }

    fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.client.post(format!("{}{path}", self.base)).header("X-Api-Key", KEY)
    }

    async fn create_session(&self) -> String {
        let response = self.post("/api/chat/sessions").send().await.unwrap();
        assert_eq!(response.status(), 201);
        let body: Value = response.json().await.unwrap();
        body["id"].as_str().unwrap().to_string()
    }
}

fn data_lines(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.trim_start().to_string())
        .collect()
}

#[tokio::test]
async fn health_needs_no_key() {
    let server = TestServer::start(ScriptedProvider::fragments(&[])).await;
    let response = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn api_rejects_missing_unknown_and_inactive_keys() {
    let server = TestServer::start(ScriptedProvider::fragments(&[])).await;
    let url = format!("{}/api/vocab", server.base);

    let missing = server.client.get(&url).send().await.unwrap();
    assert_eq!(missing.status(), 401);
    let body: Value = missing.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("missing"));

    for key in ["kt_unknown", "kt_retired"] {
        let response = server.client.get(&url).header("X-Api-Key", key).send().await.unwrap();
        assert_eq!(response.status(), 401, "key {key}");
    }
}

#[tokio::test]
async fn sessions_are_created_listed_and_scoped() {
    let server = TestServer::start(ScriptedProvider::fragments(&[])).await;
    let id = server.create_session().await;

    let listed: Value = server.get("/api/chat/sessions").send().await.unwrap().json().await.unwrap();
    assert_eq!(listed.as_array().unwrap().len(), 1);
    assert_eq!(listed[0]["id"], id.as_str());
    assert_eq!(listed[0]["messageCount"], 0);

    let fetched: Value = server
        .get(&format!("/api/chat/sessions/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(fetched["messages"].as_array().unwrap().is_empty());
    assert!(fetched.get("scope").is_none());

    {
        let conn = server.db.lock().unwrap();
        auth::insert_key(&conn, "kt_other", "other").unwrap();
    }
    let foreign = server
        .client
        .get(format!("{}/api/chat/sessions/{id}", server.base))
        .header("X-Api-Key", "kt_other")
        .send()
        .await
        .unwrap();
    assert_eq!(foreign.status(), 404);
}

#[tokio::test]
async fn message_reply_streams_as_sse() {
    let server = TestServer::start(ScriptedProvider::fragments(&["日", "本", "語"])).await;
    let id = server.create_session().await;

    let response = server
        .post(&format!("/api/chat/sessions/{id}/messages"))
        .json(&serde_json::json!({ "content": "日本語を勉強しています" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/event-stream"));

    let body = response.text().await.unwrap();
    assert_eq!(
        data_lines(&body),
        vec![r#"{"token":"日"}"#, r#"{"token":"本"}"#, r#"{"token":"語"}"#, "[DONE]"]
    );

    // indexing trails the stream
    let mut indexed = Vec::new();
    for _ in 0..100 {
        indexed = {
            let conn = server.db.lock().unwrap();
            vocab::store::list_units(&conn, KEY).unwrap()
        };
        if indexed.len() >= 5 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let units: Vec<&str> = indexed.iter().map(|u| u.unit.as_str()).collect();
    for expected in ["日", "本", "語", "勉", "強"] {
        assert!(units.contains(&expected), "missing {expected} in {units:?}");
    }

    let fetched: Value = server
        .get(&format!("/api/chat/sessions/{id}"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(fetched["title"], "日本語を勉強しています");
}

#[tokio::test]
async fn client_disconnect_releases_the_upstream_stream() {
    let provider = Arc::new(ScriptedProvider::hanging_after(&["東"]));
    let server = TestServer::start_with(Arc::clone(&provider)).await;
    let id = server.create_session().await;

    let mut response = server
        .post(&format!("/api/chat/sessions/{id}/messages"))
        .json(&serde_json::json!({ "content": "東京" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let mut received = String::new();
    while !received.contains(r#"{"token":"東"}"#) {
        let chunk = response.chunk().await.unwrap().expect("stream ended before the first token");
        received.push_str(&String::from_utf8_lossy(&chunk));
    }
    assert!(!provider.released());
    drop(response);

    let mut released = false;
    for _ in 0..100 {
        if provider.released() {
            released = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(released, "upstream stream still held after disconnect");
    assert_eq!(provider.calls(), 1);

    let conn = server.db.lock().unwrap();
    let stored = kotoba::chat::store::get_session(&conn, KEY, &id).unwrap().unwrap();
    assert_eq!(stored.messages.len(), 1);
    assert!(vocab::store::list_units(&conn, KEY).unwrap().is_empty());
}

#[tokio::test]
async fn upstream_failure_ends_with_error_event() {
    let provider = ScriptedProvider::failing_after(
        &["日"],
        kotoba::upstream::UpstreamError::Transient("reset".into()),
    );
    let server = TestServer::start(provider).await;
    let id = server.create_session().await;

    let body = server
        .post(&format!("/api/chat/sessions/{id}/messages"))
        .json(&serde_json::json!({ "content": "日" }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    assert!(body.contains("event: error") || body.contains("event:error"));
    let data = data_lines(&body);
    assert_eq!(data[0], r#"{"token":"日"}"#);
    assert!(data[1].contains("reset"));
    assert!(!data.iter().any(|d| d == "[DONE]"));
}

#[tokio::test]
async fn bad_requests_are_rejected() {
    let server = TestServer::start(ScriptedProvider::fragments(&["x"])).await;
    let id = server.create_session().await;

    let blank = server
        .post(&format!("/api/chat/sessions/{id}/messages"))
        .json(&serde_json::json!({ "content": "   " }))
        .send()
        .await
        .unwrap();
    assert_eq!(blank.status(), 400);

    let missing_session = server
        .post("/api/chat/sessions/nope/messages")
        .json(&serde_json::json!({ "content": "東" }))
        .send()
        .await
        .unwrap();
    assert_eq!(missing_session.status(), 404);

    let blank_query = server.get("/api/vocab/search?q=%20").send().await.unwrap();
    assert_eq!(blank_query.status(), 400);
    let no_query = server.get("/api/vocab/search").send().await.unwrap();
    assert_eq!(no_query.status(), 400);
}

#[tokio::test]
async fn vocab_search_is_scoped_to_the_key() {
    let server = TestServer::start(ScriptedProvider::fragments(&[])).await;
    {
        let conn = server.db.lock().unwrap();
        let water = kotoba::vocab::types::Unit::new("水").unwrap();
        let metadata = helpers::meta(&["みず"], &["water"], None);
        vocab::store::upsert_unit(&conn, KEY, &water, &metadata).unwrap();
        vocab::store::upsert_unit(&conn, "kt_someone_else", &water, &metadata).unwrap();
    }

    let found: Value = server.get("/api/vocab/search?q=WATER").send().await.unwrap().json().await.unwrap();
    let found = found.as_array().unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0]["character"], "水");
    assert_eq!(found[0]["occurrenceCount"], 1);
    assert!(found[0]["jlptLevel"].is_null());
}
