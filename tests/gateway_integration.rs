//! End-to-end tests for the HTTP API.
//!
//! Each test starts a stand-in AI Core on a random port, a gateway backed by
//! a temporary libSQL file on another, and drives both through reqwest.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::{Json, Router, routing::get, routing::post};
use reqwest::StatusCode;
use secrecy::SecretString;
use serde_json::{Value, json};

use conversation_service::channels::web::server::{GatewayState, start_server};
use conversation_service::config::{AuthConfig, Config, DatabaseConfig, ServerConfig, UpstreamConfig};
use conversation_service::db::Database;
use conversation_service::db::libsql::LibSqlBackend;
use conversation_service::upstream::{AiCoreClient, ChatUpstream};

const PASSWORD: &str = "correct horse battery";

// --- Stand-in AI Core ---

async fn fake_chat(State(turns): State<Arc<AtomicU32>>, Json(body): Json<Value>) -> Json<Value> {
    let n = turns.fetch_add(1, Ordering::SeqCst) + 1;
    let message = body["message"].as_str().unwrap_or_default().to_string();
    let session_id = body["session_id"]
        .as_str()
        .map(str::to_string)
        .unwrap_or_else(|| format!("ai-{n}"));

    let metadata = if message == "break the metadata" {
        json!({"signal_strength": "very strong"})
    } else {
        json!({
            "persona_used": if n % 2 == 0 { "Technical + Precise" } else { "Casual + Normal" },
            "tone": "casual",
            "behavior": "normal",
            "signal_strength": 0.5,
            "confidence": 0.75,
            "model_info": {
                "model_name": "stub-model",
                "usage": {"prompt_tokens": 10, "completion_tokens": 5}
            }
        })
    };
    Json(json!({
        "response": format!("echo: {message}"),
        "session_id": session_id,
        "metadata": metadata,
    }))
}

async fn fake_history(Path(session_id): Path<String>) -> Json<Value> {
    Json(json!({
        "session_id": session_id,
        "messages": [
            {"role": "user", "content": "from before", "timestamp": "2024-05-01T10:00:00Z"},
            {"role": "assistant", "content": "remembered", "metadata": {"tone": "casual"}},
            {"role": "system", "content": "ignored"}
        ]
    }))
}

async fn start_fake_ai_core() -> SocketAddr {
    let app = Router::new()
        .route("/chat", post(fake_chat))
        .route("/chat/history/{session_id}", get(fake_history))
        .with_state(Arc::new(AtomicU32::new(0)));
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

// --- Gateway ---

struct TestGateway {
    base: String,
    http: reqwest::Client,
    state: Arc<GatewayState>,
    _tmpdir: tempfile::TempDir,
}

fn test_config(upstream_url: String) -> Config {
    Config {
        log_level: "debug".to_string(),
        log_json: false,
        database: DatabaseConfig {
            path: "unused.db".into(),
            libsql_url: None,
            libsql_auth_token: None,
        },
        upstream: UpstreamConfig {
            url: upstream_url,
            timeout: Duration::from_secs(5),
            history_limit: 50,
        },
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_origins: vec!["http://localhost:5173".to_string()],
        },
        auth: AuthConfig {
            jwt_secret: SecretString::from("integration-secret-0123456789abcdef".to_string()),
            token_ttl_hours: 1,
            password_hash_iterations: 1_000,
        },
    }
}

async fn start_gateway(upstream_url: String) -> TestGateway {
    let tmpdir = tempfile::tempdir().unwrap();
    let backend = LibSqlBackend::new_local(&tmpdir.path().join("gateway.db"))
        .await
        .unwrap();
    backend.run_migrations().await.unwrap();
    let db: Arc<dyn Database> = Arc::new(backend);

    let config = test_config(upstream_url);
    let upstream: Arc<dyn ChatUpstream> =
        Arc::new(AiCoreClient::new(&config.upstream.url, config.upstream.timeout).unwrap());
    let state = Arc::new(GatewayState::new(db, upstream, &config));
    let (addr, _handle) = start_server(
        "127.0.0.1:0".parse().unwrap(),
        Arc::clone(&state),
        &config.server.cors_origins,
    )
    .await
    .unwrap();

    TestGateway {
        base: format!("http://{addr}"),
        http: reqwest::Client::new(),
        state,
        _tmpdir: tmpdir,
    }
}

impl TestGateway {
    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn register(&self, email: &str, name: &str) -> String {
        let resp = self
            .http
            .post(self.url("/auth/register"))
            .json(&json!({"email": email, "password": PASSWORD, "name": name}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body: Value = resp.json().await.unwrap();
        body["access_token"].as_str().unwrap().to_string()
    }

    async fn get(&self, token: &str, path: &str) -> reqwest::Response {
        self.http
            .get(self.url(path))
            .bearer_auth(token)
            .send()
            .await
            .unwrap()
    }

    async fn post(&self, token: &str, path: &str, body: Value) -> reqwest::Response {
        self.http
            .post(self.url(path))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .unwrap()
    }

    async fn chat(&self, token: &str, message: &str, session_id: Option<&str>) -> Value {
        let mut body = json!({"message": message});
        if let Some(id) = session_id {
            body["session_id"] = json!(id);
        }
        let resp = self.post(token, "/chat", body).await;
        assert_eq!(resp.status(), StatusCode::OK);
        resp.json().await.unwrap()
    }
}

async fn gateway_with_fake_ai_core() -> TestGateway {
    let ai = start_fake_ai_core().await;
    start_gateway(format!("http://{ai}")).await
}

// --- Tests ---

#[tokio::test]
async fn health_endpoints_are_public() {
    let gw = gateway_with_fake_ai_core().await;

    let resp = gw.http.get(gw.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "healthy");
    assert_eq!(body["service"], "conversation-service");

    let body: Value = gw.http.get(gw.url("/")).send().await.unwrap().json().await.unwrap();
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn protected_routes_require_a_bearer_token() {
    let gw = gateway_with_fake_ai_core().await;

    let resp = gw.http.get(gw.url("/sessions")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(resp.headers()["www-authenticate"], "Bearer");

    let resp = gw.get("not-a-token", "/auth/me").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "UNAUTHORIZED");
}

#[tokio::test]
async fn register_login_and_profile() {
    let gw = gateway_with_fake_ai_core().await;
    gw.register("Alice@Example.com", "Alice").await;

    // Duplicate e-mail, case-insensitively.
    let resp = gw
        .http
        .post(gw.url("/auth/register"))
        .json(&json!({"email": "alice@example.com", "password": PASSWORD, "name": "Other"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CONFLICT);

    let resp = gw
        .http
        .post(gw.url("/auth/login"))
        .json(&json!({"email": "alice@example.com", "password": "wrong password"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = gw
        .http
        .post(gw.url("/auth/login"))
        .json(&json!({"email": "alice@example.com", "password": PASSWORD}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let login: Value = resp.json().await.unwrap();
    assert_eq!(login["token_type"], "bearer");
    assert!(login["user"].get("password_hash").is_none());
    let token = login["access_token"].as_str().unwrap();

    let resp = gw
        .http
        .put(gw.url("/auth/me"))
        .bearer_auth(token)
        .json(&json!({"name": "Alice Liddell"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let me: Value = gw.get(token, "/auth/me").await.json().await.unwrap();
    assert_eq!(me["email"], "alice@example.com");
    assert_eq!(me["name"], "Alice Liddell");
    assert!(!me["last_login_at"].is_null());
}

#[tokio::test]
async fn chat_turns_are_persisted_and_replayable() {
    let gw = gateway_with_fake_ai_core().await;
    let token = gw.register("alice@example.com", "Alice").await;

    let first = gw.chat(&token, "hello", None).await;
    assert_eq!(first["response"], "echo: hello");
    assert_eq!(first["ai_session_id"], "ai-1");
    let session_id = first["session_id"].as_str().unwrap().to_string();

    let second = gw.chat(&token, "again", Some(&session_id)).await;
    assert_eq!(second["session_id"], session_id.as_str());
    assert_eq!(second["ai_session_id"], "ai-1");

    let history: Value = gw
        .get(&token, &format!("/chat/history/{session_id}"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(history["source"], "local");
    let roles: Vec<&str> = history["messages"]
        .as_array()
        .unwrap()
        .iter()
        .map(|m| m["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, ["user", "assistant", "user", "assistant"]);

    let session: Value = gw
        .get(&token, &format!("/session/{session_id}"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(session["message_count"], 4);

    let replay: Value = gw
        .get(&token, &format!("/session/{session_id}/replay"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(replay["message_count"], 4);
    assert_eq!(replay["messages"][0]["delay_ms"], 0);

    // The persona changed between the two assistant replies.
    let events: Value = gw
        .get(&token, &format!("/debug/events/{session_id}"))
        .await
        .json()
        .await
        .unwrap();
    let kinds: Vec<&str> = events["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["event_type"].as_str().unwrap())
        .collect();
    assert!(kinds.contains(&"persona_switch"), "events: {kinds:?}");

    let analytics: Value = gw.get(&token, "/analytics/tokens").await.json().await.unwrap();
    assert_eq!(analytics["overall"]["total_prompt_tokens"], 20);
    assert_eq!(analytics["overall"]["total_completion_tokens"], 10);
    assert_eq!(analytics["overall"]["message_count"], 2);
}

#[tokio::test]
async fn invalid_upstream_metadata_is_rejected_without_persisting() {
    let gw = gateway_with_fake_ai_core().await;
    let token = gw.register("alice@example.com", "Alice").await;

    let resp = gw
        .post(&token, "/chat", json!({"message": "break the metadata"}))
        .await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let sessions: Value = gw.get(&token, "/sessions").await.json().await.unwrap();
    assert_eq!(sessions["total"], 0);
}

#[tokio::test]
async fn empty_chat_message_is_a_validation_error() {
    let gw = gateway_with_fake_ai_core().await;
    let token = gw.register("alice@example.com", "Alice").await;

    let resp = gw.post(&token, "/chat", json!({"message": "   "})).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "VALIDATION_ERROR");
}

#[tokio::test]
async fn foreign_sessions_are_forbidden_and_unknown_ones_missing() {
    let gw = gateway_with_fake_ai_core().await;
    let alice = gw.register("alice@example.com", "Alice").await;
    let bob = gw.register("bob@example.com", "Bob").await;

    let turn = gw.chat(&alice, "secret plans", None).await;
    let session_id = turn["session_id"].as_str().unwrap();
    let message_id = turn["message_id"].as_str().unwrap();

    let resp = gw.get(&bob, &format!("/session/{session_id}")).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = gw.get(&bob, &format!("/chat/history/{session_id}")).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = gw.get(&bob, &format!("/debug/metadata/{message_id}")).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let resp = gw
        .post(&bob, "/chat", json!({"message": "let me in", "session_id": session_id}))
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let unknown = uuid::Uuid::new_v4();
    let resp = gw.get(&bob, &format!("/session/{unknown}")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = gw.get(&bob, "/session/not-a-uuid").await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    // Bob's session list does not leak Alice's work.
    let sessions: Value = gw.get(&bob, "/sessions").await.json().await.unwrap();
    assert_eq!(sessions["total"], 0);
}

#[tokio::test]
async fn session_lifecycle() {
    let gw = gateway_with_fake_ai_core().await;
    let token = gw.register("alice@example.com", "Alice").await;

    let resp = gw.post(&token, "/session", json!({"title": "Planning"})).await;
    assert_eq!(resp.status(), StatusCode::CREATED);
    let session: Value = resp.json().await.unwrap();
    let id = session["id"].as_str().unwrap().to_string();
    assert_eq!(session["title"], "Planning");
    assert_eq!(session["message_count"], 0);

    // Empty local history falls back to AI Core; unknown roles are dropped.
    let history: Value = gw
        .get(&token, &format!("/chat/history/{id}"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(history["source"], "upstream");
    assert_eq!(history["messages"].as_array().unwrap().len(), 2);
    assert_eq!(history["messages"][0]["content"], "from before");

    let resp = gw
        .http
        .patch(gw.url(&format!("/session/{id}")))
        .bearer_auth(&token)
        .json(&json!({"archived": true}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let listed: Value = gw.get(&token, "/sessions").await.json().await.unwrap();
    assert_eq!(listed["total"], 0);
    let listed: Value = gw
        .get(&token, "/sessions?include_archived=true")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(listed["total"], 1);

    let resp = gw
        .http
        .delete(gw.url(&format!("/session/{id}")))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let resp = gw.get(&token, &format!("/session/{id}")).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn delete_all_sessions_reports_count() {
    let gw = gateway_with_fake_ai_core().await;
    let token = gw.register("alice@example.com", "Alice").await;
    gw.chat(&token, "one", None).await;
    gw.chat(&token, "two", None).await;

    let resp = gw
        .http
        .delete(gw.url("/sessions"))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["deleted"], 2);

    let analytics: Value = gw.get(&token, "/analytics/tokens").await.json().await.unwrap();
    assert_eq!(analytics["overall"]["message_count"], 0);
}

#[tokio::test]
async fn mistakes_can_be_marked_and_listed() {
    let gw = gateway_with_fake_ai_core().await;
    let token = gw.register("alice@example.com", "Alice").await;
    let turn = gw.chat(&token, "what is 2 + 2", None).await;
    let message_id = turn["message_id"].as_str().unwrap();

    let resp = gw
        .http
        .put(gw.url(&format!("/message/{message_id}/mistake")))
        .bearer_auth(&token)
        .json(&json!({"note": "  said five  "}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let marked: Value = resp.json().await.unwrap();
    assert_eq!(marked["is_mistake"], true);
    assert_eq!(marked["mistake_note"], "said five");

    let listed: Value = gw.get(&token, "/message/mistakes").await.json().await.unwrap();
    assert_eq!(listed["total"], 1);
    assert_eq!(listed["mistakes"][0]["id"], message_id);

    let meta: Value = gw
        .get(&token, &format!("/debug/metadata/{message_id}"))
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(meta["role"], "assistant");
}

#[tokio::test]
async fn compare_names_the_failing_side() {
    let gw = gateway_with_fake_ai_core().await;
    let alice = gw.register("alice@example.com", "Alice").await;
    let bob = gw.register("bob@example.com", "Bob").await;

    let a1 = gw.chat(&alice, "first", None).await;
    let a2 = gw.chat(&alice, "second", None).await;
    let b1 = gw.chat(&bob, "mine", None).await;

    let resp = gw
        .post(
            &alice,
            "/analytics/compare",
            json!({"session_id_1": a1["session_id"], "session_id_2": a2["session_id"]}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let report: Value = resp.json().await.unwrap();
    assert_eq!(report["session_1"]["message_count"], 2);
    assert_eq!(report["session_1"]["model_used"], "stub-model");

    let resp = gw
        .post(
            &alice,
            "/analytics/compare",
            json!({"session_id_1": a1["session_id"], "session_id_2": b1["session_id"]}),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["message"], "Not authorized to access session 2");
}

#[tokio::test]
async fn unreachable_ai_core_maps_to_service_unavailable() {
    // Bind then drop to get a port nothing listens on.
    let closed = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let gw = start_gateway(format!("http://{closed}")).await;
    let token = gw.register("alice@example.com", "Alice").await;

    let resp = gw.post(&token, "/chat", json!({"message": "anyone there?"})).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["code"], "UPSTREAM_UNREACHABLE");

    let sessions: Value = gw.get(&token, "/sessions").await.json().await.unwrap();
    assert_eq!(sessions["total"], 0);
}

#[tokio::test]
async fn shutdown_stops_accepting_requests() {
    let gw = gateway_with_fake_ai_core().await;
    let resp = gw.http.get(gw.url("/health")).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    gw.state.shutdown().await;
    // A second call is a no-op.
    gw.state.shutdown().await;

    let mut refused = false;
    for _ in 0..50 {
        let fresh = reqwest::Client::new();
        if fresh.get(gw.url("/health")).send().await.is_err() {
            refused = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(refused, "server kept accepting connections after shutdown");
}
