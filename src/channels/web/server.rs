//! Axum HTTP server for the conversation API.
//!
//! Handles auth, chat, sessions, mistakes, analytics, debug and health
//! routes. Handlers only translate between HTTP and the service layer.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{HeaderValue, Method, StatusCode, header},
    middleware,
    response::IntoResponse,
    routing::{get, post, put},
};
use chrono::Utc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{AllowHeaders, AllowOrigin, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::auth::{AuthUser, PasswordHasher, TokenSigner};
use crate::channels::web::auth::auth_middleware;
use crate::channels::web::errors::ApiError;
use crate::channels::web::types::*;
use crate::config::Config;
use crate::db::Database;
use crate::error::ChannelError;
use crate::service::{
    AccountService, ConversationOrchestrator, ReportingService, SessionService,
};
use crate::upstream::ChatUpstream;

/// Largest accepted request body.
const MAX_BODY_BYTES: usize = 1024 * 1024;
const SERVICE_NAME: &str = "conversation-service";

/// Shared state for all handlers.
pub struct GatewayState {
    pub accounts: AccountService,
    pub sessions: SessionService,
    pub orchestrator: ConversationOrchestrator,
    pub reporting: ReportingService,
    /// Shutdown signal sender, set once the server is running.
    pub shutdown_tx: tokio::sync::RwLock<Option<oneshot::Sender<()>>>,
}

impl GatewayState {
    pub fn new(db: Arc<dyn Database>, upstream: Arc<dyn ChatUpstream>, config: &Config) -> Self {
        let signer = Arc::new(TokenSigner::new(
            config.auth.jwt_secret.clone(),
            config.auth.token_ttl_hours,
        ));
        Self {
            accounts: AccountService::new(
                Arc::clone(&db),
                PasswordHasher::new(config.auth.password_hash_iterations),
                signer,
            ),
            sessions: SessionService::new(Arc::clone(&db)),
            orchestrator: ConversationOrchestrator::new(
                Arc::clone(&db),
                upstream,
                config.upstream.history_limit,
            ),
            reporting: ReportingService::new(db),
            shutdown_tx: tokio::sync::RwLock::new(None),
        }
    }

    /// Ask the server to stop accepting connections and drain.
    pub async fn shutdown(&self) {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(());
        }
    }
}

pub fn router(state: Arc<GatewayState>, cors_origins: &[String]) -> Router {
    // Public routes (no auth)
    let public = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/auth/register", post(register_handler))
        .route("/auth/login", post(login_handler));

    // Protected routes (require a bearer token)
    let protected = Router::new()
        .route("/auth/me", get(me_handler).put(update_me_handler))
        .route("/auth/logout", post(logout_handler))
        // Chat
        .route("/chat", post(chat_handler))
        .route("/chat/history/{session_id}", get(history_handler))
        // Sessions
        .route("/session", post(create_session_handler))
        .route(
            "/session/{session_id}",
            get(get_session_handler)
                .patch(update_session_handler)
                .delete(delete_session_handler),
        )
        .route("/session/{session_id}/replay", get(replay_handler))
        .route(
            "/sessions",
            get(list_sessions_handler).delete(delete_all_sessions_handler),
        )
        // Mistakes
        .route("/message/{message_id}/mistake", put(mark_mistake_handler))
        .route("/message/mistakes", get(list_mistakes_handler))
        // Analytics
        .route("/analytics/tokens", get(token_analytics_handler))
        .route("/analytics/compare", post(compare_handler))
        // Debug
        .route("/debug/metadata/{message_id}", get(debug_metadata_handler))
        .route("/debug/events/{session_id}", get(debug_events_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth_middleware,
        ));

    let cors = cors_layer(cors_origins);

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(cors)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// CORS for the configured origins. `*` opens the API to any origin
/// without credentials; unparseable entries are skipped.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
        ])
        .allow_headers(AllowHeaders::list([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
        ]));

    if origins.iter().any(|origin| origin.trim() == "*") {
        return base.allow_origin(AllowOrigin::any());
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.trim().parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(%origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    base.allow_origin(AllowOrigin::list(parsed))
        .allow_credentials(true)
}

/// Start the HTTP server.
///
/// Returns the actual bound `SocketAddr` (useful when binding to port 0)
/// and the server task, which finishes once in-flight requests have drained
/// after [`GatewayState::shutdown`].
pub async fn start_server(
    addr: SocketAddr,
    state: Arc<GatewayState>,
    cors_origins: &[String],
) -> Result<(SocketAddr, JoinHandle<()>), ChannelError> {
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        ChannelError::StartupFailed {
            name: "http".to_string(),
            reason: format!("Failed to bind to {}: {}", addr, e),
        }
    })?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| ChannelError::StartupFailed {
            name: "http".to_string(),
            reason: format!("Failed to get local addr: {}", e),
        })?;

    let app = router(Arc::clone(&state), cors_origins);

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    *state.shutdown_tx.write().await = Some(shutdown_tx);

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("HTTP server draining");
            })
            .await
        {
            tracing::error!("HTTP server error: {}", e);
        }
    });

    tracing::info!(addr = %bound_addr, "HTTP server listening");
    Ok((bound_addr, handle))
}

// --- Health ---

async fn root_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now(),
        service: SERVICE_NAME,
    })
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        timestamp: Utc::now(),
        service: SERVICE_NAME,
    })
}

// --- Auth ---

async fn register_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let response = state
        .accounts
        .register(&req.email, &req.password, &req.name)
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

async fn login_handler(
    State(state): State<Arc<GatewayState>>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.accounts.login(&req.email, &req.password).await?))
}

async fn me_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.accounts.me(&user).await?))
}

async fn update_me_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let updated = state
        .accounts
        .update_profile(&user, req.name.as_deref(), req.avatar_url.as_deref())
        .await?;
    Ok(Json(updated))
}

async fn logout_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
) -> Json<StatusResponse> {
    state.accounts.logout(&user);
    Json(StatusResponse {
        status: "ok",
        message: "Logged out; discard the access token",
    })
}

// --- Chat ---

async fn chat_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let turn = state
        .orchestrator
        .send_message(&user, &req.message, req.session_id)
        .await?;
    Ok(Json(turn))
}

async fn history_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let history = state
        .orchestrator
        .history(&user, session_id, query.limit)
        .await?;
    Ok(Json(history))
}

// --- Sessions ---

async fn create_session_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<impl IntoResponse, ApiError> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    let session = state.sessions.create(&user, req.title.as_deref()).await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.sessions.get(&user, session_id).await?))
}

async fn list_sessions_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<ListSessionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let sessions = state
        .sessions
        .list(&user, query.limit, query.include_archived)
        .await?;
    Ok(Json(SessionListResponse {
        total: sessions.len(),
        sessions,
    }))
}

async fn update_session_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
    Json(req): Json<UpdateSessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .sessions
        .update(&user, session_id, req.title.as_deref(), req.archived)
        .await?;
    Ok(Json(session))
}

async fn delete_session_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    state.sessions.delete(&user, session_id).await?;
    Ok(Json(SessionDeletedResponse {
        status: "deleted",
        session_id,
    }))
}

async fn delete_all_sessions_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state.sessions.delete_all(&user).await?;
    Ok(Json(SessionsDeletedResponse {
        status: "deleted",
        deleted,
    }))
}

async fn replay_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.reporting.replay(&user, session_id).await?))
}

// --- Mistakes ---

async fn mark_mistake_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Path(message_id): Path<Uuid>,
    Json(req): Json<MarkMistakeRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let message = state
        .sessions
        .mark_mistake(&user, message_id, req.is_mistake, req.note.as_deref())
        .await?;
    Ok(Json(message))
}

async fn list_mistakes_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Query(query): Query<MistakesQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let mistakes = state.sessions.list_mistakes(&user, query.limit).await?;
    Ok(Json(MistakesListResponse {
        total: mistakes.len(),
        mistakes,
    }))
}

// --- Analytics ---

async fn token_analytics_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.reporting.token_analytics(&user).await?))
}

async fn compare_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Json(req): Json<CompareRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let report = state
        .reporting
        .compare(&user, req.session_id_1, req.session_id_2)
        .await?;
    Ok(Json(report))
}

// --- Debug ---

async fn debug_metadata_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Path(message_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(state.sessions.message_metadata(&user, message_id).await?))
}

async fn debug_events_handler(
    State(state): State<Arc<GatewayState>>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let events = state.sessions.session_events(&user, session_id).await?;
    Ok(Json(EventListResponse {
        session_id,
        total: events.len(),
        events,
    }))
}
