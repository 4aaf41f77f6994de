use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{DefaultBodyLimit, Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    routing::{delete, get, post, put},
    Json, Router,
};
use realtime::{
    auth::{bearer_token, CredentialVerifier},
    DisabledPushGateway, PushGateway, RealtimeContext,
};
use serde::Deserialize;
use shared::{
    domain::{ConversationId, MessageId, UserId},
    error::{ApiError, ErrorCode},
    protocol::{ConversationSummary, MessagePayload},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod api;
mod app_state;
mod auth;
mod config;
mod push;
mod ws;

use api::{AccountResponse, ApiContext, LoginResponse, DEFAULT_PAGE_SIZE, MAX_PAGE_SIZE};
use app_state::AppState;
use auth::{JwtConfig, JwtVerifier};
use config::{load_settings, prepare_database_url};
use push::HttpPushGateway;

type HttpResult<T> = Result<T, (StatusCode, Json<ApiError>)>;

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
}

#[derive(Debug, Deserialize)]
struct StartConversationRequest {
    user_id: i64,
}

#[derive(Debug, Deserialize)]
struct StartGroupRequest {
    name: String,
    user_ids: Vec<i64>,
}

#[derive(Debug, Deserialize)]
struct UpdateProfileRequest {
    first_name: String,
    last_name: String,
    #[serde(default)]
    avatar: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListMessagesQuery {
    limit: Option<u32>,
    before: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct PushTokenRequest {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InConversationRequest {
    in_conversation: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let settings = load_settings().map_err(|error| {
        error!(error = %format!("{error:#}"), "failed to load settings");
        error
    })?;
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let jwt = JwtConfig {
        secret: settings.jwt_secret.clone(),
        ttl_seconds: settings.token_ttl_seconds,
    };
    let push: Arc<dyn PushGateway> = match settings.push_gateway()? {
        Some(endpoint) => {
            info!(%endpoint, "push notifications enabled");
            Arc::new(HttpPushGateway::new(endpoint, settings.push_server_key.clone())?)
        }
        None => {
            warn!("no push gateway configured; notifications are disabled");
            Arc::new(DisabledPushGateway)
        }
    };
    let verifier = JwtVerifier::new(&jwt);
    let realtime = RealtimeContext::new(
        storage.clone(),
        Arc::new(verifier.clone()),
        push,
        settings.limits(),
    );

    let state = AppState {
        api: ApiContext { storage, jwt },
        realtime,
        verifier,
        outbox_capacity: settings.outbox_capacity,
    };
    let app = build_router(Arc::new(state), settings.max_request_bytes);

    let addr: SocketAddr = settings.bind_addr.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, max_request_bytes: usize) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/login", post(login))
        .route(
            "/conversations",
            get(http_list_conversations).post(http_start_conversation),
        )
        .route("/conversations/group", post(http_start_group))
        .route("/conversations/:conversation_id", delete(http_archive_conversation))
        .route("/conversations/:conversation_id/messages", get(http_list_messages))
        .route("/messages/:message_id", delete(http_delete_message))
        .route("/users/me", get(http_account))
        .route("/users/me/profile", put(http_update_profile))
        .route("/users/me/push-token", put(http_set_push_token))
        .route("/users/me/in-conversation", put(http_set_in_conversation))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_request_bytes))
        .with_state(state)
}

fn status_for(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reject(error: ApiError) -> (StatusCode, Json<ApiError>) {
    (status_for(error.code), Json(error))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> HttpResult<UserId> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(bearer_token)
        .ok_or_else(|| {
            reject(ApiError::new(
                ErrorCode::Unauthorized,
                "missing bearer token",
            ))
        })?;
    state
        .verifier
        .verify(token)
        .map_err(|e| reject(ApiError::from(e)))
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, StatusCode> {
    state.api.storage.health_check().await.map_err(|error| {
        warn!(%error, "health check failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;
    Ok("ok")
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> HttpResult<Json<LoginResponse>> {
    let response = api::login(&state.api, &req.username).await.map_err(reject)?;
    info!(user_id = response.user_id, "user logged in");
    Ok(Json(response))
}

async fn http_list_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HttpResult<Json<Vec<ConversationSummary>>> {
    let user_id = authorize(&state, &headers)?;
    let conversations = api::list_conversations(&state.api, user_id)
        .await
        .map_err(reject)?;
    Ok(Json(conversations))
}

async fn http_start_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StartConversationRequest>,
) -> HttpResult<Json<ConversationSummary>> {
    let user_id = authorize(&state, &headers)?;
    let conversation = api::start_private_conversation(&state.api, user_id, UserId(req.user_id))
        .await
        .map_err(reject)?;
    Ok(Json(conversation))
}

async fn http_start_group(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<StartGroupRequest>,
) -> HttpResult<Json<ConversationSummary>> {
    let user_id = authorize(&state, &headers)?;
    let members: Vec<UserId> = req.user_ids.into_iter().map(UserId).collect();
    let conversation = api::start_group_conversation(&state.api, user_id, &req.name, &members)
        .await
        .map_err(reject)?;
    info!(%user_id, conversation_id = %conversation.conversation_id, "group conversation created");
    Ok(Json(conversation))
}

async fn http_archive_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
) -> HttpResult<StatusCode> {
    let user_id = authorize(&state, &headers)?;
    api::archive_conversation(
        &state.api,
        user_id,
        &ConversationId::from(conversation_id.as_str()),
    )
    .await
    .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_delete_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(message_id): Path<i64>,
) -> HttpResult<StatusCode> {
    let user_id = authorize(&state, &headers)?;
    api::delete_message(&state.api, user_id, MessageId(message_id))
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_account(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> HttpResult<Json<AccountResponse>> {
    let user_id = authorize(&state, &headers)?;
    let account = api::account(&state.api, user_id).await.map_err(reject)?;
    Ok(Json(account))
}

async fn http_update_profile(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<UpdateProfileRequest>,
) -> HttpResult<StatusCode> {
    let user_id = authorize(&state, &headers)?;
    api::update_profile(
        &state.api,
        user_id,
        &req.first_name,
        &req.last_name,
        req.avatar.as_deref(),
    )
    .await
    .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_list_messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(conversation_id): Path<String>,
    Query(q): Query<ListMessagesQuery>,
) -> HttpResult<Json<Vec<MessagePayload>>> {
    let user_id = authorize(&state, &headers)?;
    let limit = q.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let messages = api::list_messages(
        &state.api,
        user_id,
        &ConversationId::from(conversation_id.as_str()),
        limit,
        q.before.map(MessageId),
    )
    .await
    .map_err(reject)?;
    Ok(Json(messages))
}

async fn http_set_push_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<PushTokenRequest>,
) -> HttpResult<StatusCode> {
    let user_id = authorize(&state, &headers)?;
    api::set_push_token(&state.api, user_id, req.token.as_deref())
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn http_set_in_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<InConversationRequest>,
) -> HttpResult<StatusCode> {
    let user_id = authorize(&state, &headers)?;
    api::set_in_conversation(&state.api, user_id, req.in_conversation)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
