use std::{net::SocketAddr, sync::Arc};

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::Value;
use server_api::{
    delete_document, get_document, load_media, login_user, put_document, query_documents,
    register_user, store_media, ApiContext, LoginThrottle, TokenSigner,
};
use shared::{
    domain::{FileId, User, UserId},
    error::{ApiError, ErrorCode},
    protocol::{LoginRequest, RegisterRequest, SessionResponse},
};
use storage::Storage;
use tower_http::limit::RequestBodyLimitLayer;
use tracing::{error, info};
use uuid::Uuid;

mod config;

use config::{load_settings, prepare_database_url};

const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
struct AppState {
    api: ApiContext,
    throttle: Arc<LoginThrottle>,
    public_base_url: String,
}

type ApiFailure = (StatusCode, Json<ApiError>);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::new(&database_url).await.map_err(|error| {
        error!(
            %database_url,
            %error,
            "failed to open SQLite database; verify parent directory exists and permissions are correct"
        );
        error
    })?;

    let api = ApiContext {
        storage,
        tokens: TokenSigner::new(settings.auth_token_secret, settings.auth_token_ttl_seconds),
    };
    let public_base_url = settings
        .public_base_url
        .clone()
        .unwrap_or_else(|| format!("http://{}", settings.server_bind));
    let state = AppState {
        api,
        throttle: Arc::new(LoginThrottle::default()),
        public_base_url,
    };
    let app = build_router(Arc::new(state));

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "server listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/register", post(auth_register))
        .route("/auth/login", post(auth_login))
        .route("/auth/logout", post(auth_logout))
        .route("/docs/:collection", get(docs_query))
        .route(
            "/docs/:collection/:id",
            put(docs_put).get(docs_get).delete(docs_delete),
        )
        .route("/media/upload", post(media_upload))
        .route("/media/:file_id", get(media_download))
        .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES))
        .with_state(state)
}

fn http_status(code: ErrorCode) -> StatusCode {
    match code {
        ErrorCode::Unauthorized | ErrorCode::InvalidCredentials => StatusCode::UNAUTHORIZED,
        ErrorCode::Forbidden => StatusCode::FORBIDDEN,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation | ErrorCode::WeakPassword | ErrorCode::InvalidEmail => {
            StatusCode::BAD_REQUEST
        }
        ErrorCode::EmailInUse => StatusCode::CONFLICT,
        ErrorCode::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn failure(err: ApiError) -> ApiFailure {
    (http_status(err.code), Json(err))
}

fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<User, ApiFailure> {
    let token = bearer_token(headers).ok_or_else(|| {
        failure(ApiError::new(
            ErrorCode::Unauthorized,
            "missing bearer token",
        ))
    })?;
    state.api.tokens.verify(token).map_err(failure)
}

async fn healthz(State(state): State<Arc<AppState>>) -> Result<&'static str, ApiFailure> {
    state
        .api
        .storage
        .health_check()
        .await
        .map_err(|err| failure(ApiError::new(ErrorCode::Internal, err.to_string())))?;
    Ok("ok")
}

async fn auth_register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<SessionResponse>, ApiFailure> {
    register_user(&state.api, &req.email, &req.password, &req.display_name)
        .await
        .map(Json)
        .map_err(failure)
}

async fn auth_login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<SessionResponse>, ApiFailure> {
    login_user(&state.api, &state.throttle, &req.email, &req.password)
        .await
        .map(Json)
        .map_err(failure)
}

async fn auth_logout(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiFailure> {
    authenticate(&state, &headers)?;
    // Bearer tokens are stateless; logout is the client discarding its copy.
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct OwnerQuery {
    owner: Option<Uuid>,
}

async fn docs_query(
    State(state): State<Arc<AppState>>,
    Path(collection): Path<String>,
    Query(query): Query<OwnerQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<Value>>, ApiFailure> {
    let user = authenticate(&state, &headers)?;
    query_documents(&state.api, &user, &collection, query.owner.map(UserId))
        .await
        .map(Json)
        .map_err(failure)
}

async fn docs_put(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(doc): Json<Value>,
) -> Result<StatusCode, ApiFailure> {
    let user = authenticate(&state, &headers)?;
    put_document(&state.api, &user, &collection, &id, doc)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure)
}

async fn docs_get(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<Json<Value>, ApiFailure> {
    let user = authenticate(&state, &headers)?;
    match get_document(&state.api, &user, &collection, &id)
        .await
        .map_err(failure)?
    {
        Some(doc) => Ok(Json(doc)),
        None => Err(failure(ApiError::new(
            ErrorCode::NotFound,
            "document not found",
        ))),
    }
}

async fn docs_delete(
    State(state): State<Arc<AppState>>,
    Path((collection, id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiFailure> {
    let user = authenticate(&state, &headers)?;
    delete_document(&state.api, &user, &collection, &id)
        .await
        .map(|_| StatusCode::NO_CONTENT)
        .map_err(failure)
}

#[derive(Debug, Deserialize)]
struct MediaUploadQuery {
    folder: String,
    filename: String,
    content_type: String,
}

async fn media_upload(
    State(state): State<Arc<AppState>>,
    Query(query): Query<MediaUploadQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, ApiFailure> {
    let user = authenticate(&state, &headers)?;
    if body.is_empty() {
        return Err(failure(ApiError::new(
            ErrorCode::Validation,
            "upload body cannot be empty",
        )));
    }

    store_media(
        &state.api,
        &user,
        &query.folder,
        &query.filename,
        &query.content_type,
        &body,
        &state.public_base_url,
    )
    .await
    .map(Json)
    .map_err(failure)
}

async fn media_download(
    State(state): State<Arc<AppState>>,
    Path(file_id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiFailure> {
    let Some(file) = load_media(&state.api, FileId(file_id))
        .await
        .map_err(failure)?
    else {
        return Err(failure(ApiError::new(ErrorCode::NotFound, "file not found")));
    };

    let content_type = HeaderValue::from_str(&file.content_type)
        .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream"));
    Ok(([(header::CONTENT_TYPE, content_type)], file.bytes))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
