use super::*;
use std::{collections::HashMap, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post, put},
    Json, Router,
};
use shared::domain::{User, UserId};
use tokio::{net::TcpListener, sync::Mutex};

async fn spawn_server(router: Router) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{addr}")
}

async fn attached_session() -> Arc<SessionContext> {
    let session = SessionContext::new();
    session
        .attach(AuthSession {
            user: User {
                id: UserId::generate(),
                email: "alice@example.com".to_string(),
                name: "Alice".to_string(),
            },
            token: "session-token".to_string(),
        })
        .await;
    session
}

#[test]
fn api_error_codes_map_onto_the_auth_taxonomy() {
    let cases = [
        (ErrorCode::InvalidCredentials, AuthError::InvalidCredentials),
        (ErrorCode::Unauthorized, AuthError::InvalidCredentials),
        (ErrorCode::EmailInUse, AuthError::EmailInUse),
        (ErrorCode::WeakPassword, AuthError::WeakPassword),
        (ErrorCode::InvalidEmail, AuthError::InvalidEmail),
        (ErrorCode::RateLimited, AuthError::TooManyAttempts),
    ];
    for (code, expected) in cases {
        assert_eq!(AuthError::from_api(&ApiError::new(code, "detail")), expected);
    }
    assert!(matches!(
        AuthError::from_api(&ApiError::new(ErrorCode::Internal, "boom")),
        AuthError::Unavailable(message) if message == "boom"
    ));
}

#[tokio::test]
async fn sign_in_success_yields_the_server_issued_session() {
    let router = Router::new().route(
        "/auth/login",
        post(|| async {
            Json(SessionResponse {
                user: User {
                    id: UserId::generate(),
                    email: "alice@example.com".to_string(),
                    name: "Alice".to_string(),
                },
                token: "issued-token".to_string(),
            })
        }),
    );
    let base_url = spawn_server(router).await;

    let provider = HttpIdentityProvider::new(reqwest::Client::new(), &base_url);
    let session = provider
        .sign_in("alice@example.com", "hunter22")
        .await
        .expect("sign in");
    assert_eq!(session.token, "issued-token");
    assert_eq!(session.user.name, "Alice");
}

#[tokio::test]
async fn sign_in_rejection_maps_the_wire_error_code() {
    let router = Router::new().route(
        "/auth/login",
        post(|| async {
            (
                StatusCode::UNAUTHORIZED,
                Json(ApiError::new(
                    ErrorCode::InvalidCredentials,
                    "invalid email or password",
                )),
            )
        }),
    );
    let base_url = spawn_server(router).await;

    let provider = HttpIdentityProvider::new(reqwest::Client::new(), &base_url);
    let err = provider
        .sign_in("alice@example.com", "wrong")
        .await
        .expect_err("must fail");
    assert_eq!(err, AuthError::InvalidCredentials);
}

#[tokio::test]
async fn sign_up_conflict_maps_to_email_in_use() {
    let router = Router::new().route(
        "/auth/register",
        post(|| async {
            (
                StatusCode::CONFLICT,
                Json(ApiError::new(ErrorCode::EmailInUse, "email already in use")),
            )
        }),
    );
    let base_url = spawn_server(router).await;

    let provider = HttpIdentityProvider::new(reqwest::Client::new(), &base_url);
    let err = provider
        .sign_up("alice@example.com", "hunter22", "Alice")
        .await
        .expect_err("must fail");
    assert_eq!(err, AuthError::EmailInUse);
}

type DocMap = Arc<Mutex<HashMap<String, Value>>>;

fn docs_router(docs: DocMap) -> Router {
    async fn put_doc(
        State(docs): State<DocMap>,
        Path((collection, id)): Path<(String, String)>,
        Json(doc): Json<Value>,
    ) -> StatusCode {
        docs.lock().await.insert(format!("{collection}/{id}"), doc);
        StatusCode::NO_CONTENT
    }

    async fn get_doc(
        State(docs): State<DocMap>,
        Path((collection, id)): Path<(String, String)>,
    ) -> Result<Json<Value>, (StatusCode, Json<ApiError>)> {
        if collection == "forbidden" {
            return Err((
                StatusCode::FORBIDDEN,
                Json(ApiError::new(
                    ErrorCode::Forbidden,
                    "document belongs to another user",
                )),
            ));
        }
        match docs.lock().await.get(&format!("{collection}/{id}")) {
            Some(doc) => Ok(Json(doc.clone())),
            None => Err((
                StatusCode::NOT_FOUND,
                Json(ApiError::new(ErrorCode::NotFound, "document not found")),
            )),
        }
    }

    async fn query_docs(
        State(docs): State<DocMap>,
        Path(collection): Path<String>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Json<Vec<Value>> {
        let prefix = format!("{collection}/");
        let docs = docs.lock().await;
        let mut matched: Vec<Value> = docs
            .iter()
            .filter(|(key, _)| key.starts_with(&prefix))
            .map(|(_, doc)| doc.clone())
            .collect();
        // Echo the owner filter so the test can observe it arrived.
        if let Some(owner) = params.get("owner") {
            matched.push(serde_json::json!({ "echoed_owner": owner }));
        }
        Json(matched)
    }

    async fn delete_doc(
        State(docs): State<DocMap>,
        Path((collection, id)): Path<(String, String)>,
    ) -> StatusCode {
        docs.lock().await.remove(&format!("{collection}/{id}"));
        StatusCode::NO_CONTENT
    }

    Router::new()
        .route("/docs/:collection", get(query_docs))
        .route(
            "/docs/:collection/:id",
            put(put_doc).get(get_doc).delete(delete_doc),
        )
        .with_state(docs)
}

#[tokio::test]
async fn document_store_round_trips_and_maps_missing_to_none() {
    let docs: DocMap = Arc::new(Mutex::new(HashMap::new()));
    let base_url = spawn_server(docs_router(Arc::clone(&docs))).await;
    let store =
        HttpDocumentStore::new(reqwest::Client::new(), &base_url, attached_session().await);

    let doc = serde_json::json!({ "name": "Acme" });
    store
        .put("companies", "one", doc.clone())
        .await
        .expect("put");
    assert_eq!(store.get("companies", "one").await.expect("get"), Some(doc));
    assert_eq!(store.get("companies", "missing").await.expect("get"), None);

    store.delete("companies", "one").await.expect("delete");
    assert_eq!(store.get("companies", "one").await.expect("get"), None);
}

#[tokio::test]
async fn document_query_carries_the_owner_filter() {
    let docs: DocMap = Arc::new(Mutex::new(HashMap::new()));
    let base_url = spawn_server(docs_router(docs)).await;
    let store =
        HttpDocumentStore::new(reqwest::Client::new(), &base_url, attached_session().await);

    let owner = UserId::generate();
    let results = store
        .query("companies", Some(owner))
        .await
        .expect("query");
    assert_eq!(
        results,
        vec![serde_json::json!({ "echoed_owner": owner.to_string() })]
    );
}

#[tokio::test]
async fn document_store_surfaces_wire_rejections() {
    let docs: DocMap = Arc::new(Mutex::new(HashMap::new()));
    let base_url = spawn_server(docs_router(docs)).await;
    let store =
        HttpDocumentStore::new(reqwest::Client::new(), &base_url, attached_session().await);

    let err = store
        .get("forbidden", "any")
        .await
        .expect_err("must fail");
    assert!(matches!(
        err,
        StoreError::Rejected { code: ErrorCode::Forbidden, .. }
    ));
}

#[tokio::test]
async fn document_store_requires_a_session() {
    let store = HttpDocumentStore::new(
        reqwest::Client::new(),
        "http://127.0.0.1:9",
        SessionContext::new(),
    );
    let err = store.get("companies", "one").await.expect_err("must fail");
    assert_eq!(err, StoreError::Unauthenticated);
}

#[derive(Debug, serde::Deserialize)]
struct UploadParams {
    folder: String,
    filename: String,
    content_type: String,
}

#[tokio::test]
async fn media_host_posts_bytes_and_returns_the_durable_url() {
    let router = Router::new().route(
        "/media/upload",
        post(
            |Query(params): Query<UploadParams>, body: axum::body::Bytes| async move {
                assert_eq!(params.content_type, "application/pdf");
                assert!(!body.is_empty());
                Json(MediaUploadResponse {
                    file_id: shared::domain::FileId::generate(),
                    url: format!("https://cdn.test/{}/{}", params.folder, params.filename),
                    size_bytes: body.len() as u64,
                })
            },
        ),
    );
    let base_url = spawn_server(router).await;
    let host = HttpMediaHost::new(reqwest::Client::new(), &base_url, attached_session().await);

    let file = CandidateFile {
        name: "january.pdf".to_string(),
        content_type: "application/pdf".to_string(),
        bytes: b"%PDF-1.4".to_vec(),
    };
    let blob = host.store(&file, "Acme").await.expect("store");
    assert_eq!(blob.url, "https://cdn.test/Acme/january.pdf");
}

#[tokio::test]
async fn media_host_error_payload_becomes_a_rejection() {
    let router = Router::new().route(
        "/media/upload",
        post(|| async {
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiError::new(ErrorCode::Internal, "disk full")),
            )
        }),
    );
    let base_url = spawn_server(router).await;
    let host = HttpMediaHost::new(reqwest::Client::new(), &base_url, attached_session().await);

    let file = CandidateFile {
        name: "january.pdf".to_string(),
        content_type: "application/pdf".to_string(),
        bytes: b"%PDF-1.4".to_vec(),
    };
    let err = host.store(&file, "Acme").await.expect_err("must fail");
    assert_eq!(
        err,
        MediaHostError::Rejected {
            status: 500,
            message: "disk full".to_string(),
        }
    );
}

#[tokio::test]
async fn media_host_unreadable_success_body_is_malformed() {
    let router = Router::new().route("/media/upload", post(|| async { "not json" }));
    let base_url = spawn_server(router).await;
    let host = HttpMediaHost::new(reqwest::Client::new(), &base_url, attached_session().await);

    let file = CandidateFile {
        name: "january.pdf".to_string(),
        content_type: "application/pdf".to_string(),
        bytes: b"%PDF-1.4".to_vec(),
    };
    let err = host.store(&file, "Acme").await.expect_err("must fail");
    assert!(matches!(err, MediaHostError::MalformedResponse(_)));
}
