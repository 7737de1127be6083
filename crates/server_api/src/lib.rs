use std::collections::HashMap;

use chrono::Utc;
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use shared::{
    domain::{plausible_email, FileId, User, UserId, MIN_PASSWORD_LEN},
    error::{ApiError, ErrorCode},
    protocol::{MediaUploadResponse, SessionResponse},
};
use storage::{Storage, StoredFile};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub const MAX_FAILED_LOGINS: u32 = 5;

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    pub tokens: TokenSigner,
}

/// Mints and verifies the HS256 bearer tokens that double as the media
/// host's upload-authorization token.
#[derive(Clone)]
pub struct TokenSigner {
    secret: String,
    ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    email: String,
    name: String,
    exp: i64,
}

impl TokenSigner {
    pub fn new(secret: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl_seconds,
        }
    }

    pub fn mint(&self, user: &User) -> Result<String, ApiError> {
        let claims = Claims {
            sub: user.id.to_string(),
            email: user.email.clone(),
            name: user.name.clone(),
            exp: Utc::now().timestamp() + self.ttl_seconds,
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(internal)
    }

    pub fn verify(&self, token: &str) -> Result<User, ApiError> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| ApiError::new(ErrorCode::Unauthorized, "invalid or expired token"))?;
        let id = Uuid::parse_str(&data.claims.sub)
            .map_err(|_| ApiError::new(ErrorCode::Unauthorized, "invalid token subject"))?;
        Ok(User {
            id: UserId(id),
            email: data.claims.email,
            name: data.claims.name,
        })
    }
}

/// Per-email consecutive-failure counter behind the sign-in endpoint; the
/// counter resets on a successful sign-in.
#[derive(Default)]
pub struct LoginThrottle {
    failures: Mutex<HashMap<String, u32>>,
}

impl LoginThrottle {
    pub async fn allow(&self, email: &str) -> bool {
        self.failures.lock().await.get(email).copied().unwrap_or(0) < MAX_FAILED_LOGINS
    }

    pub async fn record_failure(&self, email: &str) {
        *self
            .failures
            .lock()
            .await
            .entry(email.to_string())
            .or_insert(0) += 1;
    }

    pub async fn reset(&self, email: &str) {
        self.failures.lock().await.remove(email);
    }
}

fn internal(err: impl std::fmt::Display) -> ApiError {
    warn!("internal error: {err}");
    ApiError::new(ErrorCode::Internal, err.to_string())
}

pub async fn register_user(
    ctx: &ApiContext,
    email: &str,
    password: &str,
    display_name: &str,
) -> Result<SessionResponse, ApiError> {
    let email = email.trim().to_ascii_lowercase();
    if !plausible_email(&email) {
        return Err(ApiError::new(ErrorCode::InvalidEmail, "invalid email address"));
    }
    if password.len() < MIN_PASSWORD_LEN {
        return Err(ApiError::new(
            ErrorCode::WeakPassword,
            format!("password must be at least {MIN_PASSWORD_LEN} characters"),
        ));
    }
    let display_name = display_name.trim();
    if display_name.is_empty() {
        return Err(ApiError::new(
            ErrorCode::Validation,
            "display name must not be empty",
        ));
    }

    let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST).map_err(internal)?;
    let Some(stored) = ctx
        .storage
        .create_user(&email, display_name, &password_hash)
        .await
        .map_err(internal)?
    else {
        return Err(ApiError::new(ErrorCode::EmailInUse, "email already in use"));
    };

    let user = User {
        id: stored.id,
        email: stored.email,
        name: stored.display_name,
    };
    let token = ctx.tokens.mint(&user)?;
    Ok(SessionResponse { user, token })
}

pub async fn login_user(
    ctx: &ApiContext,
    throttle: &LoginThrottle,
    email: &str,
    password: &str,
) -> Result<SessionResponse, ApiError> {
    let email = email.trim().to_ascii_lowercase();
    if !throttle.allow(&email).await {
        return Err(ApiError::new(
            ErrorCode::RateLimited,
            "too many failed login attempts",
        ));
    }

    let stored = ctx.storage.user_by_email(&email).await.map_err(internal)?;
    let verified = stored
        .as_ref()
        .map(|user| bcrypt::verify(password, &user.password_hash).unwrap_or(false))
        .unwrap_or(false);
    // Unknown email and wrong password are deliberately indistinguishable.
    let Some(stored) = stored.filter(|_| verified) else {
        throttle.record_failure(&email).await;
        return Err(ApiError::new(
            ErrorCode::InvalidCredentials,
            "invalid email or password",
        ));
    };
    throttle.reset(&email).await;

    let user = User {
        id: stored.id,
        email: stored.email,
        name: stored.display_name,
    };
    let token = ctx.tokens.mint(&user)?;
    Ok(SessionResponse { user, token })
}

pub async fn put_document(
    ctx: &ApiContext,
    user: &User,
    collection: &str,
    id: &str,
    doc: serde_json::Value,
) -> Result<(), ApiError> {
    ctx.storage
        .put_document(collection, id, Some(user.id), &doc)
        .await
        .map_err(internal)
}

pub async fn get_document(
    ctx: &ApiContext,
    user: &User,
    collection: &str,
    id: &str,
) -> Result<Option<serde_json::Value>, ApiError> {
    let Some(stored) = ctx
        .storage
        .get_document(collection, id)
        .await
        .map_err(internal)?
    else {
        return Ok(None);
    };
    if stored.owner_id.is_some_and(|owner| owner != user.id) {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "document belongs to another user",
        ));
    }
    Ok(Some(stored.doc))
}

pub async fn query_documents(
    ctx: &ApiContext,
    user: &User,
    collection: &str,
    owner: Option<UserId>,
) -> Result<Vec<serde_json::Value>, ApiError> {
    let owner = owner.unwrap_or(user.id);
    if owner != user.id {
        return Err(ApiError::new(
            ErrorCode::Forbidden,
            "cannot query another user's documents",
        ));
    }
    let documents = ctx
        .storage
        .list_documents(collection, Some(owner))
        .await
        .map_err(internal)?;
    Ok(documents.into_iter().map(|stored| stored.doc).collect())
}

pub async fn delete_document(
    ctx: &ApiContext,
    user: &User,
    collection: &str,
    id: &str,
) -> Result<(), ApiError> {
    // Deleting something that is not there is not an error, but deleting
    // someone else's record is.
    if let Some(stored) = ctx
        .storage
        .get_document(collection, id)
        .await
        .map_err(internal)?
    {
        if stored.owner_id.is_some_and(|owner| owner != user.id) {
            return Err(ApiError::new(
                ErrorCode::Forbidden,
                "document belongs to another user",
            ));
        }
        ctx.storage
            .delete_document(collection, id)
            .await
            .map_err(internal)?;
    }
    Ok(())
}

pub async fn store_media(
    ctx: &ApiContext,
    user: &User,
    folder: &str,
    filename: &str,
    content_type: &str,
    bytes: &[u8],
    public_base_url: &str,
) -> Result<MediaUploadResponse, ApiError> {
    let file_id = FileId::generate();
    ctx.storage
        .store_file(file_id, user.id, folder, filename, content_type, bytes)
        .await
        .map_err(internal)?;
    Ok(MediaUploadResponse {
        file_id,
        url: format!("{public_base_url}/media/{file_id}"),
        size_bytes: bytes.len() as u64,
    })
}

/// Blob URLs are durable and unauthenticated once issued, so this lookup
/// takes no user.
pub async fn load_media(ctx: &ApiContext, file_id: FileId) -> Result<Option<StoredFile>, ApiError> {
    ctx.storage.load_file(file_id).await.map_err(internal)
}
