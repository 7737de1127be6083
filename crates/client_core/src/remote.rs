use std::sync::Arc;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::Value;
use shared::{
    domain::UserId,
    error::{ApiError, ErrorCode},
    protocol::{LoginRequest, MediaUploadResponse, RegisterRequest, SessionResponse},
};

use crate::{
    error::{AuthError, MediaHostError, StoreError},
    upload::{CandidateFile, StoredBlob},
    AuthSession, DocumentStore, IdentityProvider, MediaHost, SessionContext,
};

/// Identity boundary over the backing service's `/auth` endpoints.
pub struct HttpIdentityProvider {
    http: reqwest::Client,
    base_url: String,
}

impl HttpIdentityProvider {
    pub fn new(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    async fn post_credentials<T: Serialize + Sync>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<AuthSession, AuthError> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;

        if !response.status().is_success() {
            return Err(map_auth_failure(response).await);
        }
        let session: SessionResponse = response
            .json()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;
        Ok(AuthSession {
            user: session.user,
            token: session.token,
        })
    }
}

async fn map_auth_failure(response: reqwest::Response) -> AuthError {
    match response.json::<ApiError>().await {
        Ok(err) => AuthError::from_api(&err),
        Err(err) => AuthError::Unavailable(err.to_string()),
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<AuthSession, AuthError> {
        self.post_credentials(
            "/auth/register",
            &RegisterRequest {
                email: email.to_string(),
                password: password.to_string(),
                display_name: display_name.to_string(),
            },
        )
        .await
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        self.post_credentials(
            "/auth/login",
            &LoginRequest {
                email: email.to_string(),
                password: password.to_string(),
            },
        )
        .await
    }

    async fn sign_out(&self, token: &str) -> Result<(), AuthError> {
        let response = self
            .http
            .post(format!("{}/auth/logout", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;
        if !response.status().is_success() {
            return Err(map_auth_failure(response).await);
        }
        Ok(())
    }
}

/// Document boundary over the backing service's `/docs` endpoints. Every
/// request carries the session's bearer token.
pub struct HttpDocumentStore {
    http: reqwest::Client,
    base_url: String,
    session: Arc<SessionContext>,
}

impl HttpDocumentStore {
    pub fn new(http: reqwest::Client, base_url: &str, session: Arc<SessionContext>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        }
    }

    async fn bearer(&self) -> Result<String, StoreError> {
        self.session.token().await.ok_or(StoreError::Unauthenticated)
    }
}

fn transport(err: reqwest::Error) -> StoreError {
    StoreError::Transport(err.to_string())
}

async fn check_store_status(
    response: reqwest::Response,
) -> Result<reqwest::Response, StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    match response.json::<ApiError>().await {
        Ok(err) => Err(StoreError::Rejected {
            code: err.code,
            message: err.message,
        }),
        Err(_) => Err(StoreError::Rejected {
            code: ErrorCode::Internal,
            message: format!("unexpected status {status}"),
        }),
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .put(format!("{}/docs/{collection}/{id}", self.base_url))
            .bearer_auth(token)
            .json(&doc)
            .send()
            .await
            .map_err(transport)?;
        check_store_status(response).await?;
        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .get(format!("{}/docs/{collection}/{id}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport)?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = check_store_status(response).await?;
        let doc = response.json().await.map_err(transport)?;
        Ok(Some(doc))
    }

    async fn query(
        &self,
        collection: &str,
        owner: Option<UserId>,
    ) -> Result<Vec<Value>, StoreError> {
        let token = self.bearer().await?;
        let mut request = self
            .http
            .get(format!("{}/docs/{collection}", self.base_url))
            .bearer_auth(token);
        if let Some(owner) = owner {
            request = request.query(&[("owner", owner.to_string())]);
        }
        let response = request.send().await.map_err(transport)?;
        let response = check_store_status(response).await?;
        response.json().await.map_err(transport)
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let token = self.bearer().await?;
        let response = self
            .http
            .delete(format!("{}/docs/{collection}/{id}", self.base_url))
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport)?;
        check_store_status(response).await?;
        Ok(())
    }
}

/// Media boundary over the backing service's `/media` endpoints: raw bytes
/// out, durable URL back. Treated as best-effort; any non-success answer is
/// a per-file failure for the pipeline to absorb.
pub struct HttpMediaHost {
    http: reqwest::Client,
    base_url: String,
    session: Arc<SessionContext>,
}

impl HttpMediaHost {
    pub fn new(http: reqwest::Client, base_url: &str, session: Arc<SessionContext>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            session,
        }
    }
}

#[async_trait]
impl MediaHost for HttpMediaHost {
    async fn store(&self, file: &CandidateFile, folder: &str) -> Result<StoredBlob, MediaHostError> {
        let Some(token) = self.session.token().await else {
            return Err(MediaHostError::Rejected {
                status: StatusCode::UNAUTHORIZED.as_u16(),
                message: "missing upload authorization token".to_string(),
            });
        };

        let response = self
            .http
            .post(format!("{}/media/upload", self.base_url))
            .query(&[
                ("folder", folder),
                ("filename", file.name.as_str()),
                ("content_type", file.content_type.as_str()),
            ])
            .bearer_auth(token)
            .body(file.bytes.clone())
            .send()
            .await
            .map_err(|err| MediaHostError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = match response.json::<ApiError>().await {
                Ok(err) => err.message,
                Err(_) => format!("unexpected status {status}"),
            };
            return Err(MediaHostError::Rejected {
                status: status.as_u16(),
                message,
            });
        }

        let uploaded: MediaUploadResponse = response
            .json()
            .await
            .map_err(|err| MediaHostError::MalformedResponse(err.to_string()))?;
        Ok(StoredBlob { url: uploaded.url })
    }
}

#[cfg(test)]
#[path = "tests/remote_tests.rs"]
mod tests;
