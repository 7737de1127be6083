use std::{
    collections::{BTreeMap, HashMap},
    path::PathBuf,
    sync::Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared::domain::{plausible_email, User, UserId, MIN_PASSWORD_LEN};
use tokio::{fs, sync::Mutex};
use url::Url;
use uuid::Uuid;

use crate::{
    error::{AuthError, MediaHostError, StoreError},
    upload::{CandidateFile, StoredBlob},
    AuthSession, DocumentStore, IdentityProvider, MediaHost,
};

const MAX_FAILED_SIGNINS: u32 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LocalUser {
    id: UserId,
    email: String,
    name: String,
    password_hash: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSession {
    user: User,
    token: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct VaultState {
    #[serde(default)]
    collections: BTreeMap<String, BTreeMap<String, Value>>,
    #[serde(default)]
    users: Vec<LocalUser>,
    #[serde(default)]
    session: Option<StoredSession>,
}

/// Single-file JSON persistence for the local build variant: the document
/// collections, the registered users and the current session all live in one
/// vault file that is re-serialized wholesale on every change.
pub struct LocalVault {
    path: PathBuf,
    state: Mutex<VaultState>,
}

impl LocalVault {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Arc<Self>> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.with_context(|| {
                format!("failed to create vault directory '{}'", parent.display())
            })?;
        }

        let state = match fs::read_to_string(&path).await {
            Ok(raw) => serde_json::from_str(&raw)
                .with_context(|| format!("malformed vault file '{}'", path.display()))?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => VaultState::default(),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read vault file '{}'", path.display()))
            }
        };

        Ok(Arc::new(Self {
            path,
            state: Mutex::new(state),
        }))
    }

    async fn persist(&self, state: &VaultState) -> Result<()> {
        let raw = serde_json::to_string_pretty(state)?;
        fs::write(&self.path, raw)
            .await
            .with_context(|| format!("failed to write vault file '{}'", self.path.display()))
    }
}

#[async_trait]
impl DocumentStore for LocalVault {
    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(id.to_string(), doc);
        self.persist(&state)
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned())
    }

    /// The local variant has a single implicit user, so the owner filter
    /// does not apply: every record is visible.
    async fn query(
        &self,
        collection: &str,
        _owner: Option<UserId>,
    ) -> Result<Vec<Value>, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(docs) = state.collections.get_mut(collection) {
            docs.remove(id);
        }
        self.persist(&state)
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))
    }
}

/// Identity provider over the vault's user list. Passwords are stored as
/// bcrypt hashes only.
pub struct LocalIdentityProvider {
    vault: Arc<LocalVault>,
    failed_signins: Mutex<HashMap<String, u32>>,
}

impl LocalIdentityProvider {
    pub fn new(vault: Arc<LocalVault>) -> Self {
        Self {
            vault,
            failed_signins: Mutex::new(HashMap::new()),
        }
    }

    /// Session left behind by a previous run, if any.
    pub async fn stored_session(&self) -> Option<AuthSession> {
        let state = self.vault.state.lock().await;
        state.session.clone().map(|stored| AuthSession {
            user: stored.user,
            token: stored.token,
        })
    }

    async fn failures_for(&self, email: &str) -> u32 {
        self.failed_signins
            .lock()
            .await
            .get(email)
            .copied()
            .unwrap_or(0)
    }

    async fn record_failure(&self, email: &str) {
        *self
            .failed_signins
            .lock()
            .await
            .entry(email.to_string())
            .or_insert(0) += 1;
    }

    async fn clear_failures(&self, email: &str) {
        self.failed_signins.lock().await.remove(email);
    }
}

#[async_trait]
impl IdentityProvider for LocalIdentityProvider {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<AuthSession, AuthError> {
        let email = email.trim().to_ascii_lowercase();
        if !plausible_email(&email) {
            return Err(AuthError::InvalidEmail);
        }
        if password.len() < MIN_PASSWORD_LEN {
            return Err(AuthError::WeakPassword);
        }

        let mut state = self.vault.state.lock().await;
        if state.users.iter().any(|u| u.email == email) {
            return Err(AuthError::EmailInUse);
        }

        let password_hash = bcrypt::hash(password, bcrypt::DEFAULT_COST)
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;
        let user = User {
            id: UserId::generate(),
            email: email.clone(),
            name: display_name.trim().to_string(),
        };
        state.users.push(LocalUser {
            id: user.id,
            email,
            name: user.name.clone(),
            password_hash,
            created_at: Utc::now(),
        });

        let session = AuthSession {
            user,
            token: Uuid::new_v4().to_string(),
        };
        state.session = Some(StoredSession {
            user: session.user.clone(),
            token: session.token.clone(),
        });
        self.vault
            .persist(&state)
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;
        Ok(session)
    }

    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError> {
        let email = email.trim().to_ascii_lowercase();
        if self.failures_for(&email).await >= MAX_FAILED_SIGNINS {
            return Err(AuthError::TooManyAttempts);
        }

        let found = {
            let state = self.vault.state.lock().await;
            state.users.iter().find(|u| u.email == email).cloned()
        };
        let verified = match &found {
            Some(user) => bcrypt::verify(password, &user.password_hash).unwrap_or(false),
            None => false,
        };
        // An unknown email and a wrong password are indistinguishable to the caller.
        let Some(user) = found.filter(|_| verified) else {
            self.record_failure(&email).await;
            return Err(AuthError::InvalidCredentials);
        };
        self.clear_failures(&email).await;

        let session = AuthSession {
            user: User {
                id: user.id,
                email: user.email,
                name: user.name,
            },
            token: Uuid::new_v4().to_string(),
        };
        let mut state = self.vault.state.lock().await;
        state.session = Some(StoredSession {
            user: session.user.clone(),
            token: session.token.clone(),
        });
        self.vault
            .persist(&state)
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))?;
        Ok(session)
    }

    async fn sign_out(&self, _token: &str) -> Result<(), AuthError> {
        let mut state = self.vault.state.lock().await;
        state.session = None;
        self.vault
            .persist(&state)
            .await
            .map_err(|err| AuthError::Unavailable(err.to_string()))
    }
}

/// Stores payslip bytes under a directory beside the vault and hands back a
/// `file://` URL — the local stand-in for the hosted-URL contract of the
/// remote media service.
pub struct LocalMediaHost {
    dir: PathBuf,
}

impl LocalMediaHost {
    pub async fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create media directory '{}'", dir.display()))?;
        // file:// URLs need an absolute path.
        let dir = fs::canonicalize(&dir)
            .await
            .with_context(|| format!("failed to resolve media directory '{}'", dir.display()))?;
        Ok(Self { dir })
    }
}

#[async_trait]
impl MediaHost for LocalMediaHost {
    async fn store(&self, file: &CandidateFile, folder: &str) -> Result<StoredBlob, MediaHostError> {
        let folder_dir = self.dir.join(sanitize_label(folder));
        fs::create_dir_all(&folder_dir)
            .await
            .map_err(|err| MediaHostError::Transport(err.to_string()))?;

        let path = folder_dir.join(format!("{}-{}", Uuid::new_v4(), sanitize_label(&file.name)));
        fs::write(&path, &file.bytes)
            .await
            .map_err(|err| MediaHostError::Transport(err.to_string()))?;

        let url = Url::from_file_path(&path).map_err(|_| {
            MediaHostError::MalformedResponse(format!(
                "unrepresentable blob path '{}'",
                path.display()
            ))
        })?;
        Ok(StoredBlob {
            url: url.to_string(),
        })
    }
}

fn sanitize_label(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '-'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
#[path = "tests/local_tests.rs"]
mod tests;
