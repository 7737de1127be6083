use std::{collections::HashSet, path::PathBuf, sync::Arc};

use anyhow::anyhow;
use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{Company, CompanyId, PayslipFile, PayslipId, User, UserId},
    protocol::{CompanyOrder, COMPANIES, COMPANY_ORDER},
};
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tracing::{info, warn};

pub mod error;
pub mod local;
pub mod remote;
pub mod upload;

pub use error::{AuthError, MediaHostError, PersistError, StoreError, UploadError};
pub use upload::{
    CandidateFile, NullProgress, ProgressObserver, StoredBlob, UploadOutcome, UploadPipeline,
};

use local::{LocalIdentityProvider, LocalMediaHost, LocalVault};
use remote::{HttpDocumentStore, HttpIdentityProvider, HttpMediaHost};

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// An authenticated user plus the bearer token the backing services expect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user: User,
    pub token: String,
}

/// Explicit session state shared by the identity gate, company store and
/// upload pipeline. Attach/detach are the only mutations; routing watches
/// the subscription to decide between the main view and the login view.
pub struct SessionContext {
    inner: RwLock<Option<AuthSession>>,
    changed: watch::Sender<Option<User>>,
}

impl SessionContext {
    pub fn new() -> Arc<Self> {
        let (changed, _) = watch::channel(None);
        Arc::new(Self {
            inner: RwLock::new(None),
            changed,
        })
    }

    pub async fn attach(&self, session: AuthSession) {
        let user = session.user.clone();
        *self.inner.write().await = Some(session);
        let _ = self.changed.send(Some(user));
    }

    pub async fn detach(&self) {
        *self.inner.write().await = None;
        let _ = self.changed.send(None);
    }

    pub async fn current_user(&self) -> Option<User> {
        self.inner.read().await.as_ref().map(|s| s.user.clone())
    }

    pub async fn token(&self) -> Option<String> {
        self.inner.read().await.as_ref().map(|s| s.token.clone())
    }

    pub async fn is_authenticated(&self) -> bool {
        self.inner.read().await.is_some()
    }

    /// `Some(user)` while signed in, `None` otherwise, delivered on every
    /// change.
    pub fn subscribe(&self) -> watch::Receiver<Option<User>> {
        self.changed.subscribe()
    }
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn sign_up(
        &self,
        email: &str,
        password: &str,
        display_name: &str,
    ) -> Result<AuthSession, AuthError>;
    async fn sign_in(&self, email: &str, password: &str) -> Result<AuthSession, AuthError>;
    async fn sign_out(&self, token: &str) -> Result<(), AuthError>;
}

pub struct MissingIdentityProvider;

#[async_trait]
impl IdentityProvider for MissingIdentityProvider {
    async fn sign_up(
        &self,
        _email: &str,
        _password: &str,
        _display_name: &str,
    ) -> Result<AuthSession, AuthError> {
        Err(AuthError::Unavailable(
            "identity provider is not configured".to_string(),
        ))
    }

    async fn sign_in(&self, _email: &str, _password: &str) -> Result<AuthSession, AuthError> {
        Err(AuthError::Unavailable(
            "identity provider is not configured".to_string(),
        ))
    }

    async fn sign_out(&self, _token: &str) -> Result<(), AuthError> {
        Err(AuthError::Unavailable(
            "identity provider is not configured".to_string(),
        ))
    }
}

/// Per-record persistence keyed by `(collection, id)`, filterable by owner.
/// Records are flat JSON documents; schema validation happens on the client
/// side of this boundary.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn put(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError>;
    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError>;
    async fn query(&self, collection: &str, owner: Option<UserId>)
        -> Result<Vec<Value>, StoreError>;
    async fn delete(&self, collection: &str, id: &str) -> Result<(), StoreError>;
}

pub struct MissingDocumentStore;

#[async_trait]
impl DocumentStore for MissingDocumentStore {
    async fn put(&self, _collection: &str, _id: &str, _doc: Value) -> Result<(), StoreError> {
        Err(StoreError::Transport(
            "document store is not configured".to_string(),
        ))
    }

    async fn get(&self, _collection: &str, _id: &str) -> Result<Option<Value>, StoreError> {
        Err(StoreError::Transport(
            "document store is not configured".to_string(),
        ))
    }

    async fn query(
        &self,
        _collection: &str,
        _owner: Option<UserId>,
    ) -> Result<Vec<Value>, StoreError> {
        Err(StoreError::Transport(
            "document store is not configured".to_string(),
        ))
    }

    async fn delete(&self, _collection: &str, _id: &str) -> Result<(), StoreError> {
        Err(StoreError::Transport(
            "document store is not configured".to_string(),
        ))
    }
}

/// Best-effort blob storage: takes the bytes plus a destination-folder
/// label, answers with a durable retrieval URL.
#[async_trait]
pub trait MediaHost: Send + Sync {
    async fn store(&self, file: &CandidateFile, folder: &str) -> Result<StoredBlob, MediaHostError>;
}

pub struct MissingMediaHost;

#[async_trait]
impl MediaHost for MissingMediaHost {
    async fn store(
        &self,
        _file: &CandidateFile,
        _folder: &str,
    ) -> Result<StoredBlob, MediaHostError> {
        Err(MediaHostError::Transport(
            "media host is not configured".to_string(),
        ))
    }
}

/// Transient, dismissible user-facing notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Success(String),
    Info(String),
    Warning(String),
    Error(String),
}

#[derive(Debug, Clone)]
pub enum AppEvent {
    /// Fresh snapshot of the visible company list, in display order.
    CompaniesChanged { companies: Vec<Company> },
    Notice(Notice),
}

/// Wraps the identity provider and owns the session lifecycle. Failures are
/// surfaced as notices *and* returned, so calling code can keep the user on
/// the auth form.
pub struct IdentityGate {
    provider: Arc<dyn IdentityProvider>,
    session: Arc<SessionContext>,
    events: broadcast::Sender<AppEvent>,
}

impl IdentityGate {
    pub fn new(
        provider: Arc<dyn IdentityProvider>,
        session: Arc<SessionContext>,
        events: broadcast::Sender<AppEvent>,
    ) -> Self {
        Self {
            provider,
            session,
            events,
        }
    }

    pub async fn register(
        &self,
        display_name: &str,
        email: &str,
        password: &str,
    ) -> Result<User, AuthError> {
        match self.provider.sign_up(email, password, display_name).await {
            Ok(session) => {
                let user = session.user.clone();
                self.session.attach(session).await;
                self.notice(Notice::Success(format!("Welcome, {}!", user.name)));
                Ok(user)
            }
            Err(err) => {
                warn!(%email, %err, "registration failed");
                self.notice(Notice::Error(err.to_string()));
                Err(err)
            }
        }
    }

    pub async fn login(&self, email: &str, password: &str) -> Result<User, AuthError> {
        match self.provider.sign_in(email, password).await {
            Ok(session) => {
                let user = session.user.clone();
                self.session.attach(session).await;
                self.notice(Notice::Success(format!("Welcome back, {}!", user.name)));
                Ok(user)
            }
            Err(err) => {
                warn!(%email, %err, "sign-in failed");
                self.notice(Notice::Error(err.to_string()));
                Err(err)
            }
        }
    }

    /// The session stays attached if the provider refuses the sign-out.
    pub async fn logout(&self) {
        let Some(token) = self.session.token().await else {
            return;
        };
        if let Err(err) = self.provider.sign_out(&token).await {
            warn!(%err, "sign-out failed");
            self.notice(Notice::Error("Failed to log out".to_string()));
            return;
        }
        self.session.detach().await;
        self.notice(Notice::Info("You have been logged out".to_string()));
    }

    fn notice(&self, notice: Notice) {
        let _ = self.events.send(AppEvent::Notice(notice));
    }
}

/// Owns the in-memory company list for the active user and is the sole
/// writer of the per-user collection in the backing store. In-memory state
/// is the presentation source of truth; `add` is strict while `update`,
/// `remove` and `reorder` apply optimistically and downgrade write failures
/// to warning notices.
pub struct CompanyStore {
    store: Arc<dyn DocumentStore>,
    session: Arc<SessionContext>,
    companies: Mutex<Vec<Company>>,
    events: broadcast::Sender<AppEvent>,
}

impl CompanyStore {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        session: Arc<SessionContext>,
        events: broadcast::Sender<AppEvent>,
    ) -> Self {
        Self {
            store,
            session,
            companies: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Snapshot of the visible list, in display order.
    pub async fn companies(&self) -> Vec<Company> {
        self.companies.lock().await.clone()
    }

    pub async fn find(&self, id: CompanyId) -> Option<Company> {
        self.companies.lock().await.iter().find(|c| c.id == id).cloned()
    }

    /// Replaces in-memory state wholesale with the owner's records from the
    /// backing store. On transport failure the previous state is left
    /// untouched. Malformed records are skipped with a warning rather than
    /// failing the whole load.
    pub async fn load(&self) -> Result<Vec<Company>, PersistError> {
        let owner = self.session.current_user().await.map(|u| u.id);
        let raw = self.store.query(COMPANIES, owner).await.map_err(|err| {
            warn!(%err, "failed to load companies");
            self.notice(Notice::Error("Failed to load companies".to_string()));
            PersistError::LoadFailed(err)
        })?;

        let mut loaded = Vec::with_capacity(raw.len());
        for doc in raw {
            match serde_json::from_value::<Company>(doc) {
                Ok(company) => loaded.push(company),
                Err(err) => warn!(%err, "skipping malformed company record"),
            }
        }

        let order = self.load_order(owner).await;
        sort_companies(&mut loaded, order.as_deref());
        info!(count = loaded.len(), "loaded companies");

        *self.companies.lock().await = loaded.clone();
        self.emit_companies(loaded.clone());
        Ok(loaded)
    }

    /// Strict: the record is written first and memory is only appended after
    /// the write is accepted, so a failed add leaves no phantom entry.
    pub async fn add(&self, mut company: Company) -> Result<(), PersistError> {
        if company.name.trim().is_empty() {
            return Err(PersistError::EmptyName);
        }
        company.name = company.name.trim().to_string();
        if self.find(company.id).await.is_some() {
            return Err(PersistError::DuplicateCompany(company.id));
        }
        if let Some(user) = self.session.current_user().await {
            company.owner_id = Some(user.id);
        }

        let doc = encode_document(&company).map_err(PersistError::PersistFailed)?;
        self.store
            .put(COMPANIES, &company.id.to_string(), doc)
            .await
            .map_err(|err| {
                warn!(company_id = %company.id, %err, "failed to persist new company");
                self.notice(Notice::Error("Failed to add company".to_string()));
                PersistError::PersistFailed(err)
            })?;

        let snapshot = {
            let mut companies = self.companies.lock().await;
            companies.push(company.clone());
            companies.clone()
        };
        self.emit_companies(snapshot);
        self.notice(Notice::Success(format!("{} has been added", company.name)));
        Ok(())
    }

    /// Optimistic: memory is replaced immediately; a failed backing write is
    /// surfaced as a warning notice and never rolled back.
    pub async fn update(&self, company: Company) {
        let snapshot = {
            let mut companies = self.companies.lock().await;
            for slot in companies.iter_mut() {
                if slot.id == company.id {
                    *slot = company.clone();
                }
            }
            companies.clone()
        };
        self.emit_companies(snapshot);

        let doc = match encode_document(&company) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(company_id = %company.id, %err, "could not encode company record");
                return;
            }
        };
        if let Err(err) = self.store.put(COMPANIES, &company.id.to_string(), doc).await {
            warn!(company_id = %company.id, %err, "backing store write failed after optimistic update");
            self.notice(Notice::Warning("Failed to save changes".to_string()));
        }
    }

    /// Optimistic removal; the company and its payslips disappear from the
    /// visible list before the backing delete resolves.
    pub async fn remove(&self, id: CompanyId) {
        let (snapshot, removed) = {
            let mut companies = self.companies.lock().await;
            let before = companies.len();
            companies.retain(|c| c.id != id);
            (companies.clone(), companies.len() != before)
        };
        if removed {
            self.emit_companies(snapshot);
        }

        if let Err(err) = self.store.delete(COMPANIES, &id.to_string()).await {
            warn!(company_id = %id, %err, "backing store delete failed after optimistic remove");
            self.notice(Notice::Warning("Failed to remove company".to_string()));
        }
    }

    /// Applies the requested display order in memory, then persists the
    /// ordered id sequence wholesale (optimistically). Ids missing from
    /// `new_order` keep their relative position after the listed ones.
    pub async fn reorder(&self, new_order: &[CompanyId]) {
        let snapshot = {
            let mut companies = self.companies.lock().await;
            let mut remaining = std::mem::take(&mut *companies);
            let mut next = Vec::with_capacity(remaining.len());
            for id in new_order {
                if let Some(pos) = remaining.iter().position(|c| c.id == *id) {
                    next.push(remaining.remove(pos));
                }
            }
            next.extend(remaining);
            *companies = next;
            companies.clone()
        };
        self.emit_companies(snapshot.clone());

        let owner = self.session.current_user().await.map(|u| u.id);
        let order = CompanyOrder {
            ids: snapshot.iter().map(|c| c.id).collect(),
        };
        let doc = match encode_document(&order) {
            Ok(doc) => doc,
            Err(err) => {
                warn!(%err, "could not encode company order record");
                return;
            }
        };
        if let Err(err) = self
            .store
            .put(COMPANY_ORDER, &order_document_id(owner), doc)
            .await
        {
            warn!(%err, "backing store write failed after optimistic reorder");
            self.notice(Notice::Warning("Failed to save company order".to_string()));
        }
    }

    /// Appends freshly uploaded payslips to a company, skipping any record
    /// whose id the company already holds. Reads the current value, builds
    /// the replacement and goes through `update` — two near-simultaneous
    /// merges into the same company race, and the later write wins at
    /// whole-company granularity.
    pub async fn append_payslips(
        &self,
        company_id: CompanyId,
        files: Vec<PayslipFile>,
    ) -> Option<Company> {
        let mut updated = self.find(company_id).await?;
        let existing: HashSet<PayslipId> = updated.payslips.iter().map(|p| p.id).collect();
        updated
            .payslips
            .extend(files.into_iter().filter(|f| !existing.contains(&f.id)));
        self.update(updated.clone()).await;
        Some(updated)
    }

    /// Removes one payslip from a company. Same whole-company last-write-wins
    /// caveat as `append_payslips`.
    pub async fn remove_payslip(
        &self,
        company_id: CompanyId,
        payslip_id: PayslipId,
    ) -> Option<Company> {
        let mut updated = self.find(company_id).await?;
        updated.payslips.retain(|p| p.id != payslip_id);
        self.update(updated.clone()).await;
        Some(updated)
    }

    async fn load_order(&self, owner: Option<UserId>) -> Option<Vec<CompanyId>> {
        match self.store.get(COMPANY_ORDER, &order_document_id(owner)).await {
            Ok(Some(doc)) => match serde_json::from_value::<CompanyOrder>(doc) {
                Ok(order) => Some(order.ids),
                Err(err) => {
                    warn!(%err, "skipping malformed company order record");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(%err, "failed to load company order");
                None
            }
        }
    }

    fn emit_companies(&self, companies: Vec<Company>) {
        let _ = self.events.send(AppEvent::CompaniesChanged { companies });
    }

    fn notice(&self, notice: Notice) {
        let _ = self.events.send(AppEvent::Notice(notice));
    }
}

fn encode_document<T: serde::Serialize>(value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|err| StoreError::InvalidDocument(err.to_string()))
}

fn order_document_id(owner: Option<UserId>) -> String {
    owner
        .map(|id| id.to_string())
        .unwrap_or_else(|| "local".to_string())
}

fn sort_companies(companies: &mut [Company], order: Option<&[CompanyId]>) {
    let Some(order) = order else {
        companies.sort_by_key(|c| c.created_at);
        return;
    };
    companies.sort_by(|a, b| {
        let pos = |id: CompanyId| order.iter().position(|o| *o == id);
        match (pos(a.id), pos(b.id)) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => a.created_at.cmp(&b.created_at),
        }
    });
}

/// Facade tying the session, identity gate, company store and upload
/// pipeline together over one event channel.
pub struct Client {
    pub session: Arc<SessionContext>,
    pub identity: IdentityGate,
    pub companies: CompanyStore,
    pub uploads: UploadPipeline,
    events: broadcast::Sender<AppEvent>,
}

impl Client {
    pub fn new_with_dependencies(
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn DocumentStore>,
        host: Arc<dyn MediaHost>,
    ) -> Arc<Self> {
        Self::with_session(SessionContext::new(), provider, store, host)
    }

    /// A client with every boundary unconfigured; each operation fails with
    /// an explanatory error instead of panicking.
    pub fn disconnected() -> Arc<Self> {
        Self::new_with_dependencies(
            Arc::new(MissingIdentityProvider),
            Arc::new(MissingDocumentStore),
            Arc::new(MissingMediaHost),
        )
    }

    /// Remote variant: identity, documents and media are all served by the
    /// backing service at `base_url`.
    pub fn remote(base_url: &str) -> Arc<Self> {
        let http = reqwest::Client::new();
        let session = SessionContext::new();
        let provider = Arc::new(HttpIdentityProvider::new(http.clone(), base_url));
        let store = Arc::new(HttpDocumentStore::new(
            http.clone(),
            base_url,
            Arc::clone(&session),
        ));
        let host = Arc::new(HttpMediaHost::new(http, base_url, Arc::clone(&session)));
        Self::with_session(session, provider, store, host)
    }

    /// Local variant: a JSON vault file plus a blob directory under
    /// `data_dir`; a previously stored session is re-attached.
    pub async fn local(data_dir: impl Into<PathBuf>) -> anyhow::Result<Arc<Self>> {
        let data_dir = data_dir.into();
        let vault = LocalVault::open(data_dir.join("vault.json")).await?;
        let host = Arc::new(LocalMediaHost::new(data_dir.join("media")).await?);
        let provider = Arc::new(LocalIdentityProvider::new(Arc::clone(&vault)));
        let restored = provider.stored_session().await;

        let session = SessionContext::new();
        let client = Self::with_session(Arc::clone(&session), provider, vault, host);
        if let Some(stored) = restored {
            session.attach(stored).await;
        }
        Ok(client)
    }

    fn with_session(
        session: Arc<SessionContext>,
        provider: Arc<dyn IdentityProvider>,
        store: Arc<dyn DocumentStore>,
        host: Arc<dyn MediaHost>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            identity: IdentityGate::new(provider, Arc::clone(&session), events.clone()),
            companies: CompanyStore::new(store, Arc::clone(&session), events.clone()),
            uploads: UploadPipeline::new(host, events.clone()),
            session,
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<AppEvent> {
        self.events.subscribe()
    }

    /// Runs the upload pipeline against a company's folder and merges the
    /// accepted records into it. Returns how many payslips were added.
    pub async fn upload_payslips(
        &self,
        company_id: CompanyId,
        files: Vec<CandidateFile>,
        progress: &dyn ProgressObserver,
    ) -> anyhow::Result<usize> {
        let company = self
            .companies
            .find(company_id)
            .await
            .ok_or_else(|| anyhow!("unknown company {company_id}"))?;
        let outcome = self.uploads.upload(files, &company.name, progress).await?;
        let count = outcome.accepted.len();
        self.companies
            .append_payslips(company_id, outcome.accepted)
            .await;
        let label = if count == 1 { "payslip" } else { "payslips" };
        let _ = self.events.send(AppEvent::Notice(Notice::Success(format!(
            "{count} {label} uploaded to {}",
            company.name
        ))));
        Ok(count)
    }

    pub async fn delete_payslip(
        &self,
        company_id: CompanyId,
        payslip_id: PayslipId,
    ) -> anyhow::Result<()> {
        let company = self
            .companies
            .remove_payslip(company_id, payslip_id)
            .await
            .ok_or_else(|| anyhow!("unknown company {company_id}"))?;
        let _ = self.events.send(AppEvent::Notice(Notice::Success(format!(
            "Payslip removed from {}",
            company.name
        ))));
        Ok(())
    }

    pub async fn remove_company(&self, company_id: CompanyId) -> anyhow::Result<()> {
        let company = self
            .companies
            .find(company_id)
            .await
            .ok_or_else(|| anyhow!("unknown company {company_id}"))?;
        self.companies.remove(company_id).await;
        let _ = self.events.send(AppEvent::Notice(Notice::Success(format!(
            "{} has been removed",
            company.name
        ))));
        Ok(())
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
