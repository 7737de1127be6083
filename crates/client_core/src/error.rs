use shared::{
    domain::CompanyId,
    error::{ApiError, ErrorCode},
};
use thiserror::Error;

/// Failures surfaced by the identity boundary. Everything except
/// `Unavailable` corresponds to a decision the provider made about the
/// credentials; `Unavailable` normalizes transport-level trouble.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Email already in use")]
    EmailInUse,
    #[error("Password is too weak")]
    WeakPassword,
    #[error("Invalid email address")]
    InvalidEmail,
    #[error("Too many failed login attempts. Please try again later")]
    TooManyAttempts,
    #[error("identity provider unavailable: {0}")]
    Unavailable(String),
}

impl AuthError {
    pub fn from_api(err: &ApiError) -> Self {
        match err.code {
            ErrorCode::InvalidCredentials | ErrorCode::Unauthorized => Self::InvalidCredentials,
            ErrorCode::EmailInUse => Self::EmailInUse,
            ErrorCode::WeakPassword => Self::WeakPassword,
            ErrorCode::InvalidEmail => Self::InvalidEmail,
            ErrorCode::RateLimited => Self::TooManyAttempts,
            _ => Self::Unavailable(err.message.clone()),
        }
    }
}

/// Failures at the document-store boundary.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("document store rejected the request: {message}")]
    Rejected { code: ErrorCode, message: String },
    #[error("document store transport failure: {0}")]
    Transport(String),
    #[error("record does not match the expected shape: {0}")]
    InvalidDocument(String),
    #[error("not signed in")]
    Unauthenticated,
}

/// Failures surfaced by the company store. `EmptyName` and
/// `DuplicateCompany` abort an add before any I/O; `LoadFailed` leaves the
/// previous in-memory state untouched; `PersistFailed` is only returned by
/// the strict add path — optimistic writes downgrade it to a warning notice.
#[derive(Debug, Error)]
pub enum PersistError {
    #[error("company name must not be empty")]
    EmptyName,
    #[error("company {0} already exists")]
    DuplicateCompany(CompanyId),
    #[error("failed to load companies")]
    LoadFailed(#[source] StoreError),
    #[error("failed to persist company")]
    PersistFailed(#[source] StoreError),
}

/// Failures at the media-host boundary, before normalization into a
/// per-file `UploadError`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MediaHostError {
    #[error("media host rejected the upload ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("media host transport failure: {0}")]
    Transport(String),
    #[error("media host returned an unreadable response: {0}")]
    MalformedResponse(String),
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum UploadError {
    #[error("Only PDF files are allowed.")]
    NoValidFiles,
    #[error("Failed to upload {name}: {reason}")]
    UploadFailed { name: String, reason: String },
    #[error("All uploads failed")]
    AllUploadsFailed,
}
