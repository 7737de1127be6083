use serde::{Deserialize, Serialize};

use crate::domain::{CompanyId, FileId, User};

/// Document-store collection holding one record per company.
pub const COMPANIES: &str = "companies";
/// Document-store collection holding the wholesale display-order record,
/// one per owner.
pub const COMPANY_ORDER: &str = "company_order";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub email: String,
    pub password: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Issued by the identity endpoints; the token doubles as the
/// upload-authorization token for the media host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    pub user: User,
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaUploadResponse {
    pub file_id: FileId,
    pub url: String,
    pub size_bytes: u64,
}

/// Ordered id sequence persisted wholesale on every reorder and applied on
/// load. Ids not listed here sort after the listed ones by creation time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompanyOrder {
    pub ids: Vec<CompanyId>,
}
