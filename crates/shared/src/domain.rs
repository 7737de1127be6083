use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

id_newtype!(UserId);
id_newtype!(CompanyId);
id_newtype!(PayslipId);
id_newtype!(FileId);

/// The only content type the upload pipeline accepts.
pub const PDF_CONTENT_TYPE: &str = "application/pdf";

/// Minimum password length enforced by every identity provider variant.
pub const MIN_PASSWORD_LEN: usize = 6;

/// Cosmetic company tag, restricted to a fixed palette. Serializes to the
/// hex string so stored documents stay human-readable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompanyColor {
    #[default]
    #[serde(rename = "#3B82F6")]
    Blue,
    #[serde(rename = "#10B981")]
    Green,
    #[serde(rename = "#F59E0B")]
    Amber,
    #[serde(rename = "#EF4444")]
    Red,
    #[serde(rename = "#8B5CF6")]
    Purple,
    #[serde(rename = "#EC4899")]
    Pink,
    #[serde(rename = "#6366F1")]
    Indigo,
    #[serde(rename = "#F97316")]
    Orange,
}

impl CompanyColor {
    pub const PALETTE: [CompanyColor; 8] = [
        CompanyColor::Blue,
        CompanyColor::Green,
        CompanyColor::Amber,
        CompanyColor::Red,
        CompanyColor::Purple,
        CompanyColor::Pink,
        CompanyColor::Indigo,
        CompanyColor::Orange,
    ];

    pub fn hex(self) -> &'static str {
        match self {
            CompanyColor::Blue => "#3B82F6",
            CompanyColor::Green => "#10B981",
            CompanyColor::Amber => "#F59E0B",
            CompanyColor::Red => "#EF4444",
            CompanyColor::Purple => "#8B5CF6",
            CompanyColor::Pink => "#EC4899",
            CompanyColor::Indigo => "#6366F1",
            CompanyColor::Orange => "#F97316",
        }
    }
}

/// Metadata plus retrieval URL for one uploaded payslip. Immutable once
/// created; removed only together with or from its owning company.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayslipFile {
    pub id: PayslipId,
    pub name: String,
    pub size: u64,
    pub content_type: String,
    pub url: String,
    pub uploaded_at: DateTime<Utc>,
}

/// A named group owning an ordered sequence of payslips. `owner_id` is
/// stamped in the remote variant and absent in the local one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub id: CompanyId,
    pub name: String,
    pub color: CompanyColor,
    pub payslips: Vec<PayslipFile>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_id: Option<UserId>,
}

impl Company {
    /// A new, empty company. Name trimming happens here; emptiness is
    /// rejected by the store's add operation.
    pub fn new(name: impl Into<String>, color: CompanyColor) -> Self {
        Self {
            id: CompanyId::generate(),
            name: name.into().trim().to_string(),
            color,
            payslips: Vec::new(),
            created_at: Utc::now(),
            owner_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub email: String,
    pub name: String,
}

/// Cheap plausibility check shared by the identity provider variants; real
/// address verification is out of scope.
pub fn plausible_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => !local.is_empty() && domain.contains('.'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn company_color_serializes_to_palette_hex() {
        let raw = serde_json::to_string(&CompanyColor::Amber).expect("serialize");
        assert_eq!(raw, "\"#F59E0B\"");
        let parsed: CompanyColor = serde_json::from_str(&raw).expect("deserialize");
        assert_eq!(parsed, CompanyColor::Amber);
        assert_eq!(parsed.hex(), "#F59E0B");
    }

    #[test]
    fn company_round_trips_through_json_with_payslip_order() {
        let mut company = Company::new("  Initech  ", CompanyColor::Green);
        assert_eq!(company.name, "Initech");
        for name in ["january.pdf", "february.pdf", "march.pdf"] {
            company.payslips.push(PayslipFile {
                id: PayslipId::generate(),
                name: name.to_string(),
                size: 1024,
                content_type: PDF_CONTENT_TYPE.to_string(),
                url: format!("https://files.example/{name}"),
                uploaded_at: Utc::now(),
            });
        }

        let raw = serde_json::to_value(&company).expect("serialize");
        let parsed: Company = serde_json::from_value(raw).expect("deserialize");
        assert_eq!(parsed, company);
    }

    #[test]
    fn email_plausibility_rejects_obvious_garbage() {
        assert!(plausible_email("user@example.com"));
        assert!(!plausible_email("userexample.com"));
        assert!(!plausible_email("@example.com"));
        assert!(!plausible_email("user@nodot"));
    }
}
