use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Classify, ErrorKind};
use crate::ids::TenantId;

pub const PUBLIC_SCHEMA: &str = "public";

/// Physical schema identifier. Lowercase ascii, digits and underscores.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaName(String);

impl SchemaName {
    pub fn new(raw: impl Into<String>) -> Result<Self, TenancyError> {
        let raw = raw.into();
        let valid = !raw.is_empty()
            && raw.len() <= 63
            && raw
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            && !raw.starts_with(|c: char| c.is_ascii_digit());
        if valid {
            Ok(Self(raw))
        } else {
            Err(TenancyError::InvalidSchema(raw))
        }
    }

    pub fn public() -> Self {
        Self(PUBLIC_SCHEMA.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_public(&self) -> bool {
        self.0 == PUBLIC_SCHEMA
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantState {
    Provisioning,
    Active,
    Suspended,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tenant {
    pub id: TenantId,
    pub schema: SchemaName,
    pub domain: String,
    pub name: String,
    pub state: TenantState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Tenant {
    pub fn is_public(&self) -> bool {
        self.schema.is_public()
    }

    pub fn is_active(&self) -> bool {
        self.state == TenantState::Active
    }
}

/// Input accepted by the onboarding flow when provisioning a tenant.
#[derive(Debug, Clone, Deserialize)]
pub struct NewTenant {
    pub schema: String,
    pub domain: String,
    pub name: String,
    #[serde(default = "NewTenant::default_state")]
    pub state: TenantState,
}

impl NewTenant {
    fn default_state() -> TenantState {
        TenantState::Active
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum TenancyError {
    #[error("no tenant is registered for host '{0}'")]
    HostNotFound(String),
    #[error("tenant {0} does not exist")]
    UnknownTenant(TenantId),
    #[error("schema '{0}' is already provisioned")]
    DuplicateSchema(String),
    #[error("domain '{0}' is already mapped to a tenant")]
    DuplicateDomain(String),
    #[error("'{0}' is not a valid schema name")]
    InvalidSchema(String),
    #[error("the public tenant cannot serve tenant requests")]
    PublicTenantNotRoutable,
    #[error("tenant {0} is not active")]
    Inactive(TenantId),
}

impl Classify for TenancyError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::HostNotFound(_) | Self::UnknownTenant(_) | Self::PublicTenantNotRoutable => {
                ErrorKind::NotFound
            }
            Self::DuplicateSchema(_) | Self::DuplicateDomain(_) => ErrorKind::Conflict,
            Self::InvalidSchema(_) => ErrorKind::Validation,
            Self::Inactive(_) => ErrorKind::Forbidden,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::HostNotFound(_) | Self::UnknownTenant(_) | Self::PublicTenantNotRoutable => {
                "tenant_not_found"
            }
            Self::DuplicateSchema(_) => "duplicate_schema",
            Self::DuplicateDomain(_) => "duplicate_domain",
            Self::InvalidSchema(_) => "invalid_schema",
            Self::Inactive(_) => "tenant_inactive",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_names_reject_uppercase_and_symbols() {
        assert!(SchemaName::new("acme_homes").is_ok());
        assert!(SchemaName::new("Acme").is_err());
        assert!(SchemaName::new("acme-homes").is_err());
        assert!(SchemaName::new("1acme").is_err());
        assert!(SchemaName::new("").is_err());
    }

    #[test]
    fn public_schema_is_recognised() {
        assert!(SchemaName::public().is_public());
        assert!(!SchemaName::new("acme").expect("valid").is_public());
    }
}
