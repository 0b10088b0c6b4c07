use std::collections::BTreeSet;

use serde::Serialize;

use crate::access::AccessScope;
use crate::ids::{CustomerId, LeaseId, ResidentId, UnitId, UserId};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StaffUser {
    pub id: UserId,
    pub email: String,
    pub roles: BTreeSet<String>,
    pub scope: AccessScope,
}

/// A resident is linked to exactly one unit and at least one lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResidentPrincipal {
    pub id: ResidentId,
    pub unit: UnitId,
    pub leases: Vec<LeaseId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceClient {
    pub client_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CustomerAdmin {
    pub id: UserId,
    pub email: String,
    pub customers: BTreeSet<CustomerId>,
}

/// The authenticated caller attached to a request or task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Principal {
    StaffUser(StaffUser),
    Resident(ResidentPrincipal),
    ServiceClient(ServiceClient),
    CustomerAdmin(CustomerAdmin),
    Anonymous,
}

impl Principal {
    pub fn system() -> Self {
        Self::ServiceClient(ServiceClient {
            client_id: "system".to_string(),
        })
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Self::Anonymous)
    }

    /// Staff, customer admins and service clients may call operator routes.
    pub fn is_operator(&self) -> bool {
        matches!(
            self,
            Self::StaffUser(_) | Self::CustomerAdmin(_) | Self::ServiceClient(_)
        )
    }

    pub fn roles(&self) -> BTreeSet<String> {
        match self {
            Self::StaffUser(staff) => staff.roles.clone(),
            Self::CustomerAdmin(_) => BTreeSet::from(["customer_admin".to_string()]),
            Self::ServiceClient(_) => BTreeSet::from(["service".to_string()]),
            Self::Resident(_) => BTreeSet::from(["resident".to_string()]),
            Self::Anonymous => BTreeSet::new(),
        }
    }

    /// Identifier recorded in `created_by` and audit entries.
    pub fn actor(&self) -> String {
        match self {
            Self::StaffUser(staff) => format!("user:{}", staff.id),
            Self::Resident(resident) => format!("resident:{}", resident.id),
            Self::ServiceClient(client) => format!("client:{}", client.client_id),
            Self::CustomerAdmin(admin) => format!("customer_admin:{}", admin.id),
            Self::Anonymous => "anonymous".to_string(),
        }
    }
}
