use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::access::{AccessError, Partitioned};
use crate::auth::Principal;
use crate::error::{Classify, ErrorKind};
use crate::tenancy::TenantContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    View,
    Create,
    Update,
    Delete,
}

/// Per-role flags on a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModulePermission {
    pub role: String,
    pub module_code: String,
    pub view: bool,
    pub create: bool,
    pub update: bool,
    pub delete: bool,
    pub active: bool,
}

impl ModulePermission {
    pub fn full(role: &str, module_code: &str) -> Self {
        Self {
            role: role.to_string(),
            module_code: module_code.to_string(),
            view: true,
            create: true,
            update: true,
            delete: true,
            active: true,
        }
    }

    fn allows(&self, action: Action) -> bool {
        self.active
            && match action {
                Action::View => self.view,
                Action::Create => self.create,
                Action::Update => self.update,
                Action::Delete => self.delete,
            }
    }
}

/// Entity ⊕ attribute flag for one role.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributePermission {
    pub role: String,
    pub entity: String,
    pub attribute: String,
    pub has_perm: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum PermissionError {
    #[error("role lacks {action:?} on module '{module}'")]
    Denied { module: String, action: Action },
    #[error(transparent)]
    Access(#[from] AccessError),
}

impl Classify for PermissionError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Denied { .. } => ErrorKind::Forbidden,
            Self::Access(err) => err.kind(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Denied { .. } => "permission_denied",
            Self::Access(err) => err.code(),
        }
    }
}

#[derive(Debug, Default)]
struct PermissionPartition {
    modules: HashMap<(String, String), ModulePermission>,
    attributes: HashMap<(String, String, String), AttributePermission>,
}

/// Tenant-scoped role → module → attribute permissions.
pub struct PermissionCatalog {
    partitions: Partitioned<PermissionPartition>,
}

impl Default for PermissionCatalog {
    fn default() -> Self {
        Self {
            partitions: Partitioned::tenant_only("permission"),
        }
    }
}

impl PermissionCatalog {
    pub fn grant_module(&self, ctx: &TenantContext, grant: ModulePermission) -> Result<(), AccessError> {
        self.partitions.write(ctx, |partition| {
            partition
                .modules
                .insert((grant.role.clone(), grant.module_code.clone()), grant);
        })
    }

    pub fn set_attribute(
        &self,
        ctx: &TenantContext,
        permission: AttributePermission,
    ) -> Result<(), AccessError> {
        self.partitions.write(ctx, |partition| {
            partition.attributes.insert(
                (
                    permission.role.clone(),
                    permission.entity.clone(),
                    permission.attribute.clone(),
                ),
                permission,
            );
        })
    }

    /// Staff need an explicit grant on one of their roles. Customer admins and
    /// service clients act with full rights; residents never reach operator
    /// modules.
    pub fn check(
        &self,
        ctx: &TenantContext,
        principal: &Principal,
        module_code: &str,
        action: Action,
    ) -> Result<(), PermissionError> {
        let allowed = match principal {
            Principal::CustomerAdmin(_) | Principal::ServiceClient(_) => true,
            Principal::StaffUser(staff) => self.partitions.read(ctx, |partition| {
                staff.roles.iter().any(|role| {
                    partition
                        .modules
                        .get(&(role.clone(), module_code.to_string()))
                        .map(|grant| grant.allows(action))
                        .unwrap_or(false)
                })
            })?,
            Principal::Resident(_) | Principal::Anonymous => false,
        };

        if allowed {
            Ok(())
        } else {
            Err(PermissionError::Denied {
                module: module_code.to_string(),
                action,
            })
        }
    }

    /// Attributes of `entity` hidden from the caller: denied for one of its
    /// roles and granted by none.
    pub fn masked_attributes(
        &self,
        ctx: &TenantContext,
        principal: &Principal,
        entity: &str,
    ) -> Result<BTreeSet<String>, AccessError> {
        let roles = principal.roles();
        self.partitions.read(ctx, |partition| {
            let mut denied = BTreeSet::new();
            let mut granted = BTreeSet::new();
            for permission in partition.attributes.values() {
                if permission.entity != entity || !roles.contains(&permission.role) {
                    continue;
                }
                if permission.has_perm {
                    granted.insert(permission.attribute.clone());
                } else {
                    denied.insert(permission.attribute.clone());
                }
            }
            denied.difference(&granted).cloned().collect()
        })
    }

    /// Removes masked attributes from a serialized entity.
    pub fn mask(
        &self,
        ctx: &TenantContext,
        principal: &Principal,
        entity: &str,
        value: &mut Value,
    ) -> Result<(), AccessError> {
        let masked = self.masked_attributes(ctx, principal, entity)?;
        if masked.is_empty() {
            return Ok(());
        }
        strip(value, &masked);
        Ok(())
    }
}

fn strip(value: &mut Value, masked: &BTreeSet<String>) {
    match value {
        Value::Object(map) => {
            for attribute in masked {
                map.remove(attribute);
            }
        }
        Value::Array(items) => {
            for item in items {
                strip(item, masked);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessScope;
    use crate::auth::StaffUser;
    use crate::clock;
    use crate::ids::UserId;
    use crate::tenancy::{NewTenant, TenantDirectory, TenantScope, TenantState};
    use serde_json::json;

    fn scope() -> (TenantDirectory, TenantScope) {
        let directory = TenantDirectory::new("admin.resido.test", clock::system());
        let tenant = directory
            .provision(NewTenant {
                schema: "acme".into(),
                domain: "acme.resido.test".into(),
                name: "Acme".into(),
                state: TenantState::Active,
            })
            .expect("acme provisions");
        let scope = directory.bind(tenant);
        (directory, scope)
    }

    fn staff(roles: &[&str]) -> Principal {
        Principal::StaffUser(StaffUser {
            id: UserId::new(),
            email: "ops@acme.test".into(),
            roles: roles.iter().map(|role| role.to_string()).collect(),
            scope: AccessScope::admin(),
        })
    }

    #[test]
    fn module_grants_are_per_action() {
        let (_directory, scope) = scope();
        let catalog = PermissionCatalog::default();
        catalog
            .grant_module(
                scope.context(),
                ModulePermission {
                    create: false,
                    ..ModulePermission::full("clerk", "billing")
                },
            )
            .expect("grant stored");

        let clerk = staff(&["clerk"]);
        assert!(catalog
            .check(scope.context(), &clerk, "billing", Action::View)
            .is_ok());
        let err = catalog
            .check(scope.context(), &clerk, "billing", Action::Create)
            .expect_err("create denied");
        assert_eq!(err.code(), "permission_denied");
    }

    #[test]
    fn denied_attributes_are_masked_unless_another_role_grants_them() {
        let (_directory, scope) = scope();
        let catalog = PermissionCatalog::default();
        catalog
            .set_attribute(
                scope.context(),
                AttributePermission {
                    role: "clerk".into(),
                    entity: "process".into(),
                    attribute: "raw_payload".into(),
                    has_perm: false,
                },
            )
            .expect("attribute stored");

        let mut body = json!([{ "id": 1, "raw_payload": { "secret": true } }]);
        catalog
            .mask(scope.context(), &staff(&["clerk"]), "process", &mut body)
            .expect("mask applies");
        assert_eq!(body, json!([{ "id": 1 }]));

        catalog
            .set_attribute(
                scope.context(),
                AttributePermission {
                    role: "auditor".into(),
                    entity: "process".into(),
                    attribute: "raw_payload".into(),
                    has_perm: true,
                },
            )
            .expect("attribute stored");
        let mut body = json!({ "id": 1, "raw_payload": {} });
        catalog
            .mask(
                scope.context(),
                &staff(&["clerk", "auditor"]),
                "process",
                &mut body,
            )
            .expect("mask applies");
        assert!(body.get("raw_payload").is_some());
    }
}
