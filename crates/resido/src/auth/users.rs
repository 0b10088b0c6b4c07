use std::collections::{BTreeSet, HashMap};

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use serde::Serialize;

use super::error::AuthError;
use super::principal::{CustomerAdmin, Principal, ResidentPrincipal, StaffUser};
use crate::access::{AccessScope, Partitioned};
use crate::ids::{CustomerId, LeaseId, ResidentId, UnitId, UserId};
use crate::tenancy::TenantContext;

#[derive(Debug, Clone, Serialize)]
pub struct StaffAccount {
    pub id: UserId,
    pub email: String,
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub roles: BTreeSet<String>,
    pub scope: AccessScope,
    /// Set for customer administrators; they see everything under these customers.
    pub customer_admin_of: Option<BTreeSet<CustomerId>>,
    pub active: bool,
}

impl StaffAccount {
    pub fn principal(&self) -> Principal {
        match &self.customer_admin_of {
            Some(customers) => Principal::CustomerAdmin(CustomerAdmin {
                id: self.id,
                email: self.email.clone(),
                customers: customers.clone(),
            }),
            None => Principal::StaffUser(StaffUser {
                id: self.id,
                email: self.email.clone(),
                roles: self.roles.clone(),
                scope: self.scope.clone(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ResidentAccount {
    pub id: ResidentId,
    pub email: String,
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub unit: UnitId,
    pub leases: Vec<LeaseId>,
    pub active: bool,
}

impl ResidentAccount {
    pub fn principal(&self) -> Principal {
        Principal::Resident(ResidentPrincipal {
            id: self.id,
            unit: self.unit,
            leases: self.leases.clone(),
        })
    }
}

/// User records the auth layer needs. Implementations are registered at
/// startup so authentication does not depend on a concrete store.
pub trait UserLookup: Send + Sync {
    fn staff_by_id(&self, ctx: &TenantContext, id: UserId) -> Result<Option<StaffAccount>, AuthError>;
    fn staff_by_email(&self, ctx: &TenantContext, email: &str) -> Result<Option<StaffAccount>, AuthError>;
    fn resident_by_id(
        &self,
        ctx: &TenantContext,
        id: ResidentId,
    ) -> Result<Option<ResidentAccount>, AuthError>;
    fn resident_by_email(
        &self,
        ctx: &TenantContext,
        email: &str,
    ) -> Result<Option<ResidentAccount>, AuthError>;
}

pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Crypto(format!("password hash: {e}")))
}

pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    let parsed = PasswordHash::new(hash).map_err(|e| AuthError::Crypto(format!("stored hash: {e}")))?;
    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok())
}

#[derive(Debug, Clone)]
pub struct NewStaff {
    pub email: String,
    pub password: Option<String>,
    pub roles: BTreeSet<String>,
    pub scope: AccessScope,
    pub customer_admin_of: Option<BTreeSet<CustomerId>>,
}

#[derive(Debug, Clone)]
pub struct NewResident {
    pub email: String,
    pub password: Option<String>,
    pub unit: UnitId,
    pub leases: Vec<LeaseId>,
}

#[derive(Debug, Default)]
struct UserPartition {
    staff: HashMap<UserId, StaffAccount>,
    residents: HashMap<ResidentId, ResidentAccount>,
}

/// Per-tenant user directory kept in memory.
pub struct InMemoryUserDirectory {
    partitions: Partitioned<UserPartition>,
}

impl Default for InMemoryUserDirectory {
    fn default() -> Self {
        Self {
            partitions: Partitioned::tenant_only("user"),
        }
    }
}

impl InMemoryUserDirectory {
    pub fn add_staff(&self, ctx: &TenantContext, staff: NewStaff) -> Result<StaffAccount, AuthError> {
        let password_hash = staff.password.as_deref().map(hash_password).transpose()?;
        let account = StaffAccount {
            id: UserId::new(),
            email: staff.email.trim().to_ascii_lowercase(),
            password_hash,
            roles: staff.roles,
            scope: staff.scope,
            customer_admin_of: staff.customer_admin_of,
            active: true,
        };
        let stored = account.clone();
        self.partitions
            .write(ctx, |partition| partition.staff.insert(account.id, account))?;
        Ok(stored)
    }

    pub fn add_resident(
        &self,
        ctx: &TenantContext,
        resident: NewResident,
    ) -> Result<ResidentAccount, AuthError> {
        if resident.leases.is_empty() {
            return Err(AuthError::InvalidAccount("a resident needs at least one lease"));
        }
        let password_hash = resident.password.as_deref().map(hash_password).transpose()?;
        let account = ResidentAccount {
            id: ResidentId::new(),
            email: resident.email.trim().to_ascii_lowercase(),
            password_hash,
            unit: resident.unit,
            leases: resident.leases,
            active: true,
        };
        let stored = account.clone();
        self.partitions
            .write(ctx, |partition| partition.residents.insert(account.id, account))?;
        Ok(stored)
    }

    pub fn deactivate_staff(&self, ctx: &TenantContext, id: UserId) -> Result<(), AuthError> {
        self.partitions.write(ctx, |partition| {
            if let Some(account) = partition.staff.get_mut(&id) {
                account.active = false;
            }
        })?;
        Ok(())
    }
}

impl UserLookup for InMemoryUserDirectory {
    fn staff_by_id(&self, ctx: &TenantContext, id: UserId) -> Result<Option<StaffAccount>, AuthError> {
        Ok(self
            .partitions
            .read(ctx, |partition| partition.staff.get(&id).cloned())?)
    }

    fn staff_by_email(&self, ctx: &TenantContext, email: &str) -> Result<Option<StaffAccount>, AuthError> {
        let email = email.trim().to_ascii_lowercase();
        Ok(self.partitions.read(ctx, |partition| {
            partition
                .staff
                .values()
                .find(|account| account.email == email)
                .cloned()
        })?)
    }

    fn resident_by_id(
        &self,
        ctx: &TenantContext,
        id: ResidentId,
    ) -> Result<Option<ResidentAccount>, AuthError> {
        Ok(self
            .partitions
            .read(ctx, |partition| partition.residents.get(&id).cloned())?)
    }

    fn resident_by_email(
        &self,
        ctx: &TenantContext,
        email: &str,
    ) -> Result<Option<ResidentAccount>, AuthError> {
        let email = email.trim().to_ascii_lowercase();
        Ok(self.partitions.read(ctx, |partition| {
            partition
                .residents
                .values()
                .find(|account| account.email == email)
                .cloned()
        })?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_hashes_verify_only_the_original_password() {
        let hash = hash_password("correct-horse").expect("hashes");
        assert!(verify_password("correct-horse", &hash).expect("verifies"));
        assert!(!verify_password("wrong-horse", &hash).expect("verifies"));
    }

    #[test]
    fn hashes_are_salted() {
        let first = hash_password("same").expect("hashes");
        let second = hash_password("same").expect("hashes");
        assert_ne!(first, second);
    }
}
