use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use argon2::password_hash::rand_core::{OsRng, RngCore};
use jsonwebtoken::{DecodingKey, EncodingKey};

use crate::ids::TenantId;

const SECRET_LEN: usize = 32;

/// Signing material owned by one tenant.
#[derive(Clone)]
pub struct TenantKey {
    kid: String,
    secret: Arc<[u8]>,
}

impl TenantKey {
    pub fn new(kid: impl Into<String>, secret: impl Into<Vec<u8>>) -> Self {
        Self {
            kid: kid.into(),
            secret: Arc::from(secret.into()),
        }
    }

    fn generate(tenant_id: TenantId) -> Self {
        let mut secret = vec![0u8; SECRET_LEN];
        OsRng.fill_bytes(&mut secret);
        Self::new(format!("{tenant_id}-1"), secret)
    }

    pub fn kid(&self) -> &str {
        &self.kid
    }

    pub(crate) fn encoding_key(&self) -> EncodingKey {
        EncodingKey::from_secret(&self.secret)
    }

    pub(crate) fn decoding_key(&self) -> DecodingKey {
        DecodingKey::from_secret(&self.secret)
    }
}

impl fmt::Debug for TenantKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TenantKey")
            .field("kid", &self.kid)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Per-tenant key registry. A tenant never verifies with another tenant's key.
#[derive(Debug, Default)]
pub struct TenantKeyring {
    keys: RwLock<HashMap<TenantId, TenantKey>>,
}

impl TenantKeyring {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, tenant_id: TenantId, key: TenantKey) {
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tenant_id, key);
    }

    /// Returns the tenant's key, generating one the first time it is needed.
    pub fn ensure(&self, tenant_id: TenantId) -> TenantKey {
        if let Some(key) = self.get(tenant_id) {
            return key;
        }
        self.keys
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(tenant_id)
            .or_insert_with(|| TenantKey::generate(tenant_id))
            .clone()
    }

    pub fn get(&self, tenant_id: TenantId) -> Option<TenantKey> {
        self.keys
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&tenant_id)
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_is_stable_per_tenant() {
        let keyring = TenantKeyring::new();
        let tenant = TenantId::new();
        let first = keyring.ensure(tenant);
        let second = keyring.ensure(tenant);
        assert_eq!(first.kid(), second.kid());
        assert_eq!(first.secret, second.secret);
    }

    #[test]
    fn tenants_get_distinct_secrets() {
        let keyring = TenantKeyring::new();
        let a = keyring.ensure(TenantId::new());
        let b = keyring.ensure(TenantId::new());
        assert_ne!(a.secret, b.secret);
    }

    #[test]
    fn debug_output_redacts_secret() {
        let key = TenantKey::new("kid-1", b"super-secret".to_vec());
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("super-secret"));
    }
}
