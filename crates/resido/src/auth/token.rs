//! Locally issued access tokens.
//!
//! Tokens are HS256 JWS signed with the issuing tenant's key and always bind
//! `tenant_id`. Verification checks the tenant binding before touching any
//! key or user record, so a token minted for one tenant fails on another
//! with `user_not_found`.

use std::sync::Arc;

use chrono::Duration;
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::AuthError;
use super::keyring::TenantKeyring;
use crate::clock::SharedClock;
use crate::ids::{ResidentId, TenantId, UserId};
use crate::tenancy::Tenant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubTokenType {
    FullAccess,
    ResetPassword,
    GuestPatient,
    CustomerOnboarding,
    RentalApplicationView,
}

/// Claims carried by every locally issued token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenClaims {
    pub tenant_id: TenantId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_token_type: Option<SubTokenType>,
    pub exp: i64,
    pub iat: i64,
    pub jti: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<ResidentId>,
}

impl AccessTokenClaims {
    pub fn subject(&self) -> Option<TokenSubject> {
        self.user_id
            .map(TokenSubject::User)
            .or(self.patient_id.map(TokenSubject::Patient))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenSubject {
    User(UserId),
    Patient(ResidentId),
}

#[derive(Debug, Clone, Serialize)]
pub struct IssuedToken {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: i64,
    pub sub_token_type: SubTokenType,
}

#[derive(Debug, Deserialize)]
struct TenantBinding {
    #[serde(default)]
    tenant_id: Option<TenantId>,
}

pub struct TokenIssuer {
    keyring: Arc<TenantKeyring>,
    clock: SharedClock,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(keyring: Arc<TenantKeyring>, clock: SharedClock, ttl: Duration) -> Self {
        Self { keyring, clock, ttl }
    }

    pub fn issue(
        &self,
        tenant: &Tenant,
        subject: TokenSubject,
        sub_token_type: SubTokenType,
    ) -> Result<IssuedToken, AuthError> {
        self.issue_with_ttl(tenant, subject, sub_token_type, self.ttl)
    }

    pub fn issue_with_ttl(
        &self,
        tenant: &Tenant,
        subject: TokenSubject,
        sub_token_type: SubTokenType,
        ttl: Duration,
    ) -> Result<IssuedToken, AuthError> {
        let key = self.keyring.ensure(tenant.id);
        let now = self.clock.now().timestamp();
        let (user_id, patient_id) = match subject {
            TokenSubject::User(id) => (Some(id), None),
            TokenSubject::Patient(id) => (None, Some(id)),
        };
        let claims = AccessTokenClaims {
            tenant_id: tenant.id,
            sub_token_type: Some(sub_token_type),
            exp: now + ttl.num_seconds(),
            iat: now,
            jti: Uuid::new_v4(),
            user_id,
            patient_id,
        };

        let mut header = Header::new(Algorithm::HS256);
        header.kid = Some(key.kid().to_string());
        let access_token = jsonwebtoken::encode(&header, &claims, &key.encoding_key())
            .map_err(|e| AuthError::Crypto(format!("JWT encode: {e}")))?;

        Ok(IssuedToken {
            access_token,
            token_type: "Bearer",
            expires_in: ttl.num_seconds(),
            sub_token_type,
        })
    }

    /// Verifies a token presented to `tenant`.
    pub fn verify(&self, tenant: &Tenant, token: &str) -> Result<AccessTokenClaims, AuthError> {
        match bound_tenant(token)? {
            Some(bound) if bound == tenant.id => {}
            Some(_) => return Err(AuthError::UserNotFound),
            None => return Err(AuthError::InvalidToken("missing tenant_id".into())),
        }

        let key = self
            .keyring
            .get(tenant.id)
            .ok_or(AuthError::MissingKey(tenant.id))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        let claims = jsonwebtoken::decode::<AccessTokenClaims>(token, &key.decoding_key(), &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                JwtErrorKind::ExpiredSignature => AuthError::TokenExpired,
                _ => AuthError::InvalidToken(e.to_string()),
            })?;

        if claims.sub_token_type.is_none() {
            return Err(AuthError::InvalidToken("missing sub_token_type".into()));
        }
        Ok(claims)
    }
}

/// Reads `tenant_id` without verifying the signature. Only used to route the
/// token to the right key; nothing else is trusted before verification.
fn bound_tenant(token: &str) -> Result<Option<TenantId>, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    jsonwebtoken::decode::<TenantBinding>(token, &DecodingKey::from_secret(&[]), &validation)
        .map(|data| data.claims.tenant_id)
        .map_err(|e| AuthError::InvalidToken(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock;
    use crate::tenancy::{NewTenant, TenantDirectory, TenantState};

    fn setup() -> (TokenIssuer, Arc<Tenant>, Arc<Tenant>) {
        let directory = TenantDirectory::new("admin.resido.test", clock::system());
        let provision = |schema: &str| {
            directory
                .provision(NewTenant {
                    schema: schema.into(),
                    domain: format!("{schema}.resido.test"),
                    name: schema.into(),
                    state: TenantState::Active,
                })
                .expect("tenant provisions")
        };
        let a = provision("acme");
        let b = provision("birch");
        let keyring = Arc::new(TenantKeyring::new());
        keyring.ensure(b.id);
        let issuer = TokenIssuer::new(keyring, clock::system(), Duration::hours(1));
        (issuer, a, b)
    }

    #[test]
    fn issued_tokens_verify_for_their_tenant() {
        let (issuer, acme, _) = setup();
        let user = UserId::new();
        let token = issuer
            .issue(&acme, TokenSubject::User(user), SubTokenType::FullAccess)
            .expect("token issues");
        let claims = issuer.verify(&acme, &token.access_token).expect("verifies");
        assert_eq!(claims.tenant_id, acme.id);
        assert_eq!(claims.subject(), Some(TokenSubject::User(user)));
        assert_eq!(claims.sub_token_type, Some(SubTokenType::FullAccess));
    }

    #[test]
    fn tokens_from_another_tenant_are_user_not_found() {
        let (issuer, acme, birch) = setup();
        let token = issuer
            .issue(&acme, TokenSubject::Patient(ResidentId::new()), SubTokenType::FullAccess)
            .expect("token issues");
        let err = issuer
            .verify(&birch, &token.access_token)
            .expect_err("cross-tenant token rejected");
        assert!(matches!(err, AuthError::UserNotFound));
    }

    #[test]
    fn expired_tokens_are_rejected() {
        let (issuer, acme, _) = setup();
        let token = issuer
            .issue_with_ttl(
                &acme,
                TokenSubject::User(UserId::new()),
                SubTokenType::FullAccess,
                Duration::seconds(-120),
            )
            .expect("token issues");
        let err = issuer.verify(&acme, &token.access_token).expect_err("expired");
        assert!(matches!(err, AuthError::TokenExpired));
    }

    #[test]
    fn tampered_tokens_are_invalid() {
        let (issuer, acme, _) = setup();
        let token = issuer
            .issue(&acme, TokenSubject::User(UserId::new()), SubTokenType::FullAccess)
            .expect("token issues");
        let mut tampered = token.access_token.clone();
        tampered.push('x');
        let err = issuer.verify(&acme, &tampered).expect_err("tampered");
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }
}
