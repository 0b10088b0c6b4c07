use std::sync::Arc;

use super::error::AuthError;
use super::identity::{ExternalIdentity, IdentityProvider};
use super::principal::{Principal, ServiceClient};
use super::token::{AccessTokenClaims, IssuedToken, SubTokenType, TokenIssuer, TokenSubject};
use super::users::{verify_password, UserLookup};
use crate::tenancy::TenantContext;

/// A resolved caller plus the token type it authenticated with.
#[derive(Debug, Clone)]
pub struct Authenticated {
    pub principal: Principal,
    pub token_type: Option<SubTokenType>,
}

/// Composite bearer authentication: identity-provider introspection first,
/// then locally issued tokens.
pub struct Authenticator {
    identity: Arc<dyn IdentityProvider>,
    issuer: Arc<TokenIssuer>,
    users: Arc<dyn UserLookup>,
}

impl Authenticator {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        issuer: Arc<TokenIssuer>,
        users: Arc<dyn UserLookup>,
    ) -> Self {
        Self {
            identity,
            issuer,
            users,
        }
    }

    pub fn issuer(&self) -> &TokenIssuer {
        &self.issuer
    }

    pub async fn authenticate(
        &self,
        ctx: &TenantContext,
        bearer: &str,
    ) -> Result<Authenticated, AuthError> {
        match self.identity.introspect(ctx.tenant(), bearer).await {
            Ok(Some(identity)) => {
                let principal = self.principal_for_identity(ctx, identity)?;
                return Ok(Authenticated {
                    principal,
                    token_type: Some(SubTokenType::FullAccess),
                });
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(error = %err, "introspection failed, trying local token");
            }
        }

        let claims = self.issuer.verify(ctx.tenant(), bearer)?;
        let principal = self.principal_for_claims(ctx, &claims)?;
        Ok(Authenticated {
            principal,
            token_type: claims.sub_token_type,
        })
    }

    /// Exchanges staff or resident credentials for a full-access token bound
    /// to the current tenant.
    pub fn login(
        &self,
        ctx: &TenantContext,
        email: &str,
        password: &str,
    ) -> Result<IssuedToken, AuthError> {
        if let Some(staff) = self.users.staff_by_email(ctx, email)? {
            check_password(password, staff.password_hash.as_deref())?;
            if !staff.active {
                return Err(AuthError::UserInactive);
            }
            return self
                .issuer
                .issue(ctx.tenant(), TokenSubject::User(staff.id), SubTokenType::FullAccess);
        }

        if let Some(resident) = self.users.resident_by_email(ctx, email)? {
            check_password(password, resident.password_hash.as_deref())?;
            if !resident.active {
                return Err(AuthError::UserInactive);
            }
            return self.issuer.issue(
                ctx.tenant(),
                TokenSubject::Patient(resident.id),
                SubTokenType::FullAccess,
            );
        }

        Err(AuthError::InvalidCredentials)
    }

    fn principal_for_identity(
        &self,
        ctx: &TenantContext,
        identity: ExternalIdentity,
    ) -> Result<Principal, AuthError> {
        match identity.email {
            Some(email) => {
                let staff = self
                    .users
                    .staff_by_email(ctx, &email)?
                    .ok_or(AuthError::UserNotFound)?;
                if !staff.active {
                    return Err(AuthError::UserInactive);
                }
                Ok(staff.principal())
            }
            None => match identity.client_id {
                Some(client_id) => Ok(Principal::ServiceClient(ServiceClient { client_id })),
                None => Err(AuthError::UserNotFound),
            },
        }
    }

    fn principal_for_claims(
        &self,
        ctx: &TenantContext,
        claims: &AccessTokenClaims,
    ) -> Result<Principal, AuthError> {
        if claims.tenant_id != ctx.tenant_id() {
            return Err(AuthError::UserNotFound);
        }

        match claims.subject() {
            Some(TokenSubject::User(id)) => {
                let staff = self
                    .users
                    .staff_by_id(ctx, id)?
                    .ok_or(AuthError::UserNotFound)?;
                if !staff.active {
                    return Err(AuthError::UserInactive);
                }
                Ok(staff.principal())
            }
            Some(TokenSubject::Patient(id)) => {
                let resident = self
                    .users
                    .resident_by_id(ctx, id)?
                    .ok_or(AuthError::UserNotFound)?;
                if !resident.active {
                    return Err(AuthError::UserInactive);
                }
                Ok(resident.principal())
            }
            None => Err(AuthError::InvalidToken("token has no subject".into())),
        }
    }
}

fn check_password(password: &str, hash: Option<&str>) -> Result<(), AuthError> {
    match hash {
        Some(hash) if verify_password(password, hash)? => Ok(()),
        _ => Err(AuthError::InvalidCredentials),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessScope;
    use crate::auth::identity::{DisabledIdentityProvider, IdentityError};
    use crate::auth::keyring::TenantKeyring;
    use crate::auth::users::{InMemoryUserDirectory, NewStaff};
    use crate::clock;
    use crate::tenancy::{NewTenant, Tenant, TenantDirectory, TenantState};
    use async_trait::async_trait;
    use std::collections::BTreeSet;

    struct FixedIdentity(Option<ExternalIdentity>);

    #[async_trait]
    impl IdentityProvider for FixedIdentity {
        async fn introspect(
            &self,
            _tenant: &Tenant,
            _token: &str,
        ) -> Result<Option<ExternalIdentity>, IdentityError> {
            Ok(self.0.clone())
        }
    }

    struct Fixture {
        directory: TenantDirectory,
        users: Arc<InMemoryUserDirectory>,
        issuer: Arc<TokenIssuer>,
    }

    fn fixture() -> Fixture {
        let directory = TenantDirectory::new("admin.resido.test", clock::system());
        directory
            .provision(NewTenant {
                schema: "acme".into(),
                domain: "acme.resido.test".into(),
                name: "Acme".into(),
                state: TenantState::Active,
            })
            .expect("acme provisions");
        let issuer = Arc::new(TokenIssuer::new(
            Arc::new(TenantKeyring::new()),
            clock::system(),
            chrono::Duration::hours(1),
        ));
        Fixture {
            directory,
            users: Arc::new(InMemoryUserDirectory::default()),
            issuer,
        }
    }

    fn staff(email: &str) -> NewStaff {
        NewStaff {
            email: email.into(),
            password: Some("hunter22".into()),
            roles: BTreeSet::from(["admin".to_string()]),
            scope: AccessScope::admin(),
            customer_admin_of: None,
        }
    }

    #[tokio::test]
    async fn login_then_authenticate_round_trip() {
        let fx = fixture();
        let scope = fx
            .directory
            .bind(fx.directory.resolve_tenant_by_host("acme.resido.test").expect("acme"));
        let account = fx
            .users
            .add_staff(scope.context(), staff("ops@acme.test"))
            .expect("staff added");
        let auth = Authenticator::new(
            Arc::new(DisabledIdentityProvider),
            fx.issuer.clone(),
            fx.users.clone(),
        );

        let token = auth
            .login(scope.context(), "OPS@acme.test", "hunter22")
            .expect("login succeeds");
        let resolved = auth
            .authenticate(scope.context(), &token.access_token)
            .await
            .expect("token authenticates");

        assert_eq!(resolved.principal, account.principal());
        assert_eq!(resolved.token_type, Some(SubTokenType::FullAccess));
    }

    #[tokio::test]
    async fn wrong_password_is_rejected() {
        let fx = fixture();
        let scope = fx
            .directory
            .bind(fx.directory.resolve_tenant_by_host("acme.resido.test").expect("acme"));
        fx.users
            .add_staff(scope.context(), staff("ops@acme.test"))
            .expect("staff added");
        let auth = Authenticator::new(
            Arc::new(DisabledIdentityProvider),
            fx.issuer.clone(),
            fx.users.clone(),
        );

        let err = auth
            .login(scope.context(), "ops@acme.test", "nope")
            .expect_err("bad password");
        assert!(matches!(err, AuthError::InvalidCredentials));
    }

    #[tokio::test]
    async fn introspection_takes_precedence_over_local_tokens() {
        let fx = fixture();
        let scope = fx
            .directory
            .bind(fx.directory.resolve_tenant_by_host("acme.resido.test").expect("acme"));
        let account = fx
            .users
            .add_staff(scope.context(), staff("sso@acme.test"))
            .expect("staff added");
        let identity = FixedIdentity(Some(ExternalIdentity {
            subject: "kc-123".into(),
            email: Some("sso@acme.test".into()),
            client_id: None,
        }));
        let auth = Authenticator::new(Arc::new(identity), fx.issuer.clone(), fx.users.clone());

        let resolved = auth
            .authenticate(scope.context(), "opaque-idp-token")
            .await
            .expect("introspected identity resolves");
        assert_eq!(resolved.principal, account.principal());
    }

    #[tokio::test]
    async fn introspected_service_clients_become_service_principals() {
        let fx = fixture();
        let scope = fx
            .directory
            .bind(fx.directory.resolve_tenant_by_host("acme.resido.test").expect("acme"));
        let identity = FixedIdentity(Some(ExternalIdentity {
            subject: "svc".into(),
            email: None,
            client_id: Some("billing-sync".into()),
        }));
        let auth = Authenticator::new(Arc::new(identity), fx.issuer.clone(), fx.users.clone());

        let resolved = auth
            .authenticate(scope.context(), "client-credentials-token")
            .await
            .expect("service client resolves");
        assert!(matches!(resolved.principal, Principal::ServiceClient(ref c) if c.client_id == "billing-sync"));
    }
}
