use super::error::AuthError;
use super::principal::Principal;
use super::token::SubTokenType;
use crate::access::{require_tenant, AccessError, RowFilter};
use crate::ids::RequestId;
use crate::tenancy::TenantContext;

/// Everything known about the caller for the lifetime of one request or task.
/// Passed explicitly down every call chain; nothing is stored globally.
#[derive(Debug, Clone)]
pub struct RequestContext {
    tenant: Option<TenantContext>,
    pub principal: Principal,
    pub token_type: Option<SubTokenType>,
    pub request_id: RequestId,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

impl RequestContext {
    pub fn new(tenant: TenantContext, principal: Principal, request_id: RequestId) -> Self {
        Self {
            tenant: Some(tenant),
            principal,
            token_type: None,
            request_id,
            client_ip: None,
            user_agent: None,
        }
    }

    /// Context for engine-internal work such as workers and schedulers.
    pub fn system(tenant: TenantContext, request_id: RequestId) -> Self {
        Self::new(tenant, Principal::system(), request_id)
    }

    /// A context with no tenant bound. Every repository call made with it fails.
    pub fn unbound(request_id: RequestId) -> Self {
        Self {
            tenant: None,
            principal: Principal::Anonymous,
            token_type: None,
            request_id,
            client_ip: None,
            user_agent: None,
        }
    }

    pub fn with_token_type(mut self, token_type: Option<SubTokenType>) -> Self {
        self.token_type = token_type;
        self
    }

    pub fn with_client(mut self, client_ip: Option<String>, user_agent: Option<String>) -> Self {
        self.client_ip = client_ip;
        self.user_agent = user_agent;
        self
    }

    pub fn tenant(&self) -> Result<&TenantContext, AccessError> {
        require_tenant(self.tenant.as_ref())
    }

    pub fn row_filter(&self) -> RowFilter {
        RowFilter::for_principal(&self.principal)
    }

    pub fn actor(&self) -> String {
        self.principal.actor()
    }

    pub fn require_authenticated(&self) -> Result<(), AuthError> {
        if self.principal.is_anonymous() {
            return Err(AuthError::AuthenticationRequired);
        }
        match self.token_type {
            None | Some(SubTokenType::FullAccess) => Ok(()),
            Some(_) => Err(AuthError::TokenScopeDenied),
        }
    }

    /// Operator routes refuse residents and limited-purpose tokens.
    pub fn require_operator(&self) -> Result<(), AuthError> {
        self.require_authenticated()?;
        if self.principal.is_operator() {
            Ok(())
        } else {
            Err(AuthError::StaffOnly)
        }
    }
}
