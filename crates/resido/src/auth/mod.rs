//! Request context, principals and bearer-token authentication.

pub mod authenticator;
pub mod context;
pub mod error;
pub mod identity;
pub mod keyring;
pub mod middleware;
pub mod principal;
pub mod token;
pub mod users;

pub use authenticator::{Authenticated, Authenticator};
pub use context::RequestContext;
pub use error::AuthError;
pub use identity::{
    DisabledIdentityProvider, ExternalIdentity, HttpIdentityProvider, IdentityError,
    IdentityProvider,
};
pub use keyring::{TenantKey, TenantKeyring};
pub use middleware::{attach_request_context, ContextState, REQUEST_ID_HEADER};
pub use principal::{CustomerAdmin, Principal, ResidentPrincipal, ServiceClient, StaffUser};
pub use token::{AccessTokenClaims, IssuedToken, SubTokenType, TokenIssuer, TokenSubject};
pub use users::{
    hash_password, verify_password, InMemoryUserDirectory, NewResident, NewStaff, ResidentAccount,
    StaffAccount, UserLookup,
};
