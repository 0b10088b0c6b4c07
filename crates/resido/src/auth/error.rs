use crate::access::AccessError;
use crate::error::{Classify, ErrorKind};
use crate::ids::TenantId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum AuthError {
    #[error("authentication credentials were not provided")]
    AuthenticationRequired,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("token has expired")]
    TokenExpired,
    #[error("user not found")]
    UserNotFound,
    #[error("user account is disabled")]
    UserInactive,
    #[error("invalid email or password")]
    InvalidCredentials,
    #[error("this token type cannot access the requested resource")]
    TokenScopeDenied,
    #[error("operation requires a staff principal")]
    StaffOnly,
    #[error("permission denied")]
    PermissionDenied,
    #[error("invalid account: {0}")]
    InvalidAccount(&'static str),
    #[error("no signing key registered for tenant {0}")]
    MissingKey(TenantId),
    #[error("crypto failure: {0}")]
    Crypto(String),
    #[error(transparent)]
    Access(#[from] AccessError),
}

impl Classify for AuthError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::AuthenticationRequired
            | Self::InvalidToken(_)
            | Self::TokenExpired
            | Self::UserNotFound
            | Self::UserInactive
            | Self::InvalidCredentials => ErrorKind::Authorization,
            Self::TokenScopeDenied | Self::StaffOnly | Self::PermissionDenied => {
                ErrorKind::Forbidden
            }
            Self::InvalidAccount(_) => ErrorKind::Validation,
            Self::MissingKey(_) | Self::Crypto(_) => ErrorKind::Internal,
            Self::Access(err) => err.kind(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::AuthenticationRequired => "authentication_required",
            Self::InvalidToken(_) => "invalid_token",
            Self::TokenExpired => "token_expired",
            Self::UserNotFound => "user_not_found",
            Self::UserInactive => "user_inactive",
            Self::InvalidCredentials => "invalid_credentials",
            Self::TokenScopeDenied => "token_scope_denied",
            Self::StaffOnly => "staff_only",
            Self::PermissionDenied => "permission_denied",
            Self::InvalidAccount(_) => "invalid_account",
            Self::MissingKey(_) | Self::Crypto(_) => "internal_error",
            Self::Access(err) => err.code(),
        }
    }
}
