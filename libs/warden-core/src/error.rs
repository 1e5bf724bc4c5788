use thiserror::Error;
use warden_shared::CodecError;

/// Failures reported by a [`crate::PanelGateway`] implementation.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("panel session expired")]
    SessionExpired,
    #[error("panel unreachable: {0}")]
    Unreachable(String),
    #[error("panel rejected request: {0}")]
    Rejected(String),
    #[error("not found on panel: {0}")]
    NotFound(String),
}

impl GatewayError {
    /// Transient failures get one session renewal and a retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, GatewayError::SessionExpired | GatewayError::Unreachable(_))
    }
}

#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("state store failure: {0}")]
    Backend(String),
}

#[derive(Debug, Error)]
pub enum WardenError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("{0} not found")]
    NotFound(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("username {0} is already taken")]
    UsernameTaken(String),
    #[error("user {0} already has an account")]
    AlreadyRegistered(i64),
    #[error("user {0} already has a request in progress")]
    AlreadyPending(i64),
    #[error("request for user {user_id} is {actual}, expected {expected}")]
    InvalidState {
        user_id: i64,
        actual: String,
        expected: &'static str,
    },
    #[error("{0} is not an operator")]
    Unauthorized(i64),
    #[error("no client-bearing inbound available")]
    NoReferenceInbound,
    #[error("client {0} has no identifier for its protocol")]
    MissingClientKey(String),
    #[error("{failed} of {total} inbound updates failed: {details}")]
    PartialUpdate {
        failed: usize,
        total: usize,
        details: String,
    },
    #[error("background job failed: {0}")]
    Job(String),
}

impl WardenError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            WardenError::NotFound(_) | WardenError::Gateway(GatewayError::NotFound(_))
        )
    }
}

pub type Result<T, E = WardenError> = std::result::Result<T, E>;
