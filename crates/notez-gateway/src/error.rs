use notez_types::events::ErrorKind;

/// Failure of one gateway operation.
///
/// Every variant is scoped to the connection that issued the action; the
/// dispatcher turns it into an `error` event and nothing is broadcast.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("authentication required")]
    Unauthenticated,

    #[error("not allowed")]
    Forbidden,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    InvalidRequest(String),

    #[error("store failure: {0:#}")]
    Store(#[from] anyhow::Error),

    #[error("internal failure: {0}")]
    Internal(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

impl GatewayError {
    pub fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState(reason.into())
    }

    pub fn invalid_request(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unauthenticated => ErrorKind::Unauthenticated,
            Self::Forbidden => ErrorKind::Forbidden,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::InvalidState(_) => ErrorKind::InvalidState,
            Self::InvalidRequest(_) => ErrorKind::InvalidRequest,
            Self::Store(_) | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Text safe to show the client. Store and internal details stay in the logs.
    pub fn client_message(&self) -> String {
        match self {
            Self::Store(_) | Self::Internal(_) => "operation failed".to_string(),
            other => other.to_string(),
        }
    }

    /// Failures the operator should see, as opposed to ordinary client mistakes.
    pub fn is_server_fault(&self) -> bool {
        matches!(self, Self::Store(_) | Self::Internal(_))
    }
}

impl From<tokio::task::JoinError> for GatewayError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(e.to_string())
    }
}
