use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Master secret is not initialized")]
    NotInitialized,

    #[error("Master secret is already initialized")]
    AlreadyInitialized,

    #[error("Passphrase does not meet the minimum strength policy: {0}")]
    WeakPassphrase(String),

    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Key manager is locked")]
    Locked,

    #[error("Passphrase required but no interaction is available")]
    InteractionRequired,

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Handshake challenge is stale or was already used")]
    ReplayDetected,

    #[error("Handshake did not complete in time")]
    Timeout,

    #[error("Token expired")]
    Expired,

    #[error("Token revoked")]
    Revoked,

    #[error("Malformed input: {0}")]
    Malformed(String),

    #[error("Bad signature")]
    BadSignature,

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("Cryptographic operation failed: {0}")]
    Crypto(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Whether this error is an authentication rejection that must look the
    /// same to an external caller regardless of which check failed.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            CoreError::AuthenticationFailed | CoreError::BadSignature | CoreError::ReplayDetected
        )
    }

    /// Message suitable for an API boundary.
    pub fn public_message(&self) -> String {
        if self.is_auth_rejection() {
            "authentication rejected".to_string()
        } else {
            match self {
                CoreError::StorageFailure(_) | CoreError::Io(_) | CoreError::Serialization(_) => {
                    "internal storage error".to_string()
                }
                CoreError::Crypto(_) => "internal error".to_string(),
                other => other.to_string(),
            }
        }
    }

    pub(crate) fn storage(err: impl std::fmt::Display) -> Self {
        CoreError::StorageFailure(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
