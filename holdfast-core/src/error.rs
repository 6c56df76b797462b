use thiserror::Error;

pub type AnyError = anyhow::Error;
pub type AnyResult<T, E = AnyError> = Result<T, E>;

/// Errors scoped to a single listener add or update.
///
/// The owning listener manager rejects the specific listener and leaves every
/// other listener untouched; nothing here is fatal to the process.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("error adding listener '{address}': {reason}")]
    Listener { address: String, reason: String },
    #[error("unknown listener filter '{0}'")]
    UnknownListenerFilter(String),
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ConfigError {
    pub fn listener(address: impl ToString, reason: impl ToString) -> Self {
        Self::Listener {
            address: address.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// Errors raised while attaching to or speaking the hot-restart machinery.
#[derive(Error, Debug)]
pub enum RestartError {
    /// The shared memory region was written by a binary with a different
    /// layout. There is no safe continuation; the caller must abort.
    #[error("hot restart shared memory incompatible: {0}")]
    Incompatible(String),
    /// A previous generation still holds the INITIALIZING bit. The process
    /// supervisor is expected to back off and retry with the same epoch.
    #[error("previous process is still initializing")]
    StillInitializing,
    #[error("Io error: {0}")]
    Io(#[from] std::io::Error),
}

impl RestartError {
    /// Whether the failure is safe to retry after a backoff.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::StillInitializing)
    }

    /// Whether no safe continuation exists for this process image.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Incompatible(_))
    }
}
