use mvstudio_core::error::CoreError;
use mvstudio_providers::error::ProviderError;

/// Errors surfaced by the orchestrator and its store ports.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl OrchestratorError {
    /// The domain error, if this is one.
    pub fn as_core(&self) -> Option<&CoreError> {
        match self {
            OrchestratorError::Core(e) => Some(e),
            _ => None,
        }
    }
}
