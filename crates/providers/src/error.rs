use mvstudio_core::credits::OperationKind;
use mvstudio_core::task::Provider;

/// Errors from provider adapters and the credential signer.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// The provider has no usable credential in the startup configuration.
    #[error("Missing credential for provider {0}")]
    MissingCredential(Provider),

    /// Token signing failed (bad key material).
    #[error("Failed to sign provider credential: {0}")]
    Signing(String),

    /// Permanent refusal (4xx-class). Never retried.
    #[error("Provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    /// Transient failure (5xx, throttling, network, timeout). Retryable.
    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    /// A success response did not have the expected shape.
    #[error("Malformed provider result: {0}")]
    MalformedResult(String),

    /// The payload could not be forwarded as-is (e.g. not a JSON object).
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// The adapter does not serve this operation kind.
    #[error("Operation {0} is not supported by provider {1}")]
    UnsupportedOperation(OperationKind, Provider),
}

impl ProviderError {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unavailable(_))
    }
}
