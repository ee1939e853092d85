pub type ProviderResult<T> = Result<T, ProviderError>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ProviderError {
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("invalid request body: {0}")]
    InvalidRequest(String),
    #[error("invalid upstream response: {0}")]
    InvalidResponse(String),
    #[error("invalid upstream url: {0}")]
    InvalidUrl(String),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    pub fn invalid_request(err: impl std::fmt::Display) -> Self {
        ProviderError::InvalidRequest(err.to_string())
    }

    pub fn invalid_response(err: impl std::fmt::Display) -> Self {
        ProviderError::InvalidResponse(err.to_string())
    }
}
