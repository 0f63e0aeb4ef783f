use shared::{
    error::{ApiException, ErrorCode},
    rules::RuleViolation,
};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not authorized: {0}")]
    Authorization(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("temporarily unavailable: {0}")]
    Transient(String),
    #[error("voice provider failure: {0}")]
    Provider(String),
}

pub type SyncResult<T> = Result<T, SyncError>;

impl SyncError {
    /// Classifies a collaborator failure. Typed boundary errors keep their
    /// code, everything else is treated as retryable.
    pub fn from_collaborator(err: anyhow::Error) -> Self {
        match err.downcast_ref::<ApiException>() {
            Some(api) => Self::from_code(api.code, api.message.clone()),
            None => SyncError::Transient(format!("{err:#}")),
        }
    }

    /// Like [`SyncError::from_collaborator`], but untyped failures are
    /// attributed to the voice provider.
    pub fn from_provider(err: anyhow::Error) -> Self {
        match err.downcast_ref::<ApiException>() {
            Some(api) => Self::from_code(api.code, api.message.clone()),
            None => SyncError::Provider(format!("{err:#}")),
        }
    }

    pub fn from_code(code: ErrorCode, message: String) -> Self {
        match code {
            ErrorCode::Validation => SyncError::Validation(message),
            ErrorCode::Unauthorized | ErrorCode::Forbidden => SyncError::Authorization(message),
            ErrorCode::NotFound => SyncError::NotFound(message),
            ErrorCode::Conflict => SyncError::Conflict(message),
            ErrorCode::Provider => SyncError::Provider(message),
            ErrorCode::Unavailable | ErrorCode::Internal => SyncError::Transient(message),
        }
    }
}

impl From<RuleViolation> for SyncError {
    fn from(value: RuleViolation) -> Self {
        SyncError::Validation(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_collaborator_errors_keep_their_code() {
        let err = anyhow::Error::new(ApiException::new(ErrorCode::Conflict, "pair raced"));
        assert_eq!(
            SyncError::from_collaborator(err),
            SyncError::Conflict("pair raced".into())
        );

        let err = anyhow::Error::new(ApiException::new(ErrorCode::Forbidden, "not a member"));
        assert!(matches!(
            SyncError::from_provider(err),
            SyncError::Authorization(_)
        ));
    }

    #[test]
    fn untyped_errors_are_transient_or_provider() {
        assert!(matches!(
            SyncError::from_collaborator(anyhow::anyhow!("connection reset")),
            SyncError::Transient(_)
        ));
        assert!(matches!(
            SyncError::from_provider(anyhow::anyhow!("ice failed")),
            SyncError::Provider(_)
        ));
    }
}
