// Domain errors — the failures callers are expected to tell apart.
//
// Everything in the crate returns anyhow::Result; these variants ride inside
// the anyhow::Error so the CLI and the job runner can downcast and decide
// whether a failure is the caller's fault or worth retrying.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    /// A required activity field is missing or still holds a placeholder,
    /// or an update/remove call carries no usable selector.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The feed identifier is not of the form `<group>:<target>`.
    #[error("invalid feed id: {0}")]
    InvalidFeedId(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Following or unfollowing a feed kind that cannot be followed.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

impl FeedError {
    /// Domain errors are deterministic: re-running the same job yields the
    /// same error, so the job runner fails them permanently.
    pub fn is_retryable(&self) -> bool {
        false
    }
}

/// Classify an arbitrary error: anything that is not a FeedError (store I/O,
/// connectivity, serialization) is treated as transient.
pub fn is_retryable(err: &anyhow::Error) -> bool {
    match err.downcast_ref::<FeedError>() {
        Some(e) => e.is_retryable(),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_errors_are_not_retryable() {
        let err: anyhow::Error = FeedError::Validation("actor is undefined".into()).into();
        assert!(!is_retryable(&err));
        assert_eq!(
            err.downcast_ref::<FeedError>(),
            Some(&FeedError::Validation("actor is undefined".into()))
        );
    }

    #[test]
    fn test_other_errors_are_retryable() {
        let err = anyhow::anyhow!("connection reset");
        assert!(is_retryable(&err));
    }

    #[test]
    fn test_context_keeps_domain_error_reachable() {
        let err = anyhow::Error::from(FeedError::NotFound("feed user:1".into()))
            .context("while marking buckets seen");
        assert!(err.downcast_ref::<FeedError>().is_some());
        assert!(!is_retryable(&err));
    }
}
