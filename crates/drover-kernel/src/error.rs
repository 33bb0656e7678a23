//! Kernel-level error type.
//!
//! Core operations never signal control flow through panics: every rejection is a
//! [KernelError] whose [ErrorKind] the outer layers translate (HTTP status codes,
//! CLI exit codes, job messages).

/// Coarse classification of a [KernelError].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    NotFound,
    Forbidden,
    Conflict,
    /// A worker presented a lease it no longer (or never) held.
    LeaseMismatch,
    Config,
    Storage,
}

#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("lease mismatch: {0}")]
    LeaseMismatch(String),
    #[error("configuration error: {0}")]
    Config(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("queue error: {0}")]
    Queue(String),
    #[error("driver error: {0}")]
    Driver(String),
}

impl KernelError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) => ErrorKind::Validation,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::LeaseMismatch(_) => ErrorKind::LeaseMismatch,
            Self::Config(_) => ErrorKind::Config,
            Self::Store(_) | Self::Queue(_) | Self::Driver(_) => ErrorKind::Storage,
        }
    }

    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{} '{}'", what, id))
    }

    /// True for failures that a later tick may not hit again (I/O, locks).
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Storage
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn storage_errors_share_a_kind() {
        assert_eq!(KernelError::Store("x".into()).kind(), ErrorKind::Storage);
        assert_eq!(KernelError::Queue("x".into()).kind(), ErrorKind::Storage);
        assert!(KernelError::Driver("x".into()).is_transient());
        assert!(!KernelError::Conflict("x".into()).is_transient());
        assert_eq!(
            KernelError::Driver("pool closed".into()).to_string(),
            "driver error: pool closed"
        );
    }

    #[test]
    fn not_found_names_the_entity() {
        let err = KernelError::not_found("cluster", "c-1");
        assert_eq!(err.to_string(), "not found: cluster 'c-1'");
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
