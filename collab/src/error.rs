use thiserror::Error;

/// How a caller should react to a collaborator failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollabErrorKind {
    /// Retrying later may succeed; leave state untouched.
    Transient,
    /// The counter-side refused the request; retrying cannot help.
    Rejected,
    /// Misconfiguration or a broken invariant.
    Fatal,
}

#[derive(Debug, Clone, Error)]
pub enum CollabError {
    #[error("transient collaborator failure: {0}")]
    Transient(String),

    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("fatal collaborator failure: {0}")]
    Fatal(String),
}

impl CollabError {
    pub fn kind(&self) -> CollabErrorKind {
        match self {
            Self::Transient(_) => CollabErrorKind::Transient,
            Self::Rejected(_) => CollabErrorKind::Rejected,
            Self::Fatal(_) => CollabErrorKind::Fatal,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(m) | Self::Rejected(m) | Self::Fatal(m) => m,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == CollabErrorKind::Transient
    }
}
