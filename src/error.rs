use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum IndexingError {
    #[error("Uniqueness constraint violated on index {index} for key {key}")]
    UniquenessViolation { index: String, key: String },

    #[error("Workflow queue invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Workflow queue unreachable: {0}")]
    UnreachableQueue(String),

    #[error("Actor unreachable: {0}")]
    ActorUnreachable(String),

    #[error("Index not found: {0}")]
    IndexNotFound(String),

    #[error("No entry in index {index} for key {key}")]
    KeyNotFound { index: String, key: String },

    #[error("Expected one entry in index {index} for key {key}, found {count}")]
    MultipleFound {
        index: String,
        key: String,
        count: usize,
    },

    #[error("Index unavailable: {0}")]
    IndexUnavailable(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("State store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(String),
}

pub type Result<T> = std::result::Result<T, IndexingError>;

impl From<std::io::Error> for IndexingError {
    fn from(e: std::io::Error) -> Self {
        IndexingError::Io(e.to_string())
    }
}

impl From<serde_json::Error> for IndexingError {
    fn from(e: serde_json::Error) -> Self {
        IndexingError::Json(e.to_string())
    }
}

impl IndexingError {
    /// Transient failures that a later drain cycle or reactivation may get past.
    pub fn is_retryable(&self) -> bool {
        match self {
            IndexingError::UnreachableQueue(_) => true,
            IndexingError::ActorUnreachable(_) => true,
            IndexingError::Store(_) => true,
            IndexingError::Io(_) => true,
            IndexingError::IndexUnavailable(_) => true,
            IndexingError::UniquenessViolation { .. } => false,
            IndexingError::InvariantViolation(_) => false,
            IndexingError::IndexNotFound(_) => false,
            IndexingError::KeyNotFound { .. } => false,
            IndexingError::MultipleFound { .. } => false,
            IndexingError::Configuration(_) => false,
            IndexingError::Json(_) => false,
        }
    }

    pub fn is_uniqueness_violation(&self) -> bool {
        matches!(self, IndexingError::UniquenessViolation { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(IndexingError::UnreachableQueue("q".into()).is_retryable());
        assert!(IndexingError::Store("disk".into()).is_retryable());
        assert!(!IndexingError::InvariantViolation("head".into()).is_retryable());
        assert!(!IndexingError::UniquenessViolation {
            index: "email".into(),
            key: "a@b".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_messages_name_the_index() {
        let e = IndexingError::MultipleFound {
            index: "location".into(),
            key: "Seattle".into(),
            count: 2,
        };
        assert_eq!(
            e.to_string(),
            "Expected one entry in index location for key Seattle, found 2"
        );
    }
}
