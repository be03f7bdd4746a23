use uuid::Uuid;

/// Error type for session, transaction and document operations
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("Transaction begin failed: {0}")]
    BeginFailed(#[source] sqlx::Error),

    #[error("Transaction commit failed: {0}")]
    CommitFailed(#[source] sqlx::Error),

    #[error("Transaction rollback failed: {0}")]
    RollbackFailed(#[source] sqlx::Error),

    #[error("Session {0} already has a transaction in progress")]
    TransactionInProgress(Uuid),

    #[error("Session {0} has no active transaction")]
    NoActiveTransaction(Uuid),

    #[error("Session {0} has already ended")]
    SessionEnded(Uuid),

    #[error("Invalid collection name: {0:?}")]
    InvalidCollection(String),

    #[error("Document serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("A default document store is already configured")]
    DefaultStoreAlreadySet,

    #[error("No default document store configured")]
    NoDefaultStore,

    #[error("Database error: {0}")]
    DatabaseError(#[from] sqlx::Error),
}

/// Result type for session, transaction and document operations
pub type TransactionResult<T> = Result<T, TransactionError>;

/// Failure half of a [`TransactionOutcome`](crate::TransactionOutcome).
///
/// `UnitOfWork` carries the caller's own error untouched. `Transaction` means
/// the session or transaction machinery itself failed after the unit of work
/// was (or would have been) run.
#[derive(Debug, thiserror::Error)]
pub enum RunError<E> {
    #[error("Unit of work failed: {0}")]
    UnitOfWork(E),

    #[error("Transaction infrastructure failed: {0}")]
    Transaction(#[source] TransactionError),

    #[error("Unit of work panicked: {0}")]
    Panicked(String),
}

impl<E> RunError<E> {
    /// Returns the caller's error if the unit of work itself failed.
    pub fn unit_of_work(&self) -> Option<&E> {
        match self {
            RunError::UnitOfWork(err) => Some(err),
            _ => None,
        }
    }

    pub fn is_infrastructure(&self) -> bool {
        matches!(self, RunError::Transaction(_))
    }
}
