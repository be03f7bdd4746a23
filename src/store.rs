use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::OnceLock;
use tracing::debug;
use uuid::Uuid;

use crate::{
    Document, Model, Session, StoreConfig, TransactionError, TransactionResult, TransactionRunner,
};

static DEFAULT_STORE: OnceLock<DocumentStore> = OnceLock::new();

/// Source of database sessions for a [`TransactionRunner`].
#[async_trait]
pub trait SessionSource: Send + Sync {
    type Session: ClientSession;

    /// Open a new session. No transaction is started yet.
    async fn start_session(&self) -> TransactionResult<Self::Session>;
}

/// A database session able to carry one transaction at a time.
///
/// Handles are cloned into the ambient context, so implementations should be
/// cheap to clone and share their state between clones.
#[async_trait]
pub trait ClientSession: Clone + Send + Sync + 'static {
    fn id(&self) -> Uuid;

    async fn start_transaction(&self) -> TransactionResult<()>;

    async fn commit_transaction(&self) -> TransactionResult<()>;

    async fn abort_transaction(&self) -> TransactionResult<()>;

    /// Release the session. Must be safe to call on every exit path.
    async fn end_session(&self);
}

/// Document store backed by PostgreSQL JSONB collections.
#[derive(Clone, Debug)]
pub struct DocumentStore {
    pool: PgPool,
}

impl DocumentStore {
    /// Create a new DocumentStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(config: &StoreConfig) -> TransactionResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await?;

        debug!(max_connections = config.max_connections, "document store connected");
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn model<D: Document>(&self) -> TransactionResult<Model<D>> {
        Model::new(self.pool.clone())
    }

    /// A runner with the default configuration over this store.
    pub fn runner(&self) -> TransactionRunner<DocumentStore> {
        TransactionRunner::new(self.clone())
    }

    /// Registers this store as the process default used by
    /// [`run_transaction`](crate::run_transaction). Can be set only once.
    pub fn set_default(self) -> TransactionResult<()> {
        DEFAULT_STORE
            .set(self)
            .map_err(|_| TransactionError::DefaultStoreAlreadySet)
    }

    pub fn default_store() -> Option<&'static DocumentStore> {
        DEFAULT_STORE.get()
    }
}

#[async_trait]
impl SessionSource for DocumentStore {
    type Session = Session;

    async fn start_session(&self) -> TransactionResult<Self::Session> {
        let session = Session::new(self.pool.clone());
        debug!(session = %session.id(), "session opened");
        Ok(session)
    }
}
