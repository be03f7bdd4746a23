use async_trait::async_trait;
use parking_lot::RwLock;
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::{ClientSession, TransactionError, TransactionResult};

/// Lifecycle of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    InTransaction,
    Committed,
    Aborted,
    Ended,
}

/// Session handle over a PostgreSQL connection pool.
///
/// Cloning is cheap and every clone refers to the same underlying
/// transaction, so a session can be handed to any number of models within a
/// unit of work. Operations sharing one session are serialised on the
/// transaction lock.
#[derive(Clone, Debug)]
pub struct Session {
    inner: Arc<SessionInner>,
}

#[derive(Debug)]
struct SessionInner {
    id: Uuid,
    pool: PgPool,
    tx: Mutex<Option<Transaction<'static, Postgres>>>,
    state: RwLock<SessionState>,
}

impl Session {
    /// Creates an idle session; no connection is taken until a transaction starts.
    pub fn new(pool: PgPool) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id: Uuid::new_v4(),
                pool,
                tx: Mutex::new(None),
                state: RwLock::new(SessionState::Idle),
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.read()
    }

    pub fn is_ended(&self) -> bool {
        self.state() == SessionState::Ended
    }

    /// Locks the open transaction, if any, for running a statement on it.
    pub(crate) async fn transaction(&self) -> MutexGuard<'_, Option<Transaction<'static, Postgres>>> {
        self.inner.tx.lock().await
    }

    /// Takes ownership of the transaction, leaving None in its place.
    /// This should only be called when committing or rolling back.
    async fn take_transaction(&self) -> TransactionResult<Transaction<'static, Postgres>> {
        self.ensure_not_ended()?;
        self.inner
            .tx
            .lock()
            .await
            .take()
            .ok_or(TransactionError::NoActiveTransaction(self.inner.id))
    }

    fn ensure_not_ended(&self) -> TransactionResult<()> {
        if self.is_ended() {
            return Err(TransactionError::SessionEnded(self.inner.id));
        }
        Ok(())
    }

    /// Records how a taken transaction finished. The transaction is gone
    /// either way, so a failed commit or rollback leaves the session `Aborted`.
    fn settle(
        &self,
        result: Result<(), sqlx::Error>,
        settled: SessionState,
        wrap: fn(sqlx::Error) -> TransactionError,
    ) -> TransactionResult<()> {
        match result {
            Ok(()) => {
                self.set_state(settled);
                Ok(())
            }
            Err(err) => {
                self.set_state(SessionState::Aborted);
                Err(wrap(err))
            }
        }
    }

    fn set_state(&self, state: SessionState) {
        *self.inner.state.write() = state;
    }
}

#[async_trait]
impl ClientSession for Session {
    fn id(&self) -> Uuid {
        self.inner.id
    }

    async fn start_transaction(&self) -> TransactionResult<()> {
        self.ensure_not_ended()?;
        let mut guard = self.inner.tx.lock().await;
        if guard.is_some() {
            return Err(TransactionError::TransactionInProgress(self.inner.id));
        }

        let tx = self
            .inner
            .pool
            .begin()
            .await
            .map_err(TransactionError::BeginFailed)?;
        *guard = Some(tx);
        self.set_state(SessionState::InTransaction);

        debug!(session = %self.inner.id, "transaction started");
        Ok(())
    }

    async fn commit_transaction(&self) -> TransactionResult<()> {
        let tx = self.take_transaction().await?;
        self.settle(tx.commit().await, SessionState::Committed, TransactionError::CommitFailed)?;

        debug!(session = %self.inner.id, "transaction committed");
        Ok(())
    }

    async fn abort_transaction(&self) -> TransactionResult<()> {
        let tx = self.take_transaction().await?;
        self.settle(tx.rollback().await, SessionState::Aborted, TransactionError::RollbackFailed)?;

        debug!(session = %self.inner.id, "transaction aborted");
        Ok(())
    }

    async fn end_session(&self) {
        if self.is_ended() {
            return;
        }

        // An open transaction at this point was never settled; roll it back.
        if let Some(tx) = self.inner.tx.lock().await.take() {
            if let Err(err) = tx.rollback().await {
                warn!(session = %self.inner.id, error = %err, "rollback on session end failed");
            }
        }
        self.set_state(SessionState::Ended);

        debug!(session = %self.inner.id, "session ended");
    }
}
