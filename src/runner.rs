use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tracing::{debug, warn};

use crate::{
    context, propagator, ClientSession, DocumentStore, RunError, RunnerConfig, SessionSource,
    TransactionError,
};

/// Result envelope of a transaction run.
///
/// Exactly one side is populated: `Committed` carries the unit of work's
/// value, `Failed` carries what went wrong. Nothing is ever raised out of a
/// run; callers branch on this value instead.
#[derive(Debug)]
#[must_use]
pub enum TransactionOutcome<T, E> {
    Committed(T),
    Failed(RunError<E>),
}

impl<T, E> TransactionOutcome<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, TransactionOutcome::Committed(_))
    }

    pub fn result(&self) -> Option<&T> {
        match self {
            TransactionOutcome::Committed(value) => Some(value),
            TransactionOutcome::Failed(_) => None,
        }
    }

    pub fn error(&self) -> Option<&RunError<E>> {
        match self {
            TransactionOutcome::Committed(_) => None,
            TransactionOutcome::Failed(err) => Some(err),
        }
    }

    pub fn into_result(self) -> Result<T, RunError<E>> {
        match self {
            TransactionOutcome::Committed(value) => Ok(value),
            TransactionOutcome::Failed(err) => Err(err),
        }
    }
}

impl<T, E> From<TransactionOutcome<T, E>> for Result<T, RunError<E>> {
    fn from(outcome: TransactionOutcome<T, E>) -> Self {
        outcome.into_result()
    }
}

/// Runs units of work inside a transaction on sessions from `S`.
///
/// Each run takes its own session: begin, run, commit or abort, end.
/// Runs share nothing but the process-wide propagation switch, so any number
/// may execute concurrently.
pub struct TransactionRunner<S: SessionSource> {
    source: S,
    config: RunnerConfig,
}

impl<S: SessionSource> TransactionRunner<S> {
    pub fn new(source: S) -> Self {
        Self::with_config(source, RunnerConfig::default())
    }

    pub fn with_config(source: S, config: RunnerConfig) -> Self {
        Self { source, config }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Runs `unit_of_work` in a fresh transaction.
    ///
    /// `Ok` commits, `Err` or a panic aborts. The session is ended on every
    /// path once it has been opened.
    pub async fn run<T, E, F, Fut>(&self, unit_of_work: F) -> TransactionOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let propagate = self.config.propagate_session;
        if propagate {
            propagator::install();
        }

        let session = match self.source.start_session().await {
            Ok(session) => session,
            Err(err) => {
                warn!(error = %err, "failed to open session");
                return TransactionOutcome::Failed(RunError::Transaction(err));
            }
        };

        let outcome = self.run_in_session(&session, propagate, unit_of_work).await;
        session.end_session().await;
        outcome
    }

    async fn run_in_session<T, E, F, Fut>(
        &self,
        session: &S::Session,
        propagate: bool,
        unit_of_work: F,
    ) -> TransactionOutcome<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let session_id = session.id();
        if let Err(err) = session.start_transaction().await {
            warn!(session = %session_id, error = %err, "failed to start transaction");
            return TransactionOutcome::Failed(RunError::Transaction(err));
        }

        let work = async {
            if propagate {
                context::scope(session.clone(), unit_of_work()).await
            } else {
                unit_of_work().await
            }
        };

        match AssertUnwindSafe(work).catch_unwind().await {
            Ok(Ok(value)) => match session.commit_transaction().await {
                Ok(()) => {
                    debug!(session = %session_id, "unit of work committed");
                    TransactionOutcome::Committed(value)
                }
                Err(err) => {
                    warn!(session = %session_id, error = %err, "commit failed");
                    TransactionOutcome::Failed(RunError::Transaction(err))
                }
            },
            Ok(Err(err)) => {
                debug!(session = %session_id, "unit of work failed, aborting");
                abort(session).await;
                TransactionOutcome::Failed(RunError::UnitOfWork(err))
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(session = %session_id, panic = %message, "unit of work panicked, aborting");
                abort(session).await;
                TransactionOutcome::Failed(RunError::Panicked(message))
            }
        }
    }
}

/// Runs `unit_of_work` in a transaction on the default document store.
///
/// Session propagation is always on here, so document calls inside the unit
/// of work join the transaction without being handed the session.
pub async fn run_transaction<T, E, F, Fut>(unit_of_work: F) -> TransactionOutcome<T, E>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    match DocumentStore::default_store() {
        Some(store) => TransactionRunner::new(store.clone()).run(unit_of_work).await,
        None => TransactionOutcome::Failed(RunError::Transaction(TransactionError::NoDefaultStore)),
    }
}

// The unit of work's error is what the caller sees; a failed abort is only logged.
async fn abort<C: ClientSession>(session: &C) {
    if let Err(err) = session.abort_transaction().await {
        warn!(session = %session.id(), error = %err, "abort failed");
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
