//! Document Transaction Module
//!
//! Runs units of work inside database transactions against a PostgreSQL-backed
//! document store and reports every outcome through a result envelope.
//! Document calls made inside a run can join its transaction implicitly
//! through a task-local ambient session.

pub mod config;
pub mod context;
pub mod error;
pub mod model;
pub mod propagator;
pub mod runner;
pub mod session;
pub mod store;

pub use config::{RunnerConfig, StoreConfig};
pub use error::{RunError, TransactionError, TransactionResult};
pub use model::{Document, Filter, Model, Stage, Update};
pub use propagator::{OperationKind, OperationOptions};
pub use runner::{run_transaction, TransactionOutcome, TransactionRunner};
pub use session::{Session, SessionState};
pub use store::{ClientSession, DocumentStore, SessionSource};
