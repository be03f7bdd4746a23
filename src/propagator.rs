//! Ambient session injection for document operations.
//!
//! Every [`Model`](crate::Model) entry point passes its options through
//! [`intercept`] before touching the database. Until [`install`] has been
//! called the interception is inert; afterwards a call that carries no
//! session of its own picks up the ambient one from [`context`](crate::context).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, trace};

use crate::{context, ClientSession, Session};

static INSTALLED: AtomicBool = AtomicBool::new(false);

/// Document operations that go through interception.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Find,
    FindOne,
    FindById,
    Count,
    Aggregate,
    Create,
    Save,
    Remove,
    UpdateOne,
    UpdateMany,
    DeleteOne,
    DeleteMany,
    FindOneAndUpdate,
    FindOneAndDelete,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Find => "find",
            OperationKind::FindOne => "findOne",
            OperationKind::FindById => "findById",
            OperationKind::Count => "count",
            OperationKind::Aggregate => "aggregate",
            OperationKind::Create => "create",
            OperationKind::Save => "save",
            OperationKind::Remove => "remove",
            OperationKind::UpdateOne => "updateOne",
            OperationKind::UpdateMany => "updateMany",
            OperationKind::DeleteOne => "deleteOne",
            OperationKind::DeleteMany => "deleteMany",
            OperationKind::FindOneAndUpdate => "findOneAndUpdate",
            OperationKind::FindOneAndDelete => "findOneAndDelete",
        }
    }

    pub fn is_write(&self) -> bool {
        !matches!(
            self,
            OperationKind::Find
                | OperationKind::FindOne
                | OperationKind::FindById
                | OperationKind::Count
                | OperationKind::Aggregate
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-call options for document operations.
#[derive(Debug, Clone, Default)]
pub struct OperationOptions {
    /// Session to run the operation in. `None` runs on the pool directly,
    /// unless an ambient session is injected.
    pub session: Option<Session>,
}

impl OperationOptions {
    pub fn with_session(session: Session) -> Self {
        Self {
            session: Some(session),
        }
    }
}

impl From<Session> for OperationOptions {
    fn from(session: Session) -> Self {
        Self::with_session(session)
    }
}

/// Installs ambient session injection. Returns `true` only for the call that
/// actually installed it; later calls are no-ops.
pub fn install() -> bool {
    let first = INSTALLED
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok();
    if first {
        debug!("ambient session propagation installed");
    }
    first
}

pub fn is_installed() -> bool {
    INSTALLED.load(Ordering::Acquire)
}

/// Resolves the options an operation runs with.
///
/// An explicit session always wins. Otherwise, once installed, the ambient
/// session is filled in, creating the options if the caller passed none.
pub fn intercept(kind: OperationKind, options: Option<OperationOptions>) -> OperationOptions {
    let mut options = options.unwrap_or_default();
    if options.session.is_some() || !is_installed() {
        return options;
    }

    if let Some(session) = context::current::<Session>() {
        trace!(operation = %kind, session = %session.id(), "injecting ambient session");
        options.session = Some(session);
    }
    options
}
