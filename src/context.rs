//! Ambient session for the current logical call chain.
//!
//! The slot is task-local: it is visible to everything awaited inside
//! [`scope`] and to nothing else. Two runners executing concurrently each see
//! only their own session, and a nested scope shadows the outer one until it
//! completes. Tasks spawned from inside a scope do not inherit it.

use std::any::Any;
use std::future::Future;
use std::sync::Arc;
use uuid::Uuid;

use crate::ClientSession;

tokio::task_local! {
    static AMBIENT_SESSION: AmbientSession;
}

#[derive(Clone)]
struct AmbientSession {
    id: Uuid,
    handle: Arc<dyn Any + Send + Sync>,
}

/// Runs `future` with `session` as the ambient session.
pub async fn scope<S, F>(session: S, future: F) -> F::Output
where
    S: ClientSession,
    F: Future,
{
    let ambient = AmbientSession {
        id: session.id(),
        handle: Arc::new(session),
    };
    AMBIENT_SESSION.scope(ambient, future).await
}

/// The ambient session, if one is set and it is of type `S`.
pub fn current<S: ClientSession>() -> Option<S> {
    AMBIENT_SESSION
        .try_with(|ambient| ambient.handle.downcast_ref::<S>().cloned())
        .ok()
        .flatten()
}

pub fn current_session_id() -> Option<Uuid> {
    AMBIENT_SESSION.try_with(|ambient| ambient.id).ok()
}
