//! ABOUTME: In-process cancellation bus keyed by execution id
//! ABOUTME: CancelJob reaches the running handler through its context token

use dashmap::DashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

/// Registry of live execution cancellation tokens. Handlers register their
/// job context token under the exec_id while running; `cancel` trips it.
#[derive(Clone, Default)]
pub struct CancellationBus {
    tokens: Arc<DashMap<Uuid, CancellationToken>>,
}

impl CancellationBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a running execution's token. Re-registration for the same
    /// exec_id (a resumed execution) replaces the old token.
    pub fn register(&self, exec_id: Uuid, token: CancellationToken) {
        self.tokens.insert(exec_id, token);
    }

    /// Detach on handler exit; the token is left in whatever state it is in
    pub fn unregister(&self, exec_id: Uuid) {
        self.tokens.remove(&exec_id);
    }

    /// Cancel the running handler of an execution. Returns false when no
    /// handler is live for the id (nothing to cancel locally).
    pub fn cancel(&self, exec_id: Uuid) -> bool {
        match self.tokens.get(&exec_id) {
            Some(token) => {
                debug!(exec_id = %exec_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Number of live registrations
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
