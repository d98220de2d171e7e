// ABOUTME: Table of in-flight calls keyed by correlation id
// ABOUTME: Resolves each waiting caller at most once when its reply envelope arrives

//! Pending-call table.
//!
//! Each outstanding call owns one entry: a single-use `oneshot` sender keyed by
//! its correlation id. Resolving an entry removes it, so a duplicate or late
//! reply finds nothing and is dropped with a warning instead of reaching a
//! second caller.
//!
//! The table belongs to one [`BrokerClient`](super::BrokerClient). There is no
//! process-wide state. A [`PendingGuard`] ties an entry to the caller's future,
//! so a caller that is dropped or aborted takes its entry with it.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, warn};

use super::CallError;
use crate::broker::envelope::{CorrelationId, Envelope};

/// Outcome delivered to a waiting caller
pub type CallResult = Result<Value, CallError>;

/// One outstanding call.
#[derive(Debug)]
struct PendingCall {
    reply_tx: oneshot::Sender<CallResult>,
    created_at: Instant,
    ticket: u64,
}

/// What happened to an inbound reply line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// The matching caller was resolved and its entry removed
    Resolved(CorrelationId),
    /// No call with this id is pending
    Unmatched(CorrelationId),
    /// The line was not a valid envelope
    Malformed,
}

/// Thread-safe map of correlation id to waiting caller.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<CorrelationId, PendingCall>>,
    tickets: AtomicU64,
}

/// Removes its call from the table when dropped, unless the entry was already
/// resolved or the id has since been registered again.
#[derive(Debug)]
pub struct PendingGuard {
    pending: Arc<PendingCalls>,
    id: CorrelationId,
    ticket: u64,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        if let Ok(mut calls) = self.pending.calls.try_lock() {
            forget(&mut calls, &self.id, self.ticket);
            return;
        }

        // Table is busy; finish the removal on the runtime.
        let Ok(runtime) = Handle::try_current() else {
            return;
        };
        let pending = Arc::clone(&self.pending);
        let id = self.id.clone();
        let ticket = self.ticket;
        runtime.spawn(async move {
            forget(&mut *pending.calls.lock().await, &id, ticket);
        });
    }
}

fn forget(calls: &mut HashMap<CorrelationId, PendingCall>, id: &CorrelationId, ticket: u64) {
    if calls.get(id).is_some_and(|call| call.ticket == ticket) {
        calls.remove(id);
        debug!(correlation_id = %id, "Abandoned call removed");
    }
}

impl PendingCalls {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call and return the receiver its reply will arrive on.
    ///
    /// The entry lives no longer than the returned guard.
    pub async fn register(
        self: &Arc<Self>,
        id: CorrelationId,
    ) -> Result<(oneshot::Receiver<CallResult>, PendingGuard), CallError> {
        let mut calls = self.calls.lock().await;
        if calls.contains_key(&id) {
            return Err(CallError::DuplicateId(id.to_string()));
        }

        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();
        calls.insert(
            id.clone(),
            PendingCall {
                reply_tx,
                created_at: Instant::now(),
                ticket,
            },
        );
        let guard = PendingGuard {
            pending: Arc::clone(self),
            id,
            ticket,
        };
        Ok((reply_rx, guard))
    }

    /// Resolve the caller waiting on `envelope.id`.
    pub async fn resolve(&self, envelope: Envelope) -> DispatchOutcome {
        let Some(call) = self.calls.lock().await.remove(&envelope.id) else {
            warn!(correlation_id = %envelope.id, "Reply has no pending call, dropping");
            return DispatchOutcome::Unmatched(envelope.id);
        };

        let elapsed = call.created_at.elapsed();
        let result = envelope.body.into_result().map_err(CallError::Remote);

        if call.reply_tx.send(result).is_err() {
            // Caller gave up between the lookup and the send.
            debug!(correlation_id = %envelope.id, "Caller went away before its reply");
        } else {
            debug!(
                correlation_id = %envelope.id,
                elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
                "Resolved call"
            );
        }

        DispatchOutcome::Resolved(envelope.id)
    }

    /// Decode one raw reply line and resolve its caller.
    pub async fn dispatch(&self, line: &str) -> DispatchOutcome {
        match Envelope::from_line(line) {
            Ok(envelope) => self.resolve(envelope).await,
            Err(e) => {
                warn!(error = %e, "Malformed reply envelope, dropping");
                DispatchOutcome::Malformed
            }
        }
    }

    /// Fail every pending call, returning how many were failed.
    pub async fn fail_all(&self, error: impl Fn() -> CallError) -> usize {
        let drained: Vec<_> = self.calls.lock().await.drain().collect();
        let count = drained.len();
        for (_, call) in drained {
            let _ = call.reply_tx.send(Err(error()));
        }
        count
    }

    /// Whether `id` is still waiting for a reply
    pub async fn contains(&self, id: &CorrelationId) -> bool {
        self.calls.lock().await.contains_key(id)
    }

    /// Number of outstanding calls
    pub async fn len(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// True when nothing is outstanding
    pub async fn is_empty(&self) -> bool {
        self.calls.lock().await.is_empty()
    }
}
