//! Single-flight execution of reconciliation passes.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::reconciler::{Reconciler, SyncOutcome};
use crate::error::Result;

/// A request for a reconciliation pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncRequest {
    pub reason: String,
    pub force: bool,
}

impl SyncRequest {
    pub fn new(reason: impl Into<String>, force: bool) -> Self {
        Self {
            reason: reason.into(),
            force,
        }
    }

    /// Fold a newer request into this one: the newer reason wins, `force` sticks.
    fn merge(&mut self, newer: Self) {
        self.reason = newer.reason;
        self.force |= newer.force;
    }
}

#[derive(Debug, Default)]
struct Slot {
    running: bool,
    pending: Option<SyncRequest>,
}

/// Runs at most one reconciliation at a time.
///
/// Requests that arrive while a pass is running are coalesced into a single
/// pending request, which the running caller executes before returning.
/// If a pass fails, the pending request is dropped and the error is returned
/// to the caller that started the run.
pub struct SyncSequencer {
    reconciler: Arc<Reconciler>,
    slot: Mutex<Slot>,
}

impl SyncSequencer {
    pub fn new(reconciler: Arc<Reconciler>) -> Self {
        Self {
            reconciler,
            slot: Mutex::new(Slot::default()),
        }
    }

    pub fn reconciler(&self) -> &Arc<Reconciler> {
        &self.reconciler
    }

    pub fn is_running(&self) -> bool {
        self.lock_slot().running
    }

    pub fn pending(&self) -> Option<SyncRequest> {
        self.lock_slot().pending.clone()
    }

    /// Drop the queued follow-up, if any. A pass already running completes.
    pub fn clear_pending(&self) -> Option<SyncRequest> {
        let dropped = self.lock_slot().pending.take();
        if let Some(request) = &dropped {
            tracing::debug!(reason = %request.reason, "Cleared queued sync request");
        }
        dropped
    }

    pub async fn request(&self, reason: impl Into<String>, force: bool) -> Result<SyncOutcome> {
        let request = SyncRequest::new(reason, force);
        {
            let mut slot = self.lock_slot();
            if slot.running {
                tracing::debug!(reason = %request.reason, force, "Sync already running; queued");
                match slot.pending.as_mut() {
                    Some(pending) => pending.merge(request),
                    None => slot.pending = Some(request),
                }
                return Ok(SyncOutcome::Queued);
            }
            slot.running = true;
        }

        self.drain(request).await
    }

    async fn drain(&self, first: SyncRequest) -> Result<SyncOutcome> {
        let mut run = RunGuard {
            slot: &self.slot,
            armed: true,
        };
        let mut next = first;

        loop {
            let result = self.reconciler.reconcile(&next.reason, next.force).await;
            let follow_up = self.finish_pass(&next, result.is_ok());
            match (result, follow_up) {
                (Ok(_), Some(pending)) => next = pending,
                (result, _) => {
                    run.armed = false;
                    return result;
                }
            }
        }
    }

    /// Take the pending request after a pass, or release the running flag.
    ///
    /// `None` from a failed pass means any pending request was dropped.
    fn finish_pass(&self, finished: &SyncRequest, succeeded: bool) -> Option<SyncRequest> {
        let mut slot = self.lock_slot();
        let pending = slot.pending.take();
        if succeeded && pending.is_some() {
            return pending;
        }

        slot.running = false;
        if let Some(dropped) = pending {
            tracing::warn!(
                failed_reason = %finished.reason,
                reason = %dropped.reason,
                force = dropped.force,
                "Dropping queued sync request after failed pass"
            );
        }
        None
    }

    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the running flag if the draining future is dropped mid-pass.
struct RunGuard<'a> {
    slot: &'a Mutex<Slot>,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            slot.running = false;
            slot.pending = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_keeps_newest_reason_and_sticky_force() {
        let mut pending = SyncRequest::new("interval", true);
        pending.merge(SyncRequest::new("online", false));
        assert_eq!(pending, SyncRequest::new("online", true));

        let mut pending = SyncRequest::new("interval", false);
        pending.merge(SyncRequest::new("visible", false));
        assert!(!pending.force);
    }
}
