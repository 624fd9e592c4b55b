//! Two-tier delivery scheduler.
//!
//! - the immediate tier carries callback deliveries and is drained at the
//!   end of the unit of work that queued them
//! - the coalesced tier carries managed-state deliveries; everything queued
//!   before the writer yields to the executor is drained as one batch inside
//!   a single [`UpdateBatcher::batch_updates`] call
//!
//! A write is complete once [`UpdateScheduler::settle`] returns for the
//! ticket it was given, at which point both tiers have delivered.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// A queued delivery.
pub type Action = Box<dyn FnOnce() + Send>;

/// Coalescing primitive of the subscriber runtime.
///
/// Every state replacement made while `updates` runs should become visible
/// as one update cycle.
pub trait UpdateBatcher: Send + Sync {
    fn batch_updates(&self, updates: &mut dyn FnMut());
}

/// Runs updates directly, one visible change per replacement.
#[derive(Clone, Copy, Debug, Default)]
pub struct ImmediateBatcher;

impl UpdateBatcher for ImmediateBatcher {
    fn batch_updates(&self, updates: &mut dyn FnMut()) {
        updates();
    }
}

/// Identifies the coalesced batch an action was queued into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct BatchTicket(u64);

#[derive(Default)]
struct SchedulerState {
    immediate: VecDeque<Action>,
    draining_immediate: bool,
    coalesced: Vec<Action>,
    /// Generation of the batch currently accepting actions.
    generation: u64,
}

pub struct UpdateScheduler {
    state: Mutex<SchedulerState>,
    batcher: Arc<dyn UpdateBatcher>,
}

impl UpdateScheduler {
    pub fn new(batcher: Arc<dyn UpdateBatcher>) -> Self {
        Self {
            state: Mutex::new(SchedulerState::default()),
            batcher,
        }
    }

    /// Queue a callback-tier delivery.
    pub fn schedule_immediate(&self, action: Action) {
        self.state.lock().immediate.push_back(action);
    }

    /// Run queued callback-tier deliveries.
    ///
    /// Re-entrant calls (a delivery that writes again) return at once; the
    /// outer drain picks up whatever they queued.
    pub fn flush_immediate(&self) {
        {
            let mut state = self.state.lock();
            if state.draining_immediate {
                return;
            }
            state.draining_immediate = true;
        }

        loop {
            let next = {
                let mut state = self.state.lock();
                match state.immediate.pop_front() {
                    Some(action) => action,
                    None => {
                        state.draining_immediate = false;
                        return;
                    }
                }
            };
            next();
        }
    }

    /// Queue a managed-state delivery into the open batch.
    pub fn schedule_batched(&self, action: Action) -> BatchTicket {
        let mut state = self.state.lock();
        state.coalesced.push(action);
        BatchTicket(state.generation)
    }

    /// Ticket of the batch currently accepting actions.
    pub fn current_ticket(&self) -> BatchTicket {
        BatchTicket(self.state.lock().generation)
    }

    /// Drain the batch identified by `ticket` if it has not been drained yet.
    pub fn flush_batch(&self, ticket: BatchTicket) {
        let actions = {
            let mut state = self.state.lock();
            if state.generation != ticket.0 {
                return;
            }
            state.generation += 1;
            std::mem::take(&mut state.coalesced)
        };
        if actions.is_empty() {
            return;
        }

        let mut actions = Some(actions);
        self.batcher.batch_updates(&mut || {
            for action in actions.take().into_iter().flatten() {
                action();
            }
        });
    }

    /// Wait until both tiers have delivered everything up to `ticket`.
    ///
    /// Yields once so other writers in the same turn can join the batch.
    pub async fn settle(&self, ticket: BatchTicket) {
        self.flush_immediate();
        tokio::task::yield_now().await;
        self.flush_immediate();
        self.flush_batch(ticket);
    }
}

impl Default for UpdateScheduler {
    fn default() -> Self {
        Self::new(Arc::new(ImmediateBatcher))
    }
}
