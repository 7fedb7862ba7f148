//! Concurrency Kernel (C9) — the two cooperative job slots (`llm`, `db`),
//! their priority-preemption protocol, and the background-create signal the
//! idle worker waits on.
//!
//! A slot has exactly one holder at a time. `claim` only blocks the caller
//! when the same `key` is already running under that slot *and* the caller
//! isn't an urgent (`priority > 0`) request displacing a background
//! (`priority == 0`) holder — any other caller becomes holder immediately,
//! cancelling whoever held it before. The previous holder is expected to
//! check [`JobSlotTicket::is_current_holder`] at every `await` boundary and
//! return without mutating shared state once it observes it's lost the
//! slot; [`JobSlotTicket::cancel_token`] additionally lets it cancel any
//! LLM/warehouse RPC it's waiting on rather than just polling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;

pub type HolderId = u64;

struct JobSlotState {
    holder: HolderId,
    priority: u32,
    running_key: Option<String>,
    cancel_token: CancellationToken,
}

/// One of the two cooperative job slots (`llm` or `db`).
pub struct JobSlot {
    name: &'static str,
    state: Mutex<JobSlotState>,
    next_holder: AtomicU64,
    released: Notify,
}

impl JobSlot {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            state: Mutex::new(JobSlotState {
                holder: 0,
                priority: 0,
                running_key: None,
                cancel_token: CancellationToken::new(),
            }),
            next_holder: AtomicU64::new(0),
            released: Notify::new(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Become the slot's holder for `key` at `priority`, preempting any
    /// current holder unless one is already running the identical `key`
    /// and this call isn't an urgent request displacing a background one.
    pub async fn claim(self: &Arc<Self>, priority: u32, key: impl Into<String>) -> JobSlotTicket {
        let key = key.into();
        loop {
            {
                let mut state = self.state.lock().await;
                let same_key = state.running_key.as_deref() == Some(key.as_str());
                let urgent_preempts_background = priority > 0 && state.priority == 0;

                if !(same_key && !urgent_preempts_background) {
                    let holder = self.next_holder.fetch_add(1, Ordering::SeqCst) + 1;
                    state.cancel_token.cancel();
                    state.cancel_token = CancellationToken::new();
                    state.holder = holder;
                    state.priority = priority;
                    state.running_key = Some(key.clone());
                    let token = state.cancel_token.clone();
                    tracing::debug!(slot = self.name, holder, priority, key = %key, "claimed job slot");
                    return JobSlotTicket {
                        slot: Arc::clone(self),
                        holder,
                        cancel_token: token,
                    };
                }
            }
            self.released.notified().await;
        }
    }

    async fn is_current_holder(&self, holder: HolderId) -> bool {
        self.state.lock().await.holder == holder
    }

    async fn release(&self, holder: HolderId) {
        let mut state = self.state.lock().await;
        if state.holder == holder {
            state.priority = 0;
            state.running_key = None;
            tracing::debug!(slot = self.name, holder, "released job slot");
        }
        drop(state);
        self.released.notify_waiters();
    }
}

/// RAII proof of holding a [`JobSlot`]. Dropping it releases the slot.
pub struct JobSlotTicket {
    slot: Arc<JobSlot>,
    holder: HolderId,
    pub cancel_token: CancellationToken,
}

impl JobSlotTicket {
    /// Whether this ticket still owns its slot — must be checked at every
    /// `await` boundary and loop iteration per the preemption protocol.
    pub async fn is_current_holder(&self) -> bool {
        self.slot.is_current_holder(self.holder).await
    }

    pub async fn release(self) {
        self.slot.release(self.holder).await;
    }
}

/// The background-create event the idle worker waits on (§4.10): set
/// whenever a foreground request releases the `db` slot.
#[derive(Default)]
pub struct BackgroundSignal {
    notify: Notify,
}

impl BackgroundSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn signal(&self) {
        self.notify.notify_one();
    }

    pub async fn wait(&self) {
        self.notify.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_claim_of_different_key_preempts_first() {
        let slot = Arc::new(JobSlot::new("llm"));
        let first = slot.claim(0, "q1").await;
        assert!(first.is_current_holder().await);

        let second = slot.claim(0, "q2").await;
        assert!(!first.is_current_holder().await);
        assert!(second.is_current_holder().await);
    }

    #[tokio::test]
    async fn urgent_claim_preempts_background_holder_of_same_key() {
        let slot = Arc::new(JobSlot::new("db"));
        let background = slot.claim(0, "q1").await;
        let urgent = slot.claim(1, "q1").await;
        assert!(!background.is_current_holder().await);
        assert!(urgent.is_current_holder().await);
    }

    #[tokio::test]
    async fn release_resets_priority_and_key() {
        let slot = Arc::new(JobSlot::new("db"));
        let ticket = slot.claim(1, "q1").await;
        ticket.release().await;
        let reclaimed = slot.claim(0, "q1").await;
        assert!(reclaimed.is_current_holder().await);
    }

    #[tokio::test]
    async fn background_signal_wakes_waiter() {
        let signal = Arc::new(BackgroundSignal::new());
        let waiter = Arc::clone(&signal);
        let handle = tokio::spawn(async move {
            waiter.wait().await;
        });
        tokio::task::yield_now().await;
        signal.signal();
        handle.await.unwrap();
    }
}
