use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;

/// Identifies a delayed call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DcId(u64);

/// Delayed callbacks owned by one session.
///
/// Calls run on the current worker's `LocalSet`. Dropping the owner cancels
/// every call that has not fired yet, so a callback never outlives the
/// session that armed it.
#[derive(Debug, Default)]
pub struct DelayedCalls {
    next_id: u64,
    calls: HashMap<DcId, JoinHandle<()>>,
}

impl DelayedCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` once after `delay`. Must be called from within a `LocalSet`.
    pub fn add<F>(&mut self, delay: Duration, f: F) -> DcId
    where
        F: FnOnce() + 'static,
    {
        self.calls.retain(|_, handle| !handle.is_finished());

        self.next_id += 1;
        let id = DcId(self.next_id);
        let handle = tokio::task::spawn_local(async move {
            tokio::time::sleep(delay).await;
            f();
        });
        self.calls.insert(id, handle);
        id
    }

    /// Cancel a call. Returns false if it already ran or was cancelled.
    pub fn cancel(&mut self, id: DcId) -> bool {
        match self.calls.remove(&id) {
            Some(handle) if !handle.is_finished() => {
                handle.abort();
                true
            }
            _ => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, handle) in self.calls.drain() {
            handle.abort();
        }
    }

    /// Calls that have not fired yet
    pub fn pending(&self) -> usize {
        self.calls.values().filter(|h| !h.is_finished()).count()
    }
}

impl Drop for DelayedCalls {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
