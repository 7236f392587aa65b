//! Unbounded async queue of panel updates.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

use super::PanelUpdate;

#[derive(Debug, Default)]
struct State {
    items: VecDeque<PanelUpdate>,
    closed: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    notify: Notify,
}

/// Queue between the sandbox (producer) and the merge loop (consumer).
///
/// Clones share the same queue. `push` never blocks; `next` waits until an
/// item arrives or the queue is closed. Items buffered at close time are
/// still handed out before `next` reports the end.
#[derive(Debug, Clone, Default)]
pub struct PanelUpdateQueue {
    shared: Arc<Shared>,
}

impl PanelUpdateQueue {
    /// Create an empty, open queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an update. Returns `false` if the queue is closed and the
    /// update was dropped.
    pub fn push(&self, update: PanelUpdate) -> bool {
        {
            let mut state = self.shared.state.lock();
            if state.closed {
                tracing::debug!(panel_id = %update.panel.id, "dropping panel update after close");
                return false;
            }
            state.items.push_back(update);
        }
        self.shared.notify.notify_one();
        true
    }

    /// Wait for the next update. `None` once closed and empty.
    ///
    /// Cancel-safe: dropping the future never loses an item.
    pub async fn next(&self) -> Option<PanelUpdate> {
        loop {
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(update) = state.items.pop_front() {
                    return Some(update);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Take the next update if one is ready.
    pub fn try_next(&self) -> Option<PanelUpdate> {
        self.shared.state.lock().items.pop_front()
    }

    /// Take every update that is ready.
    pub fn drain_ready(&self) -> Vec<PanelUpdate> {
        self.shared.state.lock().items.drain(..).collect()
    }

    /// Stop accepting updates and wake the consumer.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
        // Reaches every `Notified` created before this call, polled or not.
        self.shared.notify.notify_waiters();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Number of buffered updates.
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    /// Whether no updates are buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
