use crate::blocks::QueueEntry;
use std::collections::VecDeque;
use std::sync::Mutex;
use tokio::sync::Notify;

/// Bounded buffer of queue entries ahead of the fetch stage.
///
/// `push` suspends the caller while the buffer is full; this is the
/// backpressure surface `enqueue_blocks` exposes to height producers.
pub(crate) struct EntryBuffer<B> {
    state: Mutex<VecDeque<QueueEntry<B>>>,
    notify: Notify,
    capacity: usize,
}

impl<B> EntryBuffer<B> {
    pub(crate) fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "buffer capacity must be greater than zero");
        Self {
            state: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity,
        }
    }

    pub(crate) async fn push(&self, entry: QueueEntry<B>) {
        let mut pending = Some(entry);
        loop {
            let notified = self.notify.notified();
            {
                let mut entries = self.state.lock().unwrap();
                if entries.len() < self.capacity {
                    entries.push_back(pending.take().expect("entry pushed twice"));
                    drop(entries);
                    self.notify.notify_waiters();
                    return;
                }
            }
            notified.await;
        }
    }

    pub(crate) fn pop(&self) -> Option<QueueEntry<B>> {
        let entry = self.state.lock().unwrap().pop_front();
        if entry.is_some() {
            self.notify.notify_waiters();
        }
        entry
    }

    /// Height of the entry the pump would take next.
    pub(crate) fn peek_height(&self) -> Option<u64> {
        self.state.lock().unwrap().front().map(QueueEntry::height)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().unwrap().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.state.lock().unwrap().is_empty()
    }

    pub(crate) fn free_space(&self) -> usize {
        self.capacity.saturating_sub(self.len())
    }

    pub(crate) fn clear(&self) {
        self.state.lock().unwrap().clear();
        self.notify.notify_waiters();
    }
}
