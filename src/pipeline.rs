use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use std::{fmt, fmt::Display};

use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueuePolicy {
    #[default]
    Block,
    DropOldest,
    DropNewest,
}

impl Display for QueuePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Block => f.write_str("block"),
            Self::DropOldest => f.write_str("drop_oldest"),
            Self::DropNewest => f.write_str("drop_newest"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueSendError {
    Full,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueRecvError {
    Empty,
    Stopped,
    Disconnected,
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    Queued,
    DroppedOldest,
    DroppedNewest,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub depth: usize,
    pub peak_depth: usize,
    pub capacity: usize,
    pub dropped: u64,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    capacity: usize,
    stopped: bool,
    alias: String,
    peak_depth: usize,
    dropped: u64,
    reported_full: bool,
}

impl<T> QueueState<T> {
    fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    fn push(&mut self, value: T) {
        self.items.push_back(value);
        self.peak_depth = self.peak_depth.max(self.items.len());
    }

    fn report_full(&mut self) {
        if !self.reported_full {
            self.reported_full = true;
            warn!(
                "{} reached its capacity of {} items",
                self.alias, self.capacity
            );
        }
    }
}

#[derive(Debug)]
pub struct BoundedQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    policy: QueuePolicy,
}

impl<T> BoundedQueue<T> {
    #[must_use]
    pub fn new(capacity: usize, policy: QueuePolicy) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::new(),
                capacity: capacity.max(1),
                stopped: false,
                alias: "bounded queue".to_string(),
                peak_depth: 0,
                dropped: 0,
                reported_full: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            policy,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn policy(&self) -> QueuePolicy {
        self.policy
    }

    pub fn set_alias(&self, alias: impl Into<String>) {
        self.lock().alias = alias.into();
    }

    pub fn alias(&self) -> String {
        self.lock().alias.clone()
    }

    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.lock();
        state.capacity = capacity.max(1);
        state.reported_full = false;
        drop(state);
        self.not_full.notify_all();
    }

    pub fn capacity(&self) -> usize {
        self.lock().capacity
    }

    /// Enqueues `value` according to the queue policy. Under
    /// [`QueuePolicy::Block`] this waits while the queue is full.
    pub fn send(&self, value: T) -> Result<Enqueued, QueueSendError> {
        let mut state = self.lock();
        if state.stopped {
            return Err(QueueSendError::Stopped);
        }
        let mut outcome = Enqueued::Queued;
        if state.is_full() {
            state.report_full();
            match self.policy {
                QueuePolicy::Block => {
                    state = self
                        .not_full
                        .wait_while(state, |s| s.is_full() && !s.stopped)
                        .unwrap_or_else(PoisonError::into_inner);
                    if state.stopped {
                        return Err(QueueSendError::Stopped);
                    }
                }
                QueuePolicy::DropOldest => {
                    while state.is_full() {
                        state.items.pop_front();
                        state.dropped = state.dropped.saturating_add(1);
                    }
                    outcome = Enqueued::DroppedOldest;
                }
                QueuePolicy::DropNewest => {
                    state.dropped = state.dropped.saturating_add(1);
                    return Ok(Enqueued::DroppedNewest);
                }
            }
        }
        state.push(value);
        drop(state);
        self.not_empty.notify_one();
        Ok(outcome)
    }

    pub fn try_send(&self, value: T) -> Result<(), QueueSendError> {
        let mut state = self.lock();
        if state.stopped {
            return Err(QueueSendError::Stopped);
        }
        if state.is_full() {
            state.report_full();
            return Err(QueueSendError::Full);
        }
        state.push(value);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Waits for the next item. Returns `Stopped` as soon as the queue is
    /// stopped, even if items remain.
    pub fn recv(&self) -> Result<T, QueueRecvError> {
        let state = self
            .not_empty
            .wait_while(self.lock(), |s| s.items.is_empty() && !s.stopped)
            .unwrap_or_else(PoisonError::into_inner);
        self.take_front(state)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T, QueueRecvError> {
        let (state, wait) = self
            .not_empty
            .wait_timeout_while(self.lock(), timeout, |s| {
                s.items.is_empty() && !s.stopped
            })
            .unwrap_or_else(PoisonError::into_inner);
        if wait.timed_out() && state.items.is_empty() && !state.stopped {
            return Err(QueueRecvError::Timeout);
        }
        self.take_front(state)
    }

    pub fn try_recv(&self) -> Result<T, QueueRecvError> {
        let state = self.lock();
        if !state.stopped && state.items.is_empty() {
            return Err(QueueRecvError::Empty);
        }
        self.take_front(state)
    }

    fn take_front(&self, mut state: MutexGuard<'_, QueueState<T>>) -> Result<T, QueueRecvError> {
        if state.stopped {
            return Err(QueueRecvError::Stopped);
        }
        let item = state.items.pop_front().ok_or(QueueRecvError::Empty)?;
        if !state.is_full() {
            state.reported_full = false;
        }
        drop(state);
        self.not_full.notify_one();
        Ok(item)
    }

    pub fn stop(&self) {
        self.lock().stopped = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.lock().stopped
    }

    pub fn clear(&self) -> usize {
        let mut state = self.lock();
        let cleared = state.items.len();
        state.items.clear();
        drop(state);
        self.not_full.notify_all();
        cleared
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.lock();
        QueueStats {
            depth: state.items.len(),
            peak_depth: state.peak_depth,
            capacity: state.capacity,
            dropped: state.dropped,
        }
    }
}
