use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;

use crate::frame::Frame;

pub const DEFAULT_CAPACITY: usize = 8;

#[derive(Debug, Default)]
struct QueueStats {
    pushed: AtomicU64,
    dropped: AtomicU64,
    popped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub pushed: u64,
    pub dropped: u64,
    pub popped: u64,
}

#[derive(Debug)]
struct Inner {
    frames: VecDeque<Frame>,
    closed: bool,
}

#[derive(Debug)]
pub enum Pop {
    Frame(Frame),
    /// Nothing arrived within the timeout.
    Empty,
    /// Producer is gone and the queue is drained.
    Closed,
}

#[derive(Debug)]
pub struct FrameQueue {
    inner: Mutex<Inner>,
    ready: Condvar,
    capacity: usize,
    stats: QueueStats,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity.max(1)),
                closed: false,
            }),
            ready: Condvar::new(),
            capacity: capacity.max(1),
            stats: QueueStats::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // a panicked holder cannot leave the deque half-updated
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns `false` if the queue is closed and the frame was discarded.
    pub fn push(&self, frame: Frame) -> bool {
        let mut g = self.lock();
        if g.closed {
            return false;
        }
        if g.frames.len() >= self.capacity {
            g.frames.pop_front();
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        g.frames.push_back(frame);
        self.stats.pushed.fetch_add(1, Ordering::Relaxed);
        drop(g);
        self.ready.notify_one();
        true
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Pop {
        let g = self.lock();
        let (mut g, _) = self
            .ready
            .wait_timeout_while(g, timeout, |inner| inner.frames.is_empty() && !inner.closed)
            .unwrap_or_else(|e| e.into_inner());
        match g.frames.pop_front() {
            Some(f) => {
                self.stats.popped.fetch_add(1, Ordering::Relaxed);
                Pop::Frame(f)
            }
            None if g.closed => Pop::Closed,
            None => Pop::Empty,
        }
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn stats(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            pushed: self.stats.pushed.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
            popped: self.stats.popped.load(Ordering::Relaxed),
        }
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
