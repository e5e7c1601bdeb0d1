//! Bounded FIFO frame queues, the links of the message-passing fabric.
//!
//! Every protocol module owns exactly one ingress and one egress queue.
//! A queue is a named bounded FIFO of frames guarded by one mutex; blocked
//! producers and consumers park on condition variables instead of spinning
//! under the lock. Closing a queue is the cancellation signal tied to module
//! shutdown: every blocked operation wakes and fails with
//! `QueueError::Closed`.

use frame::Frame;

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Errors returned by queue operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// Non-blocking enqueue on a queue at capacity.
    Full,
    /// Non-blocking or timed dequeue on an empty queue.
    Empty,
    /// The owning module shut its endpoint.
    Closed,
}

impl fmt::Display for QueueError {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match *self {
            QueueError::Full => "queue full",
            QueueError::Empty => "queue empty",
            QueueError::Closed => "queue closed",
        };
        fmt.write_str(name)
    }
}

/// Error of a failed enqueue. Gives the frame back so the caller still owns
/// it and can retry, reroute or free it; a frame must never be lost inside
/// the fabric.
#[derive(Debug)]
pub enum EnqueueError {
    Full(Frame),
    Closed(Frame),
}

impl EnqueueError {
    pub fn into_frame(self) -> Frame {
        match self {
            EnqueueError::Full(frame) => frame,
            EnqueueError::Closed(frame) => frame,
        }
    }

    pub fn error(&self) -> QueueError {
        match *self {
            EnqueueError::Full(..) => QueueError::Full,
            EnqueueError::Closed(..) => QueueError::Closed,
        }
    }
}

/// Wakes the switch when any egress queue becomes non-empty, so the switch
/// can sleep between revolutions without holding any queue mutex.
#[derive(Default)]
pub struct Notifier {
    seq: Mutex<u64>,
    cv: Condvar,
}

impl Notifier {
    pub fn new() -> Arc<Notifier> {
        Arc::new(Notifier::default())
    }

    pub fn notify(&self) {
        let mut seq = self.seq.lock().unwrap();
        *seq = seq.wrapping_add(1);
        self.cv.notify_all();
    }

    pub fn current(&self) -> u64 {
        *self.seq.lock().unwrap()
    }

    /// Waits until the sequence number moves past `seen` or `timeout`
    /// elapses. Returns the latest sequence number.
    pub fn wait(&self, seen: u64, timeout: Duration) -> u64 {
        let mut seq = self.seq.lock().unwrap();
        while *seq == seen {
            let (guard, result) = self.cv.wait_timeout(seq, timeout).unwrap();
            seq = guard;
            if result.timed_out() {
                break;
            }
        }
        *seq
    }
}

struct State {
    items: VecDeque<Frame>,
    closed: bool,
}

struct Inner {
    name: String,
    capacity: usize,
    state: Mutex<State>,
    not_empty: Condvar,
    not_full: Condvar,
    notifier: Option<Arc<Notifier>>,
}

/// Handle to one bounded frame queue. Clones share the queue.
#[derive(Clone)]
pub struct FrameQueue {
    inner: Arc<Inner>,
}

impl FrameQueue {
    pub fn new(name: &str, capacity: usize) -> FrameQueue {
        Self::build(name, capacity, None)
    }

    /// A queue that pings `notifier` on every successful enqueue.
    pub fn with_notifier(name: &str, capacity: usize, notifier: Arc<Notifier>) -> FrameQueue {
        Self::build(name, capacity, Some(notifier))
    }

    fn build(name: &str, capacity: usize, notifier: Option<Arc<Notifier>>) -> FrameQueue {
        assert!(capacity > 0, "queue {} needs a nonzero capacity", name);
        FrameQueue {
            inner: Arc::new(Inner {
                name: name.to_owned(),
                capacity: capacity,
                state: Mutex::new(State {
                    items: VecDeque::with_capacity(capacity),
                    closed: false,
                }),
                not_empty: Condvar::new(),
                not_full: Condvar::new(),
                notifier: notifier,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().unwrap().closed
    }

    /// Blocks until there is room for `frame` or the queue closes.
    pub fn enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        let mut state = self.inner.state.lock().unwrap();
        while !state.closed && state.items.len() >= self.inner.capacity {
            state = self.inner.not_full.wait(state).unwrap();
        }
        if state.closed {
            return Err(EnqueueError::Closed(frame));
        }
        state.items.push_back(frame);
        drop(state);
        self.inner.not_empty.notify_one();
        if let Some(ref notifier) = self.inner.notifier {
            notifier.notify();
        }
        Ok(())
    }

    /// Non-blocking enqueue.
    pub fn try_enqueue(&self, frame: Frame) -> Result<(), EnqueueError> {
        let mut state = self.inner.state.lock().unwrap();
        if state.closed {
            return Err(EnqueueError::Closed(frame));
        }
        if state.items.len() >= self.inner.capacity {
            return Err(EnqueueError::Full(frame));
        }
        state.items.push_back(frame);
        drop(state);
        self.inner.not_empty.notify_one();
        if let Some(ref notifier) = self.inner.notifier {
            notifier.notify();
        }
        Ok(())
    }

    /// Blocks until a frame is available. A closed queue drains its
    /// remaining frames before reporting `Closed`.
    pub fn dequeue(&self) -> Result<Frame, QueueError> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(frame) = state.items.pop_front() {
                drop(state);
                self.inner.not_full.notify_one();
                return Ok(frame);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            state = self.inner.not_empty.wait(state).unwrap();
        }
    }

    /// Like `dequeue` but gives up with `QueueError::Empty` after `timeout`.
    pub fn dequeue_timeout(&self, timeout: Duration) -> Result<Frame, QueueError> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            if let Some(frame) = state.items.pop_front() {
                drop(state);
                self.inner.not_full.notify_one();
                return Ok(frame);
            }
            if state.closed {
                return Err(QueueError::Closed);
            }
            let (guard, result) = self.inner.not_empty.wait_timeout(state, timeout).unwrap();
            state = guard;
            if result.timed_out() {
                return match state.items.pop_front() {
                    Some(frame) => {
                        drop(state);
                        self.inner.not_full.notify_one();
                        Ok(frame)
                    }
                    None if state.closed => Err(QueueError::Closed),
                    None => Err(QueueError::Empty),
                };
            }
        }
    }

    /// Non-blocking dequeue.
    pub fn try_dequeue(&self) -> Result<Frame, QueueError> {
        let mut state = self.inner.state.lock().unwrap();
        match state.items.pop_front() {
            Some(frame) => {
                drop(state);
                self.inner.not_full.notify_one();
                Ok(frame)
            }
            None if state.closed => Err(QueueError::Closed),
            None => Err(QueueError::Empty),
        }
    }

    /// Shuts the endpoint. Wakes every blocked producer and consumer.
    pub fn close(&self) {
        let mut state = self.inner.state.lock().unwrap();
        state.closed = true;
        drop(state);
        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();
        if let Some(ref notifier) = self.inner.notifier {
            notifier.notify();
        }
    }
}

impl fmt::Debug for FrameQueue {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("FrameQueue")
            .field("name", &self.inner.name)
            .field("capacity", &self.inner.capacity)
            .field("len", &self.len())
            .finish()
    }
}
