//! Pipes: bidirectional FIFO message channels.
//!
//! A [`LocalPipe`] pair shares two queues, each behind its own mutex and
//! condition variable, plus one atomic status flag. Writing on one end appends
//! to the other end's input queue. Message listeners are always invoked after
//! the queue lock has been released, so a listener may freely call back into
//! either end of the pipe.

use kgr_types::{KgrError, KgrResult, KgrValue};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Callback fired when data arrives on a pipe or the pipe closes.
pub type PipeListener = Arc<dyn Fn() + Send + Sync>;

/// Lifecycle of a pipe. Once closed, a pipe never reopens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeStatus {
    Open,
    Closed,
}

/// One end of a bidirectional message channel.
///
/// Messages written to one end are read from the other in write order.
/// Messages still queued when the pipe closes remain readable; once they are
/// drained, reads fail with the close reason.
pub trait Pipe: Send + Sync {
    fn status(&self) -> PipeStatus;

    /// Queue a message for the peer. Fails with `PipeClosed` on a closed pipe.
    fn write(&self, message: KgrValue) -> KgrResult<()>;

    /// Like [`Pipe::write`] but reports failure as `false`.
    fn write_nx(&self, message: KgrValue) -> bool {
        self.write(message).is_ok()
    }

    /// Block until a message is available or the pipe is closed and drained.
    fn read(&self) -> KgrResult<KgrValue>;

    /// Take the next message without blocking.
    fn read_optional(&self) -> Option<KgrValue>;

    /// Block up to `timeout` for a message. `Ok(None)` means the wait expired.
    fn read_wait(&self, timeout: Duration) -> KgrResult<Option<KgrValue>>;

    /// Block until at least `count` messages are queued.
    ///
    /// Returns `false` if the pipe closed before that happened.
    fn wait(&self, count: usize) -> bool;

    /// Number of queued inbound messages.
    fn count(&self) -> usize;

    fn empty(&self) -> bool {
        self.count() == 0
    }

    /// Discard up to `count` queued messages.
    fn discard(&self, count: usize);

    /// Discard every queued message.
    fn discard_all(&self);

    /// Install (or clear) the data-arrival callback.
    fn set_message_listener(&self, listener: Option<PipeListener>);

    /// Close both ends. Idempotent; wakes every blocked reader.
    fn close(&self) {
        self.close_with(KgrError::PipeClosed);
    }

    /// Close both ends, recording why. Drained reads report `reason`.
    ///
    /// Only the first close records its reason.
    fn close_with(&self, reason: KgrError);

    fn is_closed(&self) -> bool {
        self.status() == PipeStatus::Closed
    }

    /// Closed and nothing left to read.
    fn is_drained(&self) -> bool {
        self.is_closed() && self.empty()
    }
}

struct QueueState {
    messages: VecDeque<KgrValue>,
    listener: Option<PipeListener>,
}

/// One direction of a pipe pair.
struct PipeQueue {
    state: Mutex<QueueState>,
    available: Condvar,
}

impl PipeQueue {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(QueueState {
                messages: VecDeque::new(),
                listener: None,
            }),
            available: Condvar::new(),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wake readers and return the listener to call once unlocked.
    fn wake(&self) -> Option<PipeListener> {
        let state = self.lock();
        self.available.notify_all();
        state.listener.clone()
    }
}

/// Status shared by both ends of a pair.
struct SharedStatus {
    closed: AtomicBool,
    reason: Mutex<Option<KgrError>>,
}

impl SharedStatus {
    fn reason(&self) -> KgrError {
        self.reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or(KgrError::PipeClosed)
    }
}

/// In-process pipe end.
pub struct LocalPipe {
    input: Arc<PipeQueue>,
    output: Arc<PipeQueue>,
    status: Arc<SharedStatus>,
}

impl LocalPipe {
    /// Create two connected ends.
    pub fn pair() -> (LocalPipe, LocalPipe) {
        let forward = PipeQueue::new();
        let backward = PipeQueue::new();
        let status = Arc::new(SharedStatus {
            closed: AtomicBool::new(false),
            reason: Mutex::new(None),
        });
        let first = LocalPipe {
            input: Arc::clone(&backward),
            output: Arc::clone(&forward),
            status: Arc::clone(&status),
        };
        let second = LocalPipe {
            input: forward,
            output: backward,
            status,
        };
        (first, second)
    }

    fn closed(&self) -> bool {
        self.status.closed.load(Ordering::Acquire)
    }
}

impl Pipe for LocalPipe {
    fn status(&self) -> PipeStatus {
        if self.closed() {
            PipeStatus::Closed
        } else {
            PipeStatus::Open
        }
    }

    fn write(&self, message: KgrValue) -> KgrResult<()> {
        let listener = {
            let mut state = self.output.lock();
            if self.closed() {
                return Err(self.status.reason());
            }
            state.messages.push_back(message);
            self.output.available.notify_all();
            state.listener.clone()
        };
        if let Some(listener) = listener {
            listener();
        }
        Ok(())
    }

    fn read(&self) -> KgrResult<KgrValue> {
        let mut state = self.input.lock();
        loop {
            if let Some(message) = state.messages.pop_front() {
                return Ok(message);
            }
            if self.closed() {
                return Err(self.status.reason());
            }
            state = self
                .input
                .available
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn read_optional(&self) -> Option<KgrValue> {
        self.input.lock().messages.pop_front()
    }

    fn read_wait(&self, timeout: Duration) -> KgrResult<Option<KgrValue>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.input.lock();
        loop {
            if let Some(message) = state.messages.pop_front() {
                return Ok(Some(message));
            }
            if self.closed() {
                return Err(self.status.reason());
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            state = self
                .input
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    fn wait(&self, count: usize) -> bool {
        let mut state = self.input.lock();
        loop {
            if state.messages.len() >= count {
                return true;
            }
            if self.closed() {
                return false;
            }
            state = self
                .input
                .available
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn count(&self) -> usize {
        self.input.lock().messages.len()
    }

    fn discard(&self, count: usize) {
        let mut state = self.input.lock();
        let count = count.min(state.messages.len());
        state.messages.drain(..count);
    }

    fn discard_all(&self) {
        self.input.lock().messages.clear();
    }

    fn set_message_listener(&self, listener: Option<PipeListener>) {
        self.input.lock().listener = listener;
    }

    fn close_with(&self, reason: KgrError) {
        {
            let mut slot = self.status.reason.lock().unwrap_or_else(|e| e.into_inner());
            if self.status.closed.load(Ordering::Acquire) {
                return;
            }
            *slot = Some(reason);
            self.status.closed.store(true, Ordering::Release);
        }
        let listeners = [self.input.wake(), self.output.wake()];
        for listener in listeners.into_iter().flatten() {
            listener();
        }
    }
}

impl std::fmt::Debug for dyn Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("status", &self.status())
            .field("queued", &self.count())
            .finish()
    }
}

impl std::fmt::Debug for LocalPipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalPipe")
            .field("status", &self.status())
            .field("queued", &self.count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kgr_types::ErrorKind;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn test_fifo_order() {
        let (a, b) = LocalPipe::pair();
        for i in 0..100 {
            a.write(KgrValue::Int(i)).unwrap();
        }
        for i in 0..100 {
            assert_eq!(b.read().unwrap(), KgrValue::Int(i));
        }
        assert!(b.empty());
    }

    #[test]
    fn test_both_directions() {
        let (a, b) = LocalPipe::pair();
        a.write("ping".into()).unwrap();
        b.write("pong".into()).unwrap();
        assert_eq!(b.read_optional(), Some("ping".into()));
        assert_eq!(a.read_optional(), Some("pong".into()));
        assert_eq!(a.read_optional(), None);
    }

    #[test]
    fn test_close_idempotent_and_shared() {
        let (a, b) = LocalPipe::pair();
        a.close();
        a.close();
        b.close();
        assert_eq!(a.status(), PipeStatus::Closed);
        assert_eq!(b.status(), PipeStatus::Closed);
        assert_eq!(a.write(KgrValue::Null), Err(KgrError::PipeClosed));
        assert!(!b.write_nx(KgrValue::Null));
    }

    #[test]
    fn test_queued_messages_survive_close() {
        let (a, b) = LocalPipe::pair();
        a.write(1.into()).unwrap();
        a.write(2.into()).unwrap();
        a.close();
        assert_eq!(b.read().unwrap(), KgrValue::Int(1));
        assert_eq!(b.read().unwrap(), KgrValue::Int(2));
        assert_eq!(b.read(), Err(KgrError::PipeClosed));
        assert!(b.is_drained());
    }

    #[test]
    fn test_close_reason_reported() {
        let (a, b) = LocalPipe::pair();
        b.close_with(KgrError::Timeout("heartbeat".into()));
        a.close();
        assert_eq!(a.read().unwrap_err().kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_boxed_pipe_results_are_debuggable() {
        let (a, _b) = LocalPipe::pair();
        let ok: KgrResult<Box<dyn Pipe>> = Ok(Box::new(a));
        let pipe = ok.unwrap();
        assert_eq!(
            format!("{pipe:?}"),
            "Pipe { status: Open, queued: 0 }"
        );
        let failed: KgrResult<Box<dyn Pipe>> = Err(KgrError::NotFound("/x".into()));
        assert_eq!(failed.unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let (a, b) = LocalPipe::pair();
        let reader = thread::spawn(move || b.read());
        thread::sleep(Duration::from_millis(20));
        a.close();
        assert_eq!(reader.join().unwrap(), Err(KgrError::PipeClosed));
    }

    #[test]
    fn test_blocking_read_across_threads() {
        let (a, b) = LocalPipe::pair();
        let reader = thread::spawn(move || (b.read().unwrap(), b.read().unwrap()));
        a.write("x".into()).unwrap();
        a.write("y".into()).unwrap();
        assert_eq!(reader.join().unwrap(), ("x".into(), "y".into()));
    }

    #[test]
    fn test_read_wait_times_out() {
        let (_a, b) = LocalPipe::pair();
        assert_eq!(b.read_wait(Duration::from_millis(10)).unwrap(), None);
    }

    #[test]
    fn test_wait_count() {
        let (a, b) = LocalPipe::pair();
        let waiter = thread::spawn(move || {
            let reached = b.wait(3);
            (reached, b.count())
        });
        for i in 0..3 {
            a.write(KgrValue::Int(i)).unwrap();
        }
        assert_eq!(waiter.join().unwrap(), (true, 3));
    }

    #[test]
    fn test_wait_fails_on_close() {
        let (a, b) = LocalPipe::pair();
        a.write(1.into()).unwrap();
        a.close();
        assert!(!b.wait(2));
        assert!(b.wait(1));
    }

    #[test]
    fn test_discard() {
        let (a, b) = LocalPipe::pair();
        for i in 0..5 {
            a.write(KgrValue::Int(i)).unwrap();
        }
        b.discard(2);
        assert_eq!(b.read_optional(), Some(KgrValue::Int(2)));
        b.discard(10);
        assert!(b.empty());
        a.write(9.into()).unwrap();
        b.discard_all();
        assert_eq!(b.count(), 0);
    }

    #[test]
    fn test_listener_fires_on_write_and_close() {
        let (a, b) = LocalPipe::pair();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        b.set_message_listener(Some(Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })));
        a.write(1.into()).unwrap();
        a.write(2.into()).unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        a.close();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
        a.close();
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_listener_may_reenter_pipe() {
        let (a, b) = LocalPipe::pair();
        let b = Arc::new(b);
        let echo_end = Arc::clone(&b);
        b.set_message_listener(Some(Arc::new(move || {
            while let Some(message) = echo_end.read_optional() {
                echo_end.write(message).unwrap();
            }
        })));
        a.write("hello".into()).unwrap();
        assert_eq!(a.read_optional(), Some("hello".into()));
    }
}
