//! Future-based wrapper over a [`Pipe`].
//!
//! Every `read()`/`wait()` call enqueues its request immediately, at call time,
//! into a FIFO. Whenever the wrapped pipe signals activity, requests are
//! completed from the front only, so callers are served strictly in the order
//! they issued their calls regardless of when the data arrives.

use crate::pipe::{Pipe, PipeListener, PipeStatus};
use kgr_types::{KgrError, KgrResult, KgrValue};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::oneshot;

enum PendingRequest {
    Read(oneshot::Sender<KgrResult<KgrValue>>),
    Wait {
        count: usize,
        done: oneshot::Sender<bool>,
    },
}

struct AsyncInner {
    pipe: Arc<dyn Pipe>,
    pending: Mutex<VecDeque<PendingRequest>>,
    base_listener: Mutex<Option<PipeListener>>,
}

impl AsyncInner {
    /// Complete as many front requests as the pipe allows.
    ///
    /// Returns `true` if no request was waiting when called.
    fn drain(&self) -> bool {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        let was_idle = pending.is_empty();
        while let Some(front) = pending.front() {
            match front {
                PendingRequest::Read(_) => {
                    let outcome = match self.pipe.read_optional() {
                        Some(message) => Ok(message),
                        // A closed pipe never blocks, so this yields the close reason.
                        None if self.pipe.status() == PipeStatus::Closed => self.pipe.read(),
                        None => break,
                    };
                    if let Some(PendingRequest::Read(reply)) = pending.pop_front() {
                        let _ = reply.send(outcome);
                    }
                }
                PendingRequest::Wait { count, .. } => {
                    let reached = if self.pipe.count() >= *count {
                        true
                    } else if self.pipe.status() == PipeStatus::Closed {
                        false
                    } else {
                        break;
                    };
                    if let Some(PendingRequest::Wait { done, .. }) = pending.pop_front() {
                        let _ = done.send(reached);
                    }
                }
            }
        }
        was_idle
    }

    fn notify(&self) {
        if self.drain() {
            let base = self
                .base_listener
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            if let Some(base) = base {
                base();
            }
        }
    }

    fn enqueue(&self, request: PendingRequest) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(request);
        self.drain();
    }
}

/// A pipe whose reads return futures.
pub struct AsyncPipe {
    inner: Arc<AsyncInner>,
}

impl AsyncPipe {
    /// Take over a pipe. The pipe's message listener now belongs to this wrapper.
    pub fn new(pipe: Box<dyn Pipe>) -> Self {
        let inner = Arc::new(AsyncInner {
            pipe: Arc::from(pipe),
            pending: Mutex::new(VecDeque::new()),
            base_listener: Mutex::new(None),
        });
        let weak: Weak<AsyncInner> = Arc::downgrade(&inner);
        inner.pipe.set_message_listener(Some(Arc::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.notify();
            }
        })));
        Self { inner }
    }

    /// Resolve with the next message not claimed by an earlier call.
    ///
    /// The request is queued before this returns, so ordering follows call
    /// order even if the futures are polled in a different order.
    pub fn read(&self) -> impl Future<Output = KgrResult<KgrValue>> + Send + 'static {
        let (reply, rx) = oneshot::channel();
        self.inner.enqueue(PendingRequest::Read(reply));
        async move { rx.await.unwrap_or(Err(KgrError::PipeClosed)) }
    }

    /// Resolve once at least `count` messages are queued (`false` if the pipe
    /// closed first).
    pub fn wait(&self, count: usize) -> impl Future<Output = bool> + Send + 'static {
        let (done, rx) = oneshot::channel();
        self.inner.enqueue(PendingRequest::Wait { count, done });
        async move { rx.await.unwrap_or(false) }
    }

    /// Listener called on activity while no async request is pending.
    pub fn set_message_listener(&self, listener: Option<PipeListener>) {
        *self
            .inner
            .base_listener
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = listener;
    }

    pub fn write(&self, message: KgrValue) -> KgrResult<()> {
        self.inner.pipe.write(message)
    }

    pub fn write_nx(&self, message: KgrValue) -> bool {
        self.inner.pipe.write_nx(message)
    }

    pub fn status(&self) -> PipeStatus {
        self.inner.pipe.status()
    }

    pub fn count(&self) -> usize {
        self.inner.pipe.count()
    }

    pub fn empty(&self) -> bool {
        self.inner.pipe.empty()
    }

    pub fn close(&self) {
        self.inner.pipe.close();
    }
}

impl Drop for AsyncPipe {
    fn drop(&mut self) {
        self.inner.pipe.set_message_listener(None);
    }
}
