//! Contexts: per-connection service logic driven by pipe activity.
//!
//! A [`ContextManager`] owns every live context. When a context's pipe
//! receives data the context becomes `Pending` and the manager's activation
//! listener fires; the next [`ContextManager::run`] invokes the context's
//! handler. A context never runs concurrently with itself, but distinct
//! contexts may run in parallel when `run` is called from several threads.
//!
//! [`ContextManagerHandle`] binds a manager to a tokio runtime so activations
//! schedule `run` on the blocking pool automatically.

use crate::pipe::Pipe;
use kgr_types::KgrResult;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError, Weak};
use tokio::sync::Notify;
use tracing::{debug, warn};

/// What a handler wants after one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextFlow {
    /// Keep the context alive and wait for more data.
    Continue,
    /// The conversation is over: close the pipe and drop the context.
    Finish,
}

/// Lifecycle of a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ContextState {
    Idle = 0,
    Pending = 1,
    Finished = 2,
    Destroyed = 3,
}

impl ContextState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Idle,
            1 => Self::Pending,
            2 => Self::Finished,
            _ => Self::Destroyed,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Destroyed)
    }
}

/// Service logic bound to one pipe.
///
/// `run` is called once per activation and may observe spurious wake-ups, so
/// it should drain whatever the pipe holds and return when it is empty.
pub trait ServiceContext: Send {
    fn run(&mut self, pipe: &dyn Pipe) -> KgrResult<ContextFlow>;
}

type ActivationListener = Arc<dyn Fn() + Send + Sync>;

struct ContextSlot {
    id: u64,
    state: AtomicU8,
    pipe: Arc<dyn Pipe>,
    handler: Mutex<Box<dyn ServiceContext>>,
}

impl ContextSlot {
    fn state(&self) -> ContextState {
        ContextState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: ContextState, to: ContextState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Idle -> Pending. Returns `true` if the caller should fire an activation.
    fn activate(&self) -> bool {
        self.transition(ContextState::Idle, ContextState::Pending)
    }

    /// Move to a terminal state. States only ever advance, so nothing
    /// leaves `Destroyed`.
    fn terminate(&self, state: ContextState) {
        let _ = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < state as u8).then_some(state as u8)
            });
        self.pipe.set_message_listener(None);
        self.pipe.close();
    }

    fn run_pending(&self) {
        loop {
            {
                let mut handler = match self.handler.try_lock() {
                    Ok(guard) => guard,
                    Err(TryLockError::WouldBlock) => return,
                    Err(TryLockError::Poisoned(e)) => e.into_inner(),
                };
                while self.transition(ContextState::Pending, ContextState::Idle) {
                    if self.pipe.is_drained() {
                        debug!(context = self.id, "Context pipe closed, destroying");
                        self.terminate(ContextState::Destroyed);
                        return;
                    }
                    // `destroy` does not wait for the handler lock.
                    if self.state() == ContextState::Destroyed {
                        return;
                    }
                    match handler.run(&*self.pipe) {
                        Ok(ContextFlow::Continue) => {}
                        Ok(ContextFlow::Finish) => {
                            debug!(context = self.id, "Context finished");
                            self.terminate(ContextState::Finished);
                            return;
                        }
                        Err(e) => {
                            warn!(context = self.id, error = %e, "Context run failed, finishing");
                            self.terminate(ContextState::Finished);
                            return;
                        }
                    }
                    if self.pipe.is_drained() {
                        self.terminate(ContextState::Destroyed);
                        return;
                    }
                    if !self.pipe.empty() {
                        self.activate();
                    }
                }
            }
            // Activity that landed between the last check and the unlock.
            if self.state() != ContextState::Pending {
                return;
            }
        }
    }
}

struct ManagerInner {
    contexts: Mutex<Vec<Arc<ContextSlot>>>,
    activation: RwLock<Option<ActivationListener>>,
    next_id: AtomicU64,
}

impl ManagerInner {
    fn fire(&self) {
        let listener = self
            .activation
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(listener) = listener {
            listener();
        }
    }
}

/// Owns live contexts and runs them when their pipes signal activity.
#[derive(Clone)]
pub struct ContextManager {
    inner: Arc<ManagerInner>,
}

/// Handle for tearing down one context.
#[derive(Clone)]
pub struct ContextHandle {
    id: u64,
    slot: Weak<ContextSlot>,
}

impl ContextHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ContextState {
        self.slot
            .upgrade()
            .map(|slot| slot.state())
            .unwrap_or(ContextState::Destroyed)
    }

    /// Destroy the context. Always succeeds and may be called repeatedly.
    pub fn destroy(&self) {
        let Some(slot) = self.slot.upgrade() else {
            return;
        };
        // Holding the handler lock keeps a run from starting mid-teardown.
        let _guard = slot.handler.try_lock();
        slot.terminate(ContextState::Destroyed);
    }
}

impl ContextManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                contexts: Mutex::new(Vec::new()),
                activation: RwLock::new(None),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Install the callback fired whenever some context becomes pending.
    pub fn set_activation_listener(&self, listener: Option<Arc<dyn Fn() + Send + Sync>>) {
        *self
            .inner
            .activation
            .write()
            .unwrap_or_else(|e| e.into_inner()) = listener;
    }

    /// Take ownership of a pipe and drive `handler` from its activity.
    pub fn attach(&self, pipe: Box<dyn Pipe>, handler: Box<dyn ServiceContext>) -> ContextHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(ContextSlot {
            id,
            state: AtomicU8::new(ContextState::Idle as u8),
            pipe: Arc::from(pipe),
            handler: Mutex::new(handler),
        });

        let weak_slot = Arc::downgrade(&slot);
        let weak_manager = Arc::downgrade(&self.inner);
        slot.pipe.set_message_listener(Some(Arc::new(move || {
            let (Some(slot), Some(manager)) = (weak_slot.upgrade(), weak_manager.upgrade()) else {
                return;
            };
            if slot.activate() {
                manager.fire();
            }
        })));

        self.inner
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&slot));
        debug!(context = id, "Context attached");

        // Data may have been queued before the listener was installed.
        if (!slot.pipe.empty() || slot.pipe.is_closed()) && slot.activate() {
            self.inner.fire();
        }

        ContextHandle {
            id,
            slot: Arc::downgrade(&slot),
        }
    }

    /// Run every pending context once, then forget finished ones.
    pub fn run(&self) {
        let pending: Vec<Arc<ContextSlot>> = self
            .inner
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|slot| slot.state() == ContextState::Pending)
            .cloned()
            .collect();

        for slot in pending {
            slot.run_pending();
        }

        self.inner
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|slot| !slot.state().is_terminal());
    }

    /// Number of live contexts.
    pub fn len(&self) -> usize {
        self.inner
            .contexts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|slot| !slot.state().is_terminal())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Destroy every context.
    pub fn clear(&self) {
        let slots = std::mem::take(
            &mut *self
                .inner
                .contexts
                .lock()
                .unwrap_or_else(|e| e.into_inner()),
        );
        for slot in slots {
            slot.terminate(ContextState::Destroyed);
        }
    }
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

struct ExecutorState {
    scheduled: AtomicBool,
    in_flight: AtomicUsize,
    idle: Notify,
    closed: AtomicBool,
}

/// Drives a [`ContextManager`] on a tokio runtime.
///
/// Activations are coalesced: at most one queued `run` exists at a time, and a
/// new one is scheduled only after the queued one has started.
pub struct ContextManagerHandle {
    manager: ContextManager,
    state: Arc<ExecutorState>,
}

impl ContextManagerHandle {
    /// Bind `manager` to `runtime`.
    pub fn start(manager: ContextManager, runtime: tokio::runtime::Handle) -> Self {
        let state = Arc::new(ExecutorState {
            scheduled: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            closed: AtomicBool::new(false),
        });

        let weak_manager = Arc::downgrade(&manager.inner);
        let listener_state = Arc::clone(&state);
        manager.set_activation_listener(Some(Arc::new(move || {
            if listener_state.closed.load(Ordering::Acquire)
                || listener_state.scheduled.swap(true, Ordering::AcqRel)
            {
                return;
            }
            let Some(inner) = weak_manager.upgrade() else {
                return;
            };
            let manager = ContextManager { inner };
            let task_state = Arc::clone(&listener_state);
            task_state.in_flight.fetch_add(1, Ordering::AcqRel);
            runtime.spawn_blocking(move || {
                task_state.scheduled.store(false, Ordering::Release);
                manager.run();
                if task_state.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
                    task_state.idle.notify_waiters();
                }
            });
        })));

        Self { manager, state }
    }

    pub fn manager(&self) -> &ContextManager {
        &self.manager
    }

    /// Stop scheduling, wait for in-flight runs, then destroy all contexts.
    pub async fn close(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.manager.set_activation_listener(None);
        loop {
            let idle = self.state.idle.notified();
            if self.state.in_flight.load(Ordering::Acquire) == 0 {
                break;
            }
            idle.await;
        }
        self.manager.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::LocalPipe;
    use kgr_types::{KgrError, KgrValue};
    use std::time::Duration;

    /// Echoes every message and counts runs.
    struct Echo {
        runs: Arc<AtomicUsize>,
    }

    impl ServiceContext for Echo {
        fn run(&mut self, pipe: &dyn Pipe) -> KgrResult<ContextFlow> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            while let Some(message) = pipe.read_optional() {
                if message == KgrValue::from("bye") {
                    return Ok(ContextFlow::Finish);
                }
                pipe.write(message)?;
            }
            Ok(ContextFlow::Continue)
        }
    }

    fn echo(runs: &Arc<AtomicUsize>) -> Box<dyn ServiceContext> {
        Box::new(Echo {
            runs: Arc::clone(runs),
        })
    }

    #[test]
    fn test_run_on_activity() {
        let manager = ContextManager::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (client, server) = LocalPipe::pair();
        let handle = manager.attach(Box::new(server), echo(&runs));
        assert_eq!(handle.state(), ContextState::Idle);

        client.write("hi".into()).unwrap();
        assert_eq!(handle.state(), ContextState::Pending);
        manager.run();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(client.read_optional(), Some("hi".into()));
        assert_eq!(handle.state(), ContextState::Idle);

        // Nothing pending: run is a no-op.
        manager.run();
        assert_eq!(runs.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_queued_data_before_attach() {
        let manager = ContextManager::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (client, server) = LocalPipe::pair();
        client.write(1.into()).unwrap();
        let handle = manager.attach(Box::new(server), echo(&runs));
        assert_eq!(handle.state(), ContextState::Pending);
        manager.run();
        assert_eq!(client.read_optional(), Some(KgrValue::Int(1)));
    }

    #[test]
    fn test_destroy_stops_runs() {
        let manager = ContextManager::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (client, server) = LocalPipe::pair();
        let handle = manager.attach(Box::new(server), echo(&runs));
        handle.destroy();
        handle.destroy();
        assert_eq!(handle.state(), ContextState::Destroyed);
        assert!(client.write("late".into()).is_err());
        manager.run();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(manager.is_empty());
    }

    #[test]
    fn test_destroy_from_inside_run_is_final() {
        struct SelfDestruct {
            handle: Arc<Mutex<Option<ContextHandle>>>,
        }
        impl ServiceContext for SelfDestruct {
            fn run(&mut self, _pipe: &dyn Pipe) -> KgrResult<ContextFlow> {
                if let Some(handle) = self.handle.lock().unwrap().as_ref() {
                    handle.destroy();
                }
                Ok(ContextFlow::Finish)
            }
        }

        let manager = ContextManager::new();
        let shared = Arc::new(Mutex::new(None));
        let (client, server) = LocalPipe::pair();
        let handle = manager.attach(
            Box::new(server),
            Box::new(SelfDestruct {
                handle: Arc::clone(&shared),
            }),
        );
        *shared.lock().unwrap() = Some(handle);
        let slot = Arc::clone(&manager.inner.contexts.lock().unwrap()[0]);

        client.write(1.into()).unwrap();
        manager.run();
        assert_eq!(slot.state(), ContextState::Destroyed);
        assert!(client.is_closed());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_destroyed_state_is_terminal() {
        let manager = ContextManager::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (client, server) = LocalPipe::pair();
        let handle = manager.attach(Box::new(server), echo(&runs));
        let slot = Arc::clone(&manager.inner.contexts.lock().unwrap()[0]);
        client.write(1.into()).unwrap();
        assert_eq!(slot.state(), ContextState::Pending);

        handle.destroy();
        slot.terminate(ContextState::Finished);
        assert_eq!(slot.state(), ContextState::Destroyed);
        assert!(!slot.activate());
        slot.run_pending();
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_finish_closes_pipe() {
        let manager = ContextManager::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (client, server) = LocalPipe::pair();
        let handle = manager.attach(Box::new(server), echo(&runs));
        client.write("bye".into()).unwrap();
        manager.run();
        assert_eq!(handle.state(), ContextState::Destroyed);
        assert!(client.is_closed());
        assert_eq!(manager.len(), 0);
    }

    #[test]
    fn test_peer_close_destroys_context() {
        let manager = ContextManager::new();
        let runs = Arc::new(AtomicUsize::new(0));
        let (client, server) = LocalPipe::pair();
        let handle = manager.attach(Box::new(server), echo(&runs));
        client.close();
        manager.run();
        assert_eq!(handle.state(), ContextState::Destroyed);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_handler_error_finishes() {
        struct Failing;
        impl ServiceContext for Failing {
            fn run(&mut self, _pipe: &dyn Pipe) -> KgrResult<ContextFlow> {
                Err(KgrError::Internal("boom".into()))
            }
        }
        let manager = ContextManager::new();
        let (client, server) = LocalPipe::pair();
        manager.attach(Box::new(server), Box::new(Failing));
        client.write(1.into()).unwrap();
        manager.run();
        assert!(client.is_closed());
        assert!(manager.is_empty());
    }

    #[test]
    fn test_inline_activation_listener() {
        let manager = ContextManager::new();
        let runner = manager.clone();
        manager.set_activation_listener(Some(Arc::new(move || runner.run())));
        let runs = Arc::new(AtomicUsize::new(0));
        let (client, server) = LocalPipe::pair();
        manager.attach(Box::new(server), echo(&runs));
        client.write("a".into()).unwrap();
        client.write("b".into()).unwrap();
        assert_eq!(client.read_optional(), Some("a".into()));
        assert_eq!(client.read_optional(), Some("b".into()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_handle_runs_on_runtime() {
        let manager = ContextManager::new();
        let handle = ContextManagerHandle::start(manager, tokio::runtime::Handle::current());
        let runs = Arc::new(AtomicUsize::new(0));
        let (client, server) = LocalPipe::pair();
        handle.manager().attach(Box::new(server), echo(&runs));

        let reply = tokio::task::spawn_blocking(move || {
            client.write(KgrValue::dictionary().with("hi", 1)).unwrap();
            let reply = client.read_wait(Duration::from_secs(2));
            (reply, client)
        })
        .await
        .unwrap();
        let (reply, client) = reply;
        assert_eq!(reply.unwrap(), Some(KgrValue::dictionary().with("hi", 1)));

        handle.close().await;
        assert!(client.is_closed());
        assert!(handle.manager().is_empty());
    }
}
