//! One physical connection carrying many logical pipes.
//!
//! Three tasks serve each connection:
//!
//! - the **reader** decodes frames, completes waiting requests, hands new
//!   requests to the [`RequestHandler`] and delivers pipe data;
//! - the **writer** drains a single outbound queue, so frames for one pipe
//!   leave in the order they were produced;
//! - the **heartbeat** pings an idle peer after the inactivity timeout and
//!   tears the connection down once the inactivity threshold passes without
//!   any inbound traffic.
//!
//! Each logical pipe is bridged to a local [`Pipe`] end: whatever the local
//! side writes is forwarded as `send` notifications, and inbound `send`
//! notifications are written into it. Closing is a handshake: the side that
//! closes first sends `close`, the other side answers with its own `close`,
//! and the id is released only once both have been seen.
//!
//! Pipe data stops being pulled off the local ends while more than
//! `max_queued_bytes` of encoded frames wait for the socket, and resumes once
//! the writer has caught up.

use crate::message::{
    decode_frame, encode_frame, NetFrame, NetFrameKind, NetNotification, NetRequest, NetResponse,
};
use crate::socket::{Socket, READ_CHUNK};
use crate::{WireError, WireResult};
use async_trait::async_trait;
use bytes::BytesMut;
use kgr_kernel::{IdAllocator, LocalPipe, Pipe};
use kgr_types::config::NetConfig;
use kgr_types::{KgrError, KgrResult};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, trace, warn};

/// Serves the requests a peer sends over a [`Connection`].
#[async_trait]
pub(crate) trait RequestHandler: Send + Sync + 'static {
    async fn handle(
        &self,
        connection: &Arc<Connection>,
        request: NetRequest,
    ) -> KgrResult<NetResponse>;

    /// Runs once, after every pipe has been closed.
    async fn closed(&self, _connection: &Arc<Connection>, _reason: &KgrError) {}
}

struct Outbound {
    bytes: Vec<u8>,
    written: Option<oneshot::Sender<()>>,
}

struct Bridge {
    pipe: Box<dyn Pipe>,
    /// Data is held back until the peer is ready for it.
    active: AtomicBool,
    /// A `close` has been sent or received for this id.
    closing: AtomicBool,
    /// Serialises forwarding so one pipe's frames stay in order.
    pump: Mutex<()>,
}

#[derive(Default)]
struct PipeTable {
    bridges: BTreeMap<u64, Arc<Bridge>>,
    ids: IdAllocator,
}

type Waiter = oneshot::Sender<WireResult<NetResponse>>;

/// Which end of the connection this is. The master allocates pipe ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Master,
    Slave,
}

/// A live, multiplexed connection to one peer.
pub struct Connection {
    id: String,
    peer: String,
    role: Role,
    socket: Arc<dyn Socket>,
    config: NetConfig,
    handler: Arc<dyn RequestHandler>,
    outbound: mpsc::UnboundedSender<Outbound>,
    /// Encoded bytes sitting in `outbound`.
    queued: AtomicUsize,
    next_request: AtomicU64,
    waiters: Mutex<HashMap<u64, Waiter>>,
    pipes: Mutex<PipeTable>,
    last_rx: Mutex<Instant>,
    pinged: AtomicBool,
    closing: AtomicBool,
    closed_tx: watch::Sender<Option<KgrError>>,
}

impl Connection {
    /// Spawn the reader, writer and heartbeat tasks for `socket`.
    pub(crate) fn start(
        socket: Arc<dyn Socket>,
        config: NetConfig,
        peer: String,
        role: Role,
        handler: Arc<dyn RequestHandler>,
    ) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(None);
        let conn = Arc::new(Self {
            id: uuid::Uuid::new_v4().to_string(),
            peer,
            role,
            socket,
            config,
            handler,
            outbound: tx,
            queued: AtomicUsize::new(0),
            next_request: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
            pipes: Mutex::new(PipeTable::default()),
            last_rx: Mutex::new(Instant::now()),
            pinged: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            closed_tx,
        });

        tokio::spawn(Arc::clone(&conn).write_loop(rx));
        tokio::spawn(Arc::clone(&conn).read_loop());
        tokio::spawn(Arc::clone(&conn).heartbeat_loop());
        debug!(conn = %conn.id, peer = %conn.peer, "KGR: connection started");
        conn
    }

    /// Unique id of this connection.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn socket(&self) -> &Arc<dyn Socket> {
        &self.socket
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Number of logical pipes currently open.
    pub fn pipe_count(&self) -> usize {
        self.table().bridges.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Encoded bytes waiting to be written to the socket.
    pub fn queued_bytes(&self) -> usize {
        self.queued.load(Ordering::Acquire)
    }

    /// Resolves with the teardown reason once the connection is gone.
    pub async fn closed(&self) -> KgrError {
        let mut rx = self.closed_tx.subscribe();
        loop {
            if let Some(reason) = rx.borrow_and_update().clone() {
                return reason;
            }
            if rx.changed().await.is_err() {
                return KgrError::ConnectionFailed("connection dropped".to_string());
            }
        }
    }

    /// Tell the peer we are leaving, then tear down.
    pub async fn close(self: &Arc<Self>) {
        if self.is_closed() {
            return;
        }
        let (tx, rx) = oneshot::channel();
        self.enqueue(
            &NetFrame::notification(NetNotification::ShuttingDown),
            Some(tx),
        );
        let _ = tokio::time::timeout(self.config.request_timeout(), rx).await;
        self.teardown(KgrError::ConnectionFailed("connection closed".to_string()))
            .await;
    }

    // ─── Requests ────────────────────────────────────────────────────────

    /// Send a request and wait for its response within the response timeout.
    pub async fn request(self: &Arc<Self>, request: NetRequest) -> WireResult<NetResponse> {
        self.request_within(request, self.config.response_timeout())
            .await
    }

    /// Send a request and wait up to `deadline` for its response.
    ///
    /// The request must reach the socket within the request timeout. Error
    /// responses come back as [`WireError::Remote`].
    pub async fn request_within(
        self: &Arc<Self>,
        request: NetRequest,
        deadline: Duration,
    ) -> WireResult<NetResponse> {
        if self.is_closed() {
            return Err(WireError::ConnectionClosed);
        }
        let id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.waiters().insert(id, tx);

        let (written_tx, written_rx) = oneshot::channel();
        self.enqueue(&NetFrame::request(id, request), Some(written_tx));
        match tokio::time::timeout(self.config.request_timeout(), written_rx).await {
            Ok(Ok(())) => {}
            Ok(Err(_)) => {
                self.waiters().remove(&id);
                return Err(WireError::ConnectionClosed);
            }
            Err(_) => {
                self.waiters().remove(&id);
                return Err(WireError::Timeout(format!("request {id} not sent")));
            }
        }

        let mut rx = rx;
        match tokio::time::timeout(deadline, &mut rx).await {
            Ok(Ok(Ok(NetResponse::Error { code, message }))) => {
                Err(WireError::Remote { code, message })
            }
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WireError::ConnectionClosed),
            Err(_) => {
                if self.waiters().remove(&id).is_none() {
                    // The response won the race with the deadline.
                    if let Ok(Ok(response)) = rx.try_recv() {
                        self.unclaimed(id, response);
                    }
                }
                Err(WireError::Timeout(format!("no response to request {id}")))
            }
        }
    }

    /// A response nobody is waiting for any more. A pipe the master opened
    /// for us is closed again so it does not linger on its side.
    fn unclaimed(self: &Arc<Self>, id: u64, response: NetResponse) {
        trace!(conn = %self.id, id, "KGR: unclaimed response");
        if let (Role::Slave, NetResponse::Connected { pipe }) = (self.role, response) {
            debug!(conn = %self.id, pipe, "KGR: refusing pipe opened too late");
            self.refuse_pipe(pipe);
        }
    }

    pub(crate) fn notify(&self, notification: NetNotification) {
        self.enqueue(&NetFrame::notification(notification), None);
    }

    fn respond(&self, id: u64, response: NetResponse) {
        self.enqueue(&NetFrame::response(id, response), None);
    }

    fn enqueue(&self, frame: &NetFrame, written: Option<oneshot::Sender<()>>) {
        if self.is_closed() {
            return;
        }
        match encode_frame(frame) {
            Ok(bytes) => {
                self.queued.fetch_add(bytes.len(), Ordering::AcqRel);
                let _ = self.outbound.send(Outbound { bytes, written });
            }
            Err(e) => warn!(conn = %self.id, error = %e, "KGR: failed to encode frame"),
        }
    }

    // ─── Pipes ───────────────────────────────────────────────────────────

    /// Bridge `pipe` under a freshly allocated id.
    pub(crate) fn attach_new_pipe(
        self: &Arc<Self>,
        pipe: Box<dyn Pipe>,
        active: bool,
    ) -> KgrResult<u64> {
        let id = {
            let mut table = self.table();
            let id = table.ids.allocate();
            table.bridges.insert(id, Arc::new(Bridge::new(pipe, active)));
            id
        };
        self.install(id)?;
        Ok(id)
    }

    /// Bridge `pipe` under an id chosen by the peer.
    pub(crate) fn attach_pipe(
        self: &Arc<Self>,
        id: u64,
        pipe: Box<dyn Pipe>,
        active: bool,
    ) -> KgrResult<()> {
        {
            let mut table = self.table();
            if table.bridges.contains_key(&id) {
                drop(table);
                pipe.close();
                // Both sides disagree about which ids are live.
                let reason = KgrError::Protocol(format!("pipe id {id} already in use"));
                let conn = Arc::clone(self);
                let teardown_reason = reason.clone();
                tokio::spawn(async move { conn.teardown(teardown_reason).await });
                return Err(reason);
            }
            table.bridges.insert(id, Arc::new(Bridge::new(pipe, active)));
        }
        self.install(id)
    }

    /// Occupy `id` with an already closed end, so the close handshake runs
    /// and the peer releases its side.
    pub(crate) fn refuse_pipe(self: &Arc<Self>, id: u64) {
        let (end, other) = LocalPipe::pair();
        other.close();
        if let Err(e) = self.attach_pipe(id, Box::new(end), true) {
            debug!(conn = %self.id, pipe = id, error = %e, "KGR: could not refuse pipe");
        }
    }

    /// Abandon a pipe attached inactive if the peer has not activated it
    /// within `deadline`.
    pub(crate) fn expire_unless_activated(self: &Arc<Self>, id: u64, deadline: Duration) {
        let Some(bridge) = self.bridge(id) else {
            return;
        };
        let bridge = Arc::downgrade(&bridge);
        let conn = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            let (Some(conn), Some(bridge)) = (conn.upgrade(), bridge.upgrade()) else {
                return;
            };
            let current = conn.bridge(id);
            if current.is_some_and(|b| Arc::ptr_eq(&b, &bridge))
                && !bridge.active.load(Ordering::Acquire)
            {
                debug!(conn = %conn.id, pipe = id, "KGR: pipe never activated, abandoning");
                conn.abandon_pipe(id);
            }
        });
    }

    /// Start forwarding data for a pipe that was attached inactive.
    pub(crate) fn activate(&self, id: u64) {
        match self.bridge(id) {
            Some(bridge) => {
                bridge.active.store(true, Ordering::Release);
                self.pump(id);
            }
            None => debug!(conn = %self.id, pipe = id, "KGR: activate for unknown pipe"),
        }
    }

    /// Close a pipe whose peer end may or may not exist, keeping its id
    /// reserved until the peer answers.
    pub(crate) fn abandon_pipe(&self, id: u64) {
        if let Some(bridge) = self.bridge(id) {
            bridge.active.store(true, Ordering::Release);
            bridge.pipe.close();
            self.pump(id);
        }
    }

    /// Drop a pipe that never became usable, without telling the peer.
    pub(crate) fn discard_pipe(&self, id: u64) {
        let bridge = {
            let mut table = self.table();
            table.ids.free(id);
            table.bridges.remove(&id)
        };
        if let Some(bridge) = bridge {
            bridge.closing.store(true, Ordering::Release);
            bridge.pipe.close();
        }
    }

    fn install(self: &Arc<Self>, id: u64) -> KgrResult<()> {
        let Some(bridge) = self.bridge(id) else {
            return Err(KgrError::PipeClosed);
        };
        if self.is_closed() {
            self.discard_pipe(id);
            return Err(KgrError::ConnectionFailed("connection closed".to_string()));
        }
        let weak: Weak<Connection> = Arc::downgrade(self);
        bridge.pipe.set_message_listener(Some(Arc::new(move || {
            if let Some(conn) = weak.upgrade() {
                conn.pump(id);
            }
        })));
        self.pump(id);
        Ok(())
    }

    /// Forward everything the local end has written, then announce a close.
    fn pump(&self, id: u64) {
        let Some(bridge) = self.bridge(id) else {
            return;
        };
        if !bridge.active.load(Ordering::Acquire) {
            return;
        }
        let _guard = bridge.pump.lock().unwrap_or_else(|e| e.into_inner());
        if bridge.closing.load(Ordering::Acquire) {
            return;
        }
        let budget = self.config.max_queued_bytes;
        while self.queued_bytes() < budget {
            let Some(data) = bridge.pipe.read_optional() else {
                break;
            };
            self.notify(NetNotification::Send { pipe: id, data });
        }
        if bridge.pipe.is_drained() {
            bridge.closing.store(true, Ordering::Release);
            trace!(conn = %self.id, pipe = id, "KGR: local close");
            self.notify(NetNotification::Close { pipe: id });
        }
    }

    fn deliver(&self, id: u64, data: kgr_types::KgrValue) {
        let Some(bridge) = self.bridge(id) else {
            trace!(conn = %self.id, pipe = id, "KGR: data for unknown pipe dropped");
            return;
        };
        if bridge.closing.load(Ordering::Acquire) {
            return;
        }
        if bridge.pipe.write(data).is_err() {
            self.pump(id);
        }
    }

    fn remote_close(&self, id: u64) {
        let bridge = {
            let mut table = self.table();
            let bridge = table.bridges.remove(&id);
            if bridge.is_some() {
                table.ids.free(id);
            }
            bridge
        };
        let Some(bridge) = bridge else {
            // The master may be abandoning an id it is unsure we hold.
            if self.role == Role::Slave {
                self.notify(NetNotification::Close { pipe: id });
            }
            return;
        };
        {
            let _guard = bridge.pump.lock().unwrap_or_else(|e| e.into_inner());
            if !bridge.closing.swap(true, Ordering::AcqRel) {
                self.notify(NetNotification::Close { pipe: id });
            }
        }
        trace!(conn = %self.id, pipe = id, "KGR: remote close");
        bridge.pipe.close();
    }

    fn bridge(&self, id: u64) -> Option<Arc<Bridge>> {
        self.table().bridges.get(&id).cloned()
    }

    fn table(&self) -> std::sync::MutexGuard<'_, PipeTable> {
        self.pipes.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn waiters(&self) -> std::sync::MutexGuard<'_, HashMap<u64, Waiter>> {
        self.waiters.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ─── Tasks ───────────────────────────────────────────────────────────

    async fn write_loop(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
        let mut closed = self.closed_tx.subscribe();
        loop {
            let next = tokio::select! {
                next = rx.recv() => next,
                _ = closed.changed() => None,
            };
            let Some(Outbound { bytes, written }) = next else {
                break;
            };
            if let Err(e) = self.socket.write(&bytes).await {
                debug!(conn = %self.id, error = %e, "KGR: write failed");
                self.teardown(e.into()).await;
                break;
            }
            if let Some(written) = written {
                let _ = written.send(());
            }
            let before = self.queued.fetch_sub(bytes.len(), Ordering::AcqRel);
            let budget = self.config.max_queued_bytes;
            if before >= budget && before - bytes.len() < budget {
                self.resume_pipes();
            }
        }
    }

    /// Pump every active pipe, picking up data held back by a full queue.
    fn resume_pipes(&self) {
        let ids: Vec<u64> = self.table().bridges.keys().copied().collect();
        trace!(conn = %self.id, pipes = ids.len(), "KGR: outbound queue drained");
        for id in ids {
            self.pump(id);
        }
    }

    async fn read_loop(self: Arc<Self>) {
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        let max = self.config.max_frame_size;
        loop {
            let bytes = match self.socket.read(READ_CHUNK).await {
                Ok(bytes) if bytes.is_empty() => {
                    self.teardown(KgrError::ConnectionFailed(
                        "connection closed by peer".to_string(),
                    ))
                    .await;
                    return;
                }
                Ok(bytes) => bytes,
                Err(e) => {
                    self.teardown(e.into()).await;
                    return;
                }
            };
            buf.extend_from_slice(&bytes);
            self.touch();
            loop {
                match decode_frame(&mut buf, max) {
                    Ok(Some(frame)) => self.dispatch(frame),
                    Ok(None) => break,
                    Err(e) => {
                        warn!(conn = %self.id, peer = %self.peer, error = %e, "KGR: bad frame");
                        self.teardown(e.into()).await;
                        return;
                    }
                }
            }
        }
    }

    async fn heartbeat_loop(self: Arc<Self>) {
        let timeout = self.config.inactivity_timeout();
        let threshold = self.config.inactivity_threshold();
        let period = (timeout / 4).max(Duration::from_millis(1));
        let mut closed = self.closed_tx.subscribe();
        loop {
            tokio::select! {
                _ = tokio::time::sleep(period) => {}
                _ = closed.changed() => return,
            }
            if self.is_closed() {
                return;
            }
            let idle = self
                .last_rx
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .elapsed();
            if idle >= threshold {
                warn!(
                    conn = %self.id,
                    peer = %self.peer,
                    idle_ms = idle.as_millis() as u64,
                    "KGR: peer unresponsive"
                );
                self.teardown(KgrError::Timeout(format!(
                    "no traffic from {} for {} ms",
                    self.peer,
                    idle.as_millis()
                )))
                .await;
                return;
            }
            if idle >= timeout && !self.pinged.swap(true, Ordering::AcqRel) {
                trace!(conn = %self.id, "KGR: heartbeat probe");
                let id = self.next_request.fetch_add(1, Ordering::Relaxed);
                self.enqueue(&NetFrame::request(id, NetRequest::Ping), None);
            }
        }
    }

    fn touch(&self) {
        *self.last_rx.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
        self.pinged.store(false, Ordering::Release);
    }

    fn dispatch(self: &Arc<Self>, frame: NetFrame) {
        match frame.kind {
            NetFrameKind::Request(NetRequest::Ping) => self.respond(frame.id, NetResponse::Pong),
            NetFrameKind::Request(request) => {
                let conn = Arc::clone(self);
                let id = frame.id;
                tokio::spawn(async move {
                    let response = match conn.handler.handle(&conn, request).await {
                        Ok(response) => response,
                        Err(e) => {
                            debug!(conn = %conn.id, error = %e, "KGR: request failed");
                            NetResponse::error(&e)
                        }
                    };
                    conn.respond(id, response);
                });
            }
            NetFrameKind::Response(response) => {
                let waiter = self.waiters().remove(&frame.id);
                match waiter {
                    Some(waiter) => {
                        if let Err(Ok(response)) = waiter.send(Ok(response)) {
                            self.unclaimed(frame.id, response);
                        }
                    }
                    None => self.unclaimed(frame.id, response),
                }
            }
            NetFrameKind::Notification(NetNotification::Send { pipe, data }) => {
                self.deliver(pipe, data)
            }
            NetFrameKind::Notification(NetNotification::Close { pipe }) => self.remote_close(pipe),
            NetFrameKind::Notification(NetNotification::Activate { pipe }) => self.activate(pipe),
            NetFrameKind::Notification(NetNotification::ShuttingDown) => {
                info!(conn = %self.id, peer = %self.peer, "KGR: peer is shutting down");
            }
        }
    }

    /// Fail everything and close the socket. Runs once.
    pub(crate) async fn teardown(self: &Arc<Self>, reason: KgrError) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(conn = %self.id, peer = %self.peer, reason = %reason, "KGR: connection down");

        let waiters: Vec<Waiter> = self.waiters().drain().map(|(_, w)| w).collect();
        for waiter in waiters {
            let _ = waiter.send(Err(wire_error(&reason)));
        }

        let bridges = std::mem::take(&mut self.table().bridges);
        for (_, bridge) in bridges {
            bridge.closing.store(true, Ordering::Release);
            bridge.pipe.close_with(reason.clone());
        }

        self.handler.closed(self, &reason).await;
        self.closed_tx.send_replace(Some(reason));
        self.socket.close().await;
    }
}

fn wire_error(reason: &KgrError) -> WireError {
    match reason {
        KgrError::Timeout(what) => WireError::Timeout(what.clone()),
        KgrError::Protocol(what) => WireError::Protocol(what.clone()),
        _ => WireError::ConnectionClosed,
    }
}

impl Bridge {
    fn new(pipe: Box<dyn Pipe>, active: bool) -> Self {
        Self {
            pipe,
            active: AtomicBool::new(active),
            closing: AtomicBool::new(false),
            pump: Mutex::new(()),
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("pipes", &self.pipe_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::StreamSocket;
    use kgr_types::{ErrorKind, KgrValue};

    /// Answers nothing but pings.
    struct Idle;

    #[async_trait]
    impl RequestHandler for Idle {
        async fn handle(&self, _: &Arc<Connection>, request: NetRequest) -> KgrResult<NetResponse> {
            Err(KgrError::InvalidInput(format!("unexpected {request:?}")))
        }
    }

    fn pair(config: NetConfig) -> (Arc<Connection>, Arc<Connection>) {
        let (a, b) = StreamSocket::pair(64 * 1024);
        (
            Connection::start(Arc::new(a), config.clone(), "a".into(), Role::Master, Arc::new(Idle)),
            Connection::start(Arc::new(b), config, "b".into(), Role::Slave, Arc::new(Idle)),
        )
    }

    /// Bridge a fresh pipe pair on both connections under the same id.
    fn link(a: &Arc<Connection>, b: &Arc<Connection>) -> (LocalPipe, LocalPipe) {
        let (a_app, a_net) = LocalPipe::pair();
        let (b_app, b_net) = LocalPipe::pair();
        let id = a.attach_new_pipe(Box::new(a_net), true).unwrap();
        b.attach_pipe(id, Box::new(b_net), true).unwrap();
        (a_app, b_app)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_pipe_traffic_in_order() {
        let (a, b) = pair(NetConfig::default());
        let (left, right) = link(&a, &b);
        for i in 0..50 {
            left.write(KgrValue::Int(i)).unwrap();
        }
        let right = tokio::task::spawn_blocking(move || {
            let got: Vec<KgrValue> = (0..50).map(|_| right.read().unwrap()).collect();
            (right, got)
        });
        let (right, got) = right.await.unwrap();
        assert_eq!(got, (0..50).map(KgrValue::Int).collect::<Vec<_>>());

        right.write("back".into()).unwrap();
        let back = tokio::task::spawn_blocking(move || left.read()).await.unwrap();
        assert_eq!(back.unwrap(), KgrValue::from("back"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_close_handshake_releases_ids() {
        let (a, b) = pair(NetConfig::default());
        let (left, right) = link(&a, &b);
        left.close();
        let closed = tokio::task::spawn_blocking(move || right.read()).await.unwrap();
        assert_eq!(closed.unwrap_err().kind(), ErrorKind::PipeClosed);
        for _ in 0..100 {
            if a.pipe_count() == 0 && b.pipe_count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(a.pipe_count(), 0);
        assert_eq!(b.pipe_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queue_budget_holds_back_pipe_data() {
        let config = NetConfig {
            max_queued_bytes: 512,
            ..NetConfig::default()
        };
        // The far side is a raw socket nobody reads from yet.
        let (ours, theirs) = StreamSocket::pair(64);
        let conn = Connection::start(
            Arc::new(ours),
            config,
            "raw".into(),
            Role::Master,
            Arc::new(Idle),
        );
        let (app, net) = LocalPipe::pair();
        conn.attach_new_pipe(Box::new(net), true).unwrap();
        for i in 0..500 {
            app.write(KgrValue::Int(i)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        // One frame may overshoot the budget.
        assert!(conn.queued_bytes() < 512 + 256);

        // Once the peer reads, everything comes through in order.
        let mut buf = BytesMut::new();
        let mut next = 0;
        while next < 500 {
            let bytes = tokio::time::timeout(Duration::from_secs(5), theirs.read(READ_CHUNK))
                .await
                .unwrap()
                .unwrap();
            buf.extend_from_slice(&bytes);
            while let Some(frame) = decode_frame(&mut buf, u32::MAX).unwrap() {
                if let NetFrameKind::Notification(NetNotification::Send { data, .. }) = frame.kind {
                    assert_eq!(data, KgrValue::Int(next));
                    next += 1;
                }
            }
        }
    }

    #[tokio::test]
    async fn test_ping_round_trip() {
        let (a, _b) = pair(NetConfig::default());
        assert_eq!(a.request(NetRequest::Ping).await.unwrap(), NetResponse::Pong);
    }

    #[tokio::test]
    async fn test_error_response_is_remote_error() {
        let (a, _b) = pair(NetConfig::default());
        let err = a.request(NetRequest::AuthRequest).await.unwrap_err();
        assert!(matches!(err, WireError::Remote { code: 400, .. }));
    }

    #[tokio::test]
    async fn test_close_fails_pending_and_pipes() {
        let (a, b) = pair(NetConfig::default());
        let (left, _right) = link(&a, &b);
        a.close().await;
        assert!(a.is_closed());
        assert!(left.is_closed());
        assert!(matches!(
            a.request(NetRequest::Ping).await,
            Err(WireError::ConnectionClosed)
        ));
        assert_eq!(b.closed().await.kind(), ErrorKind::ConnectionFailed);
    }
}
