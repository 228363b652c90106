//! The connection core (§4.4): framing, request multiplexing, call
//! dispatch, and the pause/resume discipline that lets a callee interleave
//! outbound calls while its own response is still pending.
//!
//! Grounded on the split `ClientBase`/`ClientSession` design of the original
//! source's `transport.cpp` — chosen over its monolithic draft per the
//! recorded Open Question decision — and on the teacher's per-connection
//! task layout (one task reading, one task writing, state shared behind a
//! lock rather than owned by a single task, since this rewrite runs on a
//! multi-threaded runtime rather than the original's single-threaded
//! reactor).

mod dispatch;
mod send_queue;

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex, PoisonError,
    },
};

use async_trait::async_trait;
use std::sync::Arc;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
};
use tracing::{debug, info, warn};

use crate::{
    error::{EndpointError, FrameError, ObjectError},
    frame::{self, RawFrame},
    future::Future,
    object::{
        ConnectionHandle, LocalObject, LocalObjectHandle, ObjectTable, PeerId, RemoteProxy,
        GLOBAL_OBJECT_ID,
    },
    variant::Variant,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// A single framed, full-duplex connection.
///
/// Owns no socket directly — [`Self::spawn`] and [`Self::rebind`] split
/// whatever `AsyncRead + AsyncWrite` is handed to them into a reader task, a
/// writer task ([`send_queue`]), and a serialised call-dispatch worker
/// ([`dispatch`]), all sharing this struct's state behind `Arc`/`Mutex`.
pub struct Endpoint {
    object_table: Arc<ObjectTable>,
    peer: PeerId,
    pending: Mutex<HashMap<u32, Future>>,
    next_request_id: AtomicU32,
    /// The writer handle currently in use, shared with the dispatch worker so
    /// a `RETURN` for a call dispatched before a reconnect still reaches
    /// whichever socket is live by the time the handler finishes (§4.5's
    /// resumption contract).
    outbound: Arc<Mutex<Arc<send_queue::SendQueueHandle>>>,
    /// Sender side of the dispatch worker's channel. Stable across
    /// [`Self::rebind`]s: the worker itself is spawned once, in
    /// [`Self::spawn`], and outlives any individual socket so that a call
    /// already in progress when the transport drops keeps running rather
    /// than being aborted along with the reader/writer tasks.
    dispatch_tx: mpsc::Sender<dispatch::Dispatched>,
    max_frame_size: u32,
    closing: AtomicBool,
    closed_tx: watch::Sender<bool>,
    /// Fires on a recoverable transport loss (socket error or clean EOF) as
    /// distinct from [`Self::closed_tx`]: a disconnect leaves the pending-call
    /// map and every registered object untouched so that [`Self::rebind`] can
    /// restore the session (§4.5's resumption contract, property 7). Only an
    /// explicit [`Self::close`] — e.g. the suspended-session expiry timer, or
    /// a protocol-fatal decode error — drains pending calls and frees
    /// peer-owned objects.
    disconnected_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Endpoint {
    /// Spawn a new endpoint over `stream`, sharing `object_table` (the
    /// process-wide global object lives here) and scoping ownership
    /// bookkeeping to `peer` (conventionally the session id).
    #[must_use]
    pub fn spawn<S>(stream: S, object_table: Arc<ObjectTable>, peer: PeerId, max_frame_size: u32) -> Arc<Self>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (closed_tx, _rx) = watch::channel(false);
        let (disconnected_tx, _rx2) = watch::channel(false);
        let outbound = Arc::new(Mutex::new(Arc::new(send_queue::SendQueueHandle::closed())));
        let (dispatch_tx, dispatch_rx) = mpsc::channel(1);
        tokio::spawn(dispatch::run_worker(dispatch_rx, object_table.clone(), peer, outbound.clone()));

        let endpoint = Arc::new(Self {
            object_table,
            peer,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU32::new(1),
            outbound,
            dispatch_tx,
            max_frame_size,
            closing: AtomicBool::new(false),
            closed_tx,
            disconnected_tx,
            tasks: Mutex::new(Vec::new()),
        });
        endpoint.bind(stream);
        endpoint
    }

    /// Migrate this endpoint onto a freshly accepted socket (§4.5 step 4's
    /// socket migration on resumption). Aborts the previous reader/writer
    /// tasks and rebinds them to `stream`; the dispatch worker is untouched,
    /// so a handler call already running when the old socket dropped keeps
    /// running and its `RETURN` goes out over the new one. The pending-call
    /// map and object table are likewise left alone.
    pub fn rebind<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        for task in lock(&self.tasks).drain(..) {
            task.abort();
        }
        let _ = self.disconnected_tx.send(false);
        self.bind(stream);
        info!(peer = self.peer, "endpoint rebound onto a resumed socket");
    }

    fn bind<S>(self: &Arc<Self>, stream: S)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);

        let on_fatal = {
            let endpoint = self.clone();
            move || endpoint.on_disconnect(EndpointError::Closed("write failed".to_owned()))
        };
        let (outbound, writer_task) = send_queue::spawn_writer(write_half, on_fatal);
        *lock(&self.outbound) = outbound;

        let dispatch_tx = self.dispatch_tx.clone();
        let reader = self.clone();
        let read_task = tokio::spawn(async move { reader.read_loop(read_half, dispatch_tx).await });

        let mut tasks = lock(&self.tasks);
        tasks.push(writer_task);
        tasks.push(read_task);
    }

    async fn read_loop<R>(self: Arc<Self>, mut reader: R, dispatch_tx: mpsc::Sender<dispatch::Dispatched>)
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        loop {
            match frame::read_frame(&mut reader, self.max_frame_size).await {
                Ok(raw) => {
                    if !self.handle_frame(raw, &dispatch_tx).await {
                        break;
                    }
                }
                Err(FrameError::Io(io_err)) => {
                    debug!(peer = self.peer, error = %io_err, "read loop ended: transport loss");
                    self.on_disconnect(EndpointError::from(io_err));
                    break;
                }
                Err(err) => {
                    warn!(peer = self.peer, error = %err, "read loop ended: protocol violation, closing");
                    self.teardown(EndpointError::from(err));
                    break;
                }
            }
        }
    }

    /// Handle one already-read frame. Returns `false` if the read loop
    /// should stop (fatal decode error or the dispatch worker is gone).
    async fn handle_frame(
        self: &Arc<Self>,
        raw: RawFrame,
        dispatch_tx: &mpsc::Sender<dispatch::Dispatched>,
    ) -> bool {
        match raw.msg_type {
            frame::MSG_RETURN => {
                self.handle_return(raw).await;
                true
            }
            frame::MSG_DELOBJ => {
                if let Ok(id) = frame::decode_delobj_body(&raw.body) {
                    self.object_table.delete_object(id);
                }
                true
            }
            frame::MSG_CALL_PROC | frame::MSG_CALL_FUNC => {
                let mut replacer = self.id_replacer();
                match frame::decode_call_body(&raw.body, Some(&mut replacer)) {
                    Ok(body) => {
                        let item =
                            dispatch::Dispatched { request_id: raw.request_id, msg_type: raw.msg_type, body };
                        dispatch_tx.send(item).await.is_ok()
                    }
                    Err(err) => {
                        warn!(peer = self.peer, error = %err, "decode error, closing connection");
                        self.teardown(EndpointError::from(FrameError::from(err)));
                        false
                    }
                }
            }
            frame::MSG_PING | frame::MSG_PONG => true,
            other => {
                warn!(peer = self.peer, msg_type = other, "unknown message type, closing connection");
                self.teardown(EndpointError::Protocol(format!("unknown message type {other}")));
                false
            }
        }
    }

    async fn handle_return(self: &Arc<Self>, raw: RawFrame) {
        let mut replacer = self.id_replacer();
        let value = match frame::decode_return_body(&raw.body, Some(&mut replacer)) {
            Ok(v) => v,
            Err(err) => Variant::exception(err.to_string()),
        };
        let pending = lock(&self.pending).remove(&raw.request_id);
        let Some(fut) = pending else {
            return;
        };
        if value.is_exception() {
            fut.fire_error(value);
        } else {
            fut.fire_success(value);
        }
        // Back-pressure rule (§4.4): if firing spliced in a further Future,
        // do not read the next frame until this chain fully settles.
        fut.await;
    }

    fn id_replacer(self: &Arc<Self>) -> impl FnMut(u32) -> LocalObjectHandle + 'static {
        let connection: Arc<dyn ConnectionHandle> = self.clone();
        move |id: u32| Arc::new(LocalObject::remote(connection.clone(), id))
    }

    fn object_replacer(&self) -> impl FnMut(&LocalObjectHandle) -> u32 + '_ {
        move |obj: &LocalObjectHandle| {
            #[expect(clippy::expect_used, reason = "a non-global registration never fails")]
            self.object_table.register(obj.clone(), self.peer, false).expect("register local object")
        }
    }

    fn alloc_request_id(&self) -> u32 { self.next_request_id.fetch_add(1, Ordering::SeqCst) }

    async fn enqueue(&self, frame: RawFrame) -> Future {
        let handle = lock(&self.outbound).clone();
        handle.enqueue(frame).await
    }

    /// Issue `name(args)` against `object_id`, returning `(result, write_complete)`.
    ///
    /// `want_result` selects `CALL_FUNC` (the result `Future` fires once the
    /// peer's `RETURN` arrives) versus `CALL_PROC` (fire-and-forget; the
    /// result `Future` is pre-fired with `Variant::Null`). `write_complete`
    /// fires once this call's bytes have been written in full, regardless of
    /// `want_result` — used to drive streamed results (§4.4).
    pub async fn call(&self, object_id: u32, name: &str, args: Variant, want_result: bool) -> (Future, Future) {
        let request_id = self.alloc_request_id();
        let result_future = Future::new();
        if want_result {
            lock(&self.pending).insert(request_id, result_future.clone());
        } else {
            result_future.fire_success(Variant::Null);
        }

        let mut replacer = self.object_replacer();
        let body = match frame::encode_call_body(object_id, name, &args, Some(&mut replacer)) {
            Ok(b) => b,
            Err(err) => {
                lock(&self.pending).remove(&request_id);
                result_future.fire_error(Variant::exception(err.to_string()));
                return (result_future, Future::ready(Variant::Null));
            }
        };
        let msg_type = if want_result { frame::MSG_CALL_FUNC } else { frame::MSG_CALL_PROC };
        let write_complete = self.enqueue(RawFrame { msg_type, request_id, body }).await;
        (result_future, write_complete)
    }

    /// Register `obj` in this endpoint's shared object table, owned by this
    /// connection's peer (or globally, under id 0, if `global` is set).
    ///
    /// # Errors
    /// Returns [`ObjectError::ReservedId`] if `global` is set and a global
    /// object is already registered.
    pub fn register_object(&self, obj: LocalObject, global: bool) -> Result<u32, ObjectError> {
        self.object_table.register(Arc::new(obj), self.peer, global)
    }

    /// A [`RemoteProxy`] bound to the well-known global object (id 0) on the
    /// peer.
    #[must_use]
    pub fn global_object(self: &Arc<Self>) -> RemoteProxy {
        RemoteProxy::new(self.clone() as Arc<dyn ConnectionHandle>, GLOBAL_OBJECT_ID)
    }

    /// A [`watch::Receiver`] that observes `true` once this endpoint closes.
    /// Safe to subscribe after the fact: the channel always reflects current
    /// state, so a subscriber that arrives after close sees `true` right
    /// away rather than missing the transition.
    #[must_use]
    pub fn closed_signal(&self) -> watch::Receiver<bool> { self.closed_tx.subscribe() }

    /// `true` once this endpoint has torn down (read or write failure, or an
    /// explicit [`Self::close`]).
    #[must_use]
    pub fn is_closed(&self) -> bool { *self.closed_tx.borrow() }

    /// A [`watch::Receiver`] that observes `true` while the underlying
    /// socket is lost but the session has not (yet) been explicitly closed.
    /// [`Self::rebind`] clears this back to `false`. This is what
    /// [`crate::session::SessionManager`] and [`crate::dialer::Dialer`]
    /// watch to decide when to suspend/reconnect, as distinct from
    /// [`Self::closed_signal`], which only fires on a final teardown.
    #[must_use]
    pub fn disconnected_signal(&self) -> watch::Receiver<bool> { self.disconnected_tx.subscribe() }

    /// Explicitly close this endpoint (used by session expiry and dialer
    /// shutdown) with `reason` surfaced to every pending call's error path.
    /// Unlike a transport-level disconnect, this drains pending calls and
    /// frees peer-owned objects immediately: it means the session itself is
    /// gone, not merely its current socket.
    pub fn close(&self, reason: EndpointError) { self.teardown(reason); }

    /// Record a recoverable transport loss: the socket is gone, but the
    /// session might still resume onto a new one via [`Self::rebind`]. Does
    /// **not** drain pending calls or free peer-owned objects (§4.5's
    /// resumption contract) — only [`Self::teardown`] does that, once a
    /// disconnect is deemed final.
    fn on_disconnect(&self, reason: EndpointError) {
        if *self.disconnected_tx.borrow() {
            return;
        }
        warn!(peer = self.peer, error = %reason, "connection disconnected, awaiting possible resume");
        lock(&self.outbound).close();
        let _ = self.disconnected_tx.send(true);
    }

    fn teardown(&self, reason: EndpointError) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(peer = self.peer, error = %reason, "tearing down connection");
        let pending: Vec<Future> = lock(&self.pending).drain().map(|(_, f)| f).collect();
        for f in pending {
            f.fire_error(Variant::exception(reason.to_string()));
        }
        self.object_table.free_peer_objects(self.peer);
        lock(&self.outbound).close();
        let _ = self.disconnected_tx.send(true);
        let _ = self.closed_tx.send(true);
    }
}

#[async_trait]
impl ConnectionHandle for Endpoint {
    async fn send_call(&self, object_id: u32, name: &str, args: Variant, want_result: bool) -> Future {
        let (result, _write_complete) = self.call(object_id, name, args, want_result).await;
        result
    }

    fn send_delete(&self, object_id: u32) {
        let body = frame::encode_delobj_body(object_id);
        let frame = RawFrame { msg_type: frame::MSG_DELOBJ, request_id: 0, body };
        let outbound = lock(&self.outbound).clone();
        tokio::spawn(async move {
            outbound.enqueue(frame).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::io::duplex;

    use super::*;
    use crate::object::{map, MethodHandler};

    struct Echo;

    #[async_trait]
    impl MethodHandler for Echo {
        async fn call(&self, _this: &LocalObject, args: Variant) -> Variant { args }
    }

    struct Missing;
    #[async_trait]
    impl MethodHandler for Missing {
        async fn call(&self, _this: &LocalObject, _args: Variant) -> Variant {
            Variant::exception("unreachable")
        }
    }

    fn spawn_pair(table: Arc<ObjectTable>) -> (Arc<Endpoint>, Arc<Endpoint>) {
        let (a, b) = duplex(64 * 1024);
        let client = Endpoint::spawn(a, table.clone(), 1, 1024 * 1024);
        let server = Endpoint::spawn(b, table, 2, 1024 * 1024);
        (client, server)
    }

    #[tokio::test]
    async fn echo_round_trips_through_the_global_object() {
        let table = Arc::new(ObjectTable::default());
        let mut global = LocalObject::new();
        global.register_method("echo", Echo);
        table.register(Arc::new(global), 0, true).expect("global register");

        let (client, _server) = spawn_pair(table);
        let (result, _write_complete) =
            client.call(GLOBAL_OBJECT_ID, "echo", map([("name", Variant::string("A"))]), true).await;
        let value = result.await;
        assert_eq!(value, map([("name", Variant::string("A"))]));
    }

    #[tokio::test]
    async fn unknown_method_surfaces_as_exception() {
        let table = Arc::new(ObjectTable::default());
        table.register(Arc::new(LocalObject::new()), 0, true).expect("global register");

        let (client, _server) = spawn_pair(table);
        let (result, _write_complete) = client.call(GLOBAL_OBJECT_ID, "missing", Variant::Null, true).await;
        let value = result.await;
        assert!(value.is_exception());
        let text = String::from_utf8_lossy(value.as_bytes().expect("exception carries bytes")).into_owned();
        assert!(text.contains("missing"), "exception text was {text:?}");
    }

    #[tokio::test]
    async fn call_proc_fires_its_future_immediately_with_no_return() {
        let table = Arc::new(ObjectTable::default());
        let mut global = LocalObject::new();
        global.register_method("echo", Echo);
        table.register(Arc::new(global), 0, true).expect("global register");

        let (client, _server) = spawn_pair(table);
        let (result, _write_complete) = client.call(GLOBAL_OBJECT_ID, "echo", Variant::Int(1), false).await;
        assert_eq!(result.await, Variant::Null);
    }

    struct CallsBack;

    #[async_trait]
    impl MethodHandler for CallsBack {
        async fn call(&self, this: &LocalObject, args: Variant) -> Variant {
            let Variant::Object(client_obj) = args else {
                return Variant::exception("expected an object argument");
            };
            let boo_result = client_obj.dispatch(0, "boo", Variant::string("S")).await.unwrap_or(Variant::Null);
            let _ = this;
            let mut merged = crate::variant::VariantMap::new();
            if let Variant::Map(m) = boo_result {
                merged.extend(m);
            }
            merged.insert("otch".to_owned(), Variant::string("P"));
            Variant::Map(merged)
        }
    }

    struct Boo;

    #[async_trait]
    impl MethodHandler for Boo {
        async fn call(&self, _this: &LocalObject, args: Variant) -> Variant {
            let Variant::String(name) = args else { return Variant::exception("expected a string") };
            map([("name", Variant::String(name))])
        }
    }

    #[tokio::test]
    async fn callback_during_dispatch_does_not_deadlock() {
        let table = Arc::new(ObjectTable::default());
        let mut server_global = LocalObject::new();
        server_global.register_method("foo", CallsBack);
        table.register(Arc::new(server_global), 0, true).expect("global register");

        let (client, _server) = spawn_pair(table.clone());

        let mut client_local = LocalObject::new();
        client_local.register_method("boo", Boo);
        let client_local_id = table.register(Arc::new(client_local), 1, false).expect("register client object");
        let client_local_handle = table.get(client_local_id).expect("handle");

        let (result, _write_complete) = tokio::time::timeout(
            Duration::from_secs(5),
            client.call(GLOBAL_OBJECT_ID, "foo", Variant::Object(client_local_handle), true),
        )
        .await
        .expect("must not deadlock");

        let value = tokio::time::timeout(Duration::from_secs(5), result).await.expect("must resolve");
        assert_eq!(
            value,
            map([("name", Variant::string("S")), ("otch", Variant::string("P"))])
        );
    }

    #[tokio::test]
    async fn closing_an_endpoint_errors_out_pending_calls() {
        let table = Arc::new(ObjectTable::default());
        table.register(Arc::new(LocalObject::new()), 0, true).expect("global register");
        let (client, server) = spawn_pair(table);

        let (result, _write_complete) = client.call(GLOBAL_OBJECT_ID, "never-replies", Variant::Null, true).await;
        server.close(EndpointError::Closed("test teardown".to_owned()));
        client.close(EndpointError::Closed("test teardown".to_owned()));

        let value = result.await;
        assert!(value.is_exception());
    }

    struct DelayedEcho;

    #[async_trait]
    impl MethodHandler for DelayedEcho {
        async fn call(&self, _this: &LocalObject, args: Variant) -> Variant {
            tokio::time::sleep(Duration::from_millis(150)).await;
            args
        }
    }

    /// Relays bytes between two halves of a simulated connection until
    /// dropped, at which point both sides see the transport vanish.
    fn relay<A, B>(mut a: A, mut b: B) -> tokio::task::JoinHandle<()>
    where
        A: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
        B: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        tokio::spawn(async move {
            let _ = tokio::io::copy_bidirectional(&mut a, &mut b).await;
        })
    }

    #[tokio::test]
    async fn rebinding_after_a_disconnect_completes_a_pending_call() {
        let table = Arc::new(ObjectTable::default());
        let mut global = LocalObject::new();
        global.register_method("slow_echo", DelayedEcho);
        table.register(Arc::new(global), 0, true).expect("global register");

        let (client_near, client_far) = duplex(64 * 1024);
        let (server_near, server_far) = duplex(64 * 1024);
        let client = Endpoint::spawn(client_near, table.clone(), 1, 1024 * 1024);
        let server = Endpoint::spawn(server_near, table.clone(), 2, 1024 * 1024);
        let link = relay(client_far, server_far);

        let (result, _write_complete) = client.call(GLOBAL_OBJECT_ID, "slow_echo", Variant::Int(7), true).await;
        let call_task = tokio::spawn(result);

        // Let the call land on the server (it is now mid-sleep inside the
        // handler) before severing the transport.
        tokio::time::sleep(Duration::from_millis(30)).await;
        link.abort();
        let _ = link.await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!call_task.is_finished(), "a disconnect must not drain the pending call");

        let (client_near2, client_far2) = duplex(64 * 1024);
        let (server_near2, server_far2) = duplex(64 * 1024);
        client.rebind(client_near2);
        server.rebind(server_near2);
        let _second_link = relay(client_far2, server_far2);

        let value = tokio::time::timeout(Duration::from_secs(2), call_task)
            .await
            .expect("the call must settle once the session resumes")
            .expect("task joins");
        assert_eq!(value, Variant::Int(7));
    }
}
