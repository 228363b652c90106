//! The serialised call-dispatch worker: exactly one `CALL_PROC`/`CALL_FUNC`
//! is being handled at a time per connection.
//!
//! The worker is fed over a channel of bounded capacity 1, fed directly from
//! the read loop. Because the read loop never blocks waiting for *this*
//! worker to finish a call (it only blocks if a second call arrives before
//! the worker has drained the first), `RETURN` and `DELOBJ` frames for the
//! callee's own outbound calls keep flowing while a dispatch is in progress
//! — precisely the back-pressure rule: new dispatches pause, but nothing
//! else does.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::trace;

use crate::{
    frame::{self, CallBody, RawFrame},
    object::{LocalObjectHandle, ObjectTable, PeerId},
    variant::Variant,
};

use super::{lock, send_queue::SendQueueHandle};

/// A decoded, not-yet-dispatched `CALL_PROC`/`CALL_FUNC`.
pub(crate) struct Dispatched {
    pub(crate) request_id: u32,
    pub(crate) msg_type: u8,
    pub(crate) body: CallBody,
}

/// Drain `rx`, dispatching one call at a time against `object_table` and
/// writing a `RETURN` for every `CALL_FUNC` (never for a `CALL_PROC`).
///
/// Spawned once per [`super::Endpoint`] and never aborted by a reconnect: a
/// handler already running when the transport drops keeps running, and its
/// eventual `RETURN` goes out over whichever writer `outbound` currently
/// points at, which [`super::Endpoint::rebind`] swaps in once the session
/// resumes.
pub(crate) async fn run_worker(
    mut rx: mpsc::Receiver<Dispatched>,
    object_table: Arc<ObjectTable>,
    peer: PeerId,
    outbound: Arc<Mutex<Arc<SendQueueHandle>>>,
) {
    while let Some(item) = rx.recv().await {
        let want_result = item.msg_type == frame::MSG_CALL_FUNC;
        let CallBody { object_id, name, args } = item.body;
        trace!(object_id, method = %name, want_result, "dispatching call");

        let dispatched = object_table.local_call(object_id, &name, args).await;
        let handler_value = match dispatched {
            Ok(v) => v,
            Err(err) => Variant::exception(err.to_string()),
        };

        if !want_result {
            continue;
        }

        let final_value = resolve_result(&object_table, object_id, handler_value).await;
        let current = lock(&outbound).clone();
        send_return(&current, &object_table, peer, item.request_id, final_value).await;
    }
}

/// Reconcile the four result shapes of a `CALL_FUNC` dispatch into the value
/// that actually gets sent as the `RETURN`:
/// 1. a write-completion future was attached (streaming) — await it;
/// 2. the handler returned a `Future` directly (a deferred value) — await it;
/// 3. the handler returned a plain value — use it as-is;
/// 4. the handler's error was already folded into an `Exception` above.
async fn resolve_result(object_table: &Arc<ObjectTable>, object_id: u32, handler_value: Variant) -> Variant {
    let written: Option<LocalObjectHandle> = object_table.get(object_id);
    if let Some(obj) = written {
        if let Some(write_complete) = obj.take_written() {
            return write_complete.await;
        }
    }
    match handler_value {
        Variant::Future(f) => f.await,
        other => other,
    }
}

async fn send_return(
    outbound: &SendQueueHandle,
    object_table: &Arc<ObjectTable>,
    peer: PeerId,
    request_id: u32,
    value: Variant,
) {
    let mut replacer = |obj: &LocalObjectHandle| -> u32 {
        #[expect(clippy::expect_used, reason = "a non-global registration never fails")]
        object_table.register(obj.clone(), peer, false).expect("register local object for RETURN")
    };
    let body = match frame::encode_return_body(&value, Some(&mut replacer)) {
        Ok(b) => b,
        Err(err) => frame::encode_return_body(&Variant::exception(err.to_string()), None)
            .unwrap_or_default(),
    };
    let frame = RawFrame { msg_type: frame::MSG_RETURN, request_id, body };
    outbound.enqueue(frame).await;
}
