//! The per-connection outbound send queue: one write in flight at a time,
//! each queued frame paired with a write-completion [`Future`].
//!
//! Grounded on the single-writer discipline the original source enforces in
//! `handleWrite`/`sendBuffer` (never issue a second write until the first's
//! completion handler has run) and on the teacher's use of a dedicated
//! writer task per connection.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::{io::AsyncWrite, sync::mpsc, task::JoinHandle};
use tracing::trace;

use crate::{frame, future::Future, variant::Variant};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

struct QueuedFrame {
    frame: frame::RawFrame,
    completion: Future,
}

/// Handle to a connection's outbound writer task.
///
/// Cloning the sender is cheap ([`mpsc::Sender`] is reference counted); this
/// type additionally supports being put into a "closed" state so that a
/// rebind or teardown can stop accepting new writes without waiting for the
/// writer task itself to notice.
pub(crate) struct SendQueueHandle {
    tx: Mutex<Option<mpsc::Sender<QueuedFrame>>>,
}

impl SendQueueHandle {
    /// A handle with no writer behind it; every enqueue fails immediately.
    /// Used as the initial placeholder before the first `bind`.
    pub(crate) fn closed() -> Self { Self { tx: Mutex::new(None) } }

    /// Queue `frame` for writing, returning a [`Future`] that fires once the
    /// bytes have been written in full (or with an exception if the
    /// connection is closed or the write fails).
    pub(crate) async fn enqueue(&self, frame: frame::RawFrame) -> Future {
        let completion = Future::new();
        let sender = { lock(&self.tx).clone() };
        match sender {
            Some(tx) => {
                let item = QueuedFrame { frame, completion: completion.clone() };
                if tx.send(item).await.is_err() {
                    completion.fire_error(Variant::exception("connection closed"));
                }
            }
            None => completion.fire_error(Variant::exception("connection closed")),
        }
        completion
    }

    /// Stop accepting new writes; any frame already queued still drains.
    pub(crate) fn close(&self) { *lock(&self.tx) = None; }
}

/// Spawn the writer task owning `writer`, returning a handle to feed it and
/// the task's `JoinHandle`. `on_fatal` runs once, the first time a write
/// fails, so the caller can tear the whole connection down rather than
/// leaving the read side running against a half-dead socket.
pub(crate) fn spawn_writer<W, F>(mut writer: W, on_fatal: F) -> (Arc<SendQueueHandle>, JoinHandle<()>)
where
    W: AsyncWrite + Unpin + Send + 'static,
    F: Fn() + Send + Sync + 'static,
{
    let (tx, mut rx) = mpsc::channel::<QueuedFrame>(64);
    let handle = Arc::new(SendQueueHandle { tx: Mutex::new(Some(tx)) });
    let task = tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match frame::write_frame(&mut writer, &item.frame).await {
                Ok(()) => {
                    trace!(request_id = item.frame.request_id, "write complete");
                    item.completion.fire_success(Variant::Null);
                }
                Err(err) => {
                    item.completion.fire_error(Variant::exception(err.to_string()));
                    on_fatal();
                    break;
                }
            }
        }
    });
    (handle, task)
}
