//! Local objects, remote proxies, and the per-connection object table.
//!
//! A [`LocalObject`] is a method-dispatch table; most are genuinely local
//! (registered by the application, see [`LocalObject::new`]), but one that
//! arrived as an `ObjectId` off the wire is represented the same way, via
//! [`LocalObject::remote`], whose dispatch simply forwards the call over the
//! connection it came from. Unifying the two means `Variant::Object` needs
//! only ever carry one handle shape, and a received remote handle can be
//! re-sent to a third party through the ordinary pack/replacer path with no
//! special case. [`ObjectTable`] owns every genuinely-local object this
//! process has exposed and tracks which peer each id was handed to, so that
//! closing a connection can drop exactly the objects that peer owned — see
//! `arti-rpcserver`'s connection-scoped object map, which this module's
//! ownership bookkeeping is modelled on.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Mutex,
        PoisonError,
    },
};

use async_trait::async_trait;
use tracing::{debug, trace};

use crate::{
    error::ObjectError,
    future::Future,
    variant::{Variant, VariantMap},
};

/// Id reserved for the well-known global object exposed by each endpoint.
pub const GLOBAL_OBJECT_ID: u32 = 0;

/// Default first id handed out for non-global registrations.
pub const DEFAULT_BASE_OBJECT_ID: u32 = 100;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// A single method attached to a locally-dispatched [`LocalObject`].
///
/// Handlers are async because a handler may itself need to call back into
/// the peer (scenario: "callback during dispatch") and await the result
/// before producing its own.
#[async_trait]
pub trait MethodHandler: Send + Sync {
    /// Invoke the method with `args`, returning the result value.
    ///
    /// A handler that wants to stream a result back in pieces after an
    /// outbound write completes should call [`LocalObject::return_written`]
    /// before returning; the dispatcher binds that future to the eventual
    /// `RETURN`.
    async fn call(&self, this: &LocalObject, args: Variant) -> Variant;
}

/// A handle to a single outbound connection, as seen by a forwarding
/// [`LocalObject`] or a [`RemoteProxy`].
///
/// Implemented by `Endpoint`; kept as a trait here so `object` has no
/// dependency on the endpoint module, mirroring the teacher's layering where
/// transaction framing never depends on the handler layer above it.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Issue a `CALL_PROC`/`CALL_FUNC` for `name(args)` against `object_id`
    /// on the peer. `want_result` selects `CALL_FUNC` (a `Future` is
    /// returned and eventually fires) versus `CALL_PROC` (fire-and-forget,
    /// the returned `Future` fires immediately with `Variant::Null`).
    async fn send_call(&self, object_id: u32, name: &str, args: Variant, want_result: bool) -> Future;

    /// Send a fire-and-forget `DELOBJ` for `object_id`. Best-effort; errors
    /// are swallowed since this runs from `Drop`.
    fn send_delete(&self, object_id: u32);
}

enum Dispatch {
    Local(HashMap<String, Box<dyn MethodHandler>>),
    Remote { connection: Arc<dyn ConnectionHandle>, id: u32 },
}

/// A method-dispatch table: either a genuinely local handler table, or a
/// forwarding handle bound to an id on a peer connection.
///
/// Cheaply shared via [`LocalObjectHandle`] (an `Arc`); this is the
/// in-process payload of [`Variant::Object`].
pub struct LocalObject {
    dispatch: Dispatch,
    written: Mutex<Option<Future>>,
}

/// An owning handle to a [`LocalObject`]; the in-process shape of
/// [`Variant::Object`].
pub type LocalObjectHandle = Arc<LocalObject>;

impl LocalObject {
    /// Create a genuinely local object with no methods registered.
    #[must_use]
    pub fn new() -> Self {
        Self { dispatch: Dispatch::Local(HashMap::new()), written: Mutex::new(None) }
    }

    /// Create a forwarding handle for the object registered under `id` on
    /// the peer reachable through `connection`. Dropping the last handle
    /// emits a `DELOBJ` unless `id` is the global object.
    #[must_use]
    pub fn remote(connection: Arc<dyn ConnectionHandle>, id: u32) -> Self {
        Self { dispatch: Dispatch::Remote { connection, id }, written: Mutex::new(None) }
    }

    /// `true` if this handle forwards to a peer rather than dispatching
    /// locally.
    #[must_use]
    pub const fn is_remote(&self) -> bool { matches!(self.dispatch, Dispatch::Remote { .. }) }

    /// The remote id this handle forwards to, if it is a forwarding handle.
    #[must_use]
    pub const fn remote_id(&self) -> Option<u32> {
        match &self.dispatch {
            Dispatch::Remote { id, .. } => Some(*id),
            Dispatch::Local(_) => None,
        }
    }

    /// Register `handler` under `name`, replacing any prior handler of the
    /// same name. A no-op (with a debug assertion) on a forwarding handle.
    pub fn register_method(&mut self, name: impl Into<String>, handler: impl MethodHandler + 'static) {
        match &mut self.dispatch {
            Dispatch::Local(methods) => {
                methods.insert(name.into(), Box::new(handler));
            }
            Dispatch::Remote { .. } => {
                debug_assert!(false, "cannot register a method on a forwarding object handle");
            }
        }
    }

    /// Builder-style variant of [`Self::register_method`].
    #[must_use]
    pub fn with_method(mut self, name: impl Into<String>, handler: impl MethodHandler + 'static) -> Self {
        self.register_method(name, handler);
        self
    }

    /// Dispatch `name(args)`.
    ///
    /// For a local object this runs the registered handler; for a
    /// forwarding handle this issues a `CALL_FUNC` over the bound connection
    /// and awaits the `RETURN`. `id` (the id this object is registered
    /// under on *our* side, if any) is carried only for error messages.
    ///
    /// # Errors
    /// Returns [`ObjectError::UnknownMethod`] if a local object has no
    /// method of that name registered.
    pub async fn dispatch(&self, id: u32, name: &str, args: Variant) -> Result<Variant, ObjectError> {
        match &self.dispatch {
            Dispatch::Local(methods) => {
                let handler = methods.get(name).ok_or_else(|| ObjectError::UnknownMethod(name.to_owned(), id))?;
                Ok(handler.call(self, args).await)
            }
            Dispatch::Remote { connection, id: remote_id } => {
                trace!(remote_id, method = name, "forwarding call to peer");
                let result_future = connection.send_call(*remote_id, name, args, true).await;
                Ok(result_future.await)
            }
        }
    }

    /// Attach a write-completion future to the call currently being
    /// dispatched, signalling that the handler's real result will be
    /// delivered once earlier queued writes (e.g. streamed chunks) land.
    ///
    /// Per §4.4's first result shape, the dispatcher waits for this future
    /// before resuming reads, then sends whatever value it fires as the
    /// `RETURN`.
    pub fn return_written(&self, written: Future) { *lock(&self.written) = Some(written); }

    /// Take the write-completion future attached by the most recent
    /// dispatch, if any, clearing it for the next call.
    #[must_use]
    pub fn take_written(&self) -> Option<Future> { lock(&self.written).take() }
}

impl Default for LocalObject {
    fn default() -> Self { Self::new() }
}

impl Drop for LocalObject {
    fn drop(&mut self) {
        if let Dispatch::Remote { connection, id } = &self.dispatch {
            if *id != GLOBAL_OBJECT_ID {
                connection.send_delete(*id);
            }
        }
    }
}

/// An ergonomic, application-facing wrapper around a forwarding
/// [`LocalObject`]: `(connection, id)`, matching §6's `RemoteProxy` API.
///
/// This is a thin convenience type; the underlying handle (obtainable via
/// [`Self::as_handle`]) is what actually travels inside a [`Variant::Object`]
/// when this proxy is passed as a call argument or result.
pub struct RemoteProxy {
    handle: LocalObjectHandle,
}

impl RemoteProxy {
    /// Wrap `(connection, id)` into a proxy.
    #[must_use]
    pub fn new(connection: Arc<dyn ConnectionHandle>, id: u32) -> Self {
        Self { handle: Arc::new(LocalObject::remote(connection, id)) }
    }

    /// The id this proxy targets on the peer. Id 0 is the global object.
    #[must_use]
    pub fn id(&self) -> u32 { self.handle.remote_id().unwrap_or(GLOBAL_OBJECT_ID) }

    /// Invoke `name(args)` on the peer's object.
    ///
    /// # Panics
    /// Panics if this proxy was somehow built over a non-forwarding handle;
    /// cannot happen via the public constructor.
    pub async fn call(&self, name: &str, args: Variant) -> Variant {
        #[expect(clippy::expect_used, reason = "RemoteProxy always wraps a forwarding handle")]
        self.handle.dispatch(self.id(), name, args).await.expect("forwarding dispatch never errors locally")
    }

    /// The underlying handle, for embedding into a [`Variant::Object`] when
    /// this proxy is passed as a call argument or result.
    #[must_use]
    pub fn as_handle(&self) -> LocalObjectHandle { self.handle.clone() }
}

/// An opaque key identifying the peer a set of objects is owned by.
///
/// The endpoint picks this (typically the session id); `ObjectTable` itself
/// has no notion of what a peer "is" beyond this key.
pub type PeerId = u64;

struct TableInner {
    objects: HashMap<u32, LocalObjectHandle>,
    owners: HashMap<u32, PeerId>,
    by_peer: HashMap<PeerId, HashSet<u32>>,
    next_id: u32,
}

/// ObjectId → `LocalObject` registry plus peer → owned-ids bookkeeping.
///
/// Shared across every connection of a process (the global object, id 0, is
/// visible to all peers); per-peer ownership is tracked so that
/// [`Self::free_peer_objects`] can drop exactly what a disconnecting peer
/// owned, leaving the global object and other peers' objects untouched.
pub struct ObjectTable {
    inner: Mutex<TableInner>,
    base_id: AtomicU32,
}

impl ObjectTable {
    /// Create an empty table that allocates non-global ids starting at
    /// `base_id` (the protocol default is 100).
    #[must_use]
    pub fn new(base_id: u32) -> Self {
        Self {
            inner: Mutex::new(TableInner {
                objects: HashMap::new(),
                owners: HashMap::new(),
                by_peer: HashMap::new(),
                next_id: base_id,
            }),
            base_id: AtomicU32::new(base_id),
        }
    }

    /// Register `obj` under a fresh id, or under id 0 if `global` is `true`.
    ///
    /// `owner` is ignored for global registrations: the global object is
    /// owned by no peer and [`Self::free_peer_objects`] never removes it.
    ///
    /// # Errors
    /// Returns [`ObjectError::ReservedId`] if the table already has a global
    /// object registered and `global` is requested again.
    pub fn register(&self, obj: LocalObjectHandle, owner: PeerId, global: bool) -> Result<u32, ObjectError> {
        let mut guard = lock(&self.inner);
        let id = if global {
            if guard.objects.contains_key(&GLOBAL_OBJECT_ID) {
                return Err(ObjectError::ReservedId);
            }
            GLOBAL_OBJECT_ID
        } else {
            let id = guard.next_id;
            guard.next_id += 1;
            guard.owners.insert(id, owner);
            guard.by_peer.entry(owner).or_default().insert(id);
            id
        };
        guard.objects.insert(id, obj);
        debug!(object_id = id, global, "registered local object");
        Ok(id)
    }

    /// Look up the local object registered under `id`, cloning its handle.
    #[must_use]
    pub fn get(&self, id: u32) -> Option<LocalObjectHandle> { lock(&self.inner).objects.get(&id).cloned() }

    /// Dispatch `name(args)` on the object registered under `id`.
    ///
    /// An unknown id or method is converted into a typed error for the
    /// caller to fold into an `Exception` Variant, per §4.3 and §7's
    /// dispatch-time error policy.
    ///
    /// # Errors
    /// Returns [`ObjectError::UnknownObject`] or [`ObjectError::UnknownMethod`].
    pub async fn local_call(&self, id: u32, name: &str, args: Variant) -> Result<Variant, ObjectError> {
        let obj = self.get(id).ok_or(ObjectError::UnknownObject(id))?;
        trace!(object_id = id, method = name, "dispatching local call");
        obj.dispatch(id, name, args).await
    }

    /// Remove the local object registered under `id`, if any (used for both
    /// an inbound `DELOBJ` and peer cleanup).
    pub fn delete_object(&self, id: u32) {
        let mut guard = lock(&self.inner);
        if guard.objects.remove(&id).is_some() {
            if let Some(owner) = guard.owners.remove(&id) {
                if let Some(set) = guard.by_peer.get_mut(&owner) {
                    set.remove(&id);
                }
            }
            debug!(object_id = id, "deleted local object");
        }
    }

    /// Drop every object owned by `peer` (§4.3 lifetime rule: closing a
    /// connection destroys every object exclusively owned by that peer). The
    /// global object is never owned by a peer and is therefore never
    /// touched.
    pub fn free_peer_objects(&self, peer: PeerId) {
        let mut guard = lock(&self.inner);
        let Some(ids) = guard.by_peer.remove(&peer) else { return };
        let count = ids.len();
        for id in ids {
            guard.objects.remove(&id);
            guard.owners.remove(&id);
        }
        debug!(peer, count, "freed peer-owned objects");
    }

    /// Number of objects currently registered, including the global object
    /// if present. Exposed for tests asserting GC-on-disconnect.
    #[must_use]
    pub fn len(&self) -> usize { lock(&self.inner).objects.len() }

    /// `true` if no objects are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// The configured base id new non-global registrations start from.
    #[must_use]
    pub fn base_id(&self) -> u32 { self.base_id.load(Ordering::Relaxed) }
}

impl Default for ObjectTable {
    fn default() -> Self { Self::new(DEFAULT_BASE_OBJECT_ID) }
}

/// Build a `Variant::Map` from `(key, value)` pairs; a small convenience used
/// throughout tests and the sample binaries.
#[must_use]
pub fn map(pairs: impl IntoIterator<Item = (&'static str, Variant)>) -> Variant {
    let mut m = VariantMap::new();
    for (k, v) in pairs {
        m.insert(k.to_owned(), v);
    }
    Variant::Map(m)
}
