//! Server-side session lifecycle (§4.5, §4.6): accept loop, session-id →
//! `Endpoint` map, suspend timer, resumption/socket migration.
//!
//! Grounded on the teacher's `accept_connections`/`JoinSet` accept loop
//! (`server/legacy.rs`) for the listener shape, and on
//! `examples/original_source/DualRPC/transport.cpp`'s session bookkeeping
//! for the `Fresh`/`Bound`/`Suspended`/`Dead` state machine this module
//! drives.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::{
    net::{TcpListener, TcpStream},
    task::JoinHandle,
    time::Duration,
};
use tracing::{info, warn};

use crate::{
    endpoint::Endpoint,
    error::EndpointError,
    handshake::{self, Outcome},
    object::ObjectTable,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// Lifecycle state of a server-side session (§3).
///
/// `Fresh` only exists transiently during the handshake (this module never
/// stores a session in that state); every entry in [`SessionManager`]'s map
/// is `Bound`/`Live` (represented jointly, since this rewrite has no
/// separate idle-vs-active distinction beyond "has a socket") or
/// `Suspended` (socket lost, expiry timer running). `Dead` sessions are
/// simply removed from the map rather than retained in a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Connected, serving frames normally.
    Bound,
    /// Socket lost; an expiry timer is counting down toward [`SessionState::Dead`].
    Suspended,
}

struct SessionEntry {
    endpoint: Arc<Endpoint>,
    state: SessionState,
    expiry_task: Option<JoinHandle<()>>,
}

struct ManagerInner {
    sessions: HashMap<u64, SessionEntry>,
}

/// Accepts connections, allocates/resumes sessions, and arbitrates the
/// server side of the handshake (§4.5 steps 1-5, §4.6).
///
/// Holds the single [`ObjectTable`] shared by every session of this
/// process — the global object (id 0) must be reachable from any peer, so
/// it lives here rather than per-session.
pub struct SessionManager {
    inner: Mutex<ManagerInner>,
    object_table: Arc<ObjectTable>,
    max_frame_size: u32,
    suspend_expiry: Duration,
    rng: Mutex<StdRng>,
}

impl SessionManager {
    /// Build a manager sharing `object_table` across all sessions, with
    /// sessions suspended for up to `suspend_expiry` before being torn
    /// down.
    #[must_use]
    pub fn new(object_table: Arc<ObjectTable>, max_frame_size: u32, suspend_expiry: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(ManagerInner { sessions: HashMap::new() }),
            object_table,
            max_frame_size,
            suspend_expiry,
            rng: Mutex::new(StdRng::from_entropy()),
        })
    }

    /// The object table shared by every session this manager owns.
    #[must_use]
    pub fn object_table(&self) -> Arc<ObjectTable> { self.object_table.clone() }

    /// Accept loop: binds `listener` and spawns one handshake+serve task per
    /// incoming connection, returning once the socket itself errors fatally
    /// (a transient per-connection accept error is logged and does not stop
    /// the loop, matching the teacher's `handle_accept_result`).
    ///
    /// # Errors
    /// Returns the listener's I/O error if `accept` itself fails fatally.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), std::io::Error> {
        loop {
            let (socket, peer_addr) = listener.accept().await?;
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(err) = manager.handle_accepted(socket, peer_addr).await {
                    warn!(%peer_addr, error = %err, "handshake failed, dropping connection");
                }
            });
        }
    }

    /// Convenience wrapper: bind `addr` and run [`Self::serve`].
    ///
    /// # Errors
    /// Returns any I/O error from binding or from [`Self::serve`].
    pub async fn serve_addr(self: &Arc<Self>, addr: SocketAddr) -> Result<(), std::io::Error> {
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "session manager listening");
        self.serve(listener).await
    }

    async fn handle_accepted(
        self: &Arc<Self>,
        mut socket: TcpStream,
        peer_addr: SocketAddr,
    ) -> Result<(), EndpointError> {
        let fresh_id = self.fresh_id();
        let manager = self.clone();
        let (chosen, outcome) = handshake::server_handshake(&mut socket, fresh_id, move |client_id| {
            manager.lookup_suspended(client_id)
        })
        .await?;

        match outcome {
            Outcome::Resumed => self.resume(chosen, socket, peer_addr),
            Outcome::New => self.bind_new(chosen, socket, peer_addr),
        }
        Ok(())
    }

    fn fresh_id(&self) -> u64 {
        let mut rng = lock(&self.rng);
        loop {
            let id = handshake::fresh_session_id(&mut *rng);
            if !lock(&self.inner).sessions.contains_key(&id) {
                return id;
            }
        }
    }

    /// Consulted from within the handshake closure: `Some(id)` only if `id`
    /// names a currently-`Suspended` session (§4.5 step 4).
    fn lookup_suspended(&self, id: u64) -> Option<u64> {
        let guard = lock(&self.inner);
        guard
            .sessions
            .get(&id)
            .filter(|entry| entry.state == SessionState::Suspended)
            .map(|_| id)
    }

    fn bind_new(self: &Arc<Self>, id: u64, socket: TcpStream, peer_addr: SocketAddr) {
        let endpoint = Endpoint::spawn(socket, self.object_table.clone(), id, self.max_frame_size);
        lock(&self.inner)
            .sessions
            .insert(id, SessionEntry { endpoint: endpoint.clone(), state: SessionState::Bound, expiry_task: None });
        info!(session_id = id, %peer_addr, "new session bound");
        self.watch_for_suspend(id, endpoint);
    }

    fn resume(self: &Arc<Self>, id: u64, socket: TcpStream, peer_addr: SocketAddr) {
        let endpoint = {
            let mut guard = lock(&self.inner);
            let Some(entry) = guard.sessions.get_mut(&id) else {
                drop(guard);
                warn!(session_id = id, "resume target vanished, treating as new");
                self.bind_new(id, socket, peer_addr);
                return;
            };
            if let Some(task) = entry.expiry_task.take() {
                task.abort();
            }
            entry.state = SessionState::Bound;
            entry.endpoint.clone()
        };
        endpoint.rebind(socket);
        info!(session_id = id, %peer_addr, "session resumed, socket migrated");
        self.watch_for_suspend(id, endpoint);
    }

    /// Spawn a task that waits for `endpoint` to disconnect (recoverable
    /// transport loss, not necessarily a final close) then moves its session
    /// into `Suspended` and starts the expiry timer (§4.5's
    /// disconnect-handling rule). A task from a prior bind/resume of the
    /// same session is implicitly superseded since each rebind resets
    /// `disconnected_signal` and installs a fresh watcher.
    fn watch_for_suspend(self: &Arc<Self>, id: u64, endpoint: Arc<Endpoint>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let mut disconnected = endpoint.disconnected_signal();
            if !*disconnected.borrow() {
                let _ = disconnected.changed().await;
            }
            manager.suspend(id);
        });
    }

    fn suspend(self: &Arc<Self>, id: u64) {
        let already_resumed = {
            let mut guard = lock(&self.inner);
            let Some(entry) = guard.sessions.get_mut(&id) else { return };
            if entry.state == SessionState::Suspended {
                true
            } else {
                entry.state = SessionState::Suspended;
                false
            }
        };
        if already_resumed {
            return;
        }
        warn!(session_id = id, "session suspended, starting expiry timer");
        let manager = self.clone();
        let expiry = self.suspend_expiry;
        let task = tokio::spawn(async move {
            tokio::time::sleep(expiry).await;
            manager.expire(id);
        });
        if let Some(entry) = lock(&self.inner).sessions.get_mut(&id) {
            entry.expiry_task = Some(task);
        }
    }

    fn expire(&self, id: u64) {
        let entry = {
            let mut guard = lock(&self.inner);
            guard.sessions.remove_entry(&id).filter(|(_, e)| e.state == SessionState::Suspended)
        };
        let Some((_, entry)) = entry else { return };
        warn!(session_id = id, "suspended session expired, tearing down");
        entry.endpoint.close(EndpointError::SessionExpired);
    }

    /// Number of sessions currently tracked (`Bound` + `Suspended`). Exposed
    /// for tests.
    #[must_use]
    pub fn session_count(&self) -> usize { lock(&self.inner).sessions.len() }

    /// Current state of `id`, if tracked. Exposed for tests.
    #[must_use]
    pub fn session_state(&self, id: u64) -> Option<SessionState> {
        lock(&self.inner).sessions.get(&id).map(|e| e.state)
    }
}
