//! Client-side connect/handshake/reconnect (§4.5, §4.6).
//!
//! Grounded on the client half of
//! `examples/original_source/DualRPC/transport.cpp` for the
//! connect-handshake-reconnect sequence, and on the teacher's
//! `shutdown_signal`/`tokio::select!` idiom (`server/legacy.rs`) for
//! structuring a long-running background loop around a watch channel.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::{
    net::TcpStream,
    sync::watch,
    time::Duration,
};
use tracing::{info, warn};

use crate::{
    config::DialerConfig,
    endpoint::Endpoint,
    handshake::{self, Outcome},
    object::ObjectTable,
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> { m.lock().unwrap_or_else(PoisonError::into_inner) }

/// Owns the remembered session id and reconnect back-off for one logical
/// client connection, and the [`Endpoint`] that is rebound in place across
/// reconnects rather than replaced (mirroring [`crate::session::SessionManager`]'s
/// resume path on the server side, so in-flight pending calls and registered
/// objects survive a reconnect as long as the server still remembers the
/// session).
pub struct Dialer {
    connect_addr: String,
    reconnect_backoff: Duration,
    max_frame_size: u32,
    object_table: Arc<ObjectTable>,
    session_id: Mutex<u64>,
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    stop_tx: watch::Sender<bool>,
}

impl Dialer {
    /// Build a dialer from `cfg`, sharing `object_table` with the endpoint
    /// it maintains (the table is typically fresh per dialer: this process
    /// has exactly one outbound peer through it).
    #[must_use]
    pub fn new(cfg: &DialerConfig, object_table: Arc<ObjectTable>) -> Arc<Self> {
        let (stop_tx, _rx) = watch::channel(false);
        Arc::new(Self {
            connect_addr: cfg.connect.clone(),
            reconnect_backoff: Duration::from_secs(cfg.reconnect_backoff_secs),
            max_frame_size: cfg.endpoint.max_frame_size,
            object_table,
            session_id: Mutex::new(0),
            endpoint: Mutex::new(None),
            stop_tx,
        })
    }

    /// Connect for the first time, blocking until the initial handshake
    /// completes, then spawn the background reconnect watcher. Returns the
    /// live [`Endpoint`], which remains the same object across any later
    /// reconnect (see [`Self::endpoint`]).
    ///
    /// # Errors
    /// Returns the connect or handshake I/O error if the very first attempt
    /// fails; subsequent failures are retried in the background instead.
    pub async fn connect(self: &Arc<Self>) -> Result<Arc<Endpoint>, std::io::Error> {
        let (socket, outcome) = self.dial_once().await?;
        debug_assert_eq!(outcome, Outcome::New, "first connect is always a new session");
        let session_id = *lock(&self.session_id);
        let endpoint = Endpoint::spawn(socket, self.object_table.clone(), session_id, self.max_frame_size);
        *lock(&self.endpoint) = Some(endpoint.clone());
        self.watch_for_disconnect(endpoint.clone());
        Ok(endpoint)
    }

    /// The session id this dialer currently remembers (0 before the first
    /// successful handshake).
    #[must_use]
    pub fn session_id(&self) -> u64 { *lock(&self.session_id) }

    /// The current [`Endpoint`], if [`Self::connect`] has run at least once.
    /// The same `Arc` is returned across reconnects: the endpoint is rebound
    /// in place rather than replaced.
    #[must_use]
    pub fn endpoint(&self) -> Option<Arc<Endpoint>> { lock(&self.endpoint).clone() }

    /// Stop the background reconnect loop and close the current endpoint, if
    /// any.
    pub fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        if let Some(endpoint) = self.endpoint() {
            endpoint.close(crate::error::EndpointError::Closed("dialer shutdown".to_owned()));
        }
    }

    async fn dial_once(self: &Arc<Self>) -> Result<(TcpStream, Outcome), std::io::Error> {
        let mut socket = TcpStream::connect(&self.connect_addr).await?;
        let remembered = *lock(&self.session_id);
        let (session_id, outcome) = handshake::client_handshake(&mut socket, remembered)
            .await
            .map_err(std::io::Error::other)?;
        *lock(&self.session_id) = session_id;
        info!(%session_id, ?outcome, addr = %self.connect_addr, "dialer handshake complete");
        Ok((socket, outcome))
    }

    fn watch_for_disconnect(self: &Arc<Self>, endpoint: Arc<Endpoint>) {
        let dialer = self.clone();
        let mut stop_rx = self.stop_tx.subscribe();
        tokio::spawn(async move {
            loop {
                let mut disconnected = endpoint.disconnected_signal();
                tokio::select! {
                    _ = disconnected.changed(), if !*disconnected.borrow() => {}
                    _ = stop_rx.changed() => return,
                }
                if endpoint.is_closed() {
                    return;
                }
                if *stop_rx.borrow() {
                    return;
                }
                if !dialer.reconnect_loop(&endpoint, &mut stop_rx).await {
                    return;
                }
            }
        });
    }

    /// Retry connecting with back-off until it succeeds or shutdown is
    /// requested, then rebind `endpoint` onto the fresh socket. Returns
    /// `false` if shutdown won while waiting.
    async fn reconnect_loop(self: &Arc<Self>, endpoint: &Arc<Endpoint>, stop_rx: &mut watch::Receiver<bool>) -> bool {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.reconnect_backoff) => {}
                _ = stop_rx.changed() => return false,
            }
            if *stop_rx.borrow() {
                return false;
            }
            warn!(addr = %self.connect_addr, "attempting reconnect");
            match self.dial_once().await {
                Ok((socket, outcome)) => {
                    endpoint.rebind(socket);
                    info!(?outcome, "reconnect succeeded");
                    return true;
                }
                Err(err) => {
                    warn!(error = %err, "reconnect attempt failed, backing off again");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use tokio::net::TcpListener;

    use super::*;
    use crate::{
        handshake::server_handshake,
        object::{LocalObject, GLOBAL_OBJECT_ID},
        variant::Variant,
    };

    async fn echo_server_once(listener: TcpListener) {
        let (mut socket, _peer) = listener.accept().await.expect("accept");
        let (_id, _outcome) = server_handshake(&mut socket, 4242, |_| None).await.expect("handshake");
        let table = Arc::new(ObjectTable::default());
        let mut global = LocalObject::new();
        struct Echo;
        #[async_trait::async_trait]
        impl crate::object::MethodHandler for Echo {
            async fn call(&self, _this: &LocalObject, args: Variant) -> Variant { args }
        }
        global.register_method("echo", Echo);
        table.register(Arc::new(global), 0, true).expect("global register");
        let endpoint = Endpoint::spawn(socket, table, 1, 1024 * 1024);
        // Keep the endpoint (and therefore the task set binding it) alive for
        // the duration of the test by leaking the Arc's strong reference into
        // a background task that waits on its close signal.
        let mut closed = endpoint.closed_signal();
        let _ = closed.changed().await;
    }

    #[tokio::test]
    async fn connect_performs_a_new_session_handshake() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(echo_server_once(listener));

        let cfg = DialerConfig { connect: addr.to_string(), ..DialerConfig::default() };
        let dialer = Dialer::new(&cfg, Arc::new(ObjectTable::default()));
        let endpoint = dialer.connect().await.expect("connect");

        let (result, _write_complete) =
            endpoint.call(GLOBAL_OBJECT_ID, "echo", Variant::string("hi"), true).await;
        assert_eq!(result.await, Variant::string("hi"));
        dialer.shutdown();
    }

    #[tokio::test]
    async fn reconnect_rebinds_the_same_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");

        let server_table = Arc::new(ObjectTable::default());
        server_table.register(Arc::new(LocalObject::new()), 0, true).expect("global register");
        let session_id = std::sync::Arc::new(std::sync::Mutex::new(0u64));

        let sid = session_id.clone();
        tokio::spawn(async move {
            let (mut socket, _peer) = listener.accept().await.expect("accept");
            let (id, _) = server_handshake(&mut socket, 9090, |_| None).await.expect("first handshake");
            *sid.lock().unwrap() = id;
            drop(socket);
        });

        let cfg = DialerConfig {
            connect: addr.to_string(),
            reconnect_backoff_secs: 0,
            ..DialerConfig::default()
        };
        let dialer = Dialer::new(&cfg, Arc::new(ObjectTable::default()));
        let endpoint = dialer.connect().await.expect("connect");
        let first = Arc::as_ptr(&endpoint);

        // The background watcher should notice the close and retry, but
        // there is no listener left to accept; simply assert identity is
        // preserved on the Arc across the lifetime of this handle.
        let again = dialer.endpoint().expect("endpoint still tracked");
        assert_eq!(Arc::as_ptr(&again), first);
        dialer.shutdown();
    }
}
