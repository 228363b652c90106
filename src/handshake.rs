//! The four/five-step handshake of §4.5: protocol magic, session id
//! exchange, and the new-vs-resumed branch.
//!
//! Modelled on the teacher's `wireframe::handshake` preamble hooks (success
//! reply, typed failure), restructured as a plain async function pair since
//! this protocol's handshake is direction-specific rather than a single
//! symmetric preamble.

use rand::RngCore;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::{config::PROTOCOL_MAGIC, error::HandshakeError};

/// Outcome of a handshake from either side's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// A brand new session was established.
    New,
    /// An existing suspended session was resumed.
    Resumed,
}

/// Generate a fresh, nonzero 64-bit session id.
///
/// The original source uses a process-global Mersenne Twister; per §9 this
/// is injected instead so callers can seed deterministically in tests.
pub fn fresh_session_id<R: RngCore>(rng: &mut R) -> u64 {
    loop {
        let id = rng.next_u64();
        if id != 0 {
            return id;
        }
    }
}

/// Server side of the handshake (§4.5 steps 1-5).
///
/// `lookup_suspended` is consulted with the client's remembered session id;
/// if it returns `Some`, that id is echoed back (resumption/migration is the
/// caller's responsibility once this returns). Otherwise `fresh_id` is sent
/// as a new session.
///
/// # Errors
/// Returns [`HandshakeError::Io`] on any read/write failure.
pub async fn server_handshake<S, F>(
    stream: &mut S,
    fresh_id: u64,
    lookup_suspended: F,
) -> Result<(u64, Outcome), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: FnOnce(u64) -> Option<u64>,
{
    stream.write_all(&PROTOCOL_MAGIC).await?;

    let mut client_id_buf = [0u8; 8];
    stream.read_exact(&mut client_id_buf).await?;
    let client_session_id = u64::from_le_bytes(client_id_buf);

    let (chosen, outcome) = if client_session_id == 0 {
        (fresh_id, Outcome::New)
    } else {
        match lookup_suspended(client_session_id) {
            Some(resumed_id) => (resumed_id, Outcome::Resumed),
            None => (fresh_id, Outcome::New),
        }
    };

    stream.write_all(&chosen.to_le_bytes()).await?;
    info!(session_id = chosen, resumed = matches!(outcome, Outcome::Resumed), "server handshake complete");
    Ok((chosen, outcome))
}

/// Client side of the handshake (§4.5 steps 1-6).
///
/// `remembered_session_id` is `0` on a first connect, or the id previously
/// assigned by the server on a reconnect attempt.
///
/// # Errors
/// Returns [`HandshakeError::BadMagic`] if the server's magic does not match
/// this build's, or [`HandshakeError::Io`] on any read/write failure.
pub async fn client_handshake<S>(
    stream: &mut S,
    remembered_session_id: u64,
) -> Result<(u64, Outcome), HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut magic = [0u8; 4];
    stream.read_exact(&mut magic).await?;
    if magic != PROTOCOL_MAGIC {
        return Err(HandshakeError::BadMagic { expected: PROTOCOL_MAGIC, got: magic });
    }

    stream.write_all(&remembered_session_id.to_le_bytes()).await?;

    let mut server_id_buf = [0u8; 8];
    stream.read_exact(&mut server_id_buf).await?;
    let server_session_id = u64::from_le_bytes(server_id_buf);

    let outcome = if remembered_session_id != 0 && server_session_id == remembered_session_id {
        Outcome::Resumed
    } else {
        Outcome::New
    };
    debug!(session_id = server_session_id, ?outcome, "client handshake complete");
    Ok((server_session_id, outcome))
}

#[cfg(test)]
mod tests {
    use tokio::io::duplex;

    use super::*;

    #[tokio::test]
    async fn first_connect_establishes_a_new_session() {
        let (mut server_end, mut client_end) = duplex(64);
        let server = tokio::spawn(async move {
            server_handshake(&mut server_end, 42, |_| None).await.expect("server side")
        });
        let (client_session, client_outcome) =
            client_handshake(&mut client_end, 0).await.expect("client side");
        let (server_session, server_outcome) = server.await.expect("join");

        assert_eq!(client_session, 42);
        assert_eq!(server_session, 42);
        assert_eq!(client_outcome, Outcome::New);
        assert_eq!(server_outcome, Outcome::New);
    }

    #[tokio::test]
    async fn known_suspended_session_is_resumed() {
        let (mut server_end, mut client_end) = duplex(64);
        let server =
            tokio::spawn(
                async move { server_handshake(&mut server_end, 99, |id| (id == 7).then_some(7)).await },
            );
        let (client_session, client_outcome) =
            client_handshake(&mut client_end, 7).await.expect("client side");
        let (server_session, server_outcome) = server.await.expect("join").expect("server side");

        assert_eq!(client_session, 7);
        assert_eq!(server_session, 7);
        assert_eq!(client_outcome, Outcome::Resumed);
        assert_eq!(server_outcome, Outcome::Resumed);
    }

    #[tokio::test]
    async fn unknown_remembered_session_falls_back_to_new() {
        let (mut server_end, mut client_end) = duplex(64);
        let server =
            tokio::spawn(async move { server_handshake(&mut server_end, 55, |_| None).await });
        let (client_session, client_outcome) =
            client_handshake(&mut client_end, 7).await.expect("client side");
        let (server_session, server_outcome) = server.await.expect("join").expect("server side");

        assert_eq!(client_session, 55);
        assert_eq!(server_session, 55);
        assert_eq!(client_outcome, Outcome::New);
        assert_eq!(server_outcome, Outcome::New);
    }

    #[tokio::test]
    async fn bad_magic_is_rejected() {
        let (mut fake_server, mut client_end) = duplex(64);
        tokio::spawn(async move {
            let _ = fake_server.write_all(b"XXXX").await;
        });
        let err = client_handshake(&mut client_end, 0).await.expect_err("must reject bad magic");
        assert!(matches!(err, HandshakeError::BadMagic { .. }));
    }

    #[test]
    fn fresh_session_id_is_never_zero() {
        struct ZeroThenOne(u32);
        impl RngCore for ZeroThenOne {
            fn next_u32(&mut self) -> u32 { unimplemented!() }
            fn next_u64(&mut self) -> u64 {
                self.0 += 1;
                u64::from(self.0 - 1)
            }
            fn fill_bytes(&mut self, _dest: &mut [u8]) { unimplemented!() }
            fn try_fill_bytes(&mut self, _dest: &mut [u8]) -> Result<(), rand::Error> { unimplemented!() }
        }
        let mut rng = ZeroThenOne(0);
        assert_eq!(fresh_session_id(&mut rng), 1);
    }
}
