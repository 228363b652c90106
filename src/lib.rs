//! `duorpc`: a symmetric, connection-oriented object-capability RPC
//! transport.
//!
//! Either endpoint may expose objects ([`object::LocalObject`]) and invoke
//! methods on objects exposed by the peer ([`object::RemoteProxy`]). Calls
//! carry a dynamic value tree ([`variant::Variant`]); object handles
//! embedded in arguments or results are rewritten to stable wire ids and
//! resolved back into live proxies on the other side, producing a
//! distributed object graph whose lifetime is tied to the connection
//! ([`object::ObjectTable`]). A connection survives brief drops via session
//! resumption ([`session::SessionManager`] on the server side,
//! [`dialer::Dialer`] on the client side), and supports streamed/chunked
//! responses via [`future::Future`], the transport's single deferred-result
//! primitive.
//!
//! See [`endpoint::Endpoint`] for the per-connection state machine that ties
//! framing, dispatch, and the pause/resume discipline together.

pub mod config;
pub mod dialer;
pub mod endpoint;
pub mod error;
pub mod frame;
pub mod future;
pub mod handshake;
pub mod object;
pub mod session;
pub mod variant;

pub use config::{DialerConfig, EndpointConfig, ServerConfig};
pub use endpoint::Endpoint;
pub use error::{EndpointError, FrameError, HandshakeError, ObjectError, VariantError};
pub use future::Future;
pub use object::{LocalObject, ObjectTable, RemoteProxy};
pub use session::SessionManager;
pub use variant::{Variant, VariantMap};
