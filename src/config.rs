//! Layered configuration for the endpoint, server, and dialer knobs named in
//! §6, loaded the way the teacher's `AppConfig` is: CLI flags over
//! environment variables (prefixed `DUORPC_`) over an optional TOML file,
//! via `figment`.

use std::net::SocketAddr;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Protocol magic exchanged at handshake (§6). Fixed, not configurable.
pub const PROTOCOL_MAGIC: [u8; 4] = *b"ROC1";

/// Default maximum frame length (1 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 1024;
/// Default base id for non-global object registrations.
pub const DEFAULT_BASE_OBJECT_ID: u32 = 100;
/// Default suspended-session expiry, in seconds.
pub const DEFAULT_SESSION_EXPIRY_SECS: u64 = 30;
/// Default client reconnect back-off, in seconds.
pub const DEFAULT_RECONNECT_BACKOFF_SECS: u64 = 5;

/// Knobs shared by both ends of a connection once it is established.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct EndpointConfig {
    /// Maximum accepted frame payload length, in bytes.
    pub max_frame_size: u32,
    /// First id handed out for non-global object registrations.
    pub base_object_id: u32,
}

/// CLI overlay for [`EndpointConfig`]: every field is `None` unless the user
/// actually passed the flag, so serialising this struct and merging it over
/// the env/file layers never clobbers them with a baked-in default.
#[derive(Parser, Serialize, Debug, Clone, Default)]
struct EndpointCliArgs {
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    max_frame_size: Option<u32>,
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    base_object_id: Option<u32>,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self { max_frame_size: DEFAULT_MAX_FRAME_SIZE, base_object_id: DEFAULT_BASE_OBJECT_ID }
    }
}

impl EndpointConfig {
    /// Load from CLI args (`argv[0]` style, first element ignored by clap),
    /// layered over `DUORPC_`-prefixed environment variables and an optional
    /// `duorpc.toml` in the current directory.
    ///
    /// # Errors
    /// Returns a [`figment::Error`] if any provider fails to parse or a field
    /// cannot be coerced to its declared type.
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, figment::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        load_layered::<Self, EndpointCliArgs>(args)
    }
}

/// Server-side knobs: bind address plus suspended-session expiry.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    /// Address to accept connections on.
    pub bind: String,
    /// Seconds a session may stay `Suspended` before it is torn down.
    pub session_expiry_secs: u64,
    /// Endpoint knobs shared with the client side.
    pub endpoint: EndpointConfig,
}

/// CLI overlay for [`ServerConfig`], see [`EndpointCliArgs`].
#[derive(Parser, Serialize, Debug, Clone, Default)]
struct ServerCliArgs {
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    bind: Option<String>,
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    session_expiry_secs: Option<u64>,
    #[command(flatten)]
    endpoint: EndpointCliArgs,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7733".to_owned(),
            session_expiry_secs: DEFAULT_SESSION_EXPIRY_SECS,
            endpoint: EndpointConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Parse `bind` into a [`SocketAddr`].
    ///
    /// # Errors
    /// Returns [`std::net::AddrParseError`] if `bind` is malformed.
    pub fn bind_addr(&self) -> Result<SocketAddr, std::net::AddrParseError> { self.bind.parse() }

    /// Load from CLI args layered over environment and an optional file, as
    /// [`EndpointConfig::load_from_iter`].
    ///
    /// # Errors
    /// Returns a [`figment::Error`] if any provider fails to parse.
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, figment::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        load_layered::<Self, ServerCliArgs>(args)
    }
}

/// Client-side knobs: connect address, remembered session id, and the
/// reconnect back-off.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DialerConfig {
    /// Address to connect to.
    pub connect: String,
    /// Seconds to wait before a reconnect attempt after a transport error.
    pub reconnect_backoff_secs: u64,
    /// Endpoint knobs shared with the server side.
    pub endpoint: EndpointConfig,
}

/// CLI overlay for [`DialerConfig`], see [`EndpointCliArgs`].
#[derive(Parser, Serialize, Debug, Clone, Default)]
struct DialerCliArgs {
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    connect: Option<String>,
    #[arg(long)]
    #[serde(skip_serializing_if = "Option::is_none")]
    reconnect_backoff_secs: Option<u64>,
    #[command(flatten)]
    endpoint: EndpointCliArgs,
}

impl Default for DialerConfig {
    fn default() -> Self {
        Self {
            connect: "127.0.0.1:7733".to_owned(),
            reconnect_backoff_secs: DEFAULT_RECONNECT_BACKOFF_SECS,
            endpoint: EndpointConfig::default(),
        }
    }
}

impl DialerConfig {
    /// Load from CLI args layered over environment and an optional file, as
    /// [`EndpointConfig::load_from_iter`].
    ///
    /// # Errors
    /// Returns a [`figment::Error`] if any provider fails to parse.
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, figment::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        load_layered::<Self, DialerCliArgs>(args)
    }
}

/// Layer `Target`'s baked-in defaults, an optional `duorpc.toml`, the
/// `DUORPC_`-prefixed environment, and finally only the CLI flags the user
/// actually supplied (`Cli`'s `None` fields are omitted from serialisation
/// and so never override a lower layer), matching the precedence in §10.3.
fn load_layered<Target, Cli>(
    args: impl IntoIterator<Item = impl Into<std::ffi::OsString> + Clone>,
) -> Result<Target, figment::Error>
where
    Target: Serialize + for<'de> Deserialize<'de> + Default,
    Cli: clap::Parser + Serialize,
{
    let cli = Cli::parse_from(args);
    Figment::from(Serialized::defaults(Target::default()))
        .merge(Toml::file("duorpc.toml"))
        .merge(Env::prefixed("DUORPC_"))
        .merge(Serialized::defaults(cli))
        .extract()
}

#[cfg(test)]
mod tests {
    use figment::Jail;
    use rstest::rstest;

    use super::*;

    #[rstest]
    fn env_overrides_default() {
        Jail::expect_with(|j| {
            j.set_env("DUORPC_MAX_FRAME_SIZE", "4096");
            let cfg = EndpointConfig::load_from_iter(["duorpc"]).expect("load");
            assert_eq!(cfg.max_frame_size, 4096);
            Ok(())
        });
    }

    #[rstest]
    fn cli_overrides_env() {
        Jail::expect_with(|j| {
            j.set_env("DUORPC_BIND", "0.0.0.0:9000");
            let cfg = ServerConfig::load_from_iter(["duorpc", "--bind", "10.0.0.1:1111"]).expect("load");
            assert_eq!(cfg.bind, "10.0.0.1:1111");
            Ok(())
        });
    }

    #[rstest]
    fn loads_from_dotfile() {
        Jail::expect_with(|j| {
            j.create_file("duorpc.toml", "connect = \"1.2.3.4:1111\"\n")?;
            let cfg = DialerConfig::load_from_iter(["duorpc"]).expect("load");
            assert_eq!(cfg.connect, "1.2.3.4:1111");
            Ok(())
        });
    }

    #[test]
    fn defaults_apply_with_no_overrides() {
        let cfg = EndpointConfig::default();
        assert_eq!(cfg.max_frame_size, DEFAULT_MAX_FRAME_SIZE);
        assert_eq!(cfg.base_object_id, DEFAULT_BASE_OBJECT_ID);
    }
}
