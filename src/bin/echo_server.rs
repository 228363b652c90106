//! Binary entry point for the demonstration echo server.
//!
//! Registers the global object's `echo` and `read` methods and delegates the
//! accept loop to [`duorpc::session::SessionManager`]; this binary carries no
//! protocol logic of its own, matching the teacher's thin
//! `mxd_wireframe_server` delegating into `mxd::server::wireframe::run`.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use duorpc::{
    config::ServerConfig,
    object::{LocalObject, MethodHandler, ObjectTable},
    session::SessionManager,
    variant::Variant,
};
use tokio::time::Duration;
use tracing::info;

/// Returns its argument unchanged; exercises scenario S1.
struct Echo;

#[async_trait]
impl MethodHandler for Echo {
    async fn call(&self, _this: &LocalObject, args: Variant) -> Variant { args }
}

/// `{size, writer}` → streams `size` bytes to `writer` in ~64 KiB chunks,
/// terminated by an empty chunk, then returns `Null`; exercises scenario S4.
///
/// `writer` is called via the empty-string method name, the convention this
/// crate uses for objects that expose a single anonymous call operation
/// (§3's "exposes one call operation").
struct StreamRead;

const CHUNK_SIZE: usize = 64 * 1024;

#[async_trait]
impl MethodHandler for StreamRead {
    async fn call(&self, _this: &LocalObject, args: Variant) -> Variant {
        let Variant::Map(map) = args else {
            return Variant::exception("read expects a map of {size, writer}");
        };
        let Some(Variant::Int(size)) = map.get("size") else {
            return Variant::exception("read requires an integer 'size'");
        };
        let Some(Variant::Object(writer)) = map.get("writer") else {
            return Variant::exception("read requires an object 'writer'");
        };
        let mut remaining = (*size).max(0) as usize;
        while remaining > 0 {
            let chunk_len = remaining.min(CHUNK_SIZE);
            let chunk = vec![b'x'; chunk_len];
            if let Err(err) = writer.dispatch(0, "", Variant::String(chunk)).await {
                return Variant::exception(err.to_string());
            }
            remaining -= chunk_len;
        }
        if let Err(err) = writer.dispatch(0, "", Variant::String(Vec::new())).await {
            return Variant::exception(err.to_string());
        }
        Variant::Null
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cfg = ServerConfig::load_from_iter(std::env::args()).context("loading server configuration")?;
    let bind = cfg.bind_addr().context("parsing bind address")?;

    let object_table = Arc::new(ObjectTable::new(cfg.endpoint.base_object_id));
    let mut global = LocalObject::new();
    global.register_method("echo", Echo);
    global.register_method("read", StreamRead);
    object_table.register(Arc::new(global), 0, true).context("registering global object")?;

    let manager = SessionManager::new(object_table, cfg.endpoint.max_frame_size, Duration::from_secs(cfg.session_expiry_secs));
    info!(%bind, "duorpc-echo-server starting");
    manager.serve_addr(bind).await.context("accept loop failed")
}
