//! Binary entry point for the demonstration echo client.
//!
//! Connects via [`duorpc::dialer::Dialer`], calls `echo`, then exercises the
//! streamed `read` method by registering a local writer object and counting
//! the bytes it receives.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use anyhow::{Context, Result};
use async_trait::async_trait;
use duorpc::{
    config::DialerConfig,
    dialer::Dialer,
    object::{map, LocalObject, MethodHandler, ObjectTable, GLOBAL_OBJECT_ID},
    variant::Variant,
};
use tracing::info;

struct CollectChunks {
    total: Arc<AtomicUsize>,
    done: Arc<tokio::sync::Notify>,
}

#[async_trait]
impl MethodHandler for CollectChunks {
    async fn call(&self, _this: &LocalObject, args: Variant) -> Variant {
        let Variant::String(chunk) = args else {
            return Variant::exception("writer expects a byte-string chunk");
        };
        if chunk.is_empty() {
            self.done.notify_one();
        } else {
            self.total.fetch_add(chunk.len(), Ordering::SeqCst);
        }
        Variant::Null
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cfg = DialerConfig::load_from_iter(std::env::args()).context("loading dialer configuration")?;
    let object_table = Arc::new(ObjectTable::new(cfg.endpoint.base_object_id));
    let dialer = Dialer::new(&cfg, object_table.clone());
    let endpoint = dialer.connect().await.context("connecting to server")?;

    let global = endpoint.global_object();
    let echoed = global.call("echo", map([("name", Variant::string("A"))])).await;
    info!(?echoed, "echo round trip complete");

    let total = Arc::new(AtomicUsize::new(0));
    let done = Arc::new(tokio::sync::Notify::new());
    let mut writer = LocalObject::new();
    writer.register_method("", CollectChunks { total: total.clone(), done: done.clone() });
    let writer_id = object_table
        .register(Arc::new(writer), 0, false)
        .context("registering local writer object")?;
    let writer_handle = object_table.get(writer_id).context("looking up just-registered writer")?;

    const SIZE: i64 = 256 * 1024;
    let (result, _write_complete) = endpoint
        .call(
            GLOBAL_OBJECT_ID,
            "read",
            map([("size", Variant::Int(SIZE)), ("writer", Variant::Object(writer_handle))]),
            true,
        )
        .await;
    result.await;
    done.notified().await;
    info!(requested = SIZE, received = total.load(Ordering::SeqCst), "streamed read complete");

    dialer.shutdown();
    Ok(())
}
