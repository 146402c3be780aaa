//! Abstraction over the async runtime driving a `DhtNode`.
//!
//! The crate only ships a `tokio` backend (the teacher supports
//! swapping in `async-std`; the DHT core doesn't need that degree of
//! freedom, since the transport itself is supplied by the embedder —
//! see `rpc::stream`). Kept as its own module regardless, matching the
//! teacher's layout, so a second backend can be added the same way the
//! teacher would.

#[cfg(feature = "async_runtime_tokio")]
mod tokio;

#[cfg(feature = "async_runtime_tokio")]
pub use self::tokio::*;

use std::sync::OnceLock;

static RUNTIME: OnceLock<Runtime> = OnceLock::new();

/// Initializes the global runtime used by [`spawn`] and [`block_on`].
///
/// A no-op if already initialized (mirrors the teacher's idempotent
/// `bft::init`, minus the `unsafe` global-state dance the teacher used
/// for its signature/hash backends, which this crate has no need for).
pub fn init_global(num_threads: usize) -> Result<(), ()> {
    if RUNTIME.get().is_some() {
        return Ok(());
    }
    let rt = init(num_threads)?;
    let _ = RUNTIME.set(rt);
    Ok(())
}

/// Runs `fut` to completion on the global runtime.
pub fn run<F: std::future::Future>(fut: F) -> F::Output {
    match RUNTIME.get() {
        Some(rt) => rt.block_on(fut),
        None => {
            let rt = init(num_cpus_fallback()).expect("failed to start runtime");
            let out = rt.block_on(fut);
            let _ = RUNTIME.set(rt);
            out
        }
    }
}

fn num_cpus_fallback() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
