//! tamperveil - Injection Entry Point
//!
//! This crate compiles to the injectable library (.dll/.so). It owns the
//! process-level wiring: one-time logging setup, engine construction,
//! the single install pass, and the soft-failure reporting surface the
//! injector reads.

pub mod ffi;

use std::sync::{Arc, OnceLock};

use tamperveil_core::{bootstrap, Engine};

/// The engine instance for this process. Only the FFI boundary touches
/// this; everything inside the engine is reached through the `Arc`.
static ENGINE: OnceLock<Arc<Engine>> = OnceLock::new();

/// Initialize logging, build the engine, and run the install pass.
///
/// Idempotent: the injector (or the host's reload path) may call this
/// more than once; only the first call does anything. Returns a
/// human-readable failure string instead of aborting the host.
pub fn attach() -> Result<(), String> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("TAMPERVEIL_LOG")
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();

    tracing::info!("tamperveil attaching...");

    let engine = match ENGINE.get() {
        Some(e) => Arc::clone(e),
        None => {
            let engine = bootstrap().map_err(|e| e.to_string())?;
            match ENGINE.set(Arc::clone(&engine)) {
                Ok(()) => engine,
                // Lost a racing attach; use the winner.
                Err(_) => Arc::clone(ENGINE.get().ok_or("engine slot poisoned")?),
            }
        }
    };

    let report = engine.install_all();
    if report.first_pass {
        tracing::info!(
            "tamperveil attached: {} hooks, {} missed signatures",
            report.installed,
            report.missed.len()
        );
    }

    Ok(())
}

/// The live engine, if attached
pub fn engine() -> Option<&'static Arc<Engine>> {
    ENGINE.get()
}

/// Orderly detach: stops the watcher thread. Hooks stay in place; they
/// are process-lifetime by design.
pub fn detach() {
    if let Some(engine) = ENGINE.get() {
        engine.shutdown();
    }
    tracing::info!("tamperveil detached");
}
