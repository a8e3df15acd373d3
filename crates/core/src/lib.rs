//! tamperveil Core - Integrity-Bypass Patch Engine
//!
//! Once injected into the target process, the engine locates the
//! self-integrity checks by byte pattern, neutralizes them with mid-hooks,
//! and conceals the modifications from the target's own introspection:
//! protection queries answer with pre-patch attributes, exception-handler
//! registration is gated, and a watcher keeps the tamper heartbeat alive.
//!
//! # Re-exports
//!
//! This crate re-exports the SDK and engine crates for convenience:
//! - [`sdk`] - Target engine memory layout definitions
//! - [`engine`] - Host binary introspection and signature scanning

// Re-export SDK and engine crates
pub use tamperveil_engine as engine;
pub use tamperveil_sdk as sdk;

pub mod config;
pub mod context;
pub mod error;
pub mod exit;
pub mod hooks;
pub mod pak;
pub mod patches;
pub mod protect;
pub mod veh;
pub mod watcher;

// Re-export commonly used items
pub use config::{ConfigError, ConfigResult, EngineConfig};
pub use context::{Engine, InstallReport};
pub use error::EngineError;
pub use hooks::{
    CpuContext, DetourHandler, HookBackend, HookError, HookKey, HookKind, HookState, HookTable,
    MidHandler,
};
pub use pak::{PakOverlay, BASE_PAK_NAME, PAK_MODS_DIR_NAME};
pub use patches::{standard_patches, IntegrityPatch, Neutralization};
pub use protect::{ProtectVerdict, Protection, RegionTable};
pub use veh::{VehGate, VehVerdict};
pub use watcher::{IndicatorSource, Watcher, WatcherHandle};

use std::sync::Arc;

/// Build the engine against the live process: resolved host module,
/// on-disk (or built-in) signature table, platform hook primitive.
///
/// A missing collaborator surfaces as a single soft
/// [`EngineError::Initialization`]; the host is never aborted.
pub fn bootstrap() -> Result<Arc<Engine>, EngineError> {
    let config = EngineConfig::load().unwrap_or_else(|e| {
        tracing::warn!("Config unavailable ({}); using defaults", e);
        EngineConfig::default()
    });

    let module = engine::host_module()
        .map_err(|e| EngineError::Initialization(format!("host module unavailable: {}", e)))?;

    let db = signature_db();
    let scanner = Arc::new(engine::ModuleScanner::new(module, db));

    Ok(Engine::new(config, hooks::default_backend(), scanner))
}

/// Deployed signature table when present, built-in set otherwise
fn signature_db() -> engine::SignatureDb {
    if let Ok(dir) = config::engine_dir() {
        let path = dir.join("signatures.json");
        if path.exists() {
            match engine::SignatureDb::load_from_file(&path) {
                Ok(db) => return db,
                Err(e) => tracing::warn!("Ignoring {:?}: {}", path, e),
            }
        }
    }
    engine::SignatureDb::builtin()
}
