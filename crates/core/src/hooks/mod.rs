//! Hook lifecycle
//!
//! The engine installs two kinds of interception:
//! - Function detours (protection shim, VEH gate, exit gate)
//! - Mid-function context hooks (the targeted integrity patches)
//!
//! Hooks are installed in exactly one pass per process lifetime and are
//! never uninstalled; see [`crate::context::Engine::install_all`].

pub mod backend;
pub mod context;
pub mod records;

#[cfg(windows)]
pub mod os;

pub use backend::{DetourHandler, HookBackend, HookError, InstalledHook, MidHandler, NullBackend};
pub use context::{CpuContext, SLOT_NAMES};
pub use records::{HookKey, HookKind, HookState, HookTable};

#[cfg(windows)]
pub use os::IlhookBackend;

/// The hook primitive for the current platform
pub fn default_backend() -> std::sync::Arc<dyn HookBackend> {
    #[cfg(windows)]
    {
        std::sync::Arc::new(IlhookBackend)
    }
    #[cfg(not(windows))]
    {
        std::sync::Arc::new(NullBackend)
    }
}
