//! Engine error taxonomy
//!
//! Failures are contained at the smallest granularity that makes sense:
//! a scan miss or refused hook disables one patch, a bad overlay filename
//! skips one file, and only a missing required collaborator surfaces as a
//! (still soft) initialization failure. The engine never terminates the
//! host process on its own account, and nothing is retried.

use crate::hooks::HookError;

/// Error type for engine installation and patch operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Signature not found; the dependent patch stays uninstalled
    #[error("Signature '{0}' not found; dependent patch disabled")]
    ScanMiss(String),

    /// The hook primitive refused installation for one patch
    #[error("Hook install failed for '{name}': {source}")]
    HookInstall {
        name: String,
        #[source]
        source: HookError,
    },

    /// Overlay file name did not match the patch naming pattern
    #[error("Overlay file name not recognized: {0}")]
    PathParse(String),

    /// A required collaborator was unavailable during initialization
    #[error("Initialization failed: {0}")]
    Initialization(String),
}
