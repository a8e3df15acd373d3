//! Hook record table
//!
//! One record per interception point, owned by the engine context for the
//! process's life. There is no uninstall path: disabling a patch at
//! runtime happens inside its hook body, never by removing the hook.

use parking_lot::RwLock;
use slotmap::{new_key_type, SlotMap};

use super::backend::{DetourHandler, HookBackend, HookError, InstalledHook, MidHandler};

new_key_type! {
    /// Handle for an installed hook record
    pub struct HookKey;
}

/// What kind of interception a record owns
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookKind {
    /// Full replacement of a function entry
    Detour,
    /// Context hook in the middle of a routine
    Mid,
}

/// Installation state of a record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookState {
    Installed,
    Failed,
}

/// Storage for one interception point
struct HookRecord {
    /// Resolved target address (never a static offset)
    target: usize,

    kind: HookKind,
    state: HookState,

    /// Owned backend handle; `None` for failed installs
    hook: Option<Box<dyn InstalledHook>>,

    /// Debug name
    name: String,
}

/// Table of every hook the engine owns
#[derive(Default)]
pub struct HookTable {
    records: RwLock<SlotMap<HookKey, HookRecord>>,
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a mid-function hook and record it.
    ///
    /// A target that already has an installed record is left alone: the
    /// existing key is returned and nothing is re-installed.
    ///
    /// # Safety
    /// See [`HookBackend::install_mid`].
    pub unsafe fn install_mid(
        &self,
        backend: &dyn HookBackend,
        name: &str,
        target: usize,
        handler: MidHandler,
    ) -> Result<HookKey, HookError> {
        if let Some(existing) = self.installed_at(target) {
            tracing::warn!(
                "Target {:#x} already hooked; keeping existing record over '{}'",
                target,
                name
            );
            return Ok(existing);
        }

        match backend.install_mid(name, target, handler) {
            Ok(hook) => Ok(self.record(name, target, HookKind::Mid, Some(hook))),
            Err(e) => {
                self.record(name, target, HookKind::Mid, None);
                Err(e)
            }
        }
    }

    /// Install a function detour and record it.
    ///
    /// # Safety
    /// See [`HookBackend::install_detour`].
    pub unsafe fn install_detour(
        &self,
        backend: &dyn HookBackend,
        name: &str,
        target: usize,
        handler: DetourHandler,
    ) -> Result<HookKey, HookError> {
        if let Some(existing) = self.installed_at(target) {
            tracing::warn!(
                "Target {:#x} already hooked; keeping existing record over '{}'",
                target,
                name
            );
            return Ok(existing);
        }

        match backend.install_detour(name, target, handler) {
            Ok(hook) => Ok(self.record(name, target, HookKind::Detour, Some(hook))),
            Err(e) => {
                self.record(name, target, HookKind::Detour, None);
                Err(e)
            }
        }
    }

    fn record(
        &self,
        name: &str,
        target: usize,
        kind: HookKind,
        hook: Option<Box<dyn InstalledHook>>,
    ) -> HookKey {
        let state = if hook.is_some() {
            tracing::info!("Installed {:?} hook '{}' at {:#x}", kind, name, target);
            HookState::Installed
        } else {
            HookState::Failed
        };
        self.records.write().insert(HookRecord {
            target,
            kind,
            state,
            hook,
            name: name.to_string(),
        })
    }

    /// Key of the installed record covering `target`, if any
    pub fn installed_at(&self, target: usize) -> Option<HookKey> {
        self.records
            .read()
            .iter()
            .find(|(_, r)| r.target == target && r.state == HookState::Installed)
            .map(|(k, _)| k)
    }

    /// Number of records in `Installed` state
    pub fn installed_count(&self) -> usize {
        self.records
            .read()
            .values()
            .filter(|r| r.state == HookState::Installed)
            .count()
    }

    /// Number of records in `Failed` state
    pub fn failed_count(&self) -> usize {
        self.records
            .read()
            .values()
            .filter(|r| r.state == HookState::Failed)
            .count()
    }

    /// State of the named record, if present
    pub fn state_of(&self, name: &str) -> Option<HookState> {
        self.records
            .read()
            .values()
            .find(|r| r.name == name)
            .map(|r| r.state)
    }

    /// Kind of the named record, if present
    pub fn kind_of(&self, name: &str) -> Option<HookKind> {
        self.records
            .read()
            .values()
            .find(|r| r.name == name)
            .map(|r| r.kind)
    }

    /// Target address as the owning backend handle reports it.
    ///
    /// Diagnostics only; `None` for failed installs.
    pub fn backend_target(&self, key: HookKey) -> Option<usize> {
        self.records
            .read()
            .get(key)
            .and_then(|r| r.hook.as_ref())
            .map(|h| h.target())
    }
}
