//! Hook primitive seam
//!
//! Detour and mid-hook construction is a collaborator, not something this
//! engine implements: the engine decides *where* and *with what body* a
//! hook goes, the backend owns the trampoline mechanics. The windows
//! backend lives in [`super::os`]; tests drive the same seam with a
//! recording fake.

use super::context::CpuContext;

/// Error type for hook operations
#[derive(Debug, thiserror::Error)]
pub enum HookError {
    #[error("Failed to create detour: {0}")]
    DetourCreation(String),

    #[error("Failed to create mid-function hook: {0}")]
    MidCreation(String),

    #[error("Hook not found")]
    NotFound,

    #[error("Invalid address: {0:x}")]
    InvalidAddress(usize),

    #[error("Hook primitive unavailable on this platform")]
    Unsupported,
}

/// Callback type for mid-function hooks: runs on the live register
/// snapshot, then original execution resumes.
pub type MidHandler = Box<dyn Fn(&mut CpuContext) + Send + Sync>;

/// Callback type for function detours.
///
/// Receives the caller's register snapshot and a pointer through which
/// the original function remains callable; the returned value goes back
/// to the caller in the return register.
pub type DetourHandler = Box<dyn Fn(&mut CpuContext, usize) -> u64 + Send + Sync>;

/// An installed hook owned by its record; dropped only at process
/// teardown.
pub trait InstalledHook: Send + Sync {
    fn target(&self) -> usize;
}

/// The hook-installation collaborator.
///
/// Both operations are per-target: a refusal fails one patch and nothing
/// else.
pub trait HookBackend: Send + Sync {
    /// Replace entry into the function at `target` with `handler`.
    ///
    /// # Safety
    /// `target` must be a hookable function entry.
    unsafe fn install_detour(
        &self,
        name: &str,
        target: usize,
        handler: DetourHandler,
    ) -> Result<Box<dyn InstalledHook>, HookError>;

    /// Insert a context hook at the instruction at `target`.
    ///
    /// # Safety
    /// `target` must be an instruction boundary with enough relocatable
    /// bytes for the backend's stub.
    unsafe fn install_mid(
        &self,
        name: &str,
        target: usize,
        handler: MidHandler,
    ) -> Result<Box<dyn InstalledHook>, HookError>;
}

/// Backend used when no hook primitive exists for the platform.
///
/// Every install fails softly; the engine's containment rules turn that
/// into per-patch disablement rather than an initialization error.
pub struct NullBackend;

impl HookBackend for NullBackend {
    unsafe fn install_detour(
        &self,
        name: &str,
        _target: usize,
        _handler: DetourHandler,
    ) -> Result<Box<dyn InstalledHook>, HookError> {
        tracing::debug!("No hook primitive on this platform; '{}' skipped", name);
        Err(HookError::Unsupported)
    }

    unsafe fn install_mid(
        &self,
        name: &str,
        _target: usize,
        _handler: MidHandler,
    ) -> Result<Box<dyn InstalledHook>, HookError> {
        tracing::debug!("No hook primitive on this platform; '{}' skipped", name);
        Err(HookError::Unsupported)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Recording backend for unit tests: installs always succeed and the
    //! test can fire any installed hook body by hand.

    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;

    struct FakeHook {
        target: usize,
    }

    impl InstalledHook for FakeHook {
        fn target(&self) -> usize {
            self.target
        }
    }

    #[derive(Default)]
    pub struct FakeBackend {
        mids: Mutex<Vec<(String, usize, Arc<MidHandler>)>>,
        detours: Mutex<Vec<(String, usize, Arc<DetourHandler>)>>,
        /// Names the backend refuses to install, to exercise containment
        refuse: Mutex<Vec<String>>,
    }

    impl FakeBackend {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub fn refuse(&self, name: &str) {
            self.refuse.lock().push(name.to_string());
        }

        pub fn mid_count(&self) -> usize {
            self.mids.lock().len()
        }

        pub fn detour_count(&self) -> usize {
            self.detours.lock().len()
        }

        pub fn has_mid(&self, name: &str) -> bool {
            self.mids.lock().iter().any(|(n, _, _)| n == name)
        }

        /// Run the named mid-hook body against `ctx`
        pub fn fire_mid(&self, name: &str, ctx: &mut CpuContext) {
            let handler = self
                .mids
                .lock()
                .iter()
                .find(|(n, _, _)| n == name)
                .map(|(_, _, h)| Arc::clone(h));
            match handler {
                Some(h) => h(ctx),
                None => panic!("no mid-hook installed under '{}'", name),
            }
        }

        /// Run the named detour body against `ctx` with a dummy original
        pub fn fire_detour(&self, name: &str, ctx: &mut CpuContext, original: usize) -> u64 {
            let handler = self
                .detours
                .lock()
                .iter()
                .find(|(n, _, _)| n == name)
                .map(|(_, _, h)| Arc::clone(h));
            match handler {
                Some(h) => h(ctx, original),
                None => panic!("no detour installed under '{}'", name),
            }
        }
    }

    impl HookBackend for FakeBackend {
        unsafe fn install_detour(
            &self,
            name: &str,
            target: usize,
            handler: DetourHandler,
        ) -> Result<Box<dyn InstalledHook>, HookError> {
            if self.refuse.lock().iter().any(|n| n == name) {
                return Err(HookError::DetourCreation("refused by test".into()));
            }
            self.detours
                .lock()
                .push((name.to_string(), target, Arc::new(handler)));
            Ok(Box::new(FakeHook { target }))
        }

        unsafe fn install_mid(
            &self,
            name: &str,
            target: usize,
            handler: MidHandler,
        ) -> Result<Box<dyn InstalledHook>, HookError> {
            if self.refuse.lock().iter().any(|n| n == name) {
                return Err(HookError::MidCreation("refused by test".into()));
            }
            self.mids
                .lock()
                .push((name.to_string(), target, Arc::new(handler)));
            Ok(Box::new(FakeHook { target }))
        }
    }
}
