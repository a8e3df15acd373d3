//! Process-exit gate
//!
//! The target's anti-tamper logic terminates the process through the
//! low-level exit entry point when it believes it caught a modification.
//! The gate cannot (and should not) veto a legitimate exit, but it makes
//! the silent ones loud: the attempt is recorded and logged with the
//! symbolicated caller before being forwarded.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use tamperveil_engine::{annotate_address, SymbolResolver};

/// Records process-termination attempts
#[derive(Default)]
pub struct ExitObserver {
    observed: AtomicBool,
    last_code: AtomicU32,
}

impl ExitObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one termination attempt and build its log line
    pub fn note(
        &self,
        code: u32,
        caller: usize,
        resolver: Option<&dyn SymbolResolver>,
    ) -> String {
        self.observed.store(true, Ordering::SeqCst);
        self.last_code.store(code, Ordering::SeqCst);

        format!(
            "Process exit requested with code {} from {}",
            code,
            annotate_address(resolver, caller)
        )
    }

    pub fn observed(&self) -> bool {
        self.observed.load(Ordering::SeqCst)
    }

    pub fn last_code(&self) -> u32 {
        self.last_code.load(Ordering::SeqCst)
    }
}

#[cfg(windows)]
pub mod os {
    //! Windows glue: detour over `RtlExitUserProcess`.

    use std::sync::Arc;

    use crate::context::Engine;
    use crate::hooks::DetourHandler;

    type ExitFn = unsafe extern "system" fn(code: u32);

    /// Detour body for `RtlExitUserProcess`
    pub fn exit_handler(engine: &Arc<Engine>) -> DetourHandler {
        let engine = Arc::clone(engine);
        Box::new(move |ctx, original| {
            let code = ctx.arg(0) as u32;
            let caller = unsafe { ctx.return_address() } as usize;

            let resolver = engine.resolver();
            let line = engine
                .exit_observer()
                .note(code, caller, resolver.as_deref());
            tracing::warn!("{}", line);

            let real: ExitFn = unsafe { std::mem::transmute(original) };
            unsafe { real(code) };
            // Not reached; the exit entry point does not return.
            0
        })
    }
}
