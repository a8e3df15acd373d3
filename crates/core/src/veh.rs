//! VEH gatekeeper
//!
//! The target registers a vectored exception handler as part of its
//! anti-tamper setup and uses it to observe faults the patches cause.
//! The gate intercepts registration: attempts are always observable via
//! the sticky `was_called` flag, but the real registration is only
//! forwarded once the gate has been opened. Absorbed callers get a
//! stable, non-null token back so their bookkeeping keeps working.

use std::sync::atomic::{AtomicBool, Ordering};

/// Token handed to absorbed registrations. Its address is unique and
/// stable for the process's life, which is all callers rely on.
static ABSORBED_TOKEN: u8 = 0;

/// Decision for one registration attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VehVerdict {
    /// Gate is open; forward to the real API
    Forward,
    /// Gate is closed; swallow the call and return this token
    Absorb(usize),
}

/// Registration gate for vectored exception handlers
#[derive(Default)]
pub struct VehGate {
    /// One-directional: once open, never closes again this process
    allowed: AtomicBool,
    /// Sticky observable: did anything ever attempt a registration
    called: AtomicBool,
}

impl VehGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the gate. Invoked once another established hook needs to
    /// install its own handler safely; there is no way back to blocking.
    pub fn allow(&self) {
        if !self.allowed.swap(true, Ordering::SeqCst) {
            tracing::info!("VEH registration gate opened");
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.allowed.load(Ordering::SeqCst)
    }

    /// Whether any registration was ever attempted
    pub fn was_called(&self) -> bool {
        self.called.load(Ordering::SeqCst)
    }

    /// Record one registration attempt and decide what to do with it
    pub fn on_register_attempt(&self) -> VehVerdict {
        self.called.store(true, Ordering::SeqCst);

        if self.allowed.load(Ordering::SeqCst) {
            VehVerdict::Forward
        } else {
            tracing::debug!("Absorbed vectored-exception-handler registration");
            VehVerdict::Absorb(&ABSORBED_TOKEN as *const u8 as usize)
        }
    }
}

#[cfg(windows)]
pub mod os {
    //! Windows glue: detour over `AddVectoredExceptionHandler`.

    use std::ffi::c_void;
    use std::sync::Arc;

    use super::VehVerdict;
    use crate::context::Engine;
    use crate::hooks::DetourHandler;

    type AddVehFn = unsafe extern "system" fn(first: u32, handler: *mut c_void) -> *mut c_void;

    /// Detour body for `AddVectoredExceptionHandler`
    pub fn add_veh_handler(engine: &Arc<Engine>) -> DetourHandler {
        let engine = Arc::clone(engine);
        Box::new(move |ctx, original| match engine.veh().on_register_attempt() {
            VehVerdict::Forward => {
                let real: AddVehFn = unsafe { std::mem::transmute(original) };
                let token =
                    unsafe { real(ctx.arg(0) as u32, ctx.arg(1) as *mut c_void) };
                token as u64
            }
            VehVerdict::Absorb(token) => token as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blocked_by_default_and_flag_sticky() {
        let gate = VehGate::new();
        assert!(!gate.was_called());

        // Before allow_veh(): every attempt sets the flag and nothing is
        // forwarded.
        let v1 = gate.on_register_attempt();
        assert!(matches!(v1, VehVerdict::Absorb(token) if token != 0));
        assert!(gate.was_called());

        let v2 = gate.on_register_attempt();
        assert_eq!(v1, v2, "absorbed token is stable");
        assert!(gate.was_called());
    }

    #[test]
    fn test_forwarded_after_allow() {
        let gate = VehGate::new();
        gate.allow();
        assert!(gate.is_allowed());

        assert_eq!(gate.on_register_attempt(), VehVerdict::Forward);
        assert!(gate.was_called());

        // One-directional: still open, attempts keep forwarding.
        gate.allow();
        assert_eq!(gate.on_register_attempt(), VehVerdict::Forward);
    }
}
