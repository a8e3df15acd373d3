//! ilhook-backed hook primitive (windows)
//!
//! Bridges the backend seam onto ilhook: jmp-back hooks carry the mid
//! bodies, retn hooks carry the detours. Handler boxes are leaked to get
//! a stable pointer for the assembly stub to call back into; they are
//! reclaimed when the owning record drops at process teardown.

use std::ffi::c_void;

use ilhook::x64::{CallbackOption, HookFlags, HookPoint, HookType, Hooker, Registers};

use super::backend::{DetourHandler, HookBackend, HookError, InstalledHook, MidHandler};
use super::context::CpuContext;

/// Hook primitive backed by the ilhook crate
pub struct IlhookBackend;

struct OwnedHook {
    point: Option<HookPoint>,
    target: usize,
    /// Raw pointer to the leaked handler box, freed on drop
    handler: *mut c_void,
    free: unsafe fn(*mut c_void),
}

// SAFETY: the hook point and handler box are only touched at install and
// teardown; hook bodies reach the handler through the leaked pointer.
unsafe impl Send for OwnedHook {}
unsafe impl Sync for OwnedHook {}

impl InstalledHook for OwnedHook {
    fn target(&self) -> usize {
        self.target
    }
}

impl Drop for OwnedHook {
    fn drop(&mut self) {
        // Unhook first so nothing can enter the handler while it is freed.
        drop(self.point.take());
        if !self.handler.is_null() {
            unsafe { (self.free)(self.handler) };
        }
    }
}

unsafe fn free_mid(ptr: *mut c_void) {
    drop(Box::from_raw(ptr as *mut MidHandler));
}

unsafe fn free_detour(ptr: *mut c_void) {
    drop(Box::from_raw(ptr as *mut DetourHandler));
}

fn snapshot(regs: &Registers) -> CpuContext {
    CpuContext {
        rflags: regs.rflags,
        r15: regs.r15,
        r14: regs.r14,
        r13: regs.r13,
        r12: regs.r12,
        r11: regs.r11,
        r10: regs.r10,
        r9: regs.r9,
        r8: regs.r8,
        rdi: regs.rdi,
        rsi: regs.rsi,
        rbp: regs.rbp,
        rdx: regs.rdx,
        rcx: regs.rcx,
        rbx: regs.rbx,
        rax: regs.rax,
        rsp: regs.rsp,
    }
}

fn write_back(regs: &mut Registers, ctx: &CpuContext) {
    regs.rflags = ctx.rflags;
    regs.r15 = ctx.r15;
    regs.r14 = ctx.r14;
    regs.r13 = ctx.r13;
    regs.r12 = ctx.r12;
    regs.r11 = ctx.r11;
    regs.r10 = ctx.r10;
    regs.r9 = ctx.r9;
    regs.r8 = ctx.r8;
    regs.rdi = ctx.rdi;
    regs.rsi = ctx.rsi;
    regs.rbp = ctx.rbp;
    regs.rdx = ctx.rdx;
    regs.rcx = ctx.rcx;
    regs.rbx = ctx.rbx;
    regs.rax = ctx.rax;
    // rsp stays whatever the stub saved; rewriting it is undefined.
}

/// Jmp-back trampoline: `user_data` is the leaked `MidHandler` box
unsafe extern "win64" fn mid_trampoline(regs: *mut Registers, user_data: usize) {
    if regs.is_null() || user_data == 0 {
        return;
    }
    let handler = &*(user_data as *const MidHandler);
    let mut ctx = snapshot(&*regs);
    handler(&mut ctx);
    write_back(&mut *regs, &ctx);
}

/// Retn trampoline: `user_data` is the leaked `DetourHandler` box
unsafe extern "win64" fn detour_trampoline(
    regs: *mut Registers,
    ori_func_ptr: usize,
    user_data: usize,
) -> usize {
    if regs.is_null() || user_data == 0 {
        return 0;
    }
    let handler = &*(user_data as *const DetourHandler);
    let mut ctx = snapshot(&*regs);
    let ret = handler(&mut ctx, ori_func_ptr);
    write_back(&mut *regs, &ctx);
    ret as usize
}

impl HookBackend for IlhookBackend {
    unsafe fn install_detour(
        &self,
        name: &str,
        target: usize,
        handler: DetourHandler,
    ) -> Result<Box<dyn InstalledHook>, HookError> {
        if target == 0 {
            return Err(HookError::InvalidAddress(target));
        }

        let handler_ptr = Box::into_raw(Box::new(handler));

        let hooker = Hooker::new(
            target,
            HookType::Retn(detour_trampoline),
            CallbackOption::None,
            handler_ptr as usize,
            HookFlags::empty(),
        );

        match hooker.hook() {
            Ok(point) => Ok(Box::new(OwnedHook {
                point: Some(point),
                target,
                handler: handler_ptr as *mut c_void,
                free: free_detour,
            })),
            Err(e) => {
                drop(Box::from_raw(handler_ptr));
                tracing::error!("Failed to create detour '{}': {:?}", name, e);
                Err(HookError::DetourCreation(format!("{:?}", e)))
            }
        }
    }

    unsafe fn install_mid(
        &self,
        name: &str,
        target: usize,
        handler: MidHandler,
    ) -> Result<Box<dyn InstalledHook>, HookError> {
        if target == 0 {
            return Err(HookError::InvalidAddress(target));
        }

        let handler_ptr = Box::into_raw(Box::new(handler));

        let hooker = Hooker::new(
            target,
            HookType::JmpBack(mid_trampoline),
            CallbackOption::None,
            handler_ptr as usize,
            HookFlags::empty(),
        );

        match hooker.hook() {
            Ok(point) => Ok(Box::new(OwnedHook {
                point: Some(point),
                target,
                handler: handler_ptr as *mut c_void,
                free: free_mid,
            })),
            Err(e) => {
                drop(Box::from_raw(handler_ptr));
                tracing::error!("Failed to create mid-hook '{}': {:?}", name, e);
                Err(HookError::MidCreation(format!("{:?}", e)))
            }
        }
    }
}
