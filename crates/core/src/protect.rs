//! Protection shim
//!
//! Installing a patch flips the protection of the patched bytes, and the
//! target notices exactly that. The shim intercepts the protection-change
//! API (and the syscall beneath it) and answers for registered regions as
//! if the patch never happened: queries report the pre-patch attributes,
//! and host-initiated changes are really applied but the *requested*
//! attributes are what later queries see.
//!
//! The engine's own protection toggling goes through the pristine path
//! ([`os::PristineProtect`]) which bypasses the installed hooks entirely,
//! so concealment never recurses into itself.

use bitflags::bitflags;
use parking_lot::RwLock;

// Page protection constants as the OS ABI defines them.
pub const PAGE_NOACCESS: u32 = 0x01;
pub const PAGE_READONLY: u32 = 0x02;
pub const PAGE_READWRITE: u32 = 0x04;
pub const PAGE_WRITECOPY: u32 = 0x08;
pub const PAGE_EXECUTE: u32 = 0x10;
pub const PAGE_EXECUTE_READ: u32 = 0x20;
pub const PAGE_EXECUTE_READWRITE: u32 = 0x40;
pub const PAGE_EXECUTE_WRITECOPY: u32 = 0x80;
pub const PAGE_GUARD: u32 = 0x100;

bitflags! {
    /// Protection attributes in a form the tables can reason about
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Protection: u32 {
        const READ = 1;
        const WRITE = 2;
        const EXECUTE = 4;
        const WRITECOPY = 8;
        const GUARD = 16;
        const NOACCESS = 32;
    }
}

impl Protection {
    /// Decode an OS page-protection value
    pub fn from_page_flags(flags: u32) -> Self {
        let mut p = match flags & !PAGE_GUARD {
            PAGE_NOACCESS => Protection::NOACCESS,
            PAGE_READONLY => Protection::READ,
            PAGE_READWRITE => Protection::READ | Protection::WRITE,
            PAGE_WRITECOPY => Protection::READ | Protection::WRITECOPY,
            PAGE_EXECUTE => Protection::EXECUTE,
            PAGE_EXECUTE_READ => Protection::READ | Protection::EXECUTE,
            PAGE_EXECUTE_READWRITE => Protection::READ | Protection::WRITE | Protection::EXECUTE,
            PAGE_EXECUTE_WRITECOPY => {
                Protection::READ | Protection::WRITECOPY | Protection::EXECUTE
            }
            _ => Protection::NOACCESS,
        };
        if flags & PAGE_GUARD != 0 {
            p |= Protection::GUARD;
        }
        p
    }

    /// Encode back into an OS page-protection value
    pub fn to_page_flags(self) -> u32 {
        let guard = if self.contains(Protection::GUARD) {
            PAGE_GUARD
        } else {
            0
        };
        let base = self & !Protection::GUARD;

        let flags = if base.contains(Protection::EXECUTE) {
            if base.contains(Protection::WRITE) {
                PAGE_EXECUTE_READWRITE
            } else if base.contains(Protection::WRITECOPY) {
                PAGE_EXECUTE_WRITECOPY
            } else if base.contains(Protection::READ) {
                PAGE_EXECUTE_READ
            } else {
                PAGE_EXECUTE
            }
        } else if base.contains(Protection::WRITE) {
            PAGE_READWRITE
        } else if base.contains(Protection::WRITECOPY) {
            PAGE_WRITECOPY
        } else if base.contains(Protection::READ) {
            PAGE_READONLY
        } else {
            PAGE_NOACCESS
        };

        flags | guard
    }
}

/// One byte range modified by a patch
#[derive(Debug, Clone, Copy)]
struct Region {
    base: usize,
    len: usize,
    /// What queries should see: starts as the pre-patch attributes,
    /// later updated to whatever the host itself requests.
    reported: Protection,
}

impl Region {
    fn overlaps(&self, base: usize, len: usize) -> bool {
        base < self.base + self.len && self.base < base + len.max(1)
    }
}

/// Table of every patched byte range, registered at patch-install time
/// and never removed during the process's life.
#[derive(Default)]
pub struct RegionTable {
    regions: RwLock<Vec<Region>>,
}

/// Shim decision for one protection-change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtectVerdict {
    /// Range touches no patched region; the real answer stands
    Passthrough,
    /// Range overlaps a patched region; report these attributes instead
    Conceal { reported: Protection },
}

impl RegionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a patched range with its pre-patch attributes.
    ///
    /// Kept sorted by base so span queries are answered by the
    /// lowest-based overlapping region.
    pub fn register(&self, base: usize, len: usize, original: Protection) {
        let mut regions = self.regions.write();
        let at = regions.partition_point(|r| r.base < base);
        regions.insert(
            at,
            Region {
                base,
                len,
                reported: original,
            },
        );
        tracing::debug!(
            "Concealing patched range {:#x}..{:#x} as {:?}",
            base,
            base + len,
            original
        );
    }

    pub fn len(&self) -> usize {
        self.regions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.read().is_empty()
    }

    /// Attributes to report for a query covering `[base, base+len)`.
    ///
    /// `None` when the range touches no registered region. A range
    /// spanning several regions always reports the lowest-based one.
    pub fn query(&self, base: usize, len: usize) -> Option<Protection> {
        self.regions
            .read()
            .iter()
            .find(|r| r.overlaps(base, len))
            .map(|r| r.reported)
    }

    /// Record the attributes the host asked for, so later queries keep
    /// telling the host its own story. Returns whether anything matched.
    pub fn record_requested(&self, base: usize, len: usize, requested: Protection) -> bool {
        let mut hit = false;
        for r in self.regions.write().iter_mut() {
            if r.overlaps(base, len) {
                r.reported = requested;
                hit = true;
            }
        }
        hit
    }

    /// Decide a protection-change request: what to report as the old
    /// attributes, and remember what the caller asked for.
    ///
    /// The real modification is always issued by the caller of this
    /// function (through the pristine path), regardless of verdict.
    pub fn filter_change(&self, base: usize, len: usize, requested: Protection) -> ProtectVerdict {
        match self.query(base, len) {
            Some(reported) => {
                self.record_requested(base, len, requested);
                ProtectVerdict::Conceal { reported }
            }
            None => ProtectVerdict::Passthrough,
        }
    }
}

#[cfg(windows)]
pub mod os {
    //! Windows glue: the two protection detours and the pristine path.

    use std::ffi::c_void;
    use std::sync::Arc;

    use super::*;
    use crate::context::Engine;
    use crate::hooks::DetourHandler;

    /// `NtProtectVirtualMemory` signature
    type NtProtectFn = unsafe extern "system" fn(
        process: isize,
        base: *mut *mut c_void,
        size: *mut usize,
        new_protect: u32,
        old_protect: *mut u32,
    ) -> i32;

    const CURRENT_PROCESS: isize = -1;

    /// A private, unhooked copy of the `NtProtectVirtualMemory` syscall
    /// stub. Calls through it reach the kernel without touching the
    /// patched entry in ntdll, so the engine's own protection toggling is
    /// invisible and cannot recurse into the shim. Lock-free by design.
    pub struct PristineProtect {
        _stub: region::Allocation,
        func: NtProtectFn,
    }

    // SAFETY: the stub allocation is immutable after construction.
    unsafe impl Send for PristineProtect {}
    unsafe impl Sync for PristineProtect {}

    impl PristineProtect {
        /// Copy the syscall stub out of ntdll before anything hooks it.
        pub fn setup() -> Option<Arc<Self>> {
            let target = resolve("ntdll.dll", "NtProtectVirtualMemory")?;

            // The x64 syscall stub is well under 32 bytes:
            //   mov r10, rcx / mov eax, imm32 / syscall / ret
            let mut stub = region::alloc(64, region::Protection::READ_WRITE_EXECUTE).ok()?;
            unsafe {
                std::ptr::copy_nonoverlapping(target as *const u8, stub.as_mut_ptr(), 32);
            }

            let func: NtProtectFn = unsafe { std::mem::transmute(stub.as_ptr::<u8>()) };
            tracing::info!("Pristine protection path ready (stub of {:#x})", target);

            Some(Arc::new(Self { _stub: stub, func }))
        }

        /// Change protection of `[addr, addr+size)`; returns the previous
        /// page flags on success.
        pub unsafe fn protect(&self, addr: usize, size: usize, new_page_flags: u32) -> Option<u32> {
            let mut base = addr as *mut c_void;
            let mut len = size;
            let mut old = 0u32;
            let status = (self.func)(
                CURRENT_PROCESS,
                &mut base,
                &mut len,
                new_page_flags,
                &mut old,
            );
            (status >= 0).then_some(old)
        }
    }

    /// Resolve an export address out of a loaded system module
    pub fn resolve(module: &str, symbol: &str) -> Option<usize> {
        use windows_sys::Win32::System::LibraryLoader::{GetModuleHandleA, GetProcAddress};

        let module_c = format!("{}\0", module);
        let symbol_c = format!("{}\0", symbol);
        unsafe {
            let handle = GetModuleHandleA(module_c.as_ptr());
            if handle.is_null() {
                return None;
            }
            GetProcAddress(handle, symbol_c.as_ptr()).map(|f| f as usize)
        }
    }

    /// Detour body for `VirtualProtect`
    pub fn virtual_protect_handler(engine: &Arc<Engine>) -> DetourHandler {
        let engine = Arc::clone(engine);
        Box::new(move |ctx, _original| {
            let addr = ctx.arg(0) as usize;
            let size = ctx.arg(1) as usize;
            let requested_page = ctx.arg(2) as u32;
            let old_out = ctx.arg(3) as *mut u32;

            let Some(pristine) = engine.pristine() else {
                return 0;
            };
            let Some(real_old) = (unsafe { pristine.protect(addr, size, requested_page) }) else {
                return 0;
            };

            let verdict = engine.regions().filter_change(
                addr,
                size,
                Protection::from_page_flags(requested_page),
            );
            let reported_old = match verdict {
                ProtectVerdict::Conceal { reported } => reported.to_page_flags(),
                ProtectVerdict::Passthrough => real_old,
            };

            if !old_out.is_null() {
                unsafe { *old_out = reported_old };
            }
            1
        })
    }

    /// Detour body for `NtProtectVirtualMemory`
    pub fn nt_protect_handler(engine: &Arc<Engine>) -> DetourHandler {
        let engine = Arc::clone(engine);
        Box::new(move |ctx, _original| {
            let process = ctx.arg(0) as isize;
            let base_ptr = ctx.arg(1) as *mut *mut c_void;
            let size_ptr = ctx.arg(2) as *mut usize;
            let requested_page = ctx.arg(3) as u32;
            let old_out = ctx.arg(4) as *mut u32;

            let Some(pristine) = engine.pristine() else {
                return STATUS_ACCESS_DENIED;
            };

            if base_ptr.is_null() || size_ptr.is_null() {
                return STATUS_ACCESS_DENIED;
            }
            let (addr, size) = unsafe { ((*base_ptr) as usize, *size_ptr) };

            // Requests against other processes are none of our business.
            if process != CURRENT_PROCESS {
                let status = unsafe {
                    (pristine.func)(process, base_ptr, size_ptr, requested_page, old_out)
                };
                return status as u64;
            }

            let Some(real_old) = (unsafe { pristine.protect(addr, size, requested_page) }) else {
                return STATUS_ACCESS_DENIED;
            };

            let verdict = engine.regions().filter_change(
                addr,
                size,
                Protection::from_page_flags(requested_page),
            );
            let reported_old = match verdict {
                ProtectVerdict::Conceal { reported } => reported.to_page_flags(),
                ProtectVerdict::Passthrough => real_old,
            };

            if !old_out.is_null() {
                unsafe { *old_out = reported_old };
            }
            0 // STATUS_SUCCESS
        })
    }

    const STATUS_ACCESS_DENIED: u64 = 0xC0000022;
}

#[cfg(test)]
mod tests {
    use super::*;

    const RX: Protection = Protection::READ.union(Protection::EXECUTE);
    const RW: Protection = Protection::READ.union(Protection::WRITE);
    const RWX: Protection = RX.union(Protection::WRITE);

    #[test]
    fn test_query_reports_pre_patch_attributes() {
        let table = RegionTable::new();
        table.register(0x1000, 0x20, RX);

        // The engine flips the live range to RWX while patching; that
        // change goes through the pristine path and is never recorded,
        // so every covering query keeps seeing RX.
        assert_eq!(table.query(0x1000, 0x20), Some(RX));
        assert_eq!(table.query(0x1010, 1), Some(RX));
        assert_eq!(table.query(0x101f, 1), Some(RX));
        assert_eq!(table.query(0x1020, 1), None);
        assert_eq!(table.query(0xfff, 1), None);
    }

    #[test]
    fn test_host_change_applied_but_request_recorded() {
        let table = RegionTable::new();
        table.register(0x1000, 0x20, RX);

        let verdict = table.filter_change(0x1000, 0x20, RW);
        // The old attributes handed back are the pre-patch ones...
        assert_eq!(verdict, ProtectVerdict::Conceal { reported: RX });
        // ...and from now on the host sees the attributes it asked for,
        // never the live (patched) ones.
        assert_eq!(table.query(0x1008, 4), Some(RW));
    }

    #[test]
    fn test_unrelated_range_passes_through() {
        let table = RegionTable::new();
        table.register(0x1000, 0x20, RX);

        assert_eq!(
            table.filter_change(0x9000, 0x100, RW),
            ProtectVerdict::Passthrough
        );
        // A passthrough change records nothing.
        assert_eq!(table.query(0x1000, 1), Some(RX));
    }

    #[test]
    fn test_span_reports_lowest_region() {
        let table = RegionTable::new();
        // Registered out of order; the table keeps them sorted by base.
        table.register(0x2000, 0x10, RW);
        table.register(0x1000, 0x10, RX);

        // A query spanning both regions answers with the lowest-based one.
        assert_eq!(table.query(0x0800, 0x2000), Some(RX));
        // Covering only the second still answers with the second.
        assert_eq!(table.query(0x2004, 4), Some(RW));
    }

    #[test]
    fn test_span_change_updates_every_overlapped_region() {
        let table = RegionTable::new();
        table.register(0x1000, 0x10, RX);
        table.register(0x2000, 0x10, RX);

        let verdict = table.filter_change(0x0800, 0x2000, RWX);
        assert_eq!(verdict, ProtectVerdict::Conceal { reported: RX });

        assert_eq!(table.query(0x1000, 1), Some(RWX));
        assert_eq!(table.query(0x2000, 1), Some(RWX));
    }

    #[test]
    fn test_page_flag_roundtrip() {
        for flags in [
            PAGE_NOACCESS,
            PAGE_READONLY,
            PAGE_READWRITE,
            PAGE_WRITECOPY,
            PAGE_EXECUTE,
            PAGE_EXECUTE_READ,
            PAGE_EXECUTE_READWRITE,
            PAGE_EXECUTE_WRITECOPY,
            PAGE_EXECUTE_READ | PAGE_GUARD,
        ] {
            let p = Protection::from_page_flags(flags);
            assert_eq!(p.to_page_flags(), flags, "flags {:#x}", flags);
        }
    }
}
