//! Executable module resolution
//!
//! The pattern scanner needs the base address and byte length of the
//! host executable's image. Both are resolved once and cached; everything
//! downstream treats the module as immutable for the process's life.

use std::sync::OnceLock;

use crate::error::ScanError;

/// Base and length of a loaded module's image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostModule {
    base: usize,
    size: usize,
}

impl HostModule {
    /// Wrap an already-known address range.
    ///
    /// Used by tests and by callers that scan a buffer rather than the
    /// live image.
    pub fn from_raw(base: usize, size: usize) -> Self {
        Self { base, size }
    }

    pub fn base(&self) -> usize {
        self.base
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Whether `address` falls inside the image
    pub fn contains(&self, address: usize) -> bool {
        address >= self.base && address < self.base + self.size
    }

    /// View the image as a byte slice
    ///
    /// # Safety
    /// The range `[base, base+size)` must be mapped and readable for the
    /// lifetime of the returned slice.
    pub unsafe fn bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.base as *const u8, self.size)
    }
}

/// Process-wide host module handle, resolved on first use
static HOST_MODULE: OnceLock<Option<HostModule>> = OnceLock::new();

/// Resolve the main executable module of the current process.
///
/// The result is cached; a failed resolution is also cached (the image
/// does not move or appear later).
pub fn host_module() -> Result<HostModule, ScanError> {
    HOST_MODULE
        .get_or_init(|| {
            let resolved = resolve_host_module();
            match resolved {
                Some(m) => {
                    tracing::info!(
                        "Host module resolved: base={:#x} size={:#x}",
                        m.base,
                        m.size
                    );
                }
                None => tracing::error!("Failed to resolve host module"),
            }
            resolved
        })
        .ok_or(ScanError::ModuleUnavailable)
}

#[cfg(windows)]
fn resolve_host_module() -> Option<HostModule> {
    use windows_sys::Win32::System::Diagnostics::Debug::IMAGE_NT_HEADERS64;
    use windows_sys::Win32::System::LibraryLoader::GetModuleHandleW;
    use windows_sys::Win32::System::SystemServices::IMAGE_DOS_HEADER;

    unsafe {
        let base = GetModuleHandleW(std::ptr::null()) as usize;
        if base == 0 {
            return None;
        }

        let dos = base as *const IMAGE_DOS_HEADER;
        let nt = (base + (*dos).e_lfanew as usize) as *const IMAGE_NT_HEADERS64;
        let size = (*nt).OptionalHeader.SizeOfImage as usize;

        Some(HostModule { base, size })
    }
}

#[cfg(unix)]
fn resolve_host_module() -> Option<HostModule> {
    use std::ffi::c_void;

    struct Probe {
        base: usize,
        size: usize,
        found: bool,
    }

    unsafe extern "C" fn callback(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> libc::c_int {
        let probe = &mut *(data as *mut Probe);
        let info = &*info;

        // The first entry with an empty name is the main executable.
        let is_main = info.dlpi_name.is_null() || *info.dlpi_name == 0;
        if !is_main || probe.found {
            return 0;
        }

        let mut end = 0usize;
        for i in 0..info.dlpi_phnum {
            let phdr = &*info.dlpi_phdr.add(i as usize);
            if phdr.p_type == libc::PT_LOAD {
                let seg_end = phdr.p_vaddr as usize + phdr.p_memsz as usize;
                end = end.max(seg_end);
            }
        }

        probe.base = info.dlpi_addr as usize;
        probe.size = end;
        probe.found = true;
        1
    }

    let mut probe = Probe {
        base: 0,
        size: 0,
        found: false,
    };
    unsafe {
        libc::dl_iterate_phdr(Some(callback), &mut probe as *mut Probe as *mut c_void);
    }

    probe.found.then_some(HostModule {
        base: probe.base,
        size: probe.size,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contains() {
        let m = HostModule::from_raw(0x1000, 0x200);
        assert!(m.contains(0x1000));
        assert!(m.contains(0x11ff));
        assert!(!m.contains(0x1200));
        assert!(!m.contains(0xfff));
    }

    #[test]
    fn test_resolve_current_process() {
        // Every test binary has a resolvable main module.
        let m = host_module().unwrap();
        assert!(m.size() > 0);
    }
}
