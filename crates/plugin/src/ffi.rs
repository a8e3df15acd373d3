//! C-compatible exports called by the injector

use std::ffi::c_char;
#[cfg(windows)]
use std::ffi::c_void;

// Library metadata - static strings with null terminators for C compatibility
static NAME: &[u8] = b"tamperveil\0";
static DESCRIPTION: &[u8] = b"Runtime integrity-bypass and anti-tamper patch engine\0";
static VERSION: &[u8] = b"0.1.0\0";

/// Called by the injector once the library is mapped.
///
/// # Safety
/// - `error` must be a valid pointer to a buffer of at least `maxlen`
///   bytes, or null
#[no_mangle]
pub unsafe extern "C" fn tamperveil_attach(error: *mut c_char, maxlen: usize) -> bool {
    match crate::attach() {
        Ok(()) => true,
        Err(msg) => {
            tracing::error!("Attach failed: {}", msg);
            write_error(error, maxlen, &msg);
            false
        }
    }
}

/// Called by the injector on orderly unload
#[no_mangle]
pub extern "C" fn tamperveil_detach() {
    match std::panic::catch_unwind(crate::detach) {
        Ok(()) => {}
        Err(_) => tracing::error!("Panic during detach"),
    }
}

/// Open the VEH registration gate (one-directional)
#[no_mangle]
pub extern "C" fn tamperveil_allow_veh() {
    if let Some(engine) = crate::engine() {
        engine.allow_veh();
    }
}

/// Whether the host attempted a vectored-exception-handler registration
#[no_mangle]
pub extern "C" fn tamperveil_is_veh_called() -> bool {
    crate::engine().map(|e| e.veh().was_called()).unwrap_or(false)
}

/// UI toggle for the PAK directory overlay
#[no_mangle]
pub extern "C" fn tamperveil_set_pak_overlay(enabled: bool) -> bool {
    match crate::engine() {
        Some(engine) => {
            engine.overlay().set_enabled(enabled);
            true
        }
        None => false,
    }
}

/// Behavioral toggle for a single named patch
///
/// # Safety
/// - `name` must be a valid null-terminated C string
#[no_mangle]
pub unsafe extern "C" fn tamperveil_set_patch_enabled(name: *const c_char, enabled: bool) -> bool {
    if name.is_null() {
        return false;
    }
    let Ok(name) = std::ffi::CStr::from_ptr(name).to_str() else {
        return false;
    };
    crate::engine()
        .map(|e| e.set_patch_enabled(name, enabled))
        .unwrap_or(false)
}

// Metadata exports

#[no_mangle]
pub extern "C" fn tamperveil_get_name() -> *const c_char {
    NAME.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn tamperveil_get_description() -> *const c_char {
    DESCRIPTION.as_ptr() as *const c_char
}

#[no_mangle]
pub extern "C" fn tamperveil_get_version() -> *const c_char {
    VERSION.as_ptr() as *const c_char
}

/// Standard DLL entry: defer the real work to a fresh thread, DllMain
/// runs under the loader lock.
#[cfg(windows)]
#[no_mangle]
pub unsafe extern "system" fn DllMain(
    _hinst: *mut c_void,
    reason: u32,
    _reserved: *mut c_void,
) -> i32 {
    use windows_sys::Win32::System::SystemServices::DLL_PROCESS_ATTACH;

    if reason == DLL_PROCESS_ATTACH {
        let _ = std::thread::Builder::new()
            .name("tamperveil-attach".into())
            .spawn(|| {
                if let Err(msg) = crate::attach() {
                    tracing::error!("Attach failed: {}", msg);
                }
            });
    }
    1
}

/// Helper to write an error message to a C buffer
///
/// # Safety
/// - `error` must be a valid pointer or null
/// - `maxlen` must accurately reflect the buffer size
unsafe fn write_error(error: *mut c_char, maxlen: usize, msg: &str) {
    if !error.is_null() && maxlen > 0 {
        let bytes = msg.as_bytes();
        let len = bytes.len().min(maxlen - 1);
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), error as *mut u8, len);
        *error.add(len) = 0;
    }
}
