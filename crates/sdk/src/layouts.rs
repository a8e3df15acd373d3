//! In-memory record layouts observed in the target binary
//!
//! These structs mirror what the target engine keeps in memory at the
//! addresses our signatures resolve. They are static data definitions only;
//! all behavior lives in `tamperveil-core`.

use std::ffi::c_void;

/// The anti-tamper heartbeat cell.
///
/// The engine's own integrity logic keeps `value` non-zero while it is
/// satisfied; it drops to zero when an anomaly has been detected (or
/// injected). `generation` increments each time the cell is re-seeded.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TamperIndicator {
    pub value: u32,
    pub generation: u32,
}

/// Archive open request block passed through the loader's file path stage.
///
/// At the hooked point the path pointer sits in the register slot named by
/// the signature; this struct describes the block that register points at.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct PakOpenRequest {
    /// UTF-16 path the loader is about to open.
    pub path: *const u16,
    /// Sequential patch index the loader derived from the path.
    pub patch_index: i32,
    pub flags: u32,
}

/// Version record compared by the version-check gate.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PakVersionBlock {
    pub major: u32,
    pub minor: u32,
    pub build: u32,
    pub reserved: u32,
}

/// Descriptor of a heap-resident code stub the anti-debug logic emits.
///
/// When the tamper indicator trips, the engine has already planted one of
/// these; the watcher overwrites `code` with benign filler.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct HeapCodeStub {
    pub code: *mut c_void,
    pub len: usize,
}

/// The anomaly record the target's anti-tamper logic maintains.
///
/// The indicator cell is immediately followed by the descriptor of the
/// code stub planted for the current anomaly; the descriptor is null
/// while no anomaly is pending.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AnomalyRecord {
    pub indicator: TamperIndicator,
    pub stub: HeapCodeStub,
}

// These layouts are ABI contracts with the target binary; keep them honest.
const _: () = assert!(std::mem::size_of::<TamperIndicator>() == 8);
const _: () = assert!(std::mem::size_of::<PakVersionBlock>() == 16);
