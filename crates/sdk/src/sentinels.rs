//! Outcome values the integrity patches force
//!
//! These must match exactly what the target's check routines compare
//! against. Derived from observing the compiled binary, not from headers.

/// Value the cryptographic verification routine leaves in its outcome
/// register when a digest check passed.
pub const CRYPTO_VERIFY_PASSED: u64 = 1;

/// Value the archive load gate expects for "load permitted".
pub const PAK_LOAD_PERMITTED: u64 = 1;

/// Default seed the tamper indicator holds in an untouched process.
pub const INDICATOR_DEFAULT_SEED: u32 = 8;

/// Single-byte filler used when overwriting heap-planted code stubs
/// (`RET` on x86-64).
pub const STUB_FILL_BYTE: u8 = 0xC3;

/// Number of flat register slots a signature's operand index may name.
pub const REGISTER_SLOT_COUNT: usize = 16;
