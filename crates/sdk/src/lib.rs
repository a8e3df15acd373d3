//! tamperveil SDK - Target Engine Memory Layout Definitions
//!
//! This crate contains the `#[repr(C)]` layout structs and sentinel values
//! for the pieces of target-engine memory the patch engine reads or rewrites.
//! It has no dependencies and compiles quickly, allowing parallel compilation
//! of dependent crates.
//!
//! # Modules
//!
//! - [`layouts`] - In-memory record layouts observed in the target binary
//! - [`sentinels`] - Outcome values the integrity patches force

pub mod layouts;
pub mod sentinels;

pub use layouts::*;
pub use sentinels::*;
