//! tamperveil Engine - Host Binary Introspection
//!
//! This crate handles the read-only view of the process we are injected
//! into:
//! - Resolving the executable module's base address and size
//! - The named signature database and wildcard byte-pattern scanner
//! - The symbol-resolution oracle seam used for crash/exit annotation
//!
//! # Architecture
//!
//! The host module is resolved once, early, via [`module::host_module`].
//! Signatures are loaded from JSON ([`signatures::SignatureDb`]) and
//! resolved against the module by a [`Scanner`]. A scan miss is never an
//! error at this layer; callers decide what a missing address disables.

pub mod error;
pub mod module;
pub mod signatures;
pub mod symbols;

pub use error::ScanError;
pub use module::{host_module, HostModule};
pub use signatures::{ModuleScanner, ScanHit, Scanner, SignatureDb, SignatureEntry};
pub use symbols::{annotate_address, SymbolResolver};
