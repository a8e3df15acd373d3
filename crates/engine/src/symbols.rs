//! Symbol-resolution oracle seam
//!
//! Crash and exit paths annotate raw addresses with human-readable names.
//! The oracle itself is built elsewhere (type database, PDB, whatever the
//! deployment has); this crate only defines the contract and the fallback
//! formatting when no oracle is registered.

/// Read-only address-to-name oracle
pub trait SymbolResolver: Send + Sync {
    /// Best-effort name for `address`, or `None` if unknown
    fn resolve(&self, address: usize) -> Option<String>;
}

impl<F> SymbolResolver for F
where
    F: Fn(usize) -> Option<String> + Send + Sync,
{
    fn resolve(&self, address: usize) -> Option<String> {
        self(address)
    }
}

/// Format an address for a log line, with the symbol name when available
pub fn annotate_address(resolver: Option<&dyn SymbolResolver>, address: usize) -> String {
    match resolver.and_then(|r| r.resolve(address)) {
        Some(name) => format!("{:#x} ({})", address, name),
        None => format!("{:#x}", address),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotate_with_oracle() {
        let oracle = |addr: usize| (addr == 0x1000).then(|| "check_digest".to_string());
        assert_eq!(
            annotate_address(Some(&oracle), 0x1000),
            "0x1000 (check_digest)"
        );
        assert_eq!(annotate_address(Some(&oracle), 0x2000), "0x2000");
    }

    #[test]
    fn test_annotate_without_oracle() {
        assert_eq!(annotate_address(None, 0xdead), "0xdead");
    }
}
