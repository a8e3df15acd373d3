//! Signature database and byte-pattern scanning
//!
//! Check routines move between builds of the target, so every patch site
//! is located by wildcard byte pattern instead of static offset. Patterns
//! are loaded from a JSON file deployed next to the library (and fall back
//! to the built-in set), so they can be updated without recompiling.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;

use crate::error::ScanError;
use crate::module::HostModule;

/// Signatures shipped with the library, overridable from disk.
///
/// `register_slot` names the flat register slot (hook-context order) that
/// carries the value the dependent patch must read or rewrite.
const DEFAULT_SIGNATURES: &str = r#"{
    "crypto_verify_gate": {
        "pattern": "E8 ? ? ? ? 85 C0 0F 85 ? ? ? ? 48 8B 8D",
        "register_slot": 14
    },
    "pak_load_gate": {
        "pattern": "44 39 6D ? 0F 8C ? ? ? ? 41 8B C5",
        "register_slot": 14
    },
    "pak_version_gate": {
        "pattern": "41 3B DD 0F 85 ? ? ? ? 48 8B 4C 24",
        "register_slot": 13
    },
    "pak_open_path": {
        "pattern": "48 8B D6 48 8D 4C 24 ? E8 ? ? ? ? 90",
        "register_slot": 11
    },
    "tamper_indicator": {
        "pattern": "89 05 ? ? ? ? 48 83 C4 28 C3 CC"
    }
}"#;

/// One named pattern, with the operand slot the match is bound to
#[derive(Debug, Clone, Deserialize)]
pub struct SignatureEntry {
    /// Hex bytes separated by spaces, `?`/`??` for wildcards
    pub pattern: String,
    /// Flat register slot index associated with the matched site
    #[serde(default)]
    pub register_slot: Option<usize>,
}

/// A resolved signature: where it matched and which register it names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScanHit {
    pub address: usize,
    pub register_slot: Option<usize>,
}

/// The pattern-lookup collaborator consumed by the patch engine.
///
/// A `None` result is a plain scan miss; it disables only the patch that
/// depends on the named signature, never the engine.
pub trait Scanner: Send + Sync {
    fn find(&self, name: &str) -> Option<ScanHit>;
}

/// Named signature table
#[derive(Debug, Default)]
pub struct SignatureDb {
    signatures: HashMap<String, SignatureEntry>,
}

impl SignatureDb {
    /// The signature set compiled into the library
    pub fn builtin() -> Self {
        // The embedded set is validated by tests; a parse failure here is
        // a build defect, not a runtime condition.
        Self::load_from_str(DEFAULT_SIGNATURES).unwrap_or_default()
    }

    /// Load signatures from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ScanError> {
        let content = std::fs::read_to_string(path)?;
        Self::load_from_str(&content)
    }

    /// Load signatures from a JSON string
    pub fn load_from_str(json: &str) -> Result<Self, ScanError> {
        let signatures: HashMap<String, SignatureEntry> = serde_json::from_str(json)?;

        tracing::info!("Loaded signature table: {} entries", signatures.len());

        Ok(Self { signatures })
    }

    /// Get a signature entry by name
    pub fn get(&self, name: &str) -> Result<&SignatureEntry, ScanError> {
        self.signatures
            .get(name)
            .ok_or_else(|| ScanError::UnknownSignature(name.to_string()))
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}

/// Parse a signature pattern string into bytes
///
/// Supports:
/// - Hex bytes: "55 48 89 E5"
/// - Wildcards: "55 ? 89 E5" or "55 ?? 89 E5"
pub fn parse_pattern(pattern: &str) -> Result<Vec<Option<u8>>, ScanError> {
    let mut result = Vec::new();

    for part in pattern.split_whitespace() {
        if part == "?" || part == "??" {
            result.push(None); // Wildcard
        } else {
            let byte = u8::from_str_radix(part, 16)
                .map_err(|_| ScanError::InvalidPattern(format!("Invalid hex byte: {}", part)))?;
            result.push(Some(byte));
        }
    }

    if result.is_empty() {
        return Err(ScanError::InvalidPattern(
            "Empty signature pattern".to_string(),
        ));
    }

    Ok(result)
}

/// Scan a byte slice for a pattern, returning the offset of the first match
pub fn scan_bytes(haystack: &[u8], pattern: &[Option<u8>]) -> Option<usize> {
    if pattern.is_empty() || haystack.len() < pattern.len() {
        return None;
    }

    let end = haystack.len() - pattern.len();

    'outer: for offset in 0..=end {
        for (i, expected) in pattern.iter().enumerate() {
            if let Some(byte) = expected {
                if haystack[offset + i] != *byte {
                    continue 'outer;
                }
            }
        }
        // All bytes matched
        return Some(offset);
    }

    None
}

/// Scanner over a resolved module image
pub struct ModuleScanner {
    module: HostModule,
    db: SignatureDb,
}

impl ModuleScanner {
    pub fn new(module: HostModule, db: SignatureDb) -> Self {
        Self { module, db }
    }
}

impl Scanner for ModuleScanner {
    fn find(&self, name: &str) -> Option<ScanHit> {
        let entry = match self.db.get(name) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Signature lookup failed: {}", e);
                return None;
            }
        };

        let pattern = match parse_pattern(&entry.pattern) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!("Signature '{}' unusable: {}", name, e);
                return None;
            }
        };

        // SAFETY: the module range was resolved from the loader and stays
        // mapped for the process's life.
        let haystack = unsafe { self.module.bytes() };

        match scan_bytes(haystack, &pattern) {
            Some(offset) => {
                let address = self.module.base() + offset;
                tracing::debug!("Signature '{}' matched at {:#x}", name, address);
                Some(ScanHit {
                    address,
                    register_slot: entry.register_slot,
                })
            }
            None => {
                tracing::warn!("Signature '{}' not found in host module", name);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pattern() {
        let pattern = parse_pattern("55 48 89 E5").unwrap();
        assert_eq!(
            pattern,
            vec![Some(0x55), Some(0x48), Some(0x89), Some(0xE5)]
        );

        let pattern = parse_pattern("55 ? 89 ??").unwrap();
        assert_eq!(pattern, vec![Some(0x55), None, Some(0x89), None]);
    }

    #[test]
    fn test_parse_pattern_rejects_junk() {
        assert!(parse_pattern("").is_err());
        assert!(parse_pattern("GG 00").is_err());
    }

    #[test]
    fn test_scan_bytes() {
        let data = [0x00, 0x55, 0x48, 0x89, 0xE5, 0x00];
        let pattern = vec![Some(0x55), Some(0x48), Some(0x89), Some(0xE5)];

        assert_eq!(scan_bytes(&data, &pattern), Some(1));
    }

    #[test]
    fn test_scan_bytes_with_wildcard() {
        let data = [0x00, 0x55, 0xFF, 0x89, 0xE5, 0x00];
        let pattern = vec![Some(0x55), None, Some(0x89), Some(0xE5)];

        assert_eq!(scan_bytes(&data, &pattern), Some(1));
    }

    #[test]
    fn test_scan_bytes_no_match() {
        let data = [0x00, 0x11, 0x22];
        let pattern = vec![Some(0x55)];
        assert_eq!(scan_bytes(&data, &pattern), None);
    }

    #[test]
    fn test_builtin_signatures_parse() {
        let db = SignatureDb::builtin();
        assert!(!db.is_empty());

        let entry = db.get("crypto_verify_gate").unwrap();
        assert!(parse_pattern(&entry.pattern).is_ok());
        assert!(entry.register_slot.is_some());

        // The indicator signature names a cell, not a register rewrite.
        let indicator = db.get("tamper_indicator").unwrap();
        assert!(indicator.register_slot.is_none());
    }

    #[test]
    fn test_module_scanner_hit_and_miss() {
        // Back the "module" with a leaked buffer so the base address is
        // stable for the scanner.
        let data: &'static [u8] = Box::leak(Box::new([0x90u8, 0x44, 0x39, 0x6D, 0x10, 0xCC]));
        let module = HostModule::from_raw(data.as_ptr() as usize, data.len());

        let db = SignatureDb::load_from_str(
            r#"{
                "present": { "pattern": "44 39 6D ?", "register_slot": 2 },
                "absent": { "pattern": "DE AD BE EF" }
            }"#,
        )
        .unwrap();

        let scanner = ModuleScanner::new(module, db);

        let hit = scanner.find("present").unwrap();
        assert_eq!(hit.address, data.as_ptr() as usize + 1);
        assert_eq!(hit.register_slot, Some(2));

        assert!(scanner.find("absent").is_none());
        assert!(scanner.find("unlisted").is_none());
    }
}
