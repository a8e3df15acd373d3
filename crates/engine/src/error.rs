//! Error types for host-binary introspection

/// Error type for signature database and scanning operations
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// Failed to read the signature file from disk
    #[error("Failed to read signature file: {0}")]
    Io(#[from] std::io::Error),

    /// Signature file was not valid JSON
    #[error("Failed to parse signature JSON: {0}")]
    Parse(#[from] serde_json::Error),

    /// Named signature missing from the database
    #[error("Signature not found: {0}")]
    UnknownSignature(String),

    /// Pattern string contained something other than hex bytes and wildcards
    #[error("Invalid signature pattern: {0}")]
    InvalidPattern(String),

    /// The executable module could not be resolved
    #[error("Host module not resolved")]
    ModuleUnavailable,
}
