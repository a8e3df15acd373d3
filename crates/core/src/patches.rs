//! Targeted integrity patches
//!
//! Each patch is a `(signature, register slot, neutralization policy)`
//! triple. The slot is data carried by the signature match, not a
//! hard-coded offset, so a rebuilt target that shuffles register
//! allocation only needs a signature-table update.
//!
//! Hook bodies run on arbitrary host threads at arbitrary program
//! points: register reads, one register write, nothing else. The only
//! synchronization they may touch is the overlay cache's reader lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tamperveil_engine::ScanHit;
use tamperveil_sdk::CRYPTO_VERIFY_PASSED;

use crate::hooks::MidHandler;
use crate::pak::PakOverlay;

/// How a patch neutralizes the value in its register slot
#[derive(Debug, Clone, Copy)]
pub enum Neutralization {
    /// Force the outcome register to a fixed sentinel
    ForceOutcome(u64),
    /// Copy `source` into the matched slot so a comparison never sees a
    /// difference
    MirrorSlot { source: usize },
    /// Rewrite the loader's patch-file count to include overlay files
    CorrectPatchCount,
}

/// One pattern-located mid-function patch
pub struct IntegrityPatch {
    /// Hook record name
    pub name: &'static str,
    /// Signature-database key that locates the hook point
    pub signature: &'static str,
    /// Register slot used when the signature entry carries none
    pub fallback_slot: usize,
    pub neutralization: Neutralization,
    /// Runtime toggle; the hook stays installed, a disabled patch just
    /// stops rewriting
    enabled: Arc<AtomicBool>,
}

impl IntegrityPatch {
    fn new(
        name: &'static str,
        signature: &'static str,
        fallback_slot: usize,
        neutralization: Neutralization,
    ) -> Self {
        Self {
            name,
            signature,
            fallback_slot,
            neutralization,
            enabled: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Shared handle to this patch's enable toggle
    pub fn toggle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.enabled)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Build the hook body for a resolved match.
    ///
    /// `overlay` backs the patch-count correction; the other policies
    /// never touch it.
    pub fn handler(&self, hit: ScanHit, overlay: Arc<PakOverlay>) -> MidHandler {
        let slot = hit.register_slot.unwrap_or(self.fallback_slot);
        let enabled = Arc::clone(&self.enabled);

        match self.neutralization {
            Neutralization::ForceOutcome(value) => Box::new(move |ctx| {
                if enabled.load(Ordering::Relaxed) {
                    ctx.set_reg(slot, value);
                }
            }),
            Neutralization::MirrorSlot { source } => Box::new(move |ctx| {
                if enabled.load(Ordering::Relaxed) {
                    ctx.set_reg(slot, ctx.reg(source));
                }
            }),
            Neutralization::CorrectPatchCount => Box::new(move |ctx| {
                if enabled.load(Ordering::Relaxed) {
                    let base = ctx.reg(slot);
                    ctx.set_reg(slot, overlay.corrected_patch_count(base));
                }
            }),
        }
    }
}

/// The patch set for the supported target.
///
/// - Cryptographic verification gate: the digest/signature check leaves
///   its outcome in the matched slot; force "passed".
/// - Archive-load gate: the loader compares the next patch index against
///   its discovered file count; feed it the corrected count.
/// - Version gate: the archive version is compared against the build's
///   expected value; mirror the expected register into the comparison.
pub fn standard_patches() -> Vec<IntegrityPatch> {
    vec![
        IntegrityPatch::new(
            "crypto_verify_gate",
            "crypto_verify_gate",
            14, // rax
            Neutralization::ForceOutcome(CRYPTO_VERIFY_PASSED),
        ),
        IntegrityPatch::new(
            "pak_load_gate",
            "pak_load_gate",
            14, // rax
            Neutralization::CorrectPatchCount,
        ),
        IntegrityPatch::new(
            "pak_version_gate",
            "pak_version_gate",
            13, // rbx, compared against r13
            Neutralization::MirrorSlot { source: 2 },
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::CpuContext;

    fn hit(slot: Option<usize>) -> ScanHit {
        ScanHit {
            address: 0x1000,
            register_slot: slot,
        }
    }

    fn dummy_overlay() -> Arc<PakOverlay> {
        Arc::new(PakOverlay::new("/nonexistent", true))
    }

    #[test]
    fn test_force_outcome_rewrites_matched_slot() {
        let patch = IntegrityPatch::new(
            "crypto",
            "crypto",
            14,
            Neutralization::ForceOutcome(CRYPTO_VERIFY_PASSED),
        );
        let handler = patch.handler(hit(Some(14)), dummy_overlay());

        let mut ctx = CpuContext {
            rax: 0xdead,
            ..Default::default()
        };
        handler(&mut ctx);
        assert_eq!(ctx.rax, CRYPTO_VERIFY_PASSED);
    }

    #[test]
    fn test_mirror_slot_erases_mismatch() {
        let patch = IntegrityPatch::new(
            "version",
            "version",
            13,
            Neutralization::MirrorSlot { source: 2 },
        );
        let handler = patch.handler(hit(Some(13)), dummy_overlay());

        let mut ctx = CpuContext {
            rbx: 21,  // version read from the archive
            r13: 34,  // version the build expects
            ..Default::default()
        };
        handler(&mut ctx);
        assert_eq!(ctx.rbx, 34, "comparison never observes a mismatch");
    }

    #[test]
    fn test_patch_count_correction_in_context() {
        let dir = std::env::temp_dir().join(format!("tamperveil_patchtest_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("data_000.pak.patch_0.pak"), b"x").unwrap();
        std::fs::write(dir.join("data_000.pak.patch_1.pak"), b"x").unwrap();

        let overlay = Arc::new(PakOverlay::new(&dir, true));
        let patch = IntegrityPatch::new(
            "pak_load",
            "pak_load",
            14,
            Neutralization::CorrectPatchCount,
        );
        let handler = patch.handler(hit(Some(14)), overlay);

        let mut ctx = CpuContext {
            rax: 3, // loader's own count
            ..Default::default()
        };
        handler(&mut ctx);
        assert_eq!(ctx.rax, 5);

        // The count was cached on first fire; it must not drift.
        let mut ctx2 = CpuContext {
            rax: 7,
            ..Default::default()
        };
        handler(&mut ctx2);
        assert_eq!(ctx2.rax, 5);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_disabled_patch_leaves_register_alone() {
        let patch = IntegrityPatch::new(
            "crypto",
            "crypto",
            14,
            Neutralization::ForceOutcome(CRYPTO_VERIFY_PASSED),
        );
        let handler = patch.handler(hit(Some(14)), dummy_overlay());

        patch.set_enabled(false);
        let mut ctx = CpuContext {
            rax: 0xdead,
            ..Default::default()
        };
        handler(&mut ctx);
        assert_eq!(ctx.rax, 0xdead);

        patch.set_enabled(true);
        handler(&mut ctx);
        assert_eq!(ctx.rax, CRYPTO_VERIFY_PASSED);
    }

    #[test]
    fn test_fallback_slot_used_without_signature_slot() {
        let patch = IntegrityPatch::new(
            "crypto",
            "crypto",
            14,
            Neutralization::ForceOutcome(CRYPTO_VERIFY_PASSED),
        );
        let handler = patch.handler(hit(None), dummy_overlay());

        let mut ctx = CpuContext::default();
        handler(&mut ctx);
        assert_eq!(ctx.rax, CRYPTO_VERIFY_PASSED);
    }

    #[test]
    fn test_standard_patch_set() {
        let patches = standard_patches();
        assert_eq!(patches.len(), 3);
        assert!(patches.iter().all(|p| p.is_enabled()));
    }
}
