//! PAK directory overlay
//!
//! The target loads its data archives sequentially: `data_000.pak`, then
//! every `data_000.pak.patch_<N>.pak` up to the count its loader
//! discovered. The overlay extends that sequence with files dropped into
//! `pak_mods/`: the loader's patch-file count is corrected upward and
//! open requests for indices we carry are redirected to the override
//! file.
//!
//! The directory is scanned exactly once, on the first request that
//! needs it; everything after that is served from the cache.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use regex::Regex;

use crate::error::EngineError;
use crate::hooks::MidHandler;

/// Directory scanned for override archives, relative to the game root
pub const PAK_MODS_DIR_NAME: &str = "pak_mods";

/// Base archive the patch sequence hangs off
pub const BASE_PAK_NAME: &str = "data_000.pak";

/// One discovered override file
pub struct OverlayEntry {
    pub patch_index: u32,
    pub path: PathBuf,
    /// Nul-terminated UTF-16 rendering of `path`, kept alive so the
    /// file-open hook can hand its pointer to the loader.
    wide: Vec<u16>,
}

impl OverlayEntry {
    pub fn wide_ptr(&self) -> *const u16 {
        self.wide.as_ptr()
    }
}

/// Override-archive index for the mod directory
pub struct PakOverlay {
    dir: PathBuf,
    /// The `load_pak_directory` toggle; consulted inside hook bodies
    enabled: AtomicBool,
    pattern: Option<Regex>,
    /// Discovered entries, sorted by patch index; `None` until the first
    /// scan. Reset only by an explicit cache reset.
    index: RwLock<Option<Vec<OverlayEntry>>>,
    /// Corrected patch-file count, computed once and reused
    corrected: RwLock<Option<u64>>,
}

impl PakOverlay {
    pub fn new<P: Into<PathBuf>>(dir: P, enabled: bool) -> Self {
        // Built from a literal name; failure would mean no overlay file
        // ever matches, which degrades to an empty index.
        let pattern = Regex::new(&format!(
            r"^{}\.patch_(\d+)\.pak$",
            regex::escape(BASE_PAK_NAME)
        ))
        .ok();

        Self {
            dir: dir.into(),
            enabled: AtomicBool::new(enabled),
            pattern,
            index: RwLock::new(None),
            corrected: RwLock::new(None),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    /// Runtime toggle backing the UI switch. Disabling is behavioral:
    /// installed hooks stay, their bodies skip the redirect.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    /// Extract the patch index from an override file name
    pub fn parse_patch_index(&self, file_name: &str) -> Option<u32> {
        self.pattern
            .as_ref()?
            .captures(file_name)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse().ok())
    }

    fn ensure_cached(&self) {
        if self.index.read().is_some() {
            return;
        }

        let mut entries = self.scan_directory();
        entries.sort_by(|a, b| a.patch_index.cmp(&b.patch_index).then(a.path.cmp(&b.path)));

        let mut index = self.index.write();
        if index.is_none() {
            tracing::info!(
                "Indexed {} override pak(s) under {:?}",
                entries.len(),
                self.dir
            );
            *index = Some(entries);
        }
    }

    fn scan_directory(&self) -> Vec<OverlayEntry> {
        let read_dir = match std::fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) => {
                tracing::debug!("No override directory at {:?}: {}", self.dir, e);
                return Vec::new();
            }
        };

        let mut entries = Vec::new();
        for item in read_dir.flatten() {
            let path = item.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            match self.parse_patch_index(name) {
                Some(patch_index) => {
                    let wide: Vec<u16> = path
                        .to_string_lossy()
                        .encode_utf16()
                        .chain(std::iter::once(0))
                        .collect();
                    entries.push(OverlayEntry {
                        patch_index,
                        path,
                        wide,
                    });
                }
                None => {
                    tracing::debug!("{}", EngineError::PathParse(name.to_string()));
                }
            }
        }
        entries
    }

    /// Number of override files discovered (0 while disabled)
    pub fn overlay_count(&self) -> u64 {
        if !self.is_enabled() {
            return 0;
        }
        self.ensure_cached();
        self.index.read().as_ref().map_or(0, |e| e.len()) as u64
    }

    /// Correct the loader's own patch-file count so sequential loading
    /// continues past the legitimate files into the overlay.
    ///
    /// Computed once from the first observed base count and reused; the
    /// loader asks repeatedly but the answer must not drift.
    pub fn corrected_patch_count(&self, base_count: u64) -> u64 {
        if let Some(cached) = *self.corrected.read() {
            return cached;
        }

        let corrected = base_count + self.overlay_count();
        let mut slot = self.corrected.write();
        *slot.get_or_insert(corrected)
    }

    /// Override path for a requested patch index, if we carry one
    pub fn redirect(&self, patch_index: u32) -> Option<PathBuf> {
        self.entry_lookup(patch_index, |e| e.path.clone())
    }

    /// Stable UTF-16 pointer for the hook body's register rewrite
    pub fn redirect_wide(&self, patch_index: u32) -> Option<*const u16> {
        self.entry_lookup(patch_index, |e| e.wide_ptr())
    }

    /// Override decision for a full requested path: redirect only when
    /// the name parses and the index is in the overlay set.
    pub fn redirect_for_path(&self, requested: &Path) -> Option<PathBuf> {
        let name = requested.file_name()?.to_str()?;
        let patch_index = self.parse_patch_index(name)?;
        self.redirect(patch_index)
    }

    fn entry_lookup<T>(&self, patch_index: u32, f: impl Fn(&OverlayEntry) -> T) -> Option<T> {
        if !self.is_enabled() {
            return None;
        }
        self.ensure_cached();
        self.index
            .read()
            .as_ref()?
            .iter()
            .find(|e| e.patch_index == patch_index)
            .map(f)
    }

    /// Like [`Self::redirect_for_path`], but yields the cached UTF-16
    /// pointer the hook body writes into the path register.
    pub fn redirect_wide_for_path(&self, requested: &Path) -> Option<*const u16> {
        let name = requested.file_name()?.to_str()?;
        let patch_index = self.parse_patch_index(name)?;
        self.redirect_wide(patch_index)
    }

    /// Drop the cached index and count. Not exercised by normal
    /// operation; the next request re-scans.
    pub fn reset_cache(&self) {
        *self.index.write() = None;
        *self.corrected.write() = None;
    }
}

/// Build the file-open hook body.
///
/// At the hooked point `slot` carries a pointer to the UTF-16 path the
/// loader is about to open. Requests for a patch index the overlay
/// carries get the register rewritten to the override file's path; every
/// other request is left untouched.
pub fn open_redirect_handler(overlay: Arc<PakOverlay>, slot: usize) -> MidHandler {
    Box::new(move |ctx| {
        if !overlay.is_enabled() {
            return;
        }

        let ptr = ctx.reg(slot) as *const u16;
        // SAFETY: the loader put a nul-terminated path here; the read is
        // length-capped regardless.
        let Some(requested) = (unsafe { read_wide_path(ptr) }) else {
            return;
        };

        if let Some(wide) = overlay.redirect_wide_for_path(Path::new(&requested)) {
            tracing::debug!("Redirecting archive open: {}", requested);
            ctx.set_reg(slot, wide as u64);
        }
    })
}

/// Bounded read of a nul-terminated UTF-16 string
unsafe fn read_wide_path(ptr: *const u16) -> Option<String> {
    const CAP: usize = 1024;

    if ptr.is_null() {
        return None;
    }

    let mut len = 0;
    while len < CAP && *ptr.add(len) != 0 {
        len += 1;
    }
    if len == 0 || len == CAP {
        return None;
    }

    Some(String::from_utf16_lossy(std::slice::from_raw_parts(
        ptr, len,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_overlay_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "tamperveil_pak_{}_{}",
            tag,
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn touch(dir: &Path, name: &str) {
        std::fs::write(dir.join(name), b"pak").unwrap();
    }

    #[test]
    fn test_parse_patch_index() {
        let overlay = PakOverlay::new("unused", true);

        assert_eq!(
            overlay.parse_patch_index("data_000.pak.patch_7.pak"),
            Some(7)
        );
        assert_eq!(
            overlay.parse_patch_index("data_000.pak.patch_42.pak"),
            Some(42)
        );
        assert_eq!(overlay.parse_patch_index("data_000.pak.patch_x.pak"), None);
        assert_eq!(overlay.parse_patch_index("data_001.pak.patch_3.pak"), None);
        assert_eq!(overlay.parse_patch_index("readme.txt"), None);
    }

    #[test]
    fn test_count_correction_and_redirect() {
        let dir = temp_overlay_dir("count");
        touch(&dir, "data_000.pak.patch_0.pak");
        touch(&dir, "data_000.pak.patch_1.pak");
        touch(&dir, "data_000.pak.patch_3.pak");
        touch(&dir, "notes.txt"); // parse failure, skipped

        let overlay = PakOverlay::new(&dir, true);

        // Base install carries 2 patch files; overlay adds 3.
        assert_eq!(overlay.corrected_patch_count(2), 5);

        // Index 1 is in the overlay set, index 2 is not.
        let hit = overlay.redirect(1).unwrap();
        assert!(hit.ends_with("data_000.pak.patch_1.pak"));
        assert_eq!(overlay.redirect(2), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_cache_is_stable_until_reset() {
        let dir = temp_overlay_dir("cache");
        touch(&dir, "data_000.pak.patch_0.pak");

        let overlay = PakOverlay::new(&dir, true);
        assert_eq!(overlay.overlay_count(), 1);
        assert_eq!(overlay.corrected_patch_count(2), 3);

        // New files after the first scan are invisible...
        touch(&dir, "data_000.pak.patch_1.pak");
        assert_eq!(overlay.overlay_count(), 1);
        assert_eq!(overlay.corrected_patch_count(2), 3);
        // ...and the count answer ignores a drifting base too.
        assert_eq!(overlay.corrected_patch_count(99), 3);

        // Only an explicit reset re-scans.
        overlay.reset_cache();
        assert_eq!(overlay.overlay_count(), 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_disabled_overlay_is_inert() {
        let dir = temp_overlay_dir("disabled");
        touch(&dir, "data_000.pak.patch_0.pak");

        let overlay = PakOverlay::new(&dir, false);
        assert_eq!(overlay.overlay_count(), 0);
        assert_eq!(overlay.redirect(0), None);

        overlay.set_enabled(true);
        assert_eq!(overlay.overlay_count(), 1);
        assert!(overlay.redirect(0).is_some());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_redirect_for_path() {
        let dir = temp_overlay_dir("bypath");
        touch(&dir, "data_000.pak.patch_5.pak");

        let overlay = PakOverlay::new(&dir, true);

        let requested = Path::new("D:/game/data_000.pak.patch_5.pak");
        assert!(overlay.redirect_for_path(requested).is_some());

        let untouched = Path::new("D:/game/data_000.pak.patch_6.pak");
        assert_eq!(overlay.redirect_for_path(untouched), None);

        let junk = Path::new("D:/game/shader_cache.bin");
        assert_eq!(overlay.redirect_for_path(junk), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_directory_yields_empty_overlay() {
        let overlay = PakOverlay::new("/definitely/not/here", true);
        assert_eq!(overlay.overlay_count(), 0);
        assert_eq!(overlay.corrected_patch_count(4), 4);
    }

    #[test]
    fn test_open_redirect_handler_rewrites_register() {
        use crate::hooks::CpuContext;

        let dir = temp_overlay_dir("openhook");
        touch(&dir, "data_000.pak.patch_2.pak");

        let overlay = Arc::new(PakOverlay::new(&dir, true));
        let handler = open_redirect_handler(Arc::clone(&overlay), 11);

        // Loader requests overlay-carried index 2: register rewritten.
        let requested: Vec<u16> = "D:/game/data_000.pak.patch_2.pak"
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let mut ctx = CpuContext {
            rdx: requested.as_ptr() as u64,
            ..Default::default()
        };
        handler(&mut ctx);
        assert_eq!(ctx.rdx, overlay.redirect_wide(2).unwrap() as u64);

        // Index not carried by the overlay: untouched.
        let other: Vec<u16> = "D:/game/data_000.pak.patch_9.pak"
            .encode_utf16()
            .chain(std::iter::once(0))
            .collect();
        let mut ctx = CpuContext {
            rdx: other.as_ptr() as u64,
            ..Default::default()
        };
        handler(&mut ctx);
        assert_eq!(ctx.rdx, other.as_ptr() as u64);

        // Disabled toggle: untouched even for carried indices.
        overlay.set_enabled(false);
        let mut ctx = CpuContext {
            rdx: requested.as_ptr() as u64,
            ..Default::default()
        };
        handler(&mut ctx);
        assert_eq!(ctx.rdx, requested.as_ptr() as u64);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
