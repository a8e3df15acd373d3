//! Engine context
//!
//! One owned object holds every component's state: hook records,
//! concealed regions, the VEH gate, the overlay cache, the watcher
//! handle. It is constructed once at injection, shared by `Arc`, and
//! lives until the process exits; nothing in the engine reaches state
//! through globals.
//!
//! `install_all` is the single locating/activating pass. Ordering
//! matters: the protection shim and VEH gate go in first so the patches
//! installed after them are concealed from the moment they exist; the
//! watcher starts last because its cell address falls out of the same
//! scan pass.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use tamperveil_engine::{Scanner, SymbolResolver};

use crate::config::{self, EngineConfig};
use crate::error::EngineError;
use crate::exit::ExitObserver;
use crate::hooks::{HookBackend, HookTable};
use crate::pak::{self, PakOverlay};
use crate::patches::{standard_patches, IntegrityPatch};
use crate::protect::{Protection, RegionTable};
use crate::veh::VehGate;
use crate::watcher::{self, MemoryIndicator, Watcher, WatcherHandle};

/// Bytes a mid-hook stub rewrites at its target; the whole span is
/// registered for concealment before the write happens.
const PATCH_SITE_LEN: usize = 16;

/// Outcome of the single install pass
#[derive(Debug, Default)]
pub struct InstallReport {
    /// Hooks in installed state after the pass
    pub installed: usize,
    /// Hooks whose installation was refused
    pub failed: usize,
    /// Patches disabled by a signature miss
    pub missed: Vec<&'static str>,
    /// Whether the anti-debug watcher thread is running
    pub watcher_running: bool,
    /// False when this call was a no-op repeat
    pub first_pass: bool,
}

/// The engine: every component's state, process-wide lifetime
pub struct Engine {
    config: EngineConfig,
    backend: Arc<dyn HookBackend>,
    scanner: Arc<dyn Scanner>,

    hooks: HookTable,
    regions: RegionTable,
    veh: VehGate,
    overlay: Arc<PakOverlay>,
    exit: ExitObserver,
    patches: Vec<IntegrityPatch>,

    resolver: RwLock<Option<Arc<dyn SymbolResolver>>>,
    watcher: Mutex<Option<WatcherHandle>>,
    installed: AtomicBool,

    #[cfg(windows)]
    pristine: RwLock<Option<Arc<crate::protect::os::PristineProtect>>>,
}

impl Engine {
    /// Build an engine with the default overlay location (`pak_mods/`
    /// next to the host executable).
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn HookBackend>,
        scanner: Arc<dyn Scanner>,
    ) -> Arc<Self> {
        let overlay_dir = config::pak_mods_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from(pak::PAK_MODS_DIR_NAME));
        Self::with_overlay_dir(config, backend, scanner, overlay_dir)
    }

    /// Build an engine with an explicit overlay directory
    pub fn with_overlay_dir<P: Into<std::path::PathBuf>>(
        config: EngineConfig,
        backend: Arc<dyn HookBackend>,
        scanner: Arc<dyn Scanner>,
        overlay_dir: P,
    ) -> Arc<Self> {
        let overlay = Arc::new(PakOverlay::new(overlay_dir, config.load_pak_directory));

        Arc::new(Self {
            config,
            backend,
            scanner,
            hooks: HookTable::new(),
            regions: RegionTable::new(),
            veh: VehGate::new(),
            overlay,
            exit: ExitObserver::new(),
            patches: standard_patches(),
            resolver: RwLock::new(None),
            watcher: Mutex::new(None),
            installed: AtomicBool::new(false),
            #[cfg(windows)]
            pristine: RwLock::new(None),
        })
    }

    /// One pass of locating and activating every hook. Reload paths in
    /// the host may call this again; repeats are no-ops.
    pub fn install_all(self: &Arc<Self>) -> InstallReport {
        if self.installed.swap(true, Ordering::SeqCst) {
            tracing::info!("Engine already installed; ignoring repeat initialization");
            return InstallReport {
                installed: self.hooks.installed_count(),
                failed: self.hooks.failed_count(),
                missed: Vec::new(),
                watcher_running: self.watcher.lock().is_some(),
                first_pass: false,
            };
        }

        // Concealment must be live before anything below modifies code.
        self.install_os_layer();

        let mut missed = Vec::new();

        for patch in &self.patches {
            match self.scanner.find(patch.signature) {
                Some(hit) => {
                    // Register the range first so the shim answers for it
                    // from the moment the bytes change.
                    self.regions.register(
                        hit.address,
                        PATCH_SITE_LEN,
                        Protection::READ | Protection::EXECUTE,
                    );

                    let handler = patch.handler(hit, Arc::clone(&self.overlay));
                    let result = unsafe {
                        self.hooks
                            .install_mid(&*self.backend, patch.name, hit.address, handler)
                    };
                    if let Err(e) = result {
                        tracing::error!(
                            "{}",
                            EngineError::HookInstall {
                                name: patch.name.to_string(),
                                source: e,
                            }
                        );
                    }
                }
                None => {
                    tracing::warn!("{}", EngineError::ScanMiss(patch.signature.to_string()));
                    missed.push(patch.name);
                }
            }
        }

        self.install_pak_redirect(&mut missed);
        let watcher_running = self.start_watcher(&mut missed);

        let report = InstallReport {
            installed: self.hooks.installed_count(),
            failed: self.hooks.failed_count(),
            missed,
            watcher_running,
            first_pass: true,
        };
        tracing::info!(
            "Install pass complete: {} hooks active, {} failed, {} signatures missed",
            report.installed,
            report.failed,
            report.missed.len()
        );
        report
    }

    fn install_pak_redirect(self: &Arc<Self>, missed: &mut Vec<&'static str>) {
        if !self.config.load_pak_directory {
            tracing::debug!("PAK directory overlay disabled by configuration");
            return;
        }

        match self.scanner.find("pak_open_path") {
            Some(hit) => {
                let slot = hit.register_slot.unwrap_or(11);
                self.regions.register(
                    hit.address,
                    PATCH_SITE_LEN,
                    Protection::READ | Protection::EXECUTE,
                );
                let handler = pak::open_redirect_handler(Arc::clone(&self.overlay), slot);
                let result = unsafe {
                    self.hooks
                        .install_mid(&*self.backend, "pak_open_redirect", hit.address, handler)
                };
                if let Err(e) = result {
                    tracing::error!(
                        "{}",
                        EngineError::HookInstall {
                            name: "pak_open_redirect".to_string(),
                            source: e,
                        }
                    );
                }
            }
            None => {
                tracing::warn!("{}", EngineError::ScanMiss("pak_open_path".to_string()));
                missed.push("pak_open_redirect");
            }
        }
    }

    /// idle -> running: only happens when the indicator scan resolves.
    fn start_watcher(self: &Arc<Self>, missed: &mut Vec<&'static str>) -> bool {
        let Some(hit) = self.scanner.find("tamper_indicator") else {
            tracing::warn!("{}", EngineError::ScanMiss("tamper_indicator".to_string()));
            missed.push("anti_debug_watcher");
            return false;
        };

        // SAFETY: the hit lands on the store instruction that keeps the
        // indicator alive; the record it targets stays mapped.
        let record = unsafe { watcher::resolve_anomaly_record(hit.address) };
        let record_addr = record as usize;

        let source = unsafe {
            MemoryIndicator::new(std::ptr::addr_of_mut!((*record).indicator))
        };
        let on_trigger = Box::new(move |_seed: u32| {
            let record = record_addr as *mut tamperveil_sdk::AnomalyRecord;
            if let Some(stub) = unsafe { watcher::pending_stub(record) } {
                unsafe { watcher::defuse_heap_stub(stub) };
            }
        });

        let interval = Duration::from_millis(self.config.watcher_interval_ms.max(1));
        match watcher::spawn(Watcher::new(source, on_trigger), interval) {
            Ok(handle) => {
                *self.watcher.lock() = Some(handle);
                true
            }
            Err(e) => {
                tracing::error!("Failed to start anti-debug watcher: {}", e);
                false
            }
        }
    }

    #[cfg(windows)]
    fn install_os_layer(self: &Arc<Self>) {
        use crate::{exit, protect, veh};

        match protect::os::PristineProtect::setup() {
            Some(p) => *self.pristine.write() = Some(p),
            None => {
                tracing::error!(
                    "{}",
                    EngineError::Initialization("pristine protection path unavailable".into())
                );
                return;
            }
        }

        // Handlers capture the engine Arc; the resulting cycle is the
        // intended process-lifetime ownership.
        let os_hooks: [(&str, &str, &str, crate::hooks::DetourHandler); 4] = [
            (
                "virtual_protect",
                "kernel32.dll",
                "VirtualProtect",
                protect::os::virtual_protect_handler(self),
            ),
            (
                "nt_protect_virtual_memory",
                "ntdll.dll",
                "NtProtectVirtualMemory",
                protect::os::nt_protect_handler(self),
            ),
            (
                "add_vectored_exception_handler",
                "kernel32.dll",
                "AddVectoredExceptionHandler",
                veh::os::add_veh_handler(self),
            ),
            (
                "rtl_exit_user_process",
                "ntdll.dll",
                "RtlExitUserProcess",
                exit::os::exit_handler(self),
            ),
        ];

        for (name, module, symbol, handler) in os_hooks {
            let Some(target) = protect::os::resolve(module, symbol) else {
                tracing::error!("Could not resolve {}!{}", module, symbol);
                continue;
            };
            let result = unsafe {
                self.hooks
                    .install_detour(&*self.backend, name, target, handler)
            };
            if let Err(e) = result {
                tracing::error!(
                    "{}",
                    EngineError::HookInstall {
                        name: name.to_string(),
                        source: e,
                    }
                );
            }
        }
    }

    #[cfg(not(windows))]
    fn install_os_layer(self: &Arc<Self>) {
        tracing::debug!("OS interception layer unavailable on this platform");
    }

    // Component access

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn hooks(&self) -> &HookTable {
        &self.hooks
    }

    pub fn regions(&self) -> &RegionTable {
        &self.regions
    }

    pub fn veh(&self) -> &VehGate {
        &self.veh
    }

    pub fn overlay(&self) -> &Arc<PakOverlay> {
        &self.overlay
    }

    pub fn exit_observer(&self) -> &ExitObserver {
        &self.exit
    }

    #[cfg(windows)]
    pub fn pristine(&self) -> Option<Arc<crate::protect::os::PristineProtect>> {
        self.pristine.read().clone()
    }

    /// Open the VEH gate for a collaborator that needs a real handler
    pub fn allow_veh(&self) {
        self.veh.allow();
    }

    /// Register the symbol oracle used for fault/exit annotation
    pub fn set_resolver(&self, resolver: Arc<dyn SymbolResolver>) {
        *self.resolver.write() = Some(resolver);
    }

    pub fn resolver(&self) -> Option<Arc<dyn SymbolResolver>> {
        self.resolver.read().clone()
    }

    /// Behavioral toggle for a single patch; the hook stays installed
    pub fn set_patch_enabled(&self, name: &str, enabled: bool) -> bool {
        match self.patches.iter().find(|p| p.name == name) {
            Some(p) => {
                p.set_enabled(enabled);
                tracing::info!("Patch '{}' {}", name, if enabled { "enabled" } else { "disabled" });
                true
            }
            None => false,
        }
    }

    /// Stop the watcher thread. Only orderly detach paths call this;
    /// normally the thread dies with the process.
    pub fn shutdown(&self) {
        if let Some(handle) = self.watcher.lock().take() {
            handle.stop();
        }
    }
}
