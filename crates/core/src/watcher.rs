//! Anti-debug watcher
//!
//! The target's anti-tamper logic keeps a heartbeat cell non-zero while
//! it is satisfied; on a detected anomaly it zeroes the cell and plants a
//! heap-resident code stub that does the actual damage later. The watcher
//! polls the cell from its own thread: non-zero readings are remembered,
//! a zero reading re-seeds the cell with the last known-good value and
//! defuses the planted stub.
//!
//! The loop runs for the process's entire life; the stop channel exists
//! so the component can be driven in isolation, production never signals
//! it before exit.

use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};

use tamperveil_sdk::{
    AnomalyRecord, HeapCodeStub, TamperIndicator, INDICATOR_DEFAULT_SEED, STUB_FILL_BYTE,
};

/// Where the watcher reads the heartbeat from and writes the re-seed to
pub trait IndicatorSource: Send {
    fn read(&mut self) -> u32;
    fn reseed(&mut self, value: u32);
}

/// Live indicator cell inside the target's memory
pub struct MemoryIndicator {
    cell: *mut TamperIndicator,
}

// SAFETY: the cell is only ever touched from the watcher thread.
unsafe impl Send for MemoryIndicator {}

impl MemoryIndicator {
    /// # Safety
    /// `cell` must point at the resolved tamper-indicator cell and stay
    /// mapped for the process's life.
    pub unsafe fn new(cell: *mut TamperIndicator) -> Self {
        Self { cell }
    }
}

impl IndicatorSource for MemoryIndicator {
    fn read(&mut self) -> u32 {
        unsafe { std::ptr::read_volatile(std::ptr::addr_of!((*self.cell).value)) }
    }

    fn reseed(&mut self, value: u32) {
        unsafe {
            std::ptr::write_volatile(std::ptr::addr_of_mut!((*self.cell).value), value);
            let gen = std::ptr::read_volatile(std::ptr::addr_of!((*self.cell).generation));
            std::ptr::write_volatile(
                std::ptr::addr_of_mut!((*self.cell).generation),
                gen.wrapping_add(1),
            );
        }
    }
}

/// Poll-loop state and policy
pub struct Watcher<S: IndicatorSource> {
    source: S,
    /// Last non-zero reading; only overwritten while the indicator is
    /// non-zero, so corrections reuse it across repeated zero readings.
    last_non_zero: u32,
    ticks: u64,
    corrections: u64,
    /// Fired on every zero reading with the value used for correction
    on_trigger: Box<dyn FnMut(u32) + Send>,
}

impl<S: IndicatorSource> Watcher<S> {
    pub fn new(source: S, on_trigger: Box<dyn FnMut(u32) + Send>) -> Self {
        Self {
            source,
            last_non_zero: INDICATOR_DEFAULT_SEED,
            ticks: 0,
            corrections: 0,
            on_trigger,
        }
    }

    /// One poll step. Returns whether a correction fired.
    pub fn tick(&mut self) -> bool {
        self.ticks += 1;
        let value = self.source.read();

        if value != 0 {
            self.last_non_zero = value;
            return false;
        }

        // Zero means the anomaly tripped: put the last known-good value
        // back and let the corrective action defuse whatever was planted.
        let seed = self.last_non_zero;
        self.source.reseed(seed);
        (self.on_trigger)(seed);
        self.corrections += 1;
        tracing::warn!(
            "Tamper indicator hit zero (correction #{}, re-seeded with {})",
            self.corrections,
            seed
        );
        true
    }

    pub fn corrections(&self) -> u64 {
        self.corrections
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }
}

/// Handle to a spawned watcher thread
pub struct WatcherHandle {
    stop: Sender<()>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl WatcherHandle {
    /// Signal the loop and wait for it. Only tests and orderly teardown
    /// call this; in production the thread dies with the process.
    pub fn stop(mut self) {
        let _ = self.stop.send(());
        if let Some(t) = self.thread.take() {
            let _ = t.join();
        }
    }
}

/// Start the poll loop on a dedicated thread.
pub fn spawn<S: IndicatorSource + 'static>(
    mut watcher: Watcher<S>,
    interval: Duration,
) -> std::io::Result<WatcherHandle> {
    let (stop_tx, stop_rx): (Sender<()>, Receiver<()>) = bounded(1);

    let thread = std::thread::Builder::new()
        .name("tamperveil-watcher".into())
        .spawn(move || {
            tracing::info!("Anti-debug watcher running (interval {:?})", interval);
            loop {
                match stop_rx.recv_timeout(interval) {
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                        watcher.tick();
                    }
                    _ => break,
                }
            }
        })?;

    Ok(WatcherHandle {
        stop: stop_tx,
        thread: Some(thread),
    })
}

/// Overwrite a planted heap code stub with harmless filler.
///
/// # Safety
/// The stub descriptor must reference writable memory of at least `len`
/// bytes.
pub unsafe fn defuse_heap_stub(stub: HeapCodeStub) {
    if stub.code.is_null() || stub.len == 0 {
        return;
    }
    std::ptr::write_bytes(stub.code as *mut u8, STUB_FILL_BYTE, stub.len);
    tracing::info!(
        "Defused heap code stub at {:p} ({} bytes)",
        stub.code,
        stub.len
    );
}

/// Resolve the anomaly record from the matched store instruction.
///
/// The signature lands on `mov [rip+disp32], eax` (`89 05 xx xx xx xx`);
/// the RIP-relative target of that store is the indicator cell, which
/// heads the anomaly record.
///
/// # Safety
/// `hit` must be the address of a matched, mapped instruction.
pub unsafe fn resolve_anomaly_record(hit: usize) -> *mut AnomalyRecord {
    let disp = std::ptr::read_unaligned((hit + 2) as *const i32);
    let next_instruction = hit + 6;
    (next_instruction as isize + disp as isize) as *mut AnomalyRecord
}

/// Read the currently planted stub descriptor, if any.
///
/// # Safety
/// `record` must point at a mapped anomaly record.
pub unsafe fn pending_stub(record: *mut AnomalyRecord) -> Option<HeapCodeStub> {
    let stub = std::ptr::read_volatile(std::ptr::addr_of!((*record).stub));
    (!stub.code.is_null() && stub.len > 0).then_some(stub)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Scripted indicator for driving the loop without a real process
    struct ScriptedIndicator {
        readings: Vec<u32>,
        at: usize,
        reseeds: Arc<Mutex<Vec<u32>>>,
    }

    impl IndicatorSource for ScriptedIndicator {
        fn read(&mut self) -> u32 {
            let v = self.readings[self.at.min(self.readings.len() - 1)];
            self.at += 1;
            v
        }

        fn reseed(&mut self, value: u32) {
            self.reseeds.lock().unwrap().push(value);
        }
    }

    #[test]
    fn test_correction_sequence() {
        // Readings [5, 5, 0, 0, 7, 0]: corrections fire at each zero,
        // the first two reuse 5, the one after the 7 reading uses 7.
        let reseeds = Arc::new(Mutex::new(Vec::new()));
        let triggers = Arc::new(Mutex::new(Vec::new()));

        let source = ScriptedIndicator {
            readings: vec![5, 5, 0, 0, 7, 0],
            at: 0,
            reseeds: Arc::clone(&reseeds),
        };
        let t = Arc::clone(&triggers);
        let mut watcher = Watcher::new(
            source,
            Box::new(move |v| t.lock().unwrap().push(v)),
        );

        for _ in 0..6 {
            watcher.tick();
        }

        assert_eq!(watcher.corrections(), 3);
        assert_eq!(*triggers.lock().unwrap(), vec![5, 5, 7]);
        assert_eq!(*reseeds.lock().unwrap(), vec![5, 5, 7]);
    }

    #[test]
    fn test_zero_before_any_reading_uses_default_seed() {
        let reseeds = Arc::new(Mutex::new(Vec::new()));
        let source = ScriptedIndicator {
            readings: vec![0],
            at: 0,
            reseeds: Arc::clone(&reseeds),
        };
        let mut watcher = Watcher::new(source, Box::new(|_| {}));

        assert!(watcher.tick());
        assert_eq!(*reseeds.lock().unwrap(), vec![INDICATOR_DEFAULT_SEED]);
    }

    #[test]
    fn test_memory_indicator_roundtrip() {
        let mut cell = TamperIndicator {
            value: 3,
            generation: 0,
        };
        let mut source = unsafe { MemoryIndicator::new(&mut cell) };

        assert_eq!(source.read(), 3);
        source.reseed(9);
        assert_eq!(source.read(), 9);
        assert_eq!(cell.generation, 1);
    }

    #[test]
    fn test_defuse_heap_stub() {
        let mut buf = [0x90u8; 16];
        unsafe {
            defuse_heap_stub(HeapCodeStub {
                code: buf.as_mut_ptr() as *mut _,
                len: buf.len(),
            });
        }
        assert!(buf.iter().all(|&b| b == STUB_FILL_BYTE));
    }

    #[test]
    fn test_resolve_anomaly_record() {
        // Craft `mov [rip+disp32], eax` where the displacement points 2
        // bytes past the instruction.
        let mut buf = [0u8; 40];
        buf[0] = 0x89;
        buf[1] = 0x05;
        buf[2..6].copy_from_slice(&2i32.to_le_bytes());

        let hit = buf.as_ptr() as usize;
        let record = unsafe { resolve_anomaly_record(hit) };
        assert_eq!(record as usize, hit + 6 + 2);
    }

    #[test]
    fn test_pending_stub_null_while_quiet() {
        let mut record = AnomalyRecord {
            indicator: TamperIndicator {
                value: 5,
                generation: 0,
            },
            stub: HeapCodeStub {
                code: std::ptr::null_mut(),
                len: 0,
            },
        };
        assert!(unsafe { pending_stub(&mut record) }.is_none());

        let mut planted = [0u8; 4];
        record.stub = HeapCodeStub {
            code: planted.as_mut_ptr() as *mut _,
            len: planted.len(),
        };
        let stub = unsafe { pending_stub(&mut record) }.unwrap();
        assert_eq!(stub.len, 4);
    }

    #[test]
    fn test_spawned_loop_stops_on_signal() {
        let reseeds = Arc::new(Mutex::new(Vec::new()));
        let source = ScriptedIndicator {
            readings: vec![1],
            at: 0,
            reseeds,
        };
        let watcher = Watcher::new(source, Box::new(|_| {}));

        let handle = spawn(watcher, Duration::from_millis(5)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        handle.stop();
    }
}
