//! CPU context for mid-function hooks
//!
//! Register snapshot handed to patch bodies. Patches address registers by
//! flat slot index because the slot that carries the value to neutralize
//! is data attached to each signature, not something known at compile
//! time.

/// Full general-purpose register context for x86_64 mid-function hooks
///
/// Layout matches the hook stub's push order for direct memory mapping.
/// Modifications to this structure are reflected when the hook returns.
#[repr(C)]
#[derive(Debug, Clone, Default)]
pub struct CpuContext {
    pub rflags: u64,

    // General purpose registers (in push order)
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,

    // Stack pointer (read-only, modification undefined)
    pub rsp: u64,
}

/// Flat register slot order used by signature metadata.
///
/// Slot indices follow the push order above: 0 = r15 .. 14 = rax, 15 = rsp.
pub const SLOT_NAMES: [&str; 16] = [
    "r15", "r14", "r13", "r12", "r11", "r10", "r9", "r8", "rdi", "rsi", "rbp", "rdx", "rcx",
    "rbx", "rax", "rsp",
];

impl CpuContext {
    /// Read a register by flat slot index
    pub fn reg(&self, slot: usize) -> u64 {
        match slot {
            0 => self.r15,
            1 => self.r14,
            2 => self.r13,
            3 => self.r12,
            4 => self.r11,
            5 => self.r10,
            6 => self.r9,
            7 => self.r8,
            8 => self.rdi,
            9 => self.rsi,
            10 => self.rbp,
            11 => self.rdx,
            12 => self.rcx,
            13 => self.rbx,
            14 => self.rax,
            15 => self.rsp,
            _ => {
                tracing::warn!("Register slot {} out of range", slot);
                0
            }
        }
    }

    /// Write a register by flat slot index
    pub fn set_reg(&mut self, slot: usize, value: u64) {
        match slot {
            0 => self.r15 = value,
            1 => self.r14 = value,
            2 => self.r13 = value,
            3 => self.r12 = value,
            4 => self.r11 = value,
            5 => self.r10 = value,
            6 => self.r9 = value,
            7 => self.r8 = value,
            8 => self.rdi = value,
            9 => self.rsi = value,
            10 => self.rbp = value,
            11 => self.rdx = value,
            12 => self.rcx = value,
            13 => self.rbx = value,
            14 => self.rax = value,
            // rsp is deliberately not writable through the slot API
            _ => tracing::warn!("Register slot {} not writable", slot),
        }
    }

    /// Get the return address (on stack at RSP)
    ///
    /// # Safety
    /// Only meaningful inside a live hook body where `rsp` points at a
    /// mapped stack.
    pub unsafe fn return_address(&self) -> u64 {
        *(self.rsp as *const u64)
    }

    /// Get argument by index (Windows x64 ABI)
    /// Arguments: RCX, RDX, R8, R9, then stack
    #[cfg(windows)]
    pub fn arg(&self, index: usize) -> u64 {
        match index {
            0 => self.rcx,
            1 => self.rdx,
            2 => self.r8,
            3 => self.r9,
            n => {
                // Stack arguments start at RSP + 40 (shadow space + return)
                let stack_index = n - 4;
                unsafe { *((self.rsp as *const u64).add(5 + stack_index)) }
            }
        }
    }

    /// Get argument by index (System V AMD64 ABI)
    /// Arguments: RDI, RSI, RDX, RCX, R8, R9, then stack
    #[cfg(unix)]
    pub fn arg(&self, index: usize) -> u64 {
        match index {
            0 => self.rdi,
            1 => self.rsi,
            2 => self.rdx,
            3 => self.rcx,
            4 => self.r8,
            5 => self.r9,
            n => {
                // Stack arguments start at RSP + 8 (after return address)
                let stack_index = n - 6;
                unsafe { *((self.rsp as *const u64).add(1 + stack_index)) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_roundtrip() {
        let mut ctx = CpuContext::default();

        for slot in 0..15 {
            ctx.set_reg(slot, 0x1000 + slot as u64);
        }
        for slot in 0..15 {
            assert_eq!(ctx.reg(slot), 0x1000 + slot as u64, "slot {}", slot);
        }
    }

    #[test]
    fn test_slot_names_match_fields() {
        let mut ctx = CpuContext::default();
        ctx.set_reg(14, 0xAA);
        assert_eq!(ctx.rax, 0xAA);
        ctx.set_reg(13, 0xBB);
        assert_eq!(ctx.rbx, 0xBB);
        ctx.set_reg(0, 0xCC);
        assert_eq!(ctx.r15, 0xCC);
        assert_eq!(SLOT_NAMES[14], "rax");
    }

    #[test]
    fn test_rsp_not_writable_via_slot() {
        let mut ctx = CpuContext {
            rsp: 0x7000,
            ..Default::default()
        };
        ctx.set_reg(15, 0xDEAD);
        assert_eq!(ctx.rsp, 0x7000);
    }

    #[test]
    fn test_out_of_range_slot_reads_zero() {
        let ctx = CpuContext::default();
        assert_eq!(ctx.reg(99), 0);
    }
}
