/*!
Saved processor state and the status/cause register fields.

The machine stores one of these at every trap entry (the BIOS data page) and
reloads one whenever the kernel dispatches a process. The layout mirrors the
MIPS-class convention: 32 general registers, program counter, status, cause,
and entryHi (the VPN/ASID pair the MMU was presenting when the trap fired).

Only a handful of general registers carry protocol meaning:
- a0..a3 (r4..r7): syscall number and arguments
- v0     (r2):     syscall return value
- sp     (r29):    stack pointer
*/

use bitflags::bitflags;

use crate::consts::WORD_LEN;

pub const R_V0: usize = 2;
pub const R_A0: usize = 4;
pub const R_A1: usize = 5;
pub const R_A2: usize = 6;
pub const R_A3: usize = 7;
pub const R_SP: usize = 29;

bitflags! {
    /// Processor status register.
    ///
    /// KU/IE are three-deep stacks (current/previous/old); exception entry
    /// pushes current into previous, loading a state pops the whole word
    /// back. TE gates the processor-local timer. The interrupt mask occupies
    /// bits 8..16, one bit per line.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Status: u32 {
        const IE_CURRENT  = 1 << 0;
        const KU_CURRENT  = 1 << 1;
        const IE_PREVIOUS = 1 << 2;
        const KU_PREVIOUS = 1 << 3;
        const IE_OLD      = 1 << 4;
        const KU_OLD      = 1 << 5;
        const IM_ALL      = 0xFF << 8;
        const TIMER_ENABLE = 1 << 27;
    }
}

impl Status {
    /// Kernel mode, all interrupts enabled and unmasked, local timer on.
    pub fn kernel_run() -> Self {
        Status::IE_CURRENT | Status::IM_ALL | Status::TIMER_ENABLE
    }

    /// User mode, all interrupts enabled and unmasked, local timer on.
    pub fn user_run() -> Self {
        Status::kernel_run() | Status::KU_CURRENT
    }

    pub fn user_mode(self) -> bool {
        self.contains(Status::KU_CURRENT)
    }

    pub fn interrupts_on(self) -> bool {
        self.contains(Status::IE_CURRENT)
    }

    /// True if interrupts from `line` are unmasked.
    pub fn line_unmasked(self, line: usize) -> bool {
        self.bits() & (1 << (8 + line)) != 0
    }

    pub fn timer_on(self) -> bool {
        self.contains(Status::TIMER_ENABLE)
    }

    /// Exception entry: push the KU/IE stacks and drop into kernel mode with
    /// interrupts disabled.
    pub fn pushed(self) -> Self {
        let kept = self.bits() & !0x3F;
        let stacked = (self.bits() & 0x0F) << 2;
        Status::from_bits_retain(kept | stacked)
    }
}

/// Exception kinds as encoded in the cause register's ExcCode field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExcCode {
    Interrupt,
    TlbModify,
    TlbLoadInvalid,
    TlbStoreInvalid,
    AddressLoad,
    AddressStore,
    BusErrorFetch,
    BusErrorData,
    Syscall,
    Breakpoint,
    ReservedInstruction,
    CoprocessorUnusable,
    Overflow,
}

impl ExcCode {
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => ExcCode::Interrupt,
            1 => ExcCode::TlbModify,
            2 => ExcCode::TlbLoadInvalid,
            3 => ExcCode::TlbStoreInvalid,
            4 => ExcCode::AddressLoad,
            5 => ExcCode::AddressStore,
            6 => ExcCode::BusErrorFetch,
            7 => ExcCode::BusErrorData,
            8 => ExcCode::Syscall,
            9 => ExcCode::Breakpoint,
            10 => ExcCode::ReservedInstruction,
            11 => ExcCode::CoprocessorUnusable,
            12 => ExcCode::Overflow,
            _ => return None,
        })
    }

    pub fn code(self) -> u32 {
        match self {
            ExcCode::Interrupt => 0,
            ExcCode::TlbModify => 1,
            ExcCode::TlbLoadInvalid => 2,
            ExcCode::TlbStoreInvalid => 3,
            ExcCode::AddressLoad => 4,
            ExcCode::AddressStore => 5,
            ExcCode::BusErrorFetch => 6,
            ExcCode::BusErrorData => 7,
            ExcCode::Syscall => 8,
            ExcCode::Breakpoint => 9,
            ExcCode::ReservedInstruction => 10,
            ExcCode::CoprocessorUnusable => 11,
            ExcCode::Overflow => 12,
        }
    }

    /// TLB exceptions are forwarded on the page-fault path; everything that
    /// is neither an interrupt, a TLB exception, nor a syscall is a program
    /// trap.
    pub fn is_tlb(self) -> bool {
        matches!(
            self,
            ExcCode::TlbModify | ExcCode::TlbLoadInvalid | ExcCode::TlbStoreInvalid
        )
    }
}

/// Cause register: ExcCode in bits 2..7, pending-interrupt bits in 8..16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cause(pub u32);

impl Cause {
    pub fn exception(code: ExcCode) -> Self {
        Cause(code.code() << 2)
    }

    pub fn interrupt(pending_lines: u32) -> Self {
        Cause((ExcCode::Interrupt.code() << 2) | (pending_lines << 8))
    }

    pub fn exc_code(self) -> Option<ExcCode> {
        ExcCode::from_code((self.0 >> 2) & 0x1F)
    }

    pub fn pending_line(self, line: usize) -> bool {
        self.0 & (1 << (8 + line)) != 0
    }
}

/// Full saved processor state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorState {
    pub gpr: [u32; 32],
    pub pc: u32,
    pub status: Status,
    pub cause: Cause,
    pub entry_hi: u32,
}

impl Default for ProcessorState {
    fn default() -> Self {
        ProcessorState {
            gpr: [0; 32],
            pc: 0,
            status: Status::empty(),
            cause: Cause::default(),
            entry_hi: 0,
        }
    }
}

impl ProcessorState {
    /// A kernel-mode state starting at `pc` with the given stack top.
    pub fn kernel(pc: u32, sp: u32) -> Self {
        let mut s = ProcessorState::default();
        s.pc = pc;
        s.status = Status::kernel_run();
        s.gpr[R_SP] = sp;
        s
    }

    /// A user-mode state for address space `asid`.
    pub fn user(pc: u32, sp: u32, asid: usize) -> Self {
        let mut s = ProcessorState::kernel(pc, sp);
        s.status = Status::user_run();
        s.set_asid(asid);
        s
    }

    pub fn v0(&self) -> u32 {
        self.gpr[R_V0]
    }

    pub fn set_v0(&mut self, v: u32) {
        self.gpr[R_V0] = v;
    }

    pub fn a(&self, n: usize) -> u32 {
        self.gpr[R_A0 + n]
    }

    pub fn set_args(&mut self, a0: u32, a1: u32, a2: u32, a3: u32) {
        self.gpr[R_A0] = a0;
        self.gpr[R_A1] = a1;
        self.gpr[R_A2] = a2;
        self.gpr[R_A3] = a3;
    }

    /// Step the saved PC past the trapping instruction.
    pub fn advance_pc(&mut self) {
        self.pc = self.pc.wrapping_add(WORD_LEN);
    }

    pub fn asid(&self) -> usize {
        ((self.entry_hi >> 6) & 0x3F) as usize
    }

    pub fn set_asid(&mut self, asid: usize) {
        self.entry_hi = (self.entry_hi & !0xFC0) | ((asid as u32 & 0x3F) << 6);
    }

    /// Record the faulting VPN in entryHi, preserving the ASID field.
    pub fn set_fault_vpn(&mut self, vpn: u32) {
        self.entry_hi = (vpn << 12) | (self.entry_hi & 0xFFF);
    }

    pub fn fault_vpn(&self) -> u32 {
        self.entry_hi >> 12
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_push_stacks_ku_ie() {
        let s = Status::user_run();
        let pushed = s.pushed();
        assert!(!pushed.interrupts_on());
        assert!(!pushed.user_mode());
        assert!(pushed.contains(Status::IE_PREVIOUS));
        assert!(pushed.contains(Status::KU_PREVIOUS));
        assert!(pushed.contains(Status::TIMER_ENABLE));
        assert_eq!(pushed.bits() & Status::IM_ALL.bits(), Status::IM_ALL.bits());
    }

    #[test]
    fn cause_round_trip() {
        let c = Cause::exception(ExcCode::Syscall);
        assert_eq!(c.exc_code(), Some(ExcCode::Syscall));
        let i = Cause::interrupt(1 << 3);
        assert_eq!(i.exc_code(), Some(ExcCode::Interrupt));
        assert!(i.pending_line(3));
        assert!(!i.pending_line(4));
    }

    #[test]
    fn entry_hi_packs_vpn_and_asid() {
        let mut s = ProcessorState::user(0x8000_00B0, 0xC000_0000, 5);
        assert_eq!(s.asid(), 5);
        s.set_fault_vpn(0x80004);
        assert_eq!(s.fault_vpn(), 0x80004);
        assert_eq!(s.asid(), 5);
    }
}
