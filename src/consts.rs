/*!
Fixed machine layout and kernel tuning constants.

Physical memory map (all addresses are byte addresses):
- 0x2000_0000: RAM base. 64 frames of 4 KiB (256 KiB total).
  - frame 0:        kernel data page (semaphore address space; see below)
  - frame 1:        nucleus/exception stacks (symbolic; the handlers are native)
  - frames 2..18:   swap pool (16 frames shared by all user processes)
  - frames 18..26:  per-disk DMA buffers (one frame per disk device)
  - frames 26..34:  per-flash DMA buffers (one frame per flash device)
  - frame 34:       instantiator staging buffer
  - frames 35..64:  free (unused by the kernel proper)

Virtual memory (user segment):
- 0x8000_0000..0xBFFF_F000: user text/data, page-table entries 0..31
- 0xBFFF_F000: stack page (page-table entry 31), stack top 0xC000_0000

Semaphore address space: semaphores are named by u32 addresses (address
identity, as user code must be able to pass arbitrary addresses). The
kernel's own semaphores live in the kernel data page at fixed offsets.

Interrupt lines follow the MIPS-class convention: 1 = processor-local timer,
2 = interval timer, 3 = disk, 4 = flash, 5 = network (no installed devices),
6 = printer, 7 = terminal. Eight devices per line.
*/

pub const PAGE_SIZE: usize = 4096;
pub const WORD_LEN: u32 = 4;

pub const RAM_BASE: u32 = 0x2000_0000;
pub const RAM_FRAMES: usize = 64;
pub const RAM_SIZE: usize = RAM_FRAMES * PAGE_SIZE;

pub const KERNEL_DATA_FRAME: usize = 0;
pub const NUCLEUS_STACK_FRAME: usize = 1;
pub const SWAP_POOL_FRAME: usize = 2;
pub const DISK_DMA_FRAME: usize = SWAP_POOL_FRAME + SWAP_POOL_SIZE;
pub const FLASH_DMA_FRAME: usize = DISK_DMA_FRAME + DEV_PER_LINE;
pub const INSTALLER_BUF_FRAME: usize = FLASH_DMA_FRAME + DEV_PER_LINE;

/// Physical address of RAM frame `i`.
pub const fn frame_addr(i: usize) -> u32 {
    RAM_BASE + (i * PAGE_SIZE) as u32
}

// ---------------------------------------------------------------------------
// User segment geometry
// ---------------------------------------------------------------------------

pub const KUSEG_BASE: u32 = 0x8000_0000;
/// First instruction of a user image (just past the image header area).
pub const UPROC_START: u32 = 0x8000_00B0;
pub const USTACK_TOP: u32 = 0xC000_0000;
pub const USTACK_PAGE: u32 = USTACK_TOP - PAGE_SIZE as u32;

/// Entries in a per-process page table: 31 text/data pages plus the stack page.
pub const PAGETBL_SIZE: usize = 32;
pub const STACK_PTE: usize = PAGETBL_SIZE - 1;

pub const KUSEG_VPN: u32 = KUSEG_BASE >> 12;
pub const USTACK_VPN: u32 = USTACK_PAGE >> 12;

// ---------------------------------------------------------------------------
// Process and support-layer sizing
// ---------------------------------------------------------------------------

pub const MAX_PROC: usize = 20;
pub const UPROC_MAX: usize = 8;
pub const SWAP_POOL_SIZE: usize = 2 * UPROC_MAX;
/// Delay-event descriptors: one per user process plus the two sentinels.
pub const ADL_POOL_SIZE: usize = UPROC_MAX + 2;

// ---------------------------------------------------------------------------
// Scheduling
// ---------------------------------------------------------------------------

/// Time slice, in microseconds.
pub const QUANTUM_US: u64 = 5_000;
/// Pseudo-clock tick, in microseconds.
pub const TICK_US: u64 = 100_000;

// ---------------------------------------------------------------------------
// Interrupt lines and devices
// ---------------------------------------------------------------------------

pub const LINE_PLT: usize = 1;
pub const LINE_INTERVAL: usize = 2;
pub const LINE_DISK: usize = 3;
pub const LINE_FLASH: usize = 4;
pub const LINE_NET: usize = 5;
pub const LINE_PRINTER: usize = 6;
pub const LINE_TERMINAL: usize = 7;

pub const FIRST_DEV_LINE: usize = 3;
pub const LAST_DEV_LINE: usize = 7;
pub const DEV_LINES: usize = LAST_DEV_LINE - FIRST_DEV_LINE + 1;
pub const DEV_PER_LINE: usize = 8;

/// Device semaphores: one per (line, device) pair, terminals split into a
/// transmit bank and a receive bank, plus the pseudo-clock at the end.
pub const DEV_SEM_COUNT: usize = DEV_LINES * DEV_PER_LINE + DEV_PER_LINE + 1;
pub const TERM_RECV_SEM_BANK: usize = DEV_LINES * DEV_PER_LINE;
pub const PSEUDO_CLOCK_SEM: usize = DEV_SEM_COUNT - 1;

/// Semaphore index for a device interrupt: `(line - 3) * 8 + device`.
/// `recv` selects the second terminal bank.
pub const fn dev_sem_index(line: usize, dev: usize, recv: bool) -> usize {
    if recv {
        TERM_RECV_SEM_BANK + dev
    } else {
        (line - FIRST_DEV_LINE) * DEV_PER_LINE + dev
    }
}

// ---------------------------------------------------------------------------
// Semaphore address space (kernel data page layout)
// ---------------------------------------------------------------------------

pub const DEV_SEM_BASE: u32 = frame_addr(KERNEL_DATA_FRAME);
/// Per-device mutual-exclusion semaphores, same indexing as the device
/// semaphores (terminal receive half uses the second bank).
pub const DEV_MUTEX_BASE: u32 = DEV_SEM_BASE + 0x100;
pub const SWAP_MUTEX_ADDR: u32 = DEV_SEM_BASE + 0x200;
pub const ADL_MUTEX_ADDR: u32 = DEV_SEM_BASE + 0x204;
pub const MASTER_SEM_ADDR: u32 = DEV_SEM_BASE + 0x208;
/// Private per-process semaphores used by the delay facility, indexed by ASID.
pub const PRIVATE_SEM_BASE: u32 = DEV_SEM_BASE + 0x210;

pub const fn dev_sem_addr(index: usize) -> u32 {
    DEV_SEM_BASE + (index * 4) as u32
}

/// Symbolic entry points recorded in the pass-up vector. Dispatch above the
/// machine boundary is typed; these only exist so the vector holds real
/// values a debugger could recognize.
pub const TLB_REFILL_ENTRY: u32 = 0x0000_0A00;
pub const EXCEPTION_ENTRY: u32 = 0x0000_0A80;
pub const PAGER_ENTRY: u32 = 0x0000_0B00;
pub const SUPPORT_GEN_ENTRY: u32 = 0x0000_0B80;
pub const DAEMON_ENTRY: u32 = 0x0000_0C00;
pub const INSTANTIATOR_ENTRY: u32 = 0x0000_0C80;
pub const NUCLEUS_STACK_TOP: u32 = frame_addr(NUCLEUS_STACK_FRAME + 1);

/// Per-ASID support-level exception stack tops, carved out of the frames
/// past the DMA buffers.
pub const fn support_stack_top(asid: usize) -> u32 {
    frame_addr(INSTALLER_BUF_FRAME + 1 + asid)
}

pub const fn dev_mutex_addr(index: usize) -> u32 {
    DEV_MUTEX_BASE + (index * 4) as u32
}

pub const fn private_sem_addr(asid: usize) -> u32 {
    PRIVATE_SEM_BASE + (asid * 4) as u32
}

// ---------------------------------------------------------------------------
// Device register interface
// ---------------------------------------------------------------------------

// Non-terminal register slot layout.
pub const REG_STATUS: usize = 0;
pub const REG_COMMAND: usize = 1;
pub const REG_DATA0: usize = 2;
pub const REG_DATA1: usize = 3;

// Terminal register slot layout (two independent sub-devices).
pub const REG_RECV_STATUS: usize = 0;
pub const REG_RECV_COMMAND: usize = 1;
pub const REG_TRANSM_STATUS: usize = 2;
pub const REG_TRANSM_COMMAND: usize = 3;

// Status codes.
pub const STAT_NOT_INSTALLED: u32 = 0;
pub const STAT_READY: u32 = 1;
pub const STAT_ILLEGAL: u32 = 2;
pub const STAT_BUSY: u32 = 3;
pub const STAT_ERROR: u32 = 4;
/// Terminal sub-device completion: character transmitted/received, with the
/// character in bits 8..16.
pub const STAT_CHAR_OK: u32 = 5;

// Common commands.
pub const CMD_RESET: u32 = 0;
pub const CMD_ACK: u32 = 1;

// Disk commands: SEEKCYL carries the cylinder in bits 8.., READ/WRITE carry
// head in bits 16.. and sector in bits 8..
pub const DISK_SEEKCYL: u32 = 2;
pub const DISK_READBLK: u32 = 3;
pub const DISK_WRITEBLK: u32 = 4;

// Flash commands: block number in bits 8..
pub const FLASH_READBLK: u32 = 2;
pub const FLASH_WRITEBLK: u32 = 3;

pub const PRINTER_PRINTCHR: u32 = 2;
pub const TERM_TRANSMIT: u32 = 2;
pub const TERM_RECEIVE: u32 = 2;

/// Flash blocks 0..32 back the demand-paged user segment and are never
/// reachable through the flash syscalls.
pub const FLASH_RESERVED_BLOCKS: u32 = PAGETBL_SIZE as u32;

// Device latencies (virtual microseconds).
pub const DISK_SEEK_US_PER_CYL: u64 = 80;
pub const DISK_XFER_US: u64 = 1_500;
pub const FLASH_XFER_US: u64 = 1_000;
pub const PRINTER_CHAR_US: u64 = 250;
pub const TERM_CHAR_US: u64 = 400;

// Default device geometry for the built-in board.
pub const DISK_CYLINDERS: u32 = 32;
pub const DISK_HEADS: u32 = 2;
pub const DISK_SECTORS: u32 = 8;
pub const FLASH_BLOCKS: u32 = 64;

/// Byte delivered by a terminal receiver whose input queue has run dry.
pub const TERM_EOT: u8 = 0x04;

// ---------------------------------------------------------------------------
// Syscall numbers
// ---------------------------------------------------------------------------

pub const SYS_CREATE_PROCESS: u32 = 1;
pub const SYS_TERMINATE_PROCESS: u32 = 2;
pub const SYS_PASSEREN: u32 = 3;
pub const SYS_VERHOGEN: u32 = 4;
pub const SYS_WAIT_IO: u32 = 5;
pub const SYS_GET_CPU_TIME: u32 = 6;
pub const SYS_WAIT_CLOCK: u32 = 7;
pub const SYS_GET_SUPPORT: u32 = 8;

pub const SYS_TERMINATE: u32 = 9;
pub const SYS_GET_TOD: u32 = 10;
pub const SYS_WRITE_PRINTER: u32 = 11;
pub const SYS_WRITE_TERMINAL: u32 = 12;
pub const SYS_READ_TERMINAL: u32 = 13;
pub const SYS_DISK_PUT: u32 = 14;
pub const SYS_DISK_GET: u32 = 15;
pub const SYS_FLASH_PUT: u32 = 16;
pub const SYS_FLASH_GET: u32 = 17;
pub const SYS_DELAY: u32 = 18;

/// Longest string accepted by the character I/O syscalls.
pub const MAX_IO_LEN: u32 = 128;

// ---------------------------------------------------------------------------
// User image header
// ---------------------------------------------------------------------------

/// First word of page 0 of a user image on its backing flash device.
pub const IMAGE_MAGIC: u32 = 0x0A0A_0A0A;
pub const IMAGE_HDR_MAGIC_OFF: usize = 0;
pub const IMAGE_HDR_TEXT_SIZE_OFF: usize = 4;
pub const IMAGE_HDR_TOTAL_SIZE_OFF: usize = 8;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_layout_does_not_overlap() {
        assert!(INSTALLER_BUF_FRAME < RAM_FRAMES);
        assert_eq!(DISK_DMA_FRAME, 18);
        assert_eq!(FLASH_DMA_FRAME, 26);
        assert_eq!(INSTALLER_BUF_FRAME, 34);
    }

    #[test]
    fn device_sem_indexing() {
        // Disk 0 is the first semaphore, terminal transmit occupies the last
        // per-line bank, receive the extra bank, pseudo-clock the tail.
        assert_eq!(dev_sem_index(LINE_DISK, 0, false), 0);
        assert_eq!(dev_sem_index(LINE_TERMINAL, 0, false), 32);
        assert_eq!(dev_sem_index(LINE_TERMINAL, 3, true), 43);
        assert_eq!(PSEUDO_CLOCK_SEM, 48);
        assert_eq!(DEV_SEM_COUNT, 49);
    }

    #[test]
    fn sem_addresses_stay_inside_kernel_data_page() {
        let last = private_sem_addr(UPROC_MAX);
        assert!(last < frame_addr(KERNEL_DATA_FRAME + 1));
        assert!(dev_sem_addr(DEV_SEM_COUNT - 1) < DEV_MUTEX_BASE);
        assert!(dev_mutex_addr(DEV_SEM_COUNT - 1) < SWAP_MUTEX_ADDR);
    }
}
