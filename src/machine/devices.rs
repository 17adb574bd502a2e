/*!
Device register file and per-device behavior models.

Eight devices per interrupt line. Each device exposes a 4-word register
slot; writing a command register while the (sub-)device is not busy starts
an operation and asks the caller to schedule a completion. When the clock
delivers the completion the device latches its result status and raises its
"done" flag; the flag is what feeds the per-line interrupting-devices
bitmap, and an ACK command clears it.

Device models:
- Disk: geometry in data1 (`cyl<<16 | head<<8 | sect`), SEEKCYL then
  READBLK/WRITEBLK moving one 4 KiB block between the platter store and the
  DMA address in data0. Seek latency grows with cylinder distance.
- Flash: block count in data1, READBLK/WRITEBLK with the block number in
  the command's high bits. Out-of-range blocks complete with an illegal
  status (the interrupt still fires).
- Printer: PRINTCHR transmits the byte in data0 to the output sink.
- Terminal: independent receiver and transmitter sub-devices with their own
  status/command pairs, completion status `char<<8 | 5`. Receiver input is
  a byte queue provided by the embedder; a drained queue yields EOT so a
  reader never hangs the board.
*/

use std::collections::VecDeque;

use crate::consts::*;
use crate::machine::ram::Ram;

/// Result of a register write: ask the clock to schedule a completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scheduled {
    pub latency: u64,
    /// 0 = device / receiver sub-device, 1 = transmitter sub-device.
    pub sub: usize,
}

// ---------------------------------------------------------------------------
// Disk
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum DiskOp {
    Seek { cyl: u32 },
    Xfer { write: bool, head: u32, sect: u32 },
    Illegal,
}

pub struct Disk {
    status: u32,
    data0: u32,
    data1: u32,
    cylinders: u32,
    heads: u32,
    sectors: u32,
    cur_cyl: u32,
    inflight: Option<DiskOp>,
    done: bool,
    store: Vec<u8>,
}

impl Disk {
    pub fn new(cylinders: u32, heads: u32, sectors: u32) -> Self {
        Disk {
            status: STAT_READY,
            data0: 0,
            data1: (cylinders << 16) | (heads << 8) | sectors,
            cylinders,
            heads,
            sectors,
            cur_cyl: 0,
            inflight: None,
            done: false,
            store: vec![0; (cylinders * heads * sectors) as usize * PAGE_SIZE],
        }
    }

    pub fn capacity(&self) -> u32 {
        self.cylinders * self.heads * self.sectors
    }

    fn command(&mut self, val: u32) -> Option<Scheduled> {
        match val & 0xFF {
            CMD_ACK => {
                self.done = false;
                self.status = STAT_READY;
                None
            }
            CMD_RESET => {
                self.inflight = None;
                self.done = false;
                self.status = STAT_READY;
                None
            }
            DISK_SEEKCYL => {
                let cyl = val >> 8;
                let dist = cyl.abs_diff(self.cur_cyl) as u64;
                self.inflight = Some(DiskOp::Seek { cyl });
                self.done = false;
                self.status = STAT_BUSY;
                Some(Scheduled {
                    latency: 100 + dist * DISK_SEEK_US_PER_CYL,
                    sub: 0,
                })
            }
            DISK_READBLK | DISK_WRITEBLK => {
                self.inflight = Some(DiskOp::Xfer {
                    write: val & 0xFF == DISK_WRITEBLK,
                    head: (val >> 16) & 0xFF,
                    sect: (val >> 8) & 0xFF,
                });
                self.done = false;
                self.status = STAT_BUSY;
                Some(Scheduled {
                    latency: DISK_XFER_US,
                    sub: 0,
                })
            }
            _ => {
                self.inflight = Some(DiskOp::Illegal);
                self.done = false;
                self.status = STAT_BUSY;
                Some(Scheduled { latency: 1, sub: 0 })
            }
        }
    }

    fn complete(&mut self, ram: &mut Ram) {
        self.status = match self.inflight.take() {
            Some(DiskOp::Seek { cyl }) if cyl < self.cylinders => {
                self.cur_cyl = cyl;
                STAT_READY
            }
            Some(DiskOp::Xfer { write, head, sect }) if head < self.heads && sect < self.sectors => {
                let sector = (self.cur_cyl * self.heads + head) * self.sectors + sect;
                let off = sector as usize * PAGE_SIZE;
                if write {
                    match ram.frame(self.data0) {
                        Some(src) => {
                            self.store[off..off + PAGE_SIZE].copy_from_slice(src);
                            STAT_READY
                        }
                        None => STAT_ERROR,
                    }
                } else {
                    match ram.frame_mut(self.data0) {
                        Some(dst) => {
                            dst.copy_from_slice(&self.store[off..off + PAGE_SIZE]);
                            STAT_READY
                        }
                        None => STAT_ERROR,
                    }
                }
            }
            _ => STAT_ILLEGAL,
        };
        self.done = true;
    }
}

// ---------------------------------------------------------------------------
// Flash
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum FlashOp {
    Xfer { write: bool, block: u32 },
    Illegal,
}

pub struct Flash {
    status: u32,
    data0: u32,
    blocks: u32,
    inflight: Option<FlashOp>,
    done: bool,
    store: Vec<u8>,
}

impl Flash {
    pub fn new(blocks: u32) -> Self {
        Flash {
            status: STAT_READY,
            data0: 0,
            blocks,
            inflight: None,
            done: false,
            store: vec![0; blocks as usize * PAGE_SIZE],
        }
    }

    /// Raw block store, for preloading images at build time.
    pub fn store_mut(&mut self) -> &mut [u8] {
        &mut self.store
    }

    pub fn store(&self) -> &[u8] {
        &self.store
    }

    fn command(&mut self, val: u32) -> Option<Scheduled> {
        match val & 0xFF {
            CMD_ACK => {
                self.done = false;
                self.status = STAT_READY;
                None
            }
            CMD_RESET => {
                self.inflight = None;
                self.done = false;
                self.status = STAT_READY;
                None
            }
            FLASH_READBLK | FLASH_WRITEBLK => {
                self.inflight = Some(FlashOp::Xfer {
                    write: val & 0xFF == FLASH_WRITEBLK,
                    block: val >> 8,
                });
                self.done = false;
                self.status = STAT_BUSY;
                Some(Scheduled {
                    latency: FLASH_XFER_US,
                    sub: 0,
                })
            }
            _ => {
                self.inflight = Some(FlashOp::Illegal);
                self.done = false;
                self.status = STAT_BUSY;
                Some(Scheduled { latency: 1, sub: 0 })
            }
        }
    }

    fn complete(&mut self, ram: &mut Ram) {
        self.status = match self.inflight.take() {
            Some(FlashOp::Xfer { write, block }) if block < self.blocks => {
                let off = block as usize * PAGE_SIZE;
                if write {
                    match ram.frame(self.data0) {
                        Some(src) => {
                            self.store[off..off + PAGE_SIZE].copy_from_slice(src);
                            STAT_READY
                        }
                        None => STAT_ERROR,
                    }
                } else {
                    match ram.frame_mut(self.data0) {
                        Some(dst) => {
                            dst.copy_from_slice(&self.store[off..off + PAGE_SIZE]);
                            STAT_READY
                        }
                        None => STAT_ERROR,
                    }
                }
            }
            _ => STAT_ILLEGAL,
        };
        self.done = true;
    }
}

// ---------------------------------------------------------------------------
// Printer
// ---------------------------------------------------------------------------

pub struct Printer {
    status: u32,
    data0: u32,
    pending_char: u8,
    op_ok: bool,
    done: bool,
    output: Vec<u8>,
}

impl Printer {
    pub fn new() -> Self {
        Printer {
            status: STAT_READY,
            data0: 0,
            pending_char: 0,
            op_ok: false,
            done: false,
            output: Vec::new(),
        }
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    fn command(&mut self, val: u32) -> Option<Scheduled> {
        match val & 0xFF {
            CMD_ACK | CMD_RESET => {
                self.done = false;
                self.status = STAT_READY;
                None
            }
            PRINTER_PRINTCHR => {
                self.pending_char = (self.data0 & 0xFF) as u8;
                self.op_ok = true;
                self.done = false;
                self.status = STAT_BUSY;
                Some(Scheduled {
                    latency: PRINTER_CHAR_US,
                    sub: 0,
                })
            }
            _ => {
                self.op_ok = false;
                self.done = false;
                self.status = STAT_BUSY;
                Some(Scheduled { latency: 1, sub: 0 })
            }
        }
    }

    fn complete(&mut self) {
        self.status = if self.op_ok {
            self.output.push(self.pending_char);
            STAT_READY
        } else {
            STAT_ILLEGAL
        };
        self.done = true;
    }
}

// ---------------------------------------------------------------------------
// Terminal
// ---------------------------------------------------------------------------

pub struct Terminal {
    recv_status: u32,
    transm_status: u32,
    recv_done: bool,
    transm_done: bool,
    transm_char: u8,
    input: VecDeque<u8>,
    output: Vec<u8>,
}

impl Terminal {
    pub fn new() -> Self {
        Terminal {
            recv_status: STAT_READY,
            transm_status: STAT_READY,
            recv_done: false,
            transm_done: false,
            transm_char: 0,
            input: VecDeque::new(),
            output: Vec::new(),
        }
    }

    pub fn push_input(&mut self, bytes: &[u8]) {
        self.input.extend(bytes.iter().copied());
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    fn recv_command(&mut self, val: u32) -> Option<Scheduled> {
        match val & 0xFF {
            CMD_ACK => {
                self.recv_done = false;
                self.recv_status = STAT_READY;
                None
            }
            TERM_RECEIVE => {
                self.recv_done = false;
                self.recv_status = STAT_BUSY;
                Some(Scheduled {
                    latency: TERM_CHAR_US,
                    sub: 0,
                })
            }
            _ => None,
        }
    }

    fn transm_command(&mut self, val: u32) -> Option<Scheduled> {
        match val & 0xFF {
            CMD_ACK => {
                self.transm_done = false;
                self.transm_status = STAT_READY;
                None
            }
            TERM_TRANSMIT => {
                self.transm_char = ((val >> 8) & 0xFF) as u8;
                self.transm_done = false;
                self.transm_status = STAT_BUSY;
                Some(Scheduled {
                    latency: TERM_CHAR_US,
                    sub: 1,
                })
            }
            _ => None,
        }
    }

    fn complete(&mut self, sub: usize) {
        if sub == 1 {
            self.output.push(self.transm_char);
            self.transm_status = ((self.transm_char as u32) << 8) | STAT_CHAR_OK;
            self.transm_done = true;
        } else {
            let ch = self.input.pop_front().unwrap_or(TERM_EOT);
            self.recv_status = ((ch as u32) << 8) | STAT_CHAR_OK;
            self.recv_done = true;
        }
    }
}

// ---------------------------------------------------------------------------
// Register file
// ---------------------------------------------------------------------------

pub enum Device {
    NotInstalled,
    Disk(Disk),
    Flash(Flash),
    Printer(Printer),
    Terminal(Terminal),
}

impl Device {
    fn busy(&self, reg: usize) -> bool {
        match self {
            Device::Disk(d) => d.status == STAT_BUSY,
            Device::Flash(d) => d.status == STAT_BUSY,
            Device::Printer(d) => d.status == STAT_BUSY,
            Device::Terminal(t) => {
                if reg == REG_TRANSM_COMMAND {
                    t.transm_status == STAT_BUSY
                } else {
                    t.recv_status == STAT_BUSY
                }
            }
            Device::NotInstalled => false,
        }
    }

    fn pending(&self) -> bool {
        match self {
            Device::Disk(d) => d.done,
            Device::Flash(d) => d.done,
            Device::Printer(d) => d.done,
            Device::Terminal(t) => t.recv_done || t.transm_done,
            Device::NotInstalled => false,
        }
    }
}

pub struct DeviceFile {
    lines: Vec<Vec<Device>>,
}

impl DeviceFile {
    /// The standard board: eight disks, eight flashes, an empty network
    /// line, eight printers, eight terminals.
    pub fn standard() -> Self {
        let mut lines = Vec::with_capacity(DEV_LINES);
        for line in FIRST_DEV_LINE..=LAST_DEV_LINE {
            let mut devs = Vec::with_capacity(DEV_PER_LINE);
            for _ in 0..DEV_PER_LINE {
                devs.push(match line {
                    LINE_DISK => Device::Disk(Disk::new(DISK_CYLINDERS, DISK_HEADS, DISK_SECTORS)),
                    LINE_FLASH => Device::Flash(Flash::new(FLASH_BLOCKS)),
                    LINE_PRINTER => Device::Printer(Printer::new()),
                    LINE_TERMINAL => Device::Terminal(Terminal::new()),
                    _ => Device::NotInstalled,
                });
            }
            lines.push(devs);
        }
        DeviceFile { lines }
    }

    fn dev(&self, line: usize, dev: usize) -> &Device {
        &self.lines[line - FIRST_DEV_LINE][dev]
    }

    fn dev_mut(&mut self, line: usize, dev: usize) -> &mut Device {
        &mut self.lines[line - FIRST_DEV_LINE][dev]
    }

    pub fn read_reg(&self, line: usize, dev: usize, reg: usize) -> u32 {
        match self.dev(line, dev) {
            Device::Disk(d) => match reg {
                REG_STATUS => d.status,
                REG_DATA0 => d.data0,
                REG_DATA1 => d.data1,
                _ => 0,
            },
            Device::Flash(d) => match reg {
                REG_STATUS => d.status,
                REG_DATA0 => d.data0,
                REG_DATA1 => d.blocks,
                _ => 0,
            },
            Device::Printer(d) => match reg {
                REG_STATUS => d.status,
                REG_DATA0 => d.data0,
                _ => 0,
            },
            Device::Terminal(t) => match reg {
                REG_RECV_STATUS => t.recv_status,
                REG_TRANSM_STATUS => t.transm_status,
                _ => 0,
            },
            Device::NotInstalled => STAT_NOT_INSTALLED,
        }
    }

    /// Write a device register. Commands that start an operation return the
    /// completion the caller must schedule. Writes to busy sub-devices and
    /// to read-only registers are ignored.
    pub fn write_reg(&mut self, line: usize, dev: usize, reg: usize, val: u32) -> Option<Scheduled> {
        if self.dev(line, dev).busy(reg) {
            return None;
        }
        match self.dev_mut(line, dev) {
            Device::Disk(d) => match reg {
                REG_COMMAND => d.command(val),
                REG_DATA0 => {
                    d.data0 = val;
                    None
                }
                _ => None,
            },
            Device::Flash(d) => match reg {
                REG_COMMAND => d.command(val),
                REG_DATA0 => {
                    d.data0 = val;
                    None
                }
                _ => None,
            },
            Device::Printer(d) => match reg {
                REG_COMMAND => d.command(val),
                REG_DATA0 => {
                    d.data0 = val;
                    None
                }
                _ => None,
            },
            Device::Terminal(t) => match reg {
                REG_RECV_COMMAND => t.recv_command(val),
                REG_TRANSM_COMMAND => t.transm_command(val),
                _ => None,
            },
            Device::NotInstalled => None,
        }
    }

    pub fn complete(&mut self, line: usize, dev: usize, sub: usize, ram: &mut Ram) {
        match self.dev_mut(line, dev) {
            Device::Disk(d) => d.complete(ram),
            Device::Flash(d) => d.complete(ram),
            Device::Printer(d) => d.complete(),
            Device::Terminal(t) => t.complete(sub),
            Device::NotInstalled => {}
        }
    }

    /// Interrupting-devices bitmap for a line: bit n set when device n has
    /// an unacknowledged completion.
    pub fn pending_bitmap(&self, line: usize) -> u8 {
        let mut bits = 0u8;
        for (n, d) in self.lines[line - FIRST_DEV_LINE].iter().enumerate() {
            if d.pending() {
                bits |= 1 << n;
            }
        }
        bits
    }

    /// Lines with at least one interrupting device, as a bitmask over 3..8.
    pub fn pending_lines(&self) -> u32 {
        let mut mask = 0;
        for line in FIRST_DEV_LINE..=LAST_DEV_LINE {
            if self.pending_bitmap(line) != 0 {
                mask |= 1 << line;
            }
        }
        mask
    }

    // ------------------------------------------------------------------
    // Embedder hooks
    // ------------------------------------------------------------------

    pub fn flash_mut(&mut self, dev: usize) -> Option<&mut Flash> {
        match self.dev_mut(LINE_FLASH, dev) {
            Device::Flash(f) => Some(f),
            _ => None,
        }
    }

    pub fn flash(&self, dev: usize) -> Option<&Flash> {
        match self.dev(LINE_FLASH, dev) {
            Device::Flash(f) => Some(f),
            _ => None,
        }
    }

    pub fn disk(&self, dev: usize) -> Option<&Disk> {
        match self.dev(LINE_DISK, dev) {
            Device::Disk(d) => Some(d),
            _ => None,
        }
    }

    pub fn terminal_mut(&mut self, dev: usize) -> Option<&mut Terminal> {
        match self.dev_mut(LINE_TERMINAL, dev) {
            Device::Terminal(t) => Some(t),
            _ => None,
        }
    }

    pub fn terminal(&self, dev: usize) -> Option<&Terminal> {
        match self.dev(LINE_TERMINAL, dev) {
            Device::Terminal(t) => Some(t),
            _ => None,
        }
    }

    pub fn printer(&self, dev: usize) -> Option<&Printer> {
        match self.dev(LINE_PRINTER, dev) {
            Device::Printer(p) => Some(p),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flash_block_round_trip() {
        let mut devs = DeviceFile::standard();
        let mut ram = Ram::new();
        let buf = frame_addr(40);
        ram.write_word(buf, 0xCAFE_F00D);

        devs.write_reg(LINE_FLASH, 2, REG_DATA0, buf);
        let sched = devs
            .write_reg(LINE_FLASH, 2, REG_COMMAND, (33 << 8) | FLASH_WRITEBLK)
            .expect("write should schedule a completion");
        assert_eq!(sched.latency, FLASH_XFER_US);
        assert_eq!(devs.read_reg(LINE_FLASH, 2, REG_STATUS), STAT_BUSY);

        devs.complete(LINE_FLASH, 2, 0, &mut ram);
        assert_eq!(devs.read_reg(LINE_FLASH, 2, REG_STATUS), STAT_READY);
        assert_eq!(devs.pending_bitmap(LINE_FLASH), 1 << 2);

        // Read it back into a different frame.
        let buf2 = frame_addr(41);
        devs.write_reg(LINE_FLASH, 2, REG_COMMAND, CMD_ACK);
        devs.write_reg(LINE_FLASH, 2, REG_DATA0, buf2);
        devs.write_reg(LINE_FLASH, 2, REG_COMMAND, (33 << 8) | FLASH_READBLK);
        devs.complete(LINE_FLASH, 2, 0, &mut ram);
        assert_eq!(ram.read_word(buf2), Some(0xCAFE_F00D));
    }

    #[test]
    fn flash_rejects_out_of_range_block() {
        let mut devs = DeviceFile::standard();
        let mut ram = Ram::new();
        devs.write_reg(LINE_FLASH, 0, REG_DATA0, frame_addr(40));
        devs.write_reg(
            LINE_FLASH,
            0,
            REG_COMMAND,
            (FLASH_BLOCKS << 8) | FLASH_READBLK,
        );
        devs.complete(LINE_FLASH, 0, 0, &mut ram);
        assert_eq!(devs.read_reg(LINE_FLASH, 0, REG_STATUS), STAT_ILLEGAL);
    }

    #[test]
    fn disk_seek_then_transfer() {
        let mut devs = DeviceFile::standard();
        let mut ram = Ram::new();
        let buf = frame_addr(42);
        ram.write_word(buf + 8, 0x5555_AAAA);

        let s = devs
            .write_reg(LINE_DISK, 1, REG_COMMAND, (3 << 8) | DISK_SEEKCYL)
            .unwrap();
        assert_eq!(s.latency, 100 + 3 * DISK_SEEK_US_PER_CYL);
        devs.complete(LINE_DISK, 1, 0, &mut ram);
        devs.write_reg(LINE_DISK, 1, REG_COMMAND, CMD_ACK);

        devs.write_reg(LINE_DISK, 1, REG_DATA0, buf);
        devs.write_reg(
            LINE_DISK,
            1,
            REG_COMMAND,
            (1 << 16) | (4 << 8) | DISK_WRITEBLK,
        );
        devs.complete(LINE_DISK, 1, 0, &mut ram);
        assert_eq!(devs.read_reg(LINE_DISK, 1, REG_STATUS), STAT_READY);
        devs.write_reg(LINE_DISK, 1, REG_COMMAND, CMD_ACK);

        // Read back through a different buffer.
        let buf2 = frame_addr(43);
        devs.write_reg(LINE_DISK, 1, REG_DATA0, buf2);
        devs.write_reg(
            LINE_DISK,
            1,
            REG_COMMAND,
            (1 << 16) | (4 << 8) | DISK_READBLK,
        );
        devs.complete(LINE_DISK, 1, 0, &mut ram);
        assert_eq!(ram.read_word(buf2 + 8), Some(0x5555_AAAA));
    }

    #[test]
    fn terminal_sub_devices_are_independent() {
        let mut devs = DeviceFile::standard();
        let mut ram = Ram::new();
        devs.terminal_mut(0).unwrap().push_input(b"x");

        devs.write_reg(LINE_TERMINAL, 0, REG_RECV_COMMAND, TERM_RECEIVE);
        devs.write_reg(
            LINE_TERMINAL,
            0,
            REG_TRANSM_COMMAND,
            (b'y' as u32) << 8 | TERM_TRANSMIT,
        );
        devs.complete(LINE_TERMINAL, 0, 0, &mut ram);
        devs.complete(LINE_TERMINAL, 0, 1, &mut ram);

        let recv = devs.read_reg(LINE_TERMINAL, 0, REG_RECV_STATUS);
        let transm = devs.read_reg(LINE_TERMINAL, 0, REG_TRANSM_STATUS);
        assert_eq!(recv & 0xFF, STAT_CHAR_OK);
        assert_eq!(recv >> 8, b'x' as u32);
        assert_eq!(transm & 0xFF, STAT_CHAR_OK);
        assert_eq!(transm >> 8, b'y' as u32);
        assert_eq!(devs.terminal(0).unwrap().output(), b"y");

        // ACK one half; the other keeps the line pending.
        devs.write_reg(LINE_TERMINAL, 0, REG_TRANSM_COMMAND, CMD_ACK);
        assert_eq!(devs.pending_bitmap(LINE_TERMINAL), 1);
        devs.write_reg(LINE_TERMINAL, 0, REG_RECV_COMMAND, CMD_ACK);
        assert_eq!(devs.pending_bitmap(LINE_TERMINAL), 0);
    }

    #[test]
    fn drained_terminal_input_yields_eot() {
        let mut devs = DeviceFile::standard();
        let mut ram = Ram::new();
        devs.write_reg(LINE_TERMINAL, 1, REG_RECV_COMMAND, TERM_RECEIVE);
        devs.complete(LINE_TERMINAL, 1, 0, &mut ram);
        assert_eq!(
            devs.read_reg(LINE_TERMINAL, 1, REG_RECV_STATUS) >> 8,
            TERM_EOT as u32
        );
    }

    #[test]
    fn network_line_is_empty() {
        let devs = DeviceFile::standard();
        assert_eq!(devs.read_reg(LINE_NET, 0, REG_STATUS), STAT_NOT_INSTALLED);
        assert_eq!(devs.pending_bitmap(LINE_NET), 0);
    }
}
