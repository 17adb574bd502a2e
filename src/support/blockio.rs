/*!
The atomic block I/O protocol shared by the pager, the disk/flash
services, and the instantiator's image loader.

Per operation: acquire the device mutex, program `data0` with the DMA
frame and write the command word, block on WaitIO, and release the mutex.
The mutex is held across the command/wait pair so the wakeup matches this
caller. Disk operations are two waits under one hold: SEEKCYL first, then
the transfer with head/sector packed into the command word.

`BlockIo` is a resumable state machine: `step` yields the next nucleus
syscall to issue (P, WaitIO, V) until the operation finishes with the
device's completion status. Register programming happens inside the step
that issues the matching wait, so nothing can interleave between the
command write and the block.
*/

use crate::consts::*;
use crate::machine::Machine;
use crate::program::{Action, Ctx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Start,
    AwaitMutex,
    AwaitSeek,
    AwaitXfer,
    AwaitRelease,
}

pub enum IoStep {
    /// Issue this action and step again when it returns.
    Do(Action),
    /// Protocol finished; the device's final status.
    Done(u32),
}

#[derive(Debug)]
pub struct BlockIo {
    line: usize,
    dev: usize,
    dma_addr: u32,
    write: bool,
    /// Flash block number, or linear disk sector.
    target: u32,
    result: u32,
    stage: Stage,
}

impl BlockIo {
    pub fn flash(dev: usize, block: u32, dma_addr: u32, write: bool) -> Self {
        BlockIo {
            line: LINE_FLASH,
            dev,
            dma_addr,
            write,
            target: block,
            result: 0,
            stage: Stage::Start,
        }
    }

    pub fn disk(dev: usize, sector: u32, dma_addr: u32, write: bool) -> Self {
        BlockIo {
            line: LINE_DISK,
            dev,
            dma_addr,
            write,
            target: sector,
            result: 0,
            stage: Stage::Start,
        }
    }

    fn mutex_addr(&self) -> u32 {
        dev_mutex_addr(dev_sem_index(self.line, self.dev, false))
    }

    /// Split a linear disk sector into (cylinder, head, sector) using the
    /// geometry the device publishes in data1.
    pub fn disk_geometry(m: &Machine, dev: usize, linear: u32) -> (u32, u32, u32) {
        let data1 = m.dev_read(LINE_DISK, dev, REG_DATA1);
        let heads = (data1 >> 8) & 0xFF;
        let sects = data1 & 0xFF;
        let per_cyl = heads * sects;
        (linear / per_cyl, (linear % per_cyl) / sects, linear % sects)
    }

    /// Total sectors of a disk, from its published geometry.
    pub fn disk_capacity(m: &Machine, dev: usize) -> u32 {
        let data1 = m.dev_read(LINE_DISK, dev, REG_DATA1);
        (data1 >> 16) * ((data1 >> 8) & 0xFF) * (data1 & 0xFF)
    }

    /// Drive the protocol. `owner` names the support structure that should
    /// record the held mutex for termination cleanup (None for the
    /// instantiator, which has no support level).
    pub fn step(&mut self, cx: &mut Ctx<'_>, owner: Option<usize>) -> IoStep {
        match self.stage {
            Stage::Start => {
                self.stage = Stage::AwaitMutex;
                IoStep::Do(Action::Syscall {
                    code: SYS_PASSEREN,
                    a1: self.mutex_addr(),
                    a2: 0,
                    a3: 0,
                })
            }
            Stage::AwaitMutex => {
                if let Some(asid) = owner {
                    if let Some(s) = cx.support.get_mut(asid) {
                        s.held_mutex = Some(self.mutex_addr());
                    }
                }
                if self.line == LINE_DISK {
                    let (cyl, _, _) = Self::disk_geometry(cx.machine, self.dev, self.target);
                    cx.machine
                        .dev_write(self.line, self.dev, REG_COMMAND, (cyl << 8) | DISK_SEEKCYL);
                    self.stage = Stage::AwaitSeek;
                } else {
                    let op = if self.write {
                        FLASH_WRITEBLK
                    } else {
                        FLASH_READBLK
                    };
                    cx.machine
                        .dev_write(self.line, self.dev, REG_DATA0, self.dma_addr);
                    cx.machine
                        .dev_write(self.line, self.dev, REG_COMMAND, (self.target << 8) | op);
                    self.stage = Stage::AwaitXfer;
                }
                IoStep::Do(self.wait_io())
            }
            Stage::AwaitSeek => {
                let status = cx.resume.v0;
                if status != STAT_READY {
                    self.result = status;
                    self.stage = Stage::AwaitRelease;
                    return IoStep::Do(self.release(cx, owner));
                }
                let (_, head, sect) = Self::disk_geometry(cx.machine, self.dev, self.target);
                let op = if self.write {
                    DISK_WRITEBLK
                } else {
                    DISK_READBLK
                };
                cx.machine
                    .dev_write(self.line, self.dev, REG_DATA0, self.dma_addr);
                cx.machine.dev_write(
                    self.line,
                    self.dev,
                    REG_COMMAND,
                    (head << 16) | (sect << 8) | op,
                );
                self.stage = Stage::AwaitXfer;
                IoStep::Do(self.wait_io())
            }
            Stage::AwaitXfer => {
                self.result = cx.resume.v0;
                self.stage = Stage::AwaitRelease;
                IoStep::Do(self.release(cx, owner))
            }
            Stage::AwaitRelease => IoStep::Done(self.result),
        }
    }

    fn wait_io(&self) -> Action {
        Action::Syscall {
            code: SYS_WAIT_IO,
            a1: self.line as u32,
            a2: self.dev as u32,
            a3: 0,
        }
    }

    fn release(&self, cx: &mut Ctx<'_>, owner: Option<usize>) -> Action {
        if let Some(asid) = owner {
            if let Some(s) = cx.support.get_mut(asid) {
                s.held_mutex = None;
            }
        }
        Action::Syscall {
            code: SYS_VERHOGEN,
            a1: self.mutex_addr(),
            a2: 0,
            a3: 0,
        }
    }
}
