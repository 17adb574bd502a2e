/*!
The instantiator: first process of a booted system.

Runs in kernel mode. It launches the delay daemon, then walks the
registered user programs: for each one it reads the image header from the
program's backing flash device over the normal DMA protocol, claims a
support structure, and creates the user process (user mode, interrupts on,
ASID tagged, PC at the image entry, SP at the stack top). Images with a bad
header, and ASIDs whose support structure cannot be claimed, are skipped;
the process is simply never created.

It then waits on the master termination semaphore once per created child
and terminates itself, which reaps the daemon and lets the scheduler halt
the machine normally.
*/

use log::{info, warn};

use crate::consts::*;
use crate::program::{Action, Ctx, Program};
use crate::state::ProcessorState;
use crate::support::blockio::{BlockIo, IoStep};
use crate::support::delay::DelayDaemon;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    SpawnDaemon,
    NextImage,
    ReadHeader,
    AwaitMaster,
    Done,
}

pub struct Instantiator {
    stage: Stage,
    next_uproc: usize,
    created: usize,
    reaped: usize,
    io: Option<BlockIo>,
}

impl Instantiator {
    pub fn new() -> Self {
        Instantiator {
            stage: Stage::SpawnDaemon,
            next_uproc: 0,
            created: 0,
            reaped: 0,
            io: None,
        }
    }

    /// Parse the image header out of the staging buffer: magic word, text
    /// size, total size.
    fn parse_header(cx: &Ctx<'_>) -> Option<u32> {
        let base = frame_addr(INSTALLER_BUF_FRAME);
        let magic = cx.machine.ram.read_word(base + IMAGE_HDR_MAGIC_OFF as u32)?;
        if magic != IMAGE_MAGIC {
            return None;
        }
        cx.machine
            .ram
            .read_word(base + IMAGE_HDR_TEXT_SIZE_OFF as u32)
    }

    fn launch(&mut self, cx: &mut Ctx<'_>, text_size: u32) -> Option<Action> {
        let asid = self.next_uproc + 1;
        let body = cx.support.registry.get_mut(self.next_uproc)?.take()?;
        if !cx.support.alloc(asid, text_size) {
            warn!("no support structure for asid {asid}, skipping");
            return None;
        }
        let state = ProcessorState::user(UPROC_START, USTACK_TOP, asid);
        self.created += 1;
        info!("launching user process asid {asid} (text {text_size} bytes)");
        Some(Action::Spawn {
            state,
            support: Some(asid),
            body,
        })
    }
}

impl Default for Instantiator {
    fn default() -> Self {
        Instantiator::new()
    }
}

impl Program for Instantiator {
    fn next(&mut self, cx: &mut Ctx<'_>) -> Action {
        loop {
            match self.stage {
                Stage::SpawnDaemon => {
                    self.stage = Stage::NextImage;
                    return Action::Spawn {
                        state: ProcessorState::kernel(DAEMON_ENTRY, NUCLEUS_STACK_TOP),
                        support: None,
                        body: Box::new(DelayDaemon::new()),
                    };
                }
                Stage::NextImage => {
                    if self.next_uproc >= cx.support.registry.len() {
                        self.stage = Stage::AwaitMaster;
                        continue;
                    }
                    self.io = Some(BlockIo::flash(
                        self.next_uproc,
                        0,
                        frame_addr(INSTALLER_BUF_FRAME),
                        false,
                    ));
                    self.stage = Stage::ReadHeader;
                    match self.io.as_mut().unwrap().step(cx, None) {
                        IoStep::Do(a) => return a,
                        IoStep::Done(_) => unreachable!("fresh block io cannot be done"),
                    }
                }
                Stage::ReadHeader => {
                    match self.io.as_mut().expect("header io missing").step(cx, None) {
                        IoStep::Do(a) => return a,
                        IoStep::Done(status) => {
                            let header = (status == STAT_READY)
                                .then(|| Self::parse_header(cx))
                                .flatten();
                            match header {
                                Some(text_size) => {
                                    if let Some(spawn) = self.launch(cx, text_size) {
                                        self.next_uproc += 1;
                                        self.stage = Stage::NextImage;
                                        return spawn;
                                    }
                                    self.next_uproc += 1;
                                    self.stage = Stage::NextImage;
                                }
                                None => {
                                    warn!(
                                        "flash device {} holds no bootable image, skipping",
                                        self.next_uproc
                                    );
                                    self.next_uproc += 1;
                                    self.stage = Stage::NextImage;
                                }
                            }
                        }
                    }
                }
                Stage::AwaitMaster => {
                    if self.reaped < self.created {
                        self.reaped += 1;
                        return Action::Syscall {
                            code: SYS_PASSEREN,
                            a1: MASTER_SEM_ADDR,
                            a2: 0,
                            a3: 0,
                        };
                    }
                    info!("all {} user processes retired", self.created);
                    self.stage = Stage::Done;
                }
                Stage::Done => {
                    return Action::Syscall {
                        code: SYS_TERMINATE_PROCESS,
                        a1: 0,
                        a2: 0,
                        a3: 0,
                    };
                }
            }
        }
    }
}
