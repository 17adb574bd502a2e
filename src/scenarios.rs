//! End-to-end scenario suites: whole boots driven to halt.
//!
//! The nucleus suite runs kernel-mode scripts on a bare system (no support
//! boot chain); the support suite boots the full instantiator path with
//! user processes, demand paging, and devices. Timings are exact because
//! the clock is virtual: quantum 5 ms, tick 100 ms, device latencies from
//! `consts`.

use crate::consts::*;
use crate::program::{Op, Script};
use crate::state::ProcessorState;
use crate::system::{Halt, System, SystemBuilder, UserImage};
use crate::test_utils::*;

mod nucleus_scenarios {
    use super::*;

    fn kernel_state() -> ProcessorState {
        ProcessorState::kernel(INSTANTIATOR_ENTRY, NUCLEUS_STACK_TOP)
    }

    #[test]
    fn create_then_terminate_reaps_the_whole_family() {
        try_init_logging();
        // Parent spawns two children that block forever, outlives its
        // quantum, then exits; termination must dismantle everyone.
        let parent = Script::kernel(vec![
            Op::Spawn {
                state: kernel_state(),
                body: Box::new(block_forever(0x9000)),
            },
            Op::Spawn {
                state: kernel_state(),
                body: Box::new(block_forever(0x9000)),
            },
            Op::Compute(7_000),
        ]);
        let mut sys = System::with_init(Box::new(parent));
        assert_eq!(sys.run(), Halt::Normal);
        assert_eq!(sys.kernel.process_count, 0);
        assert_eq!(sys.kernel.soft_block_count, 0);
        assert!(sys.kernel.asl.active().is_empty());
        assert!(sys.kernel.ready_high.is_empty());
        assert!(sys.kernel.ready_low.is_empty());
    }

    #[test]
    fn semaphore_wakes_are_fifo() {
        try_init_logging();
        const SEM: u32 = 0x9100;
        const DONE: u32 = 0x9104;
        let c1 = frame_addr(50);
        let c2 = frame_addr(50) + 4;

        // A and B block on SEM in order; C releases it twice. FIFO means A
        // runs (and writes both cells) before B (which overwrites one).
        let a = Script::kernel(vec![
            Op::Syscall(SYS_PASSEREN, SEM, 0, 0),
            Op::Store(c1, 0xA),
            Op::Store(c2, 0xA),
        ]);
        let b = Script::kernel(vec![Op::Syscall(SYS_PASSEREN, SEM, 0, 0), Op::Store(c2, 0xB)]);
        let c = Script::kernel(vec![
            Op::Syscall(SYS_VERHOGEN, SEM, 0, 0),
            Op::Syscall(SYS_VERHOGEN, SEM, 0, 0),
            Op::Syscall(SYS_VERHOGEN, DONE, 0, 0),
        ]);
        let parent = Script::kernel(vec![
            Op::Spawn {
                state: kernel_state(),
                body: Box::new(a),
            },
            Op::Spawn {
                state: kernel_state(),
                body: Box::new(b),
            },
            Op::Spawn {
                state: kernel_state(),
                body: Box::new(c),
            },
            Op::Syscall(SYS_PASSEREN, DONE, 0, 0),
        ]);
        let mut sys = System::with_init(Box::new(parent));
        assert_eq!(sys.run(), Halt::Normal);
        assert_eq!(sys.machine.ram.read_word(c1), Some(0xA));
        assert_eq!(sys.machine.ram.read_word(c2), Some(0xB));
    }

    #[test]
    fn quantum_expiry_demotes_the_runner() {
        try_init_logging();
        const DONE: u32 = 0x9200;
        let cell = frame_addr(51);

        // X computes past its quantum; Y is short. Preemption means Y
        // finishes during X's demotion, so X writes the cell last.
        let x = Script::kernel(vec![
            Op::Compute(7_000),
            Op::Store(cell, 0xAA),
            Op::Syscall(SYS_VERHOGEN, DONE, 0, 0),
        ]);
        let y = Script::kernel(vec![Op::Compute(1_000), Op::Store(cell, 0xBB)]);
        let parent = Script::kernel(vec![
            Op::Spawn {
                state: kernel_state(),
                body: Box::new(x),
            },
            Op::Spawn {
                state: kernel_state(),
                body: Box::new(y),
            },
            Op::Syscall(SYS_PASSEREN, DONE, 0, 0),
        ]);
        let mut sys = System::with_init(Box::new(parent));
        assert_eq!(sys.run(), Halt::Normal);
        assert_eq!(sys.machine.ram.read_word(cell), Some(0xAA));
        assert!(sys.now() >= 8_000, "X needed 7ms of CPU plus Y's 1ms");
    }

    #[test]
    fn wait_clock_sleeps_in_whole_ticks() {
        try_init_logging();
        let script = Script::kernel(vec![
            Op::Syscall(SYS_WAIT_CLOCK, 0, 0, 0),
            Op::Syscall(SYS_WAIT_CLOCK, 0, 0, 0),
        ]);
        let mut sys = System::with_init(Box::new(script));
        assert_eq!(sys.run(), Halt::Normal);
        assert!(sys.now() >= 2 * TICK_US);
        assert!(sys.now() < 3 * TICK_US);
    }

    #[test]
    fn blocked_process_with_no_wakeup_is_deadlock() {
        try_init_logging();
        let mut sys = System::with_init(Box::new(block_forever(0x9300)));
        assert_eq!(sys.run(), Halt::Deadlock);
        assert_eq!(sys.kernel.process_count, 1);
    }

    #[test]
    fn pcb_pool_exhaustion_returns_minus_one() {
        try_init_logging();
        // Spawn more children than the pool holds; the overflow returns -1
        // in v0 instead of a process.
        let mut ops = Vec::new();
        for _ in 0..MAX_PROC + 3 {
            ops.push(Op::Spawn {
                state: kernel_state(),
                body: Box::new(block_forever(0x9400)),
            });
        }
        let parent = Script::kernel(ops);
        let returns = parent.returns();
        let mut sys = System::with_init(Box::new(parent));
        assert_eq!(sys.run(), Halt::Normal);
        let log = returns.borrow();
        // One PCB goes to the parent itself.
        let ok = log.iter().filter(|&&v| v == 0).count();
        let failed = log.iter().filter(|&&v| v == u32::MAX).count();
        assert_eq!(ok, MAX_PROC - 1);
        assert_eq!(failed, 4);
    }
}

mod support_scenarios {
    use super::*;

    #[test]
    fn terminal_write_counts_characters() {
        try_init_logging();
        let buf = stack_buf();
        let payload = b"hi\n\0";
        let mut ops = store_bytes(buf, payload);
        ops.push(Op::Syscall(SYS_WRITE_TERMINAL, buf, payload.len() as u32, 0));
        let script = Script::user(ops);
        let returns = script.returns();

        let mut sys = SystemBuilder::new()
            .uproc(Box::new(script), UserImage::new(1))
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        assert_eq!(sys.terminal_output(0), payload);
        assert_eq!(returns.borrow().last(), Some(&4));
    }

    #[test]
    fn terminal_read_stops_at_newline() {
        try_init_logging();
        let buf = stack_buf();
        let mut ops = vec![Op::Syscall(SYS_READ_TERMINAL, buf, 0, 0)];
        ops.extend(load_bytes(buf, 3));
        let script = Script::user(ops);
        let returns = script.returns();

        let mut sys = SystemBuilder::new()
            .uproc(Box::new(script), UserImage::new(1))
            .terminal_input(0, b"ok\nrest stays queued")
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        let log = returns.borrow();
        assert_eq!(log[0], 3, "count includes the newline");
        assert_eq!(&log[1..], &[b'o' as u32, b'k' as u32, b'\n' as u32]);
    }

    #[test]
    fn printer_write_reaches_the_paper() {
        try_init_logging();
        let buf = user_page_addr(1);
        let payload = b"report";
        let mut ops = store_bytes(buf, payload);
        ops.push(Op::Syscall(SYS_WRITE_PRINTER, buf, payload.len() as u32, 0));
        let script = Script::user(ops);

        let mut sys = SystemBuilder::new()
            .uproc(Box::new(script), UserImage::new(1))
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        assert_eq!(sys.printer_output(0), payload);
    }

    #[test]
    fn eviction_round_trips_through_the_backing_store() {
        try_init_logging();
        // One process touches more distinct pages than the swap pool holds,
        // forcing dirty evictions, then reads everything back.
        let pages = SWAP_POOL_SIZE + 1;
        let mut ops = Vec::new();
        for i in 1..=pages {
            ops.push(Op::StoreByte(user_page_addr(i), 0x40 + i as u8));
        }
        for i in 1..=pages {
            ops.push(Op::LoadByte(user_page_addr(i)));
        }
        let script = Script::user(ops);
        let returns = script.returns();

        let mut sys = SystemBuilder::new()
            .uproc(Box::new(script), UserImage::new(1))
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        let log = returns.borrow();
        let expect: Vec<u32> = (1..=pages).map(|i| 0x40 + i as u32).collect();
        assert_eq!(&log[..], &expect[..]);
        // Termination swept the pool clean.
        assert!(sys.support.swap.iter().all(|e| e.asid.is_none()));
    }

    #[test]
    fn swap_pool_is_shared_under_pressure() {
        try_init_logging();
        // Eight processes, three data pages each: 24 live pages against a
        // 16-frame pool. Everyone still reads back what it wrote.
        let mut builder = SystemBuilder::new();
        let mut logs = Vec::new();
        for asid in 1..=UPROC_MAX {
            let mut ops = Vec::new();
            for p in 1..=3 {
                ops.push(Op::StoreByte(user_page_addr(p), (asid * 8 + p) as u8));
            }
            // Give every peer a chance to steal frames in between.
            ops.push(Op::Compute(2_000));
            for p in 1..=3 {
                ops.push(Op::LoadByte(user_page_addr(p)));
            }
            let script = Script::user(ops);
            logs.push(script.returns());
            builder = builder.uproc(Box::new(script), UserImage::new(1));
        }
        let mut sys = builder.build().unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        for (i, log) in logs.iter().enumerate() {
            let asid = i + 1;
            let expect: Vec<u32> = (1..=3).map(|p| (asid * 8 + p) as u32).collect();
            assert_eq!(&log.borrow()[..], &expect[..], "asid {asid}");
        }
        assert!(sys.support.swap.iter().all(|e| e.asid.is_none()));
    }

    #[test]
    fn delay_resumes_after_the_requested_seconds() {
        try_init_logging();
        let script = Script::user(vec![Op::Syscall(SYS_DELAY, 2, 0, 0)]);
        let mut sys = SystemBuilder::new()
            .uproc(Box::new(script), UserImage::new(1))
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        // Resumption lands on the first tick at or after the deadline.
        assert!(sys.now() >= 2_000_000);
        assert!(sys.now() <= 2_000_000 + TICK_US);
        assert!(sys.support.adl.is_empty());
    }

    #[test]
    fn flash_put_get_round_trip() {
        try_init_logging();
        let buf = user_page_addr(1);
        let payload = b"persistent bytes";
        let block = FLASH_RESERVED_BLOCKS + 8;

        let mut ops = store_bytes(buf, payload);
        ops.push(Op::Syscall(SYS_FLASH_PUT, buf, 5, block));
        // Scribble over the buffer, then read the block back.
        ops.extend(store_bytes(buf, &[0u8; 16]));
        ops.push(Op::Syscall(SYS_FLASH_GET, buf, 5, block));
        ops.extend(load_bytes(buf, payload.len()));
        let script = Script::user(ops);
        let returns = script.returns();

        let mut sys = SystemBuilder::new()
            .uproc(Box::new(script), UserImage::new(1))
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        let log = returns.borrow();
        let n = log.len();
        // Two successful device ops, then the bytes.
        assert_eq!(log[n - payload.len() - 1 - 1], STAT_READY);
        let tail: Vec<u32> = payload.iter().map(|&b| b as u32).collect();
        assert_eq!(&log[n - payload.len()..], &tail[..]);
        // The block really lives on the device.
        let store = sys.machine.devices.flash(5).unwrap().store();
        let off = block as usize * PAGE_SIZE;
        assert_eq!(&store[off..off + payload.len()], payload);
    }

    #[test]
    fn disk_put_get_round_trip_with_geometry() {
        try_init_logging();
        let buf = user_page_addr(1);
        let payload = b"spinning rust";
        // A sector that needs a non-zero cylinder and head.
        let sector = DISK_HEADS * DISK_SECTORS * 3 + DISK_SECTORS + 2;

        let mut ops = store_bytes(buf, payload);
        ops.push(Op::Syscall(SYS_DISK_PUT, buf, 2, sector));
        ops.extend(store_bytes(buf, &[0u8; 13]));
        ops.push(Op::Syscall(SYS_DISK_GET, buf, 2, sector));
        ops.extend(load_bytes(buf, payload.len()));
        let script = Script::user(ops);
        let returns = script.returns();

        let mut sys = SystemBuilder::new()
            .uproc(Box::new(script), UserImage::new(1))
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        let log = returns.borrow();
        let tail: Vec<u32> = payload.iter().map(|&b| b as u32).collect();
        assert_eq!(&log[log.len() - payload.len()..], &tail[..]);
    }

    #[test]
    fn reserved_flash_blocks_kill_the_caller() {
        try_init_logging();
        let victim = Script::user(vec![Op::Syscall(
            SYS_FLASH_PUT,
            user_page_addr(1),
            0,
            FLASH_RESERVED_BLOCKS - 1,
        )]);
        let bystander = {
            let buf = stack_buf();
            let mut ops = store_bytes(buf, b"x");
            ops.push(Op::Syscall(SYS_WRITE_TERMINAL, buf, 1, 0));
            Script::user(ops)
        };
        // The bystander writes on its own terminal (asid 2 -> terminal 1).
        let mut sys = SystemBuilder::new()
            .uproc(Box::new(victim), UserImage::new(1))
            .uproc(Box::new(bystander), UserImage::new(1))
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        assert_eq!(sys.terminal_output(1), b"x");
        assert!(sys.support.swap.iter().all(|e| e.asid.is_none()));
    }

    #[test]
    fn privileged_syscall_from_user_mode_is_fatal() {
        try_init_logging();
        let script = Script::user(vec![Op::Syscall(SYS_PASSEREN, 0x9000, 0, 0)]);
        let mut sys = SystemBuilder::new()
            .uproc(Box::new(script), UserImage::new(1))
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        assert_eq!(sys.kernel.process_count, 0);
    }

    #[test]
    fn unknown_service_numbers_are_fatal() {
        try_init_logging();
        let script = Script::user(vec![Op::Syscall(99, 0, 0, 0)]);
        let mut sys = SystemBuilder::new()
            .uproc(Box::new(script), UserImage::new(1))
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
    }

    #[test]
    fn store_into_text_pages_is_fatal() {
        try_init_logging();
        // Two text pages: page 1 is read-only, so the write faults in a
        // clean page and the retried store trips the modify trap.
        let script = Script::user(vec![Op::StoreByte(user_page_addr(1), 0xEE)]);
        let mut sys = SystemBuilder::new()
            .uproc(Box::new(script), UserImage::new(2))
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        assert_eq!(sys.kernel.process_count, 0);
    }

    #[test]
    fn get_tod_reports_accumulated_cpu_time() {
        try_init_logging();
        let script = Script::user(vec![Op::Compute(3_000), Op::Syscall(SYS_GET_TOD, 0, 0, 0)]);
        let returns = script.returns();
        let mut sys = SystemBuilder::new()
            .uproc(Box::new(script), UserImage::new(1))
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        let v = *returns.borrow().last().unwrap();
        assert!(v >= 3_000, "computed 3ms, got {v}us");
        assert!(v < 10_000);
    }

    #[test]
    fn delay_rejects_negative_seconds() {
        try_init_logging();
        let script = Script::user(vec![Op::Syscall(SYS_DELAY, (-1i32) as u32, 0, 0)]);
        let mut sys = SystemBuilder::new()
            .uproc(Box::new(script), UserImage::new(1))
            .build()
            .unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        assert!(sys.support.adl.is_empty());
    }

    #[test]
    fn many_uprocs_with_delays_and_io_retire_cleanly() {
        try_init_logging();
        let mut builder = SystemBuilder::new();
        for asid in 1..=4usize {
            let buf = stack_buf();
            let line = format!("proc {asid}\n");
            let mut ops = vec![Op::Syscall(SYS_DELAY, asid as u32 % 2, 0, 0)];
            ops.extend(store_bytes(buf, line.as_bytes()));
            ops.push(Op::Syscall(SYS_WRITE_TERMINAL, buf, line.len() as u32, 0));
            builder = builder.uproc(Box::new(Script::user(ops)), UserImage::new(1));
        }
        let mut sys = builder.build().unwrap();
        assert_eq!(sys.run(), Halt::Normal);
        for asid in 1..=4usize {
            let line = format!("proc {asid}\n");
            assert_eq!(sys.terminal_output(asid - 1), line.as_bytes());
        }
        assert_eq!(sys.kernel.process_count, 0);
        assert_eq!(sys.kernel.soft_block_count, 0);
    }
}
