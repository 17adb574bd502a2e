use minos::consts::{SYS_DELAY, SYS_READ_TERMINAL, SYS_WRITE_PRINTER, SYS_WRITE_TERMINAL};
use minos::{Halt, Op, Script, SystemBuilder, UserImage};

// Scratch space in each process's stack page.
const BUF: u32 = 0xBFFF_F000;

/// One StoreByte op per character of `bytes`, starting at `addr`.
fn store_string(addr: u32, bytes: &[u8]) -> Vec<Op> {
    bytes
        .iter()
        .enumerate()
        .map(|(i, &b)| Op::StoreByte(addr + i as u32, b))
        .collect()
}

fn main() {
    env_logger::init();

    // Three user processes: a greeter on terminal 0, a delayed printer
    // job, and an echo of terminal 2's input back to its own screen.
    let greeting = b"hello from asid 1\n";
    let mut ops = vec![Op::Compute(1_200)];
    ops.extend(store_string(BUF, greeting));
    ops.push(Op::Syscall(SYS_WRITE_TERMINAL, BUF, greeting.len() as u32, 0));
    let greeter = Script::user(ops);

    let report = b"delayed job done\n";
    let mut ops = vec![Op::Syscall(SYS_DELAY, 2, 0, 0)];
    ops.extend(store_string(BUF, report));
    ops.push(Op::Syscall(SYS_WRITE_PRINTER, BUF, report.len() as u32, 0));
    let sleeper = Script::user(ops);

    let echo = Script::user(vec![
        Op::Syscall(SYS_READ_TERMINAL, BUF, 0, 0),
        // Echo back however many characters arrived, newline included.
        Op::Syscall(SYS_WRITE_TERMINAL, BUF, 6, 0),
    ]);

    let mut system = SystemBuilder::new()
        .uproc(Box::new(greeter), UserImage::new(1))
        .uproc(Box::new(sleeper), UserImage::new(1))
        .uproc(Box::new(echo), UserImage::new(1))
        .terminal_input(2, b"ping!\n")
        .build()
        .expect("demo system should assemble");

    let halt = system.run();

    println!("halt: {halt:?} at {}us of virtual time", system.now());
    println!(
        "terminal 0: {}",
        String::from_utf8_lossy(system.terminal_output(0))
    );
    println!(
        "terminal 2: {}",
        String::from_utf8_lossy(system.terminal_output(2))
    );
    println!(
        "printer 1:  {}",
        String::from_utf8_lossy(system.printer_output(1))
    );
    assert_eq!(halt, Halt::Normal);
}
