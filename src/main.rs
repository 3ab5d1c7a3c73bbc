//! Command-line front end for the virtual machine.
//!
//! # Usage
//! ```text
//! vcore <file 1> [file 2] ... [file N] [--debug]
//! ```
//!
//! Source files are concatenated in the order given; the first instruction
//! of the first file executes first. With `--debug` the machine starts in a
//! single-step prompt with breakpoints and a state view after every step.
//!
//! The process exits 0 only when the program powers the machine off; any
//! other terminal outcome prints the failing instruction and exits 1.

use std::collections::HashSet;
use std::env;
use std::fs;
use std::io::{self, BufRead, Write};
use std::process;

use vcore::error;
use vcore::machine::assembler;
use vcore::machine::errors::VmError;
use vcore::machine::instruction::INSTRUCTION_BYTES;
use vcore::machine::memory::RESERVED_BYTES;
use vcore::machine::vm::Machine;

fn print_usage(program: &str) {
    eprintln!("Usage: {program} <file 1> [file 2] ... [file N] [--debug]");
}

fn main() {
    let args: Vec<String> = env::args().collect();

    let mut files = Vec::new();
    let mut debug = false;
    for arg in &args[1..] {
        match arg.as_str() {
            "--debug" => debug = true,
            "--help" | "-h" => {
                print_usage(&args[0]);
                process::exit(0);
            }
            _ => files.push(arg.clone()),
        }
    }

    if files.is_empty() {
        print_usage(args.first().map(String::as_str).unwrap_or("vcore"));
        process::exit(1);
    }

    // Concatenate every source file, in order, into one line buffer.
    let mut lines = Vec::new();
    for file in &files {
        match fs::read_to_string(file) {
            Ok(text) => lines.extend(text.lines().map(str::to_string)),
            Err(err) => {
                error!("could not read {file}: {err}");
                process::exit(1);
            }
        }
    }

    let program = match assembler::assemble(&lines, debug) {
        Ok(program) => program,
        Err(err) => {
            eprintln!("{err}");
            process::exit(1);
        }
    };

    let code = if debug {
        match Machine::captured(program) {
            Ok((machine, _output)) => run_debug_mode(machine),
            Err(err) => {
                eprintln!("{err}");
                1
            }
        }
    } else {
        match Machine::new(program) {
            Ok(machine) => run_to_completion(machine),
            Err(err) => {
                eprintln!("{err}");
                1
            }
        }
    };
    process::exit(code);
}

fn run_to_completion(mut machine: Machine) -> i32 {
    match machine.run(false) {
        // The only clean way out.
        Err(VmError::SystemShutdown) => 0,
        Err(err) => {
            eprintln!("{}", machine.error_report(&err));
            1
        }
        Ok(()) => 0,
    }
}

/// Interactive single-step prompt: `next`, `run`, `break <addr>`,
/// `program`. Breakpoints toggle; hitting one returns to the prompt.
fn run_debug_mode(mut machine: Machine) -> i32 {
    println!(
        "Commands:\n\tn or next: execute next instruction\n\tr or run: run program\n\
\tb or break <addr>: break at instruction address (repeat to remove)\n\
\tprogram: print the program listing\n"
    );
    print!("{machine}");

    let stdin = io::stdin();
    let mut wait_for_input = true;
    let mut breakpoints: HashSet<u32> = HashSet::new();
    let mut last_break: Option<u32> = None;

    loop {
        let mut line = String::new();
        if wait_for_input {
            print!("\n->");
            let _ = io::stdout().flush();
            if stdin.lock().read_line(&mut line).unwrap_or(0) == 0 {
                return 1;
            }
            line = line.trim().to_lowercase();
        } else {
            let pc = machine.pc();
            if breakpoints.contains(&pc) && last_break != Some(pc) {
                println!("breakpoint");
                print!("{machine}");
                wait_for_input = true;
                last_break = Some(pc);
                continue;
            }
        }

        if !wait_for_input || line == "n" || line == "next" {
            last_break = None;
            match machine.run(true) {
                Ok(()) => {
                    if wait_for_input {
                        print!("{machine}");
                    }
                }
                Err(VmError::SystemShutdown) => {
                    print!("{machine}");
                    return 0;
                }
                Err(err) => {
                    print!("{machine}");
                    eprintln!("{}", machine.error_report(&err));
                    return 1;
                }
            }
        } else if line == "program" {
            print_program(&machine);
        } else if line == "r" || line == "run" {
            wait_for_input = false;
        } else if line.starts_with('b') {
            let arg = line
                .trim_start_matches("break")
                .trim_start_matches('b')
                .trim();
            match parse_address(arg) {
                Some(addr) if breakpoints.contains(&addr) => {
                    breakpoints.remove(&addr);
                }
                Some(addr) => {
                    breakpoints.insert(addr);
                }
                None => println!("Unknown address: {arg}"),
            }
        }
    }
}

fn print_program(machine: &Machine) {
    let mut addr = RESERVED_BYTES;
    while addr < machine.image_end() {
        if let Some(instr) = machine.instruction_string_at(addr) {
            println!("0x{addr:04X}: {instr}");
        }
        addr += INSTRUCTION_BYTES;
    }
}

fn parse_address(text: &str) -> Option<u32> {
    if let Some(hex) = text.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}
