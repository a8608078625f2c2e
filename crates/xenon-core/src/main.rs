//! Xenon dynamic binary translator CLI.
//!
//! Loads a XEX2 title, starts one hardware thread at its entry point, and
//! runs it to completion under either the interpreter or the JIT.

use std::path::PathBuf;
use std::process;

use ppc_cpu::NullDispatch;
use xenon_core::{Config, ExecutionMode, Executor};
use xex_loader::DecompressOptions;

struct CliArgs {
    xex_path: Option<PathBuf>,
    mode: ExecutionMode,
    max_instructions: u64,
    verbose: bool,
}

fn parse_args() -> CliArgs {
    let args: Vec<String> = std::env::args().collect();
    let mut cli = CliArgs {
        xex_path: None,
        mode: ExecutionMode::Interpreter,
        max_instructions: 10_000_000,
        verbose: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--xex" => {
                i += 1;
                cli.xex_path = args.get(i).map(PathBuf::from);
            }
            "--mode" => {
                i += 1;
                match args.get(i).map(String::as_str) {
                    Some("interpreter") => cli.mode = ExecutionMode::Interpreter,
                    Some("jit") => cli.mode = ExecutionMode::Jit,
                    Some(other) => {
                        eprintln!("Unknown mode: {other} (expected \"interpreter\" or \"jit\")");
                        process::exit(1);
                    }
                    None => {
                        eprintln!("--mode requires an argument");
                        process::exit(1);
                    }
                }
            }
            "--max-instructions" => {
                i += 1;
                if let Some(s) = args.get(i) {
                    cli.max_instructions = s.parse().unwrap_or(10_000_000);
                }
            }
            "--verbose" => {
                cli.verbose = true;
            }
            "--help" | "-h" => {
                eprintln!("Usage: xenon-core --xex <file> [OPTIONS]");
                eprintln!();
                eprintln!("Options:");
                eprintln!("  --xex <file>             XEX2 title to load");
                eprintln!("  --mode <interpreter|jit> Execution backend [default: interpreter]");
                eprintln!("  --max-instructions <n>   Instruction budget [default: 10000000]");
                eprintln!("  --verbose                Dump thread state after running");
                process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                process::exit(1);
            }
        }
        i += 1;
    }

    cli
}

fn main() {
    env_logger::init();
    let cli = parse_args();

    let Some(xex_path) = cli.xex_path else {
        eprintln!("--xex is required; see --help");
        process::exit(1);
    };

    let data = match std::fs::read(&xex_path) {
        Ok(data) => data,
        Err(e) => {
            eprintln!("failed to read {}: {e}", xex_path.display());
            process::exit(1);
        }
    };

    let config = Config { mode: cli.mode, verbose: cli.verbose, ..Config::default() };
    let mut executor = match Executor::new(NullDispatch, config) {
        Ok(e) => e,
        Err(e) => {
            eprintln!("failed to initialize executor: {e}");
            process::exit(1);
        }
    };

    let module = match executor.load_module(&data, DecompressOptions::default()) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("failed to load {}: {e}", xex_path.display());
            process::exit(1);
        }
    };

    log::info!("loaded {} at entry {:#010x}", xex_path.display(), module.entry_point);

    let thread = executor.create_thread(0);
    let executed = match executor.execute(thread, module.entry_point, cli.max_instructions) {
        Ok(n) => n,
        Err(e) => {
            eprintln!("execution error: {e}");
            process::exit(1);
        }
    };

    log::info!("ran {executed} instructions");

    if cli.verbose {
        if let Some(state) = executor.thread(thread) {
            eprint!("{}", state.dump());
        }
    }
}
