//! awplay -- headless Another World runner
//!
//! Boots the engine against a data directory (MEMLIST.BIN + BANK files),
//! runs a bounded number of frames and dumps the front page as ASCII art.
//! Usage: awplay --data <dir> [--part 0..9] [--skip-protection] [--frames N]
//!        [--quiet] [--debug-<sys>]

use std::path::PathBuf;
use std::process::ExitCode;

use aw_core::engine::{BootOptions, Engine};
use aw_core::page::{PAGE_SIZE, SCREEN_H, SCREEN_W};
use aw_core::{HeadlessBackend, Resources};

const DEBUG_TARGETS: [&str; 6] = ["engine", "vm", "video", "audio", "resources", "backend"];

struct CliLogger {
    debug_targets: Vec<String>,
}

impl log::Log for CliLogger {
    fn enabled(&self, meta: &log::Metadata) -> bool {
        meta.level() <= log::Level::Info
            || self.debug_targets.iter().any(|t| t == meta.target())
    }

    fn log(&self, record: &log::Record) {
        if self.enabled(record.metadata()) {
            eprintln!("{:5} {}: {}", record.level(), record.target(), record.args());
        }
    }

    fn flush(&self) {}
}

struct Options {
    data_dir: PathBuf,
    part: u16,
    skip_protection: bool,
    frames: u64,
    quiet: bool,
    debug_targets: Vec<String>,
}

fn parse_args(args: &[String]) -> Result<Options, String> {
    let mut opts = Options {
        data_dir: PathBuf::from("./share/another-world"),
        part: 1,
        skip_protection: false,
        frames: 200,
        quiet: false,
        debug_targets: vec![],
    };
    let mut i = 0usize;
    while i < args.len() {
        match args[i].as_str() {
            "--data" => {
                i += 1;
                opts.data_dir = PathBuf::from(require_arg(args, i, "--data")?);
            }
            "--part" => {
                i += 1;
                let raw = require_arg(args, i, "--part")?;
                opts.part = raw.parse().map_err(|_| format!("bad part index: {raw}"))?;
                if opts.part > 9 {
                    return Err(format!("part index {} out of range 0..9", opts.part));
                }
            }
            "--frames" => {
                i += 1;
                let raw = require_arg(args, i, "--frames")?;
                opts.frames = raw.parse().map_err(|_| format!("bad frame count: {raw}"))?;
            }
            "--skip-protection" => opts.skip_protection = true,
            "--quiet" => opts.quiet = true,
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            other => match other.strip_prefix("--debug-") {
                Some(sys) if DEBUG_TARGETS.contains(&sys) => {
                    opts.debug_targets.push(sys.to_string());
                }
                _ => return Err(format!("unexpected argument: {other}")),
            },
        }
        i += 1;
    }
    Ok(opts)
}

fn require_arg<'a>(args: &'a [String], idx: usize, flag: &str) -> Result<&'a str, String> {
    args.get(idx)
        .map(|s| s.as_str())
        .ok_or_else(|| format!("missing value for {flag}"))
}

fn print_help() {
    println!("awplay - Another World engine runner");
    println!();
    println!("  --data <dir>        data directory (default ./share/another-world)");
    println!("  --part <0..9>       initial part (default 1, the intro)");
    println!("  --skip-protection   pre-seed the protection registers");
    println!("  --frames <n>        frames to run (default 200)");
    println!("  --quiet             disable all log output");
    for sys in DEBUG_TARGETS {
        println!("  --debug-{sys:<10}  enable {sys} debug logging");
    }
}

fn install_logger(opts: &Options) {
    if opts.quiet {
        log::set_max_level(log::LevelFilter::Off);
        return;
    }
    let logger = CliLogger { debug_targets: opts.debug_targets.clone() };
    if log::set_boxed_logger(Box::new(logger)).is_ok() {
        log::set_max_level(if opts.debug_targets.is_empty() {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Debug
        });
    }
}

/// 16-shade ASCII rendering of a 4bpp page, downsampled 4x.
fn page_to_ascii(page: &[u8; PAGE_SIZE]) -> String {
    const SHADES: [char; 16] = [
        '.', ',', ':', ';', 'i', '+', '*', '#', '%', '@', '$', '&', '8', '0', 'W', 'M',
    ];
    let mut out = String::with_capacity((SCREEN_W / 4 + 1) * (SCREEN_H / 4));
    for y in (0..SCREEN_H).step_by(4) {
        for x in (0..SCREEN_W).step_by(4) {
            let byte = page[y * SCREEN_W / 2 + x / 2];
            out.push(SHADES[(byte >> 4) as usize]);
        }
        out.push('\n');
    }
    out
}

fn run(opts: Options) -> Result<(), aw_core::Error> {
    let res = Resources::open(&opts.data_dir)?;
    let boot = BootOptions {
        part: opts.part,
        skip_protection: opts.skip_protection,
        ..Default::default()
    };
    let mut engine = Engine::new(res, HeadlessBackend::new(), boot)?;
    engine.start_audio();

    println!(
        "awplay | part {} | {} frames | data {}",
        opts.part,
        opts.frames,
        opts.data_dir.display()
    );
    while engine.frames_run < opts.frames {
        if !engine.frame()? {
            break;
        }
        if engine.frames_run % 50 == 0 {
            println!("--- frame {} ---", engine.frames_run);
            print!("{}", page_to_ascii(&engine.backend.last_page));
        }
    }
    println!("=== done: {} frames, {} presented ===", engine.frames_run, engine.backend.frames_presented);
    print!("{}", page_to_ascii(&engine.backend.last_page));
    Ok(())
}

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let opts = match parse_args(&args) {
        Ok(opts) => opts,
        Err(msg) => {
            eprintln!("awplay: {msg}");
            print_help();
            return ExitCode::from(1);
        }
    };
    install_logger(&opts);
    match run(opts) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("awplay: fatal: {e}");
            ExitCode::from(1)
        }
    }
}
