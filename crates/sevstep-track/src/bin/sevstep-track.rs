//! Command-line front end for the sevstep page-fault tracker.
//!
//! Drives a live tracking session against `/dev/kvm` or analyses a saved
//! JSON-lines event log.
//!
//! # Usage
//!
//! ```bash
//! # Single-event tracking of every guest page, with RIPs (requires root)
//! sudo sevstep-track poll --rip --track-all access --output run.log
//!
//! # Batch tracking for two seconds, perf counter on cpu 3
//! sudo sevstep-track batch --mode access --expected 100000 --perf-cpu 3 --duration-ms 2000
//!
//! # Dump guest memory
//! sudo sevstep-track read-mem --gpa 0x3ac06000 --size 64
//!
//! # Split a saved log at visits to the marker page
//! sevstep-track segment --log run.log --marker 0x7ff1000
//!
//! # Explain a page-fault error code
//! sevstep-track decode-error 0x14
//! ```

use clap::{Parser, Subcommand};
use sevstep_track::client::{BatchResult, TrackerClient, TrackerConfig, TrackerError};
use sevstep_track::device::TrackerDevice;
use sevstep_track::events::{encode_hex_payload, Event};
use sevstep_track::parser::{parse_log_file, write_events, ParseError};
use sevstep_track::pf_error::error_code_to_string;
use sevstep_track::segmentation::event_windows;
use sevstep_track::TrackMode;
use std::error::Error;
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

#[derive(Parser)]
#[command(name = "sevstep-track")]
#[command(about = "Host-side client for the sevstep KVM page-fault tracker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Single-event loop: poll, print and ack page faults.
    Poll {
        /// Tracker device node.
        #[arg(short, long, default_value = "/dev/kvm")]
        device: PathBuf,

        /// Ask the tracker to resolve the RIP of each fault.
        #[arg(long)]
        rip: bool,

        /// Track every guest page with this mode before polling.
        /// Options: write, access, reset-access, exec, reset-exec
        #[arg(long, value_parser = parse_mode)]
        track_all: Option<TrackMode>,

        /// Re-track each faulted page once the following event is acked.
        #[arg(long, requires = "track_all")]
        retrack: bool,

        /// Stop after this many events (0 = until Ctrl+C).
        #[arg(short, long, default_value = "0")]
        max_events: u64,

        /// Sleep between empty polls, in microseconds.
        #[arg(long, default_value = "100")]
        interval_us: u64,

        /// Also write the collected events to this file as JSON lines.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Batch session: track, run, stop and fetch all buffered events.
    Batch {
        /// Tracker device node.
        #[arg(short, long, default_value = "/dev/kvm")]
        device: PathBuf,

        /// Tracking mode applied to all guest pages.
        #[arg(long, value_parser = parse_mode)]
        mode: TrackMode,

        /// Number of events the tracker should reserve space for.
        #[arg(long, value_parser = parse_u64)]
        expected: u64,

        /// Logical cpu the guest vCPU is pinned to (retired-instruction counter).
        #[arg(long, value_parser = parse_u32)]
        perf_cpu: u32,

        /// Re-track each faulted page inside the kernel.
        #[arg(long)]
        retrack: bool,

        /// How long to let the guest run, in milliseconds.  Ctrl+C stops early.
        #[arg(long, default_value = "1000")]
        duration_ms: u64,

        /// Write the events to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Read guest memory and print a hex dump.
    ReadMem {
        /// Tracker device node.
        #[arg(short, long, default_value = "/dev/kvm")]
        device: PathBuf,

        /// Guest-physical start address.
        #[arg(long, value_parser = parse_u64)]
        gpa: u64,

        /// Number of bytes.
        #[arg(long, value_parser = parse_u64)]
        size: u64,

        /// Decrypt with the host key (SEV debug API).
        #[arg(long)]
        decrypt: bool,

        /// Flush caches on this logical cpu first.
        #[arg(long, value_parser = parse_u32)]
        wbinvd_cpu: Option<u32>,
    },

    /// Split a saved event log at visits to a marker page.
    Segment {
        /// JSON-lines event log.
        #[arg(short, long)]
        log: PathBuf,

        /// Virtual address on the marker page.
        #[arg(long, value_parser = parse_u64)]
        marker: u64,

        /// Only print per-window counts.
        #[arg(short, long)]
        quiet: bool,
    },

    /// Print the names of the bits set in a page-fault error code.
    DecodeError {
        #[arg(value_parser = parse_u32)]
        code: u32,
    },
}

type CliResult = Result<(), Box<dyn Error>>;

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Poll {
            device,
            rip,
            track_all,
            retrack,
            max_events,
            interval_us,
            output,
        } => {
            let opts = PollOptions {
                track_all,
                retrack,
                max_events,
                interval: Duration::from_micros(interval_us),
            };
            cmd_poll(device, rip, &opts, output)
        }
        Commands::Batch {
            device,
            mode,
            expected,
            perf_cpu,
            retrack,
            duration_ms,
            output,
        } => {
            let opts = BatchOptions {
                mode,
                expected,
                perf_cpu,
                retrack,
                duration: Duration::from_millis(duration_ms),
            };
            cmd_batch(device, &opts, output)
        }
        Commands::ReadMem {
            device,
            gpa,
            size,
            decrypt,
            wbinvd_cpu,
        } => cmd_read_mem(device, gpa, size, decrypt, wbinvd_cpu),
        Commands::Segment { log, marker, quiet } => cmd_segment(log, marker, quiet),
        Commands::DecodeError { code } => cmd_decode_error(code),
    };

    // Every client is dropped (and the tracker reset) by the time we get here.
    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Live tracking
// ═══════════════════════════════════════════════════════════════════════

struct PollOptions {
    track_all: Option<TrackMode>,
    retrack: bool,
    max_events: u64,
    interval: Duration,
}

fn cmd_poll(
    device: PathBuf,
    rip: bool,
    opts: &PollOptions,
    output: Option<PathBuf>,
) -> CliResult {
    let client = open_client(device, rip)?;
    install_stop_handler();

    let events = run_poll(client, opts, print_json)?;
    eprintln!("Handled {} events", events.len());
    if let Some(path) = output {
        save_events(&path, &events)?;
    }
    Ok(())
}

/// Poll, report and ack events until stopped.  Errors inside the loop end
/// it early but keep the events collected so far.
///
/// With `retrack`, a faulted page is re-armed only after the *next* event
/// has been acked.  Re-tracking a page while its own fault is still being
/// handled makes the guest fault on it forever.
fn run_poll<D: TrackerDevice>(
    mut client: TrackerClient<D>,
    opts: &PollOptions,
    mut on_event: impl FnMut(&Event),
) -> Result<Vec<Event>, TrackerError> {
    if let Some(mode) = opts.track_all {
        eprintln!("Tracking all pages ({})", mode.name());
        client.track_all_pages(mode)?;
    }
    let retrack_mode = opts.track_all.filter(|_| opts.retrack);

    eprintln!("Entering poll loop (Ctrl+C to stop)...");
    let mut events: Vec<Event> = Vec::new();
    let mut rearm: Option<u64> = None;
    while RUNNING.load(Ordering::Relaxed) {
        let event = match client.poll_event() {
            Ok(Some(event)) => event,
            Ok(None) => {
                std::thread::sleep(opts.interval);
                continue;
            }
            Err(e) => {
                eprintln!("Poll error: {}", e);
                break;
            }
        };

        on_event(&event);
        // An unacked event is released by the reset in close().
        if let Err(e) = client.ack_event(event.id) {
            eprintln!("Ack of event {} failed: {}", event.id, e);
            break;
        }

        if let Some(mode) = retrack_mode {
            let previous = rearm.replace(event.faulted_gpa);
            if let Some(gpa) = previous.filter(|&gpa| gpa != event.faulted_gpa) {
                if let Err(e) = client.track_page(gpa, mode) {
                    eprintln!("Retrack of {:#x} failed: {}", gpa, e);
                    break;
                }
            }
        }
        events.push(event);

        if opts.max_events > 0 && events.len() as u64 >= opts.max_events {
            break;
        }
    }

    if let Some(mode) = opts.track_all {
        if let Err(e) = client.untrack_all_pages(mode) {
            eprintln!("Failed to untrack pages: {}", e);
        }
    }
    client.close();
    Ok(events)
}

struct BatchOptions {
    mode: TrackMode,
    expected: u64,
    perf_cpu: u32,
    retrack: bool,
    duration: Duration,
}

fn cmd_batch(device: PathBuf, opts: &BatchOptions, output: Option<PathBuf>) -> CliResult {
    let client = open_client(device, false)?;
    install_stop_handler();

    let result = run_batch(client, opts)?;
    eprintln!("Collected {} events", result.events.len());

    match output {
        Some(path) => save_events(&path, &result.events)?,
        None => result.events.iter().for_each(print_json),
    }

    if result.error_during_batch {
        return Err("tracker reported an error during batch tracking (see dmesg)".into());
    }
    Ok(())
}

/// One batch session.  Any failure drops `client`, which resets the
/// tracker, before the error reaches the caller.
fn run_batch<D: TrackerDevice>(
    mut client: TrackerClient<D>,
    opts: &BatchOptions,
) -> Result<BatchResult, TrackerError> {
    client.setup_retired_instr_perf(opts.perf_cpu)?;
    client.track_all_pages(opts.mode)?;
    client.batch_tracking_start(opts.mode, opts.expected, opts.perf_cpu, opts.retrack)?;
    eprintln!(
        "Batch tracking ({}) for {} ms (Ctrl+C to stop early)...",
        opts.mode.name(),
        opts.duration.as_millis()
    );

    let deadline = Instant::now() + opts.duration;
    while RUNNING.load(Ordering::Relaxed) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }

    let count = client.batch_tracking_event_count()?;
    let result = client.batch_tracking_stop_and_get(count)?;
    if let Err(e) = client.untrack_all_pages(opts.mode) {
        eprintln!("Failed to untrack pages: {}", e);
    }
    client.close();
    Ok(result)
}

fn cmd_read_mem(
    device: PathBuf,
    gpa: u64,
    size: u64,
    decrypt: bool,
    wbinvd_cpu: Option<u32>,
) -> CliResult {
    let size = usize::try_from(size)?;
    let mut client = open_client(device, false)?;
    let bytes = client.read_guest_memory(gpa, size, decrypt, wbinvd_cpu)?;
    client.close();

    for (i, line) in bytes.chunks(16).enumerate() {
        println!("{:016x}: {}", gpa + (i * 16) as u64, encode_hex_payload(line));
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Offline analysis
// ═══════════════════════════════════════════════════════════════════════

fn cmd_segment(log: PathBuf, marker: u64, quiet: bool) -> CliResult {
    let events = parse_log_file(&log)?;
    let windows = event_windows(&events, marker);

    println!("Log: {}", log.display());
    println!("Events: {}", events.len());
    println!("Marker page: {:#x}", marker);
    println!("Windows: {}", windows.len());
    println!();

    for (k, window) in windows.iter().enumerate() {
        println!("Window {}: {} events", k, window.len());
        if quiet {
            continue;
        }
        for event in window {
            println!(
                "  {} [{}]",
                event,
                error_code_to_string(event.error_code).trim_end()
            );
        }
    }
    Ok(())
}

fn cmd_decode_error(code: u32) -> CliResult {
    let names = error_code_to_string(code);
    if names.is_empty() {
        println!("{:#x}: (no known bits set)", code);
    } else {
        println!("{:#x}: {}", code, names.trim_end());
    }
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
//  Helpers
// ═══════════════════════════════════════════════════════════════════════

fn open_client(device: PathBuf, want_rip: bool) -> Result<TrackerClient, TrackerError> {
    let config = TrackerConfig {
        device_path: device,
        want_rip,
    };
    TrackerClient::open(&config).map_err(|e| {
        eprintln!("Hint: This requires root and the sevstep KVM module.");
        e
    })
}

fn print_json(event: &Event) {
    match event.to_json() {
        Ok(line) => println!("{}", line),
        Err(e) => eprintln!("Failed to encode event {}: {}", event.id, e),
    }
}

fn save_events(path: &Path, events: &[Event]) -> Result<(), ParseError> {
    eprintln!("Saving events to {}", path.display());
    let file = File::create(path)?;
    write_events(BufWriter::new(file), events)?;
    eprintln!("Saved {} events", events.len());
    Ok(())
}

fn parse_u64(s: &str) -> Result<u64, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid number {s:?}: {e}"))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    let v = parse_u64(s)?;
    u32::try_from(v).map_err(|_| format!("{s:?} does not fit in 32 bits"))
}

fn parse_mode(s: &str) -> Result<TrackMode, String> {
    TrackMode::from_name(s).ok_or_else(|| {
        let names: Vec<&str> = TrackMode::ALL.iter().map(|m| m.name()).collect();
        format!("unknown track mode {s:?} (expected one of: {})", names.join(", "))
    })
}

static RUNNING: AtomicBool = AtomicBool::new(true);

/// Clear [`RUNNING`] on SIGINT or SIGTERM (avoids pulling in ctrlc crate).
fn install_stop_handler() {
    extern "C" fn handler(_: libc::c_int) {
        RUNNING.store(false, Ordering::Relaxed);
    }

    let h = handler as *const () as libc::sighandler_t;
    // SAFETY: the handler only performs an atomic store.
    unsafe {
        libc::signal(libc::SIGINT, h);
        libc::signal(libc::SIGTERM, h);
    }
}
