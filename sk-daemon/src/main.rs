//! Smokehouse Controller Daemon (smokehoused)
//!
//! Firmware of a smokehouse/curing-chamber controller, running six
//! cooperating tasks over a shared controller record:
//!
//! - **Control** - 100 ms PID/state-machine tick
//! - **Sensors** - chamber probes, meat NTC, door
//! - **UI** - four-button menu and buzzer
//! - **Web** - HTTP status/control interface
//! - **WiFi** - link maintenance
//! - **Monitor** - task liveness and telemetry
//!
//! # Safety model
//! - Dangerous states (overheat, heater fault, open door) force all
//!   outputs off before anything else runs
//! - A hardware watchdog reboots on a hung task; the Web task is exempt
//!   so firmware uploads cannot trigger a reset
//! - Flash-init failure degrades to manual mode instead of refusing to run

mod tasks;
mod ui;
mod web;
mod wifi;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use sk_core::{
    Controller, FileFlash, FlashFs, NoRemote, Nvs, RemoteProfiles, SimBoard, SpiBus, SpiFlash,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

fn print_help() {
    eprintln!("smokehoused {VERSION} - smokehouse controller daemon");
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    smokehoused [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -l, --listen ADDR   HTTP listen address (default {DEFAULT_LISTEN_ADDR})");
    eprintln!("    -f, --flash PATH    Flash image file (default: config dir)");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    SMOKEHOUSE_LOG      Log level (trace, debug, info, warn, error)");
}

struct Args {
    listen_addr: String,
    flash_path: Option<PathBuf>,
}

fn parse_args() -> Args {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
        flash_path: None,
    };
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                println!("smokehoused {VERSION}");
                std::process::exit(0);
            }
            "-l" | "--listen" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --listen requires an address");
                    std::process::exit(1);
                }
                parsed.listen_addr = args[i].clone();
            }
            "-f" | "--flash" => {
                i += 1;
                if i >= args.len() {
                    eprintln!("Error: --flash requires a path");
                    std::process::exit(1);
                }
                parsed.flash_path = Some(PathBuf::from(&args[i]));
            }
            arg => {
                eprintln!("Unknown argument: {arg}");
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }
    parsed
}

fn init_logging() {
    let log_level = std::env::var("SMOKEHOUSE_LOG").unwrap_or_else(|_| "info".to_string());

    // Prefer journald on systemd hosts, stdout everywhere else
    let use_journald = std::path::Path::new("/run/systemd/journal/socket").exists();
    if use_journald {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
                return;
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {e}, falling back to stdout");
            }
        }
    }
    tracing_subscriber::fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(log_level)
        .init();
}

/// Bring up the flash filesystem. Failure is survivable: the controller
/// runs in manual mode only, with the profile error flagged.
fn init_flash(ctl_path: Option<PathBuf>, bus: Arc<SpiBus>) -> Option<FlashFs> {
    let image_path = ctl_path.or_else(sk_core::default_flash_image_path)?;
    if let Some(parent) = image_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            error!("Cannot create flash image directory: {e}");
            return None;
        }
    }
    let chip = match FileFlash::open(&image_path) {
        Ok(chip) => Arc::new(chip) as Arc<dyn SpiFlash>,
        Err(e) => {
            error!("Flash image init failed: {e}");
            return None;
        }
    };
    match FlashFs::mount(chip, bus) {
        Ok(fs) => {
            info!("Flash filesystem mounted ({} live files)", fs.live_count());
            Some(fs)
        }
        Err(e) => {
            error!("Flash mount failed: {e}");
            None
        }
    }
}

fn main() {
    // Panics must not leave heat on: log and abort so the supervisor (or
    // the operator) restarts from a clean boot.
    std::panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown".to_string());
        eprintln!("PANIC at {location}: {panic_info}");
        std::process::abort();
    }));

    let args = parse_args();
    init_logging();

    info!("STARTUP: smokehoused {VERSION}");

    // Board + shared SPI bus
    let board = Arc::new(SimBoard::new());
    let spi = Arc::new(SpiBus::new());

    // Flash filesystem (degrades to manual-only on failure)
    let flash = init_flash(args.flash_path, spi.clone());
    let flash_ok = flash.is_some();

    // Persistent configuration
    let nvs = match sk_core::default_nvs_path() {
        Some(path) => Nvs::load(path),
        None => {
            warn!("No config directory; NVS is ephemeral this run");
            Nvs::ephemeral()
        }
    };

    let ctl = Controller::new(board, spi, flash, nvs);
    let remote: Arc<dyn RemoteProfiles> = Arc::new(NoRemote);

    if !flash_ok {
        error!("Flash unavailable: MANUAL MODE ONLY");
        if let Ok(mut st) = ctl.lock_state() {
            st.error_profile = true;
        }
        ctl.outputs.buzzer_beep(3, 200, 200, ctl.uptime.now_ms());
    } else if let Err(e) = sk_core::load_boot_profile(&ctl, remote.as_ref()) {
        warn!("No profile at boot: {e}");
    }

    // Clean shutdown: outputs off before the process exits
    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let ctl = ctl.clone();
        let shutdown = shutdown.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            info!("SIGNAL: shutting down");
            shutdown.store(true, Ordering::SeqCst);
            ctl.outputs.all_outputs_off();
        }) {
            warn!("Failed to set signal handler: {e}");
        }
    }

    info!("STARTUP: listen={} flash={}", args.listen_addr, flash_ok);

    let wdt = tasks::Watchdogs::new();
    let handles = tasks::spawn_all(
        ctl.clone(),
        wdt,
        remote,
        args.listen_addr,
        shutdown.clone(),
    );

    for handle in handles {
        let _ = handle.join();
    }

    ctl.outputs.all_outputs_off();
    info!("SHUTDOWN: daemon terminated");
}
