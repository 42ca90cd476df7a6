mod conductor;
mod config;
mod error;
mod framing;
mod logging;
mod message;
mod server;
mod sys;
mod worker;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use tracing::{error, info};

use crate::conductor::Conductor;
use crate::sys::HostSys;

/// Cleared by the signal handler; the only process-wide mutable datum.
static KEEP_RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn handle_shutdown_signal(_signum: libc::c_int) {
    // Only an atomic store here, anything else is not async-signal-safe.
    KEEP_RUNNING.store(false, Ordering::SeqCst);
}

fn install_signal_handlers() {
    let handler = handle_shutdown_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
        // Writes to a closed socket or pipe must surface as EPIPE errors
        // instead of killing the process.
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

struct CliOptions {
    log_filter: Option<String>,
    log_file: Option<PathBuf>,
}

fn parse_cli_args() -> Result<CliOptions, String> {
    let mut args = std::env::args().skip(1);
    let mut log_filter = None;
    let mut log_file = None;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => {
                print_usage();
                std::process::exit(0);
            }
            "--log-level" => {
                log_filter = Some(
                    args.next()
                        .ok_or_else(|| "missing value for --log-level".to_string())?,
                );
            }
            _ if arg.starts_with("--log-level=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.is_empty() {
                    return Err("missing value for --log-level".to_string());
                }
                log_filter = Some(value.to_string());
            }
            "--log-file" => {
                let value = args
                    .next()
                    .ok_or_else(|| "missing value for --log-file".to_string())?;
                log_file = Some(PathBuf::from(value));
            }
            _ if arg.starts_with("--log-file=") => {
                let value = arg.split_once('=').map(|(_, value)| value).unwrap_or("");
                if value.is_empty() {
                    return Err("missing value for --log-file".to_string());
                }
                log_file = Some(PathBuf::from(value));
            }
            _ => return Err(format!("unknown argument: {arg}")),
        }
    }

    Ok(CliOptions {
        log_filter,
        log_file,
    })
}

fn print_usage() {
    println!(
        "Usage:\n\
sertop-bridge [--log-level <filter>] [--log-file <path>]\n\n\
--log-level: tracing filter, e.g. info or sertop_bridge::server=trace (env: {}, RUST_LOG)\n\
--log-file: append logs to a file in addition to stderr (env: {})\n\n\
Listens on an ephemeral localhost port and prints the port on startup.",
        logging::LOG_FILTER_ENV,
        logging::LOG_FILE_ENV,
    );
}

fn main() {
    let options = match parse_cli_args() {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            print_usage();
            std::process::exit(2);
        }
    };

    logging::init(
        logging::LogConfig {
            filter: options.log_filter,
            file_path: options.log_file,
        }
        .with_env_overrides(),
    );

    install_signal_handlers();

    info!(
        "started sertop-bridge with {} arguments",
        std::env::args().count() - 1
    );

    let conductor = match Conductor::new(HostSys::new()) {
        Ok(conductor) => conductor,
        Err(err) => {
            error!("unable to start: {err}");
            std::process::exit(err.os_code());
        }
    };

    while KEEP_RUNNING.load(Ordering::SeqCst) && !conductor.has_failed() {
        thread::sleep(Duration::from_millis(500));
    }

    let signalled = !conductor.has_failed();
    conductor.notify();
    if signalled {
        info!("received SIGINT/SIGTERM");
    }

    drop(conductor);
    info!("exiting");
}
