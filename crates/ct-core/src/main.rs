//! claude-top - live monitor for Claude CLI instances.
//!
//! The binary entry point: argument parsing, logging setup, engine
//! construction, and the three surfaces:
//! - the monitor loop (default)
//! - one-shot snapshot mode (`--once`), the editor-integration contract
//! - history queries (`query`)

use chrono::{DateTime, Utc};
use clap::{ArgAction, Args, Parser, Subcommand};
use ct_common::{OutputFormat, SessionId};
use ct_core::collect::{self, ProcSource};
use ct_core::config::MonitorConfig;
use ct_core::control::LibcBackend;
use ct_core::engine::MonitorEngine;
use ct_core::exit_codes::ExitCode;
use ct_core::logging::{init_logging, LogConfig};
use ct_core::store::{HistoryStore, TimeRange};
use ct_core::Snapshot;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info};

/// claude-top - live process monitor for Claude CLI instances
#[derive(Parser)]
#[command(name = "claude-top")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Sampling interval in seconds
    #[arg(long, short = 'i', global = true, default_value_t = 1.0, env = "CLAUDE_TOP_INTERVAL")]
    interval: f64,

    /// Disable the history store for this run
    #[arg(long, global = true)]
    no_store: bool,

    /// Override the history store path
    #[arg(long, global = true, env = "CLAUDE_TOP_STORE")]
    store_path: Option<PathBuf>,

    /// Path to a TOML config file
    #[arg(long, global = true, env = "CLAUDE_TOP_CONFIG")]
    config: Option<PathBuf>,

    /// Output format for machine-readable surfaces
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Decrease verbosity (quiet mode)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the monitor loop (default when no subcommand is given)
    Run(RunArgs),

    /// Query the historical store
    Query(QueryArgs),

    /// Print version information
    Version,
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Emit exactly one snapshot as a machine-readable document and exit
    #[arg(long)]
    once: bool,
}

#[derive(Args, Debug)]
struct QueryArgs {
    /// Filter by project key (working-directory basename)
    #[arg(long)]
    project: Option<String>,

    /// Only records at or after this RFC-3339 timestamp
    #[arg(long)]
    since: Option<String>,

    /// Only records at or before this RFC-3339 timestamp
    #[arg(long)]
    until: Option<String>,
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[cfg(unix)]
extern "C" fn handle_signal(_sig: libc::c_int) {
    SHUTDOWN.store(true, Ordering::Relaxed);
}

#[cfg(unix)]
fn install_signal_handlers() {
    let handler = handle_signal as extern "C" fn(libc::c_int);
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
        libc::signal(libc::SIGTERM, handler as libc::sighandler_t);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

fn main() {
    let cli = Cli::parse();
    init_logging(&LogConfig::from_flags(cli.global.verbose, cli.global.quiet));

    if let Some(Commands::Version) = cli.command {
        println!("claude-top {}", env!("CARGO_PKG_VERSION"));
        ExitCode::Clean.exit();
    }

    let session = SessionId::new();
    info!(session = %session, "claude-top starting");

    let config = match MonitorConfig::load(cli.global.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            eprintln!("{}", e);
            ExitCode::ConfigError.exit();
        }
    };

    if cli.global.interval <= 0.0 {
        eprintln!("--interval must be positive");
        ExitCode::ConfigError.exit();
    }

    let store = if cli.global.no_store || !config.store.enabled {
        HistoryStore::disabled()
    } else {
        let path = cli
            .global
            .store_path
            .clone()
            .unwrap_or_else(|| config.store_path());
        HistoryStore::open(path)
    };

    let mut engine = MonitorEngine::new(
        config,
        ProcSource::new(),
        LibcBackend,
        store,
        cli.global.interval,
        collect::clk_tck(),
        collect::num_cores(),
    );

    // Queries only touch the store; the monitor surfaces need a working
    // enumeration backend and refuse to start without one.
    if !matches!(cli.command, Some(Commands::Query(_))) {
        if let Err(e) = engine.verify_backend() {
            error!(error = %e, "process enumeration unavailable");
            eprintln!("{}", e.to_json());
            ExitCode::SetupFailure.exit();
        }
    }

    let code = match cli.command {
        None => run_monitor(&mut engine, RunArgs::default(), cli.global.format),
        Some(Commands::Run(args)) => run_monitor(&mut engine, args, cli.global.format),
        Some(Commands::Query(args)) => run_query(&engine, args, cli.global.format),
        Some(Commands::Version) => unreachable!("handled above"),
    };
    code.exit();
}

fn run_monitor(
    engine: &mut MonitorEngine<ProcSource, LibcBackend>,
    args: RunArgs,
    format: OutputFormat,
) -> ExitCode {
    if args.once {
        // Two samples one settle apart so CPU deltas are real.
        let settle = Duration::from_secs_f64(engine.interval().as_secs_f64().clamp(0.1, 1.0));
        let snapshot = engine.one_shot(settle);
        print_snapshot(&snapshot, format);
        return ExitCode::Clean;
    }

    install_signal_handlers();
    engine.run(&SHUTDOWN);
    ExitCode::Clean
}

fn run_query(
    engine: &MonitorEngine<ProcSource, LibcBackend>,
    args: QueryArgs,
    format: OutputFormat,
) -> ExitCode {
    let range = TimeRange {
        since: match parse_timestamp(args.since.as_deref()) {
            Ok(ts) => ts,
            Err(msg) => {
                eprintln!("--since: {}", msg);
                return ExitCode::ConfigError;
            }
        },
        until: match parse_timestamp(args.until.as_deref()) {
            Ok(ts) => ts,
            Err(msg) => {
                eprintln!("--until: {}", msg);
                return ExitCode::ConfigError;
            }
        },
    };

    match engine.query_history(args.project.as_deref(), range) {
        Ok(records) => {
            match format {
                OutputFormat::Json => {
                    println!(
                        "{}",
                        serde_json::to_string_pretty(&records).unwrap_or_else(|_| "[]".into())
                    );
                }
                OutputFormat::Text => {
                    println!(
                        "{:<8} {:<20} {:<12} {:>7} {:>9} {:<9}",
                        "PID", "TIMESTAMP", "PROJECT", "CPU%", "MEM(MB)", "STATUS"
                    );
                    for r in &records {
                        println!(
                            "{:<8} {:<20} {:<12} {:>7.1} {:>9.1} {:<9}",
                            r.pid,
                            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
                            r.project,
                            r.cpu_percent,
                            r.memory_mb,
                            r.status,
                        );
                    }
                }
            }
            ExitCode::Clean
        }
        Err(e) => {
            error!(error = %e, "history query failed");
            eprintln!("{}", e);
            ExitCode::ConfigError
        }
    }
}

fn parse_timestamp(value: Option<&str>) -> Result<Option<DateTime<Utc>>, String> {
    match value {
        None => Ok(None),
        Some(s) => DateTime::parse_from_rfc3339(s)
            .map(|ts| Some(ts.with_timezone(&Utc)))
            .map_err(|e| format!("invalid timestamp '{}': {}", s, e)),
    }
}

fn print_snapshot(snapshot: &Snapshot, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string_pretty(snapshot).unwrap_or_else(|_| "{}".into())
            );
        }
        OutputFormat::Text => {
            println!(
                "{:<8} {:<9} {:>7} {:>9} {:>12} {:>12} {:>5} {:<5} DIRECTORY",
                "PID", "STATUS", "CPU%", "MEM(MB)", "NET TX/RX", "DISK R/W", "CONN", "MCP"
            );
            for inst in &snapshot.instances {
                let est = if inst.io_estimated { "~" } else { "" };
                println!(
                    "{:<8} {:<9} {:>7.1} {:>9.1} {:>12} {:>12} {:>5} {:<5} {}",
                    inst.pid,
                    inst.status.to_string(),
                    inst.cpu_percent,
                    inst.memory_mb,
                    format!("{}{}/{}", est, inst.net_bytes_sent, inst.net_bytes_recv),
                    format!("{}{}/{}", est, inst.disk_read_bytes, inst.disk_write_bytes),
                    inst.connections,
                    inst.mcp_connections,
                    inst.working_dir,
                );
            }
        }
    }
}
