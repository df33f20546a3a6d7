use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use log::{error, info};
use tokio::sync::watch;

use pathprobe::configuration::config::Config;
use pathprobe::echo;
use pathprobe::probe::engine::{ProbeEngine, ProbeSpec};
use pathprobe::storage::history::HistoryLog;
use pathprobe::storage::snapshot_store::SnapshotStore;

#[derive(Parser)]
#[command(name = "pathprobe")]
#[command(version = "0.2.0")]
#[command(about = "UDP convergence and failover measurement for SD-WAN paths")]
struct Args {
    /// TOML configuration file; defaults apply when omitted
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one probe instance in the foreground until SIGINT/SIGTERM
    Probe {
        /// Target host or address to flood
        #[arg(long)]
        target: String,

        /// Target UDP port
        #[arg(long, default_value_t = 6200)]
        port: u16,

        /// Packet rate in packets per second
        #[arg(long, default_value_t = 50)]
        rate: u32,

        /// Test id; also selects the deterministic source port
        #[arg(long, default_value = "CONV-000")]
        id: String,

        /// Free-form session label carried into stats and history
        #[arg(long)]
        label: Option<String>,

        /// Stats file override; defaults to the configured stats directory
        #[arg(long)]
        stats_file: Option<PathBuf>,
    },
    /// Run the echo responder
    Echo {
        /// Address to bind
        #[arg(long, default_value = "0.0.0.0")]
        bind: String,

        /// UDP ports to listen on
        #[arg(long, value_delimiter = ',', default_values_t = vec![6100u16, 6200])]
        ports: Vec<u16>,
    },
    /// Print the latest stats projection of every known instance
    Status,
    /// Print completed sessions, most recent first
    History {
        /// Cap on the number of records printed
        #[arg(long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_target(false)
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => match Config::from_file(Path::new(path)) {
            Ok(config) => config,
            Err(e) => {
                error!("Unable to import configuration from file: {}", e);
                std::process::exit(1);
            }
        },
        None => Config::default(),
    };

    match args.command {
        Command::Probe {
            target,
            port,
            rate,
            id,
            label,
            stats_file,
        } => run_probe(&config, target, port, rate, id, label, stats_file).await,
        Command::Echo { bind, ports } => {
            if let Err(e) = echo::run_echo(&bind, &ports).await {
                error!("Echo responder failed: {}", e);
                std::process::exit(1);
            }
        }
        Command::Status => run_status(&config),
        Command::History { limit } => run_history(&config, limit),
    }
}

async fn run_probe(
    config: &Config,
    target: String,
    port: u16,
    rate: u32,
    id: String,
    label: Option<String>,
    stats_file: Option<PathBuf>,
) {
    let stats_file = match stats_file {
        Some(path) => path,
        None => match SnapshotStore::new(&config.stats_dir) {
            Ok(store) => store.path_for(&id),
            Err(e) => {
                error!("Unable to prepare stats directory: {}", e);
                std::process::exit(1);
            }
        },
    };

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = stop_tx.send(true);
    });

    let mut engine = ProbeEngine::new(ProbeSpec {
        test_id: id,
        label,
        target,
        port,
        rate_pps: rate,
        stats_file,
    });
    if let Err(e) = engine.run(stop_rx).await {
        error!("Probe failed: {}", e);
        std::process::exit(1);
    }
}

fn run_status(config: &Config) {
    let store = match SnapshotStore::new(&config.stats_dir) {
        Ok(store) => store,
        Err(e) => {
            error!("Unable to open stats directory: {}", e);
            std::process::exit(1);
        }
    };
    match store.list() {
        Ok(snapshots) => match serde_json::to_string_pretty(&snapshots) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Unable to render status: {}", e),
        },
        Err(e) => {
            error!("Unable to read stats directory: {}", e);
            std::process::exit(1);
        }
    }
}

fn run_history(config: &Config, limit: Option<usize>) {
    let log = HistoryLog::new(&config.history_file);
    match log.read(limit) {
        Ok(records) => match serde_json::to_string_pretty(&records) {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Unable to render history: {}", e),
        },
        Err(e) => {
            error!("Unable to read history log: {}", e);
            std::process::exit(1);
        }
    }
}

#[cfg(unix)]
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("SIGINT received, stopping"),
        _ = term.recv() => info!("SIGTERM received, stopping"),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("Interrupt received, stopping");
}
