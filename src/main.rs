//! `can-bms-gateway` CLI entry point (C8, spec §7 "Command-line interface").

use std::path::{Path, PathBuf};

use clap::Parser;
use can_bms_gateway::config::{Config, DEFAULT_TEMPLATE};
use can_bms_gateway::dispatch;
use can_bms_gateway::error::GatewayError;

const DEFAULT_CONFIG_PATH: &str = "/etc/can-bms-gateway/config.toml";

#[derive(Parser, Debug)]
#[command(name = "can-bms-gateway", version, about = "N-to-M CAN-bus gateway for the Pylontech/SMA LV BMS protocol")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Write a default configuration template to --config and exit.
    #[arg(long)]
    init: bool,

    /// Increase log verbosity (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_config(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(DEFAULT_TEMPLATE.as_bytes())
}

fn init_logging(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

async fn run(cli: Cli) -> Result<(), GatewayError> {
    let config = Config::load(&cli.config)?;

    if !config.gateway_activated {
        log::info!("main: GATEWAY-ACTIVATED is false, exiting without starting the gateway");
        return Ok(());
    }

    dispatch::run(config).await
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    if cli.init {
        match init_config(&cli.config) {
            Ok(()) => {
                println!("wrote default configuration to {}", cli.config.display());
                std::process::exit(0);
            }
            Err(err) => {
                eprintln!("failed to write {}: {err}", cli.config.display());
                std::process::exit(2);
            }
        }
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            std::process::exit(3);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            log::error!("main: fatal error: {err}");
            std::process::exit(err.exit_code());
        }
    }
}
