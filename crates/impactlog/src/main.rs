//! `impactd` - impact logger daemon
//!
//! Samples the sensor on a background thread and serves the impact log over
//! HTTP on a single-threaded runtime.

#![warn(missing_debug_implementations)]
#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::task::LocalSet;
use tracing::info;

use impactlog::cli::{Cli, Command, ConfigCommand, RunCommand};
use impactlog::monitor::AlertMonitor;
use impactlog::{init_logging, Config, EventLog, Server};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(cli.verbosity());

    match cli.command {
        Command::Run(run) => handle_run(cli.config, &run),
        Command::Config(config_cmd) => handle_config(cli.config, config_cmd),
    }
}

fn handle_run(config_path: Option<PathBuf>, run: &RunCommand) -> anyhow::Result<()> {
    let mut config = Config::load_from(config_path)?;
    run.apply(&mut config);
    config.validate()?;

    let log_path = config.log_path();
    let log = EventLog::create(&log_path, &config.log.columns)
        .with_context(|| format!("failed to create impact log at {}", log_path.display()))?;
    let log = Arc::new(log);
    info!(path = %log_path.display(), "Impact log ready");

    let monitor = if config.monitor.enabled {
        Some(AlertMonitor::simulated(&config.monitor, Arc::clone(&log)).spawn()?)
    } else {
        info!("Sensor sampling disabled");
        None
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;
    let served = LocalSet::new().block_on(&runtime, serve(&config, log));

    if let Some(monitor) = monitor {
        let status = monitor.shutdown();
        info!(
            impacts = status.impact_count,
            crashes = status.crash_count,
            dropped = status.dropped_count,
            "Sampling finished"
        );
    }
    served
}

async fn serve(config: &Config, log: Arc<EventLog>) -> anyhow::Result<()> {
    let server = Server::bind(config, log).await?;

    tokio::select! {
        () = server.serve() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("failed to listen for Ctrl-C")?;
            info!("Shutting down");
        }
    }
    Ok(())
}

fn handle_config(config_path: Option<PathBuf>, cmd: ConfigCommand) -> anyhow::Result<()> {
    match cmd {
        ConfigCommand::Show { json } => {
            let config = Config::load_from(config_path)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&config)?);
            } else {
                print_config(&config);
            }
        }
        ConfigCommand::Path => {
            let path = config_path.unwrap_or_else(Config::default_config_path);
            println!("{}", path.display());
        }
        ConfigCommand::Validate { file } => {
            let path = file
                .or(config_path)
                .unwrap_or_else(Config::default_config_path);
            println!("Validating configuration: {}", path.display());
            Config::load_from(Some(path))?;
            println!("Configuration is valid.");
        }
    }
    Ok(())
}

fn print_config(config: &Config) {
    println!("Current Configuration");
    println!("=====================");
    println!();
    println!("[Server]");
    println!(
        "  Listen:             {}:{}",
        config.server.bind_address, config.server.port
    );
    println!("  Flush threshold:    {} bytes", config.server.flush_threshold);
    match config.server.idle_timeout() {
        Some(timeout) => println!("  Idle timeout:       {} ms", timeout.as_millis()),
        None => println!("  Idle timeout:       none"),
    }
    println!("  Poll interval:      {} ms", config.server.poll_interval_ms);
    println!();
    println!("[Access]");
    println!("  Allowed prefix:     {}", config.access.allowed_prefix);
    println!(
        "  Rate limit:         {} requests / {} ms",
        config.access.max_requests, config.access.window_ms
    );
    println!();
    println!("[Log]");
    println!("  Path:               {}", config.log_path().display());
    println!("  Columns:            {}", config.log.columns.join(", "));
    println!();
    println!("[Monitor]");
    println!("  Enabled:            {}", config.monitor.enabled);
    println!(
        "  Thresholds:         impact > {}g, crash > {}g",
        config.monitor.impact_threshold, config.monitor.crash_threshold
    );
    println!("  Sample rate:        {} ms", config.monitor.sample_rate_ms);
}
