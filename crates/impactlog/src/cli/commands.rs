//! CLI command definitions.

use std::path::PathBuf;

use clap::{Args, Subcommand};

use crate::config::Config;

/// Arguments for `run`.
#[derive(Debug, Default, Args)]
pub struct RunCommand {
    /// Port to listen on (overrides the config file)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Address to bind (overrides the config file)
    #[arg(short, long, value_name = "ADDR")]
    pub bind: Option<String>,

    /// Where to write the impact log (overrides the config file)
    #[arg(short, long, value_name = "PATH")]
    pub log_file: Option<PathBuf>,

    /// Serve the log without sampling the sensor
    #[arg(long)]
    pub no_monitor: bool,
}

impl RunCommand {
    /// Apply command-line overrides on top of loaded configuration.
    pub fn apply(&self, config: &mut Config) {
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = &self.bind {
            config.server.bind_address.clone_from(bind);
        }
        if let Some(path) = &self.log_file {
            config.log.path = Some(path.clone());
        }
        if self.no_monitor {
            config.monitor.enabled = false;
        }
    }
}

/// Configuration commands.
#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show {
        /// Output as JSON
        #[arg(short, long)]
        json: bool,
    },

    /// Show the configuration file path
    Path,

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        file: Option<PathBuf>,
    },
}
