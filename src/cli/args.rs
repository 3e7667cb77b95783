//! Command line argument parsing
//!
//! Subcommands:
//! - `serve`: run the event loop on stdin/stdout
//! - `ping`: print the pong this host would send
//! - `activate`: activate the instance described in a JSON file
//! - `deactivate`: stop the container of an instance
//! - `describe`: print the observed state of an instance
//! - `show-config`: show configuration discovery information

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "dockhand")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Node agent that reconciles instances against the local container engine")]
#[command(long_about = None)]
#[command(arg_required_else_help = true)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Enable verbose output
    #[arg(short = 'v', long = "verbose", global = true)]
    pub verbose: bool,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Handle newline-delimited JSON events from stdin, replying on stdout
    Serve,
    /// Print this host's resources and running instances
    Ping {
        /// Leave out running instances
        #[arg(long = "no-instances")]
        no_instances: bool,
    },
    /// Activate the instance described in a JSON file
    Activate {
        /// Path to the instance JSON
        file: PathBuf,
    },
    /// Stop the container of an instance
    Deactivate {
        /// Instance name
        name: String,
    },
    /// Print the observed state of an instance
    Describe {
        /// Instance name
        name: String,
    },
    /// Show configuration discovery information
    ShowConfig,
}

impl Args {
    /// Log filter for the selected verbosity.
    pub fn log_filter(&self) -> &'static str {
        if self.verbose {
            "dockhand=debug"
        } else {
            "dockhand=info"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_activate_with_config() {
        let args = Args::try_parse_from([
            "dockhand",
            "--config",
            "/etc/agent.toml",
            "activate",
            "web.json",
        ])
        .unwrap();

        assert_eq!(args.config, Some(PathBuf::from("/etc/agent.toml")));
        assert!(matches!(
            args.command,
            Commands::Activate { ref file } if file == &PathBuf::from("web.json")
        ));
        assert_eq!(args.log_filter(), "dockhand=info");
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["dockhand", "describe", "abc", "-v"]).unwrap();

        assert!(args.verbose);
        assert!(matches!(args.command, Commands::Describe { ref name } if name == "abc"));
        assert_eq!(args.log_filter(), "dockhand=debug");
    }

    #[test]
    fn test_ping_flags() {
        let args = Args::try_parse_from(["dockhand", "ping", "--no-instances"]).unwrap();
        assert!(matches!(args.command, Commands::Ping { no_instances: true }));
    }

    #[test]
    fn test_missing_subcommand_rejected() {
        assert!(Args::try_parse_from(["dockhand"]).is_err());
        assert!(Args::try_parse_from(["dockhand", "deactivate"]).is_err());
    }
}
