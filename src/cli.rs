//! CLI definitions for the filament daemon.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

/// Filament overlay mesh router
#[derive(Parser)]
#[command(name = "filament")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, short = 'L', default_value = "info", global = true)]
    pub log_level: LogLevel,
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Error => write!(f, "error"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Trace => write!(f, "trace"),
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the filament daemon
    #[command(alias = "start")]
    Run {
        /// Path to the configuration file
        #[arg(short, long, default_value = "filament.json")]
        config: PathBuf,
    },

    /// Generate a fresh configuration with a new identity
    Genconfig {
        /// Write the configuration here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
