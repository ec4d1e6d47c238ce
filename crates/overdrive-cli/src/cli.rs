use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "overdrive")]
#[command(about = "Offline inspection of a host executable for the Overdrive runtime")]
#[command(version)]
pub struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Map an executable and report hook coverage and patch table resolution
    Inspect {
        /// Path to the host executable
        exe: PathBuf,

        /// Configuration file (TOML)
        #[arg(short, long, env = "OVERDRIVE_CONFIG")]
        config: Option<PathBuf>,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the performance, memory and object presets
    Presets {
        /// Print the tables as JSON
        #[arg(long)]
        json: bool,
    },

    /// Dump bytes of the mapped image
    Hexdump {
        /// Path to the host executable
        exe: PathBuf,

        /// Module-relative address (hex, with or without 0x)
        rva: String,

        /// Number of bytes to dump
        #[arg(short, long, default_value = "256")]
        size: usize,

        /// Show an ASCII column
        #[arg(short, long)]
        ascii: bool,
    },

    /// Write the built-in signatures as JSON
    Signatures {
        /// Output file; prints to stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}
