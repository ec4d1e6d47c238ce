mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use cli::{Cli, Command};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let directive = if cli.verbose {
        "overdrive=debug"
    } else {
        "overdrive=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Inspect { exe, config, json } => {
            commands::inspect::run(&exe, config.as_deref(), json)
        }
        Command::Presets { json } => commands::presets::run(json),
        Command::Hexdump {
            exe,
            rva,
            size,
            ascii,
        } => {
            let rva = commands::hex_utils::parse_hex_address(&rva)?;
            commands::hexdump::run(&exe, rva, size, ascii)
        }
        Command::Signatures { output } => commands::signatures::run(output.as_deref()),
    }
}
