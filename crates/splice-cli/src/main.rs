mod commands;
mod shutdown;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "splice")]
#[command(about = "Trampoline instrumentation for MCC Halo 1")]
struct Args {
    /// Layout file describing the target build
    #[arg(short, long, default_value = "layout.json")]
    layout: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Keep all hooks installed, recovering across game restarts
    Watch,
    /// Report attachment state, module base, and probe bytes
    Status,
    /// Read bytes at a module-relative offset
    Peek {
        #[arg(value_parser = parse_hex)]
        offset: u64,
        #[arg(default_value_t = 16)]
        len: usize,
    },
    /// Write bytes (spaced hex) at a module-relative offset
    Poke {
        #[arg(value_parser = parse_hex)]
        offset: u64,
        bytes: String,
    },
    /// Write the built-in layout to the layout file
    InitLayout,
    /// Exercise install, recovery, and teardown against a mock target
    Selftest,
}

fn parse_hex(s: &str) -> Result<u64, String> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    u64::from_str_radix(digits, 16).map_err(|e| format!("not a hex offset: {e}"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("splice=info".parse()?))
        .init();

    let args = Args::parse();

    if let Command::InitLayout = args.command {
        return commands::init_layout(&args.layout);
    }
    if let Command::Selftest = args.command {
        return commands::selftest();
    }

    let layout = commands::load_or_default(&args.layout);
    match args.command {
        Command::Watch => commands::watch(layout),
        Command::Status => commands::status(layout),
        Command::Peek { offset, len } => commands::peek(layout, offset, len),
        Command::Poke { offset, bytes } => commands::poke(layout, offset, &bytes),
        Command::InitLayout | Command::Selftest => unreachable!(),
    }
}
