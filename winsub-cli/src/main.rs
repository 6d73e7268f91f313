mod app;
mod commands;

use clap::Parser;

use crate::app::{Cli, Command};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Show winsub info+ on stderr; --verbose enables debug; RUST_LOG overrides.
    let level = if cli.global.verbose {
        log::LevelFilter::Debug
    } else {
        log::LevelFilter::Info
    };
    env_logger::Builder::new()
        .filter_module("winsub", level)
        .parse_default_env()
        .target(env_logger::Target::Stderr)
        .format_timestamp(None)
        .format_module_path(false)
        .format_target(false)
        .init();

    match &cli.command {
        Command::Run { dll, font, base } => commands::run::run(dll, font, base.as_deref()),
        Command::Info { dll } => commands::info::run(dll),
        Command::Mutate {
            input,
            output,
            seed,
        } => commands::mutate::run(input, output, *seed),
    }
}
