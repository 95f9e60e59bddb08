mod cli;
mod commands;
mod config;
mod handler;
mod runner;
mod ui;
mod version_file;

use anyhow::Result;
use clap::{CommandFactory, Parser};
use clap_complete::generate;
use cli::{Cli, Command};
use config::Config;
use std::io;

/// Global context for the application
pub struct Context {
    pub verbose: u8,
    pub quiet: bool,
    pub config: Config,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging based on verbosity
    let log_level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    env_logger::Builder::new()
        .filter_level(if cli.quiet {
            log::LevelFilter::Error
        } else {
            log_level
        })
        .format_timestamp(None)
        .init();

    if let Command::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "converge", &mut io::stdout());
        return Ok(());
    }

    let ctx = Context {
        verbose: cli.verbose,
        quiet: cli.quiet,
        config: Config::load(cli.config.as_deref())?,
    };

    let result = match cli.command {
        Command::Validate { file } => commands::validate::run(&ctx, &file),
        Command::Deploy(args) => commands::deploy::run(&ctx, args),
        Command::Dryrun {
            file,
            model_version,
        } => commands::dryrun::run(&ctx, file.as_deref(), model_version),
        Command::History { resource, limit } => commands::history::run(&ctx, &resource, limit),
        Command::Status { resource } => commands::status::run(&ctx, resource.as_deref()),
        Command::Completions { .. } => Ok(()),
    };

    if let Err(e) = &result {
        ui::error(&format!("{e:#}"));
        std::process::exit(1);
    }
    result
}
