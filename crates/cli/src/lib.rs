pub mod commands;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use expensio_core::config::LoadOptions;

#[derive(Debug, Parser)]
#[command(
    name = "expensio",
    about = "Expensio operator CLI",
    long_about = "Operate the expense approval service: schema migrations, effective configuration and readiness checks.",
    after_help = "Examples:\n  expensio doctor --json\n  expensio config\n  expensio migrate --config config/expensio.toml"
)]
pub struct Cli {
    #[arg(long, global = true, help = "Path to an expensio.toml config file")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    #[command(about = "Apply pending database migrations and return structured status output")]
    Migrate,
    #[command(
        about = "Inspect effective configuration values with source attribution and redaction"
    )]
    Config,
    #[command(about = "Validate config, currency endpoint settings, and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();
    let options = LoadOptions {
        require_file: cli.config.is_some(),
        config_path: cli.config,
        ..LoadOptions::default()
    };

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(options),
        Command::Config => commands::config::run(options),
        Command::Doctor { json } => commands::doctor::run(options, json),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
