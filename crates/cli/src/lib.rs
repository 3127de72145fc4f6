pub mod commands;

use clap::{Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "syncso",
    about = "SyncSO agent runtime operator CLI",
    long_about = "Inspect configuration, check readiness, apply migrations, list agents and run requests through the orchestrator.",
    after_help = "Examples:\n  syncso doctor --json\n  syncso config\n  syncso ask \"research Acme and draft a proposal\" --session demo"
)]
pub struct Cli {
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
    #[command(about = "Validate config, LLM credentials, DB connectivity and the agent catalog")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "List the built-in agents and their capabilities as JSON")]
    Agents,
    #[command(about = "Route a message through the orchestrator and print the workflow result")]
    Ask {
        message: String,
        #[arg(long, help = "Conversation session id; a new one is generated when omitted")]
        session: Option<String>,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => commands::doctor::run(json),
        Command::Agents => commands::agents::run(),
        Command::Ask { message, session } => commands::ask::run(&message, session.as_deref()),
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
