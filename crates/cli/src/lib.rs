pub mod commands;

use clap::{ArgGroup, Parser, Subcommand};
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(
    name = "zenthor",
    about = "Zenthor operator CLI",
    long_about = "Operate the Zenthor agent runtime: migrations, readiness checks, config inspection, job submission and tool approvals.",
    after_help = "Examples:\n  zenthor doctor --json\n  zenthor enqueue --conversation conv-123 --text \"hello\"\n  zenthor approvals resolve apr-123 --approve"
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
    #[command(about = "Validate config, model gateway, delivery transport and DB connectivity")]
    Doctor {
        #[arg(long, help = "Emit machine-readable JSON output")]
        json: bool,
    },
    #[command(about = "Store a user message in a conversation and queue a turn for the agent")]
    Enqueue {
        #[arg(long, help = "Conversation id")]
        conversation: String,
        #[arg(long, help = "Message text")]
        text: String,
    },
    #[command(subcommand, about = "Inspect and resolve pending tool approvals")]
    Approvals(ApprovalsCommand),
}

#[derive(Debug, Subcommand)]
enum ApprovalsCommand {
    #[command(about = "List pending approvals")]
    List {
        #[arg(long, help = "Only approvals of this conversation")]
        conversation: Option<String>,
    },
    #[command(about = "Approve or reject a pending approval")]
    #[command(group(ArgGroup::new("decision").required(true).args(["approve", "reject"])))]
    Resolve {
        id: String,
        #[arg(long)]
        approve: bool,
        #[arg(long)]
        reject: bool,
    },
}

pub fn run() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Migrate => commands::migrate::run(),
        Command::Config => {
            commands::CommandResult { exit_code: 0, output: commands::config::run() }
        }
        Command::Doctor { json } => {
            commands::CommandResult { exit_code: 0, output: commands::doctor::run(json) }
        }
        Command::Enqueue { conversation, text } => commands::enqueue::run(&conversation, &text),
        Command::Approvals(ApprovalsCommand::List { conversation }) => {
            commands::approvals::list(conversation.as_deref())
        }
        Command::Approvals(ApprovalsCommand::Resolve { id, approve, .. }) => {
            commands::approvals::resolve(&id, approve)
        }
    };

    println!("{}", result.output);
    ExitCode::from(result.exit_code)
}
