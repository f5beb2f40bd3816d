//! Embeddable command surface for the correction ledger.
//!
//! Host tooling can either spawn the `cl` binary or embed behavior through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command`] for direct [`Command`] execution against an open store.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use correction_ledger_core::{AuditReplay, BonusInput, UserId};
use correction_ledger_store_sqlite::{CorrectionFilter, SqliteCorrectionStore};
use serde_json::json;

pub mod logging;

#[derive(Debug, Parser)]
#[command(name = "cl")]
#[command(about = "Correction Ledger CLI")]
pub struct Cli {
    #[arg(long, default_value = "./correction_ledger.sqlite3")]
    db: PathBuf,

    #[arg(long, default_value = "info")]
    log_level: String,

    #[arg(long)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Bonus {
        #[command(subcommand)]
        command: Box<BonusCommand>,
    },
    Projects {
        #[command(subcommand)]
        command: Box<ProjectsCommand>,
    },
    Corrections {
        #[command(subcommand)]
        command: Box<CorrectionsCommand>,
    },
    Scores {
        #[command(subcommand)]
        command: Box<ScoresCommand>,
    },
    Audit {
        #[command(subcommand)]
        command: Box<AuditCommand>,
    },
}

#[derive(Debug, Subcommand)]
pub enum BonusCommand {
    Record(BonusRecordArgs),
}

#[derive(Debug, Args)]
pub struct BonusRecordArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    project: String,
    #[arg(long)]
    score: i64,
}

#[derive(Debug, Subcommand)]
pub enum ProjectsCommand {
    List,
}

#[derive(Debug, Subcommand)]
pub enum CorrectionsCommand {
    List(CorrectionsListArgs),
}

#[derive(Debug, Args)]
pub struct CorrectionsListArgs {
    #[arg(long)]
    user_id: Option<i64>,
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
pub enum ScoresCommand {
    Average(ScoresAverageArgs),
}

#[derive(Debug, Args)]
pub struct ScoresAverageArgs {
    #[arg(long)]
    user_id: i64,
    #[arg(long)]
    project: Option<String>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Subcommand)]
pub enum AuditCommand {
    Replay(AuditReplayArgs),
    Calls(AuditCallsArgs),
}

#[derive(Debug, Args)]
pub struct AuditReplayArgs {
    #[arg(long, default_value = "record_bonus")]
    operation: String,
    #[arg(long)]
    limit: Option<usize>,
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
pub struct AuditCallsArgs {
    #[arg(long, default_value = "record_bonus")]
    operation: String,
    #[arg(long)]
    json: bool,
}

pub fn run_cli(cli: Cli) -> Result<()> {
    logging::init_logging(&cli.log_level, cli.log_dir.as_deref())
        .map_err(|err| anyhow!("failed to initialize logging: {err}"))?;

    let mut store = SqliteCorrectionStore::open(&cli.db)?;
    store.migrate()?;
    run_command(cli.command, &mut store)
}

pub fn run_command(command: Command, store: &mut SqliteCorrectionStore) -> Result<()> {
    match command {
        Command::Bonus { command } => match *command {
            BonusCommand::Record(args) => {
                let input = BonusInput {
                    user_id: UserId(args.user_id),
                    project_name: args.project,
                    score: args.score,
                };
                let receipt = store.record_bonus(&input)?;
                println!("{}", serde_json::to_string_pretty(&receipt)?);
                Ok(())
            }
        },
        Command::Projects { command } => match *command {
            ProjectsCommand::List => {
                let projects = store.list_projects()?;
                println!("{}", serde_json::to_string_pretty(&projects)?);
                Ok(())
            }
        },
        Command::Corrections { command } => match *command {
            CorrectionsCommand::List(args) => {
                let filter = CorrectionFilter {
                    user_id: args.user_id.map(UserId),
                    project_name: args.project,
                    limit: args.limit,
                };
                let corrections = store.list_corrections(&filter)?;
                println!("{}", serde_json::to_string_pretty(&corrections)?);
                Ok(())
            }
        },
        Command::Scores { command } => match *command {
            ScoresCommand::Average(args) => {
                let average = store.average_score(UserId(args.user_id), args.project.as_deref())?;
                if args.json {
                    let payload = json!({
                        "contract_version": "average_score.v1",
                        "user_id": args.user_id,
                        "project": args.project,
                        "average_score": average,
                    });
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                } else {
                    print_average_text(args.user_id, args.project.as_deref(), average);
                }
                Ok(())
            }
        },
        Command::Audit { command } => match *command {
            AuditCommand::Replay(args) => {
                let replay = store.audit_replay(&args.operation, args.limit)?;
                if args.json {
                    println!("{}", serde_json::to_string_pretty(&replay)?);
                } else {
                    print_replay_text(&replay);
                }
                Ok(())
            }
            AuditCommand::Calls(args) => {
                let count = store.call_count(&args.operation)?;
                if args.json {
                    let payload = json!({
                        "operation": args.operation,
                        "call_count": count,
                    });
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                } else {
                    println!("{} call_count={count}", args.operation);
                }
                Ok(())
            }
        },
    }
}

fn print_average_text(user_id: i64, project: Option<&str>, average: Option<f64>) {
    match (average, project) {
        (Some(value), Some(name)) => println!("user {user_id} average on {name}: {value}"),
        (Some(value), None) => println!("user {user_id} average: {value}"),
        (None, Some(name)) => println!("no corrections recorded for user {user_id} on {name}"),
        (None, None) => println!("no corrections recorded for user {user_id}"),
    }
}

fn print_replay_text(replay: &AuditReplay) {
    println!(
        "{} was called {} times:",
        replay.operation, replay.calls_recorded
    );
    for entry in &replay.entries {
        println!(
            "{}({}) -> {}",
            entry.operation,
            format_replay_input(&entry.input_json),
            format_replay_output(&entry.output_json)
        );
    }
}

fn format_replay_input(input: &serde_json::Value) -> String {
    format!(
        "user_id={}, project={}, score={}",
        input["user_id"], input["project_name"], input["score"]
    )
}

fn format_replay_output(output: &serde_json::Value) -> String {
    let created = output["project_created"].as_bool().unwrap_or(false);
    let marker = if created { ", created project" } else { "" };
    format!(
        "correction {} (project {}{marker})",
        output["correction_id"], output["project_id"]
    )
}
