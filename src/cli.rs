use std::path::PathBuf;

use clap::builder::styling::{AnsiColor, Effects, Styles};
use clap::{Args, CommandFactory, Parser, Subcommand};

use crate::domain::task_kind::TaskKind;
use crate::query::TaskScope;

fn cli_styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::BrightCyan.on_default() | Effects::BOLD)
        .usage(AnsiColor::BrightYellow.on_default() | Effects::BOLD)
        .literal(AnsiColor::BrightGreen.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::BrightMagenta.on_default())
}

pub fn styled_command() -> clap::Command {
    Cli::command()
}

#[derive(Debug, Parser)]
#[command(name = "actionist")]
#[command(bin_name = "actionist")]
#[command(version)]
#[command(about = "Reminders and daily routines with nightly archival")]
#[command(styles = cli_styles())]
pub struct Cli {
    #[arg(
        short = 'c',
        long,
        env = "ACTIONIST_CONFIG",
        help = "Path to the TOML config file [default: .actionist/config.toml]."
    )]
    pub config: Option<PathBuf>,

    #[arg(
        short = 'd',
        long,
        env = "ACTIONIST_DB_PATH",
        help = "Path to the durable SQLite database (overrides config)."
    )]
    pub db: Option<PathBuf>,

    #[arg(
        long,
        env = "ACTIONIST_VOLATILE_PATH",
        help = "Path to the shared volatile store (overrides config)."
    )]
    pub volatile_db: Option<PathBuf>,

    #[arg(
        long,
        env = "ACTIONIST_TIMEZONE",
        help = "IANA time zone whose midnight triggers archival (overrides config)."
    )]
    pub timezone: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    #[command(about = "Create a reminder or routine.")]
    Add(AddArgs),
    #[command(about = "Change a task's title or description.")]
    Edit(EditArgs),
    #[command(about = "Delete a task and its history.")]
    Rm(IdArgs),
    #[command(about = "Show one task with its lifecycle state.")]
    Show(ShowArgs),
    #[command(about = "List tasks by scope.")]
    Ls(ListArgs),
    #[command(about = "Move a task into (or out of) the current list.")]
    Current(CurrentArgs),
    #[command(about = "Mark a task done, or undo it.")]
    Done(DoneArgs),
    #[command(about = "Show archived completions for a task.")]
    History(ShowArgs),
    #[command(about = "Archive the done list now instead of at midnight.")]
    Archive(JsonArgs),
    #[command(about = "Show the pending archival job and next cutoff.")]
    Schedule(JsonArgs),
    #[command(about = "Run due archival jobs.")]
    Worker(WorkerArgs),
    #[command(about = "Generate shell completions.")]
    Completions(CompletionsArgs),
}

#[derive(Debug, Args)]
pub struct AddArgs {
    #[arg(help = "Task title.")]
    pub title: String,

    #[arg(short = 'd', long = "desc", help = "Optional description text.")]
    pub desc: Option<String>,

    #[arg(
        short = 'k',
        long,
        default_value_t = TaskKind::Reminder,
        help = "Task kind: reminder (archived once) or routine (resets daily)."
    )]
    pub kind: TaskKind,

    #[arg(long, conflicts_with = "kind", help = "Shorthand for --kind routine.")]
    pub routine: bool,

    #[arg(long, help = "Owner recorded on the task (defaults to config owner).")]
    pub owner: Option<String>,

    #[arg(long, help = "Emit JSON output.")]
    pub json: bool,
}

impl AddArgs {
    pub fn resolved_kind(&self) -> TaskKind {
        if self.routine {
            TaskKind::Routine
        } else {
            self.kind
        }
    }
}

#[derive(Debug, Args)]
pub struct EditArgs {
    #[arg(help = "Task id.")]
    pub id: i64,

    #[arg(long, help = "New title.")]
    pub title: Option<String>,

    #[arg(short = 'd', long = "desc", help = "New description text.")]
    pub desc: Option<String>,

    #[arg(long, help = "Emit JSON output.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct IdArgs {
    #[arg(help = "Task id.")]
    pub id: i64,
}

#[derive(Debug, Args)]
pub struct ShowArgs {
    #[arg(help = "Task id.")]
    pub id: i64,

    #[arg(long, help = "Emit JSON output.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct ListArgs {
    #[arg(
        short = 's',
        long,
        default_value_t = TaskScope::All,
        help = "Which tasks to list: current, later, done or all."
    )]
    pub scope: TaskScope,

    #[arg(long, help = "Emit JSON output.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct CurrentArgs {
    #[arg(help = "Task id.")]
    pub id: i64,

    #[arg(long, help = "Move the task back to later instead.")]
    pub off: bool,

    #[arg(long, help = "Emit JSON output.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct DoneArgs {
    #[arg(help = "Task id.")]
    pub id: i64,

    #[arg(long, help = "Clear done; reverts an archived reminder to later.")]
    pub undo: bool,

    #[arg(long, help = "Emit JSON output.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct JsonArgs {
    #[arg(long, help = "Emit JSON output.")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct WorkerArgs {
    #[arg(long, help = "Run one polling pass and exit.")]
    pub once: bool,

    #[arg(long, help = "Seconds between polls (overrides config).")]
    pub poll_secs: Option<u64>,

    #[arg(long, help = "Emit JSON output (with --once).")]
    pub json: bool,
}

#[derive(Debug, Args)]
pub struct CompletionsArgs {
    #[arg(value_enum, help = "Shell to generate completions for.")]
    pub shell: clap_complete::Shell,
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
