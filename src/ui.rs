use std::io::{self, IsTerminal};

use crate::app::{HistoryEntryView, ScheduleView, TaskView};
use crate::archive::ArchiveSummary;
use crate::query::TaskScope;
use crate::worker::{JobOutcome, TickReport};

pub fn print_task_list(tasks: &[TaskView], scope: TaskScope) {
    let palette = Palette::auto();
    println!("{}", palette.heading(&format!("Tasks ({scope})")));
    if tasks.is_empty() {
        println!("{}", palette.dim("no tasks"));
        return;
    }
    for task in tasks {
        println!("{}", format_task_row(task, &palette));
    }
    println!("{}", palette.dim(&format!("{} task(s)", tasks.len())));
}

pub fn print_task_show(task: &TaskView) {
    let palette = Palette::auto();
    println!("{}", format_task_row(task, &palette));
    for (label, value) in task_show_fields(task) {
        println!("  {} {}", palette.dim(&format!("{label:<11}")), value);
    }
}

pub fn print_history(task_id: i64, entries: &[HistoryEntryView]) {
    let palette = Palette::auto();
    println!(
        "{}",
        palette.heading(&format!("History for {}", palette.id(&format!("#{task_id}"))))
    );
    if entries.is_empty() {
        println!("{}", palette.dim("never archived"));
        return;
    }
    for entry in entries {
        println!("  {}", entry.done_time);
    }
}

pub fn print_schedule(view: &ScheduleView) {
    let palette = Palette::auto();
    println!("{}", palette.heading("Archival"));
    for line in schedule_lines(view) {
        println!("  {line}");
    }
}

pub fn print_archive_summary(summary: &ArchiveSummary) {
    println!("{}", format_archive_summary(summary));
}

pub fn print_tick_report(report: &TickReport) {
    let palette = Palette::auto();
    if let Some(job_id) = report.rescheduled.as_deref() {
        println!("{}", palette.dim(&format!("rescheduled archival as {job_id}")));
    }
    if report.jobs.is_empty() {
        println!("{}", palette.dim("no jobs due"));
    }
    for outcome in &report.jobs {
        println!("{}", format_outcome(outcome, &palette));
    }
}

fn format_task_row(task: &TaskView, palette: &Palette) -> String {
    let mut line = format!(
        "{} {} {}",
        palette.id(&format!("#{}", task.id)),
        palette.state(&task.state),
        task.title
    );
    if task.kind != "reminder" {
        line.push(' ');
        line.push_str(&palette.kind_label(&task.kind));
    }
    line
}

fn task_show_fields(task: &TaskView) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("kind", task.kind.clone()),
        ("owner", task.owner.clone()),
        ("current", yes_no(task.current).to_string()),
        ("done", yes_no(task.done).to_string()),
    ];
    if let Some(done_time) = task.done_time.as_deref() {
        fields.push(("done_time", done_time.to_string()));
    }
    if let Some(description) = task.description.as_deref() {
        fields.push(("description", description.to_string()));
    }
    fields.push(("created_at", task.created_at.clone()));
    fields
}

fn schedule_lines(view: &ScheduleView) -> Vec<String> {
    let mut lines = vec![
        format!("timezone    {}", view.timezone),
        format!("next cutoff {}", view.next_cutoff),
    ];
    match &view.pending {
        Some(pending) => {
            let run_at = pending.run_at.as_deref().unwrap_or("not queued (stale)");
            lines.push(format!("pending     {} at {}", pending.job_id, run_at));
        }
        None => lines.push("pending     none".to_string()),
    }
    for job in &view.recent_jobs {
        let mut line = format!("job         {} {} at {}", job.id, job.status, job.run_at);
        if job.attempts > 1 {
            line.push_str(&format!(" ({} attempts)", job.attempts));
        }
        if let Some(error) = job.last_error.as_deref() {
            line.push_str(&format!(": {error}"));
        }
        lines.push(line);
    }
    lines
}

fn format_archive_summary(summary: &ArchiveSummary) -> String {
    let mut line = format!(
        "archived {} task(s): {} reminder(s), {} routine(s), {} history entr{}",
        summary.drained,
        summary.reminders_archived,
        summary.routines_reset,
        summary.history_written,
        if summary.history_written == 1 { "y" } else { "ies" }
    );
    if summary.replayed > 0 {
        line.push_str(&format!("; replayed {}", summary.replayed));
    }
    if summary.skipped_missing > 0 {
        line.push_str(&format!("; skipped {} deleted", summary.skipped_missing));
    }
    line
}

fn format_outcome(outcome: &JobOutcome, palette: &Palette) -> String {
    match outcome {
        JobOutcome::Succeeded { job_id, summary } => format!(
            "{} {} {}",
            palette.state("succeeded"),
            palette.id(job_id),
            format_archive_summary(summary)
        ),
        JobOutcome::Retrying {
            job_id,
            attempts,
            next_run_at,
            error,
        } => format!(
            "{} {} attempt {} failed: {} (next at {})",
            palette.state("retrying"),
            palette.id(job_id),
            attempts,
            error,
            next_run_at
        ),
        JobOutcome::Failed {
            job_id,
            attempts,
            error,
        } => format!(
            "{} {} gave up after {} attempt(s): {}",
            palette.state("failed"),
            palette.id(job_id),
            attempts,
            error
        ),
    }
}

fn yes_no(flag: bool) -> &'static str {
    if flag {
        "yes"
    } else {
        "no"
    }
}

struct Palette {
    enabled: bool,
}

impl Palette {
    fn auto() -> Self {
        let enabled = std::env::var_os("NO_COLOR").is_none() && io::stdout().is_terminal();
        Self { enabled }
    }

    fn paint(&self, code: &str, text: &str) -> String {
        if self.enabled {
            format!("\x1b[{code}m{text}\x1b[0m")
        } else {
            text.to_string()
        }
    }

    fn heading(&self, text: &str) -> String {
        self.paint("1;36", text)
    }

    fn dim(&self, text: &str) -> String {
        self.paint("2", text)
    }

    fn id(&self, text: &str) -> String {
        self.paint("1;94", text)
    }

    fn state(&self, state: &str) -> String {
        let upper = state.to_ascii_uppercase();
        self.paint(state_color_code(state), &format!("[{upper}]"))
    }

    fn kind_label(&self, kind: &str) -> String {
        self.paint("35", &format!("({kind})"))
    }
}

fn state_color_code(state: &str) -> &'static str {
    match state.trim().to_ascii_lowercase().as_str() {
        "later" => "37",
        "current" | "retrying" => "33",
        "done" | "succeeded" => "32",
        "archived" => "90",
        "failed" => "31",
        _ => "37",
    }
}
