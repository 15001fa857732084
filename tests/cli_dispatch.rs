use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use serde_json::Value;
use uuid::Uuid;

fn unique_workspace(prefix: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("{prefix}-{}", Uuid::now_v7()));
    std::fs::create_dir_all(&path).expect("workspace should be creatable");
    path
}

fn actionist(root: &Path) -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_actionist"));
    command
        .current_dir(root)
        .env_remove("ACTIONIST_CONFIG")
        .env_remove("ACTIONIST_DB_PATH")
        .env_remove("ACTIONIST_VOLATILE_PATH")
        .env_remove("ACTIONIST_TIMEZONE")
        .env("NO_COLOR", "1")
        .arg("--config")
        .arg(root.join("config.toml"))
        .arg("--db")
        .arg(root.join("state/actionist.db"))
        .arg("--volatile-db")
        .arg(root.join("state/volatile.db"));
    command
}

fn run(root: &Path, args: &[&str]) -> Output {
    actionist(root)
        .args(args)
        .output()
        .expect("actionist command should run")
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "expected success but failed.\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn assert_failure(output: &Output) {
    assert!(
        !output.status.success(),
        "expected failure but command succeeded.\nstdout:\n{}\nstderr:\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn run_json(root: &Path, args: &[&str]) -> Value {
    let output = run(root, args);
    assert_success(&output);
    serde_json::from_slice(&output.stdout).expect("stdout should be JSON")
}

fn add_task(root: &Path, title: &str, extra: &[&str]) -> i64 {
    let mut args = vec!["add", title, "--json"];
    args.extend_from_slice(extra);
    run_json(root, &args)["id"]
        .as_i64()
        .expect("created task should have an id")
}

#[test]
fn add_done_and_list_by_scope() {
    let root = unique_workspace("actionist-cli-scopes");
    let rent = add_task(&root, "Pay rent", &[]);
    let stretch = add_task(&root, "Stretch", &["--routine"]);
    let milk = add_task(&root, "Buy milk", &[]);

    let done = run_json(&root, &["done", &rent.to_string(), "--json"]);
    assert_eq!(done["state"], "done");
    assert_eq!(done["current"], true);
    assert!(done["done_time"].as_str().is_some());

    assert_success(&run(&root, &["current", &stretch.to_string()]));

    let current = run_json(&root, &["ls", "--scope", "current", "--json"]);
    let ids = current
        .as_array()
        .expect("list should be an array")
        .iter()
        .map(|task| task["id"].as_i64().expect("id"))
        .collect::<Vec<_>>();
    assert_eq!(ids, vec![rent, stretch]);

    let later = run_json(&root, &["ls", "--scope", "later", "--json"]);
    assert_eq!(later.as_array().expect("array").len(), 1);
    assert_eq!(later[0]["id"], milk);

    let shown = run_json(&root, &["show", &stretch.to_string(), "--json"]);
    assert_eq!(shown["kind"], "routine");
    assert_eq!(shown["state"], "current");

    let listing = run(&root, &["ls"]);
    assert_success(&listing);
    let text = String::from_utf8_lossy(&listing.stdout);
    assert!(text.contains("Tasks (all)"));
    assert!(text.contains(&format!("#{stretch} [CURRENT] Stretch (routine)")));

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn archive_moves_done_tasks_into_history() {
    let root = unique_workspace("actionist-cli-archive");
    let rent = add_task(&root, "Pay rent", &[]);
    let stretch = add_task(&root, "Stretch", &["--kind", "routine"]);
    assert_success(&run(&root, &["done", &rent.to_string()]));
    assert_success(&run(&root, &["done", &stretch.to_string()]));

    let schedule = run_json(&root, &["schedule", "--json"]);
    assert_eq!(schedule["timezone"], "America/New_York");
    assert!(schedule["pending"]["job_id"]
        .as_str()
        .expect("job id")
        .starts_with("J-"));

    let summary = run_json(&root, &["archive", "--json"]);
    assert_eq!(summary["drained"], 2);
    assert_eq!(summary["reminders_archived"], 1);
    assert_eq!(summary["routines_reset"], 1);

    let schedule = run_json(&root, &["schedule", "--json"]);
    assert!(schedule["pending"].is_null());

    let history = run_json(&root, &["history", &rent.to_string(), "--json"]);
    assert_eq!(history.as_array().expect("array").len(), 1);

    let rent_view = run_json(&root, &["show", &rent.to_string(), "--json"]);
    assert_eq!(rent_view["state"], "archived");
    assert_eq!(rent_view["done"], true);
    let stretch_view = run_json(&root, &["show", &stretch.to_string(), "--json"]);
    assert_eq!(stretch_view["state"], "later");
    assert_eq!(stretch_view["done"], false);

    let reverted = run_json(&root, &["done", &rent.to_string(), "--undo", "--json"]);
    assert_eq!(reverted["state"], "later");
    let history = run_json(&root, &["history", &rent.to_string(), "--json"]);
    assert!(history.as_array().expect("array").is_empty());

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn worker_once_reports_no_due_jobs_before_midnight() {
    let root = unique_workspace("actionist-cli-worker");
    let rent = add_task(&root, "Pay rent", &[]);
    assert_success(&run(&root, &["done", &rent.to_string()]));

    let report = run_json(&root, &["worker", "--once", "--json"]);
    assert!(report["jobs"].as_array().expect("jobs").is_empty());
    assert!(report["rescheduled"].is_null());
    assert!(!root.join("state/worker.lock").exists());

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn config_file_and_timezone_override_apply() {
    let root = unique_workspace("actionist-cli-config");
    std::fs::write(
        root.join("config.toml"),
        "owner = \"ana\"\ntimezone = \"Europe/Berlin\"\n",
    )
    .expect("config should be writable");

    let created = run_json(&root, &["add", "Water plants", "--json"]);
    assert_eq!(created["owner"], "ana");

    let schedule = run_json(&root, &["schedule", "--json"]);
    assert_eq!(schedule["timezone"], "Europe/Berlin");

    let overridden = run_json(&root, &["--timezone", "Asia/Tokyo", "schedule", "--json"]);
    assert_eq!(overridden["timezone"], "Asia/Tokyo");

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn errors_exit_non_zero_with_message() {
    let root = unique_workspace("actionist-cli-errors");

    let missing = run(&root, &["show", "999"]);
    assert_failure(&missing);
    assert!(String::from_utf8_lossy(&missing.stderr).contains("error: task '999' not found"));

    let bad_zone = run(&root, &["--timezone", "Mars/Olympus", "ls"]);
    assert_failure(&bad_zone);
    assert!(String::from_utf8_lossy(&bad_zone.stderr).contains("unknown time zone"));

    let id = add_task(&root, "Call mom", &[]);
    let empty_edit = run(&root, &["edit", &id.to_string()]);
    assert_failure(&empty_edit);
    assert!(String::from_utf8_lossy(&empty_edit.stderr).contains("--title or --desc"));

    assert_success(&run(&root, &["rm", &id.to_string()]));
    assert_failure(&run(&root, &["rm", &id.to_string()]));

    let _ = std::fs::remove_dir_all(root);
}

#[test]
fn completions_are_generated_without_opening_stores() {
    let root = unique_workspace("actionist-cli-completions");
    let output = run(&root, &["completions", "bash"]);
    assert_success(&output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("actionist"));
    assert!(!root.join("state").exists());

    let _ = std::fs::remove_dir_all(root);
}
