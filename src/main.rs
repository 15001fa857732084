mod app;
mod archive;
mod cli;
mod clock;
mod completions;
mod config;
mod db;
mod domain;
mod errors;
mod jobs;
mod lifecycle;
mod locks;
mod query;
mod scheduler;
#[cfg(test)]
mod testing;
mod ui;
mod volatile;
mod worker;

use tracing_subscriber::EnvFilter;

fn main() {
    init_tracing();
    if let Err(err) = run() {
        eprintln!("error: {}", err);
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env("ACTIONIST_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn print_json(value: &impl serde::Serialize) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).expect("json serialization should work")
    );
}

fn load_config(cli: &cli::Cli) -> Result<config::Config, app::AppError> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(config::Config::default_path);
    let mut config = config::Config::load(&path)?;
    config.apply_overrides(config::ConfigOverrides {
        db_path: cli.db.clone(),
        volatile_path: cli.volatile_db.clone(),
        timezone: cli.timezone.clone(),
    })?;
    Ok(config)
}

fn run() -> Result<(), app::AppError> {
    use clap::Parser;
    use cli::Commands;

    let cli = cli::Cli::parse();
    if let Commands::Completions(args) = &cli.command {
        let mut stdout = std::io::stdout().lock();
        completions::generate_completions(args.shell, &mut stdout);
        return Ok(());
    }

    let config = load_config(&cli)?;
    let app = app::App::open(config)?;

    match cli.command {
        Commands::Add(args) => {
            let task = app.create_task(
                &args.title,
                args.desc.as_deref(),
                args.resolved_kind(),
                args.owner.as_deref(),
            )?;
            if args.json {
                print_json(&task);
            } else {
                println!("created #{} {}", task.id, task.title);
            }
        }
        Commands::Edit(args) => {
            let task = app.update_task(args.id, args.title.as_deref(), args.desc.as_deref())?;
            if args.json {
                print_json(&task);
            } else {
                println!("updated #{} {}", task.id, task.title);
            }
        }
        Commands::Rm(args) => {
            app.delete_task(args.id)?;
            println!("deleted #{}", args.id);
        }
        Commands::Show(args) => {
            let task = app.show_task(args.id)?;
            if args.json {
                print_json(&task);
            } else {
                ui::print_task_show(&task);
            }
        }
        Commands::Ls(args) => {
            let tasks = app.list_tasks(args.scope)?;
            if args.json {
                print_json(&tasks);
            } else {
                ui::print_task_list(&tasks, args.scope);
            }
        }
        Commands::Current(args) => {
            let task = app.set_current(args.id, !args.off)?;
            if args.json {
                print_json(&task);
            } else {
                println!("#{} {} [{}]", task.id, task.title, task.state);
            }
        }
        Commands::Done(args) => {
            let task = app.set_done(args.id, !args.undo)?;
            if args.json {
                print_json(&task);
            } else {
                println!("#{} {} [{}]", task.id, task.title, task.state);
            }
        }
        Commands::History(args) => {
            let entries = app.history(args.id)?;
            if args.json {
                print_json(&entries);
            } else {
                ui::print_history(args.id, &entries);
            }
        }
        Commands::Archive(args) => {
            let summary = app.archive_now()?;
            if args.json {
                print_json(&summary);
            } else {
                ui::print_archive_summary(&summary);
            }
        }
        Commands::Schedule(args) => {
            let view = app.schedule_status()?;
            if args.json {
                print_json(&view);
            } else {
                ui::print_schedule(&view);
            }
        }
        Commands::Worker(args) => {
            let poll = args.poll_secs.map(std::time::Duration::from_secs);
            if let Some(report) = app.run_worker(args.once, poll)? {
                if args.json {
                    print_json(&report);
                } else {
                    ui::print_tick_report(&report);
                }
            }
        }
        Commands::Completions(_) => unreachable!("completions are handled before opening stores"),
    }
    Ok(())
}
