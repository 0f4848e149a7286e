#![forbid(unsafe_code)]

use cd_core::select::blocked_reason;
use cd_core::state::TaskState;
use cd_engine::config::{Config, default_config_yaml};
use cd_engine::cycle::{CycleEngine, CycleResult};
use cd_engine::ingest;
use cd_engine::llm::{CommandRunner, LlmRunner};
use cd_storage::{AuditRow, NewTask, SqliteStore, TaskFilters, TaskRow};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

fn usage() -> &'static str {
    "cd_engine — Cadence cycle orchestrator\n\n\
USAGE:\n\
  cd_engine [--config PATH] COMMAND\n\n\
COMMANDS:\n\
  init [--force]                      write default config, create the database\n\
  ingest --payload FILE               load a parsed plan payload (requirements + tasks)\n\
  tasks list [--state S] [--owner O] [--priority N]\n\
  tasks show ID                       task details, notes and artifacts\n\
  tasks add --title T [--id ID] [--description D] [--priority N]\n\
            [--owner O] [--dep ID]... [--state S]\n\
  tasks set-state ID STATE [--note N] operator-driven transition (validated)\n\
  tasks note ID NOTE                  append a note\n\
  tasks unlock ID                     clear a stale advisory lock\n\
  start [--dry-run] [--timeout-s N]   execute one cycle\n\
  status [--report]                   per-state counts, ready and blocked tasks\n\
  audit --task ID | --recent N        audit trail\n\n\
The config file defaults to ./cadence.yaml.\n"
}

fn main() {
    let args: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = run(args) {
        eprintln!("{e}");
        std::process::exit(1);
    }
}

fn run(args: Vec<String>) -> Result<(), String> {
    let mut config_path = PathBuf::from("cadence.yaml");
    let mut rest = Vec::new();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => {
                config_path = PathBuf::from(
                    iter.next().ok_or("--config requires a value")?,
                );
            }
            "--help" | "-h" => {
                print!("{}", usage());
                return Ok(());
            }
            _ => {
                rest.push(arg);
                rest.extend(iter);
                break;
            }
        }
    }

    let Some(command) = rest.first().cloned() else {
        print!("{}", usage());
        return Err("missing command".to_string());
    };
    let rest = rest[1..].to_vec();

    match command.as_str() {
        "init" => cmd_init(&config_path, rest),
        "ingest" => cmd_ingest(&config_path, rest),
        "tasks" => cmd_tasks(&config_path, rest),
        "start" => cmd_start(&config_path, rest),
        "status" => cmd_status(&config_path, rest),
        "audit" => cmd_audit(&config_path, rest),
        other => Err(format!("unknown command: {other}")),
    }
}

fn load_config(config_path: &Path) -> Result<Config, String> {
    Config::load(config_path).map_err(|e| e.to_string())
}

fn open_store(config: &Config) -> Result<SqliteStore, String> {
    SqliteStore::open(&config.database).map_err(|e| e.to_string())
}

fn cmd_init(config_path: &Path, rest: Vec<String>) -> Result<(), String> {
    let force = rest.iter().any(|a| a == "--force");
    if config_path.exists() && !force {
        return Err(format!(
            "{} already exists (use --force to overwrite)",
            config_path.display()
        ));
    }
    std::fs::write(config_path, default_config_yaml())
        .map_err(|e| format!("write config failed: {e}"))?;

    let config = load_config(config_path)?;
    std::fs::create_dir_all(&config.workspace)
        .map_err(|e| format!("create workspace failed: {e}"))?;
    let store = open_store(&config)?;

    println!("config:    {}", config_path.display());
    println!("database:  {}", store.db_path().display());
    println!("plan file: {}", config.plan_file.display());
    Ok(())
}

fn cmd_ingest(config_path: &Path, rest: Vec<String>) -> Result<(), String> {
    let mut payload_path: Option<PathBuf> = None;
    let mut iter = rest.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--payload" => {
                payload_path = Some(PathBuf::from(
                    iter.next().ok_or("--payload requires a value")?,
                ));
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }
    let payload_path = payload_path.ok_or("--payload is required")?;

    let config = load_config(config_path)?;
    let mut store = open_store(&config)?;
    let summary = ingest::ingest_file(&mut store, &payload_path).map_err(|e| e.to_string())?;
    println!(
        "ingested {} requirements, {} tasks ({} skipped), {} links",
        summary.requirements, summary.tasks_created, summary.tasks_skipped, summary.links
    );
    Ok(())
}

fn cmd_tasks(config_path: &Path, rest: Vec<String>) -> Result<(), String> {
    let Some(sub) = rest.first().cloned() else {
        return Err("tasks requires a subcommand (list|show|add|set-state|note|unlock)".to_string());
    };
    let rest = rest[1..].to_vec();
    let config = load_config(config_path)?;
    let mut store = open_store(&config)?;

    match sub.as_str() {
        "list" => {
            let mut filters = TaskFilters::default();
            let mut iter = rest.into_iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--state" => {
                        let raw = iter.next().ok_or("--state requires a value")?;
                        filters.state = Some(
                            TaskState::parse(&raw).ok_or(format!("unknown state: {raw}"))?,
                        );
                    }
                    "--owner" => filters.owner = Some(iter.next().ok_or("--owner requires a value")?),
                    "--priority" => {
                        let raw = iter.next().ok_or("--priority requires a value")?;
                        filters.priority =
                            Some(raw.parse().map_err(|_| "priority must be an integer")?);
                    }
                    other => return Err(format!("unknown argument: {other}")),
                }
            }
            let tasks = store.list_tasks(&filters).map_err(|e| e.to_string())?;
            for task in &tasks {
                print_task_line(task);
            }
            println!("{} tasks", tasks.len());
            Ok(())
        }
        "show" => {
            let id = rest.first().ok_or("tasks show requires a task id")?;
            let task = store.get_task(id).map_err(|e| e.to_string())?;
            print_task_line(&task);
            if let Some(description) = &task.description {
                println!("  description: {description}");
            }
            if !task.dependencies.is_empty() {
                println!("  dependencies: {}", task.dependencies.join(", "));
            }
            let artifacts = store.list_artifacts(id).map_err(|e| e.to_string())?;
            for artifact in &artifacts {
                println!("  artifact {} v{}", artifact.name, artifact.version);
            }
            let notes = store.list_task_notes(id).map_err(|e| e.to_string())?;
            for note in &notes {
                let actor = note.actor.as_deref().unwrap_or("-");
                println!("  note [{}] {}: {}", rfc3339(note.ts_ms), actor, note.note);
            }
            Ok(())
        }
        "add" => {
            let mut new = NewTask::default();
            let mut iter = rest.into_iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--title" => new.title = iter.next().ok_or("--title requires a value")?,
                    "--id" => new.id = Some(iter.next().ok_or("--id requires a value")?),
                    "--description" => {
                        new.description =
                            Some(iter.next().ok_or("--description requires a value")?);
                    }
                    "--priority" => {
                        let raw = iter.next().ok_or("--priority requires a value")?;
                        new.priority =
                            Some(raw.parse().map_err(|_| "priority must be an integer")?);
                    }
                    "--owner" => new.owner = Some(iter.next().ok_or("--owner requires a value")?),
                    "--dep" => new
                        .dependencies
                        .push(iter.next().ok_or("--dep requires a value")?),
                    "--tag" => new.tags.push(iter.next().ok_or("--tag requires a value")?),
                    "--state" => {
                        let raw = iter.next().ok_or("--state requires a value")?;
                        new.state = Some(
                            TaskState::parse(&raw).ok_or(format!("unknown state: {raw}"))?,
                        );
                    }
                    other => return Err(format!("unknown argument: {other}")),
                }
            }
            let task = store.create_task(new).map_err(|e| e.to_string())?;
            println!("created {} ({})", task.id, task.title);
            Ok(())
        }
        "set-state" => {
            let id = rest.first().ok_or("tasks set-state requires a task id")?.clone();
            let state = rest.get(1).ok_or("tasks set-state requires a state")?.clone();
            let mut note = None;
            let mut iter = rest[2..].iter();
            while let Some(arg) = iter.next() {
                match arg.as_str() {
                    "--note" => note = Some(iter.next().ok_or("--note requires a value")?.clone()),
                    other => return Err(format!("unknown argument: {other}")),
                }
            }
            let outcome = store
                .validate_and_transition(&id, &state, note.as_deref(), Some("operator"))
                .map_err(|e| e.to_string())?;
            println!("{}: {} -> {}", outcome.task_id, outcome.from, outcome.to);
            Ok(())
        }
        "note" => {
            let id = rest.first().ok_or("tasks note requires a task id")?;
            let note = rest.get(1).ok_or("tasks note requires note text")?;
            store
                .append_task_note(id, Some("operator"), note)
                .map_err(|e| e.to_string())?;
            println!("noted {id}");
            Ok(())
        }
        "unlock" => {
            let id = rest.first().ok_or("tasks unlock requires a task id")?;
            let cleared = store
                .force_release_task_lock(id)
                .map_err(|e| e.to_string())?;
            println!(
                "{}",
                if cleared {
                    "lock cleared"
                } else {
                    "no lock held"
                }
            );
            Ok(())
        }
        other => Err(format!("unknown tasks subcommand: {other}")),
    }
}

fn cmd_start(config_path: &Path, rest: Vec<String>) -> Result<(), String> {
    let mut dry_run = false;
    let mut timeout_override = None;
    let mut iter = rest.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--dry-run" => dry_run = true,
            "--timeout-s" => {
                let raw = iter.next().ok_or("--timeout-s requires a value")?;
                let secs: u64 = raw.parse().map_err(|_| "--timeout-s must be an integer")?;
                timeout_override = Some(Duration::from_secs(secs));
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let runner = build_runner(&config)?;
    let mut engine = CycleEngine::new(&config, store, runner).map_err(|e| e.to_string())?;
    let result = engine
        .execute(dry_run, timeout_override)
        .map_err(|e| e.to_string())?;
    print_cycle_result(&result);
    Ok(())
}

fn build_runner(config: &Config) -> Result<Box<dyn LlmRunner>, String> {
    let primary = &config.llm.primary;
    let Some(runner) = config.llm.runners.get(primary) else {
        return Err(format!("llm.primary '{primary}' has no runner entry"));
    };
    Ok(Box::new(CommandRunner::new(
        primary,
        &runner.command,
        &runner.args,
    )))
}

fn print_cycle_result(result: &CycleResult) {
    let label = if result.dry_run { "dry-run cycle" } else { "cycle" };
    println!(
        "{label} {}: {} {} -> {} ({})",
        result.cycle_id, result.task_id, result.prev_state, result.next_state, result.outcome
    );
    if !result.artifacts_created.is_empty() {
        println!("artifacts: {}", result.artifacts_created.join(", "));
    }
    if let Some(note) = &result.note {
        println!("note: {note}");
    }
    println!("duration: {}ms", result.duration_ms);
}

fn cmd_status(config_path: &Path, rest: Vec<String>) -> Result<(), String> {
    let report_requested = rest.iter().any(|a| a == "--report");
    let config = load_config(config_path)?;
    let store = open_store(&config)?;
    let policy = config.selection.to_policy().map_err(|e| e.to_string())?;

    let report = store.status_report().map_err(|e| e.to_string())?;
    println!(
        "tasks: {} total, {} done ({:.1}% complete)",
        report.total_tasks, report.completed, report.completion_rate
    );
    for (state, count) in &report.by_state {
        println!("  {state}: {count}");
    }

    let snapshot = store.selection_snapshot().map_err(|e| e.to_string())?;
    let mut ready = Vec::new();
    let mut blocked = Vec::new();
    for task in &snapshot {
        if task.state.is_terminal() {
            continue;
        }
        match blocked_reason(task, &snapshot, policy.dependency_strict) {
            Some(reason) => blocked.push((task, reason)),
            None => ready.push(task),
        }
    }

    if !ready.is_empty() {
        println!("ready:");
        for task in ready {
            println!(
                "  {} (prio {}, {}) {}",
                task.id, task.priority, task.state, task.title
            );
        }
    }
    if !blocked.is_empty() {
        println!("blocked:");
        for (task, reason) in blocked {
            println!("  {} ({}): {}", task.id, task.title, reason);
        }
    }

    if report_requested {
        let recent = store.audit_recent(10).map_err(|e| e.to_string())?;
        if !recent.is_empty() {
            println!("recent cycles:");
            for entry in recent {
                print_audit_line(&entry);
            }
        }
    }
    Ok(())
}

fn cmd_audit(config_path: &Path, rest: Vec<String>) -> Result<(), String> {
    let config = load_config(config_path)?;
    let store = open_store(&config)?;

    let mut task_id = None;
    let mut recent = None;
    let mut iter = rest.into_iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--task" => task_id = Some(iter.next().ok_or("--task requires a value")?),
            "--recent" => {
                let raw = iter.next().ok_or("--recent requires a value")?;
                recent = Some(raw.parse::<i64>().map_err(|_| "--recent must be an integer")?);
            }
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    let entries = match (task_id, recent) {
        (Some(id), None) => store.audit_history(&id).map_err(|e| e.to_string())?,
        (None, Some(n)) => store.audit_recent(n).map_err(|e| e.to_string())?,
        _ => return Err("audit requires exactly one of --task ID or --recent N".to_string()),
    };
    for entry in &entries {
        print_audit_line(entry);
    }
    println!("{} entries", entries.len());
    Ok(())
}

fn print_task_line(task: &TaskRow) {
    let owner = task.owner.as_deref().unwrap_or("-");
    println!(
        "{} [{}] prio {} owner {}: {}",
        task.id, task.state, task.priority, owner, task.title
    );
}

fn print_audit_line(entry: &AuditRow) {
    let prev = entry.prev_state.as_deref().unwrap_or("-");
    let next = entry.next_state.as_deref().unwrap_or("-");
    let actor = entry.actor.as_deref().unwrap_or("-");
    println!(
        "{} {} {} {} -> {} {} ({})",
        rfc3339(entry.created_at_ms),
        entry.cycle_id,
        entry.task_id,
        prev,
        next,
        entry.result,
        actor
    );
    if let Some(note) = &entry.note
        && !note.is_empty()
    {
        println!("  {note}");
    }
}

fn rfc3339(ts_ms: i64) -> String {
    let nanos = (ts_ms as i128) * 1_000_000i128;
    let dt = OffsetDateTime::from_unix_timestamp_nanos(nanos).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    dt.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}
