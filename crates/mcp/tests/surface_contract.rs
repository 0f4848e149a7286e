#![forbid(unsafe_code)]

use cd_core::state::TaskState;
use cd_storage::{AgentRow, NewTask, RequirementKind, SqliteStore};
use serde_json::{Value, json};
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

struct Server {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    dir: PathBuf,
}

impl Server {
    fn start(test_name: &str, extra_args: &[&str], seed: impl FnOnce(&mut SqliteStore)) -> Self {
        let dir = temp_dir(test_name);
        let db_path = dir.join("cadence.db");
        {
            let mut store = SqliteStore::open(&db_path).expect("open store for seeding");
            seed(&mut store);
        }

        let mut cmd = Command::new(env!("CARGO_BIN_EXE_cd_mcp"));
        cmd.arg("--database").arg(&db_path);
        for arg in extra_args {
            cmd.arg(arg);
        }
        let mut child = cmd
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()
            .expect("spawn cd_mcp");

        let stdin = child.stdin.take().expect("stdin");
        let stdout = BufReader::new(child.stdout.take().expect("stdout"));

        Self {
            child,
            stdin,
            stdout,
            dir,
        }
    }

    fn send(&mut self, req: Value) {
        writeln!(self.stdin, "{req}").expect("write request");
        self.stdin.flush().expect("flush request");
    }

    fn recv(&mut self) -> Value {
        let mut line = String::new();
        self.stdout.read_line(&mut line).expect("read response");
        assert!(!line.trim().is_empty(), "empty response line");
        serde_json::from_str(&line).expect("parse response json")
    }

    fn request(&mut self, req: Value) -> Value {
        self.send(req);
        self.recv()
    }

    fn initialize(&mut self) -> Value {
        self.request(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "initialize",
            "params": {}
        }))
    }

    fn call(&mut self, id: i64, method: &str, params: Value) -> Value {
        self.request(json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params
        }))
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn temp_dir(test_name: &str) -> PathBuf {
    let base = std::env::temp_dir();
    let pid = std::process::id();
    let nonce = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let dir = base.join(format!("cd_mcp_{test_name}_{pid}_{nonce}"));
    std::fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

fn seed_task(store: &mut SqliteStore, id: &str, state: TaskState) {
    store
        .create_task(NewTask {
            id: Some(id.to_string()),
            title: format!("Task {id}"),
            state: Some(state),
            ..NewTask::default()
        })
        .expect("seed task");
}

fn error_code(resp: &Value) -> i64 {
    resp.get("error")
        .and_then(|v| v.get("code"))
        .and_then(|v| v.as_i64())
        .expect("error.code")
}

fn error_kind(resp: &Value) -> &str {
    resp.get("error")
        .and_then(|v| v.get("data"))
        .and_then(|v| v.get("kind"))
        .and_then(|v| v.as_str())
        .expect("error.data.kind")
}

#[test]
fn initialize_advertises_methods_and_gates_everything_else() {
    let mut server = Server::start("initialize_gate", &[], |_| {});

    let early = server.call(1, "tasks.list", json!({}));
    assert_eq!(error_code(&early), -32002);

    let init = server.initialize();
    let result = init.get("result").expect("initialize result");
    assert_eq!(
        result.get("protocolVersion").and_then(|v| v.as_str()),
        Some("2024-11-05")
    );
    let methods = result
        .get("capabilities")
        .and_then(|v| v.get("methods"))
        .and_then(|v| v.as_array())
        .expect("capabilities.methods");
    assert!(methods.iter().any(|m| m == "tasks.update_state"));
    assert!(methods.iter().any(|m| m == "plan.read"));

    let pong = server.call(2, "ping", json!({}));
    assert!(pong.get("result").is_some());
}

#[test]
fn malformed_lines_map_to_protocol_error_codes() {
    let mut server = Server::start("protocol_errors", &[], |_| {});
    server.initialize();

    let parse = server.request(json!("not an object"));
    assert_eq!(error_code(&parse), -32600);

    server.send(json!({ "jsonrpc": "2.0", "id": 7 }));
    let invalid = server.recv();
    assert_eq!(error_code(&invalid), -32600);

    writeln!(server.stdin, "{{ this is not json").expect("write garbage");
    server.stdin.flush().expect("flush");
    let garbage = server.recv();
    assert_eq!(error_code(&garbage), -32700);

    let unknown = server.call(8, "tasks.destroy", json!({}));
    assert_eq!(error_code(&unknown), -32601);
}

#[test]
fn missing_task_is_resource_not_found() {
    let mut server = Server::start("task_not_found", &[], |_| {});
    server.initialize();

    let resp = server.call(2, "tasks.get", json!({ "task_id": "ghost" }));
    assert_eq!(error_code(&resp), -32001);
    assert_eq!(error_kind(&resp), "task_not_found");
}

#[test]
fn handover_gate_walks_a_task_through_planning() {
    let mut server = Server::start("handover_walk", &[], |store| {
        seed_task(store, "T1", TaskState::ReadyForPlan);
    });
    server.initialize();

    // ready_for_plan -> planning needs no handover.
    let into_planning = server.call(
        2,
        "tasks.update_state",
        json!({ "task_id": "T1", "state": "planning" }),
    );
    assert!(
        into_planning.get("result").is_some(),
        "unexpected error: {into_planning}"
    );

    // planning -> ready_for_implementation requires implementation_plan.
    let premature = server.call(
        3,
        "tasks.update_state",
        json!({ "task_id": "T1", "state": "ready_for_implementation" }),
    );
    assert_eq!(error_code(&premature), -32602);
    assert_eq!(error_kind(&premature), "missing_handover");

    let blank = server.call(
        4,
        "artifacts.upsert",
        json!({ "task_id": "T1", "name": "implementation_plan", "content": "" }),
    );
    assert!(blank.get("result").is_some());

    let still_blocked = server.call(
        5,
        "tasks.update_state",
        json!({ "task_id": "T1", "state": "ready_for_implementation" }),
    );
    assert_eq!(error_kind(&still_blocked), "empty_handover");

    let plan = server.call(
        6,
        "artifacts.upsert",
        json!({ "task_id": "T1", "name": "implementation_plan", "content": "# Plan\n1. build" }),
    );
    let version = plan
        .get("result")
        .and_then(|v| v.get("artifact"))
        .and_then(|v| v.get("version"))
        .and_then(|v| v.as_i64());
    assert_eq!(version, Some(2));

    let accepted = server.call(
        7,
        "tasks.update_state",
        json!({ "task_id": "T1", "state": "ready_for_implementation", "note": "plan attached" }),
    );
    let result = accepted.get("result").expect("transition result");
    assert_eq!(
        result.get("prev_state").and_then(|v| v.as_str()),
        Some("planning")
    );
    assert_eq!(
        result.get("state").and_then(|v| v.as_str()),
        Some("ready_for_implementation")
    );
}

#[test]
fn inspect_transition_previews_without_mutating() {
    let mut server = Server::start("inspect_preview", &[], |store| {
        seed_task(store, "T1", TaskState::Planning);
    });
    server.initialize();

    let resp = server.call(
        2,
        "tasks.inspect_transition",
        json!({ "task_id": "T1", "state": "ready_for_implementation" }),
    );
    let result = resp.get("result").expect("result");
    assert_eq!(result.get("is_valid").and_then(|v| v.as_bool()), Some(false));
    let missing = result
        .get("missing_handovers")
        .and_then(|v| v.as_array())
        .expect("missing_handovers");
    assert_eq!(missing, &vec![json!("implementation_plan")]);

    // Inspection changed nothing.
    let task = server.call(3, "tasks.get", json!({ "task_id": "T1" }));
    assert_eq!(
        task.get("result")
            .and_then(|v| v.get("state"))
            .and_then(|v| v.as_str()),
        Some("planning")
    );
}

#[test]
fn illegal_transition_reports_the_allowed_set() {
    let mut server = Server::start("illegal_transition", &[], |store| {
        seed_task(store, "T1", TaskState::ReadyForPlan);
    });
    server.initialize();

    let resp = server.call(
        2,
        "tasks.update_state",
        json!({ "task_id": "T1", "state": "reviewing" }),
    );
    assert_eq!(error_code(&resp), -32602);
    assert_eq!(error_kind(&resp), "illegal_transition");
    let allowed = resp
        .get("error")
        .and_then(|v| v.get("data"))
        .and_then(|v| v.get("allowed"))
        .and_then(|v| v.as_array())
        .expect("allowed list");
    assert_eq!(allowed, &vec![json!("planning")]);
}

#[test]
fn get_next_returns_task_and_rationale() {
    let mut server = Server::start("get_next", &[], |store| {
        seed_task(store, "T1", TaskState::ReadyForPlan);
        store
            .create_task(NewTask {
                id: Some("T2".to_string()),
                title: "Urgent".to_string(),
                state: Some(TaskState::ReadyForPlan),
                priority: Some(9),
                ..NewTask::default()
            })
            .expect("seed urgent task");
    });
    server.initialize();

    let resp = server.call(2, "tasks.get_next", json!({}));
    let result = resp.get("result").expect("result");
    assert_eq!(
        result
            .get("task")
            .and_then(|v| v.get("id"))
            .and_then(|v| v.as_str()),
        Some("T2")
    );
    let reason = result
        .get("selection_reason")
        .and_then(|v| v.as_str())
        .expect("selection_reason");
    assert!(reason.contains("high priority (9)"), "reason: {reason}");
}

#[test]
fn get_next_on_empty_store_is_no_selectable_tasks() {
    let mut server = Server::start("get_next_empty", &[], |_| {});
    server.initialize();

    let resp = server.call(2, "tasks.get_next", json!({}));
    assert_eq!(error_code(&resp), -32001);
    assert_eq!(error_kind(&resp), "no_selectable_tasks");
}

#[test]
fn list_filters_by_state() {
    let mut server = Server::start("list_filter", &[], |store| {
        seed_task(store, "T1", TaskState::ReadyForPlan);
        seed_task(store, "T2", TaskState::NeedsFixes);
    });
    server.initialize();

    let resp = server.call(2, "tasks.list", json!({ "state": "needs_fixes" }));
    let result = resp.get("result").expect("result");
    assert_eq!(result.get("count").and_then(|v| v.as_i64()), Some(1));

    let bad = server.call(3, "tasks.list", json!({ "state": "limbo" }));
    assert_eq!(error_code(&bad), -32602);
}

#[test]
fn artifact_versions_round_trip_through_the_surface() {
    let mut server = Server::start("artifact_versions", &[], |store| {
        seed_task(store, "T1", TaskState::Implementing);
    });
    server.initialize();

    for (id, content) in [(2, "v1"), (3, "v2")] {
        let resp = server.call(
            id,
            "artifacts.upsert",
            json!({ "task_id": "T1", "name": "change_summary", "content": content }),
        );
        assert!(resp.get("result").is_some());
    }

    let latest = server.call(
        4,
        "artifacts.get",
        json!({ "task_id": "T1", "name": "change_summary" }),
    );
    let result = latest.get("result").expect("latest");
    assert_eq!(result.get("version").and_then(|v| v.as_i64()), Some(2));
    assert_eq!(result.get("content").and_then(|v| v.as_str()), Some("v2"));

    let pinned = server.call(
        5,
        "artifacts.get",
        json!({ "task_id": "T1", "name": "change_summary", "version": 1 }),
    );
    assert_eq!(
        pinned
            .get("result")
            .and_then(|v| v.get("content"))
            .and_then(|v| v.as_str()),
        Some("v1")
    );

    let listed = server.call(6, "artifacts.list", json!({ "task_id": "T1" }));
    assert_eq!(
        listed
            .get("result")
            .and_then(|v| v.get("count"))
            .and_then(|v| v.as_i64()),
        Some(2)
    );
}

#[test]
fn requirements_list_filters_by_type() {
    let mut server = Server::start("requirements_list", &[], |store| {
        store
            .upsert_requirement("FR-1", "Login", "Users can log in", RequirementKind::Functional)
            .expect("seed fr");
        store
            .upsert_requirement("R-1", "Data loss", "Backups exist", RequirementKind::Risk)
            .expect("seed risk");
    });
    server.initialize();

    let all = server.call(2, "requirements.list", json!({}));
    assert_eq!(
        all.get("result")
            .and_then(|v| v.get("count"))
            .and_then(|v| v.as_i64()),
        Some(2)
    );

    let risks = server.call(3, "requirements.list", json!({ "type": "risk" }));
    assert_eq!(
        risks
            .get("result")
            .and_then(|v| v.get("count"))
            .and_then(|v| v.as_i64()),
        Some(1)
    );
}

#[test]
fn plan_read_returns_content_and_digest() {
    let dir = temp_dir("plan_read_payload");
    let plan_path = dir.join("plan.md");
    std::fs::write(&plan_path, "# Plan\nBuild the thing.\n").expect("write plan");
    let plan_arg = plan_path.to_string_lossy().to_string();

    let mut server = Server::start("plan_read", &["--plan-file", plan_arg.as_str()], |_| {});
    server.initialize();

    let resp = server.call(2, "plan.read", json!({}));
    let result = resp.get("result").expect("result");
    assert_eq!(
        result.get("content").and_then(|v| v.as_str()),
        Some("# Plan\nBuild the thing.\n")
    );
    let sha = result
        .get("sha256")
        .and_then(|v| v.as_str())
        .expect("sha256");
    assert_eq!(sha.len(), 64);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn restricted_role_is_forbidden_outside_its_grant() {
    let mut server = Server::start("restricted_role", &["--role", "reviewer"], |store| {
        seed_task(store, "T1", TaskState::ReadyForCodeReview);
        store
            .upsert_agent(&AgentRow {
                role: "reviewer".to_string(),
                description: Some("Reviews changes".to_string()),
                allowed_states: vec!["ready_for_code_review".to_string(), "reviewing".to_string()],
                can_transition_to: vec![
                    "reviewing".to_string(),
                    "ready_for_commit".to_string(),
                    "needs_fixes".to_string(),
                ],
                can_read_plan: false,
                can_execute_commands: false,
                can_update_artifacts: true,
                prompt_template: None,
                updated_at_ms: 0,
            })
            .expect("seed agent");
    });
    server.initialize();

    let plan = server.call(2, "plan.read", json!({}));
    assert_eq!(error_code(&plan), -32002);

    // `implementing` is outside the reviewer's transition grant.
    let forbidden = server.call(
        3,
        "tasks.update_state",
        json!({ "task_id": "T1", "state": "implementing" }),
    );
    assert_eq!(error_code(&forbidden), -32002);
    assert_eq!(error_kind(&forbidden), "forbidden_transition");

    // Inside the grant, the ordinary state machine applies.
    let ok = server.call(
        4,
        "tasks.update_state",
        json!({ "task_id": "T1", "state": "reviewing" }),
    );
    assert!(ok.get("result").is_some(), "unexpected error: {ok}");
}

#[test]
fn unknown_role_fails_startup() {
    let dir = temp_dir("unknown_role");
    let db_path = dir.join("cadence.db");
    {
        let _ = SqliteStore::open(&db_path).expect("create db");
    }

    let output = Command::new(env!("CARGO_BIN_EXE_cd_mcp"))
        .arg("--database")
        .arg(&db_path)
        .arg("--role")
        .arg("phantom")
        .output()
        .expect("run cd_mcp");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("unknown agent role: phantom"), "{stderr}");

    let _ = std::fs::remove_dir_all(&dir);
}
