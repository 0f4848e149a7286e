#![forbid(unsafe_code)]

//! External LLM runner invocation.
//!
//! The engine hands the runner a prompt on stdin and the method surface
//! address in the environment, then waits. Runner stdout/stderr are captured
//! to files under the cycle's run directory, scrubbed when
//! `security.redact_in_logs` is set; the final stdout JSON wrapper is parsed
//! for a result summary, never for state decisions — state is whatever the
//! agent persisted through the surface.

use crate::redact::redact;
use serde_json::Value;
use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

pub struct LlmRequest<'a> {
    pub prompt: &'a str,
    pub surface_addr: SocketAddr,
    pub role: &'a str,
    pub capture_dir: &'a Path,
    pub timeout: Duration,
    /// Scrub the on-disk capture files (prompt, stdout, stderr) for secrets.
    /// The subprocess itself always receives the raw prompt.
    pub redact_captures: bool,
}

#[derive(Clone, Debug)]
pub struct LlmOutput {
    pub success: bool,
    pub summary: String,
    pub commands: Vec<String>,
}

pub trait LlmRunner {
    fn name(&self) -> &str;
    fn invoke(&mut self, request: &LlmRequest<'_>) -> Result<LlmOutput, String>;
}

/// Runs the configured CLI tool (`claude`, `codex`, ...) as a subprocess.
pub struct CommandRunner {
    name: String,
    command: String,
    args: Vec<String>,
}

impl CommandRunner {
    pub fn new(name: &str, command: &str, args: &[String]) -> Self {
        Self {
            name: name.to_string(),
            command: command.to_string(),
            args: args.to_vec(),
        }
    }
}

impl LlmRunner for CommandRunner {
    fn name(&self) -> &str {
        &self.name
    }

    fn invoke(&mut self, request: &LlmRequest<'_>) -> Result<LlmOutput, String> {
        std::fs::create_dir_all(request.capture_dir)
            .map_err(|e| format!("create capture dir failed: {e}"))?;
        let prompt_path = request.capture_dir.join("prompt.txt");
        let prompt_capture = if request.redact_captures {
            redact(request.prompt)
        } else {
            request.prompt.to_string()
        };
        std::fs::write(&prompt_path, prompt_capture)
            .map_err(|e| format!("write prompt capture failed: {e}"))?;
        let out_path = request.capture_dir.join("out.json");
        let stderr_path = request.capture_dir.join("stderr.txt");

        let child = spawn_capture(
            &self.command,
            &self.args,
            request,
            &out_path,
            &stderr_path,
        )?;
        let waited = wait_with_timeout(child, request.timeout, &self.command);
        let parsed = match waited {
            Ok(()) => parse_output(&out_path),
            Err(e) => Err(e),
        };
        // Scrub whatever landed on disk, on success and failure paths alike.
        if request.redact_captures {
            scrub_capture(&out_path);
            scrub_capture(&stderr_path);
        }
        parsed
    }
}

/// Rewrites a capture file through `redact`. A capture that cannot be read
/// back as text cannot be scrubbed line-wise, so it is replaced outright.
fn scrub_capture(path: &Path) {
    let Ok(raw) = std::fs::read_to_string(path) else {
        let _ = std::fs::write(path, "<redacted: unreadable capture>\n");
        return;
    };
    let cleaned = redact(&raw);
    if cleaned != raw {
        let _ = std::fs::write(path, cleaned);
    }
}

fn spawn_capture(
    command: &str,
    args: &[String],
    request: &LlmRequest<'_>,
    out_path: &Path,
    stderr_path: &Path,
) -> Result<std::process::Child, String> {
    let stdout_file =
        File::create(out_path).map_err(|e| format!("create stdout capture failed: {e}"))?;
    let stderr_file =
        File::create(stderr_path).map_err(|e| format!("create stderr capture failed: {e}"))?;

    let mut cmd = Command::new(command);
    cmd.args(args)
        .env("CADENCE_SURFACE_ADDR", request.surface_addr.to_string())
        .env("CADENCE_ROLE", request.role)
        // The prompt travels via stdin. Passing it as argv is brittle
        // (ARG_MAX, quoting) and leaks into process listings.
        .stdin(Stdio::piped())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file));

    let mut child = cmd
        .spawn()
        .map_err(|e| format!("failed to spawn runner ({command}): {e}"))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(request.prompt.as_bytes())
            .map_err(|e| format!("write runner stdin failed: {e}"))?;
    }
    Ok(child)
}

fn wait_with_timeout(
    mut child: std::process::Child,
    timeout: Duration,
    command: &str,
) -> Result<(), String> {
    let started = Instant::now();
    loop {
        match child.try_wait() {
            Ok(Some(_status)) => return Ok(()),
            Ok(None) => {
                if started.elapsed() >= timeout {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(format!(
                        "runner ({command}) timed out after {}s",
                        timeout.as_secs()
                    ));
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(e) => return Err(format!("wait on runner failed: {e}")),
        }
    }
}

/// Parses the runner's captured stdout. A JSON wrapper with
/// `structured_output` is unwrapped; a wrapper flagging `is_error` fails the
/// invocation; anything that is not JSON is treated as a plain-text summary.
fn parse_output(out_path: &PathBuf) -> Result<LlmOutput, String> {
    let text =
        std::fs::read_to_string(out_path).map_err(|e| format!("read runner output failed: {e}"))?;

    let Ok(value) = serde_json::from_str::<Value>(&text) else {
        return Ok(LlmOutput {
            success: true,
            summary: text.trim().to_string(),
            commands: Vec::new(),
        });
    };

    if value.get("is_error").and_then(|v| v.as_bool()) == Some(true) {
        let subtype = value
            .get("subtype")
            .and_then(|v| v.as_str())
            .unwrap_or("runner_error");
        return Err(format!("runner reported error: {subtype}"));
    }

    let payload = value.get("structured_output").unwrap_or(&value);
    let summary = payload
        .get("summary")
        .or_else(|| payload.get("result"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| text.trim().to_string());
    let commands = payload
        .get("commands")
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    Ok(LlmOutput {
        success: true,
        summary,
        commands,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mk_tmp_dir(prefix: &str) -> PathBuf {
        let mut dir = std::env::temp_dir();
        let pid = std::process::id();
        let ts = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        dir.push(format!("{prefix}_{pid}_{ts}"));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn structured_output_is_unwrapped() {
        let dir = mk_tmp_dir("cd_engine_llm_unwrap");
        let out = dir.join("out.json");
        std::fs::write(
            &out,
            r#"{"type":"result","structured_output":{"summary":"planned the work","commands":["git status"]}}"#,
        )
        .unwrap();
        let parsed = parse_output(&out).expect("parse");
        assert_eq!(parsed.summary, "planned the work");
        assert_eq!(parsed.commands, vec!["git status".to_string()]);
    }

    #[test]
    fn wrapper_error_fails_the_invocation() {
        let dir = mk_tmp_dir("cd_engine_llm_error");
        let out = dir.join("out.json");
        std::fs::write(&out, r#"{"is_error":true,"subtype":"schema_mismatch"}"#).unwrap();
        let err = parse_output(&out).expect_err("expected error");
        assert!(err.contains("schema_mismatch"));
    }

    #[test]
    fn plain_text_output_becomes_the_summary() {
        let dir = mk_tmp_dir("cd_engine_llm_text");
        let out = dir.join("out.json");
        std::fs::write(&out, "done, updated the task\n").unwrap();
        let parsed = parse_output(&out).expect("parse");
        assert_eq!(parsed.summary, "done, updated the task");
        assert!(parsed.commands.is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn prompt_is_sent_via_stdin_and_env_carries_the_address() {
        let dir = mk_tmp_dir("cd_engine_llm_stdin");
        let seen_prompt = dir.join("seen_prompt.txt");
        let seen_addr = dir.join("seen_addr.txt");

        let shim_path = dir.join("runner_shim.sh");
        let shim = format!(
            "#!/usr/bin/env bash\nset -euo pipefail\ncat - > \"{}\"\nprintf '%s' \"$CADENCE_SURFACE_ADDR\" > \"{}\"\nprintf '%s\\n' '{{\"structured_output\":{{\"summary\":\"ok\"}}}}'\n",
            seen_prompt.to_string_lossy(),
            seen_addr.to_string_lossy()
        );
        std::fs::write(&shim_path, shim).unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&shim_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&shim_path, perms).unwrap();
        }

        let mut runner =
            CommandRunner::new("shim", &shim_path.to_string_lossy(), &[]);
        let request = LlmRequest {
            prompt: "hello runner",
            surface_addr: "127.0.0.1:7777".parse().unwrap(),
            role: "developer",
            capture_dir: &dir,
            timeout: Duration::from_secs(10),
            redact_captures: false,
        };
        let output = runner.invoke(&request).expect("invoke");
        assert_eq!(output.summary, "ok");

        let got_prompt = std::fs::read_to_string(&seen_prompt).unwrap();
        assert_eq!(got_prompt, "hello runner");
        let got_addr = std::fs::read_to_string(&seen_addr).unwrap();
        assert_eq!(got_addr, "127.0.0.1:7777");
    }

    #[cfg(unix)]
    #[test]
    fn capture_files_are_scrubbed_when_redaction_is_on() {
        let dir = mk_tmp_dir("cd_engine_llm_scrub");

        // A shim that leaks secrets on both streams.
        let shim_path = dir.join("leaky_shim.sh");
        let shim = "#!/usr/bin/env bash\nset -euo pipefail\ncat - > /dev/null\n\
                    printf 'api_key=sk-123456\\nall done\\n'\n\
                    printf 'Authorization: Bearer tok-789\\n' >&2\n";
        std::fs::write(&shim_path, shim).unwrap();
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(&shim_path).unwrap().permissions();
            perms.set_mode(0o755);
            std::fs::set_permissions(&shim_path, perms).unwrap();
        }

        let mut runner = CommandRunner::new("shim", &shim_path.to_string_lossy(), &[]);
        let request = LlmRequest {
            prompt: "the plan mentions password: hunter2",
            surface_addr: "127.0.0.1:7777".parse().unwrap(),
            role: "developer",
            capture_dir: &dir,
            timeout: Duration::from_secs(10),
            redact_captures: true,
        };
        runner.invoke(&request).expect("invoke");

        let prompt_capture = std::fs::read_to_string(dir.join("prompt.txt")).unwrap();
        assert!(!prompt_capture.contains("hunter2"), "{prompt_capture}");

        let out_capture = std::fs::read_to_string(dir.join("out.json")).unwrap();
        assert!(!out_capture.contains("sk-123456"), "{out_capture}");
        assert!(out_capture.contains("all done"));

        let stderr_capture = std::fs::read_to_string(dir.join("stderr.txt")).unwrap();
        assert!(!stderr_capture.contains("tok-789"), "{stderr_capture}");
        assert!(stderr_capture.contains("Bearer <redacted>"));
    }
}
