//! External process invocation for one action.
//!
//! Translates a [`ProcessSpec`] into exactly one subprocess: stage files are
//! materialised, stdout/stderr go to per-action log files (never interleaved
//! across actions), and the exit status maps onto an [`Outcome`]:
//!
//! - exit 0 and every declared artifact present → `Success`
//! - exit 0 with a declared artifact missing → `Failure(MissingArtifact)`
//! - non-zero exit → `Failure(ProcessError)` with the stderr tail
//! - configured timeout exceeded → process killed, `Failure(Timeout)`
//! - campaign abort signalled → process killed, `Failure(Aborted)`
//!
//! Tool failures never escape as errors; they are outcomes recorded on the
//! action. The tool's internal behaviour is out of scope — only its exit
//! code, captured output and declared files are contracted.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::action::{ActionId, FailureKind, Outcome, ProcessSpec};
use crate::io::{atomic_write, ensure_dir};
use crate::paths::{action_stderr_log, action_stdout_log};

/// How much of the captured stderr is carried into a failure message.
const STDERR_TAIL_BYTES: usize = 2000;

/// Run one external process to completion and map its result to an Outcome.
///
/// `abort` is the campaign-wide abort signal: when it flips to `true` the
/// process is killed and the outcome is `Aborted` (the scheduler records the
/// action as cancelled).
pub async fn run(id: &ActionId, spec: &ProcessSpec, mut abort: watch::Receiver<bool>) -> Outcome {
    if let Err(e) = stage(spec) {
        return Outcome::failure(FailureKind::Internal, format!("staging failed: {e}"));
    }

    let stdout_path = action_stdout_log(&spec.log_dir, id);
    let stderr_path = action_stderr_log(&spec.log_dir, id);
    let (stdout_file, stderr_file) =
        match (std::fs::File::create(&stdout_path), std::fs::File::create(&stderr_path)) {
            (Ok(o), Ok(e)) => (o, e),
            (Err(e), _) | (_, Err(e)) => {
                return Outcome::failure(
                    FailureKind::Internal,
                    format!("cannot create log files: {e}"),
                );
            }
        };

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .current_dir(&spec.cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::from(stdout_file))
        .stderr(Stdio::from(stderr_file))
        // A fatal scheduler fault drops the worker task; take the tool down
        // with it rather than leaving an orphan.
        .kill_on_drop(true);
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    debug!(action = %id, program = %spec.program.display(), "spawning");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            return Outcome::failure(
                FailureKind::ProcessError { exit_code: None },
                format!("failed to spawn '{}': {e}", spec.program.display()),
            );
        }
    };

    // Already aborted before we got to spawn-wait.
    if *abort.borrow() {
        let _ = child.kill().await;
        return Outcome::failure(FailureKind::Aborted, "campaign aborted");
    }

    let status = tokio::select! {
        status = child.wait() => match status {
            Ok(s) => s,
            Err(e) => {
                return Outcome::failure(
                    FailureKind::Internal,
                    format!("wait failed for '{id}': {e}"),
                );
            }
        },
        _ = sleep_until_timeout(spec.timeout) => {
            warn!(action = %id, "timeout exceeded, killing process");
            let _ = child.kill().await;
            return Outcome::failure(
                FailureKind::Timeout,
                format!(
                    "process exceeded timeout of {}s",
                    spec.timeout.map(|t| t.as_secs()).unwrap_or(0)
                ),
            );
        }
        _ = wait_abort(&mut abort) => {
            warn!(action = %id, "abort requested, killing process");
            let _ = child.kill().await;
            return Outcome::failure(FailureKind::Aborted, "campaign aborted");
        }
    };

    if !status.success() {
        let tail = stderr_tail(&stderr_path);
        return Outcome::failure(
            FailureKind::ProcessError {
                exit_code: status.code(),
            },
            match status.code() {
                Some(code) if tail.is_empty() => format!("exited with code {code}"),
                Some(code) => format!("exited with code {code}\nstderr: {tail}"),
                None if tail.is_empty() => "terminated by signal".to_string(),
                None => format!("terminated by signal\nstderr: {tail}"),
            },
        );
    }

    // Exit 0 is only a success if every declared artifact exists.
    for artifact in &spec.expected_artifacts {
        if !artifact.exists() {
            return Outcome::failure(
                FailureKind::MissingArtifact {
                    path: artifact.clone(),
                },
                format!(
                    "exited 0 but declared artifact '{}' is missing",
                    artifact.display()
                ),
            );
        }
    }

    Outcome::success(spec.expected_artifacts.clone())
}

/// Create the working and log directories and write the stage files.
fn stage(spec: &ProcessSpec) -> crate::error::Result<()> {
    ensure_dir(&spec.cwd)?;
    ensure_dir(&spec.log_dir)?;
    for file in &spec.stage_files {
        atomic_write(&file.path, file.contents.as_bytes())?;
    }
    Ok(())
}

/// Pending forever when no timeout is configured, so the select arm never fires.
async fn sleep_until_timeout(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => std::future::pending().await,
    }
}

/// Resolve once the abort flag flips to `true`. A closed channel means the
/// campaign can no longer be aborted, so the future stays pending.
async fn wait_abort(abort: &mut watch::Receiver<bool>) {
    loop {
        if *abort.borrow() {
            return;
        }
        if abort.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn stderr_tail(path: &Path) -> String {
    let Ok(text) = std::fs::read_to_string(path) else {
        return String::new();
    };
    let trimmed = text.trim_end();
    if trimmed.len() <= STDERR_TAIL_BYTES {
        return trimmed.to_string();
    }
    let start = trimmed.len() - STDERR_TAIL_BYTES;
    // Avoid splitting a UTF-8 code point.
    let start = (start..trimmed.len())
        .find(|i| trimmed.is_char_boundary(*i))
        .unwrap_or(start);
    trimmed[start..].to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::StageFile;
    use tempfile::TempDir;

    fn sh(dir: &TempDir, script: &str) -> ProcessSpec {
        ProcessSpec {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
            cwd: dir.path().join("work"),
            env: vec![],
            stage_files: vec![],
            expected_artifacts: vec![],
            log_dir: dir.path().join("logs"),
            timeout: None,
        }
    }

    fn no_abort() -> watch::Receiver<bool> {
        let (_tx, rx) = watch::channel(false);
        rx
    }

    #[tokio::test]
    async fn exit_zero_with_artifacts_is_success() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("work/out.txt");
        let mut spec = sh(&dir, "echo hello > out.txt");
        spec.expected_artifacts = vec![out.clone()];
        let outcome = run(&"t".into(), &spec, no_abort()).await;
        match outcome {
            Outcome::Success { artifacts, .. } => assert_eq!(artifacts, vec![out]),
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn exit_zero_missing_artifact_is_failure() {
        let dir = TempDir::new().unwrap();
        let mut spec = sh(&dir, "true");
        spec.expected_artifacts = vec![dir.path().join("work/out.txt")];
        let outcome = run(&"t".into(), &spec, no_abort()).await;
        match outcome {
            Outcome::Failure { kind, message } => {
                assert!(matches!(kind, FailureKind::MissingArtifact { .. }));
                assert!(message.contains("out.txt"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn nonzero_exit_carries_code_and_stderr_tail() {
        let dir = TempDir::new().unwrap();
        let spec = sh(&dir, "echo boom >&2; exit 2");
        let outcome = run(&"t".into(), &spec, no_abort()).await;
        match outcome {
            Outcome::Failure { kind, message } => {
                assert_eq!(kind, FailureKind::ProcessError { exit_code: Some(2) });
                assert!(message.contains("boom"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn timeout_kills_process() {
        let dir = TempDir::new().unwrap();
        let mut spec = sh(&dir, "sleep 30");
        spec.timeout = Some(Duration::from_millis(200));
        let start = std::time::Instant::now();
        let outcome = run(&"t".into(), &spec, no_abort()).await;
        assert!(start.elapsed() < Duration::from_secs(10));
        match outcome {
            Outcome::Failure { kind, .. } => assert_eq!(kind, FailureKind::Timeout),
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn abort_kills_process() {
        let dir = TempDir::new().unwrap();
        let spec = sh(&dir, "sleep 30");
        let (tx, rx) = watch::channel(false);
        let id = ActionId::from("t");
        let handle = tokio::spawn(async move { run(&id, &spec, rx).await });
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();
        let outcome = handle.await.unwrap();
        match outcome {
            Outcome::Failure { kind, .. } => assert_eq!(kind, FailureKind::Aborted),
            other => panic!("expected aborted failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stage_files_written_before_spawn() {
        let dir = TempDir::new().unwrap();
        let cfg = dir.path().join("work/config.mk");
        let mut spec = sh(&dir, "grep -q DESIGN_NAME config.mk");
        spec.stage_files = vec![StageFile {
            path: cfg,
            contents: "export DESIGN_NAME = fdiv\n".into(),
        }];
        let outcome = run(&"t".into(), &spec, no_abort()).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn output_captured_to_per_action_logs() {
        let dir = TempDir::new().unwrap();
        let spec = sh(&dir, "echo to-out; echo to-err >&2");
        let id = ActionId::from("flow_x");
        run(&id, &spec, no_abort()).await;
        let stdout = std::fs::read_to_string(action_stdout_log(&spec.log_dir, &id)).unwrap();
        let stderr = std::fs::read_to_string(action_stderr_log(&spec.log_dir, &id)).unwrap();
        assert_eq!(stdout.trim(), "to-out");
        assert_eq!(stderr.trim(), "to-err");
    }

    #[tokio::test]
    async fn env_overlay_reaches_process() {
        let dir = TempDir::new().unwrap();
        let mut spec = sh(&dir, "test \"$RUN_TAG\" = c2p50");
        spec.env = vec![("RUN_TAG".into(), "c2p50".into())];
        let outcome = run(&"t".into(), &spec, no_abort()).await;
        assert!(outcome.is_success());
    }

    #[tokio::test]
    async fn unknown_program_is_process_error() {
        let dir = TempDir::new().unwrap();
        let mut spec = sh(&dir, "true");
        spec.program = "/nonexistent/tool".into();
        let outcome = run(&"t".into(), &spec, no_abort()).await;
        match outcome {
            Outcome::Failure { kind, .. } => {
                assert_eq!(kind, FailureKind::ProcessError { exit_code: None });
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }
}
