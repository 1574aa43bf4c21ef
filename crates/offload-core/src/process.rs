//! ペイロード内の子プロセス
//!
//! キャンセルは協調的なので、`Command::output()` でブロックしたペイロードは
//! トークンを見ない。`run_process` は子プロセスをポーリングし、毎回 heartbeat
//! を打ち、キャンセルが要求されたら子プロセスを kill する。stall やタイム
//! アウトした外部ツールがプールスレッドを握り続けることはない。

use std::io::Read;
use std::process::{Child, Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::app::TaskContext;
use crate::domain::TaskError;

/// Run `command` to completion unless the task is cancelled first.
///
/// Stdout and stderr are captured. On cancellation the child is killed and
/// reaped and `TaskError::OperationCancelled` is returned.
pub fn run_process(ctx: &TaskContext, mut command: Command, poll: Duration) -> Result<Output, TaskError> {
    ctx.checkpoint()?;
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(TaskError::failed)?;
    let pid = child.id();
    tracing::debug!(task_id = %ctx.id(), pid, "child process started");

    // drained on their own threads so a full pipe cannot block the child
    let stdout = collect(child.stdout.take());
    let stderr = collect(child.stderr.take());

    loop {
        ctx.heartbeat();
        if ctx.is_cancelled() {
            kill(&mut child, ctx);
            join(stdout);
            join(stderr);
            return Err(TaskError::OperationCancelled);
        }
        match child.try_wait() {
            Ok(Some(status)) => {
                return Ok(Output {
                    status,
                    stdout: join(stdout),
                    stderr: join(stderr),
                });
            }
            Ok(None) => thread::sleep(poll),
            Err(err) => {
                kill(&mut child, ctx);
                return Err(TaskError::failed(err));
            }
        }
    }
}

fn kill(child: &mut Child, ctx: &TaskContext) {
    if let Err(err) = child.kill() {
        // already exited
        tracing::debug!(task_id = %ctx.id(), error = %err, "kill failed");
    }
    if let Err(err) = child.wait() {
        tracing::warn!(task_id = %ctx.id(), error = %err, "failed to reap child process");
    } else {
        tracing::info!(task_id = %ctx.id(), pid = child.id(), "child process killed after cancellation");
    }
}

fn collect<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    thread::Builder::new()
        .name("offload-pipe".to_string())
        .spawn(move || {
            let mut buf = Vec::new();
            if let Err(err) = pipe.read_to_end(&mut buf) {
                tracing::debug!(error = %err, "pipe read stopped");
            }
            buf
        })
        .ok()
}

fn join(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader.and_then(|handle| handle.join().ok()).unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn captures_output_of_a_finished_child() {
        let ctx = TaskContext::detached("echo");
        let mut command = Command::new("sh");
        command.args(["-c", "echo probe-ok; echo warn >&2"]);

        let output = run_process(&ctx, command, Duration::from_millis(5)).unwrap();
        assert!(output.status.success());
        assert_eq!(output.stdout, b"probe-ok\n");
        assert_eq!(output.stderr, b"warn\n");
    }

    #[test]
    fn cancellation_kills_the_child() {
        let ctx = TaskContext::detached("sleeper");
        let token = ctx.token().clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            token.cancel();
        });

        let mut command = Command::new("sleep");
        command.arg("30");
        let start = Instant::now();
        let result = run_process(&ctx, command, Duration::from_millis(10));
        canceller.join().unwrap();

        assert!(matches!(result, Err(TaskError::OperationCancelled)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_binary_is_an_operation_failure() {
        let ctx = TaskContext::detached("ghost");
        let command = Command::new("/nonexistent/offload-test-binary");
        let result = run_process(&ctx, command, Duration::from_millis(5));
        assert!(matches!(result, Err(TaskError::OperationFailed(_))));
    }

    #[test]
    fn already_cancelled_context_never_spawns() {
        let ctx = TaskContext::detached("skipped");
        ctx.token().cancel();
        let command = Command::new("/nonexistent/offload-test-binary");
        assert!(matches!(
            run_process(&ctx, command, Duration::from_millis(5)),
            Err(TaskError::OperationCancelled)
        ));
    }
}
