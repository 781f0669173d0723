//! Child-process supervision for the external transcoder.
//!
//! The supervisor owns the child handle for its whole lifetime: it closes
//! stdin immediately (the transcoder must never block on reads), streams
//! stdout and stderr line-by-line into [`OutputBuffer`] sinks, and on
//! cancellation terminates the child and *waits for it to exit* before
//! returning. That wait matters: staged input files handed to the child must
//! not be deleted while it still holds them open, and the orchestrator drops
//! its staging directory as soon as this function returns.

use std::ffi::OsStr;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Cap on captured output replayed in failure messages.
pub const OUTPUT_CAP: usize = 1000;

/// Errors from running a child process.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The binary could not be started.
    #[error("failed to spawn {binary}: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },

    /// The child ran but reported failure.
    #[error("{binary} failed ({status}): {output}")]
    Failed {
        binary: String,
        status: ExitStatus,
        output: String,
    },

    /// The child was terminated because the cancellation token fired.
    #[error("child process cancelled")]
    Cancelled,

    /// IO error while supervising the child.
    #[error("IO error supervising child: {0}")]
    Io(#[from] std::io::Error),
}

/// Line sink for child output.
///
/// Clones share the same underlying buffer, so passing one buffer for both
/// stdout and stderr serializes the two streams on a single lock.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    inner: Arc<Mutex<String>>,
}

impl OutputBuffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        OutputBuffer::default()
    }

    fn push_line(&self, line: &str) {
        let mut buffer = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        buffer.push_str(line);
        buffer.push('\n');
    }

    /// Returns the captured output.
    pub fn contents(&self) -> String {
        match self.inner.lock() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns the captured output, cut to `cap` characters with a trailing
    /// ellipsis when something was dropped.
    pub fn truncated(&self, cap: usize) -> String {
        let contents = self.contents();
        if contents.chars().count() <= cap {
            contents
        } else {
            let mut cut: String = contents.chars().take(cap).collect();
            cut.push('…');
            cut
        }
    }
}

/// Runs `binary` to completion, streaming its output into the given sinks.
///
/// Returns the exit status, or [`ProcessError::Cancelled`] if the token
/// fired first (the child is terminated and reaped before returning).
pub async fn run(
    binary: &Path,
    args: &[&OsStr],
    envs: &[(&str, &OsStr)],
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    cancel: &CancellationToken,
) -> Result<ExitStatus, ProcessError> {
    let binary_name = display_name(binary);

    let mut child = Command::new(binary)
        .args(args)
        .envs(envs.iter().map(|(key, value)| (*key, *value)))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        // A dropped supervisor future must not leak a running transcoder.
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            binary: binary_name.clone(),
            source,
        })?;

    let stdout_task = child
        .stdout
        .take()
        .map(|pipe| tokio::spawn(forward_lines(pipe, stdout, "stdout")));
    let stderr_task = child
        .stderr
        .take()
        .map(|pipe| tokio::spawn(forward_lines(pipe, stderr, "stderr")));

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            debug!(binary = %binary_name, "terminating child on cancellation");
            let _ = child.start_kill();
            // Reap before returning: callers may delete files the child
            // still has open.
            let _ = child.wait().await;
            join_reader(stdout_task).await;
            join_reader(stderr_task).await;
            return Err(ProcessError::Cancelled);
        }
    };

    join_reader(stdout_task).await;
    join_reader(stderr_task).await;

    debug!(binary = %binary_name, %status, "child exited");
    Ok(status)
}

/// Runs `binary` with both output streams captured into one in-memory
/// buffer, and fails with a descriptive error on non-zero exit.
///
/// The error message carries the binary name, the exit status, and the
/// captured output truncated to [`OUTPUT_CAP`] characters.
pub async fn run_checked(
    binary: &Path,
    args: &[&OsStr],
    envs: &[(&str, &OsStr)],
    cancel: &CancellationToken,
) -> Result<(), ProcessError> {
    let output = OutputBuffer::new();
    let status = run(binary, args, envs, output.clone(), output.clone(), cancel).await?;

    if status.success() {
        Ok(())
    } else {
        Err(ProcessError::Failed {
            binary: display_name(binary),
            status,
            output: output.truncated(OUTPUT_CAP),
        })
    }
}

fn display_name(binary: &Path) -> String {
    binary
        .file_name()
        .and_then(OsStr::to_str)
        .unwrap_or("<transcoder>")
        .to_string()
}

async fn forward_lines(pipe: impl AsyncRead + Unpin, sink: OutputBuffer, stream: &'static str) {
    let mut lines = BufReader::new(pipe).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        debug!(stream, line = %line, "transcoder output");
        sink.push_line(&line);
    }
}

async fn join_reader(task: Option<tokio::task::JoinHandle<()>>) {
    if let Some(task) = task {
        let _ = task.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn sh() -> &'static Path {
        Path::new("/bin/sh")
    }

    fn args<'a>(script: &'a str) -> [&'a OsStr; 2] {
        [OsStr::new("-c"), OsStr::new(script)]
    }

    #[tokio::test]
    async fn captures_stdout_lines() {
        let stdout = OutputBuffer::new();
        let stderr = OutputBuffer::new();
        let status = run(
            sh(),
            &args("echo one; echo two"),
            &[],
            stdout.clone(),
            stderr.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(status.success());
        assert_eq!(stdout.contents(), "one\ntwo\n");
        assert_eq!(stderr.contents(), "");
    }

    #[tokio::test]
    async fn shared_sink_receives_both_streams() {
        let output = OutputBuffer::new();
        run(
            sh(),
            &args("echo out; echo err >&2"),
            &[],
            output.clone(),
            output.clone(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let contents = output.contents();
        assert!(contents.contains("out\n"));
        assert!(contents.contains("err\n"));
    }

    #[tokio::test]
    async fn passes_environment() {
        let stdout = OutputBuffer::new();
        run(
            sh(),
            &args("echo $TRANSCODE_TEST_VAR"),
            &[("TRANSCODE_TEST_VAR", OsStr::new("marker-value"))],
            stdout.clone(),
            OutputBuffer::new(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(stdout.contents(), "marker-value\n");
    }

    #[tokio::test]
    async fn run_checked_reports_exit_code_and_output() {
        let err = run_checked(
            sh(),
            &args("echo boom; exit 3"),
            &[],
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            ProcessError::Failed {
                binary,
                status,
                output,
            } => {
                assert_eq!(binary, "sh");
                assert_eq!(status.code(), Some(3));
                assert_eq!(output, "boom\n");
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_checked_truncates_long_output() {
        let err = run_checked(
            sh(),
            &args("i=0; while [ $i -lt 200 ]; do echo 0123456789012345678; i=$((i+1)); done; exit 1"),
            &[],
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        match err {
            ProcessError::Failed { output, .. } => {
                assert_eq!(output.chars().count(), OUTPUT_CAP + 1);
                assert!(output.ends_with('…'));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let err = run_checked(
            Path::new("/nonexistent/transcoder-binary"),
            &[],
            &[],
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProcessError::Spawn { .. }));
    }

    #[tokio::test]
    async fn cancellation_terminates_the_child() {
        let cancel = CancellationToken::new();
        let child_cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            child_cancel.cancel();
        });

        let started = Instant::now();
        let err = run(
            sh(),
            &args("sleep 30"),
            &[],
            OutputBuffer::new(),
            OutputBuffer::new(),
            &cancel,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ProcessError::Cancelled));
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
