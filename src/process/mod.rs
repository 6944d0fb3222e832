//! Process Runner (C1)
//!
//! Launches external programs, captures their stdout/stderr, and honors
//! cooperative cancellation. Mirrors the container engine and workspace
//! tool CLI invocations the rest of the daemon shells out to.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Grace window between a terminate signal and a force-kill.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// The only error this runner surfaces: failure to launch the process at all.
/// Non-zero exit codes are data, not errors — callers inspect `exit_code`.
#[derive(Debug, Error)]
#[error("failed to launch {command}: {source}")]
pub struct LaunchError {
    pub command: String,
    #[source]
    pub source: std::io::Error,
}

/// Result of running a process to completion (or cancellation).
#[derive(Debug, Clone)]
pub struct Output {
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub cancelled: bool,
}

impl Output {
    pub fn success(&self) -> bool {
        !self.cancelled && self.exit_code == 0
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Launches external programs and captures their output.
///
/// Callers pass commands whose output is small enough to buffer in memory
/// for the process's lifetime (the runner and workspace CLIs emit modest
/// amounts of text, not data streams).
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner;

impl ProcessRunner {
    pub fn new() -> Self {
        Self
    }

    /// Run `command args...` with an optional working directory, returning
    /// once the process exits or `cancel` fires.
    pub async fn run(
        &self,
        command: &str,
        args: &[&str],
        working_dir: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<Output, LaunchError> {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        if let Some(dir) = working_dir {
            cmd.current_dir(dir);
        }

        debug!(command, ?args, "spawning process");

        let mut child = cmd.spawn().map_err(|source| LaunchError {
            command: command.to_string(),
            source,
        })?;

        let mut stdout = child.stdout.take().expect("piped stdout");
        let mut stderr = child.stderr.take().expect("piped stderr");

        let mut out_buf = Vec::new();
        let mut err_buf = Vec::new();

        let io = async {
            let _ = tokio::join!(
                stdout.read_to_end(&mut out_buf),
                stderr.read_to_end(&mut err_buf),
            );
            child.wait().await
        };

        tokio::select! {
            status = io => {
                let status = status.map_err(|source| LaunchError {
                    command: command.to_string(),
                    source,
                })?;
                Ok(Output {
                    exit_code: status.code().unwrap_or(-1),
                    stdout: out_buf,
                    stderr: err_buf,
                    cancelled: false,
                })
            }
            _ = cancel.cancelled() => {
                warn!(command, "cancelling process");
                self.terminate(&mut child).await;
                Ok(Output {
                    exit_code: -1,
                    stdout: out_buf,
                    stderr: err_buf,
                    cancelled: true,
                })
            }
        }
    }

    /// Send the process engine's terminate signal, then force-kill after a
    /// short grace window if it hasn't exited.
    async fn terminate(&self, child: &mut tokio::process::Child) {
        #[cfg(unix)]
        {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;

            if let Some(pid) = child.id() {
                let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
            }
        }

        match tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
            Ok(_) => {}
            Err(_) => {
                warn!("process did not exit within grace window, force-killing");
                let _ = child.kill().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let runner = ProcessRunner::new();
        let cancel = CancellationToken::new();
        let out = runner
            .run("echo", &["hello"], None, &cancel)
            .await
            .unwrap();

        assert_eq!(out.exit_code, 0);
        assert!(out.success());
        assert_eq!(out.stdout_string().trim(), "hello");
    }

    #[tokio::test]
    async fn non_zero_exit_is_data_not_error() {
        let runner = ProcessRunner::new();
        let cancel = CancellationToken::new();
        let out = runner
            .run("sh", &["-c", "exit 7"], None, &cancel)
            .await
            .unwrap();

        assert_eq!(out.exit_code, 7);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn launch_failure_surfaces_as_error() {
        let runner = ProcessRunner::new();
        let cancel = CancellationToken::new();
        let result = runner
            .run("definitely-not-a-real-binary-xyz", &[], None, &cancel)
            .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn cancellation_stops_the_process() {
        let runner = ProcessRunner::new();
        let cancel = CancellationToken::new();
        let cancel2 = cancel.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel2.cancel();
        });

        let out = runner
            .run("sleep", &["30"], None, &cancel)
            .await
            .unwrap();

        assert!(out.cancelled);
    }
}
