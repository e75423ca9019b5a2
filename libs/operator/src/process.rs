use std::collections::BTreeMap;
use std::os::unix::process::CommandExt;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// How long to wait after SIGTERM before escalating to SIGKILL.
const TERM_GRACE_PERIOD: Duration = Duration::from_secs(10);

/// `cdk deploy` may legitimately run for a long time; every other command gets a much shorter
/// default.
pub const CDK_DEPLOY_TIMEOUT: Duration = Duration::from_secs(30 * 60);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The outcome of running an external command: never an `Err` for a non-zero exit, only for
/// failure to even spawn the process.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub output: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands (`git`, `npm`, `cdk`, hook scripts) with environment injection,
/// streaming output capture to the tracing log, and cooperative cancellation.
pub struct ProcessRunner;

impl ProcessRunner {
    /// Spawns `program` with `args` inside `cwd`, overlaying `env` on top of the ambient
    /// environment, under a process group of its own so that [`Self`] can signal the whole
    /// tree. Streams combined stdout+stderr, bracketed by `=== <phase> OUTPUT START/END ===`
    /// markers, and enforces `deadline` before sending SIGTERM then SIGKILL.
    pub async fn run(
        phase: &str,
        program: &str,
        args: &[String],
        cwd: &std::path::Path,
        env: &BTreeMap<String, String>,
        deadline: Duration,
    ) -> Result<ProcessOutput> {
        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(cwd)
            .envs(env)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // SAFETY: setsid() is async-signal-safe and takes no arguments; it detaches the child
        // into its own process group so that signaling the group reaches descendants (npm's
        // own child `node` process, notably) as well.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                Ok(())
            });
        }

        info!(phase, program, "=== {phase} OUTPUT START ===");

        let mut child = command
            .spawn()
            .map_err(|e| Error::ProcessSpawnError(program.to_owned(), e))?;

        let pid = child.id().map(|p| p as i32);

        let mut stdout = child.stdout.take().expect("stdout piped");
        let mut stderr = child.stderr.take().expect("stderr piped");
        let mut combined = String::new();

        let run = async {
            let stdout_task = async {
                let mut lines = BufReader::new(&mut stdout).lines();
                let mut buf = String::new();
                loop {
                    match lines.next_line().await {
                        Ok(Some(line)) => {
                            info!(phase, "{line}");
                            buf.push_str(&line);
                            buf.push('\n');
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(phase, error = %e, "error reading child stdout");
                            break;
                        }
                    }
                }
                buf
            };
            let stderr_task = async {
                let mut buf = String::new();
                let _ = stderr.read_to_string(&mut buf).await;
                buf
            };
            let (stdout_buf, stderr_buf) = tokio::join!(stdout_task, stderr_task);
            combined.push_str(&stdout_buf);
            combined.push_str(&stderr_buf);
            child.wait().await
        };

        let status = match timeout(deadline, run).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                return Err(Error::ProcessSpawnError(program.to_owned(), e));
            }
            Err(_) => {
                warn!(phase, program, "deadline exceeded, terminating process group");
                if let Some(pid) = pid {
                    Self::terminate(pid).await;
                }
                return Ok(ProcessOutput {
                    exit_code: 124,
                    output: format!("{combined}\n[timed out after {deadline:?}]"),
                });
            }
        };

        info!(phase, "=== {phase} OUTPUT END ===");

        Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(-1),
            output: combined,
        })
    }

    /// Sends SIGTERM to the process group, waits out the grace period, then SIGKILL if it's
    /// still alive. Used both on deadline expiry and on controller shutdown.
    pub async fn terminate(pid: i32) {
        let pgid = Pid::from_raw(pid);
        let _ = signal::killpg(pgid, Signal::SIGTERM);
        tokio::time::sleep(TERM_GRACE_PERIOD).await;
        let _ = signal::killpg(pgid, Signal::SIGKILL);
    }

    /// True when `output` contains the literal substring `needle` (case-sensitive, per the
    /// classification tables that key off exact CLI wording).
    pub fn output_contains(output: &str, needle: &str) -> bool {
        output.contains(needle)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let env = BTreeMap::new();
        let out = ProcessRunner::run(
            "test",
            "sh",
            &["-c".to_owned(), "echo hello; exit 3".to_owned()],
            std::path::Path::new("/tmp"),
            &env,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(out.output.contains("hello"));
        assert!(!out.success());
    }

    #[tokio::test]
    async fn zero_exit_is_success() {
        let env = BTreeMap::new();
        let out = ProcessRunner::run(
            "test",
            "true",
            &[],
            std::path::Path::new("/tmp"),
            &env,
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert!(out.success());
    }

    #[tokio::test]
    async fn deadline_produces_timeout_exit_code() {
        let env = BTreeMap::new();
        let out = ProcessRunner::run(
            "test",
            "sleep",
            &["10".to_owned()],
            std::path::Path::new("/tmp"),
            &env,
            Duration::from_millis(50),
        )
        .await
        .unwrap();
        assert_eq!(out.exit_code, 124);
    }

    #[test]
    fn output_substring_match() {
        assert!(ProcessRunner::output_contains(
            "Error: no credentials have been configured",
            "no credentials have been configured"
        ));
        assert!(!ProcessRunner::output_contains("all good", "AccessDenied"));
    }
}
