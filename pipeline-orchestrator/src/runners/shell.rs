// Shell Runner
// Runs collaborator command templates through the platform shell

use command_group::{AsyncCommandGroup, AsyncGroupChild};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

/// How long output readers may drain after a timed-out process group is killed
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Shell types supported by the runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Shell {
    /// Default shell (sh on Unix, cmd on Windows)
    Default,
    /// Bash shell
    Bash,
}

impl Shell {
    /// Get the shell executable and arguments
    fn get_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Shell::Default => {
                if cfg!(target_os = "windows") {
                    ("cmd", &["/C"])
                } else {
                    ("sh", &["-c"])
                }
            }
            Shell::Bash => ("bash", &["-c"]),
        }
    }
}

/// Output collected during command execution
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShellOutput {
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` when the process never ran or was killed
    pub exit_code: Option<i32>,
    pub timed_out: bool,
}

impl ShellOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn not_started(message: String) -> Self {
        Self {
            stderr: message,
            ..Self::default()
        }
    }

    /// Stderr when present, else stdout, for diagnostics.
    pub fn diagnostics(&self) -> &str {
        if self.stderr.trim().is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Shell runner for executing commands
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: Shell,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: Shell::Default,
        }
    }

    pub fn with_shell(shell: Shell) -> Self {
        Self { shell }
    }

    /// Run a command and collect its output. The shell leads its own process
    /// group, and a `timeout` kills the whole group once it elapses.
    pub async fn run(
        &self,
        script: &str,
        env: &HashMap<String, String>,
        working_dir: &Path,
        timeout: Option<Duration>,
    ) -> ShellOutput {
        let (shell_cmd, shell_args) = self.shell.get_command();

        let program = match which::which(shell_cmd) {
            Ok(path) => path,
            Err(e) => {
                return ShellOutput::not_started(format!("Shell '{}' not found: {}", shell_cmd, e))
            }
        };

        tracing::debug!(shell = shell_cmd, command = script, dir = %working_dir.display(), "running command");

        let mut cmd = Command::new(program);
        cmd.args(shell_args);
        cmd.arg(script);
        cmd.current_dir(working_dir);
        cmd.envs(env);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child: AsyncGroupChild = match cmd.group_spawn() {
            Ok(child) => child,
            Err(e) => {
                return ShellOutput::not_started(format!(
                    "Failed to spawn shell process '{}': {}",
                    shell_cmd, e
                ))
            }
        };

        let stdout_handle = child.inner().stdout.take().map(|out| tokio::spawn(collect_lines(out)));
        let stderr_handle = child.inner().stderr.take().map(|err| tokio::spawn(collect_lines(err)));

        let (wait_result, timed_out) = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                Ok(result) => (result.ok(), false),
                Err(_) => {
                    tracing::warn!(command = script, ?limit, "command timed out, killing its process group");
                    if let Err(e) = child.kill().await {
                        tracing::warn!(error = %e, "failed to kill process group");
                    }
                    (None, true)
                }
            },
            None => (child.wait().await.ok(), false),
        };

        // Output pipes may outlive the shell; after a timeout the readers only
        // get a short grace period.
        let grace = timed_out.then_some(DRAIN_GRACE);
        let stdout = drain(stdout_handle, grace).await;
        let mut stderr = drain(stderr_handle, grace).await;

        if timed_out {
            if let Some(limit) = timeout {
                stderr = format!("Process timed out after {:?}\n{}", limit, stderr);
            }
        }

        ShellOutput {
            stdout,
            stderr,
            exit_code: wait_result.and_then(|s| s.code()),
            timed_out,
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

async fn drain(handle: Option<JoinHandle<String>>, grace: Option<Duration>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };

    match grace {
        None => handle.await.unwrap_or_default(),
        Some(grace) => match tokio::time::timeout(grace, &mut handle).await {
            Ok(collected) => collected.unwrap_or_default(),
            Err(_) => {
                handle.abort();
                String::new()
            }
        },
    }
}

async fn collect_lines<R: AsyncRead + Unpin>(stream: R) -> String {
    let mut lines = BufReader::new(stream).lines();
    let mut output = String::new();
    while let Ok(Some(line)) = lines.next_line().await {
        if !output.is_empty() {
            output.push('\n');
        }
        output.push_str(&line);
    }
    output
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shell_runner_echo() {
        let runner = ShellRunner::new();
        let dir = std::env::current_dir().unwrap();

        let output = runner.run("echo hello", &HashMap::new(), &dir, None).await;

        assert!(output.success());
        assert_eq!(output.stdout, "hello");
        assert!(output.stderr.is_empty());
    }

    #[tokio::test]
    async fn test_shell_runner_with_env() {
        let runner = ShellRunner::new();
        let mut env = HashMap::new();
        env.insert("MY_VAR".to_string(), "test_value".to_string());
        let dir = std::env::current_dir().unwrap();

        let output = runner.run("echo $MY_VAR", &env, &dir, None).await;

        assert!(output.stdout.contains("test_value"));
    }

    #[tokio::test]
    async fn test_shell_runner_exit_code_and_stderr() {
        let runner = ShellRunner::new();
        let dir = std::env::current_dir().unwrap();

        let output = runner
            .run("echo broken >&2; exit 42", &HashMap::new(), &dir, None)
            .await;

        assert_eq!(output.exit_code, Some(42));
        assert_eq!(output.diagnostics(), "broken");
    }

    #[tokio::test]
    async fn test_shell_runner_timeout() {
        let runner = ShellRunner::new();
        let dir = std::env::current_dir().unwrap();

        let output = runner
            .run("exec sleep 5", &HashMap::new(), &dir, Some(Duration::from_millis(100)))
            .await;

        assert!(output.timed_out);
        assert!(!output.success());
        assert!(output.stderr.contains("timed out"));
    }

    #[tokio::test]
    async fn test_timeout_kills_background_children() {
        let runner = ShellRunner::new();
        let dir = std::env::current_dir().unwrap();
        let started = std::time::Instant::now();

        let output = runner
            .run(
                "sleep 30 & echo started; wait",
                &HashMap::new(),
                &dir,
                Some(Duration::from_millis(200)),
            )
            .await;

        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
