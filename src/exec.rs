//! Bounded external command execution: spawn a program in its own process
//! group, capture stdout+stderr, and kill the whole group if it overruns.

use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::AsyncReadExt;
use tokio::process::Command;

/// Result of a command that ran to completion.
#[derive(Debug)]
pub struct CommandOutput {
    /// Process exit code (None if killed by signal).
    pub exit_code: Option<i32>,
    /// Combined stdout followed by stderr, lossily decoded.
    pub output: String,
    pub duration: Duration,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Errors that can occur while running an external command.
#[derive(Debug)]
pub enum CommandError {
    /// Failed to spawn the subprocess.
    Spawn {
        program: String,
        source: std::io::Error,
    },
    /// The subprocess did not exit within its deadline and was killed.
    Timeout { program: String, timeout: Duration },
    /// Failed to read output or wait on the child.
    Io {
        program: String,
        source: std::io::Error,
    },
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommandError::Spawn { program, source } => {
                write!(f, "failed to spawn {program}: {source}")
            }
            CommandError::Timeout { program, timeout } => {
                write!(f, "{program} timed out after {}s", timeout.as_secs())
            }
            CommandError::Io { program, source } => {
                write!(f, "I/O error while running {program}: {source}")
            }
        }
    }
}

impl std::error::Error for CommandError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CommandError::Spawn { source, .. } => Some(source),
            CommandError::Io { source, .. } => Some(source),
            CommandError::Timeout { .. } => None,
        }
    }
}

/// Replace every `{key}` placeholder in each argument.
pub fn render_args(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter().fold(arg.clone(), |acc, (key, value)| {
                acc.replace(&format!("{{{key}}}"), value)
            })
        })
        .collect()
}

/// Run `program` with `args`, waiting at most `timeout`.
///
/// On timeout the child's process group receives SIGKILL so helpers it
/// spawned do not outlive the run.
pub async fn run_command(
    program: &str,
    args: &[String],
    timeout: Duration,
) -> Result<CommandOutput, CommandError> {
    tracing::debug!(program, args = ?args, timeout_secs = timeout.as_secs(), "running command");
    let start = Instant::now();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| CommandError::Spawn {
            program: program.to_string(),
            source: e,
        })?;

    let pid = child.id();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();

    let collect = async {
        let mut out = Vec::new();
        let mut err = Vec::new();
        let read_out = async {
            if let Some(s) = stdout.as_mut() {
                s.read_to_end(&mut out).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_err = async {
            if let Some(s) = stderr.as_mut() {
                s.read_to_end(&mut err).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (a, b) = tokio::join!(read_out, read_err);
        a?;
        b?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, out, err))
    };

    match tokio::time::timeout(timeout, collect).await {
        Ok(Ok((status, out, err))) => {
            let mut output = String::from_utf8_lossy(&out).into_owned();
            output.push_str(&String::from_utf8_lossy(&err));
            let duration = start.elapsed();
            tracing::debug!(
                program,
                exit_code = ?status.code(),
                duration_ms = duration.as_millis() as u64,
                "command finished"
            );
            Ok(CommandOutput {
                exit_code: status.code(),
                output,
                duration,
            })
        }
        Ok(Err(e)) => Err(CommandError::Io {
            program: program.to_string(),
            source: e,
        }),
        Err(_) => {
            if let Some(pid) = pid {
                kill_process_group(pid);
            }
            tracing::warn!(program, timeout_secs = timeout.as_secs(), "command timed out");
            Err(CommandError::Timeout {
                program: program.to_string(),
                timeout,
            })
        }
    }
}

fn kill_process_group(pid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
        tracing::debug!(pid, error = %e, "failed to kill process group");
    }
}
