use std::fmt;
use std::future::Future;
use std::process::{Output, Stdio};
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::debug;

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { program: program.into(), args: args.into_iter().map(Into::into).collect() }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("{program} not found")]
    NotFound { program: String },
    #[error("failed to spawn {program}: {source}")]
    Spawn { program: String, source: std::io::Error },
    #[error("failed to collect output of {program}: {source}")]
    Io { program: String, source: std::io::Error },
    #[error("{program} timed out after {timeout_ms}ms")]
    TimedOut { program: String, timeout_ms: u64 },
    #[error("{program} exited with {status}: {stderr}")]
    Failed { program: String, status: String, stderr: String },
}

/// Runs an external command and hands back its stdout split into lines.
///
/// The child process must be finished (exited or killed) by the time the
/// returned future resolves, whatever the outcome.
pub trait CommandRunner {
    fn run(&self, cmd: &CommandSpec) -> impl Future<Output = Result<Vec<String>, ProcessError>>;
}

pub struct SystemRunner {
    timeout: Duration,
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for SystemRunner {
    async fn run(&self, cmd: &CommandSpec) -> Result<Vec<String>, ProcessError> {
        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(windows)]
        command.creation_flags(CREATE_NO_WINDOW);

        debug!(command = %cmd, timeout_ms = self.timeout.as_millis() as u64, "Spawning");
        let mut child = command.spawn().map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ProcessError::NotFound { program: cmd.program.clone() }
            } else {
                ProcessError::Spawn { program: cmd.program.clone(), source: e }
            }
        })?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let collected = tokio::time::timeout(self.timeout, collect_output(&mut child, stdout, stderr)).await;
        let out = match collected {
            Ok(Ok(out)) => out,
            Ok(Err(e)) => return Err(ProcessError::Io { program: cmd.program.clone(), source: e }),
            Err(_) => {
                // Reap before returning so the next source never overlaps this one.
                if let Err(e) = child.kill().await {
                    debug!(command = %cmd, ?e, "Failed to kill timed out process");
                }
                return Err(ProcessError::TimedOut {
                    program: cmd.program.clone(),
                    timeout_ms: self.timeout.as_millis() as u64,
                });
            }
        };

        if !out.status.success() {
            return Err(ProcessError::Failed {
                program: cmd.program.clone(),
                status: out.status.to_string(),
                stderr: decode_output(&out.stderr).trim().to_string(),
            });
        }

        Ok(split_lines(&decode_output(&out.stdout)))
    }
}

async fn collect_output(
    child: &mut Child,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
) -> std::io::Result<Output> {
    async fn drain(pipe: Option<impl AsyncRead + Unpin>) -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok(buf)
    }

    let (stdout, stderr) = tokio::try_join!(drain(stdout), drain(stderr))?;
    let status = child.wait().await?;
    Ok(Output { status, stdout, stderr })
}

/// wmic writes UTF-16LE when stdout is a pipe on some Windows builds.
pub fn decode_output(bytes: &[u8]) -> String {
    if let Some(rest) = bytes.strip_prefix(&[0xFF, 0xFE]) {
        return decode_utf16le(rest);
    }
    if looks_like_utf16le(bytes) {
        return decode_utf16le(bytes);
    }
    String::from_utf8_lossy(bytes).into_owned()
}

fn looks_like_utf16le(bytes: &[u8]) -> bool {
    let probe = &bytes[..bytes.len().min(16) & !1];
    !probe.is_empty() && probe.iter().skip(1).step_by(2).all(|b| *b == 0)
}

fn decode_utf16le(bytes: &[u8]) -> String {
    let units: Vec<u16> = bytes.chunks_exact(2).map(|c| u16::from_le_bytes([c[0], c[1]])).collect();
    String::from_utf16_lossy(&units)
}

pub fn split_lines(text: &str) -> Vec<String> {
    text.lines().map(|l| l.trim_end_matches('\r').to_string()).collect()
}
