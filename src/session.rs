//! Guest management channel.
//!
//! Test content reaches a guest through a [`GuestSession`]: a command is
//! started with [`GuestSession::exec_stream`] and its output arrives as a
//! stream of [`OutputLine`]s, ending with the exit code. Sessions are opened
//! by a [`Connector`] once the guest is ready.
//!
//! Output is forwarded to a [`LogSink`] as [`LogRecord`]s while it is
//! produced. The sink is an unbounded channel, so a slow consumer never
//! stalls a guest.
//!
//! # Built-in Connectors
//!
//! | Connector | Module | Description |
//! |-----------|--------|-------------|
//! | SSH | [`ssh`] | System `ssh` client with key-based auth |

pub mod ssh;

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

use crate::lifecycle::GuestRequest;

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

/// Errors raised while running commands on a guest.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The guest cannot be reached (no address, refused or lost connection).
    #[error("Cannot connect: {0}")]
    Connect(String),

    /// The command could not be started.
    #[error("Execution failed: {0}")]
    ExecFailed(String),

    /// The command did not finish in time.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The command was interrupted by cancellation.
    #[error("Cancelled")]
    Cancelled,
}

/// A command to run on a guest.
///
/// # Example
///
/// ```
/// use guestfarm::session::Command;
///
/// let cmd = Command::new("echo").arg("hello world").env("LANG", "C");
/// assert_eq!(cmd.to_shell_string(), "echo 'hello world'");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Command {
    /// The program/executable to run.
    pub program: String,

    /// Arguments to pass to the program.
    pub args: Vec<String>,

    /// Working directory on the guest.
    pub working_dir: Option<String>,

    /// Environment variables to export before running.
    pub env: Vec<(String, String)>,
}

impl Command {
    /// Creates a new command with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Runs `script` with `sh -c`.
    ///
    /// ```
    /// use guestfarm::session::Command;
    ///
    /// let cmd = Command::shell("make check");
    /// assert_eq!(cmd.to_shell_string(), "sh -c 'make check'");
    /// ```
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
    }

    /// Adds a single argument to the command.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Adds multiple arguments to the command.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the working directory for command execution.
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Adds an environment variable for this command.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Converts the command to a shell-executable string.
    pub fn to_shell_string(&self) -> String {
        let mut parts = vec![shell_escape(&self.program)];
        for arg in &self.args {
            parts.push(shell_escape(arg));
        }
        parts.join(" ")
    }

    /// Full remote script: exports, directory change, then the command.
    pub fn to_remote_script(&self) -> String {
        let mut script = String::new();
        for (key, value) in &self.env {
            script.push_str(&format!("export {}={}; ", key, quote(value)));
        }
        if let Some(dir) = &self.working_dir {
            script.push_str(&format!("cd {}; ", quote(dir)));
        }
        script.push_str(&self.to_shell_string());
        script
    }
}

fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

fn shell_escape(s: &str) -> String {
    if !s.is_empty()
        && s.chars()
            .all(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.' || c == '/')
    {
        s.to_string()
    } else {
        quote(s)
    }
}

/// A single line of output from a streaming command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputLine {
    /// A line from standard output.
    Stdout(String),
    /// A line from standard error.
    Stderr(String),
    /// The exit code of the command (yielded last, after all output).
    ExitCode(i32),
}

impl fmt::Display for OutputLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputLine::Stdout(line) | OutputLine::Stderr(line) => f.write_str(line),
            OutputLine::ExitCode(code) => write!(f, "exit {}", code),
        }
    }
}

/// A stream of output lines from a command.
pub type OutputStream = Pin<Box<dyn Stream<Item = OutputLine> + Send>>;

/// Result of a finished command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Exit code; -1 if the stream ended without one.
    pub exit_code: i32,

    /// Number of output lines produced.
    pub lines: usize,

    /// Wall-clock time the command took to execute.
    pub duration: Duration,
}

impl ExecResult {
    /// Returns `true` if the command succeeded (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// An open management channel to one guest.
#[async_trait]
pub trait GuestSession: Send + Sync {
    /// Human-readable target, e.g. `root@10.0.0.5:22`.
    fn target(&self) -> &str;

    /// Starts a command and returns its output as it is produced.
    ///
    /// Dropping the stream stops the command.
    async fn exec_stream(&self, cmd: &Command) -> SessionResult<OutputStream>;

    /// Exit code the transport itself reports when the guest is unreachable.
    ///
    /// A command ending with this code failed to run at all.
    fn transport_failure_code(&self) -> Option<i32> {
        None
    }
}

/// Opens sessions to ready guests.
pub trait Connector: Send + Sync {
    fn connect(&self, guest: &GuestRequest) -> SessionResult<Arc<dyn GuestSession>>;
}

/// One line of guest output, tagged with its schedule entry.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub entry_id: String,
    pub line: OutputLine,
    pub at: DateTime<Utc>,
}

/// Producer side of the per-entry output log.
pub type LogSink = mpsc::UnboundedSender<LogRecord>;

/// Consumer side of the per-entry output log.
pub type LogStream = UnboundedReceiverStream<LogRecord>;

/// Creates a connected log sink and stream.
pub fn log_channel() -> (LogSink, LogStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (tx, UnboundedReceiverStream::new(rx))
}

/// Runs `cmd` on `session`, forwarding its output to `sink`.
///
/// # Errors
///
/// - `Timeout` - the command ran longer than `timeout`
/// - `Cancelled` - `cancel` fired first
/// - `ExecFailed` - the command could not be started
/// - `Connect` - the session lost the guest (see
///   [`GuestSession::transport_failure_code`])
pub async fn run_command(
    session: &dyn GuestSession,
    cmd: &Command,
    entry_id: &str,
    sink: &LogSink,
    timeout: Duration,
    cancel: &CancellationToken,
) -> SessionResult<ExecResult> {
    let start = Instant::now();
    let mut stream = session.exec_stream(cmd).await?;
    let mut exit_code = -1;
    let mut lines = 0;

    let deadline = tokio::time::sleep(timeout);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(SessionError::Cancelled),
            _ = &mut deadline => {
                return Err(SessionError::Timeout(format!(
                    "`{}` on {} did not finish within {:?}",
                    cmd.to_shell_string(),
                    session.target(),
                    timeout
                )));
            }
            line = stream.next() => {
                let Some(line) = line else { break };
                match &line {
                    OutputLine::ExitCode(code) => exit_code = *code,
                    _ => lines += 1,
                }
                // The receiver may be gone when nobody consumes logs.
                let _ = sink.send(LogRecord {
                    entry_id: entry_id.to_string(),
                    line,
                    at: Utc::now(),
                });
            }
        }
    }

    if session.transport_failure_code() == Some(exit_code) {
        return Err(SessionError::Connect(format!(
            "`{}` on {} exited with {}",
            cmd.to_shell_string(),
            session.target(),
            exit_code
        )));
    }

    Ok(ExecResult {
        exit_code,
        lines,
        duration: start.elapsed(),
    })
}

/// Returns `true` if `session` runs a trivial command successfully within
/// `timeout`.
pub async fn is_alive(session: &dyn GuestSession, timeout: Duration) -> bool {
    let check = async {
        let mut stream = session
            .exec_stream(&Command::new("echo").arg("alive"))
            .await
            .ok()?;
        while let Some(line) = stream.next().await {
            if let OutputLine::ExitCode(code) = line {
                return Some(code);
            }
        }
        None
    };

    matches!(tokio::time::timeout(timeout, check).await, Ok(Some(0)))
}
