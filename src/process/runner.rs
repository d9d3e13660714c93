//! Command launching with output piped into the relay.

use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::relay::{LogLine, OutputStream, Relay};
use crate::{AppError, Result};

/// Role a launched command plays in a workspace pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Executable from the bootstrap scripts directory.
    Bootstrap,
    /// Run-to-completion build step.
    Build,
    /// Background test command.
    Test,
    /// Long-running init process.
    Init,
    /// Background main process.
    Start,
}

impl Role {
    /// Lowercase role name used in log lines.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bootstrap => "bootstrap",
            Self::Build => "build",
            Self::Test => "test",
            Self::Init => "init",
            Self::Start => "start",
        }
    }
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A command string split into environment assignments, program and args.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Leading `KEY=VALUE` assignments.
    pub env: Vec<(String, String)>,
    /// Program to execute.
    pub program: String,
    /// Remaining whitespace-separated arguments.
    pub args: Vec<String>,
}

/// Split a command string on whitespace. Leading `KEY=VALUE` tokens become
/// environment variables for the command. No shell is involved, so quoting
/// and globbing are not interpreted.
///
/// Returns `None` for a blank command or one made only of assignments.
#[must_use]
pub fn parse_command(raw: &str) -> Option<ParsedCommand> {
    let mut env = Vec::new();
    let mut tokens = raw.split_whitespace().peekable();

    while let Some(token) = tokens.peek() {
        match token.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                env.push((key.to_owned(), value.to_owned()));
                tokens.next();
            }
            _ => break,
        }
    }

    let program = tokens.next()?.to_owned();
    Some(ParsedCommand {
        env,
        program,
        args: tokens.map(str::to_owned).collect(),
    })
}

/// Launches workspace commands and streams their output to the relay.
#[derive(Clone)]
pub struct CommandRunner {
    workspace_id: Arc<str>,
    relay: Relay,
}

impl CommandRunner {
    /// Create a runner publishing under `workspace_id`.
    #[must_use]
    pub fn new(workspace_id: impl Into<Arc<str>>, relay: Relay) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            relay,
        }
    }

    /// Workspace this runner publishes for.
    #[must_use]
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Start `command` in `cwd` with `env` injected on top of the agent's
    /// own environment. Stdout and stderr are forwarded line by line.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Process` if the program cannot be started.
    pub fn spawn(
        &self,
        role: Role,
        command: &ParsedCommand,
        cwd: &Path,
        env: &BTreeMap<String, String>,
    ) -> Result<Child> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .current_dir(cwd)
            .envs(env)
            .envs(command.env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Process(format!(
                "failed to start {role} command `{}`: {err}",
                command.program
            ))
        })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump(stdout, OutputStream::Stdout, self.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump(stderr, OutputStream::Stderr, self.clone()));
        }

        info!(
            workspace_id = %self.workspace_id,
            role = role.as_str(),
            pid = child.id().unwrap_or(0),
            program = %command.program,
            "command started"
        );
        Ok(child)
    }

    /// Publish a lifecycle notice on stdout.
    pub async fn notice(&self, message: impl Into<String>) {
        self.emit(OutputStream::Stdout, message.into()).await;
    }

    /// Publish a failure line on stderr.
    pub async fn error_line(&self, message: impl Into<String>) {
        self.emit(OutputStream::Stderr, message.into()).await;
    }

    async fn emit(&self, stream: OutputStream, message: String) {
        let line = LogLine::new(self.workspace_id.as_ref(), stream, message);
        if let Err(err) = self.relay.publish_line(&line).await {
            warn!(workspace_id = %self.workspace_id, %err, "relay unavailable, output lost");
        }
    }
}

async fn pump<R>(reader: R, stream: OutputStream, runner: CommandRunner)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&buf);
                runner
                    .emit(stream, text.trim_end_matches(['\r', '\n']).to_owned())
                    .await;
            }
            Err(err) => {
                debug!(%err, "output pipe closed");
                break;
            }
        }
    }
}
