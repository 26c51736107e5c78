//! Child process lifecycle: spawn, output forwarding, deadline and exit status.

use std::fmt;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use error_stack::Report;
use error_stack::ResultExt;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::task::JoinHandle;

use crate::error::RunError;

/// Status value recorded for a child that did not exit on its own.
pub const KILLED_STATUS: i32 = -1;

/// How long forwarders may keep draining after a timeout kill. A grandchild
/// holding the pipes open would otherwise block the return forever.
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// Program and arguments to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
}

impl Command {
    /// Builds a command from an argv, the first element being the program.
    pub fn from_argv<I, S>(argv: I) -> Result<Self, Report<RunError>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut argv = argv.into_iter().map(Into::into);
        let program = argv
            .next()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| Report::new(RunError::EmptyCommand))?;

        Ok(Self {
            program,
            args: argv.collect(),
        })
    }
}

/// Child output stream being forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl OutputStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        }
    }
}

/// Whether forwarded lines are tagged with their source stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Lines are written unmodified.
    #[default]
    Passthrough,
    /// Lines are prefixed with `out: ` or `err: `.
    Prefixed,
}

impl OutputMode {
    fn prefix(&self, stream: OutputStream) -> Option<&'static [u8]> {
        match (self, stream) {
            (OutputMode::Passthrough, _) => None,
            (OutputMode::Prefixed, OutputStream::Stdout) => Some(&b"out: "[..]),
            (OutputMode::Prefixed, OutputStream::Stderr) => Some(&b"err: "[..]),
        }
    }
}

/// Destination of one forwarded stream.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Opens the destination for each forwarded stream, once per spawned child.
#[derive(Clone)]
pub struct SinkFactory(Arc<dyn Fn(OutputStream) -> OutputSink + Send + Sync>);

impl SinkFactory {
    pub fn new<F>(open: F) -> Self
    where
        F: Fn(OutputStream) -> OutputSink + Send + Sync + 'static,
    {
        Self(Arc::new(open))
    }

    /// This process' own stdout and stderr.
    pub fn stdio() -> Self {
        Self::new(|stream| -> OutputSink {
            match stream {
                OutputStream::Stdout => Box::new(tokio::io::stdout()),
                OutputStream::Stderr => Box::new(tokio::io::stderr()),
            }
        })
    }

    fn open(&self, stream: OutputStream) -> OutputSink {
        (self.0)(stream)
    }
}

impl Default for SinkFactory {
    fn default() -> Self {
        Self::stdio()
    }
}

impl fmt::Debug for SinkFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SinkFactory")
    }
}

/// How the child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// The child exited on its own with this code, zero or not.
    Exited(i32),
    /// The child outlived its deadline and was killed.
    TimedOut,
    /// The child was terminated by a signal it did not send itself.
    Signaled(i32),
}

impl ExitStatus {
    fn from_std(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return ExitStatus::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitStatus::Signaled(signal);
            }
        }
        ExitStatus::Exited(KILLED_STATUS)
    }

    /// Value reported in the `status` field: the exit code, or
    /// [`KILLED_STATUS`] when the child was killed.
    pub fn status_value(&self) -> i32 {
        match self {
            ExitStatus::Exited(code) => *code,
            ExitStatus::TimedOut | ExitStatus::Signaled(_) => KILLED_STATUS,
        }
    }
}

/// Outcome of a finished child.
#[derive(Debug)]
pub struct ProcessResult {
    pub status: ExitStatus,
    /// Non-fatal problems met while supervising the child.
    pub errors: Vec<Report<RunError>>,
}

#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    output: OutputMode,
    sinks: SinkFactory,
}

impl ProcessRunner {
    pub fn new(output: OutputMode) -> Self {
        Self {
            output,
            sinks: SinkFactory::default(),
        }
    }

    /// Forwards child output to `sinks` instead of this process' stdio.
    pub fn with_sinks(mut self, sinks: SinkFactory) -> Self {
        self.sinks = sinks;
        self
    }

    /// Starts the command with the inherited environment and stdin.
    ///
    /// Stdout and stderr are forwarded to the runner's sinks, stdio by
    /// default, by two background tasks.
    pub fn spawn(&self, command: &Command) -> Result<RunningProcess, Report<RunError>> {
        let mut child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::inherit())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .change_context_lazy(|| RunError::Spawn {
                program: command.program.clone(),
            })?;

        let pid = child.id();
        tracing::info!(program = %command.program, pid = ?pid, "command started");

        let mut forwarders = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(self.forward(stdout, OutputStream::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(self.forward(stderr, OutputStream::Stderr));
        }

        Ok(RunningProcess {
            program: command.program.clone(),
            pid,
            child,
            forwarders,
        })
    }

    fn forward<R>(
        &self,
        reader: R,
        stream: OutputStream,
    ) -> JoinHandle<Result<(), Report<RunError>>>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        spawn_forwarder(
            reader,
            self.sinks.open(stream),
            stream,
            self.output.prefix(stream),
        )
    }
}

/// A started child whose output is being forwarded.
pub struct RunningProcess {
    program: String,
    pid: Option<u32>,
    child: Child,
    forwarders: Vec<JoinHandle<Result<(), Report<RunError>>>>,
}

impl RunningProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Waits for the child to exit, killing it once `timeout` elapses.
    ///
    /// Returns only after both output forwarders have drained.
    pub async fn wait(
        mut self,
        timeout: Option<Duration>,
    ) -> Result<ProcessResult, Report<RunError>> {
        let mut errors = Vec::new();

        let waited = match timeout {
            Some(deadline) if !deadline.is_zero() => {
                tokio::time::timeout(deadline, self.child.wait()).await.ok()
            }
            _ => Some(self.child.wait().await),
        };

        let status = match waited {
            Some(result) => {
                let status = result.change_context_lazy(|| RunError::Wait {
                    program: self.program.clone(),
                })?;
                ExitStatus::from_std(status)
            }
            None => {
                tracing::warn!(
                    program = %self.program,
                    pid = ?self.pid,
                    "deadline reached, killing command"
                );
                if let Err(e) = self.child.kill().await {
                    errors.push(Report::new(e).change_context(RunError::Kill {
                        program: self.program.clone(),
                    }));
                }
                ExitStatus::TimedOut
            }
        };

        for forwarder in self.forwarders {
            let drained = if status == ExitStatus::TimedOut {
                drain_with_grace(forwarder).await
            } else {
                forwarder.await.ok()
            };
            match drained {
                Some(Ok(())) => {}
                Some(Err(e)) => errors.push(e),
                None => errors.push(
                    Report::new(RunError::Forward { stream: "output" })
                        .attach_printable("forwarder did not finish draining"),
                ),
            }
        }

        tracing::info!(program = %self.program, ?status, "command finished");
        Ok(ProcessResult { status, errors })
    }
}

async fn drain_with_grace(
    mut forwarder: JoinHandle<Result<(), Report<RunError>>>,
) -> Option<Result<(), Report<RunError>>> {
    match tokio::time::timeout(DRAIN_GRACE, &mut forwarder).await {
        Ok(joined) => joined.ok(),
        Err(_) => {
            forwarder.abort();
            None
        }
    }
}

fn spawn_forwarder<R, W>(
    reader: R,
    writer: W,
    stream: OutputStream,
    prefix: Option<&'static [u8]>,
) -> JoinHandle<Result<(), Report<RunError>>>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let lines = forward_lines(reader, writer, prefix)
            .await
            .change_context(RunError::Forward {
                stream: stream.as_str(),
            })?;
        tracing::trace!(stream = stream.as_str(), lines, "forwarder drained");
        Ok(())
    })
}

/// Copies `reader` to `writer` line by line until EOF, returning the number
/// of lines copied. Bytes are passed through as-is; a final line without a
/// terminator gets one.
pub async fn forward_lines<R, W>(
    reader: R,
    mut writer: W,
    prefix: Option<&[u8]>,
) -> std::io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut line = Vec::new();
    let mut count = 0;

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line).await? == 0 {
            break;
        }
        if let Some(prefix) = prefix {
            writer.write_all(prefix).await?;
        }
        writer.write_all(&line).await?;
        if !line.ends_with(b"\n") {
            writer.write_all(b"\n").await?;
        }
        writer.flush().await?;
        count += 1;
    }

    Ok(count)
}
