//! Remote command execution with a local-process-like handle.
//!
//! A [`RemoteProcess`] owns one session channel. The command is started as
//! soon as the process is created; a background task then shuttles bytes
//! between the channel and the [`RemoteStdin`], [`RemoteStdout`] and
//! [`RemoteStderr`] handles and publishes the exit status once the server
//! reports it.

use super::connection::ClientHandler;
use super::error::{SshError, SshResult};
use russh::ChannelMsg;
use russh::client::{Handle, Msg};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll, ready};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::sync::{mpsc, watch};

/// SSH extended data type carrying stderr.
const EXTENDED_DATA_STDERR: u32 = 1;

/// Options applied when launching a remote command
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOptions {
    /// Run the command as this user through `sudo`
    pub user: Option<String>,
    /// Flags passed to `sudo` when `user` is set (default `-n`)
    pub sudo_options: String,
    /// Stdin write coalescing size; `None` or `Some(0)` sends every write immediately
    pub bufsize: Option<usize>,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self {
            user: None,
            sudo_options: "-n".to_string(),
            bufsize: None,
        }
    }
}

impl ProcessOptions {
    /// Impersonate `user` with the default sudo flags.
    pub fn as_user(user: impl Into<String>) -> Self {
        Self {
            user: Some(user.into()),
            ..Self::default()
        }
    }

    pub fn sudo_options(mut self, options: impl Into<String>) -> Self {
        self.sudo_options = options.into();
        self
    }

    pub fn bufsize(mut self, bufsize: usize) -> Self {
        self.bufsize = Some(bufsize);
        self
    }

    /// The command line sent to the server.
    ///
    /// With a user set this is `sudo -u <user> <sudo_options> <command>`.
    /// Nothing is quoted; see [`crate::shell`].
    pub fn command_line(&self, command: &str) -> String {
        match &self.user {
            Some(user) => format!("sudo -u {} {} {}", user, self.sudo_options, command),
            None => command.to_string(),
        }
    }
}

/// Collected output of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code (0 = success)
    pub exit_code: u32,
    /// Standard output
    pub stdout: Vec<u8>,
    /// Standard error
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// Check if command succeeded
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExitState {
    Running,
    Exited(u32),
    Lost { signal: Option<String> },
}

enum StdinMsg {
    Data(Vec<u8>),
    Eof,
}

/// A command running (or finished) on the remote host
pub struct RemoteProcess {
    /// Writer for the remote command's standard input
    pub stdin: Option<RemoteStdin>,
    /// Reader for the remote command's standard output
    ///
    /// Output is queued in memory as it arrives, whether or not anyone reads
    /// it, so a chatty command left unread grows this process's memory by
    /// everything it prints. Take and drop the stream to discard output instead.
    pub stdout: Option<RemoteStdout>,
    /// Reader for the remote command's standard error, queued like `stdout`
    pub stderr: Option<RemoteStderr>,

    command: String,
    user: Option<String>,
    returncode: Option<u32>,
    exit_rx: watch::Receiver<ExitState>,
}

impl RemoteProcess {
    pub(crate) async fn start(
        handle: &Handle<ClientHandler>,
        command: &str,
        options: ProcessOptions,
    ) -> SshResult<Self> {
        let command_line = options.command_line(command);

        let mut channel = handle
            .channel_open_session()
            .await
            .map_err(|e| SshError::Channel(e.to_string()))?;

        tracing::debug!(command = %command_line, channel = ?channel.id(), "Executing remote command");

        channel
            .exec(true, command_line.as_str())
            .await
            .map_err(|e| SshError::CommandFailed(e.to_string()))?;

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel();
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = watch::channel(ExitState::Running);

        let mut pump = ChannelPump {
            stdout: Some(stdout_tx),
            stderr: Some(stderr_tx),
            exit: exit_tx,
            signal: None,
        };

        // The exec reply has to arrive before anything is handed to the caller.
        loop {
            match channel.wait().await {
                Some(ChannelMsg::Success) => break,
                Some(ChannelMsg::Failure) => {
                    return Err(SshError::CommandFailed(format!(
                        "server refused to execute '{command_line}'"
                    )));
                }
                Some(ChannelMsg::Close) | None => {
                    return Err(SshError::CommandFailed(format!(
                        "channel closed before '{command_line}' started"
                    )));
                }
                Some(msg) => pump.route(msg),
            }
        }

        tokio::spawn(pump.run(channel, stdin_rx));

        Ok(Self {
            stdin: Some(RemoteStdin::new(stdin_tx, options.bufsize.unwrap_or(0))),
            stdout: Some(RemoteOutput::new(stdout_rx)),
            stderr: Some(RemoteOutput::new(stderr_rx)),
            command: command_line,
            user: options.user,
            returncode: None,
            exit_rx,
        })
    }

    /// The command line that was executed, after any sudo rewrite
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The impersonated user, if any
    pub fn user(&self) -> Option<&str> {
        self.user.as_deref()
    }

    /// Exit code if the command has finished, without blocking.
    pub fn poll(&mut self) -> SshResult<Option<u32>> {
        if let Some(code) = self.returncode {
            return Ok(Some(code));
        }
        let state = self.exit_rx.borrow().clone();
        self.settle(state)
    }

    /// Wait for the command to finish and return its exit code.
    ///
    /// There is no deadline; use [`RemoteProcess::wait_timeout`] for one.
    pub async fn wait(&mut self) -> SshResult<u32> {
        if let Some(code) = self.returncode {
            return Ok(code);
        }

        let state = self
            .exit_rx
            .wait_for(|state| *state != ExitState::Running)
            .await
            .map(|state| state.clone())
            .unwrap_or(ExitState::Lost { signal: None });

        match self.settle(state)? {
            Some(code) => Ok(code),
            None => Err(SshError::NoExitStatus { signal: None }),
        }
    }

    /// Like [`RemoteProcess::wait`], giving up after `timeout`.
    ///
    /// Returns `Ok(None)` when the deadline passes; the command keeps running.
    pub async fn wait_timeout(&mut self, timeout: Duration) -> SshResult<Option<u32>> {
        match tokio::time::timeout(timeout, self.wait()).await {
            Ok(result) => result.map(Some),
            Err(_) => Ok(None),
        }
    }

    /// Close stdin, read both output streams to the end and wait for exit.
    ///
    /// Streams already taken by the caller are reported as empty.
    pub async fn wait_with_output(mut self) -> SshResult<CommandOutput> {
        drop(self.stdin.take());

        let stdout = self.stdout.take();
        let stderr = self.stderr.take();
        let (stdout, stderr) = tokio::try_join!(read_all(stdout), read_all(stderr))?;
        let exit_code = self.wait().await?;

        tracing::debug!(
            exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Command completed"
        );

        Ok(CommandOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    fn settle(&mut self, state: ExitState) -> SshResult<Option<u32>> {
        match state {
            ExitState::Running => Ok(None),
            ExitState::Exited(code) => {
                self.returncode = Some(code);
                Ok(Some(code))
            }
            ExitState::Lost { signal } => Err(SshError::NoExitStatus { signal }),
        }
    }
}

async fn read_all(stream: Option<RemoteOutput>) -> SshResult<Vec<u8>> {
    let mut buf = Vec::new();
    if let Some(mut stream) = stream {
        stream.read_to_end(&mut buf).await?;
    }
    Ok(buf)
}

struct ChannelPump {
    stdout: Option<mpsc::UnboundedSender<Vec<u8>>>,
    stderr: Option<mpsc::UnboundedSender<Vec<u8>>>,
    exit: watch::Sender<ExitState>,
    signal: Option<String>,
}

impl ChannelPump {
    fn route(&mut self, msg: ChannelMsg) {
        match msg {
            ChannelMsg::Data { data } => {
                if let Some(tx) = &self.stdout {
                    let _ = tx.send(data.to_vec());
                }
            }
            ChannelMsg::ExtendedData { data, ext } => {
                if ext == EXTENDED_DATA_STDERR
                    && let Some(tx) = &self.stderr
                {
                    let _ = tx.send(data.to_vec());
                }
            }
            ChannelMsg::Eof => {
                // Readers see end-of-file; the exit status may still follow.
                self.stdout = None;
                self.stderr = None;
            }
            ChannelMsg::ExitStatus { exit_status } => {
                tracing::debug!(exit_status, "Remote command exited");
                self.exit.send_replace(ExitState::Exited(exit_status));
            }
            ChannelMsg::ExitSignal { signal_name, .. } => {
                tracing::debug!(signal = ?signal_name, "Remote command killed by signal");
                self.signal = Some(format!("{signal_name:?}"));
            }
            _ => {}
        }
    }

    async fn run(
        mut self,
        channel: russh::Channel<Msg>,
        stdin_rx: mpsc::UnboundedReceiver<StdinMsg>,
    ) {
        let channel_id = channel.id();
        let (mut reader, writer) = channel.split();

        // Stdin gets its own task so a write stalled on the remote window never
        // stops the channel messages below from being drained.
        let feeder = tokio::spawn(feed_stdin(writer, stdin_rx));

        while let Some(msg) = reader.wait().await {
            match msg {
                ChannelMsg::Close => break,
                msg => self.route(msg),
            }
        }
        feeder.abort();

        self.stdout = None;
        self.stderr = None;
        let signal = self.signal.take();
        self.exit.send_if_modified(|state| {
            if *state == ExitState::Running {
                *state = ExitState::Lost { signal };
                true
            } else {
                false
            }
        });
        tracing::debug!(channel = ?channel_id, "Remote command channel closed");
    }
}

/// Copy queued stdin to the channel, then send EOF.
///
/// EOF also goes out when every [`RemoteStdin`] handle is gone.
async fn feed_stdin(
    writer: russh::ChannelWriteHalf<Msg>,
    mut stdin_rx: mpsc::UnboundedReceiver<StdinMsg>,
) {
    while let Some(StdinMsg::Data(data)) = stdin_rx.recv().await {
        if let Err(e) = writer.data(&data[..]).await {
            tracing::debug!(error = %e, "Failed to write to remote stdin");
            return;
        }
    }
    let _ = writer.eof().await;
}

fn broken_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "remote channel is closed")
}

/// Standard input of a [`RemoteProcess`].
///
/// Shutting the writer down (or dropping it) sends EOF to the remote command.
pub struct RemoteStdin {
    tx: mpsc::UnboundedSender<StdinMsg>,
    buffer: Vec<u8>,
    capacity: usize,
    shut_down: bool,
}

impl RemoteStdin {
    fn new(tx: mpsc::UnboundedSender<StdinMsg>, capacity: usize) -> Self {
        Self {
            tx,
            buffer: Vec::with_capacity(capacity),
            capacity,
            shut_down: false,
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let data = std::mem::take(&mut self.buffer);
        self.tx.send(StdinMsg::Data(data)).map_err(|_| broken_pipe())
    }
}

impl AsyncWrite for RemoteStdin {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.shut_down {
            return Poll::Ready(Err(broken_pipe()));
        }

        if this.capacity == 0 {
            this.tx
                .send(StdinMsg::Data(buf.to_vec()))
                .map_err(|_| broken_pipe())?;
        } else {
            this.buffer.extend_from_slice(buf);
            if this.buffer.len() >= this.capacity {
                this.send_buffered()?;
            }
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(self.get_mut().send_buffered())
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.shut_down {
            return Poll::Ready(Ok(()));
        }
        this.send_buffered()?;
        this.shut_down = true;
        Poll::Ready(this.tx.send(StdinMsg::Eof).map_err(|_| broken_pipe()))
    }
}

impl Drop for RemoteStdin {
    fn drop(&mut self) {
        let _ = self.send_buffered();
    }
}

/// Standard output or standard error of a [`RemoteProcess`].
///
/// Bytes are delivered as the server sends them; end-of-file is reported once
/// the remote side closes the stream.
pub struct RemoteOutput {
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
    chunk: Vec<u8>,
    offset: usize,
}

pub type RemoteStdout = RemoteOutput;
pub type RemoteStderr = RemoteOutput;

impl RemoteOutput {
    fn new(rx: mpsc::UnboundedReceiver<Vec<u8>>) -> Self {
        Self {
            rx,
            chunk: Vec::new(),
            offset: 0,
        }
    }
}

impl AsyncRead for RemoteOutput {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.offset < this.chunk.len() {
                let n = buf.remaining().min(this.chunk.len() - this.offset);
                buf.put_slice(&this.chunk[this.offset..this.offset + n]);
                this.offset += n;
                return Poll::Ready(Ok(()));
            }

            match ready!(this.rx.poll_recv(cx)) {
                Some(chunk) => {
                    this.chunk = chunk;
                    this.offset = 0;
                }
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}
