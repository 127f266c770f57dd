//! Unprivileged-side client for the privileged daemon.
//!
//! A [`PrivilegedSession`] owns the daemon's lifecycle: it spawns the
//! elevation wrapper lazily on the first privileged call, reads the one-time
//! handshake secret, signs every request with a strictly increasing id, and
//! tears the daemon down on [`PrivilegedSession::close`]. One session means
//! one authentication prompt, however many commands run through it.
//!
//! Lifecycle: `Uninitialized -> Spawning -> Authenticated -> Closed`, with a
//! terminal `Failed` state reachable from `Spawning` (declined prompt, broken
//! handshake) or `Authenticated` (daemon death, protocol violation). A failed
//! session never re-elevates on its own: an explicit decline must surface
//! exactly once, not turn into a surprise second prompt.
//!
//! Spawning and transport sit behind the [`DaemonSpawner`] and
//! [`DaemonTransport`] capability traits so protocol behavior (signatures,
//! replay, cancellation) is testable against in-memory fakes.

use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use snafu::ensure;

use crate::error::{
    Error, HandshakeFailedSnafu, Result, SessionClosedSnafu, SessionTerminatedSnafu,
};
use crate::protocol::{
    Command, DaemonResponse, ErrorKind, Handshake, SECRET_LENGTH, ShutdownFrame, SignedRequest,
};

/// How long to wait for the handshake. This covers the elevation prompt, so
/// it is generous; individual commands afterwards have no timeout at all.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(120);

/// Result of one line-oriented receive on a transport.
#[derive(Debug)]
pub enum Received {
    /// One complete line.
    Line(String),
    /// The daemon closed its end of the stream.
    Eof,
    /// The optional deadline elapsed with no line available.
    TimedOut,
}

/// Byte-stream half of the session: ordered line exchange with the daemon.
pub trait DaemonTransport: Send {
    /// Sends one line (newline appended by the transport).
    fn send_line(&mut self, line: &str) -> Result<()>;

    /// Receives one line, waiting at most `timeout` if given.
    fn recv_line(&mut self, timeout: Option<Duration>) -> Result<Received>;

    /// Exit code of the daemon process, if it has terminated.
    fn exit_code(&mut self) -> Option<i32>;

    /// Forcibly tears the channel down.
    fn terminate(&mut self);
}

/// Launches the privileged daemon and hands back its transport.
pub trait DaemonSpawner: Send {
    fn spawn(&self) -> Result<Box<dyn DaemonTransport>>;
}

/// Structured result of one privileged command.
///
/// A non-zero exit code is data, not an error: callers inspect it (and
/// stderr) to decide on remediation, e.g. running ntfsfix after a mount
/// refused a dirty volume.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

impl CommandOutcome {
    fn from_response(response: DaemonResponse) -> Self {
        Self {
            success: response.success,
            exit_code: response.exit_code,
            stdout: response.stdout.unwrap_or_default(),
            stderr: response.stderr.unwrap_or_default(),
            error: response.error,
        }
    }

    /// Converts a failed outcome into [`Error::CommandFailed`].
    pub fn ensure_success(&self, command: impl Into<String>) -> Result<()> {
        ensure!(
            self.success,
            crate::error::CommandFailedSnafu {
                command: command.into(),
                code: self.exit_code.unwrap_or(-1),
                stderr: if self.stderr.is_empty() {
                    self.error.clone().unwrap_or_default()
                } else {
                    self.stderr.clone()
                },
            }
        );
        Ok(())
    }
}

/// Why a session entered the terminal `Failed` state.
#[derive(Debug, Clone)]
enum FailKind {
    Cancelled,
    Handshake(String),
    Terminated(String),
    Signature,
    Replay,
}

impl FailKind {
    fn from_error(error: &Error) -> Self {
        match error {
            Error::AuthenticationCancelled => FailKind::Cancelled,
            Error::HandshakeFailed { message } => FailKind::Handshake(message.clone()),
            Error::InvalidSignature => FailKind::Signature,
            Error::ReplayDetected => FailKind::Replay,
            other => FailKind::Terminated(other.to_string()),
        }
    }

    fn to_error(&self) -> Error {
        match self {
            FailKind::Cancelled => Error::AuthenticationCancelled,
            FailKind::Handshake(message) => Error::HandshakeFailed {
                message: message.clone(),
            },
            FailKind::Terminated(message) => Error::SessionTerminated {
                message: message.clone(),
            },
            FailKind::Signature => Error::InvalidSignature,
            FailKind::Replay => Error::ReplayDetected,
        }
    }
}

/// Authenticated channel state: transport, secret, and the id counter.
struct Channel {
    transport: Box<dyn DaemonTransport>,
    secret: [u8; SECRET_LENGTH],
    next_id: u64,
}

impl Channel {
    fn round_trip(&mut self, command: Command) -> Result<CommandOutcome> {
        let id = self.next_id;
        self.next_id += 1;

        let request = SignedRequest::new(&self.secret, id, command);
        let line = serde_json::to_string(&request).expect("request serializes");
        self.transport.send_line(&line)?;

        let response = match self.transport.recv_line(None)? {
            Received::Line(line) => {
                serde_json::from_str::<DaemonResponse>(&line).map_err(|e| {
                    Error::SessionTerminated {
                        message: format!("unparseable daemon response: {e}"),
                    }
                })?
            }
            Received::Eof | Received::TimedOut => {
                return SessionTerminatedSnafu {
                    message: "daemon exited before responding",
                }
                .fail();
            }
        };

        ensure!(
            response.id == id,
            SessionTerminatedSnafu {
                message: format!("response id {} does not match request id {id}", response.id),
            }
        );

        match response.error_kind {
            Some(ErrorKind::InvalidSignature) => Err(Error::InvalidSignature),
            Some(ErrorKind::ReplayDetected) => Err(Error::ReplayDetected),
            _ => Ok(CommandOutcome::from_response(response)),
        }
    }
}

enum State {
    Uninitialized,
    /// Transient while the elevation wrapper runs and the handshake is read.
    Spawning,
    Authenticated(Channel),
    Closed,
    Failed(FailKind),
}

/// Public view of the session lifecycle, mostly for diagnostics and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStateKind {
    Uninitialized,
    Spawning,
    Authenticated,
    Closed,
    Failed,
}

/// The authenticated, replay-protected channel to a privilege-escalated
/// daemon. One logical workflow gets one session; there is deliberately no
/// process-wide singleton.
pub struct PrivilegedSession {
    spawner: Box<dyn DaemonSpawner>,
    handshake_timeout: Duration,
    state: State,
}

impl PrivilegedSession {
    pub fn new(spawner: Box<dyn DaemonSpawner>) -> Self {
        Self {
            spawner,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            state: State::Uninitialized,
        }
    }

    /// Overrides the handshake deadline (the only timeout this session has).
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn state(&self) -> SessionStateKind {
        match self.state {
            State::Uninitialized => SessionStateKind::Uninitialized,
            State::Spawning => SessionStateKind::Spawning,
            State::Authenticated(_) => SessionStateKind::Authenticated,
            State::Closed => SessionStateKind::Closed,
            State::Failed(_) => SessionStateKind::Failed,
        }
    }

    /// Executes one command through the session, spawning and authenticating
    /// the daemon on first use.
    ///
    /// Calls are strictly sequential: this blocks until the matching response
    /// arrives. On a failed session the original failure is returned again;
    /// in particular, a declined prompt stays declined and never triggers a
    /// second elevation attempt.
    pub fn run_privileged(&mut self, command: Command) -> Result<CommandOutcome> {
        match &self.state {
            State::Closed => return SessionClosedSnafu.fail(),
            State::Failed(kind) => return Err(kind.to_error()),
            State::Uninitialized => self.authenticate()?,
            State::Spawning | State::Authenticated(_) => {}
        }
        self.dispatch(command)
    }

    /// Convenience wrapper for [`Command::Exec`].
    pub fn exec(&mut self, program: &str, args: &[&str]) -> Result<CommandOutcome> {
        self.run_privileged(Command::Exec {
            program: program.to_string(),
            args: args.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Convenience wrapper for [`Command::WriteFile`].
    pub fn write_file(&mut self, path: &str, content: &str) -> Result<CommandOutcome> {
        self.run_privileged(Command::WriteFile {
            path: path.to_string(),
            content: content.to_string(),
        })
    }

    /// Convenience wrapper for [`Command::CopyFile`].
    pub fn copy_file(&mut self, src: &str, dst: &str) -> Result<CommandOutcome> {
        self.run_privileged(Command::CopyFile {
            src: src.to_string(),
            dst: dst.to_string(),
        })
    }

    /// Convenience wrapper for [`Command::MkdirP`].
    pub fn mkdir_p(&mut self, path: &str) -> Result<CommandOutcome> {
        self.run_privileged(Command::MkdirP {
            path: path.to_string(),
        })
    }

    /// Shuts the daemon down and closes the session.
    ///
    /// Idempotent: closing a closed, failed, or never-started session is a
    /// no-op.
    pub fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, State::Closed) {
            State::Authenticated(mut channel) => {
                let frame =
                    serde_json::to_string(&ShutdownFrame::new()).expect("frame serializes");
                if channel.transport.send_line(&frame).is_ok() {
                    // Best-effort wait for the acknowledgement.
                    let _ = channel.transport.recv_line(Some(Duration::from_secs(5)));
                }
                channel.transport.terminate();
            }
            _ => {}
        }
        Ok(())
    }

    fn authenticate(&mut self) -> Result<()> {
        self.state = State::Spawning;
        log::debug!("spawning privileged daemon");
        match self.try_authenticate() {
            Ok(channel) => {
                log::debug!("privileged session authenticated");
                self.state = State::Authenticated(channel);
                Ok(())
            }
            Err(error) => {
                self.state = State::Failed(FailKind::from_error(&error));
                Err(error)
            }
        }
    }

    fn try_authenticate(&mut self) -> Result<Channel> {
        let mut transport = self.spawner.spawn()?;

        match transport.recv_line(Some(self.handshake_timeout))? {
            Received::Line(line) => {
                let handshake: Handshake = serde_json::from_str(&line).map_err(|e| {
                    Error::HandshakeFailed {
                        message: format!("malformed handshake frame: {e}"),
                    }
                })?;
                let secret = handshake
                    .decode_secret()
                    .ok_or_else(|| Error::HandshakeFailed {
                        message: format!("handshake secret is not {SECRET_LENGTH} bytes"),
                    })?;
                Ok(Channel {
                    transport,
                    secret,
                    next_id: 1,
                })
            }
            Received::Eof => {
                let code = transport.exit_code();
                // pkexec reports 126 for a dismissed dialog and 127 for a
                // denied authorization; both are the user saying no.
                if matches!(code, Some(126) | Some(127)) {
                    Err(Error::AuthenticationCancelled)
                } else {
                    HandshakeFailedSnafu {
                        message: format!("daemon exited before handshake (exit code {code:?})"),
                    }
                    .fail()
                }
            }
            Received::TimedOut => {
                transport.terminate();
                HandshakeFailedSnafu {
                    message: format!(
                        "no handshake within {:?}",
                        self.handshake_timeout
                    ),
                }
                .fail()
            }
        }
    }

    fn dispatch(&mut self, command: Command) -> Result<CommandOutcome> {
        let result = match &mut self.state {
            State::Authenticated(channel) => channel.round_trip(command),
            _ => return SessionClosedSnafu.fail(),
        };

        if let Err(error) = &result
            && error.is_session_fatal()
        {
            log::warn!("privileged session poisoned: {error}");
            let previous = std::mem::replace(
                &mut self.state,
                State::Failed(FailKind::from_error(error)),
            );
            if let State::Authenticated(mut channel) = previous {
                channel.transport.terminate();
            }
        }

        result
    }
}

impl Drop for PrivilegedSession {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

// ============================================================================
// Process-backed implementation
// ============================================================================

/// Spawner that launches the daemon binary, optionally under an elevation
/// wrapper.
pub struct ProcessSpawner {
    program: String,
    args: Vec<String>,
}

impl ProcessSpawner {
    /// GUI elevation: `pkexec <daemon-bin> daemon`.
    pub fn pkexec(daemon_bin: impl Into<String>) -> Self {
        Self {
            program: "pkexec".to_string(),
            args: vec![daemon_bin.into(), "daemon".to_string()],
        }
    }

    /// TTY elevation: `sudo <daemon-bin> daemon`.
    pub fn sudo(daemon_bin: impl Into<String>) -> Self {
        Self {
            program: "sudo".to_string(),
            args: vec![daemon_bin.into(), "daemon".to_string()],
        }
    }

    /// No elevation wrapper; for callers that already run as root.
    pub fn direct(daemon_bin: impl Into<String>) -> Self {
        Self {
            program: daemon_bin.into(),
            args: vec!["daemon".to_string()],
        }
    }
}

impl DaemonSpawner for ProcessSpawner {
    fn spawn(&self) -> Result<Box<dyn DaemonTransport>> {
        let child = std::process::Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            // The daemon logs to stderr; let it reach the user's terminal.
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::ElevationToolMissing {
                        tool: self.program.clone(),
                    }
                } else {
                    Error::SessionCreation {
                        message: format!("failed to spawn '{}': {e}", self.program),
                    }
                }
            })?;

        Ok(Box::new(ProcessTransport::new(child)?))
    }
}

/// Transport over a spawned daemon's stdin/stdout.
///
/// A reader thread pumps stdout lines into a channel so the handshake wait
/// can carry a deadline while later receives block indefinitely.
pub struct ProcessTransport {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<std::io::Result<String>>,
}

impl ProcessTransport {
    fn new(mut child: Child) -> Result<Self> {
        let stdin = child.stdin.take().ok_or_else(|| Error::SessionCreation {
            message: "daemon stdin was not piped".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| Error::SessionCreation {
            message: "daemon stdout was not piped".to_string(),
        })?;

        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                let failed = line.is_err();
                if tx.send(line).is_err() || failed {
                    break;
                }
            }
            // Sender drops here; the receiver observes EOF.
        });

        Ok(Self {
            child,
            stdin: Some(stdin),
            lines: rx,
        })
    }
}

impl DaemonTransport for ProcessTransport {
    fn send_line(&mut self, line: &str) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or_else(|| Error::SessionTerminated {
            message: "daemon stdin already closed".to_string(),
        })?;
        writeln!(stdin, "{line}")
            .and_then(|_| stdin.flush())
            .map_err(|e| Error::SessionTerminated {
                message: format!("failed to write to daemon: {e}"),
            })
    }

    fn recv_line(&mut self, timeout: Option<Duration>) -> Result<Received> {
        let received = match timeout {
            Some(timeout) => match self.lines.recv_timeout(timeout) {
                Ok(line) => line,
                Err(RecvTimeoutError::Timeout) => return Ok(Received::TimedOut),
                Err(RecvTimeoutError::Disconnected) => return Ok(Received::Eof),
            },
            None => match self.lines.recv() {
                Ok(line) => line,
                Err(_) => return Ok(Received::Eof),
            },
        };

        match received {
            Ok(line) => Ok(Received::Line(line)),
            Err(e) => {
                log::warn!("daemon stdout read error: {e}");
                Ok(Received::Eof)
            }
        }
    }

    fn exit_code(&mut self) -> Option<i32> {
        // The process usually needs a moment between closing stdout and
        // fully exiting.
        for _ in 0..20 {
            match self.child.try_wait() {
                Ok(Some(status)) => return status.code(),
                Ok(None) => thread::sleep(Duration::from_millis(50)),
                Err(_) => return None,
            }
        }
        None
    }

    fn terminate(&mut self) {
        self.stdin.take();
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

// ============================================================================
// In-memory fakes for protocol tests
// ============================================================================
