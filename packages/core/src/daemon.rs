//! Privileged-side daemon engine.
//!
//! The daemon is started with elevated rights (via pkexec or sudo) by the
//! unprivileged side and serves signed requests over its stdin/stdout pair.
//! It executes exactly one request at a time; the transport is a single
//! ordered stream and there is no pipelining.
//!
//! Requests that fail signature or replay verification are answered with a
//! structured rejection and then the daemon exits: a channel that produced
//! one forged or replayed frame is not worth serving, and the caller needs a
//! fresh elevation anyway.
//!
//! The protocol state machine lives here, behind plain `BufRead`/`Write`
//! parameters, so it can be exercised in tests without spawning a privileged
//! process. [`serve`] binds it to stdin/stdout and installs the parent-death
//! signal so the daemon can never outlive its parent.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use crate::protocol::{
    Command, DaemonResponse, ErrorKind, Handshake, SECRET_LENGTH, ShutdownFrame, SignedRequest,
    generate_secret,
};

/// Allow-list for `write_file` and `copy_file` destinations.
///
/// A destination is permitted when it equals an entry, extends an entry with
/// a `.` suffix (`/etc/fstab` covers `/etc/fstab.deckdrive.bak`), or lives
/// under an entry as a directory. Relative paths and paths containing `..`
/// are always refused.
#[derive(Debug, Clone)]
pub struct WritePolicy {
    roots: Vec<PathBuf>,
}

impl WritePolicy {
    /// Policy allowing writes to the given roots only.
    pub fn new(roots: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            roots: roots.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns whether a destination path is covered by the allow-list.
    pub fn allows(&self, path: &str) -> bool {
        let candidate = Path::new(path);
        if !candidate.is_absolute()
            || candidate
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            return false;
        }

        self.roots.iter().any(|root| {
            candidate == root.as_path()
                || candidate.starts_with(root)
                || path
                    .strip_prefix(&root.display().to_string())
                    .is_some_and(|rest| rest.starts_with('.'))
        })
    }
}

impl Default for WritePolicy {
    /// The stock policy covers the mount table and its backup sibling.
    fn default() -> Self {
        Self::new([crate::fstab::FSTAB_PATH])
    }
}

/// What the serve loop should do after handling one inbound line.
#[derive(Debug)]
pub enum Step {
    /// Nothing to send (blank or unparseable line).
    Ignore,
    /// Send the response and keep serving.
    Reply(DaemonResponse),
    /// Send the response, then exit: the channel integrity is in doubt.
    Fatal(DaemonResponse),
    /// Acknowledge shutdown, then exit cleanly.
    ShutdownAck(DaemonResponse),
}

/// Daemon request-verification and dispatch state.
pub struct Daemon {
    secret: [u8; SECRET_LENGTH],
    last_id: u64,
    policy: WritePolicy,
}

impl Daemon {
    /// Creates a daemon with a freshly generated secret and stock policy.
    pub fn new() -> Self {
        Self::with_secret(generate_secret())
    }

    /// Creates a daemon with a caller-provided secret.
    pub fn with_secret(secret: [u8; SECRET_LENGTH]) -> Self {
        Self {
            secret,
            last_id: 0,
            policy: WritePolicy::default(),
        }
    }

    /// Replaces the write allow-list.
    pub fn with_policy(mut self, policy: WritePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// The handshake frame to emit before serving any request.
    pub fn handshake(&self) -> Handshake {
        Handshake::new(&self.secret)
    }

    /// Verifies and dispatches one inbound line.
    pub fn handle_line(&mut self, line: &str) -> Step {
        let line = line.trim();
        if line.is_empty() {
            return Step::Ignore;
        }

        // Shutdown is the one unsigned frame.
        if let Ok(frame) = serde_json::from_str::<ShutdownFrame>(line)
            && frame.is_shutdown()
        {
            return Step::ShutdownAck(DaemonResponse::ok(0));
        }

        let request: SignedRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                // No id to answer with; drop the frame.
                log::warn!("discarding unparseable request frame: {e}");
                return Step::Ignore;
            }
        };

        // Anti-replay: ids must strictly increase, even for frames whose MAC
        // would verify.
        if request.id <= self.last_id {
            log::warn!(
                "replayed request id {} (last accepted {})",
                request.id,
                self.last_id
            );
            return Step::Fatal(DaemonResponse::rejected(
                request.id,
                ErrorKind::ReplayDetected,
                format!("request id {} <= last accepted id {}", request.id, self.last_id),
            ));
        }

        if !request.verify(&self.secret) {
            log::warn!("request {} failed signature verification", request.id);
            return Step::Fatal(DaemonResponse::rejected(
                request.id,
                ErrorKind::InvalidSignature,
                "HMAC verification failed",
            ));
        }

        self.last_id = request.id;

        let id = request.id;
        match request.command {
            Command::Exec { program, args } => Step::Reply(exec(id, &program, &args)),
            Command::WriteFile { path, content } => {
                Step::Reply(self.write_file(id, &path, &content))
            }
            Command::CopyFile { src, dst } => Step::Reply(self.copy_file(id, &src, &dst)),
            Command::MkdirP { path } => Step::Reply(mkdir_p(id, &path)),
        }
    }

    fn write_file(&self, id: u64, path: &str, content: &str) -> DaemonResponse {
        if !self.policy.allows(path) {
            return DaemonResponse::rejected(
                id,
                ErrorKind::PathNotAllowed,
                format!("write destination '{path}' is outside the allow-list"),
            );
        }
        match fs::write(path, content) {
            Ok(()) => DaemonResponse::ok(id),
            Err(e) => DaemonResponse::rejected(id, ErrorKind::Io, format!("write failed: {e}")),
        }
    }

    fn copy_file(&self, id: u64, src: &str, dst: &str) -> DaemonResponse {
        if !self.policy.allows(dst) {
            return DaemonResponse::rejected(
                id,
                ErrorKind::PathNotAllowed,
                format!("copy destination '{dst}' is outside the allow-list"),
            );
        }
        match fs::copy(src, dst) {
            Ok(_) => DaemonResponse::ok(id),
            Err(e) => DaemonResponse::rejected(id, ErrorKind::Io, format!("copy failed: {e}")),
        }
    }
}

impl Default for Daemon {
    fn default() -> Self {
        Self::new()
    }
}

fn exec(id: u64, program: &str, args: &[String]) -> DaemonResponse {
    // Arguments are passed as a vector; nothing here goes through a shell.
    match std::process::Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
    {
        Ok(output) => DaemonResponse::exec(
            id,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stdout).into_owned(),
            String::from_utf8_lossy(&output.stderr).into_owned(),
        ),
        Err(e) => DaemonResponse::rejected(
            id,
            ErrorKind::Io,
            format!("failed to execute '{program}': {e}"),
        ),
    }
}

fn mkdir_p(id: u64, path: &str) -> DaemonResponse {
    match fs::create_dir_all(path) {
        Ok(()) => DaemonResponse::ok(id),
        Err(e) => DaemonResponse::rejected(id, ErrorKind::Io, format!("mkdir failed: {e}")),
    }
}

/// Runs the serve loop over arbitrary streams: handshake first, then one
/// response per accepted request, flushed per line.
pub fn run<R: BufRead, W: Write>(daemon: &mut Daemon, reader: R, writer: &mut W) -> io::Result<()> {
    let handshake = serde_json::to_string(&daemon.handshake()).expect("handshake serializes");
    writeln!(writer, "{handshake}")?;
    writer.flush()?;

    for line in reader.lines() {
        let line = line?;
        match daemon.handle_line(&line) {
            Step::Ignore => continue,
            Step::Reply(response) => write_response(writer, &response)?,
            Step::Fatal(response) => {
                write_response(writer, &response)?;
                log::info!("daemon exiting after protocol violation");
                break;
            }
            Step::ShutdownAck(response) => {
                write_response(writer, &response)?;
                log::info!("daemon shutting down on request");
                break;
            }
        }
    }

    Ok(())
}

fn write_response<W: Write>(writer: &mut W, response: &DaemonResponse) -> io::Result<()> {
    let json = serde_json::to_string(response).expect("response serializes");
    writeln!(writer, "{json}")?;
    writer.flush()
}

/// Arranges for SIGTERM on parent death, so a crashed caller can never leave
/// an elevated daemon behind.
#[cfg(target_os = "linux")]
pub fn install_parent_death_signal() {
    use nix::sys::prctl;
    use nix::sys::signal::Signal;

    if let Err(e) = prctl::set_pdeathsig(Signal::SIGTERM) {
        log::warn!("failed to set parent-death signal: {e}");
    }
}

#[cfg(not(target_os = "linux"))]
pub fn install_parent_death_signal() {}

/// Daemon entry point: binds the serve loop to stdin/stdout.
pub fn serve() -> io::Result<()> {
    install_parent_death_signal();

    let mut daemon = Daemon::new();
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    run(&mut daemon, stdin.lock(), &mut stdout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::sign_command;

    fn signed_line(secret: &[u8; SECRET_LENGTH], id: u64, command: Command) -> String {
        serde_json::to_string(&SignedRequest::new(secret, id, command)).unwrap()
    }

    fn permissive(secret: [u8; SECRET_LENGTH], root: &Path) -> Daemon {
        Daemon::with_secret(secret).with_policy(WritePolicy::new([root]))
    }

    #[test]
    fn accepts_signed_request_and_rejects_replay() {
        let secret = generate_secret();
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = permissive(secret, dir.path());

        let line5 = signed_line(
            &secret,
            5,
            Command::MkdirP {
                path: dir.path().join("a").display().to_string(),
            },
        );
        match daemon.handle_line(&line5) {
            Step::Reply(response) => assert!(response.success),
            step => panic!("expected reply, got {step:?}"),
        }

        let line6 = signed_line(
            &secret,
            6,
            Command::MkdirP {
                path: dir.path().join("b").display().to_string(),
            },
        );
        assert!(matches!(daemon.handle_line(&line6), Step::Reply(r) if r.success));

        // The identical, validly signed id=5 frame must now be refused.
        match daemon.handle_line(&line5) {
            Step::Fatal(response) => {
                assert!(!response.success);
                assert_eq!(response.error_kind, Some(ErrorKind::ReplayDetected));
            }
            step => panic!("expected fatal rejection, got {step:?}"),
        }
    }

    #[test]
    fn rejects_mac_computed_for_a_different_command() {
        let secret = generate_secret();
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = permissive(secret, dir.path());

        let target = dir.path().join("forged");
        let benign = Command::MkdirP {
            path: dir.path().join("benign").display().to_string(),
        };
        let forged = SignedRequest {
            id: 5,
            mac: sign_command(&secret, 5, &benign),
            command: Command::WriteFile {
                path: target.display().to_string(),
                content: "owned".to_string(),
            },
        };

        let line = serde_json::to_string(&forged).unwrap();
        match daemon.handle_line(&line) {
            Step::Fatal(response) => {
                assert_eq!(response.error_kind, Some(ErrorKind::InvalidSignature));
            }
            step => panic!("expected fatal rejection, got {step:?}"),
        }
        // The forged command must never have executed.
        assert!(!target.exists());
    }

    #[test]
    fn write_file_honors_allow_list() {
        let secret = generate_secret();
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = permissive(secret, dir.path());

        let outside = signed_line(
            &secret,
            1,
            Command::WriteFile {
                path: "/somewhere/else/fstab".to_string(),
                content: "nope".to_string(),
            },
        );
        match daemon.handle_line(&outside) {
            Step::Reply(response) => {
                assert_eq!(response.error_kind, Some(ErrorKind::PathNotAllowed));
            }
            step => panic!("expected reply, got {step:?}"),
        }

        let inside_path = dir.path().join("fstab");
        let inside = signed_line(
            &secret,
            2,
            Command::WriteFile {
                path: inside_path.display().to_string(),
                content: "UUID=abcd / ext4 defaults 0 1\n".to_string(),
            },
        );
        assert!(matches!(daemon.handle_line(&inside), Step::Reply(r) if r.success));
        assert_eq!(
            fs::read_to_string(&inside_path).unwrap(),
            "UUID=abcd / ext4 defaults 0 1\n"
        );
    }

    #[test]
    fn copy_file_duplicates_bytes() {
        let secret = generate_secret();
        let dir = tempfile::tempdir().unwrap();
        let mut daemon = permissive(secret, dir.path());

        let src = dir.path().join("fstab");
        let dst = dir.path().join("fstab.bak");
        fs::write(&src, "original content").unwrap();

        let line = signed_line(
            &secret,
            1,
            Command::CopyFile {
                src: src.display().to_string(),
                dst: dst.display().to_string(),
            },
        );
        assert!(matches!(daemon.handle_line(&line), Step::Reply(r) if r.success));
        assert_eq!(fs::read(&dst).unwrap(), fs::read(&src).unwrap());
    }

    #[test]
    fn exec_captures_output_and_exit_code() {
        let secret = generate_secret();
        let mut daemon = Daemon::with_secret(secret);

        let line = signed_line(
            &secret,
            1,
            Command::Exec {
                program: "echo".to_string(),
                args: vec!["hello".to_string()],
            },
        );
        match daemon.handle_line(&line) {
            Step::Reply(response) => {
                assert!(response.success);
                assert_eq!(response.exit_code, Some(0));
                assert_eq!(response.stdout.as_deref(), Some("hello\n"));
            }
            step => panic!("expected reply, got {step:?}"),
        }

        let missing = signed_line(
            &secret,
            2,
            Command::Exec {
                program: "/nonexistent/program".to_string(),
                args: vec![],
            },
        );
        match daemon.handle_line(&missing) {
            Step::Reply(response) => {
                assert!(!response.success);
                assert_eq!(response.error_kind, Some(ErrorKind::Io));
            }
            step => panic!("expected reply, got {step:?}"),
        }
    }

    #[test]
    fn shutdown_is_acknowledged() {
        let secret = generate_secret();
        let mut daemon = Daemon::with_secret(secret);

        match daemon.handle_line(r#"{"cmd":"shutdown"}"#) {
            Step::ShutdownAck(response) => {
                assert!(response.success);
                assert_eq!(response.id, 0);
            }
            step => panic!("expected shutdown ack, got {step:?}"),
        }
    }

    #[test]
    fn serve_loop_emits_handshake_first() {
        let mut daemon = Daemon::new();
        let input = format!("{}\n", serde_json::to_string(&ShutdownFrame::new()).unwrap());
        let mut output = Vec::new();

        run(&mut daemon, input.as_bytes(), &mut output).unwrap();

        let text = String::from_utf8(output).unwrap();
        let mut lines = text.lines();
        let handshake: Handshake = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(handshake.decode_secret().map(|s| s.len()), Some(SECRET_LENGTH));
        let ack: DaemonResponse = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert!(ack.success);
    }

    #[test]
    fn write_policy_path_rules() {
        let policy = WritePolicy::new(["/etc/fstab"]);
        assert!(policy.allows("/etc/fstab"));
        assert!(policy.allows("/etc/fstab.deckdrive.bak"));
        assert!(!policy.allows("/etc/fstabricated"));
        assert!(!policy.allows("/etc/passwd"));
        assert!(!policy.allows("/etc/fstab/../passwd"));
        assert!(!policy.allows("fstab"));
    }
}
