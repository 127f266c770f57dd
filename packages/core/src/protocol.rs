//! Wire protocol for the privileged daemon session.
//!
//! One JSON object per line, in each direction, over the daemon's
//! stdin/stdout pair:
//!
//! 1. On startup the daemon generates a random 32-byte secret and writes it
//!    as the very first line. Only the legitimate parent holds the read end,
//!    so possession of the secret proves possession of the pipe.
//! 2. Every request (except shutdown) carries `id` and `mac`, where `mac` is
//!    `HMAC-SHA256(secret, id || command_json)` in hex. The daemon refuses
//!    requests with a bad MAC and requests whose id does not strictly exceed
//!    the last accepted id, so a captured signed line cannot be replayed.
//! 3. Responses are unsigned; trust only flows caller -> daemon.

use hmac::{Hmac, Mac};
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Handshake secret length in bytes.
pub const SECRET_LENGTH: usize = 32;

/// Generates a random handshake secret.
pub fn generate_secret() -> [u8; SECRET_LENGTH] {
    let mut secret = [0u8; SECRET_LENGTH];
    rand::rng().fill(&mut secret);
    secret
}

/// Computes the hex MAC for a request: `HMAC-SHA256(secret, id || payload)`.
pub fn sign(secret: &[u8], id: u64, payload: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(&id.to_le_bytes());
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a request MAC in constant time.
pub fn verify(secret: &[u8], id: u64, payload: &str, mac: &str) -> bool {
    constant_time_eq(&sign(secret, id, payload), mac)
}

/// Signs a command by serializing it to its canonical JSON payload first.
pub fn sign_command(secret: &[u8], id: u64, command: &Command) -> String {
    let payload = serde_json::to_string(command).expect("command serialization is infallible");
    sign(secret, id, &payload)
}

/// Constant-time string comparison to prevent timing attacks.
fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// First message on the daemon's outbound stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Handshake {
    /// Hex-encoded handshake secret.
    pub secret: String,
}

impl Handshake {
    pub fn new(secret: &[u8; SECRET_LENGTH]) -> Self {
        Self {
            secret: hex::encode(secret),
        }
    }

    /// Decodes the secret, rejecting anything but the exact expected length.
    pub fn decode_secret(&self) -> Option<[u8; SECRET_LENGTH]> {
        let bytes = hex::decode(&self.secret).ok()?;
        bytes.try_into().ok()
    }
}

/// The signable command union. Adding a variant extends the daemon's dispatch
/// match, which the compiler checks for exhaustiveness.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Command {
    /// Run a program with an argument vector. Never goes through a shell.
    Exec { program: String, args: Vec<String> },
    /// Replace a file's content wholesale. Subject to the write allow-list.
    WriteFile { path: String, content: String },
    /// Byte-for-byte file duplication; used for backups. The destination is
    /// subject to the write allow-list.
    CopyFile { src: String, dst: String },
    /// Recursive directory creation; succeeds if the directory already exists.
    MkdirP { path: String },
}

/// A signed request frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedRequest {
    /// Strictly increasing per session.
    pub id: u64,
    /// Hex HMAC-SHA256 over `(id, command_json)`.
    pub mac: String,
    #[serde(flatten)]
    pub command: Command,
}

impl SignedRequest {
    /// Builds and signs a request.
    pub fn new(secret: &[u8], id: u64, command: Command) -> Self {
        let mac = sign_command(secret, id, &command);
        Self { id, mac, command }
    }

    /// Verifies this request's MAC against a secret.
    pub fn verify(&self, secret: &[u8]) -> bool {
        let payload =
            serde_json::to_string(&self.command).expect("command serialization is infallible");
        verify(secret, self.id, &payload, &self.mac)
    }
}

/// The unsigned shutdown frame: `{"cmd":"shutdown"}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShutdownFrame {
    pub cmd: String,
}

impl ShutdownFrame {
    pub const CMD: &'static str = "shutdown";

    pub fn new() -> Self {
        Self {
            cmd: Self::CMD.to_string(),
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.cmd == Self::CMD
    }
}

impl Default for ShutdownFrame {
    fn default() -> Self {
        Self::new()
    }
}

/// Machine-readable rejection category carried alongside the error message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// MAC verification failed; the command was not executed.
    InvalidSignature,
    /// Request id did not strictly exceed the last accepted id.
    ReplayDetected,
    /// Write or copy destination is outside the daemon's allow-list.
    PathNotAllowed,
    /// Underlying I/O failure while executing an accepted command.
    Io,
}

/// Response frame from the daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonResponse {
    /// Request id this response answers; 0 for the shutdown acknowledgement.
    pub id: u64,
    /// Whether the operation succeeded.
    pub success: bool,
    /// Exit code for exec commands.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Captured standard output (exec commands).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    /// Captured standard error (exec commands).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
    /// Error message if `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Rejection category if `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

impl DaemonResponse {
    pub fn ok(id: u64) -> Self {
        Self {
            id,
            success: true,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: None,
            error_kind: None,
        }
    }

    pub fn exec(id: u64, exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            id,
            success: exit_code == 0,
            exit_code: Some(exit_code),
            stdout: Some(stdout),
            stderr: Some(stderr),
            error: None,
            error_kind: None,
        }
    }

    pub fn rejected(id: u64, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            exit_code: None,
            stdout: None,
            stderr: None,
            error: Some(message.into()),
            error_kind: Some(kind),
        }
    }
}
