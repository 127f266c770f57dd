//! Unified error types for the deckdrive-core library.
//!
//! Uses SNAFU for context-rich error handling, especially useful when the same
//! underlying error type (like `std::io::Error`) appears in different contexts.
//!
//! Session-protocol errors (`HandshakeFailed`, `InvalidSignature`,
//! `ReplayDetected`, `SessionTerminated`) are fatal to the session that raised
//! them and are never retried internally. `AuthenticationCancelled` is a
//! terminal outcome of an explicit user decision and must not trigger a second
//! elevation prompt.

use snafu::{ResultExt, Snafu};
use std::path::PathBuf;

/// Result type alias using the library's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for all core library operations.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Failed to spawn or talk to a system command.
    #[snafu(display("failed to execute command '{command}'"))]
    CommandExecution {
        command: String,
        source: std::io::Error,
    },

    /// Command executed but returned a non-zero exit code.
    #[snafu(display("command '{command}' exited with code {code}: {stderr}"))]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    /// The daemon handshake was missing or malformed.
    #[snafu(display("privileged session handshake failed: {message}"))]
    HandshakeFailed { message: String },

    /// User declined the elevation prompt. Terminal; never auto-retried.
    #[snafu(display("authentication cancelled by user"))]
    AuthenticationCancelled,

    /// The daemon rejected a request signature.
    #[snafu(display("daemon rejected request signature"))]
    InvalidSignature,

    /// The daemon rejected a request id that did not exceed the last accepted id.
    #[snafu(display("daemon detected a replayed request id"))]
    ReplayDetected,

    /// Privilege escalation launcher (pkexec/sudo) is not installed.
    #[snafu(display("elevation tool '{tool}' not found"))]
    ElevationToolMissing { tool: String },

    /// The daemon process exited while requests were still expected.
    #[snafu(display("privileged session terminated unexpectedly: {message}"))]
    SessionTerminated { message: String },

    /// Operation attempted on a session that was already closed.
    #[snafu(display("privileged session is closed"))]
    SessionClosed,

    /// Failed to spawn the privileged daemon.
    #[snafu(display("failed to create privileged session: {message}"))]
    SessionCreation { message: String },

    /// Fstab file cannot be read.
    #[snafu(display("failed to read fstab at {}", path.display()))]
    FstabRead {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The managed block markers are inconsistent (unterminated or duplicated).
    #[snafu(display("malformed managed block in fstab: {message}"))]
    MalformedManagedBlock { message: String },

    /// Failed to parse a managed fstab entry line.
    #[snafu(display("failed to parse fstab entry: {message}"))]
    FstabParse { message: String },

    /// Backup copy failed; the real file was not touched.
    #[snafu(display("failed to back up {} to {}: {message}", path.display(), backup.display()))]
    BackupFailed {
        path: PathBuf,
        backup: PathBuf,
        message: String,
    },

    /// Privileged write of the new fstab content failed. The backup remains
    /// in place for manual recovery.
    #[snafu(display("failed to write {}: {message}", path.display()))]
    WriteFailed { path: PathBuf, message: String },

    /// Failed to parse lsblk JSON output.
    #[snafu(display("failed to parse lsblk output: {message}"))]
    LsblkParse { message: String },

    /// Mount point creation failed.
    #[snafu(display("failed to create mount point at {}", path.display()))]
    MountPointCreation {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Mount operation failed.
    #[snafu(display("failed to mount device: {message}"))]
    Mount { message: String },

    /// Unmount operation failed.
    #[snafu(display("failed to unmount {}: {message}", path.display()))]
    Unmount { path: PathBuf, message: String },

    /// Device has a dirty NTFS volume and was refused for mount.
    #[snafu(display("device {device} has a dirty NTFS volume"))]
    DirtyVolume { device: String },

    /// ntfsfix repair failed.
    #[snafu(display("ntfsfix repair failed for {device}: {message}"))]
    Ntfsfix { device: String, message: String },

    /// Device identifier is unusable for fstab.
    #[snafu(display("invalid device identity: {message}"))]
    InvalidIdentity { message: String },

    /// Unsupported filesystem type.
    #[snafu(display("invalid filesystem type: {fs}"))]
    InvalidFilesystem { fs: String },

    /// Home directory not found.
    #[snafu(display("could not determine home directory"))]
    HomeDirNotFound,

    /// Steam VDF file not found.
    #[snafu(display("Steam library folders VDF not found at {}", path.display()))]
    SteamVdfNotFound { path: PathBuf },

    /// Failed to parse Steam VDF file.
    #[snafu(display("failed to parse Steam VDF: {message}"))]
    VdfParse { message: String },

    /// Failed to read or write Steam VDF file.
    #[snafu(display("failed to access Steam VDF at {}", path.display()))]
    VdfIo {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Steam process control error.
    #[snafu(display("Steam process control error: {message}"))]
    SteamProcess { message: String },

    /// Systemd operation failed.
    #[snafu(display("systemd operation failed: {message}"))]
    Systemd { message: String },

    #[snafu(whatever, display("{message}"))]
    Generic {
        message: String,
        #[snafu(source(from(Box<dyn std::error::Error>, Some)))]
        source: Option<Box<dyn std::error::Error>>,
    },
}

impl Error {
    /// True for errors that poison the session they occurred on.
    ///
    /// A poisoned session is never reused; the caller must build a new one
    /// (and accept a new elevation prompt) to continue.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            Error::HandshakeFailed { .. }
                | Error::AuthenticationCancelled
                | Error::InvalidSignature
                | Error::ReplayDetected
                | Error::SessionTerminated { .. }
        )
    }
}

/// Extension trait for adding context to io::Error results.
pub trait IoResultExt<T> {
    /// Add context for command execution errors.
    fn command_context(self, command: impl Into<String>) -> Result<T>;

    /// Add context for fstab read errors.
    fn fstab_read_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for mount point creation errors.
    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T>;

    /// Add context for VDF read/write errors.
    fn vdf_context(self, path: impl Into<PathBuf>) -> Result<T>;
}

impl<T> IoResultExt<T> for std::result::Result<T, std::io::Error> {
    fn command_context(self, command: impl Into<String>) -> Result<T> {
        self.context(CommandExecutionSnafu {
            command: command.into(),
        })
    }

    fn fstab_read_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(FstabReadSnafu { path: path.into() })
    }

    fn mount_point_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(MountPointCreationSnafu { path: path.into() })
    }

    fn vdf_context(self, path: impl Into<PathBuf>) -> Result<T> {
        self.context(VdfIoSnafu { path: path.into() })
    }
}
