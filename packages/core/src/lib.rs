//! deckdrive-core: Core library for mounting game drives on SteamOS-like
//! handhelds.
//!
//! NTFS/exFAT drives are configured through a managed block in `/etc/fstab`
//! and mounted via systemd. All privileged work (backing up and rewriting
//! fstab, mounting, repairing dirty volumes) funnels through one
//! authenticated daemon session per workflow, so the user authenticates once
//! no matter how many steps the workflow takes.
//!
//! # Modules
//!
//! - [`device`]: Unified device abstraction (primary API)
//! - [`disk`]: Disk scanning using `lsblk`
//! - [`preset`]: Mount-option presets
//! - [`fstab`]: Fstab document model (pure parse/serialize)
//! - [`manager`]: Transactional fstab mutation with backup
//! - [`mount`]: Mount/unmount and dirty-volume handling
//! - [`steam`]: Steam VDF parsing and library injection
//! - [`syscall`]: Systemd control through the session
//! - [`protocol`]: Daemon wire protocol (HMAC-SHA256 signed requests)
//! - [`daemon`]: Privileged-side request verification and dispatch
//! - [`session`]: Unprivileged-side session client
//! - [`error`]: Error types
//!
//! # Example
//!
//! ```no_run
//! use deckdrive_core::{device, disk, manager, preset, session};
//!
//! // Scan for a mountable device.
//! let devices = disk::list_block_devices().unwrap();
//! let target = disk::filter_mountable_devices(&devices)[0];
//!
//! // One session: one authentication prompt for everything below.
//! let spawner = session::ProcessSpawner::pkexec("/usr/bin/deckdrive-cli");
//! let mut session = session::PrivilegedSession::new(Box::new(spawner));
//!
//! let manager = manager::FstabManager::new();
//! let preset = preset::PresetConfig::ssd(preset::SupportedFilesystem::Ntfs);
//! let entry =
//!     device::configure_device(&mut session, &manager, target, &preset, None).unwrap();
//!
//! deckdrive_core::mount::start_mount_unit(&mut session, &entry.mount_point).unwrap();
//! session.close().unwrap();
//! ```

pub mod daemon;
pub mod device;
pub mod disk;
pub mod error;
pub mod fstab;
pub mod manager;
pub mod mount;
pub mod preset;
pub mod protocol;
pub mod session;
pub mod steam;
pub mod syscall;

// Re-export commonly used types
pub use device::{ConnectionState, Device, ListDevicesConfig, list_devices};
pub use disk::BlockDevice;
pub use error::{Error, Result};
pub use fstab::{FstabDocument, ManagedEntry, MountIdentity};
pub use manager::FstabManager;
pub use preset::{PresetConfig, SupportedFilesystem};
pub use session::{
    CommandOutcome, DaemonSpawner, DaemonTransport, PrivilegedSession, ProcessSpawner,
};
pub use steam::LibraryFolder;
