//! Mount, unmount, and dirty-volume handling.
//!
//! All side effects run through the privileged session. A failing `mount` is
//! inspected rather than blindly propagated: when the stderr indicates an
//! unclean NTFS volume, callers get [`Error::DirtyVolume`] and can offer the
//! ntfsfix repair path.

use std::fs;
use std::path::Path;

use crate::disk::BlockDevice;
use crate::error::{Error, IoResultExt, Result};
use crate::session::PrivilegedSession;

/// Ensures the mount point directory exists.
///
/// Directories under the caller's home are created directly; anything else
/// goes through the session's `mkdir_p`.
pub fn create_mount_point(session: &mut PrivilegedSession, path: &Path) -> Result<()> {
    if path.exists() {
        return Ok(());
    }

    let under_home = dirs::home_dir().is_some_and(|home| path.starts_with(home));
    if under_home {
        return fs::create_dir_all(path).mount_point_context(path);
    }

    let outcome = session.mkdir_p(&path.display().to_string())?;
    if !outcome.success {
        return Err(Error::MountPointCreation {
            path: path.to_path_buf(),
            source: std::io::Error::other(
                outcome.error.unwrap_or_else(|| "mkdir failed".to_string()),
            ),
        });
    }
    Ok(())
}

/// Mounts a device at the given mount point.
pub fn mount_device(
    session: &mut PrivilegedSession,
    device: &BlockDevice,
    mount_point: &Path,
) -> Result<()> {
    create_mount_point(session, mount_point)?;

    let device_path = device.path.display().to_string();
    let mount_point_str = mount_point.display().to_string();
    let outcome = session.exec("mount", &[&device_path, &mount_point_str])?;

    if !outcome.success {
        if is_dirty_volume_error(&outcome.stderr) {
            return Err(Error::DirtyVolume {
                device: device_path,
            });
        }
        return Err(Error::Mount {
            message: outcome.stderr,
        });
    }

    Ok(())
}

/// Unmounts whatever is mounted at the given mount point.
pub fn unmount_device(session: &mut PrivilegedSession, mount_point: &Path) -> Result<()> {
    let mount_point_str = mount_point.display().to_string();
    let outcome = session.exec("umount", &[&mount_point_str])?;

    if !outcome.success {
        return Err(Error::Unmount {
            path: mount_point.to_path_buf(),
            message: outcome.stderr,
        });
    }

    Ok(())
}

/// Recognizes the kernel/ntfs-3g phrasings for an unclean NTFS volume.
fn is_dirty_volume_error(stderr: &str) -> bool {
    const INDICATORS: [&str; 4] = [
        "volume is dirty",
        "Volume is dirty",
        "force flag is not set",
        "The disk contains an unclean file system",
    ];
    INDICATORS.iter().any(|needle| stderr.contains(needle))
}

/// Scans dmesg for dirty-volume messages about a device.
///
/// `kernel.dmesg_restrict=1` makes dmesg root-only on many systems, hence
/// the session. An unreadable dmesg yields `Ok(false)`: the mount itself
/// will surface the dirty state if it is real.
pub fn detect_dirty_volume(
    session: &mut PrivilegedSession,
    device: &BlockDevice,
) -> Result<bool> {
    if !device.is_ntfs() {
        return Ok(false);
    }

    let outcome = session.exec("dmesg", &[])?;
    if !outcome.success {
        return Ok(false);
    }

    Ok(outcome
        .stdout
        .lines()
        .any(|line| line.contains(&device.name) && is_dirty_volume_error(line)))
}

/// Clears the NTFS dirty flag with `ntfsfix -d`.
pub fn repair_dirty_volume(
    session: &mut PrivilegedSession,
    device: &BlockDevice,
) -> Result<()> {
    let device_path = device.path.display().to_string();

    if !device.is_ntfs() {
        return Err(Error::Ntfsfix {
            device: device_path,
            message: "ntfsfix only works on NTFS volumes".to_string(),
        });
    }

    let outcome = session.exec("ntfsfix", &["-d", &device_path])?;
    if !outcome.success {
        return Err(Error::Ntfsfix {
            device: device_path,
            message: outcome.stderr,
        });
    }

    Ok(())
}

/// Starts the systemd mount unit for a mount point.
pub fn start_mount_unit(session: &mut PrivilegedSession, mount_point: &Path) -> Result<()> {
    let unit_name = crate::syscall::mount_point_to_unit_name(mount_point);
    crate::syscall::start_unit(session, &unit_name)
}

/// Stops the systemd mount unit for a mount point.
pub fn stop_mount_unit(session: &mut PrivilegedSession, mount_point: &Path) -> Result<()> {
    let unit_name = crate::syscall::mount_point_to_unit_name(mount_point);
    crate::syscall::stop_unit(session, &unit_name)
}
