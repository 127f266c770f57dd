//! Systemd control through the privileged session.
//!
//! Everything here is an `exec` of systemctl on the daemon side; nothing
//! shells out locally. Unit names for mount points follow systemd's path
//! escaping rules.

use std::path::Path;

use crate::error::{Error, Result};
use crate::session::PrivilegedSession;

/// `systemctl daemon-reload`, picking up fstab changes.
pub fn daemon_reload(session: &mut PrivilegedSession) -> Result<()> {
    run_systemctl(session, &["daemon-reload"])
}

/// Starts a systemd unit, e.g. a `.mount` unit derived from a mount point.
pub fn start_unit(session: &mut PrivilegedSession, unit_name: &str) -> Result<()> {
    run_systemctl(session, &["start", unit_name])
}

/// Stops a systemd unit.
pub fn stop_unit(session: &mut PrivilegedSession, unit_name: &str) -> Result<()> {
    run_systemctl(session, &["stop", unit_name])
}

/// Restarts a systemd unit.
pub fn restart_unit(session: &mut PrivilegedSession, unit_name: &str) -> Result<()> {
    run_systemctl(session, &["restart", unit_name])
}

/// Whether a unit is in "active" state. A non-active unit is not an error.
pub fn is_unit_active(session: &mut PrivilegedSession, unit_name: &str) -> Result<bool> {
    let outcome = session.exec("systemctl", &["is-active", unit_name])?;
    Ok(outcome.success)
}

fn run_systemctl(session: &mut PrivilegedSession, args: &[&str]) -> Result<()> {
    let outcome = session.exec("systemctl", args)?;
    if !outcome.success {
        return Err(Error::Systemd {
            message: format!(
                "systemctl {} failed: {}",
                args.join(" "),
                if outcome.stderr.is_empty() {
                    outcome.error.unwrap_or_default()
                } else {
                    outcome.stderr
                }
            ),
        });
    }
    Ok(())
}

/// Converts a mount point path to its systemd mount unit name.
///
/// Leading slashes drop, remaining slashes become dashes, and anything
/// outside `[A-Za-z0-9:_.]` is escaped as `\xNN`.
///
/// `/home/deck/Drives/GamesSSD` → `home-deck-Drives-GamesSSD.mount`
pub fn mount_point_to_unit_name(mount_point: &Path) -> String {
    let path = mount_point.to_string_lossy();
    let trimmed = path.trim_start_matches('/');

    if trimmed.is_empty() {
        return "-.mount".to_string();
    }

    let mut escaped = String::with_capacity(trimmed.len());
    for c in trimmed.chars() {
        if c == '/' {
            escaped.push('-');
        } else if c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '.') {
            escaped.push(c);
        } else {
            escaped.push_str(&format!("\\x{:02x}", c as u32));
        }
    }

    format!("{escaped}.mount")
}
