//! Scoped drop of effective privileges.

use nix::unistd::{getegid, geteuid, getgid, getuid, setegid, seteuid, Gid, Uid};

/// Drops the effective uid/gid to the real ids until dropped.
///
/// A no-op when the process is not running with elevated effective ids.
#[derive(Debug)]
pub struct TemporarilyUnprivileged {
    orig_euid: Uid,
    orig_egid: Gid,
}

impl TemporarilyUnprivileged {
    pub fn new() -> nix::Result<Self> {
        let orig_euid = geteuid();
        let orig_egid = getegid();

        // gid first: once the euid is dropped we may no longer change it.
        setegid(getgid())?;
        if let Err(e) = seteuid(getuid()) {
            let _ = setegid(orig_egid);
            return Err(e);
        }

        Ok(Self {
            orig_euid,
            orig_egid,
        })
    }
}

impl Drop for TemporarilyUnprivileged {
    fn drop(&mut self) {
        if let Err(e) = seteuid(self.orig_euid) {
            tracing::error!(error = %e, "Failed to restore effective uid");
        }
        if let Err(e) = setegid(self.orig_egid) {
            tracing::error!(error = %e, "Failed to restore effective gid");
        }
    }
}
