//! Privilege dropping for the worker process.

use nix::unistd::{setgid, setgroups, setuid, User};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrivDropError {
    #[error("unknown user \"{0}\"")]
    UnknownUser(String),
    #[error("{0}: {1}")]
    Errno(&'static str, nix::Error),
}

/// Switch the current process to the given unprivileged account.
///
/// Must run before the worker performs any network I/O. Group membership is
/// reduced first; setuid last, since nothing can be restored afterwards.
pub fn drop_privileges(username: &str) -> Result<(), PrivDropError> {
    let user = User::from_name(username)
        .map_err(|e| PrivDropError::Errno("getpwnam", e))?
        .ok_or_else(|| PrivDropError::UnknownUser(username.to_string()))?;

    setgroups(&[user.gid]).map_err(|e| PrivDropError::Errno("setgroups", e))?;
    setgid(user.gid).map_err(|e| PrivDropError::Errno("setgid", e))?;
    setuid(user.uid).map_err(|e| PrivDropError::Errno("setuid", e))?;

    tracing::debug!("Dropped privileges to {} (uid {})", username, user.uid);
    Ok(())
}
