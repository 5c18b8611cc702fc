//! Socket activation.
//!
//! A service supervisor may bind the listening socket itself and start the
//! daemon on the first connection, handing the socket over as fd 3 with
//! `LISTEN_PID` naming the receiving process and `LISTEN_FDS` the number of
//! descriptors passed.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::socket::{getsockopt, sockopt};

use super::error::TransportError;

pub const LISTEN_FDS_START: RawFd = 3;

static ADOPTED: AtomicBool = AtomicBool::new(false);

/// Number of descriptors handed to `own_pid`, from the raw environment values.
pub fn listen_fd_count(
    listen_pid: Option<&str>,
    listen_fds: Option<&str>,
    own_pid: u32,
) -> Result<usize, TransportError> {
    let Some(listen_pid) = listen_pid else {
        return Ok(0);
    };
    let pid: u32 = listen_pid
        .trim()
        .parse()
        .map_err(|_| TransportError::Activation(format!("invalid LISTEN_PID {listen_pid:?}")))?;
    if pid != own_pid {
        tracing::debug!(listen_pid = pid, own_pid, "Activation descriptors meant for another process");
        return Ok(0);
    }
    let listen_fds = listen_fds
        .ok_or_else(|| TransportError::Activation("LISTEN_PID set without LISTEN_FDS".to_string()))?;
    listen_fds
        .trim()
        .parse()
        .map_err(|_| TransportError::Activation(format!("invalid LISTEN_FDS {listen_fds:?}")))
}

/// Adopt the supervisor's listening socket, if one was handed to this process.
pub fn take_listener() -> Result<Option<UnixListener>, TransportError> {
    let count = listen_fd_count(
        std::env::var("LISTEN_PID").ok().as_deref(),
        std::env::var("LISTEN_FDS").ok().as_deref(),
        std::process::id(),
    )?;
    if count == 0 {
        return Ok(None);
    }
    if ADOPTED.swap(true, Ordering::SeqCst) {
        return Err(TransportError::Activation(
            "activation socket already adopted".to_string(),
        ));
    }
    if count > 1 {
        tracing::warn!(count, "Supervisor passed several sockets, using the first");
    }

    // SAFETY: the activation contract guarantees LISTEN_FDS_START is open and
    // owned by this process; ADOPTED ensures ownership is taken at most once.
    let fd = unsafe { OwnedFd::from_raw_fd(LISTEN_FDS_START) };
    let listening = getsockopt(&fd, sockopt::AcceptConn).map_err(|e| {
        TransportError::Activation(format!("fd {LISTEN_FDS_START} is not a socket: {e}"))
    })?;
    if !listening {
        return Err(TransportError::Activation(format!(
            "fd {LISTEN_FDS_START} is not a listening socket"
        )));
    }

    tracing::info!(fd = LISTEN_FDS_START, "Adopted activation socket");
    Ok(Some(UnixListener::from(fd)))
}
