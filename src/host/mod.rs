//! The emulated host platform: message pipes, a named-object directory, a
//! shared filesystem namespace, events and interruptible waits. The socket
//! core only ever talks to these interfaces and their [`status`] codes.

pub mod fs;
pub mod objdir;
pub mod pipes;
pub mod status;
pub mod wait;

use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use rand::Rng;

/// Peer credentials as exchanged (or, today, not exchanged) between sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ucred {
    pub pid: libc::pid_t,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl Ucred {
    /// The defaults reported when no credentials were exchanged.
    pub fn unknown() -> Self {
        Self {
            pid: 0,
            uid: libc::uid_t::MAX,
            gid: libc::gid_t::MAX,
        }
    }
}

/// Credentials of the calling process.
pub fn my_cred() -> Ucred {
    Ucred {
        pid: std::process::id() as libc::pid_t,
        uid: unsafe { libc::getuid() },
        gid: unsafe { libc::getgid() },
    }
}

/// The installation key distinguishing this emulation instance from others
/// sharing the pipe namespace, as 16 hex digits.
pub fn installation_key() -> &'static str {
    static KEY: Lazy<String> = Lazy::new(|| {
        let key: u64 = rand::thread_rng().gen();
        format!("{key:016x}")
    });
    &KEY
}

/// A 64-bit monotonically unique id; doubles as the socket's inode number.
pub fn next_unique_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(1);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
