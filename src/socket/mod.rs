pub mod ns;
pub mod packet;
pub mod unix;
pub mod waiter;

pub use unix::UnixSocket;

use nix::errno::Errno;

use crate::host::objdir::SymlinkHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnixSocketType {
    Stream,
    Dgram,
}

impl UnixSocketType {
    pub fn try_from_raw(sock_type: libc::c_int) -> Result<Self, Errno> {
        match sock_type {
            libc::SOCK_STREAM => Ok(Self::Stream),
            libc::SOCK_DGRAM => Ok(Self::Dgram),
            _ => Err(Errno::EINVAL),
        }
    }

    pub fn to_raw(self) -> libc::c_int {
        match self {
            Self::Stream => libc::SOCK_STREAM,
            Self::Dgram => libc::SOCK_DGRAM,
        }
    }

    /// The socket-type character embedded in pipe names.
    pub fn type_char(self) -> char {
        match self {
            Self::Stream => 's',
            Self::Dgram => 'd',
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingState {
    Unbound,
    BindPending,
    Bound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectState {
    Unconnected,
    ConnectPending,
    Connected,
    ConnectFailed,
    Listener,
}

/// The handle to a socket's backing name object. Pathname entries persist in
/// the filesystem after creation, so only a marker is kept for them; abstract
/// links live exactly as long as the handle.
#[derive(Debug)]
pub enum BackingHandle {
    /// No name object (unbound socket).
    None,
    /// An open handle keeping an abstract-name link alive.
    Opened(SymlinkHandle),
    /// A name object exists but needs no open handle.
    MarkerOnly,
}

impl BackingHandle {
    pub fn is_real(&self) -> bool {
        !matches!(self, BackingHandle::None)
    }

    /// Close the underlying handle, if any. Idempotent.
    pub fn close(&self) {
        if let BackingHandle::Opened(handle) = self {
            handle.close();
        }
    }
}
