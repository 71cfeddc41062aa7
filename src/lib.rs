//! Emulation of unix-domain sockets (`SOCK_STREAM` and `SOCK_DGRAM`, both
//! pathname and abstract namespaces) on a host platform that offers only
//! named message-mode pipes and a separate object/filesystem namespace.
//!
//! An abstract socket is represented by a symbolic-link object in the
//! session's shared object directory; the link name is `af-unix-` plus the
//! transposed `sun_path` and its target is the basename of the underlying
//! pipe. A pathname socket is represented by a filesystem entry carrying a
//! tagged reparse buffer with the same pipe basename. The pipe is named
//! `cygwin-<installation_key>-unix-[sd]-<uniq_id>`.
//!
//! Every packet sent to a peer combines the local socket's name, ancillary
//! data, and user data, in that order, behind a length-checked header; a
//! packet never exceeds 64 KiB. A connecting, bound stream socket sends its
//! `sun_path` once after a successful connect; a bound datagram socket sends
//! it with every datagram.

// defines macros, so must be included first
#[macro_use]
pub mod utility;

pub mod host;
pub mod socket;

pub use nix::errno::Errno;

pub use crate::host::Ucred;
pub use crate::socket::unix::{SocketStatus, UnixSocket};
pub use crate::socket::{BindingState, ConnectState, UnixSocketType};
pub use crate::utility::sockaddr::SunName;
