//! The socket name registry: the durable mapping from a [`SunName`] to the
//! basename of its backing pipe.
//!
//! An abstract name becomes a symbolic-link object in the session's shared
//! object directory. The link name is the literal prefix `af-unix-` followed
//! by a byte-wise transposition of the `sun_path` (embedded nul bytes
//! included); the link target is the pipe basename.
//!
//! A pathname becomes a filesystem entry carrying a reparse buffer with a
//! private tag and GUID; the buffer holds the length-prefixed, nul-terminated
//! pipe basename.

use std::path::PathBuf;

use nix::errno::Errno;

use crate::host;
use crate::host::fs::{self, Guid, ReparseData};
use crate::host::objdir::{shared_dir, SymlinkHandle};
use crate::host::status::{errno_for, HostStatus};
use crate::socket::{BackingHandle, UnixSocketType};
use crate::utility::sockaddr::SunName;

/// Character length of a pipe basename, excluding the trailing nul.
pub const PIPE_NAME_LEN: usize = 47;

/// Character position encoding the socket type in a pipe basename.
pub const PIPE_TYPE_POS: usize = 29;

/// Reparse tag marking a unix-socket filesystem entry.
pub const REPARSE_TAG_UNIX_SOCKET: u32 = 0x9000_0071;

/// GUID accompanying the reparse tag.
pub const SOCKET_GUID: Guid = Guid {
    data1: 0xefc1_714d,
    data2: 0x7b19,
    data3: 0x4407,
    data4: [0xba, 0xb3, 0xc5, 0xb1, 0xf9, 0x2c, 0xb8, 0x8c],
};

/// Generate the basename of the backing pipe for a socket with the given
/// unique id.
pub fn pipe_basename(sock_type: UnixSocketType, unique_id: u64) -> String {
    let name = format!(
        "cygwin-{}-unix-{}-{unique_id:016x}",
        host::installation_key(),
        sock_type.type_char(),
    );
    debug_assert_eq!(name.len(), PIPE_NAME_LEN);
    debug_assert_eq!(name.as_bytes()[PIPE_TYPE_POS] as char, sock_type.type_char());
    name
}

/// Bytes that cannot appear literally in an object-directory name.
fn needs_transposition(b: u8) -> bool {
    b < 0x20 || b >= 0x7f || matches!(b, b'<' | b'>' | b':' | b'"' | b'/' | b'\\' | b'|' | b'?' | b'*')
}

/// Transpose raw `sun_path` bytes into an object-directory name fragment.
/// Nul bytes have no special meaning in an abstract socket name, so every
/// byte is kept, moved to a private plane when it cannot appear literally.
fn transform_sun_path(path: &[u8]) -> String {
    path.iter()
        .map(|&b| {
            if needs_transposition(b) {
                char::from_u32(0xf000 + b as u32).unwrap()
            } else {
                b as char
            }
        })
        .collect()
}

/// The object-directory link name for an abstract socket address.
fn abstract_link_name(sun: &SunName) -> String {
    let mut name = String::from("af-unix-");
    if let Some(path) = sun.sun_path() {
        name.push_str(&transform_sun_path(path));
    }
    name
}

/// Create the symbolic link representing an abstract name. A pre-existing
/// link means the address is in use.
pub fn create_abstract_link(sun: &SunName, pipe_name: &str) -> Result<SymlinkHandle, Errno> {
    shared_dir()
        .create_symlink(&abstract_link_name(sun), pipe_name)
        .map_err(|status| match status {
            HostStatus::ObjectNameCollision => Errno::EADDRINUSE,
            other => errno_for(other),
        })
}

// Reparse buffer layout: little-endian u16 byte length of the pipe name,
// the name bytes, a trailing nul.
fn encode_rep_pipe_name(pipe_name: &str) -> Vec<u8> {
    let bytes = pipe_name.as_bytes();
    let mut buf = Vec::with_capacity(2 + bytes.len() + 1);
    buf.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
    buf.extend_from_slice(bytes);
    buf.push(0);
    buf
}

fn decode_rep_pipe_name(buf: &[u8]) -> Option<String> {
    if buf.len() < 3 {
        return None;
    }
    let len = u16::from_le_bytes([buf[0], buf[1]]) as usize;
    let name = buf.get(2..2 + len)?;
    // pipe name in the reparse buffer is nul-terminated
    if buf.get(2 + len) != Some(&0) {
        return None;
    }
    String::from_utf8(name.to_vec()).ok()
}

/// Create the reparse entry representing a pathname. The entry's permission
/// bits are `(S_IRWXU|S_IRWXG|S_IRWXO) & !umask`.
pub fn create_reparse_point(sun: &SunName, pipe_name: &str) -> Result<(), Errno> {
    let Some(path) = sun.as_path() else {
        return Err(Errno::EINVAL);
    };
    let path = PathBuf::from(std::str::from_utf8(path.to_bytes()).map_err(|_| Errno::EILSEQ)?);

    if fs::fs().exists(&path) {
        return Err(Errno::EADDRINUSE);
    }

    let perms = (libc::S_IRWXU | libc::S_IRWXG | libc::S_IRWXO) & !fs::umask();
    let cred = host::my_cred();
    fs::fs()
        .create_reparse(
            &path,
            host::next_unique_id(),
            ReparseData {
                tag: REPARSE_TAG_UNIX_SOCKET,
                guid: SOCKET_GUID,
                buffer: encode_rep_pipe_name(pipe_name),
            },
            libc::S_IFSOCK | perms,
            cred.uid,
            cred.gid,
        )
        .map(|_| ())
        .map_err(|status| match status {
            HostStatus::ObjectNameCollision => Errno::EADDRINUSE,
            other => errno_for(other),
        })
}

/// Create the backing object for a valid, non-autobound name.
pub fn create_backing(sun: &SunName, pipe_name: &str) -> Result<BackingHandle, Errno> {
    sun.check_usable()?;
    if sun.as_abstract().is_some() {
        Ok(BackingHandle::Opened(create_abstract_link(sun, pipe_name)?))
    } else {
        create_reparse_point(sun, pipe_name)?;
        Ok(BackingHandle::MarkerOnly)
    }
}

/// Pick an unused abstract name for an unnamed bind. Uses only 5 hex digits
/// (up to 2^20 sockets) for Linux compat.
pub fn autobind(
    pipe_name: &str,
    mut rng: impl rand::Rng,
) -> Result<(SunName, BackingHandle), Errno> {
    loop {
        let id = rng.gen::<u32>() & 0xfffff;
        let name = format!("{id:05X}");
        let sun = SunName::new_abstract(name.as_bytes()).ok_or(Errno::EINVAL)?;
        match create_abstract_link(&sun, pipe_name) {
            Ok(handle) => return Ok((sun, BackingHandle::Opened(handle))),
            Err(Errno::EADDRINUSE) => continue,
            Err(err) => return Err(err),
        }
    }
}

/// Resolve a peer's name to its pipe basename and socket type.
pub fn open_file(sun: &SunName) -> Result<(UnixSocketType, String), Errno> {
    sun.check_usable()?;

    let pipe_name = if sun.as_abstract().is_some() {
        shared_dir()
            .query_symlink(&abstract_link_name(sun))
            .map_err(errno_for)?
    } else {
        let Some(path) = sun.as_path() else {
            return Err(Errno::EINVAL);
        };
        let path =
            PathBuf::from(std::str::from_utf8(path.to_bytes()).map_err(|_| Errno::EILSEQ)?);
        let node = fs::fs().open(&path).map_err(errno_for)?;
        let reparse = node.reparse();
        if reparse.tag != REPARSE_TAG_UNIX_SOCKET || reparse.guid != SOCKET_GUID {
            return Err(Errno::EINVAL);
        }
        decode_rep_pipe_name(&reparse.buffer).ok_or(Errno::EINVAL)?
    };

    let sock_type = match pipe_name.as_bytes().get(PIPE_TYPE_POS) {
        Some(b'd') => UnixSocketType::Dgram,
        Some(b's') => UnixSocketType::Stream,
        _ => return Err(Errno::EINVAL),
    };
    Ok((sock_type, pipe_name))
}
