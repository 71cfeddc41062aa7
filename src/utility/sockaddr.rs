use std::ffi::CStr;

use nix::errno::Errno;
use static_assertions::const_assert_eq;

use crate::utility::{i8_to_u8_slice, u8_to_i8_slice};

/// Offset of `sun_path` within `sockaddr_un`; also the length of an unnamed
/// address.
pub const SUN_PATH_OFFSET: usize = std::mem::size_of::<libc::sa_family_t>();

/// Total capacity of a unix socket address, family field included.
pub const SUN_NAME_MAX: usize = std::mem::size_of::<libc::sockaddr_un>();

// the wire format stores the name length in a u8
const_assert_eq!(SUN_PATH_OFFSET, 2);
const_assert_eq!(SUN_NAME_MAX, 110);

/// An owned unix socket address. Wraps a `libc::sockaddr_un` together with the
/// meaningful length, which is how the address is carried on the wire and
/// returned from `getsockname()`/`getpeername()`.
#[derive(Clone, Copy)]
pub struct SunName {
    un: libc::sockaddr_un,
    len: libc::socklen_t,
}

impl SunName {
    /// Get a new unnamed unix socket address.
    pub fn new_unnamed() -> Self {
        let mut un: libc::sockaddr_un = unsafe { std::mem::zeroed() };
        un.sun_family = libc::AF_UNIX as libc::sa_family_t;

        Self {
            un,
            len: SUN_PATH_OFFSET as libc::socklen_t,
        }
    }

    /// Build an address from raw caller-supplied bytes. Lengths larger than
    /// the address capacity are truncated, mirroring what the kernel does with
    /// an oversized `addrlen`. No validity check is performed here; callers
    /// use [`check_usable`](Self::check_usable) before handing the name to the
    /// namespace.
    pub fn from_raw(bytes: &[u8]) -> Self {
        let len = bytes.len().min(SUN_NAME_MAX);
        let mut un: libc::sockaddr_un = unsafe { std::mem::zeroed() };

        // SAFETY: sockaddr_un is a plain-old-data struct of at least `len`
        // bytes, and `len` is bounded by its size.
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                std::ptr::from_mut(&mut un) as *mut u8,
                len,
            )
        };

        Self {
            un,
            len: len as libc::socklen_t,
        }
    }

    /// Get a new `SunName` with the given path. Will return `None` if the
    /// path is empty or too large for `sun_path` plus a terminating nul.
    pub fn new_path(path: &CStr) -> Option<Self> {
        let path = path.to_bytes();

        if path.is_empty() {
            return None;
        }

        let mut un: libc::sockaddr_un = unsafe { std::mem::zeroed() };

        if path.len() >= std::mem::size_of_val(&un.sun_path) {
            return None;
        }

        un.sun_family = libc::AF_UNIX as libc::sa_family_t;
        un.sun_path[..path.len()].copy_from_slice(u8_to_i8_slice(path));

        let len = SUN_PATH_OFFSET + path.len() + 1;

        Some(Self {
            un,
            len: len as libc::socklen_t,
        })
    }

    /// Get a new `SunName` with the given abstract name. The name does not
    /// include the leading nul byte. Will return `None` if the name is too
    /// large.
    pub fn new_abstract(name: &[u8]) -> Option<Self> {
        let mut un: libc::sockaddr_un = unsafe { std::mem::zeroed() };

        if name.len() + 1 > std::mem::size_of_val(&un.sun_path) {
            return None;
        }

        un.sun_family = libc::AF_UNIX as libc::sa_family_t;
        un.sun_path[1..][..name.len()].copy_from_slice(u8_to_i8_slice(name));

        let len = SUN_PATH_OFFSET + 1 + name.len();

        Some(Self {
            un,
            len: len as libc::socklen_t,
        })
    }

    pub fn len(&self) -> libc::socklen_t {
        self.len
    }

    /// The address family, or `None` if the address is too short to hold one.
    pub fn family(&self) -> Option<libc::sa_family_t> {
        if (self.len as usize) < SUN_PATH_OFFSET {
            return None;
        }
        Some(self.un.sun_family)
    }

    /// Is the address unnamed? On Linux, a unix socket address is unnamed if
    /// its length equals `size_of::<sa_family_t>()`.
    pub fn is_unnamed(&self) -> bool {
        (self.len as usize) == SUN_PATH_OFFSET
    }

    /// Returns a slice with the valid bytes of `sun_path`, or `None` if the
    /// address length is too short.
    pub fn sun_path(&self) -> Option<&[u8]> {
        let path_len = (self.len as usize).checked_sub(SUN_PATH_OFFSET)?;
        Some(i8_to_u8_slice(&self.un.sun_path[..path_len]))
    }

    /// If the address represents a pathname address, returns the C string
    /// with the filesystem path. Bytes after an embedded nul are ignored.
    pub fn as_path(&self) -> Option<&CStr> {
        let path = self.sun_path()?;

        if path.is_empty() || path[0] == 0 {
            return None;
        }

        // the path may be shorter than the address length; nul-terminate at
        // the first nul, or at the end of the valid bytes
        match CStr::from_bytes_until_nul(path) {
            Ok(s) => Some(s),
            Err(_) => None,
        }
    }

    /// If the address represents an abstract address, returns the name bytes
    /// excluding the leading nul at `sun_path[0]`.
    pub fn as_abstract(&self) -> Option<&[u8]> {
        let name = self.sun_path()?;

        if name.is_empty() || name[0] != 0 {
            return None;
        }

        Some(&name[1..])
    }

    /// The raw address bytes (family field plus path), suitable for embedding
    /// in a packet's name block.
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: sockaddr_un is plain-old-data and `len` is bounded by its
        // size on construction.
        unsafe {
            std::slice::from_raw_parts(
                std::ptr::from_ref(&self.un) as *const u8,
                self.len as usize,
            )
        }
    }

    /// Validity check applied before any namespace operation. Rejects
    /// addresses without any path bytes and the length-3 abstract address
    /// whose single payload byte is nul (a Linux quirk: such a name cannot be
    /// represented).
    pub fn check_usable(&self) -> Result<(), Errno> {
        if (self.len as usize) <= SUN_PATH_OFFSET {
            return Err(Errno::EINVAL);
        }
        if self.len == 3 && self.un.sun_path[0] == 0 {
            return Err(Errno::EINVAL);
        }
        Ok(())
    }
}

impl Default for SunName {
    fn default() -> Self {
        Self::new_unnamed()
    }
}

impl PartialEq for SunName {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len
            && self.un.sun_family == other.un.sun_family
            && self.sun_path() == other.sun_path()
    }
}

impl Eq for SunName {}

impl std::fmt::Debug for SunName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SunName")
            .field("sun_family", &self.un.sun_family)
            .field("sun_path", &self.sun_path())
            .finish()
    }
}

impl std::fmt::Display for SunName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(path) = self.as_path() {
            f.debug_struct("sockaddr_un").field("path", &path).finish()
        } else if let Some(name) = self.as_abstract() {
            let name: Vec<u8> = name
                .iter()
                .flat_map(|x| std::ascii::escape_default(*x))
                .collect();
            let name = String::from_utf8(name).unwrap();
            f.debug_struct("sockaddr_un")
                .field("abstract", &name)
                .finish()
        } else if self.is_unnamed() {
            write!(f, "sockaddr_un {{ unnamed }}")
        } else {
            f.debug_struct("sockaddr_un")
                .field("sun_path", &self.sun_path())
                .finish()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_offset_matches_layout() {
        assert_eq!(
            SUN_PATH_OFFSET,
            memoffset::offset_of!(libc::sockaddr_un, sun_path)
        );
    }

    #[test]
    fn unnamed() {
        let addr = SunName::new_unnamed();

        assert_eq!(addr.len(), 2);
        assert!(addr.is_unnamed());
        assert!(addr.as_path().is_none());
        assert!(addr.as_abstract().is_none());
        assert!(addr.check_usable().is_err());
    }

    #[test]
    fn pathname() {
        let path = CStr::from_bytes_with_nul(b"/tmp/sock\0").unwrap();
        let addr = SunName::new_path(path).unwrap();

        assert_eq!(addr.len() as usize, 2 + 9 + 1);
        assert!(!addr.is_unnamed());
        assert_eq!(addr.as_path().unwrap(), path);
        assert!(addr.as_abstract().is_none());
        assert!(addr.check_usable().is_ok());
    }

    #[test]
    fn abstract_name() {
        let name = [1, 2, 3, 0, 5, 6];
        let addr = SunName::new_abstract(&name).unwrap();

        assert_eq!(addr.len() as usize, 2 + 1 + name.len());
        assert!(addr.as_path().is_none());
        assert_eq!(addr.as_abstract().unwrap(), &name);
        assert!(addr.check_usable().is_ok());
    }

    #[test]
    fn nul_only_abstract_is_invalid() {
        // family + a single nul path byte; the Linux quirk case
        let addr = SunName::from_raw(&[libc::AF_UNIX as u8, 0, 0]);

        assert_eq!(addr.len(), 3);
        assert_eq!(addr.check_usable(), Err(Errno::EINVAL));
    }

    #[test]
    fn raw_roundtrip() {
        let path = CStr::from_bytes_with_nul(b"/tmp/x\0").unwrap();
        let addr = SunName::new_path(path).unwrap();

        let copy = SunName::from_raw(addr.as_bytes());
        assert_eq!(addr, copy);
        assert_eq!(copy.as_path().unwrap(), path);
    }

    #[test]
    fn raw_truncates() {
        let long = [7u8; 4096];
        let addr = SunName::from_raw(&long);
        assert_eq!(addr.len() as usize, SUN_NAME_MAX);
    }
}
