//! The shared filesystem namespace. Pathname socket names are durable entries
//! carrying a tagged reparse buffer instead of file content; everything else
//! about them behaves like an ordinary file node (mode, ownership, links), so
//! the generic file operations can be forwarded here unchanged.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::host::status::HostStatus;

/// A GUID in its conventional mixed-endian field layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guid {
    pub data1: u32,
    pub data2: u16,
    pub data3: u16,
    pub data4: [u8; 8],
}

/// A tagged reparse buffer attached to a file entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReparseData {
    pub tag: u32,
    pub guid: Guid,
    pub buffer: Vec<u8>,
}

#[derive(Debug)]
pub struct FsNode {
    ino: u64,
    attrs: Mutex<NodeAttrs>,
    reparse: ReparseData,
}

#[derive(Debug)]
struct NodeAttrs {
    mode: libc::mode_t,
    uid: libc::uid_t,
    gid: libc::gid_t,
    nlink: u32,
}

/// The stat result of a file node. Socket-typed callers overlay `S_IFSOCK`
/// themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub st_ino: u64,
    pub st_mode: libc::mode_t,
    pub st_uid: libc::uid_t,
    pub st_gid: libc::gid_t,
    pub st_nlink: u32,
    pub st_size: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclTag {
    UserObj,
    GroupObj,
    Other,
}

/// A minimal access-control entry, one per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AclEntry {
    pub tag: AclTag,
    pub perm: libc::mode_t,
}

pub struct Fs {
    nodes: Mutex<HashMap<PathBuf, Arc<FsNode>>>,
}

/// The shared filesystem namespace. Lockless after first call.
pub fn fs() -> &'static Fs {
    static FS: OnceCell<Fs> = OnceCell::new();
    FS.get_or_init(|| Fs {
        nodes: Mutex::new(HashMap::new()),
    })
}

static UMASK: AtomicU32 = AtomicU32::new(0o022);

/// The process file-creation mask.
pub fn umask() -> libc::mode_t {
    UMASK.load(Ordering::Relaxed) as libc::mode_t
}

/// Replace the process file-creation mask, returning the previous value.
pub fn set_umask(mask: libc::mode_t) -> libc::mode_t {
    UMASK.swap(mask as u32 & 0o777, Ordering::Relaxed) as libc::mode_t
}

impl Fs {
    /// Create a reparse entry with exclusive semantics. The entry's initial
    /// mode already has the caller's umask applied.
    pub fn create_reparse(
        &self,
        path: &Path,
        ino: u64,
        reparse: ReparseData,
        mode: libc::mode_t,
        uid: libc::uid_t,
        gid: libc::gid_t,
    ) -> Result<Arc<FsNode>, HostStatus> {
        let mut nodes = self.nodes.lock().unwrap();
        match nodes.entry(path.to_owned()) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(HostStatus::ObjectNameCollision)
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                let node = Arc::new(FsNode {
                    ino,
                    attrs: Mutex::new(NodeAttrs {
                        mode,
                        uid,
                        gid,
                        nlink: 1,
                    }),
                    reparse,
                });
                entry.insert(Arc::clone(&node));
                Ok(node)
            }
        }
    }

    /// Open an existing entry.
    pub fn open(&self, path: &Path) -> Result<Arc<FsNode>, HostStatus> {
        self.nodes
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or(HostStatus::ObjectNameNotFound)
    }

    pub fn exists(&self, path: &Path) -> bool {
        self.nodes.lock().unwrap().contains_key(path)
    }

    /// Create a hard link: `newpath` names the same node afterwards.
    pub fn link(&self, oldpath: &Path, newpath: &Path) -> Result<(), HostStatus> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get(oldpath)
            .cloned()
            .ok_or(HostStatus::ObjectNameNotFound)?;
        match nodes.entry(newpath.to_owned()) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(HostStatus::ObjectNameCollision)
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                node.attrs.lock().unwrap().nlink += 1;
                entry.insert(node);
                Ok(())
            }
        }
    }

    /// Remove a name. The node survives while other links reference it.
    pub fn unlink(&self, path: &Path) -> Result<(), HostStatus> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .remove(path)
            .ok_or(HostStatus::ObjectNameNotFound)?;
        node.attrs.lock().unwrap().nlink -= 1;
        Ok(())
    }
}

impl FsNode {
    pub fn ino(&self) -> u64 {
        self.ino
    }

    pub fn reparse(&self) -> &ReparseData {
        &self.reparse
    }

    pub fn stat(&self) -> FileStat {
        let attrs = self.attrs.lock().unwrap();
        FileStat {
            st_ino: self.ino,
            st_mode: attrs.mode,
            st_uid: attrs.uid,
            st_gid: attrs.gid,
            st_nlink: attrs.nlink,
            st_size: 0,
        }
    }

    /// Replace the permission bits, preserving the file type bits.
    pub fn chmod(&self, mode: libc::mode_t) {
        let mut attrs = self.attrs.lock().unwrap();
        attrs.mode = (attrs.mode & libc::S_IFMT) | (mode & !libc::S_IFMT);
    }

    pub fn chown(&self, uid: libc::uid_t, gid: libc::gid_t) {
        let mut attrs = self.attrs.lock().unwrap();
        // (uid_t)-1 / (gid_t)-1 mean "leave unchanged"
        if uid != libc::uid_t::MAX {
            attrs.uid = uid;
        }
        if gid != libc::gid_t::MAX {
            attrs.gid = gid;
        }
    }

    /// The node's access entries, derived from the permission bits.
    pub fn get_acl(&self) -> Vec<AclEntry> {
        let mode = self.attrs.lock().unwrap().mode;
        vec![
            AclEntry {
                tag: AclTag::UserObj,
                perm: (mode >> 6) & 0o7,
            },
            AclEntry {
                tag: AclTag::GroupObj,
                perm: (mode >> 3) & 0o7,
            },
            AclEntry {
                tag: AclTag::Other,
                perm: mode & 0o7,
            },
        ]
    }

    /// Fold access entries back into the permission bits. Unknown-by-class
    /// duplicates simply overwrite earlier entries.
    pub fn set_acl(&self, entries: &[AclEntry]) {
        let mut attrs = self.attrs.lock().unwrap();
        let mut mode = attrs.mode;
        for entry in entries {
            let perm = entry.perm & 0o7;
            match entry.tag {
                AclTag::UserObj => mode = (mode & !0o700) | (perm << 6),
                AclTag::GroupObj => mode = (mode & !0o070) | (perm << 3),
                AclTag::Other => mode = (mode & !0o007) | perm,
            }
        }
        attrs.mode = mode;
    }
}
