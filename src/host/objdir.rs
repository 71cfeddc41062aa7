//! The session-wide named-object directory. Abstract socket names live here
//! as symbolic-link objects whose target is the basename of the backing pipe.
//! A link object exists only as long as a handle to it is open, which gives
//! abstract sockets their lifetime-of-the-descriptor semantics for free.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use once_cell::sync::OnceCell;

use crate::host::status::HostStatus;

pub struct ObjDir {
    links: Mutex<HashMap<String, Arc<Symlink>>>,
}

struct Symlink {
    target: String,
}

/// The shared parent directory for this session. Lockless after first call.
pub fn shared_dir() -> &'static ObjDir {
    static DIR: OnceCell<ObjDir> = OnceCell::new();
    DIR.get_or_init(|| ObjDir {
        links: Mutex::new(HashMap::new()),
    })
}

/// Link names match case-insensitively.
fn link_key(name: &str) -> String {
    name.to_lowercase()
}

/// An open handle on a symbolic-link object. Closing the last handle for a
/// link removes the link from the directory.
#[derive(Debug)]
pub struct SymlinkHandle {
    name: String,
    closed: AtomicBool,
}

impl ObjDir {
    /// Create a symbolic link with exclusive semantics: an existing link of
    /// the same name is a collision.
    pub fn create_symlink(&self, name: &str, target: &str) -> Result<SymlinkHandle, HostStatus> {
        let mut links = self.links.lock().unwrap();
        match links.entry(link_key(name)) {
            std::collections::hash_map::Entry::Occupied(_) => {
                Err(HostStatus::ObjectNameCollision)
            }
            std::collections::hash_map::Entry::Vacant(entry) => {
                entry.insert(Arc::new(Symlink {
                    target: target.to_owned(),
                }));
                Ok(SymlinkHandle {
                    name: name.to_owned(),
                    closed: AtomicBool::new(false),
                })
            }
        }
    }

    /// Open a link and query its target.
    pub fn query_symlink(&self, name: &str) -> Result<String, HostStatus> {
        let links = self.links.lock().unwrap();
        links
            .get(&link_key(name))
            .map(|l| l.target.clone())
            .ok_or(HostStatus::ObjectNameNotFound)
    }

    fn remove(&self, name: &str) {
        self.links.lock().unwrap().remove(&link_key(name));
    }
}

impl SymlinkHandle {
    /// Close the handle, removing the link. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        shared_dir().remove(&self.name);
    }
}

impl Drop for SymlinkHandle {
    fn drop(&mut self) {
        self.close();
    }
}
