use crate::node::Node;
use crate::ops::DirEntryInfo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// One successful open: the node it was opened through and its descriptor.
/// The descriptor closes when the last clone is dropped.
#[derive(Debug, Clone)]
pub struct FileHandle {
    pub node: Node,
    fd: Arc<OwnedFd>,
}

impl FileHandle {
    pub fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Listing snapshot taken at opendir time.
#[derive(Debug, Clone)]
pub struct DirHandle {
    pub node: Node,
    pub entries: Arc<Vec<DirEntryInfo>>,
}

#[derive(Debug, Clone)]
pub enum Handle {
    File(FileHandle),
    Dir(DirHandle),
}

#[derive(Debug)]
pub struct HandleTable {
    next_id: AtomicU64,
    entries: RwLock<HashMap<u64, Handle>>,
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn insert_file(&self, node: Node, fd: OwnedFd) -> u64 {
        self.insert(Handle::File(FileHandle {
            node,
            fd: Arc::new(fd),
        }))
    }

    pub fn insert_dir(&self, node: Node, entries: Vec<DirEntryInfo>) -> u64 {
        self.insert(Handle::Dir(DirHandle {
            node,
            entries: Arc::new(entries),
        }))
    }

    pub fn get_file(&self, id: u64) -> Option<FileHandle> {
        match self.entries.read().get(&id)? {
            Handle::File(handle) => Some(handle.clone()),
            Handle::Dir(_) => None,
        }
    }

    pub fn get_dir(&self, id: u64) -> Option<DirHandle> {
        match self.entries.read().get(&id)? {
            Handle::Dir(handle) => Some(handle.clone()),
            Handle::File(_) => None,
        }
    }

    pub fn remove(&self, id: u64) -> Option<Handle> {
        self.entries.write().remove(&id)
    }

    pub fn clear(&self) -> usize {
        let mut guard = self.entries.write();
        let count = guard.len();
        guard.clear();
        count
    }

    fn insert(&self, handle: Handle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.write().insert(id, handle);
        id
    }
}
