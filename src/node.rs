use crate::config::Config;
use crate::error::{FsError, FsResult};
use crate::pathmap::{PathTranslator, make_child_path};
use crate::util::os_to_cstring;
use nix::fcntl::{OFlag, open};
use nix::sys::stat::Mode;
use std::ffi::{CString, OsStr, OsString};
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::trace;

/// One entry of the virtual tree.
///
/// A node only names things; it holds no descriptors. The kernel-side
/// registration is done by the fuse3 path session once an entry reply
/// carrying the node's attributes is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    virtual_path: OsString,
    real_path: PathBuf,
}

/// Parent directory descriptor plus the entry name, for the `*at` family.
#[derive(Debug)]
pub struct AtPath {
    pub dir_fd: OwnedFd,
    pub name: CString,
}

impl Node {
    pub fn virtual_path(&self) -> &OsStr {
        &self.virtual_path
    }

    pub fn real_path(&self) -> &Path {
        &self.real_path
    }

    /// Virtual path of the directory holding this node.
    pub fn virtual_parent(&self) -> &OsStr {
        match Path::new(&self.virtual_path).parent() {
            Some(parent) => parent.as_os_str(),
            None => OsStr::new("/"),
        }
    }

    pub fn open_at(&self) -> FsResult<AtPath> {
        let (dir, name) = match (self.real_path.parent(), self.real_path.file_name()) {
            (Some(dir), Some(name)) => (dir, name),
            _ => (self.real_path.as_path(), OsStr::new(".")),
        };
        let dir_fd = open(
            dir,
            OFlag::O_PATH | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        Ok(AtPath {
            dir_fd,
            name: os_to_cstring(name)?,
        })
    }
}

/// The hide check applied in front of every operation.
#[derive(Debug, Clone)]
pub struct Filter {
    config: Arc<Config>,
}

impl Filter {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn translator(&self) -> &PathTranslator {
        &self.config.translator
    }

    pub fn is_hidden(&self, virtual_path: &OsStr) -> bool {
        self.config.hide.is_hidden(virtual_path)
    }

    /// Node for an existing virtual path.
    pub fn resolve(&self, virtual_path: &OsStr) -> FsResult<Node> {
        if self.is_hidden(virtual_path) {
            return Err(FsError::Hidden);
        }
        let real_path = self.config.translator.real_path(virtual_path);
        trace!(virtual_path = %virtual_path.to_string_lossy(), real_path = %real_path.display(), "resolved");
        Ok(Node {
            virtual_path: virtual_path.to_os_string(),
            real_path,
        })
    }

    pub fn resolve_child(&self, parent: &OsStr, name: &OsStr) -> FsResult<Node> {
        self.resolve(&make_child_path(parent, name))
    }

    /// Node for a name about to be created (or renamed) under `parent`.
    pub fn resolve_new(&self, parent: &OsStr, name: &OsStr) -> FsResult<Node> {
        if self.is_hidden(parent) {
            return Err(FsError::Hidden);
        }
        self.resolve_child(parent, name).map_err(|err| match err {
            FsError::Hidden => FsError::HiddenDestination,
            other => other,
        })
    }

    /// Re-checks a node resolved by an earlier call.
    pub fn recheck(&self, node: &Node) -> FsResult<()> {
        if self.is_hidden(&node.virtual_path) {
            return Err(FsError::Hidden);
        }
        Ok(())
    }
}
