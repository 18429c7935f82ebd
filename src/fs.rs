use crate::config::Config;
use crate::error::FsResult;
use crate::handle_table::DirHandle;
use crate::ops::{AttrChanges, Passthrough};
use crate::util::timespec_from;
use bytes::Bytes;
use fuse3::path::prelude::*;
use fuse3::path::reply::{DirectoryEntryPlus, ReplyXAttr};
use fuse3::{FileType, SetAttr};
use std::ffi::{OsStr, OsString};
use std::num::NonZeroU32;
use std::os::unix::ffi::OsStringExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

const ATTR_TTL: Duration = Duration::from_secs(1);

/// Logs the outcome of one kernel request and converts the error to an errno.
fn finish<T>(op: &'static str, started: Instant, result: FsResult<T>) -> fuse3::Result<T> {
    trace!(op, elapsed = ?started.elapsed(), "done");
    result.map_err(|err| {
        if err.is_expected() {
            debug!(op, error = %err, "failed");
        } else {
            warn!(op, error = %err, "failed");
        }
        err.into()
    })
}

fn attr_changes(set_attr: &SetAttr) -> AttrChanges {
    AttrChanges {
        mode: set_attr.mode,
        uid: set_attr.uid,
        gid: set_attr.gid,
        size: set_attr.size,
        atime: set_attr.atime.map(timespec_from),
        mtime: set_attr.mtime.map(timespec_from),
    }
}

/// `.`, `..` and the snapshot entries, numbered from 1 so an offset can resume.
fn numbered_entries(
    handle: &DirHandle,
) -> impl Iterator<Item = (i64, FileType, OsString, Option<FileAttr>)> + '_ {
    let dots = [".", ".."]
        .into_iter()
        .map(|name| (FileType::Directory, OsString::from(name), None));
    let rest = handle
        .entries
        .iter()
        .map(|entry| (entry.kind, entry.name.clone(), Some(entry.attr)));
    dots.chain(rest)
        .enumerate()
        .map(|(idx, (kind, name, attr))| (idx as i64 + 1, kind, name, attr))
}

pub struct FilterFs {
    core: Passthrough,
    max_write: NonZeroU32,
}

impl FilterFs {
    pub fn new(config: Arc<Config>, max_write_kb: u32) -> Self {
        let bytes = max_write_kb.saturating_mul(1024).max(4096);
        let max_write = NonZeroU32::MIN.saturating_add(bytes - 1);
        Self {
            core: Passthrough::new(config),
            max_write,
        }
    }
}

impl PathFilesystem for FilterFs {
    async fn init(&self, _req: Request) -> Result<ReplyInit, fuse3::Errno> {
        let config = self.core.filter().config();
        info!(
            source = %config.source_root().display(),
            mountpoint = %config.mount_root().display(),
            "filesystem initialised"
        );
        Ok(ReplyInit {
            max_write: self.max_write,
        })
    }

    async fn destroy(&self, _req: Request) {
        let released = self.core.release_all();
        info!(released, "filesystem destroyed");
    }

    async fn lookup(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let started = Instant::now();
        debug!(?parent, ?name, "lookup");
        let attr = finish("lookup", started, self.core.lookup(parent, name))?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn getattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        _flags: u32,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, ?fh, "getattr");
        let attr = finish("getattr", started, self.core.getattr(path, fh))?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn setattr(
        &self,
        _req: Request,
        path: Option<&OsStr>,
        fh: Option<u64>,
        set_attr: SetAttr,
    ) -> Result<ReplyAttr, fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, ?fh, mode = ?set_attr.mode, size = ?set_attr.size, "setattr");
        let changes = attr_changes(&set_attr);
        let attr = finish("setattr", started, self.core.setattr(path, fh, &changes))?;
        Ok(ReplyAttr {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn readlink(&self, _req: Request, path: &OsStr) -> Result<ReplyData, fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, "readlink");
        let target = finish("readlink", started, self.core.readlink(path))?;
        Ok(Bytes::from(target.into_vec()).into())
    }

    async fn symlink(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        link_path: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let started = Instant::now();
        debug!(?parent, ?name, ?link_path, "symlink");
        let attr = finish("symlink", started, self.core.symlink(parent, name, link_path))?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn mknod(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        rdev: u32,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let started = Instant::now();
        debug!(?parent, ?name, mode, rdev, "mknod");
        let attr = finish("mknod", started, self.core.mknod(parent, name, mode, rdev))?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn mkdir(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        _umask: u32,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let started = Instant::now();
        debug!(?parent, ?name, mode, "mkdir");
        let attr = finish("mkdir", started, self.core.mkdir(parent, name, mode))?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn unlink(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let started = Instant::now();
        debug!(?parent, ?name, "unlink");
        finish("unlink", started, self.core.unlink(parent, name))
    }

    async fn rmdir(&self, _req: Request, parent: &OsStr, name: &OsStr) -> Result<(), fuse3::Errno> {
        let started = Instant::now();
        debug!(?parent, ?name, "rmdir");
        finish("rmdir", started, self.core.rmdir(parent, name))
    }

    async fn rename(
        &self,
        _req: Request,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let started = Instant::now();
        debug!(?origin_parent, ?origin_name, ?parent, ?name, "rename");
        finish(
            "rename",
            started,
            self.core.rename(origin_parent, origin_name, parent, name),
        )
    }

    async fn link(
        &self,
        _req: Request,
        path: &OsStr,
        new_parent: &OsStr,
        new_name: &OsStr,
    ) -> Result<ReplyEntry, fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, ?new_parent, ?new_name, "link");
        let attr = finish("link", started, self.core.link(path, new_parent, new_name))?;
        Ok(ReplyEntry {
            ttl: ATTR_TTL,
            attr,
        })
    }

    async fn open(
        &self,
        _req: Request,
        path: &OsStr,
        flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, flags, "open");
        let fh = finish("open", started, self.core.open(path, flags))?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    async fn read(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        size: u32,
    ) -> Result<ReplyData, fuse3::Errno> {
        let started = Instant::now();
        trace!(fh, offset, size, "read");
        let data = finish("read", started, self.core.read(fh, offset, size))?;
        Ok(Bytes::from(data).into())
    }

    async fn write(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        offset: u64,
        data: &[u8],
        _write_flags: u32,
        _flags: u32,
    ) -> Result<ReplyWrite, fuse3::Errno> {
        let started = Instant::now();
        trace!(fh, offset, len = data.len(), "write");
        let written = finish("write", started, self.core.write(fh, offset, data))?;
        Ok(ReplyWrite { written })
    }

    async fn release(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> Result<(), fuse3::Errno> {
        let started = Instant::now();
        debug!(fh, "release");
        finish("release", started, self.core.release(fh))
    }

    async fn fsync(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        datasync: bool,
    ) -> Result<(), fuse3::Errno> {
        let started = Instant::now();
        debug!(fh, datasync, "fsync");
        finish("fsync", started, self.core.fsync(fh, datasync))
    }

    async fn flush(
        &self,
        _req: Request,
        _path: Option<&OsStr>,
        fh: u64,
        _lock_owner: u64,
    ) -> Result<(), fuse3::Errno> {
        let started = Instant::now();
        debug!(fh, "flush");
        finish("flush", started, self.core.unsupported_on_handle(fh))
    }

    async fn setxattr(
        &self,
        _req: Request,
        path: &OsStr,
        name: &OsStr,
        _value: &[u8],
        _flags: u32,
        _position: u32,
    ) -> Result<(), fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, ?name, "setxattr");
        finish("setxattr", started, self.core.unsupported_on_path(path))
    }

    async fn getxattr(
        &self,
        _req: Request,
        path: &OsStr,
        name: &OsStr,
        _size: u32,
    ) -> Result<ReplyXAttr, fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, ?name, "getxattr");
        finish("getxattr", started, self.core.unsupported_on_path(path))
    }

    async fn listxattr(
        &self,
        _req: Request,
        path: &OsStr,
        _size: u32,
    ) -> Result<ReplyXAttr, fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, "listxattr");
        finish("listxattr", started, self.core.unsupported_on_path(path))
    }

    async fn removexattr(
        &self,
        _req: Request,
        path: &OsStr,
        name: &OsStr,
    ) -> Result<(), fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, ?name, "removexattr");
        finish("removexattr", started, self.core.unsupported_on_path(path))
    }

    async fn access(&self, _req: Request, path: &OsStr, mask: u32) -> Result<(), fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, mask, "access");
        finish("access", started, self.core.access(path, mask))
    }

    async fn create(
        &self,
        _req: Request,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> Result<ReplyCreated, fuse3::Errno> {
        let started = Instant::now();
        debug!(?parent, ?name, mode, flags, "create");
        let (fh, attr) = finish(
            "create",
            started,
            self.core.create(parent, name, mode, flags),
        )?;
        Ok(ReplyCreated {
            ttl: ATTR_TTL,
            attr,
            generation: 0,
            fh,
            flags: 0,
        })
    }

    async fn opendir(
        &self,
        _req: Request,
        path: &OsStr,
        _flags: u32,
    ) -> Result<ReplyOpen, fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, "opendir");
        let fh = finish("opendir", started, self.core.opendir(path))?;
        Ok(ReplyOpen { fh, flags: 0 })
    }

    type DirEntryStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntry>>>
    where
        Self: 'a;
    type DirEntryPlusStream<'a>
        = futures_util::stream::Iter<std::vec::IntoIter<fuse3::Result<DirectoryEntryPlus>>>
    where
        Self: 'a;

    async fn readdir<'a>(
        &'a self,
        _req: Request,
        path: &'a OsStr,
        fh: u64,
        offset: i64,
    ) -> Result<ReplyDirectory<Self::DirEntryStream<'a>>, fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, fh, offset, "readdir");
        let handle = finish("readdir", started, self.core.readdir(fh))?;

        let entries: Vec<fuse3::Result<DirectoryEntry>> = numbered_entries(&handle)
            .skip(offset.max(0) as usize)
            .map(|(offset, kind, name, _)| Ok(DirectoryEntry { kind, name, offset }))
            .collect();
        Ok(ReplyDirectory {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn readdirplus<'a>(
        &'a self,
        _req: Request,
        parent: &'a OsStr,
        fh: u64,
        offset: u64,
        _lock_owner: u64,
    ) -> Result<ReplyDirectoryPlus<Self::DirEntryPlusStream<'a>>, fuse3::Errno> {
        let started = Instant::now();
        debug!(?parent, fh, offset, "readdirplus");
        let handle = finish("readdirplus", started, self.core.readdir(fh))?;
        let dir_attr = finish(
            "readdirplus",
            started,
            self.core.getattr(Some(parent), None),
        )?;

        let entries: Vec<fuse3::Result<DirectoryEntryPlus>> = numbered_entries(&handle)
            .skip(offset as usize)
            .map(|(offset, kind, name, attr)| {
                Ok(DirectoryEntryPlus {
                    kind,
                    name,
                    offset,
                    attr: attr.unwrap_or(dir_attr),
                    entry_ttl: ATTR_TTL,
                    attr_ttl: ATTR_TTL,
                })
            })
            .collect();
        Ok(ReplyDirectoryPlus {
            entries: futures_util::stream::iter(entries),
        })
    }

    async fn releasedir(
        &self,
        _req: Request,
        _path: &OsStr,
        fh: u64,
        _flags: u32,
    ) -> Result<(), fuse3::Errno> {
        let started = Instant::now();
        debug!(fh, "releasedir");
        finish("releasedir", started, self.core.releasedir(fh))
    }

    async fn statfs(&self, _req: Request, path: &OsStr) -> Result<ReplyStatFs, fuse3::Errno> {
        let started = Instant::now();
        debug!(?path, "statfs");
        let stats = finish("statfs", started, self.core.statfs(path))?;
        Ok(ReplyStatFs {
            blocks: stats.blocks(),
            bfree: stats.blocks_free(),
            bavail: stats.blocks_available(),
            files: stats.files(),
            ffree: stats.files_free(),
            bsize: stats.block_size() as u32,
            namelen: stats.name_max() as u32,
            frsize: stats.fragment_size() as u32,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FsError;
    use crate::hide::HideRules;
    use std::path::Path;

    fn fs_over(dir: &Path) -> FilterFs {
        let config = Config::new(dir, Path::new("/mnt/view"), HideRules::parse(".git"), false)
            .unwrap();
        FilterFs::new(Arc::new(config), 128)
    }

    #[test]
    fn max_write_has_a_floor() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(fs_over(dir.path()).max_write.get(), 128 * 1024);
        let config = Config::new(dir.path(), Path::new("/m"), HideRules::default(), false)
            .unwrap();
        assert_eq!(FilterFs::new(Arc::new(config), 0).max_write.get(), 4096);
    }

    #[test]
    fn directory_offsets_resume_after_dots() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a"), b"").unwrap();
        std::fs::write(dir.path().join("b"), b"").unwrap();
        std::fs::create_dir(dir.path().join(".git")).unwrap();
        let fs = fs_over(dir.path());

        let fh = fs.core.opendir(OsStr::new("/")).unwrap();
        let handle = fs.core.readdir(fh).unwrap();
        let listed: Vec<(i64, OsString)> = numbered_entries(&handle)
            .map(|(offset, _, name, _)| (offset, name))
            .collect();
        assert_eq!(
            listed,
            vec![
                (1, OsString::from(".")),
                (2, OsString::from("..")),
                (3, OsString::from("a")),
                (4, OsString::from("b")),
            ]
        );

        let resumed: Vec<OsString> = numbered_entries(&handle)
            .skip(3)
            .map(|(_, _, name, _)| name)
            .collect();
        assert_eq!(resumed, vec![OsString::from("b")]);
    }

    #[test]
    fn failures_reach_the_kernel_as_errno() {
        let denied: fuse3::Result<()> =
            finish("rename", Instant::now(), Err(FsError::HiddenDestination));
        assert_eq!(denied.unwrap_err(), fuse3::Errno::from(libc::EPERM));

        let hidden: fuse3::Result<()> = finish("lookup", Instant::now(), Err(FsError::Hidden));
        assert_eq!(hidden.unwrap_err(), fuse3::Errno::from(libc::ENOENT));

        assert_eq!(finish("read", Instant::now(), Ok(3u32)).unwrap(), 3);
    }
}
