//! The operation surface of the filtered view.
//!
//! Every entry point resolves its paths through [`Filter`] before touching
//! the source tree, then forwards to the matching syscall on the real path.
//! Nothing is cached: attributes and listings come straight from the store.

use crate::config::Config;
use crate::error::{FsError, FsResult};
use crate::handle_table::{DirHandle, FileHandle, HandleTable};
use crate::node::{Filter, Node};
use crate::pathmap::make_child_path;
use crate::util::{access_mask_from_bits, file_attr_from_stat, oflag_from_bits, retry_eintr};
use fuse3::FileType;
use fuse3::path::reply::FileAttr;
use nix::dir::Dir;
use nix::errno::Errno;
use nix::fcntl::{AtFlags, OFlag, open, openat, readlinkat, renameat};
use nix::sys::stat::{
    FchmodatFlags, Mode, SFlag, UtimensatFlags, fchmodat, fstatat, lstat, mkdirat, mknodat,
    utimensat,
};
use nix::sys::statvfs::{Statvfs, statvfs};
use nix::sys::time::TimeSpec;
use nix::sys::uio::{pread, pwrite};
use nix::unistd::{
    Gid, Uid, UnlinkatFlags, faccessat, fchownat, fdatasync, fsync, ftruncate, symlinkat, unlinkat,
};
use std::ffi::{OsStr, OsString};
use std::os::fd::AsFd;
use std::os::unix::ffi::OsStrExt;
use std::sync::Arc;
use tracing::{debug, error};

/// Permission bits used when an open carries no mode of its own.
pub const DEFAULT_FILE_MODE: u32 = 0o660;

#[derive(Debug, Clone)]
pub struct DirEntryInfo {
    pub name: OsString,
    pub kind: FileType,
    pub attr: FileAttr,
}

/// Metadata changes requested by a setattr; `None` leaves a field alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct AttrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeSpec>,
    pub mtime: Option<TimeSpec>,
}

#[derive(Debug)]
pub struct Passthrough {
    filter: Filter,
    handles: HandleTable,
}

impl Passthrough {
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            filter: Filter::new(config),
            handles: HandleTable::new(),
        }
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn lookup(&self, parent: &OsStr, name: &OsStr) -> FsResult<FileAttr> {
        let node = self.filter.resolve_child(parent, name)?;
        match stat_node(&node) {
            Ok(attr) => Ok(attr),
            Err(FsError::NotFound) => Err(FsError::NotFound),
            Err(err) => {
                error!(real_path = %node.real_path().display(), error = %err, "lookup stat failed");
                Err(FsError::Io(Errno::EIO))
            }
        }
    }

    /// Fresh attributes for `path`, or for the open handle when the kernel
    /// no longer has a path for it.
    pub fn getattr(&self, path: Option<&OsStr>, fh: Option<u64>) -> FsResult<FileAttr> {
        if let Some(path) = path {
            let node = self.filter.resolve(path)?;
            return stat_node(&node);
        }
        let handle = self.file_handle(fh.ok_or(FsError::NotFound)?)?;
        let stat = nix::sys::stat::fstat(handle.as_fd())?;
        Ok(file_attr_from_stat(&stat))
    }

    pub fn setattr(
        &self,
        path: Option<&OsStr>,
        fh: Option<u64>,
        changes: &AttrChanges,
    ) -> FsResult<FileAttr> {
        let handle = fh.and_then(|id| self.handles.get_file(id));
        let node = match (path, &handle) {
            (Some(path), _) => self.filter.resolve(path)?,
            (None, Some(handle)) => {
                self.filter.recheck(&handle.node)?;
                handle.node.clone()
            }
            (None, None) => return Err(FsError::NotFound),
        };
        let at = node.open_at()?;

        if let Some(mode) = changes.mode {
            fchmodat(
                at.dir_fd.as_fd(),
                at.name.as_c_str(),
                Mode::from_bits_truncate(mode),
                FchmodatFlags::FollowSymlink,
            )?;
        }

        if changes.uid.is_some() || changes.gid.is_some() {
            fchownat(
                at.dir_fd.as_fd(),
                at.name.as_c_str(),
                changes.uid.map(Uid::from_raw),
                changes.gid.map(Gid::from_raw),
                AtFlags::AT_SYMLINK_NOFOLLOW,
            )?;
        }

        if let Some(size) = changes.size {
            match &handle {
                Some(handle) => ftruncate(handle.as_fd(), size as i64)?,
                None => {
                    let file = openat(
                        at.dir_fd.as_fd(),
                        at.name.as_c_str(),
                        OFlag::O_WRONLY | OFlag::O_CLOEXEC,
                        Mode::empty(),
                    )?;
                    ftruncate(&file, size as i64)?;
                }
            }
        }

        if changes.atime.is_some() || changes.mtime.is_some() {
            utimensat(
                at.dir_fd.as_fd(),
                at.name.as_c_str(),
                &changes.atime.unwrap_or(TimeSpec::UTIME_OMIT),
                &changes.mtime.unwrap_or(TimeSpec::UTIME_OMIT),
                UtimensatFlags::NoFollowSymlink,
            )?;
        }

        stat_node(&node)
    }

    pub fn access(&self, path: &OsStr, mask: u32) -> FsResult<()> {
        let node = self.filter.resolve(path)?;
        let at = node.open_at()?;
        faccessat(
            at.dir_fd.as_fd(),
            at.name.as_c_str(),
            access_mask_from_bits(mask),
            AtFlags::empty(),
        )?;
        Ok(())
    }

    pub fn statfs(&self, path: &OsStr) -> FsResult<Statvfs> {
        let node = self.filter.resolve(path)?;
        Ok(statvfs(node.real_path())?)
    }

    pub fn readlink(&self, path: &OsStr) -> FsResult<OsString> {
        let node = self.filter.resolve(path)?;
        let at = node.open_at()?;
        let target = readlinkat(at.dir_fd.as_fd(), at.name.as_c_str())?;

        let translator = self.filter.translator();
        if let Some(view) = translator.stored_target_in_view(node.virtual_parent(), &target)
            && self.filter.is_hidden(&view)
        {
            debug!(link = %node.real_path().display(), "link target is hidden");
            return Err(FsError::Hidden);
        }
        Ok(translator.to_virtual_target(&target))
    }

    pub fn opendir(&self, path: &OsStr) -> FsResult<u64> {
        let node = self.filter.resolve(path)?;
        let entries = self.list(&node)?;
        Ok(self.handles.insert_dir(node, entries))
    }

    pub fn readdir(&self, fh: u64) -> FsResult<DirHandle> {
        let handle = self
            .handles
            .get_dir(fh)
            .ok_or(FsError::InvalidHandle(fh))?;
        self.filter.recheck(&handle.node)?;
        Ok(handle)
    }

    pub fn releasedir(&self, fh: u64) -> FsResult<()> {
        self.handles
            .remove(fh)
            .map(drop)
            .ok_or(FsError::InvalidHandle(fh))
    }

    /// Visible entries of a directory, sorted by name, without `.` and `..`.
    pub fn list(&self, node: &Node) -> FsResult<Vec<DirEntryInfo>> {
        let dir_fd = open(
            node.real_path(),
            OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;
        let mut dir = Dir::openat(
            dir_fd.as_fd(),
            ".",
            OFlag::O_RDONLY | OFlag::O_CLOEXEC,
            Mode::empty(),
        )?;

        let mut entries = Vec::new();
        for entry in dir.iter() {
            let entry = entry?;
            let name = entry.file_name();
            let bytes = name.to_bytes();
            if bytes == b"." || bytes == b".." {
                continue;
            }
            let name_os = OsStr::from_bytes(bytes);
            if self
                .filter
                .is_hidden(&make_child_path(node.virtual_path(), name_os))
            {
                continue;
            }
            // Entries removed since the listing started are skipped.
            let stat = match fstatat(dir_fd.as_fd(), name, AtFlags::AT_SYMLINK_NOFOLLOW) {
                Ok(stat) => stat,
                Err(err) => {
                    debug!(dir = %node.real_path().display(), name = %name_os.to_string_lossy(), error = %err, "skipping entry");
                    continue;
                }
            };
            let attr = file_attr_from_stat(&stat);
            entries.push(DirEntryInfo {
                name: name_os.to_os_string(),
                kind: attr.kind,
                attr,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub fn open(&self, path: &OsStr, flags: u32) -> FsResult<u64> {
        let node = self.filter.resolve(path)?;
        let at = node.open_at()?;
        let fd = openat(
            at.dir_fd.as_fd(),
            at.name.as_c_str(),
            oflag_from_bits(flags),
            Mode::from_bits_truncate(DEFAULT_FILE_MODE),
        )
        .inspect_err(|err| {
            debug!(real_path = %node.real_path().display(), flags, error = %err, "open failed");
        })?;
        Ok(self.handles.insert_file(node, fd))
    }

    pub fn create(
        &self,
        parent: &OsStr,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> FsResult<(u64, FileAttr)> {
        let node = self.filter.resolve_new(parent, name)?;
        let at = node.open_at()?;
        let fd = openat(
            at.dir_fd.as_fd(),
            at.name.as_c_str(),
            oflag_from_bits(flags) | OFlag::O_CREAT,
            Mode::from_bits_truncate(mode),
        )?;
        let attr = file_attr_from_stat(&nix::sys::stat::fstat(fd.as_fd())?);
        Ok((self.handles.insert_file(node, fd), attr))
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> FsResult<Vec<u8>> {
        let handle = self.file_handle(fh)?;
        let mut buf = vec![0u8; size as usize];
        let read_len = retry_eintr(|| pread(handle.as_fd(), &mut buf, offset as i64))?;
        buf.truncate(read_len);
        Ok(buf)
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> FsResult<u32> {
        let handle = self.file_handle(fh)?;
        let written = retry_eintr(|| pwrite(handle.as_fd(), data, offset as i64))?;
        Ok(written as u32)
    }

    pub fn fsync(&self, fh: u64, datasync: bool) -> FsResult<()> {
        let handle = self.file_handle(fh)?;
        if datasync {
            fdatasync(handle.as_fd())?;
        } else {
            fsync(handle.as_fd())?;
        }
        Ok(())
    }

    /// Flush and fallocate are deliberately not forwarded.
    pub fn unsupported_on_handle<T>(&self, fh: u64) -> FsResult<T> {
        self.file_handle(fh)?;
        Err(FsError::Unsupported)
    }

    /// Extended attributes are not forwarded.
    pub fn unsupported_on_path<T>(&self, path: &OsStr) -> FsResult<T> {
        self.filter.resolve(path)?;
        Err(FsError::Unsupported)
    }

    pub fn release(&self, fh: u64) -> FsResult<()> {
        match self.handles.remove(fh) {
            Some(_) => Ok(()),
            None => Err(FsError::InvalidHandle(fh)),
        }
    }

    /// Drops every outstanding handle; returns how many there were.
    pub fn release_all(&self) -> usize {
        self.handles.clear()
    }

    pub fn mkdir(&self, parent: &OsStr, name: &OsStr, mode: u32) -> FsResult<FileAttr> {
        let node = self.filter.resolve_new(parent, name)?;
        let at = node.open_at()?;
        mkdirat(
            at.dir_fd.as_fd(),
            at.name.as_c_str(),
            Mode::from_bits_truncate(mode),
        )?;
        stat_node(&node)
    }

    pub fn mknod(&self, parent: &OsStr, name: &OsStr, mode: u32, rdev: u32) -> FsResult<FileAttr> {
        let node = self.filter.resolve_new(parent, name)?;
        let at = node.open_at()?;
        mknodat(
            at.dir_fd.as_fd(),
            at.name.as_c_str(),
            SFlag::from_bits_truncate(mode),
            Mode::from_bits_truncate(mode),
            rdev as u64,
        )?;
        stat_node(&node)
    }

    pub fn symlink(&self, parent: &OsStr, name: &OsStr, target: &OsStr) -> FsResult<FileAttr> {
        let node = self.filter.resolve_new(parent, name)?;
        let translator = self.filter.translator();
        let stored = translator.to_real_target(target);
        if let Some(view) = translator.stored_target_in_view(parent, &stored)
            && self.filter.is_hidden(&view)
        {
            debug!(link = %node.real_path().display(), "symlink target is hidden");
            return Err(FsError::Hidden);
        }
        let at = node.open_at()?;
        symlinkat(stored.as_os_str(), at.dir_fd.as_fd(), at.name.as_c_str())?;
        stat_node(&node)
    }

    pub fn unlink(&self, parent: &OsStr, name: &OsStr) -> FsResult<()> {
        self.remove(parent, name, UnlinkatFlags::NoRemoveDir)
    }

    pub fn rmdir(&self, parent: &OsStr, name: &OsStr) -> FsResult<()> {
        self.remove(parent, name, UnlinkatFlags::RemoveDir)
    }

    pub fn rename(
        &self,
        origin_parent: &OsStr,
        origin_name: &OsStr,
        parent: &OsStr,
        name: &OsStr,
    ) -> FsResult<()> {
        let from = self.filter.resolve_child(origin_parent, origin_name)?;
        if from.virtual_path() == "/" {
            return Err(FsError::Io(Errno::EBUSY));
        }
        let to = self.filter.resolve_new(parent, name)?;
        let from_at = from.open_at()?;
        let to_at = to.open_at()?;
        renameat(
            from_at.dir_fd.as_fd(),
            from_at.name.as_c_str(),
            to_at.dir_fd.as_fd(),
            to_at.name.as_c_str(),
        )?;
        Ok(())
    }

    /// Hard links are never created through the view.
    pub fn link(&self, path: &OsStr, new_parent: &OsStr, new_name: &OsStr) -> FsResult<FileAttr> {
        self.filter.resolve(path)?;
        self.filter.resolve_new(new_parent, new_name)?;
        Err(FsError::Unsupported)
    }

    fn remove(&self, parent: &OsStr, name: &OsStr, flag: UnlinkatFlags) -> FsResult<()> {
        let node = self.filter.resolve_child(parent, name)?;
        let at = node.open_at()?;
        unlinkat(at.dir_fd.as_fd(), at.name.as_c_str(), flag)?;
        Ok(())
    }

    fn file_handle(&self, fh: u64) -> FsResult<FileHandle> {
        let handle = self
            .handles
            .get_file(fh)
            .ok_or(FsError::InvalidHandle(fh))?;
        self.filter.recheck(&handle.node)?;
        Ok(handle)
    }
}

fn stat_node(node: &Node) -> FsResult<FileAttr> {
    let stat = lstat(node.real_path())?;
    Ok(file_attr_from_stat(&stat))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hide::HideRules;
    use std::fs;
    use std::os::unix::fs::{MetadataExt, PermissionsExt, symlink};
    use std::path::Path;
    use std::thread;
    use tempfile::TempDir;

    const MOUNT: &str = "/mnt/view";

    /// Source tree:
    ///   app/main.js, app/node_modules/x.js, .git/config, docs/readme.txt
    fn setup() -> (TempDir, Passthrough) {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("app/node_modules")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join("docs")).unwrap();
        fs::write(root.join("app/main.js"), b"console.log('hi');\n").unwrap();
        fs::write(root.join("app/node_modules/x.js"), b"module.exports = 1;\n").unwrap();
        fs::write(root.join(".git/config"), b"[core]\n").unwrap();
        fs::write(root.join("docs/readme.txt"), b"0123456789").unwrap();

        let config = Config::new(
            root,
            Path::new(MOUNT),
            HideRules::parse("node_modules:.git"),
            false,
        )
        .unwrap();
        (dir, Passthrough::new(Arc::new(config)))
    }

    fn os(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    fn names(fs: &Passthrough, path: &str) -> Vec<String> {
        let fh = fs.opendir(os(path)).unwrap();
        let handle = fs.readdir(fh).unwrap();
        let names = handle
            .entries
            .iter()
            .map(|e| e.name.to_string_lossy().into_owned())
            .collect();
        fs.releasedir(fh).unwrap();
        names
    }

    #[test]
    fn listing_lookup_and_read_follow_the_hide_rules() {
        let (_dir, fs) = setup();

        assert_eq!(names(&fs, "/app"), vec!["main.js"]);
        assert!(matches!(
            fs.lookup(os("/app"), os("node_modules")),
            Err(FsError::Hidden)
        ));

        let attr = fs.lookup(os("/app"), os("main.js")).unwrap();
        assert_eq!(attr.kind, FileType::RegularFile);

        let fh = fs.open(os("/app/main.js"), libc::O_RDONLY as u32).unwrap();
        let data = fs.read(fh, 0, 4096).unwrap();
        assert_eq!(data, b"console.log('hi');\n");
        fs.release(fh).unwrap();
    }

    #[test]
    fn hidden_directories_never_show_up_in_listings() {
        let (_dir, fs) = setup();
        assert_eq!(names(&fs, "/"), vec!["app", "docs"]);
    }

    #[test]
    fn listing_reports_entry_kinds() {
        let (_dir, fs) = setup();
        let fh = fs.opendir(os("/")).unwrap();
        let handle = fs.readdir(fh).unwrap();
        assert!(handle.entries.iter().all(|e| e.kind == FileType::Directory));
        let fh2 = fs.opendir(os("/docs")).unwrap();
        let docs = fs.readdir(fh2).unwrap();
        assert_eq!(docs.entries[0].kind, FileType::RegularFile);
        assert_eq!(docs.entries[0].attr.size, 10);
    }

    #[test]
    fn every_read_like_operation_on_a_hidden_path_reports_missing() {
        let (dir, fs) = setup();
        let hidden = os("/app/node_modules/x.js");

        assert!(matches!(fs.getattr(Some(hidden), None), Err(FsError::Hidden)));
        assert!(matches!(fs.open(hidden, libc::O_RDONLY as u32), Err(FsError::Hidden)));
        assert!(matches!(fs.opendir(os("/.git")), Err(FsError::Hidden)));
        assert!(matches!(fs.readlink(hidden), Err(FsError::Hidden)));
        assert!(matches!(fs.access(hidden, 0), Err(FsError::Hidden)));
        assert!(matches!(fs.statfs(os("/.git")), Err(FsError::Hidden)));
        assert!(matches!(fs.unsupported_on_path::<()>(hidden), Err(FsError::Hidden)));
        assert!(matches!(
            fs.setattr(Some(hidden), None, &AttrChanges { mode: Some(0o600), ..Default::default() }),
            Err(FsError::Hidden)
        ));
        assert!(matches!(fs.unlink(os("/app/node_modules"), os("x.js")), Err(FsError::Hidden)));
        assert!(matches!(fs.rmdir(os("/"), os(".git")), Err(FsError::Hidden)));

        for err in [
            fs.getattr(Some(hidden), None).unwrap_err(),
            fs.unlink(os("/"), os(".git")).unwrap_err(),
        ] {
            assert_eq!(err.errno(), libc::ENOENT);
        }

        // Nothing was touched underneath.
        assert!(dir.path().join("app/node_modules/x.js").exists());
        assert!(dir.path().join(".git/config").exists());
        let mode = fs::metadata(dir.path().join("app/node_modules/x.js")).unwrap().mode();
        assert_ne!(mode & 0o777, 0o600);
    }

    #[test]
    fn creating_a_hidden_name_is_denied() {
        let (dir, fs) = setup();

        assert!(matches!(fs.mkdir(os("/app"), os(".git"), 0o755), Err(FsError::HiddenDestination)));
        assert!(matches!(
            fs.create(os("/"), os("node_modules"), 0o644, libc::O_WRONLY as u32),
            Err(FsError::HiddenDestination)
        ));
        assert!(matches!(
            fs.mknod(os("/docs"), os(".git"), libc::S_IFREG | 0o644, 0),
            Err(FsError::HiddenDestination)
        ));
        assert!(matches!(
            fs.symlink(os("/docs"), os("node_modules"), os("readme.txt")),
            Err(FsError::HiddenDestination)
        ));
        assert_eq!(
            fs.mkdir(os("/app"), os(".git"), 0o755).unwrap_err().errno(),
            libc::EPERM
        );
        assert!(!dir.path().join("app/.git").exists());
        assert!(!dir.path().join("docs/.git").exists());

        // Under a hidden parent the parent itself does not exist.
        assert!(matches!(
            fs.mkdir(os("/app/node_modules"), os("sub"), 0o755),
            Err(FsError::Hidden)
        ));
    }

    #[test]
    fn getattr_is_never_cached() {
        let (dir, fs) = setup();
        let real = dir.path().join("docs/readme.txt");

        let before = fs.getattr(Some(os("/docs/readme.txt")), None).unwrap();
        assert_eq!(before.size, 10);

        fs::write(&real, b"a much longer body than before").unwrap();
        let after = fs.getattr(Some(os("/docs/readme.txt")), None).unwrap();
        let meta = fs::symlink_metadata(&real).unwrap();
        assert_eq!(after.size, meta.len());
        assert_eq!(after.nlink as u64, meta.nlink());
        assert_eq!(after.uid, meta.uid());
        assert_eq!(u32::from(after.perm), meta.mode() & 0o7777);
    }

    #[test]
    fn write_then_read_on_the_same_handle() {
        let (dir, fs) = setup();
        let fh = fs.open(os("/docs/readme.txt"), libc::O_RDWR as u32).unwrap();

        assert_eq!(fs.write(fh, 4, b"WXYZ").unwrap(), 4);
        assert_eq!(fs.read(fh, 4, 4).unwrap(), b"WXYZ");
        assert_eq!(fs.read(fh, 0, 64).unwrap(), b"0123WXYZ89");
        fs.fsync(fh, true).unwrap();
        fs.release(fh).unwrap();

        assert_eq!(fs::read(dir.path().join("docs/readme.txt")).unwrap(), b"0123WXYZ89");
    }

    #[test]
    fn closed_handles_are_bad_descriptors() {
        let (_dir, fs) = setup();
        assert!(matches!(fs.read(42, 0, 1), Err(FsError::InvalidHandle(42))));
        assert_eq!(fs.write(42, 0, b"x").unwrap_err().errno(), libc::EBADF);

        let fh = fs.open(os("/docs/readme.txt"), libc::O_RDONLY as u32).unwrap();
        fs.release(fh).unwrap();
        assert!(matches!(fs.read(fh, 0, 1), Err(FsError::InvalidHandle(_))));
        assert!(matches!(fs.release(fh), Err(FsError::InvalidHandle(_))));

        // A directory handle is not a file handle.
        let dh = fs.opendir(os("/docs")).unwrap();
        assert!(matches!(fs.read(dh, 0, 1), Err(FsError::InvalidHandle(_))));
    }

    #[test]
    fn concurrent_opens_get_independent_handles() {
        let (dir, fs) = setup();
        let body: Vec<u8> = (0..64 * 1024).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join("docs/big.bin"), &body).unwrap();

        let fs = Arc::new(fs);
        let body = Arc::new(body);
        let workers: Vec<_> = (0..2)
            .map(|worker| {
                let fs = Arc::clone(&fs);
                let body = Arc::clone(&body);
                thread::spawn(move || {
                    let fh = fs.open(os("/docs/big.bin"), libc::O_RDONLY as u32).unwrap();
                    for round in 0..64u64 {
                        let offset = ((round * 997 + worker * 4096) % (60 * 1024)) as usize;
                        let data = fs.read(fh, offset as u64, 1024).unwrap();
                        assert_eq!(data, body[offset..offset + 1024]);
                    }
                    fh
                })
            })
            .collect();
        let handles: Vec<u64> = workers.into_iter().map(|w| w.join().unwrap()).collect();
        assert_ne!(handles[0], handles[1]);

        // Releasing one caller's handle leaves the other usable.
        fs.release(handles[0]).unwrap();
        assert_eq!(fs.read(handles[1], 0, 3).unwrap(), body[..3]);
        assert_eq!(fs.release_all(), 1);
    }

    #[test]
    fn readlink_maps_the_source_root_onto_the_mount() {
        let (dir, fs) = setup();
        let root = dir.path();
        symlink(root.join("app/main.js"), root.join("docs/inside")).unwrap();
        symlink("/usr/share/dict/words", root.join("docs/outside")).unwrap();
        symlink("../app/main.js", root.join("docs/relative")).unwrap();

        assert_eq!(
            fs.readlink(os("/docs/inside")).unwrap(),
            OsString::from(format!("{MOUNT}/app/main.js"))
        );
        assert_eq!(
            fs.readlink(os("/docs/outside")).unwrap(),
            OsString::from("/usr/share/dict/words")
        );
        assert_eq!(
            fs.readlink(os("/docs/relative")).unwrap(),
            OsString::from("../app/main.js")
        );
        assert_eq!(
            fs.getattr(Some(os("/docs/inside")), None).unwrap().kind,
            FileType::Symlink
        );
    }

    #[test]
    fn readlink_never_reveals_a_hidden_target() {
        let (dir, fs) = setup();
        let root = dir.path();
        symlink(root.join(".git/config"), root.join("docs/abs")).unwrap();
        symlink("../app/node_modules/x.js", root.join("docs/rel")).unwrap();

        assert!(matches!(fs.readlink(os("/docs/abs")), Err(FsError::Hidden)));
        assert!(matches!(fs.readlink(os("/docs/rel")), Err(FsError::Hidden)));
    }

    #[test]
    fn symlink_targets_round_trip_through_the_source() {
        let (dir, fs) = setup();
        let target = format!("{MOUNT}/app/main.js");

        let attr = fs.symlink(os("/docs"), os("link"), os(&target)).unwrap();
        assert_eq!(attr.kind, FileType::Symlink);
        assert_eq!(
            fs::read_link(dir.path().join("docs/link")).unwrap(),
            dir.path().join("app/main.js")
        );
        assert_eq!(fs.readlink(os("/docs/link")).unwrap(), OsString::from(target));

        assert!(matches!(
            fs.symlink(os("/docs"), os("sneaky"), os("../.git/config")),
            Err(FsError::Hidden)
        ));
        assert!(!dir.path().join("docs/sneaky").exists());

        let hidden_in_source = dir.path().join(".git/config");
        assert!(matches!(
            fs.symlink(os("/docs"), os("direct"), hidden_in_source.as_os_str()),
            Err(FsError::Hidden)
        ));
        let hidden_in_mount = format!("{MOUNT}/app/node_modules/x.js");
        assert!(matches!(
            fs.symlink(os("/docs"), os("viamount"), os(&hidden_in_mount)),
            Err(FsError::Hidden)
        ));
        assert!(fs::symlink_metadata(dir.path().join("docs/direct")).is_err());
        assert!(fs::symlink_metadata(dir.path().join("docs/viamount")).is_err());
    }

    #[test]
    fn source_given_with_a_trailing_slash_still_rewrites_links() {
        let (dir, _) = setup();
        std::os::unix::fs::symlink(dir.path().join(".git/config"), dir.path().join("docs/abs"))
            .unwrap();
        std::os::unix::fs::symlink(dir.path().join("docs"), dir.path().join("docs/inside"))
            .unwrap();
        let source = format!("{}/", dir.path().display());
        let config = Config::new(
            Path::new(&source),
            Path::new(MOUNT),
            HideRules::parse("node_modules:.git"),
            false,
        )
        .unwrap();
        let fs = Passthrough::new(Arc::new(config));

        assert!(matches!(fs.readlink(os("/docs/abs")), Err(FsError::Hidden)));
        assert_eq!(
            fs.readlink(os("/docs/inside")).unwrap(),
            OsString::from(format!("{MOUNT}/docs"))
        );
    }

    #[test]
    fn relative_links_leaving_the_source_are_returned_verbatim() {
        let (dir, fs) = setup();
        let target = "../../../elsewhere/node_modules/x";
        std::os::unix::fs::symlink(target, dir.path().join("docs/out")).unwrap();
        assert_eq!(fs.readlink(os("/docs/out")).unwrap(), OsString::from(target));
    }

    #[test]
    fn rename_into_a_hidden_name_is_denied() {
        let (dir, fs) = setup();
        let err = fs
            .rename(os("/docs"), os("readme.txt"), os("/docs"), os("node_modules"))
            .unwrap_err();
        assert!(matches!(err, FsError::HiddenDestination));
        assert_eq!(err.errno(), libc::EPERM);
        assert!(dir.path().join("docs/readme.txt").exists());

        assert!(matches!(
            fs.rename(os("/app"), os("node_modules"), os("/app"), os("deps")),
            Err(FsError::Hidden)
        ));
        assert!(dir.path().join("app/node_modules").exists());
    }

    #[test]
    fn rename_moves_into_the_destination_parent() {
        let (dir, fs) = setup();
        fs.rename(os("/docs"), os("readme.txt"), os("/app"), os("README")).unwrap();
        assert!(!dir.path().join("docs/readme.txt").exists());
        assert_eq!(fs::read(dir.path().join("app/README")).unwrap(), b"0123456789");

        assert!(matches!(
            fs.rename(os("/"), os(""), os("/app"), os("root")),
            Err(FsError::Io(Errno::EBUSY))
        ));
    }

    #[test]
    fn create_mkdir_and_remove_are_forwarded() {
        let (dir, fs) = setup();

        let attr = fs.mkdir(os("/docs"), os("sub"), 0o750).unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert!(dir.path().join("docs/sub").is_dir());

        let (fh, attr) = fs
            .create(os("/docs/sub"), os("new.txt"), 0o640, libc::O_RDWR as u32)
            .unwrap();
        assert_eq!(attr.size, 0);
        fs.write(fh, 0, b"fresh").unwrap();
        fs.release(fh).unwrap();
        assert_eq!(fs::read(dir.path().join("docs/sub/new.txt")).unwrap(), b"fresh");

        let attr = fs.mknod(os("/docs"), os("fifo"), libc::S_IFIFO | 0o600, 0).unwrap();
        assert_eq!(attr.kind, FileType::NamedPipe);

        assert!(matches!(
            fs.rmdir(os("/docs"), os("sub")),
            Err(FsError::Io(Errno::ENOTEMPTY))
        ));
        fs.unlink(os("/docs/sub"), os("new.txt")).unwrap();
        fs.rmdir(os("/docs"), os("sub")).unwrap();
        fs.unlink(os("/docs"), os("fifo")).unwrap();
        assert!(!dir.path().join("docs/sub").exists());
        assert!(matches!(fs.unlink(os("/docs"), os("fifo")), Err(FsError::NotFound)));
    }

    #[test]
    fn setattr_changes_mode_size_and_times() {
        let (dir, fs) = setup();
        let real = dir.path().join("docs/readme.txt");
        let changes = AttrChanges {
            mode: Some(0o600),
            size: Some(4),
            atime: Some(TimeSpec::new(1_000_000, 0)),
            mtime: Some(TimeSpec::new(2_000_000, 500)),
            ..Default::default()
        };

        let attr = fs.setattr(Some(os("/docs/readme.txt")), None, &changes).unwrap();
        assert_eq!(attr.size, 4);
        let meta = fs::metadata(&real).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        assert_eq!(meta.mtime(), 2_000_000);
        assert_eq!(meta.atime(), 1_000_000);
        assert_eq!(fs::read(&real).unwrap(), b"0123");
    }

    #[test]
    fn setattr_truncates_through_an_open_handle() {
        let (dir, fs) = setup();
        let fh = fs.open(os("/docs/readme.txt"), libc::O_RDWR as u32).unwrap();
        let changes = AttrChanges {
            size: Some(2),
            ..Default::default()
        };
        fs.setattr(None, Some(fh), &changes).unwrap();
        assert_eq!(fs::read(dir.path().join("docs/readme.txt")).unwrap(), b"01");
        assert_eq!(fs.getattr(None, Some(fh)).unwrap().size, 2);
    }

    #[test]
    fn missing_entries_and_unsupported_operations() {
        let (_dir, fs) = setup();
        assert!(matches!(fs.lookup(os("/docs"), os("nope")), Err(FsError::NotFound)));
        assert!(matches!(
            fs.link(os("/docs/readme.txt"), os("/docs"), os("hard")),
            Err(FsError::Unsupported)
        ));
        assert!(matches!(
            fs.link(os("/.git/config"), os("/docs"), os("hard")),
            Err(FsError::Hidden)
        ));
        assert!(matches!(
            fs.unsupported_on_path::<()>(os("/docs/readme.txt")),
            Err(FsError::Unsupported)
        ));
        let fh = fs.open(os("/docs/readme.txt"), libc::O_RDONLY as u32).unwrap();
        assert!(matches!(fs.unsupported_on_handle::<()>(fh), Err(FsError::Unsupported)));
    }

    #[test]
    fn access_and_statfs_reach_the_store() {
        let (_dir, fs) = setup();
        fs.access(os("/docs/readme.txt"), libc::R_OK as u32).unwrap();
        assert!(matches!(fs.access(os("/docs/none"), libc::F_OK as u32), Err(FsError::NotFound)));
        let stats = fs.statfs(os("/")).unwrap();
        assert!(stats.blocks() > 0);
    }
}
