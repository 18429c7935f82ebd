use std::ffi::{OsStr, OsString};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

/// Maps virtual (mounted) paths onto the source tree and back.
///
/// Both roots are absolute. Mapping is plain suffix concatenation; no
/// normalization happens beyond what the underlying store does itself.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    source_root: PathBuf,
    mount_root: PathBuf,
}

impl PathTranslator {
    pub fn new(source_root: impl Into<PathBuf>, mount_root: impl Into<PathBuf>) -> Self {
        Self {
            source_root: source_root.into(),
            mount_root: mount_root.into(),
        }
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    /// Real path of a virtual path as handed out by the kernel (`/` or `/a/b`).
    pub fn real_path(&self, virtual_path: &OsStr) -> PathBuf {
        let suffix = match virtual_path.as_bytes() {
            b"/" | b"" => &[][..],
            other => other,
        };
        PathBuf::from(OsString::from_vec(join_root(
            self.source_root.as_os_str().as_bytes(),
            suffix,
        )))
    }

    /// Rewrites a link target read from the source tree so it points into the mount.
    /// Targets outside the source root come back unchanged.
    pub fn to_virtual_target(&self, target: &OsStr) -> OsString {
        rewrite_root(target, &self.source_root, &self.mount_root)
    }

    /// Inverse of [`to_virtual_target`](Self::to_virtual_target), for targets
    /// supplied by clients of the mount.
    pub fn to_real_target(&self, target: &OsStr) -> OsString {
        rewrite_root(target, &self.mount_root, &self.source_root)
    }

    /// Virtual path named by a link target as stored in the source tree,
    /// with `.` and `..` folded lexically. `None` when the target leaves the
    /// source tree.
    pub fn stored_target_in_view(&self, link_parent: &OsStr, target: &OsStr) -> Option<OsString> {
        resolve_target(link_parent, target, &self.source_root)
    }
}

fn rewrite_root(target: &OsStr, from: &Path, to: &Path) -> OsString {
    match strip_root(target.as_bytes(), from.as_os_str().as_bytes()) {
        Some(suffix) => OsString::from_vec(join_root(to.as_os_str().as_bytes(), suffix)),
        None => target.to_os_string(),
    }
}

fn resolve_target(link_parent: &OsStr, target: &OsStr, root: &Path) -> Option<OsString> {
    let bytes = target.as_bytes();
    if bytes.first() == Some(&b'/') {
        let suffix = strip_root(bytes, root.as_os_str().as_bytes())?;
        return fold_segments(b"/", suffix);
    }
    fold_segments(link_parent.as_bytes(), bytes)
}

/// Appends `rel` to the virtual directory `base`, resolving `.` and `..`.
/// Climbing above the view root yields `None`.
fn fold_segments(base: &[u8], rel: &[u8]) -> Option<OsString> {
    let mut segments: Vec<&[u8]> = Vec::new();
    for segment in base.split(|b| *b == b'/').chain(rel.split(|b| *b == b'/')) {
        match segment {
            b"" | b"." => {}
            b".." => {
                segments.pop()?;
            }
            name => segments.push(name),
        }
    }
    let mut folded = Vec::new();
    for segment in &segments {
        folded.push(b'/');
        folded.extend_from_slice(segment);
    }
    if folded.is_empty() {
        folded.push(b'/');
    }
    Some(OsString::from_vec(folded))
}

/// Suffix of `path` below `root`, starting with `/` (or empty for the root itself).
fn strip_root<'a>(path: &'a [u8], root: &[u8]) -> Option<&'a [u8]> {
    if root == b"/" {
        return (path.first() == Some(&b'/')).then_some(path);
    }
    let rest = path.strip_prefix(root)?;
    if rest.is_empty() || rest[0] == b'/' {
        Some(rest)
    } else {
        None
    }
}

fn join_root(root: &[u8], suffix: &[u8]) -> Vec<u8> {
    if suffix.is_empty() {
        return root.to_vec();
    }
    if root == b"/" {
        return suffix.to_vec();
    }
    let mut joined = Vec::with_capacity(root.len() + suffix.len());
    joined.extend_from_slice(root);
    joined.extend_from_slice(suffix);
    joined
}

pub fn make_child_path(parent: &OsStr, name: &OsStr) -> OsString {
    if parent == OsStr::new("/") {
        let mut composed = OsString::from("/");
        composed.push(name);
        composed
    } else {
        let mut composed = OsString::from(parent);
        composed.push(OsStr::new("/"));
        composed.push(name);
        composed
    }
}
