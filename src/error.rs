use nix::errno::Errno;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Failure kinds of the filtered view.
///
/// Every failure is translated into one of these at the point of detection
/// and reaches the kernel through [`FsError::errno`] unchanged.
#[derive(Debug, Error)]
pub enum FsError {
    /// The target matches a hide rule.
    #[error("entry is hidden")]
    Hidden,
    /// The new side of a create or rename matches a hide rule.
    #[error("destination is hidden")]
    HiddenDestination,
    #[error("no such entry")]
    NotFound,
    #[error("underlying call failed: {0}")]
    Io(Errno),
    #[error("no open handle {0}")]
    InvalidHandle(u64),
    #[error("operation not supported")]
    Unsupported,
}

impl FsError {
    pub fn from_errno(errno: Errno) -> Self {
        match errno {
            Errno::ENOENT => FsError::NotFound,
            other => FsError::Io(other),
        }
    }

    pub fn errno(&self) -> i32 {
        match self {
            FsError::Hidden | FsError::NotFound => libc::ENOENT,
            FsError::HiddenDestination => libc::EPERM,
            FsError::Io(errno) => *errno as i32,
            FsError::InvalidHandle(_) => libc::EBADF,
            FsError::Unsupported => libc::ENOSYS,
        }
    }

    /// Hidden and missing entries are routine; anything else is worth a warning.
    pub fn is_expected(&self) -> bool {
        matches!(
            self,
            FsError::Hidden | FsError::HiddenDestination | FsError::NotFound | FsError::Unsupported
        )
    }
}

impl From<Errno> for FsError {
    fn from(value: Errno) -> Self {
        FsError::from_errno(value)
    }
}

impl From<io::Error> for FsError {
    fn from(value: io::Error) -> Self {
        let errno = value
            .raw_os_error()
            .map(Errno::from_raw)
            .unwrap_or(Errno::EIO);
        FsError::from_errno(errno)
    }
}

impl From<FsError> for fuse3::Errno {
    fn from(value: FsError) -> Self {
        fuse3::Errno::from(value.errno())
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot resolve {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot stat source {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: Errno,
    },
    #[error("source {0} is not a directory")]
    NotADirectory(PathBuf),
}
