use crate::error::ConfigError;
use crate::hide::HideRules;
use crate::pathmap::PathTranslator;
use nix::sys::stat::{SFlag, stat};
use std::path::{Path, PathBuf};

/// Startup configuration; built once and shared read-only afterwards.
#[derive(Debug)]
pub struct Config {
    pub translator: PathTranslator,
    pub hide: HideRules,
    pub allow_other: bool,
}

impl Config {
    pub fn new(
        source: &Path,
        mountpoint: &Path,
        hide: HideRules,
        allow_other: bool,
    ) -> Result<Self, ConfigError> {
        let source = absolute(source)?;
        let mountpoint = absolute(mountpoint)?;

        let st = stat(&source).map_err(|source_err| ConfigError::Stat {
            path: source.clone(),
            source: source_err,
        })?;
        if SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT != SFlag::S_IFDIR {
            return Err(ConfigError::NotADirectory(source));
        }

        Ok(Self {
            translator: PathTranslator::new(source, mountpoint),
            hide,
            allow_other,
        })
    }

    pub fn source_root(&self) -> &Path {
        self.translator.source_root()
    }

    pub fn mount_root(&self) -> &Path {
        self.translator.mount_root()
    }
}

/// Absolute form of `path` with trailing and repeated separators dropped.
fn absolute(path: &Path) -> Result<PathBuf, ConfigError> {
    std::path::absolute(path)
        .map(|abs| abs.components().collect())
        .map_err(|source| ConfigError::Resolve {
            path: path.to_path_buf(),
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_a_source_that_is_not_a_directory() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("plain");
        std::fs::write(&file, b"x").unwrap();

        let err = Config::new(&file, dir.path(), HideRules::default(), false).unwrap_err();
        assert!(matches!(err, ConfigError::NotADirectory(_)));

        let missing = dir.path().join("missing");
        let err = Config::new(&missing, dir.path(), HideRules::default(), false).unwrap_err();
        assert!(matches!(err, ConfigError::Stat { .. }));
    }

    #[test]
    fn relative_roots_are_made_absolute() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::new(
            dir.path(),
            Path::new("relative-mount"),
            HideRules::default(),
            true,
        )
        .unwrap();
        assert!(config.mount_root().is_absolute());
        assert!(config.mount_root().ends_with("relative-mount"));
        assert_eq!(config.source_root(), dir.path());
        assert!(config.allow_other);
    }

    #[test]
    fn trailing_separators_are_dropped_from_roots() {
        let dir = tempfile::tempdir().unwrap();
        let source = format!("{}/", dir.path().display());
        let config = Config::new(
            Path::new(&source),
            Path::new("/mnt/view//"),
            HideRules::default(),
            false,
        )
        .unwrap();
        assert_eq!(config.source_root().as_os_str(), dir.path().as_os_str());
        assert_eq!(config.mount_root().as_os_str(), "/mnt/view");
    }
}
