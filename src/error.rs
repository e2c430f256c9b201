use std::fmt::Display;
use std::path::{Path, PathBuf};

/// Embercache errors. Every file-related error carries the path it happened
/// on, so callers can tell the binlog apart from a data file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Error {
    /// A read, write, rename or unlink failed, or the file was unusable.
    Io(PathBuf),
    /// The advisory lock on the file could not be acquired. Another instance
    /// of the store owns the directory.
    LockFailed(PathBuf),
    /// The file header did not verify against the provided encryption key.
    WrongKey(PathBuf),
    /// The settings failed validation, typically a zero or out-of-range limit.
    InvalidConfig(String),
}

impl Error {
    pub fn io(path: impl Into<PathBuf>) -> Self {
        Error::Io(path.into())
    }

    /// The path the error refers to, if any.
    pub fn path(&self) -> Option<&Path> {
        match self {
            Error::Io(path) | Error::LockFailed(path) | Error::WrongKey(path) => Some(path),
            Error::InvalidConfig(_) => None,
        }
    }
}

impl std::error::Error for Error {}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Io(path) => write!(f, "io error: {}", path.display()),
            Error::LockFailed(path) => write!(f, "lock failed: {}", path.display()),
            Error::WrongKey(path) => write!(f, "wrong key: {}", path.display()),
            Error::InvalidConfig(msg) => write!(f, "invalid config: {msg}"),
        }
    }
}

/// An embercache Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_includes_path() {
        let error = Error::WrongKey(PathBuf::from("/tmp/cache/0/binlog"));
        assert_eq!(error.to_string(), "wrong key: /tmp/cache/0/binlog");
        assert_eq!(error.path(), Some(Path::new("/tmp/cache/0/binlog")));
    }

    #[test]
    fn test_invalid_config_has_no_path() {
        let error = Error::InvalidConfig("maxDataSize must be positive".into());
        assert_eq!(error.path(), None);
    }
}
