use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Which numbered subdirectory of the base holds the active binlog.
pub type Version = u32;

const VERSION_FILENAME: &str = "version";

/// Path of the sentinel file naming the active version.
pub fn version_file_path(base: &Path) -> PathBuf {
    base.join(VERSION_FILENAME)
}

/// Path of a version's directory under the base.
pub fn version_dir(base: &Path, version: Version) -> PathBuf {
    base.join(version.to_string())
}

/// Reads the active version from the sentinel file. Missing or unparseable
/// sentinels read as none; the caller falls back to version zero.
pub fn read_version(base: &Path) -> Option<Version> {
    let text = fs::read_to_string(version_file_path(base)).ok()?;
    text.trim().parse().ok()
}

/// Updates the sentinel atomically: write a temp file, rename it over the
/// sentinel.
pub fn write_version(base: &Path, version: Version) -> io::Result<()> {
    fs::create_dir_all(base)?;
    let tmp = base.join(format!("{VERSION_FILENAME}.tmp"));
    {
        let mut file = fs::File::create(&tmp)?;
        write!(file, "{version}")?;
        file.flush()?;
    }
    fs::rename(&tmp, version_file_path(base))
}

/// The smallest non-negative integer not present as a subdirectory of the
/// base.
pub fn find_available_version(base: &Path) -> Version {
    let mut taken = BTreeSet::new();
    if let Ok(entries) = fs::read_dir(base) {
        for entry in entries.flatten() {
            let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if !is_dir {
                continue;
            }
            if let Some(version) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<Version>().ok())
            {
                taken.insert(version);
            }
        }
    }
    let mut result = 0;
    for version in taken {
        if version != result {
            break;
        }
        result += 1;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_roundtrip() {
        let dir = TempDir::new().unwrap();
        assert_eq!(read_version(dir.path()), None);
        write_version(dir.path(), 3).unwrap();
        assert_eq!(read_version(dir.path()), Some(3));
        write_version(dir.path(), 0).unwrap();
        assert_eq!(read_version(dir.path()), Some(0));
    }

    #[test]
    fn test_write_creates_base() {
        let dir = TempDir::new().unwrap();
        let base = dir.path().join("nested/cache");
        write_version(&base, 1).unwrap();
        assert_eq!(read_version(&base), Some(1));
    }

    #[test]
    fn test_garbage_sentinel_reads_as_none() {
        let dir = TempDir::new().unwrap();
        fs::write(version_file_path(dir.path()), "not a number").unwrap();
        assert_eq!(read_version(dir.path()), None);
    }

    #[test]
    fn test_find_available_skips_taken() {
        let dir = TempDir::new().unwrap();
        assert_eq!(find_available_version(dir.path()), 0);

        fs::create_dir(version_dir(dir.path(), 0)).unwrap();
        fs::create_dir(version_dir(dir.path(), 1)).unwrap();
        fs::create_dir(version_dir(dir.path(), 3)).unwrap();
        // The sentinel file must not count as a taken version.
        write_version(dir.path(), 0).unwrap();
        assert_eq!(find_available_version(dir.path()), 2);
    }
}
