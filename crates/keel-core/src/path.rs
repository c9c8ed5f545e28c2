//! Remote path handling
//!
//! Remote paths are absolute, `/`-separated and never end in a slash (the
//! backend rejects trailing slashes). The store host maps them onto a local
//! directory with [`safe_path`], which refuses anything that could escape it.

use std::path::{Component, Path, PathBuf};

use crate::crypto;
use crate::error::{ErrorKind, ProtocolError};
use crate::{MAX_FILENAME_LEN, MAX_PATH_LEN};

/// Strip trailing slashes, keeping a lone `/`
pub fn normalize(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

/// Check that a remote path is absolute and within protocol limits
pub fn validate(path: &str) -> Result<(), ErrorKind> {
    if path.is_empty() || !path.starts_with('/') {
        return Err(ErrorKind::InvalidArgument);
    }
    if path.contains('\0') || path.len() > MAX_PATH_LEN {
        return Err(ErrorKind::InvalidArgument);
    }
    if path.split('/').any(|name| name.len() > MAX_FILENAME_LEN) {
        return Err(ErrorKind::InvalidArgument);
    }
    Ok(())
}

/// Validate and normalize in one step
pub fn clean(path: &str) -> Result<String, ErrorKind> {
    validate(path)?;
    Ok(normalize(path))
}

/// Split a normalized path into parent collection and leaf name
pub fn split(path: &str) -> (&str, &str) {
    match path.rfind('/') {
        Some(0) => ("/", &path[1..]),
        Some(i) => (&path[..i], &path[i + 1..]),
        None => ("", path),
    }
}

/// Join a collection path and a child name
pub fn join(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

/// Stable inode number for a remote path.
///
/// Deterministic across calls and processes; not guaranteed unique.
pub fn inode_for(path: &str) -> u64 {
    let hash = crypto::checksum(path.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&hash[..8]);
    // 0-2 are reserved (2 is the storage root)
    u64::from_le_bytes(bytes).max(3)
}

/// Resolve a remote path to a location inside `base`.
///
/// Rejects `..`, NUL bytes and over-long names. `.` components are dropped.
/// Works on paths that do not exist yet.
pub fn safe_path(base: &Path, remote: &str) -> Result<PathBuf, ProtocolError> {
    if remote.contains('\0') {
        return Err(ProtocolError::PathRejected("path contains null byte".into()));
    }

    if remote.len() > MAX_PATH_LEN {
        return Err(ProtocolError::PathRejected(format!(
            "path too long: {} bytes (max {})",
            remote.len(),
            MAX_PATH_LEN
        )));
    }

    let mut result = base.to_path_buf();

    for component in Path::new(remote).components() {
        match component {
            Component::Normal(name) => {
                let name_str = name.to_string_lossy();
                if name_str.len() > MAX_FILENAME_LEN {
                    return Err(ProtocolError::PathRejected(format!(
                        "filename too long: {} bytes (max {})",
                        name_str.len(),
                        MAX_FILENAME_LEN
                    )));
                }
                result.push(name);
            }
            Component::RootDir | Component::CurDir => {}
            Component::ParentDir => {
                return Err(ProtocolError::PathRejected(
                    "parent directory (..) not allowed".into(),
                ));
            }
            Component::Prefix(_) => {
                return Err(ProtocolError::PathRejected("path prefixes not allowed".into()));
            }
        }
    }

    if !result.starts_with(base) {
        return Err(ProtocolError::PathRejected("path escapes store root".into()));
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_trailing_slashes() {
        assert_eq!(normalize("/zone/home/"), "/zone/home");
        assert_eq!(normalize("/zone/home///"), "/zone/home");
        assert_eq!(normalize("/zone/home"), "/zone/home");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize("///"), "/");
    }

    #[test]
    fn test_validate() {
        assert!(validate("/zone/file").is_ok());
        assert_eq!(validate(""), Err(ErrorKind::InvalidArgument));
        assert_eq!(validate("relative/file"), Err(ErrorKind::InvalidArgument));
        assert_eq!(validate("/bad\0name"), Err(ErrorKind::InvalidArgument));

        let long_name = format!("/{}", "a".repeat(MAX_FILENAME_LEN + 1));
        assert_eq!(validate(&long_name), Err(ErrorKind::InvalidArgument));
    }

    #[test]
    fn test_split_and_join() {
        assert_eq!(split("/zone/home/file"), ("/zone/home", "file"));
        assert_eq!(split("/file"), ("/", "file"));
        assert_eq!(join("/zone", "file"), "/zone/file");
        assert_eq!(join("/", "file"), "/file");
    }

    #[test]
    fn test_inode_is_stable() {
        assert_eq!(inode_for("/zone/a"), inode_for("/zone/a"));
        assert_ne!(inode_for("/zone/a"), inode_for("/zone/b"));
        assert!(inode_for("/") > 2);
    }

    #[test]
    fn test_safe_path() {
        let base = PathBuf::from("/srv/store");
        assert_eq!(
            safe_path(&base, "/zone/file.txt").unwrap(),
            PathBuf::from("/srv/store/zone/file.txt")
        );
        assert_eq!(safe_path(&base, "/").unwrap(), base);
        assert_eq!(
            safe_path(&base, "/zone/./file").unwrap(),
            PathBuf::from("/srv/store/zone/file")
        );
        assert!(safe_path(&base, "/zone/../../etc/passwd").is_err());
        assert!(safe_path(&base, "/file\0.txt").is_err());
    }
}
