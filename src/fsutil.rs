use crate::errof;
use crate::errors::{ErrorKind, NowError, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

/// Create a directory (and parents) if it does not exist yet.
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| NowError::os(ErrorKind::Create, "dir", &e))
}

/// Remove a directory tree; missing is fine.
pub fn remove_tree(path: &Path) -> Result<()> {
    match fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(NowError::os(ErrorKind::Remove, "dir", &e)),
    }
}

/// Atomically replace `path` with `content`: write a sibling temp file,
/// fsync it, then rename over the target.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let mut f =
        fs::File::create(&tmp).map_err(|e| NowError::os(ErrorKind::Create, "catalog", &e))?;
    f.write_all(content)
        .map_err(|e| NowError::os(ErrorKind::Write, "catalog", &e))?;
    f.sync_all()
        .map_err(|e| NowError::os(ErrorKind::Sync, "catalog", &e))?;
    fs::rename(&tmp, path).map_err(|e| NowError::os(ErrorKind::Move, "catalog", &e))
}

/// Validate a user-supplied object name before it becomes a path segment.
pub fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 255 {
        return Err(errof!(BadName, "name", "empty or oversized name"));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(errof!(BadName, "name", "invalid character in '{name}'"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn atomic_write_replaces() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("catalog");
        write_atomic(&p, b"one").unwrap();
        write_atomic(&p, b"two").unwrap();
        assert_eq!(fs::read(&p).unwrap(), b"two");
        assert!(!p.with_extension("tmp").exists());
    }

    #[test]
    fn names_are_checked() {
        assert!(check_name("buys_2018").is_ok());
        assert!(check_name("../escape").is_err());
        assert!(check_name("").is_err());
    }
}
