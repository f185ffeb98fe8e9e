//! Durable write helpers.
//!
//! Everything persisted outside the trust-log primary (mirror, rotation
//! marker, value stats, world state) goes through [`write_atomic`]:
//! write to a temp file in the same directory, fsync it, rename it over the
//! destination, then fsync the directory so the rename itself is durable.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

/// Errors produced by the durable-write helpers.
#[derive(Debug, Error, Diagnostic)]
pub enum AtomicIoError {
    #[error("failed to write {path}: {source}")]
    #[diagnostic(code(veritas::io::write))]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to rename {from} -> {to}: {source}")]
    #[diagnostic(code(veritas::io::rename))]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to fsync directory {path}: {source}")]
    #[diagnostic(
        code(veritas::io::fsync_dir),
        help("The log directory must live on a filesystem that supports fsync.")
    )]
    FsyncDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Atomically replace `dest` with `contents`.
///
/// The temp file lives next to `dest` so the rename stays on one filesystem.
/// Parent directories are created if missing.
pub fn write_atomic(dest: &Path, contents: &[u8]) -> Result<(), AtomicIoError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| AtomicIoError::Write {
        path: parent.to_path_buf(),
        source,
    })?;

    let tmp = temp_sibling(dest);
    {
        let mut f = File::create(&tmp).map_err(|source| AtomicIoError::Write {
            path: tmp.clone(),
            source,
        })?;
        f.write_all(contents).map_err(|source| AtomicIoError::Write {
            path: tmp.clone(),
            source,
        })?;
        f.sync_all().map_err(|source| AtomicIoError::Write {
            path: tmp.clone(),
            source,
        })?;
    }

    fs::rename(&tmp, dest).map_err(|source| AtomicIoError::Rename {
        from: tmp.clone(),
        to: dest.to_path_buf(),
        source,
    })?;

    fsync_dir(parent)
}

/// Append `line` (newline added) to `path` and fsync both file and directory.
///
/// Used only by the trust-log primary, whose appends are serialized by the
/// log lock; the durability rule is append + fsync rather than temp-rename.
pub fn append_line_durable(path: &Path, line: &str) -> Result<(), AtomicIoError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| AtomicIoError::Write {
        path: parent.to_path_buf(),
        source,
    })?;

    let mut f = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|source| AtomicIoError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    f.write_all(line.as_bytes())
        .and_then(|()| f.write_all(b"\n"))
        .and_then(|()| f.sync_all())
        .map_err(|source| AtomicIoError::Write {
            path: path.to_path_buf(),
            source,
        })?;

    fsync_dir(parent)
}

/// Fsync a directory so renames and appends within it are durable.
pub fn fsync_dir(dir: &Path) -> Result<(), AtomicIoError> {
    // Windows cannot open directories for fsync; the rename is already the
    // best durability available there.
    #[cfg(unix)]
    {
        let d = File::open(dir).map_err(|source| AtomicIoError::FsyncDir {
            path: dir.to_path_buf(),
            source,
        })?;
        d.sync_all().map_err(|source| AtomicIoError::FsyncDir {
            path: dir.to_path_buf(),
            source,
        })?;
    }
    #[cfg(not(unix))]
    let _ = dir;
    Ok(())
}

fn temp_sibling(dest: &Path) -> PathBuf {
    let mut name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "out".to_string());
    name.push_str(".tmp");
    dest.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("stats.json");

        write_atomic(&dest, b"{\"v\":1}").unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "{\"v\":1}");

        write_atomic(&dest, b"{\"v\":2}").unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "{\"v\":2}");

        // No temp file left behind.
        assert!(!dir.path().join("stats.json.tmp").exists());
    }

    #[test]
    fn append_line_durable_appends() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("log.jsonl");

        append_line_durable(&dest, "one").unwrap();
        append_line_durable(&dest, "two").unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn write_atomic_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a/b/c.json");
        write_atomic(&dest, b"x").unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "x");
    }
}
