//! Saving received files.
//!
//! Invariants:
//! - The peer-supplied name is reduced to a single safe path component.
//! - Bytes go to a `.part` file first, then a rename publishes them, so a
//!   crash never leaves a truncated file under the final name.
//! - An existing file is never overwritten; a ` (n)` suffix is added instead.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tracing::error;

/// Reduce a (possibly adversarial) file name to one safe path component.
///
/// Directory parts are dropped, `.`/`..` are ignored and only alphanumeric
/// chars plus `.`, `-`, `_` and ` ` are kept. Falls back to `"file"`.
pub fn sanitize_file_name(name: &str) -> String {
    let normalized = name.replace('\\', "/");
    let last = normalized
        .split('/')
        .filter(|s| !s.is_empty() && !matches!(*s, "." | ".."))
        .last()
        .unwrap_or("");
    let safe: String = last
        .chars()
        .filter(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_' | ' '))
        .collect();
    let trimmed = safe.trim_matches(|c| c == '.' || c == ' ');
    if trimmed.is_empty() {
        "file".to_string()
    } else {
        trimmed.to_string()
    }
}

/// First path in `dir` for `name` that does not exist yet.
fn unique_path(dir: &Path, name: &str) -> PathBuf {
    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let (stem, ext) = match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (name, None),
    };
    (1u32..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{stem} ({n}).{ext}")),
            None => dir.join(format!("{stem} ({n})")),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}

/// Atomically write `content` to `path` via a temporary file and rename.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".part");
    let tmp_path = PathBuf::from(tmp_name);

    std::fs::write(&tmp_path, content).map_err(|e| {
        error!(
            event = "atomic_write_failure",
            path = %tmp_path.display(),
            error = %e,
            "Failed to write temp file"
        );
        e
    })?;

    std::fs::rename(&tmp_path, path).map_err(|e| {
        error!(
            event = "atomic_rename_failure",
            from = %tmp_path.display(),
            to = %path.display(),
            error = %e,
            "Failed to rename temp file"
        );
        let _ = std::fs::remove_file(&tmp_path);
        e
    })?;

    Ok(())
}

/// Save a received file into `dir` and return where it landed.
pub fn save_received(dir: &Path, file_name: &str, content: &[u8]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = unique_path(dir, &sanitize_file_name(file_name));
    atomic_write(&path, content)?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("report.pdf"), "report.pdf");
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("C:\\Users\\x\\a b.txt"), "a b.txt");
        assert_eq!(sanitize_file_name("..."), "file");
        assert_eq!(sanitize_file_name(""), "file");
        assert_eq!(sanitize_file_name("we<ird>|name?.bin"), "weirdname.bin");
    }

    #[test]
    fn test_save_received_never_overwrites() {
        let dir = std::env::temp_dir().join(format!("sharenear_test_save_{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);

        let first = save_received(&dir, "a.txt", b"one").unwrap();
        let second = save_received(&dir, "../a.txt", b"two").unwrap();
        assert_eq!(first, dir.join("a.txt"));
        assert_eq!(second, dir.join("a (1).txt"));
        assert_eq!(std::fs::read(&first).unwrap(), b"one");
        assert_eq!(std::fs::read(&second).unwrap(), b"two");
        assert!(!dir.join("a.txt.part").exists());

        let _ = std::fs::remove_dir_all(&dir);
    }
}
