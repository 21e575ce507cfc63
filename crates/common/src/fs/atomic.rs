use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;

#[cfg(target_family = "unix")]
use std::os::unix::fs::OpenOptionsExt;

/// Durably replace `path` with `content` (tmp file + fsync + rename).
///
/// A crash mid-write leaves either the old file or a stale `.tmp` sibling,
/// never a torn target.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("no parent directory for '{}'", path.display()))?;
    fs::create_dir_all(parent)
        .with_context(|| format!("failed to create '{}'", parent.display()))?;

    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("invalid file name in '{}'", path.display()))?;
    let temp_path = parent.join(format!("{}.tmp", file_name));

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(target_family = "unix")]
    options.mode(0o600);

    let mut temp = options
        .open(&temp_path)
        .with_context(|| format!("failed to open '{}'", temp_path.display()))?;
    temp.write_all(content)
        .with_context(|| format!("failed to write '{}'", temp_path.display()))?;
    temp.sync_all()
        .with_context(|| format!("failed to sync '{}'", temp_path.display()))?;
    drop(temp);

    fs::rename(&temp_path, path).with_context(|| {
        format!(
            "failed to rename '{}' over '{}'",
            temp_path.display(),
            path.display()
        )
    })?;

    // Rename durability requires the directory entry itself to be synced.
    let dir_handle =
        File::open(parent).with_context(|| format!("failed to open '{}'", parent.display()))?;
    dir_handle
        .sync_all()
        .with_context(|| format!("failed to sync '{}'", parent.display()))?;

    Ok(())
}

/// Read a small text file, trimming surrounding whitespace.
pub fn read_trimmed(path: &Path) -> Result<String> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    Ok(raw.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn write_then_read_round_trip() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state").join("offset");

        atomic_write(&path, b"42\n")?;
        assert_eq!(read_trimmed(&path)?, "42");

        atomic_write(&path, b"43\n")?;
        assert_eq!(read_trimmed(&path)?, "43");
        Ok(())
    }

    #[test]
    fn stale_tmp_file_is_ignored() -> Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("offset");

        // A leftover tmp from a torn write must not affect the next write.
        fs::write(dir.path().join("offset.tmp"), b"garbage")?;
        atomic_write(&path, b"7")?;
        assert_eq!(read_trimmed(&path)?, "7");
        Ok(())
    }
}
