//! On-disk frame store conventions.
//!
//! Frames live under `output_dir/<date>/<hour>/<second>.png`, named by the
//! local capture timestamp. Lexicographic order of the collected paths is
//! chronological order by construction; assembly relies on that instead of
//! file metadata.

use chrono::{DateTime, Local};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Fixed extension for captured frames.
pub const FRAME_EXT: &str = "png";

/// Timestamp parts used for frame paths, video titles, and log lines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameName {
    /// `YYYY-MM-DD`
    pub date: String,
    /// `YYYY-MM-DD_HH`
    pub hour: String,
    /// `YYYY-MM-DD_HH-MM-SS`
    pub second: String,
}

impl FrameName {
    pub fn now() -> Self {
        Self::from_datetime(Local::now())
    }

    pub fn from_datetime(at: DateTime<Local>) -> Self {
        Self {
            date: at.format("%Y-%m-%d").to_string(),
            hour: at.format("%Y-%m-%d_%H").to_string(),
            second: at.format("%Y-%m-%d_%H-%M-%S").to_string(),
        }
    }

    /// Hour-partition directory for this timestamp.
    pub fn hour_dir(&self, root: &Path) -> PathBuf {
        root.join(&self.date).join(&self.hour)
    }

    /// Full frame path: `<root>/<date>/<hour>/<second>.png`.
    pub fn frame_path(&self, root: &Path) -> PathBuf {
        self.hour_dir(root).join(format!("{}.{}", self.second, FRAME_EXT))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to delete {path}: {source}")]
    Delete {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Collect every frame file under `root`, sorted lexicographically.
///
/// Walks the tree recursively and keeps files with the frame extension.
/// A missing root yields an empty list rather than an error; the caller
/// treats "no frames" uniformly.
pub fn collect_frames(root: &Path) -> Result<Vec<PathBuf>, StoreError> {
    let mut frames = Vec::new();
    if root.exists() {
        walk(root, &mut frames)?;
    }
    frames.sort();
    Ok(frames)
}

fn walk(dir: &Path, frames: &mut Vec<PathBuf>) -> Result<(), StoreError> {
    let entries = std::fs::read_dir(dir).map_err(|source| StoreError::Read {
        path: dir.to_path_buf(),
        source,
    })?;

    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            walk(&path, frames)?;
        } else if path.extension().map(|ext| ext == FRAME_EXT).unwrap_or(false) {
            frames.push(path);
        }
    }
    Ok(())
}

/// Delete consumed frames, then prune directories left empty.
///
/// For each distinct parent the pruning walks upward, removing directories
/// until one still holds entries or `root` is reached. `root` itself is
/// never removed.
pub fn delete_frames(root: &Path, frames: &[PathBuf]) -> Result<(), StoreError> {
    for frame in frames {
        std::fs::remove_file(frame).map_err(|source| StoreError::Delete {
            path: frame.clone(),
            source,
        })?;
    }

    let parents: BTreeSet<PathBuf> = frames
        .iter()
        .filter_map(|f| f.parent().map(Path::to_path_buf))
        .collect();

    for parent in parents {
        prune_empty_dirs(root, &parent);
    }
    Ok(())
}

fn prune_empty_dirs(root: &Path, dir: &Path) {
    let mut current = dir.to_path_buf();
    loop {
        if current == root || !current.starts_with(root) {
            break;
        }
        match std::fs::read_dir(&current) {
            Ok(mut entries) => {
                if entries.next().is_some() {
                    break;
                }
            }
            Err(_) => break,
        }
        // Removal can race a capture tick writing into the same partition;
        // losing the race just leaves the directory behind.
        if std::fs::remove_dir(&current).is_err() {
            break;
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::fs;

    fn fixed_name() -> FrameName {
        let at = Local.with_ymd_and_hms(2024, 3, 7, 14, 5, 9).unwrap();
        FrameName::from_datetime(at)
    }

    #[test]
    fn name_parts_match_partition_scheme() {
        let name = fixed_name();
        assert_eq!(name.date, "2024-03-07");
        assert_eq!(name.hour, "2024-03-07_14");
        assert_eq!(name.second, "2024-03-07_14-05-09");
    }

    #[test]
    fn frame_path_nests_date_then_hour() {
        let name = fixed_name();
        let path = name.frame_path(Path::new("/store"));
        assert_eq!(
            path,
            Path::new("/store/2024-03-07/2024-03-07_14/2024-03-07_14-05-09.png")
        );
    }

    #[test]
    fn collect_walks_recursively_and_sorts() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let hour_a = root.join("2024-03-07").join("2024-03-07_09");
        let hour_b = root.join("2024-03-07").join("2024-03-07_10");
        fs::create_dir_all(&hour_a).unwrap();
        fs::create_dir_all(&hour_b).unwrap();

        fs::write(hour_b.join("2024-03-07_10-00-00.png"), b"b").unwrap();
        fs::write(hour_a.join("2024-03-07_09-30-00.png"), b"a2").unwrap();
        fs::write(hour_a.join("2024-03-07_09-00-00.png"), b"a1").unwrap();
        // Non-frame files are ignored.
        fs::write(root.join("output.mp4"), b"video").unwrap();
        fs::write(hour_a.join("notes.txt"), b"x").unwrap();

        let frames = collect_frames(root).unwrap();
        let names: Vec<_> = frames
            .iter()
            .map(|p| p.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert_eq!(
            names,
            vec![
                "2024-03-07_09-00-00.png",
                "2024-03-07_09-30-00.png",
                "2024-03-07_10-00-00.png",
            ]
        );
    }

    #[test]
    fn collect_missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let frames = collect_frames(&dir.path().join("nope")).unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn delete_prunes_only_emptied_directories() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();

        let emptied = root.join("2024-03-07").join("2024-03-07_09");
        let kept = root.join("2024-03-08").join("2024-03-08_09");
        fs::create_dir_all(&emptied).unwrap();
        fs::create_dir_all(&kept).unwrap();

        let gone = emptied.join("2024-03-07_09-00-00.png");
        let consumed = kept.join("2024-03-08_09-00-00.png");
        let survivor = kept.join("leftover.txt");
        fs::write(&gone, b"x").unwrap();
        fs::write(&consumed, b"x").unwrap();
        fs::write(&survivor, b"x").unwrap();

        delete_frames(root, &[gone.clone(), consumed.clone()]).unwrap();

        assert!(!gone.exists());
        assert!(!consumed.exists());
        // Fully-emptied hour and date directories are removed.
        assert!(!emptied.exists());
        assert!(!root.join("2024-03-07").exists());
        // A directory that still holds a file stays, as does its parent.
        assert!(kept.exists());
        assert!(survivor.exists());
        // The store root is never deleted.
        assert!(root.exists());
    }

    #[test]
    fn delete_missing_frame_errors() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.png");
        let err = delete_frames(dir.path(), &[missing]).unwrap_err();
        assert!(matches!(err, StoreError::Delete { .. }));
    }
}
