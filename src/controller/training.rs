use crate::error::{InspectorError, Result};
use crate::frame::Frame;
use crate::inference::NO_DEFECT_LABEL;
use chrono::{DateTime, Local};
use std::path::{Path, PathBuf};
use tracing::info;

/// `<root>/<label>/<YYYYMMDD_HHMMSS_mmm>.png`
pub fn snapshot_path(root: &Path, label: &str, at: DateTime<Local>) -> PathBuf {
    root.join(label_directory(label))
        .join(format!("{}.png", at.format("%Y%m%d_%H%M%S_%3f")))
}

/// Write `frame` as a labelled training image
pub fn save_training_snapshot(root: &Path, label: &str, frame: &Frame) -> Result<PathBuf> {
    let base = snapshot_path(root, label, Local::now());
    if let Some(parent) = base.parent() {
        std::fs::create_dir_all(parent)?;
    }

    // Two snapshots in the same millisecond keep distinct names
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut path = base.clone();
    let mut suffix = 1;
    while path.exists() {
        path = base.with_file_name(format!("{}_{}.png", stem, suffix));
        suffix += 1;
    }

    let image = frame.to_image()?;
    image
        .save(&path)
        .map_err(|e| InspectorError::component("training", format!("Failed to write {}: {}", path.display(), e)))?;

    info!("Saved training snapshot {} (frame {})", path.display(), frame.sequence);
    Ok(path)
}

fn label_directory(label: &str) -> String {
    let cleaned: String = label
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        NO_DEFECT_LABEL.to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use chrono::TimeZone;
    use std::time::SystemTime;
    use tempfile::TempDir;

    #[test]
    fn test_snapshot_path_layout() {
        let at = Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        let path = snapshot_path(Path::new("/data"), "Edge Crush", at);
        assert_eq!(path, PathBuf::from("/data/Edge_Crush/20240309_140507_000.png"));

        let path = snapshot_path(Path::new("/data"), "  ", at);
        assert!(path.starts_with("/data/None"));
    }

    #[test]
    fn test_save_training_snapshot() {
        let temp_dir = TempDir::new().unwrap();
        let frame = Frame::new(4, SystemTime::now(), vec![128; 6 * 4], 6, 4, PixelFormat::Mono8);

        let first = save_training_snapshot(temp_dir.path(), "Hole", &frame).unwrap();
        let second = save_training_snapshot(temp_dir.path(), "Hole", &frame).unwrap();
        assert_ne!(first, second);
        assert!(first.starts_with(temp_dir.path().join("Hole")));

        let decoded = image::open(&first).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (6, 4));

        let released = Frame::new(5, SystemTime::now(), Vec::new(), 6, 4, PixelFormat::Mono8);
        assert!(save_training_snapshot(temp_dir.path(), "Hole", &released).is_err());
    }
}
