//! Inventory of media already pulled into the local media root.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;
use walkdir::{DirEntry, WalkDir};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "webm", "mov", "mkv", "avi", "m4v"];

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn from_extension(ext: &str) -> Self {
        if VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()) {
            MediaKind::Video
        } else {
            MediaKind::Image
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MediaFile {
    /// Relative to the media root, `/`-separated.
    pub path: String,
    pub target: String,
    pub kind: MediaKind,
    pub bytes: u64,
    pub modified: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetMedia {
    pub name: String,
    pub files: u64,
    pub bytes: u64,
    pub images: u64,
    pub videos: u64,
    pub newest: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MediaInventory {
    pub total_files: u64,
    pub total_bytes: u64,
    pub targets: Vec<TargetMedia>,
    /// Newest first.
    pub recent: Vec<MediaFile>,
}

/// Walk `root` and summarize every file whose extension is in `extensions`
/// (case-insensitive). The first directory level is the target; files
/// directly under the root are grouped under `""`. Hidden files (rsync's
/// in-flight temp files among them) are skipped.
pub fn scan_media(root: &Path, extensions: &[String], recent_limit: usize) -> Result<MediaInventory> {
    if !root.exists() {
        return Ok(MediaInventory::default());
    }
    Ok(summarize(root, walk(root), extensions, recent_limit))
}

fn walk(root: &Path) -> impl Iterator<Item = walkdir::Result<DirEntry>> {
    WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !e.file_name().to_string_lossy().starts_with('.'))
}

/// Files that disappear mid-scan (rsync renaming its temp files into place)
/// are skipped, not fatal.
fn summarize(
    root: &Path,
    entries: impl IntoIterator<Item = walkdir::Result<DirEntry>>,
    extensions: &[String],
    recent_limit: usize,
) -> MediaInventory {
    let mut inventory = MediaInventory::default();
    let wanted: Vec<String> = extensions.iter().map(|e| e.to_ascii_lowercase()).collect();
    let mut targets: BTreeMap<String, TargetMedia> = BTreeMap::new();
    let mut files = Vec::new();

    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable media entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(ext) = entry.path().extension().map(|e| e.to_string_lossy().to_ascii_lowercase())
        else {
            continue;
        };
        if !wanted.contains(&ext) {
            continue;
        }

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::warn!(path = %entry.path().display(), error = %e, "skipping media file");
                continue;
            }
        };
        let modified: DateTime<Utc> = metadata.modified().map(DateTime::from).unwrap_or_default();
        let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
        let target = if entry.depth() > 1 {
            relative
                .components()
                .next()
                .map(|c| c.as_os_str().to_string_lossy().to_string())
                .unwrap_or_default()
        } else {
            String::new()
        };
        let kind = MediaKind::from_extension(&ext);

        let summary = targets.entry(target.clone()).or_insert_with(|| TargetMedia {
            name: target.clone(),
            ..TargetMedia::default()
        });
        summary.files += 1;
        summary.bytes += metadata.len();
        match kind {
            MediaKind::Image => summary.images += 1,
            MediaKind::Video => summary.videos += 1,
        }
        if summary.newest.is_none_or(|newest| modified > newest) {
            summary.newest = Some(modified);
        }

        inventory.total_files += 1;
        inventory.total_bytes += metadata.len();
        files.push(MediaFile {
            path: relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            target,
            kind,
            bytes: metadata.len(),
            modified,
        });
    }

    files.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| a.path.cmp(&b.path)));
    files.truncate(recent_limit);
    inventory.recent = files;
    inventory.targets = targets.into_values().collect();
    inventory
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_extensions;
    use tempfile::tempdir;

    fn write(path: &Path, bytes: usize) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, vec![0u8; bytes]).unwrap();
    }

    #[test]
    fn test_missing_root_is_empty() {
        let dir = tempdir().unwrap();
        let inv = scan_media(&dir.path().join("nope"), &default_extensions(), 10).unwrap();
        assert_eq!(inv.total_files, 0);
        assert!(inv.targets.is_empty());
    }

    #[test]
    fn test_groups_by_target_and_kind() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("comfy/2024-01-01/a.png"), 10);
        write(&root.join("comfy/b.MP4"), 100);
        write(&root.join("forge/txt2img/c.jpg"), 5);
        write(&root.join("forge/notes.txt"), 50);
        write(&root.join("forge/.d.png.XyZ123"), 50);
        write(&root.join(".hidden/e.png"), 50);

        let inv = scan_media(root, &default_extensions(), 10).unwrap();
        assert_eq!(inv.total_files, 3);
        assert_eq!(inv.total_bytes, 115);

        let names: Vec<&str> = inv.targets.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["comfy", "forge"]);
        let comfy = &inv.targets[0];
        assert_eq!((comfy.files, comfy.images, comfy.videos), (2, 1, 1));
        assert_eq!(comfy.bytes, 110);
        assert!(comfy.newest.is_some());

        assert!(inv.recent.iter().any(|f| f.path == "comfy/2024-01-01/a.png"));
        assert!(inv.recent.iter().all(|f| !f.path.contains(".hidden")));
    }

    #[test]
    fn test_recent_is_limited() {
        let dir = tempdir().unwrap();
        for i in 0..5 {
            write(&dir.path().join(format!("comfy/{}.png", i)), 1);
        }
        let inv = scan_media(dir.path(), &default_extensions(), 2).unwrap();
        assert_eq!(inv.total_files, 5);
        assert_eq!(inv.recent.len(), 2);
    }

    #[test]
    fn test_file_removed_during_scan_is_skipped() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        write(&root.join("comfy/kept.png"), 10);
        write(&root.join("comfy/gone.png"), 20);

        let entries: Vec<_> = walk(root).collect();
        std::fs::remove_file(root.join("comfy/gone.png")).unwrap();

        let inv = summarize(root, entries, &default_extensions(), 10);
        assert_eq!(inv.total_files, 1);
        assert_eq!(inv.total_bytes, 10);
        assert_eq!(inv.recent[0].path, "comfy/kept.png");
    }

    #[test]
    fn test_media_kind_from_extension() {
        assert_eq!(MediaKind::from_extension("WEBM"), MediaKind::Video);
        assert_eq!(MediaKind::from_extension("webp"), MediaKind::Image);
    }
}
