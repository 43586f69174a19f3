use crate::error::{PipelineError, PipelineResult};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Media-library folder, relative to the output root, that receives new videos.
pub const OUTPUT_RELATIVE_PATH: &str = "Movies/Folder";
pub const OUTPUT_PREFIX: &str = "processed";
pub const OUTPUT_EXTENSION: &str = "mkv";
pub const OUTPUT_MIME_TYPE: &str = "video/mkv";

const VIDEO_EXTENSIONS: [&str; 7] = ["mp4", "mkv", "mov", "avi", "webm", "3gp", "m4v"];

/// Where and under which display metadata an annotated video is written.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutputDescriptor {
    pub path: PathBuf,
    pub relative_path: String,
    pub title: String,
    pub display_name: String,
    pub mime_type: String,
    /// Seconds since the epoch
    pub date_added: i64,
    /// Milliseconds since the epoch
    pub date_taken: i64,
}

impl OutputDescriptor {
    pub fn new(output_root: &Path, now: DateTime<Utc>) -> Self {
        let millis = now.timestamp_millis();
        let title = format!("{}{}", OUTPUT_PREFIX, millis);
        let display_name = format!("{}.{}", title, OUTPUT_EXTENSION);
        let path = output_root.join(OUTPUT_RELATIVE_PATH).join(&display_name);

        Self {
            path,
            relative_path: OUTPUT_RELATIVE_PATH.to_string(),
            title,
            display_name,
            mime_type: OUTPUT_MIME_TYPE.to_string(),
            date_added: now.timestamp(),
            date_taken: millis,
        }
    }

    pub fn sidecar_path(&self) -> PathBuf {
        self.path.with_extension("json")
    }

    /// Persists the descriptor next to the finished video.
    pub fn write_sidecar(&self) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(self.sidecar_path(), content)?;
        Ok(())
    }
}

/// Creates the destination folder and returns a fresh descriptor inside it.
/// Nothing besides the folder is created.
pub fn resolve_output(output_root: &Path) -> PipelineResult<OutputDescriptor> {
    let descriptor = OutputDescriptor::new(output_root, Utc::now());
    let dir = descriptor
        .path
        .parent()
        .ok_or_else(|| PipelineError::output_resolution("output path has no parent"))?;

    fs::create_dir_all(dir).map_err(|e| {
        PipelineError::output_resolution(format!("cannot create {}: {}", dir.display(), e))
    })?;

    let meta = fs::metadata(dir).map_err(|e| {
        PipelineError::output_resolution(format!("cannot inspect {}: {}", dir.display(), e))
    })?;
    if meta.permissions().readonly() {
        return Err(PipelineError::output_resolution(format!(
            "{} is read-only",
            dir.display()
        )));
    }
    if descriptor.path.exists() {
        return Err(PipelineError::output_resolution(format!(
            "{} already exists",
            descriptor.path.display()
        )));
    }

    tracing::info!("Resolved output {}", descriptor.path.display());
    Ok(descriptor)
}

pub fn list_videos(video_root: &Path) -> Vec<PathBuf> {
    WalkDir::new(video_root)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .and_then(|s| s.to_str())
                .map(|s| VIDEO_EXTENSIONS.contains(&s.to_lowercase().as_str()))
                .unwrap_or(false)
        })
        .map(|e| e.path().to_path_buf())
        .collect()
}

/// Descriptors of every completed output under `output_root`, newest first.
pub fn list_outputs(output_root: &Path) -> Result<Vec<OutputDescriptor>> {
    let dir = output_root.join(OUTPUT_RELATIVE_PATH);
    let mut outputs = Vec::new();

    if !dir.exists() {
        return Ok(outputs);
    }

    for entry in fs::read_dir(&dir)? {
        let path = entry?.path();
        if path.extension().and_then(|s| s.to_str()) != Some("json") {
            continue;
        }
        let content = fs::read_to_string(&path)?;
        match serde_json::from_str::<OutputDescriptor>(&content) {
            Ok(descriptor) => outputs.push(descriptor),
            Err(e) => tracing::warn!("Skipping unreadable descriptor {}: {}", path.display(), e),
        }
    }

    outputs.sort_by(|a, b| b.date_taken.cmp(&a.date_taken));
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_descriptor_naming() {
        let now = Utc.timestamp_millis_opt(1_700_000_123_456).unwrap();
        let d = OutputDescriptor::new(Path::new("/media"), now);

        assert_eq!(d.title, "processed1700000123456");
        assert_eq!(d.display_name, "processed1700000123456.mkv");
        assert_eq!(
            d.path,
            PathBuf::from("/media/Movies/Folder/processed1700000123456.mkv")
        );
        assert_eq!(d.mime_type, "video/mkv");
        assert_eq!(d.date_added, 1_700_000_123);
        assert_eq!(d.date_taken, 1_700_000_123_456);
        assert_eq!(
            d.sidecar_path(),
            PathBuf::from("/media/Movies/Folder/processed1700000123456.json")
        );
    }

    #[test]
    fn test_resolve_creates_only_the_folder() {
        let root = tempfile::tempdir().unwrap();
        let d = resolve_output(root.path()).unwrap();

        let dir = root.path().join(OUTPUT_RELATIVE_PATH);
        assert!(dir.is_dir());
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);
        assert!(d.path.starts_with(&dir));
    }

    #[test]
    fn test_resolve_under_a_file_fails() {
        let root = tempfile::tempdir().unwrap();
        let blocker = root.path().join("not-a-dir");
        fs::write(&blocker, b"x").unwrap();

        let result = resolve_output(&blocker);
        assert!(matches!(result, Err(PipelineError::OutputResolution(_))));
        assert!(blocker.is_file());
    }

    #[test]
    fn test_sidecars_are_listed_newest_first() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join(OUTPUT_RELATIVE_PATH)).unwrap();

        let older = OutputDescriptor::new(root.path(), Utc.timestamp_millis_opt(1_000).unwrap());
        let newer = OutputDescriptor::new(root.path(), Utc.timestamp_millis_opt(2_000).unwrap());
        older.write_sidecar().unwrap();
        newer.write_sidecar().unwrap();
        fs::write(root.path().join(OUTPUT_RELATIVE_PATH).join("junk.json"), "{").unwrap();

        let listed = list_outputs(root.path()).unwrap();
        assert_eq!(listed, vec![newer, older]);
    }

    #[test]
    fn test_list_videos_filters_extensions() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir_all(root.path().join("nested")).unwrap();
        fs::write(root.path().join("a.MP4"), b"").unwrap();
        fs::write(root.path().join("nested/b.mkv"), b"").unwrap();
        fs::write(root.path().join("notes.txt"), b"").unwrap();

        let mut videos = list_videos(root.path());
        videos.sort();
        assert_eq!(
            videos,
            vec![root.path().join("a.MP4"), root.path().join("nested/b.mkv")]
        );
    }
}
