use crate::engine::FrameSource;
use crate::error::WorkflowError;
use crate::model::{Frame, ImageItem};
use bytes::Bytes;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png"];

/// Stand-in for a live camera: still images from disk, handed out in a loop.
pub struct StillFrames {
    frames: Vec<Frame>,
    cursor: AtomicUsize,
}

impl StillFrames {
    /// Load a single image, or every image of a directory in name order.
    pub fn from_path(path: &Path) -> Result<Self, WorkflowError> {
        let files = image_paths(path)?;
        let mut frames = Vec::with_capacity(files.len());
        for f in files {
            let data = std::fs::read(&f)?;
            frames.push(Frame {
                data: Bytes::from(data),
                label: f
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default(),
            });
        }
        if frames.is_empty() {
            return Err(WorkflowError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no images found at {}", path.display()),
            )));
        }
        debug!(count = frames.len(), "loaded still frames");
        Ok(Self::from_frames(frames))
    }

    pub fn from_frames(frames: Vec<Frame>) -> Self {
        Self {
            frames,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl FrameSource for StillFrames {
    fn current_frame(&self) -> Option<Frame> {
        if self.frames.is_empty() {
            return None;
        }
        let i = self.cursor.fetch_add(1, Ordering::Relaxed) % self.frames.len();
        Some(self.frames[i].clone())
    }
}

/// A file as given, or the images of a directory in name order.
fn image_paths(path: &Path) -> io::Result<Vec<PathBuf>> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let p = entry?.path();
        if p.is_file() && is_image(&p) {
            files.push(p);
        }
    }
    files.sort();
    Ok(files)
}

/// Read upload items from files and directories. Directory entries that are
/// not images are skipped; explicit files are taken as given.
pub fn load_images(paths: &[PathBuf]) -> Result<Vec<ImageItem>, WorkflowError> {
    let mut items = Vec::new();
    for path in paths {
        for file in image_paths(path)? {
            let data = std::fs::read(&file)?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());
            let mut item = ImageItem::new(name, data);
            item.preview = Some(file);
            items.push(item);
        }
    }
    Ok(items)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_cycle_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"second").unwrap();
        std::fs::write(dir.path().join("a.png"), b"first").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip").unwrap();

        let src = StillFrames::from_path(dir.path()).unwrap();
        let labels: Vec<String> = (0..3)
            .map(|_| src.current_frame().unwrap().label)
            .collect();
        assert_eq!(labels, vec!["a.png", "b.jpg", "a.png"]);
    }

    #[test]
    fn loads_upload_items_from_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.jpg"), b"bb").unwrap();
        std::fs::write(dir.path().join("a.png"), b"a").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"skip").unwrap();
        let single = dir.path().join("notes.txt");

        let items = load_images(&[dir.path().to_path_buf(), single]).unwrap();
        let names: Vec<_> = items.iter().map(|i| i.file_name.as_str()).collect();
        assert_eq!(names, ["a.png", "b.jpg", "notes.txt"]);
        assert_eq!(items[1].data.as_ref(), b"bb");
        assert_eq!(items[0].preview.as_deref(), Some(dir.path().join("a.png").as_path()));
    }

    #[test]
    fn missing_upload_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_images(&[dir.path().join("gone.jpg")]).is_err());
    }

    #[test]
    fn empty_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(StillFrames::from_path(dir.path()).is_err());
    }
}
