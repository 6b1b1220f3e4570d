use image::RgbImage;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A single still pulled from the submitted video. Immutable once created.
#[derive(Clone, Debug)]
pub struct Frame {
    index: u32,
    timestamp: f64,
    image: Arc<RgbImage>,
}

impl Frame {
    pub fn new(index: u32, timestamp: f64, image: RgbImage) -> Self {
        Self {
            index,
            timestamp,
            image: Arc::new(image),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    /// Seconds from the start of the video
    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }
}

/// Reference to the video a run operates on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoRef {
    path: PathBuf,
}

impl VideoRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// File stem used to name report artifacts; falls back to "video".
    pub fn id(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .unwrap_or_else(|| "video".to_string())
    }
}

impl std::fmt::Display for VideoRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.path.display())
    }
}
