use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::time::Instant;

/// Strict lower bound a detection score must exceed to count as a face.
pub const PRESENCE_THRESHOLD: f64 = 0.8;

#[derive(Debug, Clone)]
pub struct WorkflowConfig {
    pub service_url: String,
    pub model_url: String,
    pub share_url: String,
    /// Fixed session id taken from the caller; a fresh one is generated otherwise.
    pub session_id: Option<String>,
    pub poll_interval: Duration,
    pub animation_step: Duration,
    /// Percentage points added per animation step.
    pub animation_increment: u8,
    pub reveal_delay: Duration,
    pub auto_capture: bool,
    pub download_dir: PathBuf,
    pub user_agent: String,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            service_url: "http://127.0.0.1:5000".into(),
            model_url: "http://127.0.0.1:8500".into(),
            share_url: "http://localhost:5173".into(),
            session_id: None,
            poll_interval: Duration::from_millis(500),
            animation_step: Duration::from_millis(50),
            animation_increment: 1,
            reveal_delay: Duration::from_millis(500),
            auto_capture: false,
            download_dir: PathBuf::from("."),
            user_agent: format!("facelens/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

/// One capture-or-upload workflow instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
}

/// A single frame pulled from the camera (or a stand-in frame source).
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Bytes,
    pub label: String,
}

/// Raw answer of the face model for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Serialize)]
pub struct Detection {
    pub score: f64,
}

/// Decision rule for a single probe result. A score of exactly the threshold
/// counts as absent.
pub fn face_present(detection: Option<&Detection>) -> bool {
    matches!(detection, Some(d) if d.score > PRESENCE_THRESHOLD)
}

/// Result of one detection tick. `score` is `None` when the model found nothing.
#[derive(Debug, Clone, Copy)]
pub struct DetectionSample {
    pub score: Option<f64>,
    pub timestamp: Instant,
}

impl DetectionSample {
    pub fn from_detection(detection: Option<Detection>) -> Self {
        Self {
            score: detection.map(|d| d.score),
            timestamp: Instant::now(),
        }
    }

    pub fn is_present(&self) -> bool {
        face_present(self.score.map(|score| Detection { score }).as_ref())
    }
}

/// The frozen frame handed to the match service.
#[derive(Debug, Clone)]
pub struct Capture {
    pub image: Bytes,
    pub source_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IdentityInfo {
    pub contact_id: String,
}

impl IdentityInfo {
    pub fn new(contact_id: impl Into<String>) -> Self {
        Self {
            contact_id: contact_id.into(),
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.contact_id.trim().is_empty()
    }
}

/// One similar image returned by the match service. `image` stays base64
/// encoded until it is downloaded.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MatchResult {
    #[serde(default)]
    pub filename: Option<String>,
    pub similarity: f64,
    pub image: String,
}

#[derive(Debug, Clone)]
pub struct ImageItem {
    pub file_name: String,
    pub data: Bytes,
    /// Where the item came from, kept for listing.
    pub preview: Option<PathBuf>,
}

impl ImageItem {
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            file_name: file_name.into(),
            data: data.into(),
            preview: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct UploadBatch {
    pub items: Vec<ImageItem>,
    pub folder_name: String,
}

impl UploadBatch {
    pub fn total_bytes(&self) -> u64 {
        self.items.iter().map(|i| i.data.len() as u64).sum()
    }
}

/// The two counters feeding the reveal gate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProgressState {
    pub network_percent: u8,
    pub animation_percent: u8,
    pub network_done: bool,
}

impl ProgressState {
    /// Record transfer progress; the counter never moves backwards.
    pub fn observe_network(&mut self, sent: u64, total: u64) {
        let pct = if total == 0 {
            100
        } else {
            ((sent.min(total) * 100) / total) as u8
        };
        self.network_percent = self.network_percent.max(pct);
    }

    pub fn advance_animation(&mut self, increment: u8) {
        self.animation_percent = self.animation_percent.saturating_add(increment).min(100);
    }

    pub fn reveal_ready(&self) -> bool {
        self.network_done && self.animation_percent >= 100
    }
}

/// A decoded match image ready to be written out.
#[derive(Debug, Clone)]
pub struct DownloadArtifact {
    pub file_name: String,
    pub bytes: Bytes,
}
