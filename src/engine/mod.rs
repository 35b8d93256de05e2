//! External collaborators of the workflows: the local face model, the camera
//! stand-in and the remote match/upload service. The orchestrator only sees the
//! traits below, so tests can swap in fakes with controllable latency.

mod frames;
mod inference;
mod service;

pub use frames::{load_images, StillFrames};
pub use inference::{HttpFaceModel, ReadyModel};
pub use service::ServiceClient;

use crate::error::WorkflowError;
use crate::model::{Detection, Frame, MatchResult, UploadBatch};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

/// Local face-presence capability. Must be loaded before the first probe.
#[async_trait]
pub trait FaceModel: Send + Sync {
    async fn load(&self) -> Result<(), WorkflowError>;

    /// `Ok(None)` means no face was found in the frame.
    async fn detect(&self, frame: &Frame) -> Result<Option<Detection>, WorkflowError>;
}

/// Live frame source. Returns `None` while no frame is available yet.
pub trait FrameSource: Send + Sync {
    fn current_frame(&self) -> Option<Frame>;
}

#[derive(Debug, Clone)]
pub struct MatchRequest {
    pub image: Bytes,
    pub session_id: String,
    pub contact_id: String,
}

#[async_trait]
pub trait MatchService: Send + Sync {
    /// Matches are returned in the order the service sent them.
    async fn find_matches(&self, req: MatchRequest) -> Result<Vec<MatchResult>, WorkflowError>;
}

/// Transfer progress callback: `(bytes_sent, bytes_total)`.
pub type ProgressFn = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct UploadAck {
    #[serde(default)]
    pub message: String,
}

#[async_trait]
pub trait UploadService: Send + Sync {
    async fn upload(
        &self,
        batch: Arc<UploadBatch>,
        progress: ProgressFn,
    ) -> Result<UploadAck, WorkflowError>;
}
