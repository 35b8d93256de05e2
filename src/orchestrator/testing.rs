//! Fakes for the engine traits with controllable latency.

use crate::engine::{
    FaceModel, FrameSource, MatchRequest, MatchService, ProgressFn, StillFrames, UploadAck,
    UploadService,
};
use crate::error::WorkflowError;
use crate::model::{Detection, Frame, MatchResult, UploadBatch};
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::StatusCode;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

pub fn single_frame() -> Arc<dyn FrameSource> {
    Arc::new(StillFrames::from_frames(vec![Frame {
        data: Bytes::from_static(b"\xff\xd8frame\xff\xd9"),
        label: "frame-0.jpg".into(),
    }]))
}

pub struct ScriptedModel {
    available: bool,
    score: Mutex<Option<f64>>,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn fixed(score: Option<f64>) -> Self {
        Self {
            available: true,
            score: Mutex::new(score),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every probe waits for one `notify_one` on `gate` before answering.
    pub fn gated(score: Option<f64>, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::fixed(score)
        }
    }

    pub fn unavailable() -> Self {
        Self {
            available: false,
            ..Self::fixed(None)
        }
    }

    pub fn set_score(&self, score: Option<f64>) {
        *self.score.lock().unwrap() = score;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FaceModel for ScriptedModel {
    async fn load(&self) -> Result<(), WorkflowError> {
        if self.available {
            Ok(())
        } else {
            Err(WorkflowError::ModelUnavailable("weights missing".into()))
        }
    }

    async fn detect(&self, _frame: &Frame) -> Result<Option<Detection>, WorkflowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let score = *self.score.lock().unwrap();
        Ok(score.map(|score| Detection { score }))
    }
}

pub fn sample_matches() -> Vec<MatchResult> {
    vec![
        MatchResult {
            filename: Some("party/3.jpg".into()),
            similarity: 0.72,
            image: "/9j/4AAQSkZJRgABAQ==".into(),
        },
        MatchResult {
            filename: Some("party/1.jpg".into()),
            similarity: 0.91,
            image: "aGVsbG8gd29ybGQ=".into(),
        },
    ]
}

pub struct FakeMatcher {
    gate: Option<Arc<Notify>>,
    response: Mutex<Result<Vec<MatchResult>, String>>,
    calls: AtomicUsize,
    last_request: Mutex<Option<MatchRequest>>,
}

impl FakeMatcher {
    pub fn answering(matches: Vec<MatchResult>) -> Self {
        Self {
            gate: None,
            response: Mutex::new(Ok(matches)),
            calls: AtomicUsize::new(0),
            last_request: Mutex::new(None),
        }
    }

    pub fn failing(message: &str) -> Self {
        Self {
            response: Mutex::new(Err(message.to_string())),
            ..Self::answering(Vec::new())
        }
    }

    pub fn gated(matches: Vec<MatchResult>, gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::answering(matches)
        }
    }

    pub fn respond_with(&self, response: Result<Vec<MatchResult>, String>) {
        *self.response.lock().unwrap() = response;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<MatchRequest> {
        self.last_request.lock().unwrap().clone()
    }
}

#[async_trait]
impl MatchService for FakeMatcher {
    async fn find_matches(&self, req: MatchRequest) -> Result<Vec<MatchResult>, WorkflowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(req);
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let response = self.response.lock().unwrap().clone();
        response.map_err(|message| WorkflowError::Service {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message,
        })
    }
}

/// Reports progress at 0/25/50/75/100 percent, pausing `step_delay` between
/// reports, then succeeds or fails.
pub struct FakeUploader {
    step_delay: Duration,
    fail: AtomicBool,
    gate: Option<Arc<Notify>>,
    calls: AtomicUsize,
}

impl FakeUploader {
    pub fn succeeding(step_delay: Duration) -> Self {
        Self {
            step_delay,
            fail: AtomicBool::new(false),
            gate: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing(step_delay: Duration) -> Self {
        Self {
            fail: AtomicBool::new(true),
            ..Self::succeeding(step_delay)
        }
    }

    /// Waits on `gate` after every progress report.
    pub fn gated(gate: Arc<Notify>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::succeeding(Duration::ZERO)
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl UploadService for FakeUploader {
    async fn upload(
        &self,
        batch: Arc<UploadBatch>,
        progress: ProgressFn,
    ) -> Result<UploadAck, WorkflowError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let total = batch.total_bytes();
        for pct in [0u64, 25, 50, 75, 100] {
            progress(total * pct / 100, total);
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            tokio::time::sleep(self.step_delay).await;
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(WorkflowError::Service {
                status: StatusCode::BAD_GATEWAY,
                message: "storage bucket unreachable".into(),
            });
        }
        Ok(UploadAck {
            message: format!("{} images uploaded successfully", batch.items.len()),
        })
    }
}
