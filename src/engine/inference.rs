use crate::engine::FaceModel;
use crate::error::WorkflowError;
use crate::model::{Detection, Frame, WorkflowConfig};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Face model served by a local inference process over HTTP.
///
/// `GET /health` answers once the weights are loaded; `POST /detect` takes the
/// raw frame and answers `{"score": f64}` or `null`.
pub struct HttpFaceModel {
    http: reqwest::Client,
    base_url: String,
}

impl HttpFaceModel {
    pub fn new(cfg: &WorkflowConfig) -> Result<Self, WorkflowError> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .connect_timeout(Duration::from_secs(2))
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.model_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl FaceModel for HttpFaceModel {
    async fn load(&self) -> Result<(), WorkflowError> {
        let url = format!("{}/health", self.base_url);
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| WorkflowError::ModelUnavailable(format!("{url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(WorkflowError::ModelUnavailable(format!(
                "{url} answered {}",
                resp.status()
            )));
        }
        info!(model = %self.base_url, "face model ready");
        Ok(())
    }

    async fn detect(&self, frame: &Frame) -> Result<Option<Detection>, WorkflowError> {
        let resp = self
            .http
            .post(format!("{}/detect", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(frame.data.clone())
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(WorkflowError::from_response(resp).await);
        }
        let detection = resp
            .json::<Option<Detection>>()
            .await
            .map_err(|e| WorkflowError::MalformedResponse(e.to_string()))?;
        debug!(frame = %frame.label, score = ?detection.map(|d| d.score), "detect");
        Ok(detection)
    }
}

/// A face model that has been loaded successfully. The poller only accepts
/// this type, so no probe can run against a model that is still loading.
#[derive(Clone)]
pub struct ReadyModel(Arc<dyn FaceModel>);

impl ReadyModel {
    pub async fn load(model: Arc<dyn FaceModel>) -> Result<Self, WorkflowError> {
        match model.load().await {
            Ok(()) => Ok(Self(model)),
            Err(e @ WorkflowError::ModelUnavailable(_)) => Err(e),
            Err(e) => Err(WorkflowError::ModelUnavailable(e.to_string())),
        }
    }

    pub async fn detect(&self, frame: &Frame) -> Result<Option<Detection>, WorkflowError> {
        self.0.detect(frame).await
    }
}
