use crate::engine::{MatchRequest, MatchService, ProgressFn, UploadAck, UploadService};
use crate::error::WorkflowError;
use crate::model::{MatchResult, UploadBatch, WorkflowConfig};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, Stream, StreamExt};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tracing::{debug, instrument};

/// Chunk size for upload body generation (64 KB)
const UPLOAD_CHUNK_SIZE: usize = 64 * 1024;

/// HTTP client for the remote match and upload endpoints.
#[derive(Clone)]
pub struct ServiceClient {
    pub http: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct MatchResponse {
    #[serde(rename = "similar_images", alias = "matches", default)]
    matches: Vec<MatchResult>,
}

impl ServiceClient {
    pub fn new(cfg: &WorkflowConfig) -> Result<Self, WorkflowError> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.clone())
            .build()?;
        Ok(Self {
            http,
            base_url: cfg.service_url.trim_end_matches('/').to_string(),
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }
}

#[async_trait]
impl MatchService for ServiceClient {
    #[instrument(skip(self, req), fields(session = %req.session_id, bytes = req.image.len()))]
    async fn find_matches(&self, req: MatchRequest) -> Result<Vec<MatchResult>, WorkflowError> {
        let image = Part::bytes(req.image.to_vec())
            .file_name("capture.jpg")
            .mime_str("image/jpeg")?;
        let form = Form::new()
            .part("image", image)
            .text("folderName", req.session_id)
            .text("contactId", req.contact_id);

        let resp = self
            .http
            .post(self.endpoint("find_similar_faces"))
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(WorkflowError::from_response(resp).await);
        }
        let body: MatchResponse = resp
            .json()
            .await
            .map_err(|e| WorkflowError::MalformedResponse(e.to_string()))?;
        debug!(count = body.matches.len(), "match response");
        Ok(body.matches)
    }
}

#[async_trait]
impl UploadService for ServiceClient {
    #[instrument(skip(self, batch, progress), fields(folder = %batch.folder_name, items = batch.items.len()))]
    async fn upload(
        &self,
        batch: Arc<UploadBatch>,
        progress: ProgressFn,
    ) -> Result<UploadAck, WorkflowError> {
        let total = batch.total_bytes();
        let sent = Arc::new(AtomicU64::new(0));

        let mut form = Form::new().text("folderName", batch.folder_name.clone());
        for item in &batch.items {
            let len = item.data.len() as u64;
            let body = reqwest::Body::wrap_stream(counting_stream(
                item.data.clone(),
                sent.clone(),
                total,
                progress.clone(),
            ));
            let part = Part::stream_with_length(body, len)
                .file_name(item.file_name.clone())
                .mime_str(mime_for(&item.file_name))?;
            form = form.part("images", part);
        }

        progress(0, total);
        let resp = self
            .http
            .post(self.endpoint("upload_images"))
            .multipart(form)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(WorkflowError::from_response(resp).await);
        }
        let ack: UploadAck = resp
            .json()
            .await
            .map_err(|e| WorkflowError::MalformedResponse(e.to_string()))?;
        progress(total, total);
        Ok(ack)
    }
}

/// Split a file into chunks and count bytes as the transport pulls them. This
/// tracks bytes handed to the connection, close enough to bytes on the wire.
fn counting_stream(
    data: Bytes,
    sent: Arc<AtomicU64>,
    total: u64,
    progress: ProgressFn,
) -> impl Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    let chunks: Vec<Bytes> = (0..data.len())
        .step_by(UPLOAD_CHUNK_SIZE)
        .map(|start| data.slice(start..(start + UPLOAD_CHUNK_SIZE).min(data.len())))
        .collect();
    stream::iter(chunks).map(move |chunk| {
        let now = sent.fetch_add(chunk.len() as u64, Ordering::Relaxed) + chunk.len() as u64;
        progress(now, total);
        Ok(chunk)
    })
}

fn mime_for(file_name: &str) -> &'static str {
    let lower = file_name.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png"
    } else {
        "image/jpeg"
    }
}
