//! Batch upload followed by a paced "processing" reveal.
//!
//! Two counters feed the reveal gate: `network_percent` follows the real
//! transfer, `animation_percent` is advanced by a fixed-step timer that only
//! starts once the upload has succeeded. `Revealed` is entered after the
//! animation hits 100 and one extra fixed delay.

use crate::engine::{ProgressFn, UploadAck, UploadService};
use crate::error::WorkflowError;
use crate::model::{ImageItem, ProgressState, Session, UploadBatch, WorkflowConfig};
use crate::orchestrator::SubmitOutcome;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum UploadEvent {
    Progress {
        epoch: u64,
        sent: u64,
        total: u64,
    },
    NetworkSettled {
        epoch: u64,
        outcome: Result<UploadAck, WorkflowError>,
    },
    AnimationTick {
        epoch: u64,
    },
    RevealDue {
        epoch: u64,
    },
}

impl UploadEvent {
    fn epoch(&self) -> u64 {
        match self {
            UploadEvent::Progress { epoch, .. }
            | UploadEvent::NetworkSettled { epoch, .. }
            | UploadEvent::AnimationTick { epoch }
            | UploadEvent::RevealDue { epoch } => *epoch,
        }
    }
}

#[derive(Debug, Clone)]
pub enum UploadState {
    Collecting {
        batch: UploadBatch,
        error: Option<String>,
    },
    Submitting {
        batch: Arc<UploadBatch>,
        progress: ProgressState,
    },
    Processing {
        batch: Arc<UploadBatch>,
        progress: ProgressState,
    },
    Revealed {
        batch: Arc<UploadBatch>,
        progress: ProgressState,
        link: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadPhase {
    Collecting,
    Submitting,
    Processing,
    Revealed,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadPhase::Collecting => "collecting",
            UploadPhase::Submitting => "uploading",
            UploadPhase::Processing => "processing",
            UploadPhase::Revealed => "ready",
        };
        f.write_str(s)
    }
}

impl UploadState {
    pub fn phase(&self) -> UploadPhase {
        match self {
            UploadState::Collecting { .. } => UploadPhase::Collecting,
            UploadState::Submitting { .. } => UploadPhase::Submitting,
            UploadState::Processing { .. } => UploadPhase::Processing,
            UploadState::Revealed { .. } => UploadPhase::Revealed,
        }
    }
}

pub struct UploadSequencer {
    session: Session,
    uploader: Arc<dyn UploadService>,
    share_url: String,
    animation_step: Duration,
    animation_increment: u8,
    reveal_delay: Duration,

    state: UploadState,
    epoch: u64,
    network_task: Option<JoinHandle<()>>,
    animation_task: Option<JoinHandle<()>>,
    reveal_task: Option<JoinHandle<()>>,
    torn_down: bool,
    event_tx: UnboundedSender<UploadEvent>,
}

impl UploadSequencer {
    pub fn new(
        cfg: &WorkflowConfig,
        session: Session,
        uploader: Arc<dyn UploadService>,
    ) -> (Self, UnboundedReceiver<UploadEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let seq = Self {
            session,
            uploader,
            share_url: cfg.share_url.clone(),
            animation_step: cfg.animation_step,
            animation_increment: cfg.animation_increment.max(1),
            reveal_delay: cfg.reveal_delay,
            state: UploadState::Collecting {
                batch: UploadBatch::default(),
                error: None,
            },
            epoch: 0,
            network_task: None,
            animation_task: None,
            reveal_task: None,
            torn_down: false,
            event_tx,
        };
        (seq, event_rx)
    }

    pub fn state(&self) -> &UploadState {
        &self.state
    }

    pub fn phase(&self) -> UploadPhase {
        self.state.phase()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn progress(&self) -> ProgressState {
        match &self.state {
            UploadState::Collecting { .. } => ProgressState::default(),
            UploadState::Submitting { progress, .. }
            | UploadState::Processing { progress, .. }
            | UploadState::Revealed { progress, .. } => *progress,
        }
    }

    pub fn items(&self) -> &[ImageItem] {
        match &self.state {
            UploadState::Collecting { batch, .. } => &batch.items,
            UploadState::Submitting { batch, .. }
            | UploadState::Processing { batch, .. }
            | UploadState::Revealed { batch, .. } => &batch.items,
        }
    }

    pub fn folder_name(&self) -> &str {
        match &self.state {
            UploadState::Collecting { batch, .. } => &batch.folder_name,
            UploadState::Submitting { batch, .. }
            | UploadState::Processing { batch, .. }
            | UploadState::Revealed { batch, .. } => &batch.folder_name,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            UploadState::Collecting { error, .. } => error.as_deref(),
            _ => None,
        }
    }

    pub fn link(&self) -> Option<&str> {
        match &self.state {
            UploadState::Revealed { link, .. } => Some(link),
            _ => None,
        }
    }

    pub fn animation_running(&self) -> bool {
        self.animation_task.is_some()
    }

    fn collecting_batch(&mut self) -> Option<&mut UploadBatch> {
        match &mut self.state {
            UploadState::Collecting { batch, .. } if !self.torn_down => Some(batch),
            _ => None,
        }
    }

    pub fn add_item(&mut self, item: ImageItem) -> bool {
        match self.collecting_batch() {
            Some(batch) => {
                batch.items.push(item);
                true
            }
            None => false,
        }
    }

    pub fn remove_item(&mut self, index: usize) -> Option<ImageItem> {
        let batch = self.collecting_batch()?;
        (index < batch.items.len()).then(|| batch.items.remove(index))
    }

    pub fn set_folder_name(&mut self, name: &str) -> bool {
        match self.collecting_batch() {
            Some(batch) => {
                batch.folder_name = name.trim().to_string();
                true
            }
            None => false,
        }
    }

    pub fn dismiss_error(&mut self) -> bool {
        match &mut self.state {
            UploadState::Collecting { error, .. } => error.take().is_some(),
            _ => false,
        }
    }

    /// Freeze the batch and send it in one request.
    pub fn submit(&mut self) -> SubmitOutcome {
        if self.torn_down {
            return SubmitOutcome::Refused;
        }
        match &self.state {
            UploadState::Collecting { batch, .. }
                if !batch.items.is_empty() && !batch.folder_name.trim().is_empty() => {}
            UploadState::Collecting { .. } | UploadState::Revealed { .. } => {
                return SubmitOutcome::Refused
            }
            UploadState::Submitting { .. } | UploadState::Processing { .. } => {
                return SubmitOutcome::InFlight
            }
        }
        let UploadState::Collecting { batch, .. } = std::mem::replace(
            &mut self.state,
            UploadState::Collecting {
                batch: UploadBatch::default(),
                error: None,
            },
        ) else {
            return SubmitOutcome::Refused;
        };

        let batch = Arc::new(batch);
        self.epoch += 1;
        let epoch = self.epoch;
        info!(
            folder = %batch.folder_name,
            items = batch.items.len(),
            bytes = batch.total_bytes(),
            "upload started"
        );
        self.state = UploadState::Submitting {
            batch: batch.clone(),
            progress: ProgressState::default(),
        };

        let progress_tx = self.event_tx.clone();
        let progress: ProgressFn = Arc::new(move |sent, total| {
            let _ = progress_tx.send(UploadEvent::Progress { epoch, sent, total });
        });
        let uploader = self.uploader.clone();
        let tx = self.event_tx.clone();
        self.network_task = Some(tokio::spawn(async move {
            let outcome = uploader.upload(batch, progress).await;
            let _ = tx.send(UploadEvent::NetworkSettled { epoch, outcome });
        }));
        SubmitOutcome::Started
    }

    /// Apply one event. Returns whether the visible state changed.
    pub fn apply(&mut self, event: UploadEvent) -> bool {
        if self.torn_down || event.epoch() != self.epoch {
            debug!(epoch = event.epoch(), current = self.epoch, "stale upload event discarded");
            return false;
        }
        match event {
            UploadEvent::Progress { sent, total, .. } => match &mut self.state {
                UploadState::Submitting { progress, .. } => {
                    let before = progress.network_percent;
                    progress.observe_network(sent, total);
                    progress.network_percent != before
                }
                _ => false,
            },
            UploadEvent::NetworkSettled { outcome, .. } => self.apply_network(outcome),
            UploadEvent::AnimationTick { .. } => self.apply_animation_tick(),
            UploadEvent::RevealDue { .. } => self.apply_reveal(),
        }
    }

    fn apply_network(&mut self, outcome: Result<UploadAck, WorkflowError>) -> bool {
        let placeholder = UploadState::Collecting {
            batch: UploadBatch::default(),
            error: None,
        };
        let state = std::mem::replace(&mut self.state, placeholder);
        let UploadState::Submitting {
            batch,
            mut progress,
        } = state
        else {
            self.state = state;
            return false;
        };
        self.network_task = None;

        match outcome {
            Ok(ack) => {
                info!(message = %ack.message, "upload acknowledged");
                progress.network_percent = 100;
                progress.network_done = true;
                self.state = UploadState::Processing { batch, progress };
                self.start_animation();
            }
            Err(e) => {
                warn!(error = %e, "upload failed");
                let batch = Arc::try_unwrap(batch).unwrap_or_else(|shared| (*shared).clone());
                self.state = UploadState::Collecting {
                    batch,
                    error: Some(e.to_string()),
                };
            }
        }
        true
    }

    fn apply_animation_tick(&mut self) -> bool {
        let UploadState::Processing { progress, .. } = &mut self.state else {
            return false;
        };
        progress.advance_animation(self.animation_increment);
        if progress.animation_percent >= 100 {
            self.stop_animation();
            self.schedule_reveal();
        }
        true
    }

    fn apply_reveal(&mut self) -> bool {
        let placeholder = UploadState::Collecting {
            batch: UploadBatch::default(),
            error: None,
        };
        let state = std::mem::replace(&mut self.state, placeholder);
        match state {
            UploadState::Processing { batch, progress } if progress.reveal_ready() => {
                self.reveal_task = None;
                let link = share_link(&self.share_url, &batch.folder_name);
                info!(%link, session = %self.session.id, "session link revealed");
                self.state = UploadState::Revealed {
                    batch,
                    progress,
                    link,
                };
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }

    fn start_animation(&mut self) {
        let step = self.animation_step;
        let epoch = self.epoch;
        let tx = self.event_tx.clone();
        self.animation_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + step, step);
            loop {
                ticker.tick().await;
                if tx.send(UploadEvent::AnimationTick { epoch }).is_err() {
                    break;
                }
            }
        }));
        debug!(?step, "processing animation started");
    }

    fn stop_animation(&mut self) {
        if let Some(h) = self.animation_task.take() {
            h.abort();
        }
    }

    fn schedule_reveal(&mut self) {
        let delay = self.reveal_delay;
        let epoch = self.epoch;
        let tx = self.event_tx.clone();
        self.reveal_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(UploadEvent::RevealDue { epoch });
        }));
    }

    /// Cancel the request and both timers. Nothing is applied afterwards.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.torn_down = true;
        self.epoch += 1;
        for h in [
            self.network_task.take(),
            self.animation_task.take(),
            self.reveal_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            h.abort();
        }
        debug!("upload sequencer torn down");
    }
}

impl Drop for UploadSequencer {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// `{share_url}/facescan/{folder}` with the folder name percent-encoded.
pub fn share_link(share_url: &str, folder: &str) -> String {
    if let Ok(mut url) = reqwest::Url::parse(share_url) {
        let ok = match url.path_segments_mut() {
            Ok(mut segs) => {
                segs.pop_if_empty().push("facescan").push(folder);
                true
            }
            Err(()) => false,
        };
        if ok {
            return url.to_string();
        }
    }
    format!("{}/facescan/{}", share_url.trim_end_matches('/'), folder)
}
