//! Capture → identity → match submission workflow.
//!
//! The workflow is owned by a single task. Probe results and service replies
//! come back as [`ScanEvent`]s through one channel and are applied with
//! [`ScanWorkflow::apply`]; each carries the token or epoch it was issued
//! under, and anything issued before a stop, retry or teardown is dropped.

use crate::engine::{FrameSource, MatchRequest, MatchService, ReadyModel};
use crate::error::WorkflowError;
use crate::model::{
    Capture, DownloadArtifact, Frame, IdentityInfo, MatchResult, Session, WorkflowConfig,
};
use crate::orchestrator::poller::{DetectionPoller, PollToken, PolledSample, SampleSink};
use crate::orchestrator::session::SessionSource;
use crate::orchestrator::SubmitOutcome;
use base64::Engine as _;
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum ScanEvent {
    Sample(PolledSample),
    MatchSettled {
        epoch: u64,
        outcome: Result<Vec<MatchResult>, WorkflowError>,
    },
}

/// Most recent frame that passed the presence rule.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub frame: Frame,
    pub score: f64,
}

#[derive(Debug, Clone)]
pub enum ScanState {
    Scanning {
        face_detected: bool,
        snapshot: Option<Snapshot>,
    },
    Captured {
        capture: Capture,
    },
    AwaitingIdentity {
        capture: Capture,
        identity: IdentityInfo,
        error: Option<String>,
    },
    Submitting {
        capture: Capture,
        identity: IdentityInfo,
    },
    Result {
        capture: Capture,
        identity: IdentityInfo,
        matches: Vec<MatchResult>,
    },
}

impl ScanState {
    fn scanning() -> Self {
        ScanState::Scanning {
            face_detected: false,
            snapshot: None,
        }
    }

    pub fn phase(&self) -> ScanPhase {
        match self {
            ScanState::Scanning { .. } => ScanPhase::Scanning,
            ScanState::Captured { .. } => ScanPhase::Captured,
            ScanState::AwaitingIdentity { .. } => ScanPhase::AwaitingIdentity,
            ScanState::Submitting { .. } => ScanPhase::Submitting,
            ScanState::Result { .. } => ScanPhase::Result,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanPhase {
    Scanning,
    Captured,
    AwaitingIdentity,
    Submitting,
    Result,
}

impl fmt::Display for ScanPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScanPhase::Scanning => "scanning",
            ScanPhase::Captured => "captured",
            ScanPhase::AwaitingIdentity => "awaiting identity",
            ScanPhase::Submitting => "submitting",
            ScanPhase::Result => "result",
        };
        f.write_str(s)
    }
}

pub struct ScanWorkflow {
    sessions: SessionSource,
    session: Session,
    model: ReadyModel,
    frames: Arc<dyn FrameSource>,
    matcher: Arc<dyn MatchService>,
    poll_interval: Duration,
    auto_capture: bool,

    poller: DetectionPoller,
    poll_token: Option<PollToken>,
    state: ScanState,
    submit_epoch: u64,
    submit_task: Option<JoinHandle<()>>,
    torn_down: bool,
    event_tx: UnboundedSender<ScanEvent>,
}

impl ScanWorkflow {
    /// Enter `Scanning` and start the poller. Requires a loaded model, so a
    /// missing model keeps the workflow from ever starting.
    pub fn start(
        cfg: &WorkflowConfig,
        sessions: SessionSource,
        model: ReadyModel,
        frames: Arc<dyn FrameSource>,
        matcher: Arc<dyn MatchService>,
    ) -> (Self, UnboundedReceiver<ScanEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let session = sessions.next();
        let mut wf = Self {
            sessions,
            session,
            model,
            frames,
            matcher,
            poll_interval: cfg.poll_interval,
            auto_capture: cfg.auto_capture,
            poller: DetectionPoller::new(),
            poll_token: None,
            state: ScanState::scanning(),
            submit_epoch: 0,
            submit_task: None,
            torn_down: false,
            event_tx,
        };
        wf.start_polling();
        info!(session = %wf.session.id, "scanning");
        (wf, event_rx)
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn phase(&self) -> ScanPhase {
        self.state.phase()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn face_detected(&self) -> bool {
        matches!(
            self.state,
            ScanState::Scanning {
                face_detected: true,
                ..
            }
        )
    }

    pub fn auto_capture(&self) -> bool {
        self.auto_capture
    }

    pub fn is_polling(&self) -> bool {
        self.poller.is_running()
    }

    pub fn capture(&self) -> Option<&Capture> {
        match &self.state {
            ScanState::Scanning { .. } => None,
            ScanState::Captured { capture }
            | ScanState::AwaitingIdentity { capture, .. }
            | ScanState::Submitting { capture, .. }
            | ScanState::Result { capture, .. } => Some(capture),
        }
    }

    pub fn identity(&self) -> Option<&IdentityInfo> {
        match &self.state {
            ScanState::AwaitingIdentity { identity, .. }
            | ScanState::Submitting { identity, .. }
            | ScanState::Result { identity, .. } => Some(identity),
            _ => None,
        }
    }

    pub fn matches(&self) -> &[MatchResult] {
        match &self.state {
            ScanState::Result { matches, .. } => matches,
            _ => &[],
        }
    }

    pub fn last_error(&self) -> Option<&str> {
        match &self.state {
            ScanState::AwaitingIdentity { error, .. } => error.as_deref(),
            _ => None,
        }
    }

    /// Apply one event. Returns whether the visible state changed.
    pub fn apply(&mut self, event: ScanEvent) -> bool {
        if self.torn_down {
            return false;
        }
        match event {
            ScanEvent::Sample(polled) => self.apply_sample(polled),
            ScanEvent::MatchSettled { epoch, outcome } => self.apply_match(epoch, outcome),
        }
    }

    fn apply_sample(&mut self, polled: PolledSample) -> bool {
        if self.poll_token != Some(polled.token) || !self.poller.is_live(polled.token) {
            debug!("stale detection sample discarded");
            return false;
        }
        let ScanState::Scanning {
            face_detected,
            snapshot,
        } = &mut self.state
        else {
            return false;
        };

        let present = polled.sample.is_present();
        debug!(
            age_ms = polled.sample.timestamp.elapsed().as_millis() as u64,
            present,
            "detection sample"
        );
        let changed = *face_detected != present;
        *face_detected = present;
        if present {
            *snapshot = Some(Snapshot {
                frame: polled.frame,
                score: polled.sample.score.unwrap_or_default(),
            });
        }

        if present && self.auto_capture {
            return self.capture_frame() || changed;
        }
        changed
    }

    fn apply_match(
        &mut self,
        epoch: u64,
        outcome: Result<Vec<MatchResult>, WorkflowError>,
    ) -> bool {
        if epoch != self.submit_epoch {
            debug!(epoch, current = self.submit_epoch, "stale match response discarded");
            return false;
        }
        let state = std::mem::replace(&mut self.state, ScanState::scanning());
        let ScanState::Submitting { capture, identity } = state else {
            self.state = state;
            return false;
        };
        self.submit_task = None;

        self.state = match outcome {
            Ok(matches) => {
                info!(count = matches.len(), "match results received");
                ScanState::Result {
                    capture,
                    identity,
                    matches,
                }
            }
            Err(e) => {
                warn!(error = %e, "match submission failed");
                ScanState::AwaitingIdentity {
                    capture,
                    identity,
                    error: Some(e.to_string()),
                }
            }
        };
        true
    }

    /// Freeze the current snapshot. Only acts while scanning with a face
    /// present right now.
    pub fn capture_frame(&mut self) -> bool {
        let ScanState::Scanning {
            face_detected: true,
            snapshot: Some(snap),
        } = &self.state
        else {
            debug!(phase = %self.phase(), "capture refused: no face in view");
            return false;
        };
        let capture = Capture {
            image: snap.frame.data.clone(),
            source_score: snap.score,
        };
        self.stop_polling();
        info!(score = capture.source_score, "frame captured");
        self.state = ScanState::Captured { capture };
        true
    }

    /// Open the identity gate after a capture.
    pub fn request_identity(&mut self) -> bool {
        let state = std::mem::replace(&mut self.state, ScanState::scanning());
        match state {
            ScanState::Captured { capture } => {
                self.state = ScanState::AwaitingIdentity {
                    capture,
                    identity: IdentityInfo::default(),
                    error: None,
                };
                true
            }
            other => {
                self.state = other;
                false
            }
        }
    }

    /// Edit the contact id. Opens the identity gate if it is not open yet.
    pub fn set_contact(&mut self, contact_id: &str) -> bool {
        if matches!(self.state, ScanState::Captured { .. }) {
            self.request_identity();
        }
        match &mut self.state {
            ScanState::AwaitingIdentity { identity, .. } => {
                *identity = IdentityInfo::new(contact_id);
                true
            }
            _ => false,
        }
    }

    pub fn dismiss_error(&mut self) -> bool {
        match &mut self.state {
            ScanState::AwaitingIdentity { error, .. } => error.take().is_some(),
            _ => false,
        }
    }

    /// Send the capture to the match service. The move to `Submitting` and
    /// the issue of the request happen together, so a second call while the
    /// first is pending is a no-op.
    pub fn submit(&mut self) -> SubmitOutcome {
        let (capture, identity) = match &self.state {
            ScanState::Submitting { .. } => {
                debug!("submission already in flight");
                return SubmitOutcome::InFlight;
            }
            ScanState::AwaitingIdentity {
                capture, identity, ..
            } if identity.is_valid() => (capture.clone(), identity.clone()),
            _ => return SubmitOutcome::Refused,
        };

        self.submit_epoch += 1;
        let epoch = self.submit_epoch;
        let req = MatchRequest {
            image: capture.image.clone(),
            session_id: self.session.id.clone(),
            contact_id: identity.contact_id.trim().to_string(),
        };
        self.state = ScanState::Submitting { capture, identity };

        let matcher = self.matcher.clone();
        let tx = self.event_tx.clone();
        self.submit_task = Some(tokio::spawn(async move {
            let outcome = matcher.find_matches(req).await;
            let _ = tx.send(ScanEvent::MatchSettled { epoch, outcome });
        }));
        info!(session = %self.session.id, "match request sent");
        SubmitOutcome::Started
    }

    /// Decode one match image into a file artifact.
    pub fn download(&self, index: usize) -> Result<DownloadArtifact, WorkflowError> {
        let matches = self.matches();
        let m = matches.get(index).ok_or(WorkflowError::InvalidIndex {
            index,
            len: matches.len(),
        })?;
        let bytes = decode_image(&m.image)?;
        let file_name = m
            .filename
            .as_deref()
            .and_then(|f| f.rsplit('/').next())
            .filter(|f| !f.is_empty())
            .map(str::to_owned)
            .unwrap_or_else(|| format!("match-{}-{}.jpg", self.session.id, index + 1));
        Ok(DownloadArtifact { file_name, bytes })
    }

    /// Drop capture, identity and results, take a new session and scan again.
    pub fn retry(&mut self) {
        if self.torn_down {
            return;
        }
        self.stop_polling();
        self.cancel_submission();
        self.session = self.sessions.next();
        self.state = ScanState::scanning();
        self.start_polling();
        info!(session = %self.session.id, "retry: scanning");
    }

    /// Cancel all timers and requests. Nothing is applied afterwards.
    pub fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        self.stop_polling();
        self.cancel_submission();
        self.torn_down = true;
        debug!("scan workflow torn down");
    }

    fn start_polling(&mut self) {
        let tx = self.event_tx.clone();
        let sink: SampleSink = Arc::new(move |s| {
            let _ = tx.send(ScanEvent::Sample(s));
        });
        let token = self.poller.start(
            self.model.clone(),
            self.frames.clone(),
            self.poll_interval,
            sink,
        );
        self.poll_token = Some(token);
    }

    fn stop_polling(&mut self) {
        self.poller.stop();
        self.poll_token = None;
    }

    fn cancel_submission(&mut self) {
        self.submit_epoch += 1;
        if let Some(h) = self.submit_task.take() {
            h.abort();
        }
    }
}

impl Drop for ScanWorkflow {
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Decode a base64 image, tolerating a `data:` URL prefix.
fn decode_image(encoded: &str) -> Result<Bytes, WorkflowError> {
    let payload = match encoded.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        _ => encoded,
    };
    let bytes = base64::engine::general_purpose::STANDARD.decode(payload.trim())?;
    Ok(Bytes::from(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::{
        sample_matches, single_frame, FakeMatcher, ScriptedModel,
    };
    use tokio::sync::Notify;

    const INTERVAL: Duration = Duration::from_millis(100);

    struct Harness {
        wf: ScanWorkflow,
        rx: UnboundedReceiver<ScanEvent>,
        model: Arc<ScriptedModel>,
        matcher: Arc<FakeMatcher>,
    }

    async fn harness(model: ScriptedModel, matcher: FakeMatcher, auto_capture: bool) -> Harness {
        let cfg = WorkflowConfig {
            poll_interval: INTERVAL,
            auto_capture,
            ..WorkflowConfig::default()
        };
        let model = Arc::new(model);
        let matcher = Arc::new(matcher);
        let ready = ReadyModel::load(model.clone()).await.unwrap();
        let (wf, rx) = ScanWorkflow::start(
            &cfg,
            SessionSource::new(Some("gala-night".into())),
            ready,
            single_frame(),
            matcher.clone(),
        );
        Harness {
            wf,
            rx,
            model,
            matcher,
        }
    }

    impl Harness {
        async fn pump(&mut self) -> bool {
            let ev = self.rx.recv().await.unwrap();
            self.wf.apply(ev)
        }

        async fn pump_until(&mut self, phase: ScanPhase) {
            while self.wf.phase() != phase {
                self.pump().await;
            }
        }

        async fn pump_while(&mut self, phase: ScanPhase) {
            while self.wf.phase() == phase {
                self.pump().await;
            }
        }

        async fn pump_until_face(&mut self) {
            while !self.wf.face_detected() {
                self.pump().await;
            }
        }

        async fn reach_result(&mut self) {
            self.pump_until_face().await;
            assert!(self.wf.capture_frame());
            assert!(self.wf.set_contact("guest@example.com"));
            assert_eq!(self.wf.submit(), SubmitOutcome::Started);
            self.pump_until(ScanPhase::Result).await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn capture_requires_face_at_action_time() {
        let mut h = harness(ScriptedModel::fixed(Some(0.8)), FakeMatcher::answering(vec![]), false).await;
        h.pump().await;
        assert!(!h.wf.face_detected());
        assert!(!h.wf.capture_frame());
        assert_eq!(h.wf.phase(), ScanPhase::Scanning);

        h.model.set_score(Some(0.93));
        h.pump_until_face().await;
        h.model.set_score(None);
        while h.wf.face_detected() {
            h.pump().await;
        }
        // The flag is re-read at action time, a stale earlier hit does not count.
        assert!(!h.wf.capture_frame());

        h.model.set_score(Some(0.93));
        h.pump_until_face().await;
        assert!(h.wf.capture_frame());
        assert_eq!(h.wf.phase(), ScanPhase::Captured);
        assert!(!h.wf.is_polling());
        assert_eq!(h.wf.capture().unwrap().source_score, 0.93);
    }

    #[tokio::test(start_paused = true)]
    async fn late_sample_after_capture_is_ignored() {
        let mut h = harness(
            ScriptedModel::fixed(Some(0.95)),
            FakeMatcher::answering(vec![]),
            false,
        )
        .await;
        h.pump_until_face().await;
        let stale = ScanEvent::Sample(PolledSample {
            token: h.wf.poll_token.unwrap(),
            frame: h.wf.frames.current_frame().unwrap(),
            sample: crate::model::DetectionSample::from_detection(None),
        });
        assert!(h.wf.capture_frame());

        assert!(!h.wf.apply(stale));
        assert_eq!(h.wf.phase(), ScanPhase::Captured);
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_probe_after_stop_leaves_flag_unchanged() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(
            ScriptedModel::gated(Some(0.97), gate.clone()),
            FakeMatcher::answering(vec![]),
            false,
        )
        .await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.model.calls(), 1);

        h.wf.stop_polling();
        gate.notify_one();
        tokio::time::sleep(INTERVAL * 5).await;

        while let Ok(ev) = h.rx.try_recv() {
            assert!(!h.wf.apply(ev));
        }
        assert!(!h.wf.face_detected());
    }

    #[tokio::test(start_paused = true)]
    async fn blank_contact_blocks_submission() {
        let mut h = harness(
            ScriptedModel::fixed(Some(0.9)),
            FakeMatcher::answering(sample_matches()),
            false,
        )
        .await;
        h.pump_until_face().await;
        assert!(h.wf.capture_frame());
        assert_eq!(h.wf.submit(), SubmitOutcome::Refused);

        assert!(h.wf.request_identity());
        for blank in ["", "   ", "\t\n"] {
            h.wf.set_contact(blank);
            assert_eq!(h.wf.submit(), SubmitOutcome::Refused);
            assert_eq!(h.wf.phase(), ScanPhase::AwaitingIdentity);
        }
        tokio::time::sleep(INTERVAL * 3).await;
        assert_eq!(h.matcher.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_submit_issues_one_request() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(
            ScriptedModel::fixed(Some(0.9)),
            FakeMatcher::gated(sample_matches(), gate.clone()),
            false,
        )
        .await;
        h.pump_until_face().await;
        h.wf.capture_frame();
        h.wf.set_contact("  +1 555 0100  ");

        assert_eq!(h.wf.submit(), SubmitOutcome::Started);
        assert_eq!(h.wf.submit(), SubmitOutcome::InFlight);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(h.matcher.calls(), 1);

        let req = h.matcher.last_request().unwrap();
        assert_eq!(req.session_id, "gala-night");
        assert_eq!(req.contact_id, "+1 555 0100");

        gate.notify_one();
        h.pump_until(ScanPhase::Result).await;
        assert_eq!(h.matcher.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn results_keep_service_order() {
        let mut h = harness(
            ScriptedModel::fixed(Some(0.9)),
            FakeMatcher::answering(sample_matches()),
            false,
        )
        .await;
        h.reach_result().await;
        let sims: Vec<f64> = h.wf.matches().iter().map(|m| m.similarity).collect();
        assert_eq!(sims, vec![0.72, 0.91]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_submission_returns_to_identity_gate() {
        let mut h = harness(
            ScriptedModel::fixed(Some(0.9)),
            FakeMatcher::failing("No face detected in the input image"),
            false,
        )
        .await;
        h.pump_until_face().await;
        h.wf.capture_frame();
        h.wf.set_contact("guest");
        assert_eq!(h.wf.submit(), SubmitOutcome::Started);
        h.pump_while(ScanPhase::Submitting).await;

        assert_eq!(h.wf.phase(), ScanPhase::AwaitingIdentity);
        assert!(h.wf.capture().is_some());
        assert_eq!(h.wf.identity().unwrap().contact_id, "guest");
        assert!(h.wf.last_error().unwrap().contains("No face detected"));
        assert!(h.wf.matches().is_empty());

        // No automatic retry; the user submits again with the same capture.
        assert_eq!(h.matcher.calls(), 1);
        assert!(h.wf.dismiss_error());
        assert!(h.wf.last_error().is_none());
        h.matcher.respond_with(Ok(sample_matches()));
        assert_eq!(h.wf.submit(), SubmitOutcome::Started);
        h.pump_until(ScanPhase::Result).await;
        assert_eq!(h.wf.matches().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_clears_everything_and_restarts_polling() {
        let mut h = harness(
            ScriptedModel::fixed(Some(0.9)),
            FakeMatcher::answering(sample_matches()),
            false,
        )
        .await;
        h.reach_result().await;
        assert!(!h.wf.matches().is_empty());
        let calls_before = h.model.calls();

        h.wf.retry();
        assert_eq!(h.wf.phase(), ScanPhase::Scanning);
        assert!(h.wf.capture().is_none());
        assert!(h.wf.identity().is_none());
        assert!(h.wf.matches().is_empty());
        assert!(!h.wf.face_detected());
        assert!(h.wf.is_polling());
        assert_eq!(h.wf.session().id, "gala-night");

        tokio::time::sleep(INTERVAL).await;
        assert!(h.model.calls() > calls_before);
        assert!(h.pump().await);
        assert!(h.wf.face_detected());
    }

    #[tokio::test(start_paused = true)]
    async fn retry_while_submitting_discards_late_response() {
        let gate = Arc::new(Notify::new());
        let mut h = harness(
            ScriptedModel::fixed(Some(0.9)),
            FakeMatcher::gated(sample_matches(), gate.clone()),
            false,
        )
        .await;
        h.pump_until_face().await;
        h.wf.capture_frame();
        h.wf.set_contact("guest");
        h.wf.submit();
        let stale_epoch = h.wf.submit_epoch;

        h.wf.retry();
        let late = ScanEvent::MatchSettled {
            epoch: stale_epoch,
            outcome: Ok(sample_matches()),
        };
        assert!(!h.wf.apply(late));
        assert_eq!(h.wf.phase(), ScanPhase::Scanning);
        assert!(h.wf.matches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn auto_capture_fires_on_first_present_sample() {
        let mut h = harness(
            ScriptedModel::fixed(Some(0.85)),
            FakeMatcher::answering(vec![]),
            true,
        )
        .await;
        h.pump_until(ScanPhase::Captured).await;
        assert!(!h.wf.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn download_decodes_payload() {
        let mut h = harness(
            ScriptedModel::fixed(Some(0.9)),
            FakeMatcher::answering(sample_matches()),
            false,
        )
        .await;
        h.reach_result().await;

        let art = h.wf.download(1).unwrap();
        assert_eq!(art.file_name, "1.jpg");
        assert_eq!(&art.bytes[..], b"hello world");

        let encoded = &h.wf.matches()[0].image;
        let expected = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap()
            .len();
        assert_eq!(h.wf.download(0).unwrap().bytes.len(), expected);

        assert!(matches!(
            h.wf.download(5),
            Err(WorkflowError::InvalidIndex { index: 5, len: 2 })
        ));
    }

    #[test]
    fn decode_accepts_data_url() {
        let b = decode_image("data:image/jpeg;base64,aGk=").unwrap();
        assert_eq!(&b[..], b"hi");
        assert!(decode_image("not base64!!").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn teardown_stops_everything() {
        let mut h = harness(
            ScriptedModel::fixed(Some(0.9)),
            FakeMatcher::answering(vec![]),
            false,
        )
        .await;
        h.wf.teardown();
        assert!(!h.wf.is_polling());
        tokio::time::sleep(INTERVAL * 3).await;
        while let Ok(ev) = h.rx.try_recv() {
            assert!(!h.wf.apply(ev));
        }
        assert!(!h.wf.face_detected());
    }
}
