//! Fixed-interval face detection loop.
//!
//! Each tick probes the current frame on its own task. A tick that finds the
//! previous probe still pending is skipped, never queued. Every start hands out
//! a fresh [`PollToken`]; `stop` invalidates it, and results carrying a stale
//! token are dropped both here and by the consumer.

use crate::engine::{FrameSource, ReadyModel};
use crate::model::{DetectionSample, Frame};
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

/// Liveness token of one poller run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollToken(u64);

#[derive(Debug, Clone)]
pub struct PolledSample {
    pub token: PollToken,
    pub frame: Frame,
    pub sample: DetectionSample,
}

pub type SampleSink = Arc<dyn Fn(PolledSample) + Send + Sync>;

pub struct DetectionPoller {
    generation: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl Default for DetectionPoller {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectionPoller {
    pub fn new() -> Self {
        Self {
            generation: Arc::new(AtomicU64::new(0)),
            handle: None,
        }
    }

    /// Start probing every `interval`. Restarting implicitly stops the previous run.
    pub fn start(
        &mut self,
        model: ReadyModel,
        frames: Arc<dyn FrameSource>,
        interval: Duration,
        sink: SampleSink,
    ) -> PollToken {
        self.stop();
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let token = PollToken(generation);
        let live = self.generation.clone();

        let handle = tokio::spawn(async move {
            let busy = Arc::new(AtomicBool::new(false));
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;
                if live.load(Ordering::SeqCst) != generation {
                    break;
                }
                if busy.swap(true, Ordering::SeqCst) {
                    trace!("probe still pending, tick skipped");
                    continue;
                }
                let Some(frame) = frames.current_frame() else {
                    busy.store(false, Ordering::SeqCst);
                    continue;
                };

                let model = model.clone();
                let live = live.clone();
                let busy = busy.clone();
                let sink = sink.clone();
                tokio::spawn(async move {
                    let detection = match model.detect(&frame).await {
                        Ok(d) => d,
                        Err(e) => {
                            warn!(error = %e, frame = %frame.label, "detection probe failed");
                            None
                        }
                    };
                    busy.store(false, Ordering::SeqCst);
                    if live.load(Ordering::SeqCst) != generation {
                        debug!("probe resolved after stop, result discarded");
                        return;
                    }
                    sink(PolledSample {
                        token,
                        frame,
                        sample: DetectionSample::from_detection(detection),
                    });
                });
            }
        });
        self.handle = Some(handle);
        debug!(?interval, "detection poller started");
        token
    }

    /// Cancel the timer. No sample of the current run is delivered after this returns.
    pub fn stop(&mut self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        if let Some(h) = self.handle.take() {
            h.abort();
            debug!("detection poller stopped");
        }
    }

    pub fn is_live(&self, token: PollToken) -> bool {
        self.handle.is_some() && self.generation.load(Ordering::SeqCst) == token.0
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }
}

impl Drop for DetectionPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::testing::{single_frame, ScriptedModel};
    use tokio::sync::{mpsc, Notify};

    fn channel_sink() -> (SampleSink, mpsc::UnboundedReceiver<PolledSample>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink: SampleSink = Arc::new(move |s| {
            let _ = tx.send(s);
        });
        (sink, rx)
    }

    #[tokio::test(start_paused = true)]
    async fn emits_a_sample_every_interval() {
        let model = Arc::new(ScriptedModel::fixed(Some(0.95)));
        let ready = ReadyModel::load(model.clone()).await.unwrap();
        let (sink, mut rx) = channel_sink();
        let mut poller = DetectionPoller::new();
        let token = poller.start(ready, single_frame(), Duration::from_millis(100), sink);

        for _ in 0..3 {
            let s = rx.recv().await.unwrap();
            assert_eq!(s.token, token);
            assert!(s.sample.is_present());
        }
        assert!(poller.is_live(token));
        poller.stop();
        assert!(!poller.is_live(token));
    }

    #[tokio::test(start_paused = true)]
    async fn busy_probe_skips_ticks_instead_of_queueing() {
        let gate = Arc::new(Notify::new());
        let model = Arc::new(ScriptedModel::gated(Some(0.9), gate.clone()));
        let ready = ReadyModel::load(model.clone()).await.unwrap();
        let (sink, mut rx) = channel_sink();
        let mut poller = DetectionPoller::new();
        poller.start(ready, single_frame(), Duration::from_millis(100), sink);

        // Ten intervals pass while the first probe is stuck.
        tokio::time::sleep(Duration::from_millis(1_050)).await;
        assert_eq!(model.calls(), 1);

        gate.notify_one();
        let first = rx.recv().await.unwrap();
        assert!(first.sample.is_present());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(model.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_resolving_after_stop_is_discarded() {
        let gate = Arc::new(Notify::new());
        let model = Arc::new(ScriptedModel::gated(Some(0.99), gate.clone()));
        let ready = ReadyModel::load(model.clone()).await.unwrap();
        let (sink, mut rx) = channel_sink();
        let mut poller = DetectionPoller::new();
        let token = poller.start(ready, single_frame(), Duration::from_millis(100), sink);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(model.calls(), 1);
        poller.stop();

        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
        assert!(!poller.is_live(token));
        assert_eq!(model.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_invalidates_previous_token() {
        let model = Arc::new(ScriptedModel::fixed(None));
        let ready = ReadyModel::load(model).await.unwrap();
        let (sink, _rx) = channel_sink();
        let mut poller = DetectionPoller::new();
        let first = poller.start(ready.clone(), single_frame(), Duration::from_millis(100), sink.clone());
        let second = poller.start(ready, single_frame(), Duration::from_millis(100), sink);
        assert_ne!(first, second);
        assert!(!poller.is_live(first));
        assert!(poller.is_live(second));
    }
}
