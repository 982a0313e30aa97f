//! Gradual bitrate ramp applied after the session goes live.
//!
//! Starting encoders at their full target bitrate right after ICE settles
//! tends to trip congestion control. The ramper instead walks the video
//! cap up in fixed steps and pins the audio cap once, on the first step.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Debug, Clone, Copy)]
pub struct RampConfig {
    /// Total wall time from zero to the full video cap.
    pub duration: Duration,
    pub steps: u32,
    pub max_video_bps: u64,
    pub max_audio_bps: u64,
}

impl Default for RampConfig {
    fn default() -> Self {
        RampConfig {
            duration: Duration::from_millis(3000),
            steps: 8,
            max_video_bps: 1_000_000,
            max_audio_bps: 64_000,
        }
    }
}

/// Where ramp output lands. The production sink is [`BitrateControls`];
/// tests substitute a recording sink.
pub trait BitrateSink: Send + Sync {
    fn set_video_cap(&self, bps: u64);
    fn set_audio_cap(&self, bps: u64);
}

/// Current encoder bitrate caps. `None` means uncapped (not yet ramped).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BitrateAllocation {
    pub video_bps: Option<u64>,
    pub audio_bps: Option<u64>,
}

/// Watch-channel sender the embedding application's encoders subscribe
/// to. Each cap update is observed as a fresh [`BitrateAllocation`].
#[derive(Debug)]
pub struct BitrateControls {
    tx: watch::Sender<BitrateAllocation>,
}

impl BitrateControls {
    pub fn new() -> (Self, watch::Receiver<BitrateAllocation>) {
        let (tx, rx) = watch::channel(BitrateAllocation::default());
        (BitrateControls { tx }, rx)
    }
}

impl Default for BitrateControls {
    fn default() -> Self {
        Self::new().0
    }
}

impl BitrateSink for BitrateControls {
    fn set_video_cap(&self, bps: u64) {
        self.tx.send_modify(|alloc| alloc.video_bps = Some(bps));
    }

    fn set_audio_cap(&self, bps: u64) {
        self.tx.send_modify(|alloc| alloc.audio_bps = Some(bps));
    }
}

/// Drives the step schedule on a background task. Restartable: a second
/// `start` cancels the first schedule before launching the new one, so at
/// most one schedule is ever active.
pub struct BitrateRamper {
    config: RampConfig,
    cancelled: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl BitrateRamper {
    pub fn new(config: RampConfig) -> Self {
        BitrateRamper { config, cancelled: Arc::new(AtomicBool::new(false)), task: None }
    }

    pub fn start(&mut self, sink: Arc<dyn BitrateSink>) {
        self.stop();

        let config = self.config;
        let cancelled = Arc::new(AtomicBool::new(false));
        self.cancelled = cancelled.clone();

        self.task = Some(tokio::spawn(async move {
            let steps = config.steps.max(1);
            let step_duration = config.duration / steps;
            for step in 1..=steps as u64 {
                sleep(step_duration).await;
                // Cancellation wins over a step that was already due.
                if cancelled.load(Ordering::Acquire) {
                    return;
                }
                if step == 1 {
                    sink.set_audio_cap(config.max_audio_bps);
                }
                let video_bps = config.max_video_bps * step / steps as u64;
                debug!("bitrate ramp step {step}/{steps}: video cap {video_bps} bps");
                sink.set_video_cap(video_bps);
            }
        }));
    }

    /// Cancel the active schedule, if any. Idempotent.
    pub fn stop(&mut self) {
        self.cancelled.store(true, Ordering::Release);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for BitrateRamper {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        video: Mutex<Vec<u64>>,
        audio: Mutex<Vec<u64>>,
    }

    impl BitrateSink for RecordingSink {
        fn set_video_cap(&self, bps: u64) {
            self.video.lock().unwrap().push(bps);
        }

        fn set_audio_cap(&self, bps: u64) {
            self.audio.lock().unwrap().push(bps);
        }
    }

    fn fast_config() -> RampConfig {
        RampConfig {
            duration: Duration::from_millis(40),
            steps: 4,
            max_video_bps: 1_000_000,
            max_audio_bps: 64_000,
        }
    }

    #[tokio::test]
    async fn ramp_reaches_full_caps_in_even_steps() {
        let sink = Arc::new(RecordingSink::default());
        let mut ramper = BitrateRamper::new(fast_config());
        ramper.start(sink.clone());
        sleep(Duration::from_millis(120)).await;

        assert_eq!(
            *sink.video.lock().unwrap(),
            vec![250_000, 500_000, 750_000, 1_000_000]
        );
        assert_eq!(*sink.audio.lock().unwrap(), vec![64_000]);
    }

    #[tokio::test]
    async fn stop_cancels_pending_steps() {
        let sink = Arc::new(RecordingSink::default());
        let mut ramper = BitrateRamper::new(RampConfig {
            duration: Duration::from_millis(400),
            steps: 4,
            ..fast_config()
        });
        ramper.start(sink.clone());
        sleep(Duration::from_millis(150)).await;
        ramper.stop();
        let seen = sink.video.lock().unwrap().len();
        sleep(Duration::from_millis(300)).await;

        assert!(seen < 4);
        assert_eq!(sink.video.lock().unwrap().len(), seen);
    }

    #[tokio::test]
    async fn restart_abandons_the_previous_schedule() {
        let sink = Arc::new(RecordingSink::default());
        let mut ramper = BitrateRamper::new(fast_config());
        ramper.start(sink.clone());
        ramper.start(sink.clone());
        sleep(Duration::from_millis(120)).await;

        // One schedule's worth of output, not two interleaved.
        assert_eq!(
            *sink.video.lock().unwrap(),
            vec![250_000, 500_000, 750_000, 1_000_000]
        );
        assert_eq!(*sink.audio.lock().unwrap(), vec![64_000]);
    }

    #[tokio::test]
    async fn controls_publish_allocations() {
        let (controls, rx) = BitrateControls::new();
        assert_eq!(*rx.borrow(), BitrateAllocation::default());

        controls.set_audio_cap(64_000);
        controls.set_video_cap(500_000);
        assert_eq!(
            *rx.borrow(),
            BitrateAllocation { video_bps: Some(500_000), audio_bps: Some(64_000) }
        );
    }
}
