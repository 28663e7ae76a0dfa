//! Capture thread: poll the source, publish each new frame pair.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use metrics::{counter, histogram};
use tracing::{debug, info, warn};

use super::state::SharedFrameState;
use super::stats::{FpsMeter, PipelineCounters};
use crate::capture::FrameSource;
use crate::Result;

#[derive(Debug, Clone)]
pub struct CaptureLoopOptions {
    pub idle_sleep: Duration,
    pub pin_core: Option<usize>,
    pub fps_window: usize,
}

fn pin_current_thread(core: usize) {
    let Some(ids) = core_affinity::get_core_ids() else {
        warn!("core affinity unavailable, capture thread not pinned");
        return;
    };
    match ids.into_iter().find(|id| id.id == core) {
        Some(id) if core_affinity::set_for_current(id) => info!(core, "capture thread pinned"),
        Some(_) => warn!(core, "failed to pin capture thread"),
        None => warn!(core, "no such core, capture thread not pinned"),
    }
}

/// Run the capture loop on a dedicated thread.
///
/// The thread owns the source while running and hands it back on join so
/// the caller can release the device after every loop has exited.
pub fn spawn<S: FrameSource + 'static>(
    mut source: S,
    state: Arc<SharedFrameState>,
    running: Arc<AtomicBool>,
    counters: Arc<PipelineCounters>,
    opts: CaptureLoopOptions,
) -> Result<JoinHandle<S>> {
    let handle = thread::Builder::new()
        .name("mirrorcap-capture".into())
        .spawn(move || {
            if let Some(core) = opts.pin_core {
                pin_current_thread(core);
            }
            info!(source = source.name(), "capture loop started");

            let stats = &counters.capture;
            let mut fps = FpsMeter::new(opts.fps_window);
            let mut last_sequence = 0u64;

            while running.load(Ordering::Acquire) {
                stats.record_iteration();
                match source.poll_frame() {
                    Ok(Some(sample)) if sample.sequence > last_sequence => {
                        last_sequence = sample.sequence;
                        if let Some(dt) = fps.tick(Instant::now()) {
                            histogram!("capture_interval_ms").record(dt.as_secs_f64() * 1000.0);
                        }
                        stats.set_rate(fps.fps());
                        state.publish_frame(sample);
                        stats.record_published();
                    }
                    Ok(Some(sample)) => {
                        debug!(sequence = sample.sequence, "source repeated a frame, dropped");
                        stats.record_idle();
                    }
                    Ok(None) => {
                        stats.record_idle();
                        counter!("capture_empty_polls").increment(1);
                        thread::sleep(opts.idle_sleep);
                    }
                    Err(e) => {
                        warn!("Capture error: {}", e);
                        stats.record_failure();
                        counter!("capture_errors").increment(1);
                        thread::sleep(opts.idle_sleep);
                    }
                }
            }

            info!(frames = stats.snapshot().published, "capture loop exited");
            source
        })?;
    Ok(handle)
}
