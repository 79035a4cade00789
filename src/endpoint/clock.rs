//! Background task standing in for the audio service thread.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::MockBackend;

/// Drives every live [`MockEndpoint`](super::MockEndpoint) of a backend at
/// a fixed buffer period, like a sound card pulling one buffer per period.
///
/// Each tick completes at most one buffer per endpoint. Completion
/// callbacks run on the tokio worker that owns the task, never on the
/// thread that called into the engine.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use std::time::Duration;
/// use audio_echo::{DeviceClock, MockBackend};
///
/// # async fn run() {
/// let backend = Arc::new(MockBackend::new());
/// let clock = DeviceClock::spawn(backend.clone(), Duration::from_millis(5));
///
/// tokio::time::sleep(Duration::from_secs(1)).await;
/// clock.stop().await;
/// # }
/// ```
pub struct DeviceClock {
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
    handle: Option<JoinHandle<()>>,
}

impl DeviceClock {
    /// Spawns the clock on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn(backend: Arc<MockBackend>, period: Duration) -> Self {
        let running = Arc::new(AtomicBool::new(true));
        let ticks = Arc::new(AtomicU64::new(0));

        let handle = tokio::spawn(run(
            backend,
            period.max(Duration::from_micros(100)),
            Arc::clone(&running),
            Arc::clone(&ticks),
        ));

        Self {
            running,
            ticks,
            handle: Some(handle),
        }
    }

    /// Number of periods elapsed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Stops the clock and waits for the task to exit.
    pub async fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "device clock task failed");
            }
        }
    }
}

impl Drop for DeviceClock {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl std::fmt::Debug for DeviceClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceClock")
            .field("running", &self.running.load(Ordering::Relaxed))
            .field("ticks", &self.ticks())
            .finish()
    }
}

async fn run(
    backend: Arc<MockBackend>,
    period: Duration,
    running: Arc<AtomicBool>,
    ticks: Arc<AtomicU64>,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    while running.load(Ordering::SeqCst) {
        interval.tick().await;
        for endpoint in backend.live_endpoints() {
            endpoint.complete_next();
        }
        ticks.fetch_add(1, Ordering::Relaxed);
    }

    tracing::debug!(ticks = ticks.load(Ordering::Relaxed), "device clock stopped");
}
