//! Merge Scheduler
//!
//! Background compaction of segment files.
//!
//! ## Tier Selection
//! Every tick picks exactly one tier, checking the rarest first:
//! ```text
//! tick ─► full due?   (elapsed since last full   >= full_period)   ─► Full   (all segments)
//!      └► medium due? (elapsed since last medium >= medium_period) ─► Medium (newest run < medium bound)
//!      └► otherwise                                                ─► Light  (newest run < small bound)
//! ```
//! A full merge also counts as a medium merge.
//!
//! ## Shutdown
//! `shutdown` raises the cancel flag (checked between segments), closes the
//! stop channel and waits for the worker to report completion. Waiting
//! longer than the bound is a `ShutdownTimeout` error.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use crossbeam::select;

use crate::config::MergeConfig;
use crate::error::{Result, StoreError};
use crate::segment::SegmentFilter;
use crate::storage::{IndexedStore, MergeStats};

/// How much of a store one merge consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeTier {
    /// Every segment
    Full,
    /// Newest segments under the medium size bound
    Medium,
    /// Newest segments under the small size bound
    Light,
}

impl MergeTier {
    pub fn filter(&self, config: &MergeConfig) -> SegmentFilter {
        match self {
            MergeTier::Full => SegmentFilter::All,
            MergeTier::Medium => SegmentFilter::NewestSmallerThan(config.medium_size_bound),
            MergeTier::Light => SegmentFilter::NewestSmallerThan(config.small_size_bound),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MergeTier::Full => "full",
            MergeTier::Medium => "medium",
            MergeTier::Light => "light",
        }
    }
}

/// Tracks when each tier last ran
#[derive(Debug, Clone)]
pub struct TierClock {
    full_period: Duration,
    medium_period: Duration,
    last_full: Instant,
    last_medium: Instant,
}

impl TierClock {
    /// Start the clock; neither larger tier is due until its period elapses
    pub fn new(config: &MergeConfig, now: Instant) -> Self {
        Self {
            full_period: config.full_period,
            medium_period: config.medium_period,
            last_full: now,
            last_medium: now,
        }
    }

    /// Pick the tier for a tick at `now` and record that it ran
    pub fn select(&mut self, now: Instant) -> MergeTier {
        if now.saturating_duration_since(self.last_full) >= self.full_period {
            self.last_full = now;
            self.last_medium = now;
            MergeTier::Full
        } else if now.saturating_duration_since(self.last_medium) >= self.medium_period {
            self.last_medium = now;
            MergeTier::Medium
        } else {
            MergeTier::Light
        }
    }
}

/// Merge every store at one tier
///
/// Faults are logged and do not stop the remaining stores; the segments of a
/// failed store are simply left for the next tick.
pub fn merge_stores(
    stores: &[Arc<IndexedStore>],
    tier: MergeTier,
    config: &MergeConfig,
    cancel: &AtomicBool,
) -> Vec<(String, Result<MergeStats>)> {
    let filter = tier.filter(config);
    let mut results = Vec::with_capacity(stores.len());
    for store in stores {
        if cancel.load(Ordering::Acquire) {
            break;
        }
        let result = store.merge(&filter, cancel);
        if let Err(e) = &result {
            tracing::error!(store = %store.name(), tier = tier.as_str(), error = %e, "Merge failed");
        }
        results.push((store.name().to_string(), result));
    }
    results
}

/// Handle to the background merge thread
pub struct MergeScheduler {
    /// Dropped to tell the worker to stop
    stop_tx: Option<Sender<()>>,

    /// Signalled (or disconnected) when the worker exits
    done_rx: Receiver<()>,

    /// Checked by running merges between segments
    cancel: Arc<AtomicBool>,

    handle: Option<JoinHandle<()>>,
}

impl MergeScheduler {
    /// Spawn the merge thread for `stores`
    pub fn start(stores: Vec<Arc<IndexedStore>>, config: MergeConfig) -> Result<Self> {
        let (stop_tx, stop_rx) = channel::bounded::<()>(1);
        let (done_tx, done_rx) = channel::bounded::<()>(1);
        let cancel = Arc::new(AtomicBool::new(false));

        let worker_cancel = Arc::clone(&cancel);
        let (initial_delay, period) = (config.initial_delay, config.period);
        let handle = thread::Builder::new()
            .name("merge".to_string())
            .spawn(move || {
                run(&stores, &config, &stop_rx, &worker_cancel);
                let _ = done_tx.send(());
            })?;

        tracing::info!(
            initial_delay_ms = initial_delay.as_millis() as u64,
            period_ms = period.as_millis() as u64,
            "Merge scheduler started"
        );

        Ok(Self {
            stop_tx: Some(stop_tx),
            done_rx,
            cancel,
            handle: Some(handle),
        })
    }

    /// Stop the worker and wait up to `timeout` for it to finish
    pub fn shutdown(&mut self, timeout: Duration) -> Result<()> {
        self.cancel.store(true, Ordering::Release);
        self.stop_tx.take();

        let Some(handle) = self.handle.take() else {
            return Ok(());
        };

        match self.done_rx.recv_timeout(timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {}
            Err(RecvTimeoutError::Timeout) => {
                tracing::error!(timeout_ms = timeout.as_millis() as u64, "Merge thread did not stop");
                return Err(StoreError::ShutdownTimeout(format!(
                    "merge thread still running after {:?}",
                    timeout
                )));
            }
        }

        handle
            .join()
            .map_err(|_| StoreError::Storage("merge thread panicked".to_string()))?;
        tracing::info!("Merge scheduler stopped");
        Ok(())
    }

    /// True while the worker thread has not exited
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for MergeScheduler {
    fn drop(&mut self) {
        // Detach: signal stop without waiting
        self.cancel.store(true, Ordering::Release);
        self.stop_tx.take();
    }
}

fn run(stores: &[Arc<IndexedStore>], config: &MergeConfig, stop_rx: &Receiver<()>, cancel: &AtomicBool) {
    let first = channel::after(config.initial_delay);
    select! {
        recv(stop_rx) -> _ => return,
        recv(first) -> _ => {}
    }

    let mut clock = TierClock::new(config, Instant::now());
    let ticker = channel::tick(config.period);
    loop {
        let tier = clock.select(Instant::now());
        let started = Instant::now();
        let results = merge_stores(stores, tier, config, cancel);
        let reclaimed: u64 = results
            .iter()
            .filter_map(|(_, r)| r.as_ref().ok())
            .map(MergeStats::bytes_reclaimed)
            .sum();
        tracing::info!(
            tier = tier.as_str(),
            stores = results.len(),
            reclaimed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Merge tick finished"
        );

        select! {
            recv(stop_rx) -> _ => return,
            recv(ticker) -> _ => {}
        }
    }
}
