use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use drivecopy_core::ThrottleObserver;
use reqwest::StatusCode;

use super::progress::{ProgressSink, StageStatus};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub files_total: u64,
    pub files_done: u64,
    pub files_failed: u64,
    pub bytes_done: u64,
    pub elapsed: Duration,
    pub bytes_per_sec: f64,
    pub workers: usize,
    pub throttles_recent: u64,
}

#[derive(Debug, Default)]
struct Counters {
    started: Option<Instant>,
    finished: Option<Duration>,
    files_total: u64,
    files_done: u64,
    files_failed: u64,
    bytes_done: u64,
    workers: usize,
    throttles_recent: u64,
}

impl Counters {
    fn touch(&mut self) {
        if self.started.is_none() {
            self.started = Some(Instant::now());
        }
    }

    fn elapsed(&self) -> Duration {
        match (self.finished, self.started) {
            (Some(finished), _) => finished,
            (None, Some(started)) => started.elapsed(),
            (None, None) => Duration::ZERO,
        }
    }
}

/// Counters of one job run plus the sink they are mirrored to. Also the
/// call layer's throttle observer, which feeds the adaptive controller.
pub struct Stats {
    counters: Mutex<Counters>,
    sink: Arc<dyn ProgressSink>,
}

impl Stats {
    pub fn new(sink: Arc<dyn ProgressSink>, workers: usize) -> Self {
        Self {
            counters: Mutex::new(Counters {
                workers,
                ..Counters::default()
            }),
            sink,
        }
    }

    fn counters(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn file_discovered(&self) {
        {
            let mut counters = self.counters();
            counters.touch();
            counters.files_total += 1;
        }
        self.sink.file_discovered();
    }

    pub fn file_completed(&self, bytes: u64) {
        {
            let mut counters = self.counters();
            counters.touch();
            counters.files_done += 1;
            counters.bytes_done += bytes;
        }
        self.sink.file_completed(bytes);
    }

    /// A failed file still counts as handled.
    pub fn file_failed(&self) {
        {
            let mut counters = self.counters();
            counters.touch();
            counters.files_done += 1;
            counters.files_failed += 1;
        }
        self.sink.file_completed(0);
    }

    pub fn set_workers(&self, workers: usize) {
        self.counters().workers = workers;
    }

    /// Returns the throttle count since the previous call and starts a new window.
    pub fn drain_throttles(&self) -> u64 {
        std::mem::take(&mut self.counters().throttles_recent)
    }

    pub fn has_pending_work(&self) -> bool {
        let counters = self.counters();
        counters.files_done < counters.files_total
    }

    /// Freezes the elapsed time. Later calls keep the first value.
    pub fn finish(&self) {
        let mut counters = self.counters();
        if counters.finished.is_none() {
            counters.finished = Some(counters.elapsed());
        }
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let counters = self.counters();
        let elapsed = counters.elapsed();
        let secs = elapsed.as_secs_f64();
        StatsSnapshot {
            files_total: counters.files_total,
            files_done: counters.files_done,
            files_failed: counters.files_failed,
            bytes_done: counters.bytes_done,
            elapsed,
            bytes_per_sec: if secs > 0.0 {
                counters.bytes_done as f64 / secs
            } else {
                0.0
            },
            workers: counters.workers,
            throttles_recent: counters.throttles_recent,
        }
    }

    pub fn log(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        tracing::info!("{line}");
        self.sink.log(line);
    }

    pub fn warn(&self, line: impl AsRef<str>) {
        let line = line.as_ref();
        tracing::warn!("{line}");
        self.sink.log(line);
    }

    pub fn stage(&self, stage: &str, status: StageStatus) {
        tracing::info!(stage, ?status, "stage");
        self.sink.stage(stage, status);
    }
}

impl ThrottleObserver for Stats {
    fn throttle_observed(&self, status: StatusCode, retry_after: Option<Duration>) {
        self.counters().throttles_recent += 1;
        tracing::debug!(%status, ?retry_after, "throttled");
        self.sink.throttle_observed();
    }
}
