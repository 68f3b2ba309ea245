/// Outcome attached to a stage notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Running,
    Ok,
    Failed,
}

/// Receives progress from a running job. Every callback defaults to a no-op,
/// so a front end implements only what it renders.
pub trait ProgressSink: Send + Sync {
    fn file_discovered(&self) {}

    fn file_completed(&self, _bytes: u64) {}

    fn throttle_observed(&self) {}

    fn log(&self, _line: &str) {}

    fn stage(&self, _stage: &str, _status: StageStatus) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopProgress;

impl ProgressSink for NoopProgress {}
