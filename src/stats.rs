use std::{
    fmt,
    time::{Duration, Instant},
};

/// Starts timing once the operation counter reaches the warm-up threshold.
#[derive(Debug, Clone, Copy)]
pub struct WarmupTimer {
    threshold: u64,
    start: Option<Instant>,
}

impl WarmupTimer {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold,
            start: None,
        }
    }

    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    pub fn is_running(&self) -> bool {
        self.start.is_some()
    }

    /// Called when steady state begins; a zero threshold starts right away.
    pub fn begin(&mut self, now: Instant) {
        if self.threshold == 0 && self.start.is_none() {
            self.start = Some(now);
        }
    }

    /// Called after every counted operation.
    pub fn observe(&mut self, ops: u64, now: Instant) {
        if ops == self.threshold && self.start.is_none() {
            self.start = Some(now);
        }
    }

    /// Snapshots the end time.
    pub fn finish(&self, ops: u64, now: Instant) -> Report {
        Report {
            total_ops: ops,
            warmup_ops: self.threshold,
            elapsed: self.start.map(|start| now.saturating_duration_since(start)),
        }
    }
}

/// Outcome of one steady-state run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Report {
    /// Operations counted up to and including the STOP message
    pub total_ops: u64,
    pub warmup_ops: u64,
    /// Time from the warm-up threshold to the STOP message, absent when the
    /// threshold was never reached
    pub elapsed: Option<Duration>,
}

impl Report {
    /// Every counted operation divided by the time since the warm-up
    /// threshold, in operations per microsecond (Mops/s).
    pub fn throughput_mops(&self) -> Option<f64> {
        let elapsed = self.elapsed?;
        let micros = elapsed.as_secs_f64() * 1e6;
        if micros <= 0.0 {
            return None;
        }
        Some(self.total_ops as f64 / micros)
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.elapsed, self.throughput_mops()) {
            (Some(elapsed), Some(mops)) => write!(
                f,
                "ops = {}, timed after {} ops for {:.3} ms, throughput = {mops:.6} Mops/s",
                self.total_ops,
                self.warmup_ops,
                elapsed.as_secs_f64() * 1e3,
            ),
            _ => write!(
                f,
                "ops = {}, warm-up threshold {} not reached, no throughput",
                self.total_ops, self.warmup_ops
            ),
        }
    }
}
