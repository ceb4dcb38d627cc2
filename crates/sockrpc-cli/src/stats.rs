use std::fmt;
use std::time::Duration;

/// Latency samples and failure count collected by `sockrpc ping`.
#[derive(Debug, Clone, Default)]
pub struct LatencyStats {
    samples: Vec<Duration>,
    failures: usize,
}

impl LatencyStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_success(&mut self, latency: Duration) {
        self.samples.push(latency);
    }

    pub fn record_failure(&mut self) {
        self.failures += 1;
    }

    pub fn successes(&self) -> usize {
        self.samples.len()
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    pub fn trials(&self) -> usize {
        self.samples.len() + self.failures
    }

    /// Mean latency of the successful trials, `None` if there were none.
    pub fn mean(&self) -> Option<Duration> {
        if self.samples.is_empty() {
            return None;
        }
        let total: Duration = self.samples.iter().sum();
        let mean = match u32::try_from(self.samples.len()) {
            Ok(count) => total / count,
            Err(_) => total.div_f64(self.samples.len() as f64),
        };
        Some(mean)
    }

    pub fn min(&self) -> Option<Duration> {
        self.samples.iter().min().copied()
    }

    pub fn max(&self) -> Option<Duration> {
        self.samples.iter().max().copied()
    }
}

impl fmt::Display for LatencyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.mean(), self.min(), self.max()) {
            (Some(mean), Some(min), Some(max)) => write!(
                f,
                "{} trials: mean {:.3}ms (min {:.3}ms, max {:.3}ms), {} failed",
                self.trials(),
                mean.as_secs_f64() * 1000.0,
                min.as_secs_f64() * 1000.0,
                max.as_secs_f64() * 1000.0,
                self.failures
            ),
            _ => write!(f, "{} trials: all failed", self.trials()),
        }
    }
}
