use crate::common::*;

/// Training throughput over one reporting interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub steps_per_sec: f64,
    pub samples_per_sec: f64,
}

/// Counts optimization steps and their samples, reporting the throughput once
/// per interval.
#[derive(Debug)]
pub struct RateCounter {
    steps: usize,
    samples: usize,
    since: Instant,
    interval: Duration,
}

impl RateCounter {
    pub fn new(interval: Duration) -> Self {
        Self {
            steps: 0,
            samples: 0,
            since: Instant::now(),
            interval,
        }
    }

    pub fn with_second_interval() -> Self {
        Self::new(Duration::from_secs(1))
    }

    /// Records one step over `num_samples` samples.
    pub fn step(&mut self, num_samples: usize) {
        self.steps += 1;
        self.samples += num_samples;
    }

    /// Takes the throughput once the interval has passed.
    pub fn poll(&mut self) -> Option<Throughput> {
        let secs = self.since.elapsed().as_secs_f64();
        if secs < self.interval.as_secs_f64() || secs == 0.0 {
            return None;
        }
        let throughput = Throughput {
            steps_per_sec: self.steps as f64 / secs,
            samples_per_sec: self.samples as f64 / secs,
        };
        self.steps = 0;
        self.samples = 0;
        self.since = Instant::now();
        Some(throughput)
    }
}
