use crate::config::RTT_FLOOR_MILLIS;

/// Bounded rolling window of successful probe round-trip times.
///
/// The window is the only adaptive input to ack timeouts: `n_sigma(k)` is
/// `mean + k * stddev` over the recorded samples. A nominal seed sample keeps
/// the statistics defined before any real probe completes, and all inputs are
/// floored so the timeout never collapses below the floor.
#[derive(Debug)]
pub(crate) struct PingData {
    samples: Vec<u32>,
    capacity: usize,
    next: usize,
}

impl PingData {
    pub(crate) fn new(capacity: usize, seed_millis: u32) -> Self {
        Self {
            samples: vec![seed_millis],
            capacity,
            next: 0,
        }
    }

    /// Records a round-trip time, clamped to the 10 ms floor. Once the
    /// window is full the oldest sample is overwritten.
    pub(crate) fn add(&mut self, rtt_millis: u32) {
        let sample = rtt_millis.max(RTT_FLOOR_MILLIS);
        if self.samples.len() < self.capacity {
            self.samples.push(sample);
        } else {
            self.samples[self.next] = sample;
            self.next = (self.next + 1) % self.capacity;
        }
    }

    pub(crate) fn mean(&self) -> f64 {
        let sum: u64 = self.samples.iter().map(|&s| u64::from(s)).sum();
        sum as f64 / self.samples.len() as f64
    }

    pub(crate) fn stddev(&self) -> f64 {
        let mean = self.mean();
        let variance = self
            .samples
            .iter()
            .map(|&s| {
                let delta = f64::from(s) - mean;
                delta * delta
            })
            .sum::<f64>()
            / self.samples.len() as f64;
        variance.sqrt()
    }

    /// `mean + k * stddev`, in milliseconds.
    pub(crate) fn n_sigma(&self, k: f64) -> f64 {
        self.mean() + k * self.stddev()
    }

    /// The adaptive probe deadline: `n_sigma` rounded up to whole
    /// milliseconds.
    pub(crate) fn timeout_millis(&self, k: f64) -> u32 {
        self.n_sigma(k).ceil() as u32
    }
}
