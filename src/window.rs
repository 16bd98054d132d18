use crate::error::WindowError;
use serde::Serialize;
use std::collections::VecDeque;

/// Summary of the RSSI samples currently held by a [`RollingWindow`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub current: i8,
    pub mean: f64,
    pub min: i8,
    pub max: i8,
    /// Sample standard deviation; 0 when fewer than two samples are held.
    pub stddev: f64,
    pub samples: usize,
}

/// Fixed-capacity FIFO of the most recent RSSI samples.
#[derive(Debug, Clone)]
pub struct RollingWindow {
    capacity: usize,
    samples: VecDeque<i8>,
}

impl RollingWindow {
    /// Panics if `capacity` is zero; configuration rejects that before we get here.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "rolling window capacity must be non-zero");
        Self {
            capacity,
            samples: VecDeque::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, rssi: i8) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(rssi);
    }

    pub fn snapshot(&self) -> Result<StatsSnapshot, WindowError> {
        let current = *self.samples.back().ok_or(WindowError::EmptyWindow)?;
        let n = self.samples.len();

        let mut min = i8::MAX;
        let mut max = i8::MIN;
        let mut sum = 0i64;
        for &sample in &self.samples {
            min = min.min(sample);
            max = max.max(sample);
            sum += i64::from(sample);
        }
        let mean = sum as f64 / n as f64;

        let stddev = if n < 2 {
            0.0
        } else {
            let squares: f64 = self
                .samples
                .iter()
                .map(|&sample| {
                    let delta = f64::from(sample) - mean;
                    delta * delta
                })
                .sum();
            (squares / (n - 1) as f64).sqrt()
        };

        Ok(StatsSnapshot {
            current,
            mean,
            min,
            max,
            stddev,
            samples: n,
        })
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Samples oldest first.
    pub fn samples(&self) -> impl Iterator<Item = i8> + '_ {
        self.samples.iter().copied()
    }
}
