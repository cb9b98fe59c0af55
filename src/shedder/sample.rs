use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};

/// One instantaneous power reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerSample {
    pub timestamp: DateTime<Utc>,
    pub watts: i32,
}

impl PowerSample {
    /// Creates a new sample.
    pub fn new(timestamp: DateTime<Utc>, watts: i32) -> Self {
        Self { timestamp, watts }
    }
}

/// Bounded buffer of power samples, ordered most-recent-first.
///
/// The buffer exists so the controller can monitor the effect of limit
/// operations over a short trailing window. Pushing a sample with the same
/// timestamp as the newest entry is a no-op, so re-reading an unchanged meter
/// does not distort the time weighting.
#[derive(Debug, Clone)]
pub struct SampleBuffer {
    samples: VecDeque<PowerSample>,
    limit: usize,
}

impl SampleBuffer {
    /// Creates an empty buffer holding at most `limit` samples.
    pub fn new(limit: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(limit),
            limit,
        }
    }

    /// Adds a sample as the newest entry, evicting the oldest when full.
    ///
    /// Returns `false` when the sample carries the same timestamp as the
    /// current newest entry and was ignored.
    pub fn push(&mut self, sample: PowerSample) -> bool {
        if let Some(newest) = self.samples.front()
            && newest.timestamp == sample.timestamp
        {
            return false;
        }
        if self.samples.len() >= self.limit {
            self.samples.pop_back();
        }
        self.samples.push_front(sample);
        true
    }

    /// The most recent sample.
    pub fn latest(&self) -> Option<&PowerSample> {
        self.samples.front()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Time-weighted average power over the trailing window, in watts.
    ///
    /// Walks newest to oldest, stopping at the first sample older than
    /// `now - window_secs`, and integrates trapezoidally between adjacent
    /// in-window pairs. When less than one second of usable time is covered
    /// (at most one in-window sample) that sample's reading is returned
    /// unchanged. Returns `None` when no samples exist.
    pub fn average(&self, now: DateTime<Utc>, window_secs: u32) -> Option<i32> {
        let oldest = now - Duration::seconds(i64::from(window_secs));
        let mut total_power = 0.0f64;
        let mut total_seconds = 0.0f64;
        let mut prev: Option<&PowerSample> = None;
        for sample in &self.samples {
            if sample.timestamp < oldest {
                break;
            }
            if let Some(newer) = prev {
                let ds = (newer.timestamp - sample.timestamp).num_milliseconds() as f64 / 1000.0;
                total_power += (f64::from(newer.watts) + f64::from(sample.watts)) * 0.5 * ds;
                total_seconds += ds;
            }
            prev = Some(sample);
        }
        if total_seconds < 1.0 {
            // at most one usable sample
            return prev.map(|s| s.watts);
        }
        Some((total_power / total_seconds).round() as i32)
    }
}
