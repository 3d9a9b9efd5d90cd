//! Pipeline statistics.

use serde::Serialize;
use std::time::Duration;

/// Statistics collected while the pipeline runs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStats {
    /// Change sets read from the source.
    pub revisions_read: u64,

    /// Change sets handed to the sink.
    pub revisions_written: u64,

    /// Events read from the source.
    pub events_read: u64,

    /// Events handed to the sink.
    pub events_written: u64,

    /// Unversioned objects passed through.
    pub unversioned: u64,

    /// Total elapsed wall-clock time.
    #[serde(skip)]
    pub total_time: Duration,

    /// Average revisions per second.
    pub revisions_per_second: f64,
}

impl PipelineStats {
    /// Create new empty stats.
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge another stats instance into this one.
    pub fn merge(&mut self, other: &PipelineStats) {
        self.revisions_read += other.revisions_read;
        self.revisions_written += other.revisions_written;
        self.events_read += other.events_read;
        self.events_written += other.events_written;
        self.unversioned += other.unversioned;
        // total_time and throughput are recalculated
    }

    /// Finalize stats by calculating derived metrics.
    pub fn finalize(&mut self, total_time: Duration) {
        self.total_time = total_time;
        let secs = total_time.as_secs_f64();
        if secs > 0.0 {
            self.revisions_per_second = self.revisions_read as f64 / secs;
        }
    }

    /// Format a human-readable summary.
    pub fn summary(&self) -> String {
        format!(
            "Replayed {} revisions ({} events) into {} revisions ({} events) in {:.1}s ({:.0} revisions/sec). Unversioned objects: {}.",
            self.revisions_read,
            self.events_read,
            self.revisions_written,
            self.events_written,
            self.total_time.as_secs_f64(),
            self.revisions_per_second,
            self.unversioned
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_and_finalize() {
        let mut stats = PipelineStats::new();
        stats.revisions_read = 10;
        stats.events_read = 40;

        let mut other = PipelineStats::new();
        other.revisions_read = 10;
        other.revisions_written = 5;
        stats.merge(&other);

        stats.finalize(Duration::from_secs(4));
        assert_eq!(stats.revisions_read, 20);
        assert_eq!(stats.revisions_written, 5);
        assert!((stats.revisions_per_second - 5.0).abs() < f64::EPSILON);
        assert!(stats.summary().contains("Replayed 20 revisions"));
    }
}
