//! Small metric building blocks shared by the decorators

use std::time::Duration;

/// Running min/max/average of observed durations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationStats {
    /// Number of observations
    pub count: u64,
    /// Sum of all observations
    pub total: Duration,
    /// Shortest observation, if any
    pub min: Option<Duration>,
    /// Longest observation, if any
    pub max: Option<Duration>,
}

impl DurationStats {
    /// Record one observation
    pub fn record(&mut self, elapsed: Duration) {
        self.count += 1;
        self.total += elapsed;
        self.min = Some(self.min.map_or(elapsed, |m| m.min(elapsed)));
        self.max = Some(self.max.map_or(elapsed, |m| m.max(elapsed)));
    }

    /// Mean duration, or `None` when nothing was recorded
    pub fn average(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        let count = u32::try_from(self.count).unwrap_or(u32::MAX);
        Some(self.total / count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_stats() {
        let stats = DurationStats::default();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.average(), None);
        assert_eq!(stats.min, None);
    }

    #[test]
    fn test_min_max_average() {
        let mut stats = DurationStats::default();
        stats.record(Duration::from_millis(30));
        stats.record(Duration::from_millis(10));
        stats.record(Duration::from_millis(20));

        assert_eq!(stats.count, 3);
        assert_eq!(stats.min, Some(Duration::from_millis(10)));
        assert_eq!(stats.max, Some(Duration::from_millis(30)));
        assert_eq!(stats.average(), Some(Duration::from_millis(20)));
    }
}
