//! Global progress counter and ETA projection.
//!
//! The counter lives in the result store so every worker (each with its
//! own connection) adds to the same total. Increments commute; only the
//! aggregate matters.

use std::time::{Duration, Instant};

use rusqlite::{Connection, OptionalExtension};

use crate::error::StoreError;
use crate::sql;

/// Store-backed monotonic counter of resolved (origin, class) units.
pub struct ProgressTracker<'c> {
    conn: &'c Connection,
}

impl<'c> ProgressTracker<'c> {
    /// Works on a plain connection or inside a transaction (which derefs to
    /// one), so an advance can commit atomically with the results it counts.
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn advance(&self, units: u64) -> Result<(), StoreError> {
        if units == 0 {
            return Ok(());
        }
        let units = i64::try_from(units)
            .map_err(|_| StoreError::OutOfRange(format!("progress increment {units}")))?;
        let changed = self.conn.execute(sql::ADVANCE_PROGRESS, [units])?;
        if changed == 0 {
            return Err(StoreError::MissingProgress);
        }
        Ok(())
    }

    pub fn current(&self) -> Result<u64, StoreError> {
        let processed: Option<i64> = self
            .conn
            .query_row(sql::CURRENT_PROGRESS, [], |row| row.get(0))
            .optional()?;
        let processed = processed.ok_or(StoreError::MissingProgress)?;
        u64::try_from(processed)
            .map_err(|_| StoreError::OutOfRange(format!("progress counter {processed}")))
    }
}

/// Advisory completion estimate: elapsed time scaled by the ratio of
/// remaining to processed units since the run started.
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    started: Instant,
    baseline: u64,
    goal: u64,
}

impl EtaEstimator {
    pub fn new(baseline: u64, goal: u64) -> Self {
        Self {
            started: Instant::now(),
            baseline,
            goal,
        }
    }

    pub fn goal(&self) -> u64 {
        self.goal
    }

    /// Projected time remaining, or `None` before anything has been
    /// processed in this run.
    pub fn remaining(&self, current: u64) -> Option<Duration> {
        project(self.started.elapsed(), current.saturating_sub(self.baseline), self.goal.saturating_sub(current))
    }

    /// One-line progress report for logs.
    pub fn report(&self, current: u64) -> String {
        let percent = if self.goal == 0 {
            100.0
        } else {
            current as f64 / self.goal as f64 * 100.0
        };
        match self.remaining(current) {
            Some(eta) => format!(
                "{current}/{} ({percent:.2}%), ETA {}",
                self.goal,
                format_duration(eta)
            ),
            None => format!("{current}/{} ({percent:.2}%)", self.goal),
        }
    }
}

fn project(elapsed: Duration, processed: u64, remaining: u64) -> Option<Duration> {
    if processed == 0 {
        return None;
    }
    Some(elapsed.mul_f64(remaining as f64 / processed as f64))
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Connection {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch(sql::SCHEMA).expect("schema");
        conn
    }

    #[test]
    fn test_advance_is_additive() {
        let conn = store();
        let tracker = ProgressTracker::new(&conn);
        assert_eq!(tracker.current().expect("current"), 0);
        tracker.advance(10).expect("advance");
        tracker.advance(0).expect("advance");
        tracker.advance(5).expect("advance");
        assert_eq!(tracker.current().expect("current"), 15);
    }

    #[test]
    fn test_missing_counter_is_reported() {
        let conn = Connection::open_in_memory().expect("open");
        conn.execute_batch("CREATE TABLE progress (id INTEGER PRIMARY KEY, processed INTEGER);")
            .expect("table");
        let tracker = ProgressTracker::new(&conn);
        assert!(matches!(tracker.current(), Err(StoreError::MissingProgress)));
        assert!(matches!(tracker.advance(1), Err(StoreError::MissingProgress)));
    }

    #[test]
    fn test_projection_scales_elapsed() {
        let eta = project(Duration::from_secs(60), 25, 75).expect("eta");
        assert_eq!(eta, Duration::from_secs(180));
        assert!(project(Duration::from_secs(60), 0, 75).is_none());
    }

    #[test]
    fn test_report_formats_percent() {
        let estimator = EtaEstimator::new(0, 200);
        assert!(estimator.report(0).starts_with("0/200 (0.00%)"));
        assert!(estimator.report(50).contains("(25.00%), ETA"));
        assert_eq!(format_duration(Duration::from_secs(3_723)), "01:02:03");
    }
}
