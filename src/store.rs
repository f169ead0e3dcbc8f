//! Result store: idempotent bulk upserts, the resumption scan and the run
//! log, all on one SQLite connection per worker.
//!
//! Writes are grouped into chunks of whole origins. Each chunk commits in a
//! single IMMEDIATE transaction together with the progress increment for
//! the origins it resolves, so an interrupted worker leaves at most its
//! in-flight chunk unapplied and never miscounts.

use std::collections::{BTreeMap, HashSet};
use std::ops::Range;
use std::path::Path;

use rusqlite::types::Value;
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params, params_from_iter};

use crate::config::StoreConfig;
use crate::error::StoreError;
use crate::model::{
    DestinationClass, DistanceResult, OriginId, OriginOutcome, PartitionId, QueryMode,
    RunLogEntry, RunStatus, UnresolvedReason,
};
use crate::progress::ProgressTracker;
use crate::sql;

/// What a single [`ResultStore::commit_outcomes`] call wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitStats {
    /// Origins resolved (and added to progress).
    pub origins: u64,
    /// Distance rows sent to the upsert.
    pub rows: u64,
    /// Origins recorded as unresolved.
    pub unresolved: u64,
    /// Transactions committed.
    pub chunks: u64,
}

/// Unresolved markers stored for one (partition, class) unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnresolvedTally {
    pub total: u64,
    /// Of which recorded because the region had no destinations.
    pub no_destinations: u64,
}

pub struct ResultStore {
    conn: Connection,
    chunk_size: usize,
}

impl ResultStore {
    /// Opens a connection. Call [`ResultStore::bootstrap`] once per run
    /// before workers start writing.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let conn = Connection::open(Path::new(&config.path))?;
        conn.busy_timeout(config.busy_timeout())?;
        let _mode: String = conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;
        Ok(Self {
            conn,
            chunk_size: config.chunk_size.max(1),
        })
    }

    /// Private in-memory store, mostly useful in tests.
    pub fn open_in_memory(chunk_size: usize) -> Result<Self, StoreError> {
        let store = Self {
            conn: Connection::open_in_memory()?,
            chunk_size: chunk_size.max(1),
        };
        store.bootstrap()?;
        Ok(store)
    }

    /// Creates tables and the progress row if absent.
    pub fn bootstrap(&self) -> Result<(), StoreError> {
        self.conn.execute_batch(sql::SCHEMA)?;
        Ok(())
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    pub fn progress(&self) -> ProgressTracker<'_> {
        ProgressTracker::new(&self.conn)
    }

    /// Origins among `origins` that have neither a result nor an
    /// unresolved marker for `class`, in input order.
    pub fn outstanding(
        &self,
        class: &DestinationClass,
        origins: &[OriginId],
    ) -> Result<Vec<OriginId>, StoreError> {
        let mut resolved = HashSet::new();
        for ids in origins.chunks(self.chunk_size) {
            let query = sql::resolved_origins(class.mode, ids.len());
            let mut stmt = self.conn.prepare_cached(&query)?;
            let mut values = Vec::with_capacity(ids.len() + 1);
            values.push(Value::Text(class.name.clone()));
            values.extend(ids.iter().map(|id| Value::Integer(*id)));
            let rows = stmt.query_map(params_from_iter(values.iter()), |row| row.get::<_, OriginId>(0))?;
            for row in rows {
                resolved.insert(row?);
            }
        }

        Ok(origins
            .iter()
            .copied()
            .filter(|id| !resolved.contains(id))
            .collect())
    }

    /// Deduplicates `rows` and upserts them in chunked statements, one
    /// transaction per chunk. Returns the number of distinct rows sent.
    ///
    /// Does not touch progress; the pipeline goes through
    /// [`ResultStore::commit_outcomes`].
    pub fn upsert(&mut self, mode: QueryMode, rows: &[DistanceResult]) -> Result<usize, StoreError> {
        let rows = dedupe_min(mode, rows.iter().cloned());
        for chunk in rows.chunks(self.chunk_size) {
            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            write_results(&tx, mode, chunk)?;
            tx.commit()?;
        }
        Ok(rows.len())
    }

    /// Writes the outcomes of one routing batch and advances progress by
    /// the number of origins, chunk by chunk.
    ///
    /// Origins with no rows are recorded as unresolved with `reason`.
    pub fn commit_outcomes(
        &mut self,
        partition: PartitionId,
        class: &DestinationClass,
        outcomes: &[OriginOutcome],
        reason: UnresolvedReason,
    ) -> Result<CommitStats, StoreError> {
        let mut stats = CommitStats::default();
        for range in plan_chunks(outcomes, self.chunk_size) {
            let chunk = &outcomes[range];
            let rows = dedupe_min(
                class.mode,
                chunk.iter().flat_map(|outcome| outcome.rows.iter().cloned()),
            );
            let unresolved: Vec<OriginId> = chunk
                .iter()
                .filter(|outcome| outcome.is_unresolved())
                .map(|outcome| outcome.origin_id)
                .collect();

            let tx = self
                .conn
                .transaction_with_behavior(TransactionBehavior::Immediate)?;
            for statement in rows.chunks(self.chunk_size) {
                write_results(&tx, class.mode, statement)?;
            }
            for statement in unresolved.chunks(self.chunk_size) {
                write_unresolved(&tx, partition, &class.name, reason, statement)?;
            }
            ProgressTracker::new(&tx).advance(chunk.len() as u64)?;
            tx.commit()?;

            stats.origins += chunk.len() as u64;
            stats.rows += rows.len() as u64;
            stats.unresolved += unresolved.len() as u64;
            stats.chunks += 1;
        }
        Ok(stats)
    }

    /// Inserts or overwrites the run log row for `(partition, class)`.
    pub fn record_run(&self, entry: &RunLogEntry) -> Result<(), StoreError> {
        self.conn.execute(
            sql::UPSERT_RUN_LOG,
            params![
                entry.partition_id,
                entry.dest_class,
                entry.status.as_str(),
                to_i64(entry.solved)?,
                to_i64(entry.unresolved)?,
                entry.elapsed_minutes,
                entry.message,
            ],
        )?;
        Ok(())
    }

    pub fn run_log_entry(
        &self,
        partition: PartitionId,
        class: &str,
    ) -> Result<Option<RunLogEntry>, StoreError> {
        let raw = self
            .conn
            .query_row(sql::RUN_LOG_ENTRY, params![partition, class], RawRunLog::from_row)
            .optional()?;
        raw.map(RawRunLog::into_entry).transpose()
    }

    pub fn run_log_by_status(&self, status: RunStatus) -> Result<Vec<RunLogEntry>, StoreError> {
        let mut stmt = self.conn.prepare(sql::RUN_LOG_BY_STATUS)?;
        let rows = stmt.query_map([status.as_str()], RawRunLog::from_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?.into_entry()?);
        }
        Ok(entries)
    }

    /// Count of run log rows per status.
    pub fn run_log_summary(&self) -> Result<BTreeMap<RunStatus, u64>, StoreError> {
        let mut stmt = self.conn.prepare(sql::RUN_LOG_SUMMARY)?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
        let mut summary = BTreeMap::new();
        for row in rows {
            let (status, count) = row?;
            summary.insert(parse_status(&status)?, to_u64(count)?);
        }
        Ok(summary)
    }

    /// Stored rows for a class.
    pub fn count_results(&self, mode: QueryMode, class: &str) -> Result<u64, StoreError> {
        let count: i64 = self
            .conn
            .query_row(&sql::count_results(mode), [class], |row| row.get(0))?;
        to_u64(count)
    }

    /// Closest-of-class distance for an origin, if stored.
    pub fn closest_distance(&self, origin: OriginId, class: &str) -> Result<Option<u32>, StoreError> {
        let distance: Option<i64> = self
            .conn
            .query_row(
                "SELECT distance FROM distance_result WHERE origin_id = ?1 AND dest_class = ?2",
                params![origin, class],
                |row| row.get(0),
            )
            .optional()?;
        distance
            .map(|value| {
                u32::try_from(value).map_err(|_| StoreError::OutOfRange(format!("distance {value}")))
            })
            .transpose()
    }

    /// Counts the unresolved markers of `(partition, class)`, whichever run
    /// wrote them.
    pub fn unresolved_in_partition(
        &self,
        partition: PartitionId,
        class: &str,
    ) -> Result<UnresolvedTally, StoreError> {
        let (total, no_destinations): (i64, i64) = self.conn.query_row(
            sql::UNRESOLVED_IN_PARTITION,
            params![partition, class, UnresolvedReason::NoDestinations.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(UnresolvedTally {
            total: to_u64(total)?,
            no_destinations: to_u64(no_destinations)?,
        })
    }

    /// Why an origin is unresolved for a class, if it is.
    pub fn unresolved_reason(&self, origin: OriginId, class: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .conn
            .query_row(sql::UNRESOLVED_REASON, params![origin, class], |row| row.get(0))
            .optional()?)
    }
}

/// Groups consecutive outcomes into chunks of at most `chunk_size` rows
/// without splitting an origin. An unresolved origin counts as one row.
fn plan_chunks(outcomes: &[OriginOutcome], chunk_size: usize) -> Vec<Range<usize>> {
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut rows_in_chunk = 0;
    for (index, outcome) in outcomes.iter().enumerate() {
        let weight = outcome.rows.len().max(1);
        if index > start && rows_in_chunk + weight > chunk_size {
            chunks.push(start..index);
            start = index;
            rows_in_chunk = 0;
        }
        rows_in_chunk += weight;
    }
    if start < outcomes.len() {
        chunks.push(start..outcomes.len());
    }
    chunks
}

/// Keeps the smallest distance per primary key.
fn dedupe_min(mode: QueryMode, rows: impl Iterator<Item = DistanceResult>) -> Vec<DistanceResult> {
    let mut best: BTreeMap<(OriginId, String, Option<i64>), DistanceResult> = BTreeMap::new();
    for row in rows {
        let key = match mode {
            QueryMode::Closest => (row.origin_id, row.dest_class.clone(), None),
            QueryMode::Within => (row.origin_id, row.dest_class.clone(), row.dest_id),
        };
        match best.get(&key) {
            Some(existing) if existing.distance_m <= row.distance_m => {}
            _ => {
                best.insert(key, row);
            }
        }
    }
    best.into_values().collect()
}

fn write_results(conn: &Connection, mode: QueryMode, rows: &[DistanceResult]) -> Result<(), StoreError> {
    if rows.is_empty() {
        return Ok(());
    }
    let mut values = Vec::with_capacity(rows.len() * sql::RESULT_COLUMNS);
    for row in rows {
        values.push(Value::Integer(row.origin_id));
        values.push(Value::Text(row.dest_class.clone()));
        values.push(row.dest_id.map(Value::Integer).unwrap_or(Value::Null));
        values.push(Value::Integer(i64::from(row.distance_m)));
        values.push(row.node_id.map(Value::Integer).unwrap_or(Value::Null));
    }
    let mut stmt = conn.prepare_cached(&sql::upsert_results(mode, rows.len()))?;
    stmt.execute(params_from_iter(values.iter()))?;
    Ok(())
}

fn write_unresolved(
    conn: &Connection,
    partition: PartitionId,
    class: &str,
    reason: UnresolvedReason,
    origins: &[OriginId],
) -> Result<(), StoreError> {
    if origins.is_empty() {
        return Ok(());
    }
    let mut values = Vec::with_capacity(origins.len() * sql::UNRESOLVED_COLUMNS);
    for origin in origins {
        values.push(Value::Integer(*origin));
        values.push(Value::Text(class.to_string()));
        values.push(Value::Integer(partition));
        values.push(Value::Text(reason.as_str().to_string()));
    }
    let mut stmt = conn.prepare_cached(&sql::insert_unresolved(origins.len()))?;
    stmt.execute(params_from_iter(values.iter()))?;
    Ok(())
}

struct RawRunLog {
    partition_id: PartitionId,
    dest_class: String,
    status: String,
    solved: i64,
    unresolved: i64,
    elapsed_minutes: f64,
    message: Option<String>,
}

impl RawRunLog {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            partition_id: row.get(0)?,
            dest_class: row.get(1)?,
            status: row.get(2)?,
            solved: row.get(3)?,
            unresolved: row.get(4)?,
            elapsed_minutes: row.get(5)?,
            message: row.get(6)?,
        })
    }

    fn into_entry(self) -> Result<RunLogEntry, StoreError> {
        Ok(RunLogEntry {
            partition_id: self.partition_id,
            dest_class: self.dest_class,
            status: parse_status(&self.status)?,
            solved: to_u64(self.solved)?,
            unresolved: to_u64(self.unresolved)?,
            elapsed_minutes: self.elapsed_minutes,
            message: self.message,
        })
    }
}

fn parse_status(status: &str) -> Result<RunStatus, StoreError> {
    status.parse().map_err(StoreError::OutOfRange)
}

fn to_u64(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::OutOfRange(format!("negative count {value}")))
}

fn to_i64(value: u64) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::OutOfRange(format!("count {value}")))
}
