//! Parameterized SQL for the result store and catalog loader.
//!
//! Multi-row statements are built for an exact row count; values are always
//! bound, never interpolated. Table names only come from validated
//! configuration and are quoted on the way in.

use crate::model::QueryMode;

/// Idempotent schema for results, progress and the run log.
pub const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS distance_result (
    origin_id INTEGER NOT NULL,
    dest_class TEXT NOT NULL,
    dest_id INTEGER,
    distance INTEGER NOT NULL,
    node_id INTEGER,
    PRIMARY KEY (origin_id, dest_class)
);
CREATE TABLE IF NOT EXISTS distance_result_list (
    origin_id INTEGER NOT NULL,
    dest_class TEXT NOT NULL,
    dest_id INTEGER NOT NULL,
    distance INTEGER NOT NULL,
    node_id INTEGER,
    PRIMARY KEY (origin_id, dest_class, dest_id)
);
CREATE TABLE IF NOT EXISTS unresolved_origin (
    origin_id INTEGER NOT NULL,
    dest_class TEXT NOT NULL,
    partition_id INTEGER NOT NULL,
    reason TEXT NOT NULL,
    PRIMARY KEY (origin_id, dest_class)
);
CREATE TABLE IF NOT EXISTS progress (
    id INTEGER PRIMARY KEY CHECK (id = 0),
    processed INTEGER NOT NULL
);
INSERT OR IGNORE INTO progress (id, processed) VALUES (0, 0);
CREATE TABLE IF NOT EXISTS run_log (
    partition_id INTEGER NOT NULL,
    dest_class TEXT NOT NULL,
    status TEXT NOT NULL,
    solved INTEGER NOT NULL DEFAULT 0,
    unresolved INTEGER NOT NULL DEFAULT 0,
    elapsed_minutes REAL NOT NULL,
    message TEXT,
    updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    PRIMARY KEY (partition_id, dest_class)
);
";

pub const ADVANCE_PROGRESS: &str = "UPDATE progress SET processed = processed + ?1 WHERE id = 0";

pub const CURRENT_PROGRESS: &str = "SELECT processed FROM progress WHERE id = 0";

pub const UPSERT_RUN_LOG: &str = "
INSERT INTO run_log (partition_id, dest_class, status, solved, unresolved, elapsed_minutes, message, updated_at)
VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, CURRENT_TIMESTAMP)
ON CONFLICT (partition_id, dest_class) DO UPDATE SET
    status = excluded.status,
    solved = excluded.solved,
    unresolved = excluded.unresolved,
    elapsed_minutes = excluded.elapsed_minutes,
    message = excluded.message,
    updated_at = excluded.updated_at";

pub const RUN_LOG_ENTRY: &str = "
SELECT partition_id, dest_class, status, solved, unresolved, elapsed_minutes, message
FROM run_log WHERE partition_id = ?1 AND dest_class = ?2";

pub const RUN_LOG_BY_STATUS: &str = "
SELECT partition_id, dest_class, status, solved, unresolved, elapsed_minutes, message
FROM run_log WHERE status = ?1 ORDER BY partition_id, dest_class";

pub const RUN_LOG_SUMMARY: &str = "SELECT status, COUNT(*) FROM run_log GROUP BY status";

pub const UNRESOLVED_REASON: &str =
    "SELECT reason FROM unresolved_origin WHERE origin_id = ?1 AND dest_class = ?2";

/// Unresolved markers of one (partition, class) unit, and how many of them
/// carry reason `?3`.
pub const UNRESOLVED_IN_PARTITION: &str = "
SELECT COUNT(*), COALESCE(SUM(reason = ?3), 0)
FROM unresolved_origin WHERE partition_id = ?1 AND dest_class = ?2";

/// Columns bound per row by [`upsert_results`].
pub const RESULT_COLUMNS: usize = 5;

/// Columns bound per row by [`insert_unresolved`].
pub const UNRESOLVED_COLUMNS: usize = 4;

/// Table holding results for a query mode.
pub fn result_table(mode: QueryMode) -> &'static str {
    match mode {
        QueryMode::Closest => "distance_result",
        QueryMode::Within => "distance_result_list",
    }
}

/// Multi-row upsert that only ever lowers a stored distance.
pub fn upsert_results(mode: QueryMode, rows: usize) -> String {
    let table = result_table(mode);
    let (conflict, update) = match mode {
        QueryMode::Closest => (
            "origin_id, dest_class",
            "dest_id = excluded.dest_id, distance = excluded.distance, node_id = excluded.node_id",
        ),
        QueryMode::Within => (
            "origin_id, dest_class, dest_id",
            "distance = excluded.distance, node_id = excluded.node_id",
        ),
    };
    format!(
        "INSERT INTO {table} (origin_id, dest_class, dest_id, distance, node_id) VALUES {} \
         ON CONFLICT ({conflict}) DO UPDATE SET {update} \
         WHERE excluded.distance < {table}.distance",
        placeholders(rows, RESULT_COLUMNS)
    )
}

/// Multi-row insert of unresolved markers; the first attempt wins.
pub fn insert_unresolved(rows: usize) -> String {
    format!(
        "INSERT INTO unresolved_origin (origin_id, dest_class, partition_id, reason) VALUES {} \
         ON CONFLICT (origin_id, dest_class) DO NOTHING",
        placeholders(rows, UNRESOLVED_COLUMNS)
    )
}

/// Origins among `ids` (bound as `?2..`) that already have a result or an
/// unresolved marker for class `?1`.
pub fn resolved_origins(mode: QueryMode, ids: usize) -> String {
    let list = (2..ids + 2)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "SELECT origin_id FROM {table} WHERE dest_class = ?1 AND origin_id IN ({list}) \
         UNION SELECT origin_id FROM unresolved_origin WHERE dest_class = ?1 AND origin_id IN ({list})",
        table = result_table(mode)
    )
}

pub fn count_results(mode: QueryMode) -> String {
    format!(
        "SELECT COUNT(*) FROM {} WHERE dest_class = ?1",
        result_table(mode)
    )
}

pub fn select_origins(table: &str) -> String {
    format!(
        "SELECT origin_id, partition_id, lat, lng FROM {} ORDER BY origin_id",
        quote_ident(table)
    )
}

pub fn select_destinations(table: &str) -> String {
    format!(
        "SELECT dest_id, dest_class, lat, lng FROM {} ORDER BY dest_id",
        quote_ident(table)
    )
}

pub fn select_partition_bounds(table: &str) -> String {
    format!(
        "SELECT partition_id, min_lat, min_lng, max_lat, max_lng FROM {}",
        quote_ident(table)
    )
}

/// Whether a configured table name is a plain SQL identifier.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => {}
        _ => return false,
    }
    name.len() <= 64 && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn placeholders(rows: usize, columns: usize) -> String {
    let row = format!("({})", vec!["?"; columns].join(", "));
    vec![row; rows].join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_upsert_closest_only_lowers_distance() {
        let sql = upsert_results(QueryMode::Closest, 2);
        assert!(sql.starts_with("INSERT INTO distance_result (origin_id"));
        assert!(sql.contains("VALUES (?, ?, ?, ?, ?), (?, ?, ?, ?, ?) ON CONFLICT"));
        assert!(sql.contains("ON CONFLICT (origin_id, dest_class) DO UPDATE"));
        assert!(sql.ends_with("WHERE excluded.distance < distance_result.distance"));
    }

    #[test]
    fn test_upsert_within_keys_on_destination() {
        let sql = upsert_results(QueryMode::Within, 1);
        assert!(sql.contains("distance_result_list"));
        assert!(sql.contains("ON CONFLICT (origin_id, dest_class, dest_id)"));
    }

    #[test]
    fn test_resolved_origins_reuses_numbered_params() {
        let sql = resolved_origins(QueryMode::Closest, 3);
        assert_eq!(sql.matches("IN (?2, ?3, ?4)").count(), 2);
        assert!(sql.contains("UNION SELECT origin_id FROM unresolved_origin"));
    }

    #[test]
    fn test_identifier_validation() {
        assert!(is_valid_identifier("origin"));
        assert!(is_valid_identifier("_mb_2021"));
        assert!(!is_valid_identifier(""));
        assert!(!is_valid_identifier("2021_mb"));
        assert!(!is_valid_identifier("origin; DROP TABLE run_log"));
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }
}
