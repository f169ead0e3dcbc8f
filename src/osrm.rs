//! OSRM HTTP adapter for origin/destination distances.
//!
//! Uses the `table` service with `annotations=distance`. Large batches are
//! split into blocks so no single request exceeds `max_table_size`
//! coordinates; the blocks are merged back into one outcome.

use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RoutingError;
use crate::license::{TokenGuard, TokenPool};
use crate::model::{Destination, Origin, OriginId, SolveOutcome, SolvedPair};
use crate::traits::{RoutingEngine, RoutingSession};

/// OSRM response codes that mean "no answer for this table" rather than a
/// malformed request.
const NO_SOLUTION_CODES: [&str; 3] = ["NoSegment", "NoTable", "NoRoute"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OsrmConfig {
    pub base_url: String,
    pub profile: String,
    pub timeout_secs: u64,
    /// Upper bound on sources + destinations per table request (mirrors
    /// `osrm-routed --max-table-size`).
    pub max_table_size: usize,
    /// Retries for transient failures (connect errors, timeouts, 5xx).
    pub retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for OsrmConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            profile: "foot".to_string(),
            timeout_secs: 60,
            max_table_size: 100,
            retries: 3,
            retry_backoff_ms: 500,
        }
    }
}

/// Routing engine backed by an `osrm-routed` server.
#[derive(Debug, Clone)]
pub struct OsrmEngine {
    config: OsrmConfig,
    licenses: Option<TokenPool>,
    license_wait: Duration,
}

impl OsrmEngine {
    pub fn new(config: OsrmConfig) -> Self {
        Self {
            config,
            licenses: None,
            license_wait: Duration::ZERO,
        }
    }

    /// Limits concurrent sessions (and so concurrent server load) to the
    /// pool's capacity.
    pub fn with_licenses(mut self, licenses: TokenPool, wait: Duration) -> Self {
        self.licenses = Some(licenses);
        self.license_wait = wait;
        self
    }

    pub fn config(&self) -> &OsrmConfig {
        &self.config
    }
}

impl RoutingEngine for OsrmEngine {
    type Session = OsrmSession;

    fn checkout(&self) -> Result<Self::Session, RoutingError> {
        let license = self
            .licenses
            .as_ref()
            .map(|pool| pool.acquire_timeout(self.license_wait))
            .transpose()?;

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .build()
            .map_err(|err| RoutingError::Unavailable(format!("failed to build HTTP client: {err}")))?;

        Ok(OsrmSession {
            config: self.config.clone(),
            client,
            _license: license,
        })
    }
}

/// One worker's connection to OSRM.
#[derive(Debug)]
pub struct OsrmSession {
    config: OsrmConfig,
    client: reqwest::blocking::Client,
    _license: Option<TokenGuard>,
}

impl RoutingSession for OsrmSession {
    fn solve_distances(
        &mut self,
        origins: &[Origin],
        destinations: &[Destination],
        cutoff_m: u32,
    ) -> Result<SolveOutcome, RoutingError> {
        if origins.is_empty() || destinations.is_empty() {
            return Ok(SolveOutcome::NoSolution);
        }

        let (origin_block, dest_block) =
            block_sizes(origins.len(), destinations.len(), self.config.max_table_size);

        let mut merge = TableMerge::new(cutoff_m);
        for dest_chunk in destinations.chunks(dest_block) {
            for origin_chunk in origins.chunks(origin_block) {
                let url = table_url(&self.config, origin_chunk, dest_chunk);
                let body = self.fetch(&url)?;
                merge.add(&body, origin_chunk, dest_chunk)?;
            }
        }
        Ok(merge.finish())
    }
}

enum Attempt {
    Transient(String),
    Failed(RoutingError),
}

impl OsrmSession {
    fn fetch(&self, url: &str) -> Result<OsrmTableResponse, RoutingError> {
        let mut attempt = 0;
        loop {
            match self.fetch_once(url) {
                Ok(body) => return Ok(body),
                Err(Attempt::Transient(reason)) if attempt < self.config.retries => {
                    let backoff = self.config.retry_backoff_ms.saturating_mul(1 << attempt.min(16));
                    tracing::warn!(attempt, backoff_ms = backoff, %reason, "OSRM request failed, retrying");
                    std::thread::sleep(Duration::from_millis(backoff));
                    attempt += 1;
                }
                Err(Attempt::Transient(reason)) => {
                    return Err(RoutingError::Unavailable(format!(
                        "{reason} (after {} attempts)",
                        attempt + 1
                    )));
                }
                Err(Attempt::Failed(err)) => return Err(err),
            }
        }
    }

    fn fetch_once(&self, url: &str) -> Result<OsrmTableResponse, Attempt> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| Attempt::Transient(err.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(Attempt::Transient(format!("server returned {status}")));
        }

        // OSRM reports request-level problems as JSON bodies on 4xx too.
        response
            .json::<OsrmTableResponse>()
            .map_err(|err| Attempt::Failed(RoutingError::Http(err)))
    }
}

/// Splits a table into blocks of at most `max_table_size` coordinates.
fn block_sizes(origins: usize, destinations: usize, max_table_size: usize) -> (usize, usize) {
    let max = max_table_size.max(2);
    if origins + destinations <= max {
        return (origins.max(1), destinations.max(1));
    }
    let dest_block = destinations.min(max / 2).max(1);
    let origin_block = (max - dest_block).max(1);
    (origin_block, dest_block)
}

fn table_url(config: &OsrmConfig, origins: &[Origin], destinations: &[Destination]) -> String {
    let coords = origins
        .iter()
        .map(|origin| origin.location())
        .chain(destinations.iter().map(|destination| destination.location()))
        .map(|(lat, lng)| format!("{:.6},{:.6}", lng, lat))
        .collect::<Vec<_>>()
        .join(";");

    let sources = (0..origins.len())
        .map(|index| index.to_string())
        .collect::<Vec<_>>()
        .join(";");
    let targets = (origins.len()..origins.len() + destinations.len())
        .map(|index| index.to_string())
        .collect::<Vec<_>>()
        .join(";");

    format!(
        "{}/table/v1/{}/{}?sources={}&destinations={}&annotations=distance",
        config.base_url.trim_end_matches('/'),
        config.profile,
        coords,
        sources,
        targets
    )
}

/// Folds block responses back into one outcome for the whole batch.
///
/// A block answered with a no-solution code marks its origins unsolved;
/// those origins may still pick up pairs from other destination blocks.
struct TableMerge {
    cutoff_m: u32,
    pairs: Vec<SolvedPair>,
    unsolved: BTreeSet<OriginId>,
    blocks: usize,
    failed: usize,
}

impl TableMerge {
    fn new(cutoff_m: u32) -> Self {
        Self {
            cutoff_m,
            pairs: Vec::new(),
            unsolved: BTreeSet::new(),
            blocks: 0,
            failed: 0,
        }
    }

    fn add(
        &mut self,
        body: &OsrmTableResponse,
        origins: &[Origin],
        destinations: &[Destination],
    ) -> Result<(), RoutingError> {
        self.blocks += 1;
        if body.code != "Ok" {
            if NO_SOLUTION_CODES.contains(&body.code.as_str()) {
                tracing::debug!(code = %body.code, origins = origins.len(), "OSRM found no solution for block");
                self.failed += 1;
                self.unsolved.extend(origins.iter().map(|origin| origin.id));
                return Ok(());
            }
            return Err(RoutingError::Rejected {
                code: body.code.clone(),
                message: body.message.clone().unwrap_or_default(),
            });
        }

        let Some(rows) = body.distances.as_ref() else {
            return Ok(());
        };

        for (origin, row) in origins.iter().zip(rows) {
            for (destination, value) in destinations.iter().zip(row) {
                let Some(metres) = value else {
                    continue;
                };
                let distance_m = metres.round() as u32;
                if distance_m <= self.cutoff_m {
                    self.pairs.push(SolvedPair {
                        origin_id: origin.id,
                        dest_id: destination.id,
                        distance_m,
                        node_id: None,
                    });
                }
            }
        }
        Ok(())
    }

    fn finish(self) -> SolveOutcome {
        if self.failed == 0 {
            SolveOutcome::Solved(self.pairs)
        } else if self.failed == self.blocks {
            SolveOutcome::NoSolution
        } else {
            SolveOutcome::Partial {
                pairs: self.pairs,
                unsolved: self.unsolved.into_iter().collect(),
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct OsrmTableResponse {
    code: String,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    distances: Option<Vec<Vec<Option<f64>>>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origins() -> Vec<Origin> {
        vec![
            Origin::new(1, 7, -37.8136, 144.9631),
            Origin::new(2, 7, -37.8150, 144.9650),
        ]
    }

    fn destinations() -> Vec<Destination> {
        vec![Destination::new(900, "supermarket", -37.8100, 144.9600)]
    }

    #[test]
    fn test_table_url_lists_sources_then_destinations() {
        let url = table_url(&OsrmConfig::default(), &origins(), &destinations());
        assert!(url.starts_with("http://localhost:5000/table/v1/foot/144.963100,-37.813600;"));
        assert!(url.contains("sources=0;1&destinations=2"));
        assert!(url.ends_with("annotations=distance"));
    }

    #[test]
    fn test_block_sizes_fit_table_limit() {
        assert_eq!(block_sizes(10, 5, 100), (10, 5));
        let (origin_block, dest_block) = block_sizes(500, 300, 100);
        assert!(origin_block + dest_block <= 100);
        assert_eq!(dest_block, 50);
        let (origin_block, dest_block) = block_sizes(500, 3, 100);
        assert_eq!((origin_block, dest_block), (97, 3));
    }

    fn response(json: &str) -> OsrmTableResponse {
        serde_json::from_str(json).expect("json")
    }

    #[test]
    fn test_merge_skips_nulls_and_cutoff() {
        let body = response(r#"{"code":"Ok","distances":[[420.4],[null]]}"#);
        let mut merge = TableMerge::new(1_000);
        merge.add(&body, &origins(), &destinations()).expect("pairs");
        assert_eq!(
            merge.finish(),
            SolveOutcome::Solved(vec![SolvedPair {
                origin_id: 1,
                dest_id: 900,
                distance_m: 420,
                node_id: None
            }])
        );

        // Everything beyond the cutoff is still a solved table.
        let mut merge = TableMerge::new(400);
        merge.add(&body, &origins(), &destinations()).expect("pairs");
        assert_eq!(merge.finish(), SolveOutcome::Solved(Vec::new()));
    }

    #[test]
    fn test_no_segment_is_not_an_error() {
        let body = response(
            r#"{"code":"NoSegment","message":"Could not find a matching segment for coordinate 1"}"#,
        );
        let mut merge = TableMerge::new(1_000);
        assert!(merge.add(&body, &origins(), &destinations()).is_ok());
        assert_eq!(merge.finish(), SolveOutcome::NoSolution);
    }

    #[test]
    fn test_no_segment_block_marks_only_its_origins_unsolved() {
        let solved_block = vec![Origin::new(1, 7, -37.8136, 144.9631)];
        let failed_block = vec![
            Origin::new(2, 7, -37.8150, 144.9650),
            Origin::new(3, 7, -37.8160, 144.9660),
        ];
        let mut merge = TableMerge::new(1_000);
        merge
            .add(&response(r#"{"code":"Ok","distances":[[310.0]]}"#), &solved_block, &destinations())
            .expect("ok block");
        merge
            .add(&response(r#"{"code":"NoSegment"}"#), &failed_block, &destinations())
            .expect("no-segment block");

        match merge.finish() {
            SolveOutcome::Partial { pairs, unsolved } => {
                assert_eq!(pairs.len(), 1);
                assert_eq!(pairs[0].origin_id, 1);
                assert_eq!(unsolved, vec![2, 3]);
            }
            other => panic!("expected a partial solution, got {other:?}"),
        }
    }

    #[test]
    fn test_other_codes_are_rejected() {
        let body = response(r#"{"code":"TooBig","message":"Too many table coordinates"}"#);
        let mut merge = TableMerge::new(1_000);
        let err = merge
            .add(&body, &origins(), &destinations())
            .expect_err("rejected");
        assert!(matches!(err, RoutingError::Rejected { ref code, .. } if code == "TooBig"));
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_unreachable_server_is_fatal_after_retries() {
        let engine = OsrmEngine::new(OsrmConfig {
            base_url: "http://127.0.0.1:9".to_string(),
            timeout_secs: 1,
            retries: 1,
            retry_backoff_ms: 1,
            ..OsrmConfig::default()
        });
        let mut session = engine.checkout().expect("session");
        let err = session
            .solve_distances(&origins(), &destinations(), 1_000)
            .expect_err("unreachable");
        assert!(err.is_fatal(), "expected fatal error, got {err:?}");
    }
}
