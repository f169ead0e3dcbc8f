//! Per-partition work: for every destination class, find what is still
//! outstanding, route it, and write it back.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::error::HandlerError;
use crate::model::{
    Destination, DestinationClass, DistanceResult, Origin, OriginId, OriginOutcome, PartitionId,
    QueryMode, RunLogEntry, RunStatus, SolveOutcome, SolvedPair, UnresolvedReason,
};
use crate::store::ResultStore;
use crate::traits::{PartitionCatalog, RoutingSession};

/// Summary of one partition as seen by the worker that handled it.
#[derive(Debug, Default)]
pub struct PartitionOutcome {
    pub partition: PartitionId,
    /// (origin, class) units committed to progress.
    pub processed: u64,
    /// Classes recorded with status `error`.
    pub errors: usize,
    /// Classes that had nothing outstanding and were skipped.
    pub skipped: usize,
    /// Set when the worker must stop: its routing session is unusable.
    pub fatal: Option<HandlerError>,
}

#[derive(Debug, Default)]
struct ClassTally {
    solved: u64,
    unresolved: u64,
}

pub struct PartitionHandler<'a, C: PartitionCatalog> {
    catalog: &'a C,
    classes: &'a [DestinationClass],
    max_origins_per_solve: usize,
}

impl<'a, C: PartitionCatalog> PartitionHandler<'a, C> {
    /// `classes` must already be restricted to the eligible ones.
    pub fn new(catalog: &'a C, classes: &'a [DestinationClass], max_origins_per_solve: usize) -> Self {
        Self {
            catalog,
            classes,
            max_origins_per_solve: max_origins_per_solve.max(1),
        }
    }

    /// Handles every class of one partition. Errors are recorded in the run
    /// log and never escape; a fatal one is reported through
    /// [`PartitionOutcome::fatal`] after being logged.
    pub fn handle<S: RoutingSession>(
        &self,
        store: &mut ResultStore,
        session: &mut S,
        partition: PartitionId,
    ) -> PartitionOutcome {
        let span = tracing::info_span!("partition", id = partition);
        let _enter = span.enter();

        let mut outcome = PartitionOutcome {
            partition,
            ..PartitionOutcome::default()
        };

        let origins = match self.catalog.origins_in(partition) {
            Ok(origins) => origins,
            Err(err) => {
                tracing::error!(error = %err, "Failed to read partition origins");
                let err = HandlerError::from(err);
                for class in self.classes {
                    self.record_error(store, partition, class, 0.0, &err);
                }
                outcome.errors = self.classes.len();
                return outcome;
            }
        };

        if origins.is_empty() {
            tracing::debug!("No origins in partition");
            for class in self.classes {
                record(store, &RunLogEntry::new(partition, class.name.clone(), RunStatus::NoOrigins));
            }
            return outcome;
        }

        let origin_ids: Vec<OriginId> = origins.iter().map(|origin| origin.id).collect();

        for class in self.classes {
            let started = Instant::now();
            let mut tally = ClassTally::default();
            let result = self
                .process_class(store, session, partition, &origins, &origin_ids, class, &mut tally)
                .and_then(|attempted| self.settle(store, partition, class, origin_ids.len() as u64, attempted));
            let elapsed_minutes = started.elapsed().as_secs_f64() / 60.0;
            outcome.processed += tally.solved + tally.unresolved;

            match result {
                Ok(None) => {
                    tracing::debug!(class = %class.name, "Nothing outstanding");
                    outcome.skipped += 1;
                }
                Ok(Some(mut entry)) => {
                    entry.elapsed_minutes = elapsed_minutes;
                    if entry.status == RunStatus::NoSolution {
                        tracing::warn!(
                            class = %class.name,
                            unresolved = entry.unresolved,
                            "Origins without a solution; flagged for review"
                        );
                    }
                    tracing::info!(
                        class = %class.name,
                        status = %entry.status,
                        attempted = tally.solved + tally.unresolved,
                        solved = entry.solved,
                        unresolved = entry.unresolved,
                        elapsed_minutes,
                        "Class complete"
                    );
                    record(store, &entry);
                }
                Err(err) => {
                    tracing::error!(class = %class.name, error = %err, "Class failed");
                    self.record_error(store, partition, class, elapsed_minutes, &err);
                    outcome.errors += 1;
                    if err.is_fatal() {
                        outcome.fatal = Some(err);
                        return outcome;
                    }
                }
            }
        }

        outcome
    }

    /// Marks every class of `partition` as failed after the handler
    /// panicked part way through it.
    pub fn record_panic(&self, store: &ResultStore, partition: PartitionId, message: &str) -> PartitionOutcome {
        for class in self.classes {
            let mut entry = RunLogEntry::new(partition, class.name.clone(), RunStatus::Error);
            entry.message = Some(format!("handler panicked: {message}"));
            record(store, &entry);
        }
        PartitionOutcome {
            partition,
            errors: self.classes.len(),
            ..PartitionOutcome::default()
        }
    }

    /// Returns `false` when nothing was outstanding for the class.
    #[allow(clippy::too_many_arguments)]
    fn process_class<S: RoutingSession>(
        &self,
        store: &mut ResultStore,
        session: &mut S,
        partition: PartitionId,
        origins: &[Origin],
        origin_ids: &[OriginId],
        class: &DestinationClass,
        tally: &mut ClassTally,
    ) -> Result<bool, HandlerError> {
        let outstanding_ids: HashSet<OriginId> =
            store.outstanding(class, origin_ids)?.into_iter().collect();
        if outstanding_ids.is_empty() {
            return Ok(false);
        }
        let outstanding: Vec<Origin> = origins
            .iter()
            .filter(|origin| outstanding_ids.contains(&origin.id))
            .cloned()
            .collect();

        let near = self
            .catalog
            .destinations_near(partition, &class.name, class.cutoff_m)?;
        debug_assert!(near.iter().all(|destination| destination.class == class.name));

        if near.is_empty() {
            let outcomes: Vec<OriginOutcome> = outstanding
                .iter()
                .map(|origin| OriginOutcome::unresolved(origin.id))
                .collect();
            let stats = store.commit_outcomes(partition, class, &outcomes, UnresolvedReason::NoDestinations)?;
            tally.unresolved += stats.unresolved;
            return Ok(true);
        }

        for batch in outstanding.chunks(self.max_origins_per_solve) {
            let solved = session.solve_distances(batch, &near, class.cutoff_m)?;
            if matches!(solved, SolveOutcome::NoSolution) {
                tracing::warn!(
                    class = %class.name,
                    origins = batch.len(),
                    destinations = near.len(),
                    "Routing engine returned no solution for batch"
                );
            }
            let (routed, unsolved) = split_outcomes(class, batch, &near, solved);

            for (group, reason) in [(routed, UnresolvedReason::NoPath), (unsolved, UnresolvedReason::NoSolution)] {
                if group.is_empty() {
                    continue;
                }
                let stats = store.commit_outcomes(partition, class, &group, reason)?;
                tally.solved += stats.origins - stats.unresolved;
                tally.unresolved += stats.unresolved;
            }
        }

        Ok(true)
    }

    /// Builds the run log entry for a unit that has nothing left
    /// outstanding, from what the store holds across every attempt.
    ///
    /// A unit with nothing attempted this time is only rewritten when its
    /// row is missing or still says `error`.
    fn settle(
        &self,
        store: &ResultStore,
        partition: PartitionId,
        class: &DestinationClass,
        origins: u64,
        attempted: bool,
    ) -> Result<Option<RunLogEntry>, HandlerError> {
        if !attempted {
            match store.run_log_entry(partition, &class.name)? {
                Some(entry) if entry.status != RunStatus::Error => return Ok(None),
                Some(_) => tracing::info!(class = %class.name, "Replacing stale error row"),
                None => tracing::info!(class = %class.name, "Restoring missing run log row"),
            }
        }

        let unresolved = store.unresolved_in_partition(partition, &class.name)?;
        let solved = origins.saturating_sub(unresolved.total);
        let status = if unresolved.total == 0 {
            RunStatus::Solved
        } else if solved == 0 && unresolved.no_destinations == unresolved.total {
            RunStatus::NoDestinationsInRegion
        } else {
            RunStatus::NoSolution
        };

        let mut entry = RunLogEntry::new(partition, class.name.clone(), status);
        entry.solved = solved;
        entry.unresolved = unresolved.total;
        if status == RunStatus::NoSolution {
            entry.message = Some(format!(
                "{} of {} origins have no distance",
                unresolved.total, origins
            ));
        }
        Ok(Some(entry))
    }

    fn record_error(
        &self,
        store: &ResultStore,
        partition: PartitionId,
        class: &DestinationClass,
        elapsed_minutes: f64,
        err: &HandlerError,
    ) {
        let mut entry = RunLogEntry::new(partition, class.name.clone(), RunStatus::Error);
        entry.elapsed_minutes = elapsed_minutes;
        entry.message = Some(err.to_string());
        record(store, &entry);
    }
}

fn record(store: &ResultStore, entry: &RunLogEntry) {
    if let Err(err) = store.record_run(entry) {
        tracing::error!(
            partition = entry.partition_id,
            class = %entry.dest_class,
            status = %entry.status,
            error = %err,
            "Failed to write run log"
        );
    }
}

/// Splits a batch into outcomes to record with reason `no-path` and origins
/// the engine reported no solution for.
fn split_outcomes(
    class: &DestinationClass,
    batch: &[Origin],
    near: &[Destination],
    solved: SolveOutcome,
) -> (Vec<OriginOutcome>, Vec<OriginOutcome>) {
    match solved {
        SolveOutcome::Solved(pairs) => (build_outcomes(class, batch, near, pairs), Vec::new()),
        SolveOutcome::NoSolution => {
            let unsolved = batch
                .iter()
                .map(|origin| OriginOutcome::unresolved(origin.id))
                .collect();
            (Vec::new(), unsolved)
        }
        SolveOutcome::Partial { pairs, unsolved } => {
            tracing::warn!(
                class = %class.name,
                origins = batch.len(),
                unsolved = unsolved.len(),
                "Routing engine returned no solution for part of the batch"
            );
            let unsolved: HashSet<OriginId> = unsolved.into_iter().collect();
            build_outcomes(class, batch, near, pairs)
                .into_iter()
                .partition(|outcome| !(outcome.is_unresolved() && unsolved.contains(&outcome.origin_id)))
        }
    }
}

/// Turns engine pairs into per-origin outcomes, one per origin in `batch`
/// (in batch order). Pairs for unknown origins or destinations, or beyond
/// the cutoff, are dropped.
fn build_outcomes(
    class: &DestinationClass,
    batch: &[Origin],
    near: &[Destination],
    pairs: Vec<SolvedPair>,
) -> Vec<OriginOutcome> {
    let known_destinations: HashSet<i64> = near.iter().map(|destination| destination.id).collect();
    let mut by_origin: HashMap<OriginId, Vec<SolvedPair>> = batch
        .iter()
        .map(|origin| (origin.id, Vec::new()))
        .collect();

    for pair in pairs {
        if pair.distance_m > class.cutoff_m || !known_destinations.contains(&pair.dest_id) {
            continue;
        }
        if let Some(found) = by_origin.get_mut(&pair.origin_id) {
            found.push(pair);
        }
    }

    batch
        .iter()
        .map(|origin| {
            let mut found = by_origin.remove(&origin.id).unwrap_or_default();
            if class.mode == QueryMode::Closest {
                found.sort_by_key(|pair| (pair.distance_m, pair.dest_id));
                found.truncate(1);
            }
            OriginOutcome {
                origin_id: origin.id,
                rows: found
                    .into_iter()
                    .map(|pair| DistanceResult {
                        origin_id: origin.id,
                        dest_class: class.name.clone(),
                        dest_id: Some(pair.dest_id),
                        distance_m: pair.distance_m,
                        node_id: pair.node_id,
                    })
                    .collect(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(origin: OriginId, dest: i64, distance: u32) -> SolvedPair {
        SolvedPair {
            origin_id: origin,
            dest_id: dest,
            distance_m: distance,
            node_id: None,
        }
    }

    fn batch() -> Vec<Origin> {
        vec![Origin::new(1, 9, 0.0, 0.0), Origin::new(2, 9, 0.0, 0.001)]
    }

    fn near() -> Vec<Destination> {
        vec![
            Destination::new(10, "supermarket", 0.0, 0.002),
            Destination::new(11, "supermarket", 0.0, 0.003),
        ]
    }

    #[test]
    fn test_closest_keeps_nearest_per_origin() {
        let class = DestinationClass::closest("supermarket", 1_000);
        let pairs = vec![pair(1, 10, 400), pair(1, 11, 300), pair(2, 10, 150)];
        let outcomes = build_outcomes(&class, &batch(), &near(), pairs);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].rows.len(), 1);
        assert_eq!(outcomes[0].rows[0].dest_id, Some(11));
        assert_eq!(outcomes[0].rows[0].distance_m, 300);
        assert_eq!(outcomes[1].rows[0].distance_m, 150);
    }

    #[test]
    fn test_within_keeps_every_reachable_destination() {
        let class = DestinationClass::within("supermarket", 350);
        let pairs = vec![pair(1, 10, 400), pair(1, 11, 300), pair(2, 10, 150), pair(2, 11, 200)];
        let outcomes = build_outcomes(&class, &batch(), &near(), pairs);
        assert_eq!(outcomes[0].rows.len(), 1);
        assert_eq!(outcomes[1].rows.len(), 2);
    }

    #[test]
    fn test_partial_solve_separates_unsolved_origins() {
        let class = DestinationClass::closest("supermarket", 1_000);
        let batch = vec![
            Origin::new(1, 9, 0.0, 0.0),
            Origin::new(2, 9, 0.0, 0.001),
            Origin::new(3, 9, 0.0, 0.002),
        ];
        // Origin 2 sat in a failed block but was routed by another one;
        // origin 3 is routed without any pair in reach.
        let solved = SolveOutcome::Partial {
            pairs: vec![pair(1, 10, 400), pair(2, 11, 500)],
            unsolved: vec![2, 4],
        };
        let (routed, unsolved) = split_outcomes(&class, &batch, &near(), solved);
        let routed: Vec<OriginId> = routed.iter().map(|outcome| outcome.origin_id).collect();
        assert_eq!(routed, vec![1, 2, 3]);
        assert!(unsolved.is_empty());

        let solved = SolveOutcome::Partial {
            pairs: vec![pair(1, 10, 400)],
            unsolved: vec![2, 3],
        };
        let (routed, unsolved) = split_outcomes(&class, &batch, &near(), solved);
        assert_eq!(routed.len(), 1);
        assert_eq!(unsolved.iter().map(|outcome| outcome.origin_id).collect::<Vec<_>>(), vec![2, 3]);
        assert!(unsolved.iter().all(OriginOutcome::is_unresolved));
    }

    #[test]
    fn test_whole_batch_no_solution_is_unsolved() {
        let class = DestinationClass::within("supermarket", 1_000);
        let (routed, unsolved) = split_outcomes(&class, &batch(), &near(), SolveOutcome::NoSolution);
        assert!(routed.is_empty());
        assert_eq!(unsolved.len(), 2);
    }

    #[test]
    fn test_origins_without_pairs_are_unresolved() {
        let class = DestinationClass::closest("supermarket", 1_000);
        let pairs = vec![pair(1, 10, 400), pair(99, 10, 10), pair(2, 77, 10)];
        let outcomes = build_outcomes(&class, &batch(), &near(), pairs);
        assert!(!outcomes[0].is_unresolved());
        assert!(outcomes[1].is_unresolved());
    }
}
