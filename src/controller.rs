//! Run controller: bootstrap, goal, dispatch, verdict.

use std::fmt;

use crate::config::Config;
use crate::error::PipelineError;
use crate::handler::PartitionHandler;
use crate::model::DestinationClass;
use crate::pool::{PoolReport, WorkerPool};
use crate::progress::EtaEstimator;
use crate::store::ResultStore;
use crate::traits::{PartitionCatalog, RoutingEngine};

/// The number of (origin, class) units a complete run must process.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionGoal {
    pub origins: u64,
    /// Classes with enough destinations in the region to be computed.
    pub eligible: Vec<DestinationClass>,
    /// Names of configured classes left out for lack of destinations.
    pub skipped: Vec<String>,
    pub total: u64,
}

/// Computes the goal from catalog data: origins times eligible classes.
pub fn completion_goal<C: PartitionCatalog>(catalog: &C, classes: &[DestinationClass]) -> CompletionGoal {
    let (eligible, skipped): (Vec<&DestinationClass>, Vec<&DestinationClass>) = classes
        .iter()
        .partition(|class| catalog.destination_count(&class.name) >= class.required_count());

    let origins = catalog.origin_count() as u64;
    CompletionGoal {
        origins,
        total: origins * eligible.len() as u64,
        eligible: eligible.into_iter().cloned().collect(),
        skipped: skipped.into_iter().map(|class| class.name.clone()).collect(),
    }
}

/// Final comparison of processed units against the goal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    Complete { processed: u64 },
    Shortfall { processed: u64, goal: u64, missing: u64 },
    /// More units than the goal: something was counted twice.
    Anomaly { processed: u64, goal: u64, excess: u64 },
}

impl RunVerdict {
    pub fn classify(processed: u64, goal: u64) -> Self {
        use std::cmp::Ordering;
        match processed.cmp(&goal) {
            Ordering::Equal => RunVerdict::Complete { processed },
            Ordering::Less => RunVerdict::Shortfall {
                processed,
                goal,
                missing: goal - processed,
            },
            Ordering::Greater => RunVerdict::Anomaly {
                processed,
                goal,
                excess: processed - goal,
            },
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self, RunVerdict::Complete { .. })
    }

    /// Process exit status for calling automation.
    pub fn exit_code(&self) -> u8 {
        match self {
            RunVerdict::Complete { .. } => 0,
            RunVerdict::Shortfall { .. } => 2,
            RunVerdict::Anomaly { .. } => 3,
        }
    }
}

impl fmt::Display for RunVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunVerdict::Complete { processed } => write!(f, "complete: {processed} units processed"),
            RunVerdict::Shortfall { processed, goal, missing } => {
                write!(f, "shortfall: {processed}/{goal} units processed, {missing} missing")
            }
            RunVerdict::Anomaly { processed, goal, excess } => {
                write!(f, "anomaly: {processed}/{goal} units processed, {excess} over goal")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub goal: CompletionGoal,
    /// Progress before this run dispatched anything.
    pub baseline: u64,
    pub verdict: RunVerdict,
    /// One entry per pool pass; empty when the run was already complete.
    pub passes: Vec<PoolReport>,
}

impl RunReport {
    pub fn already_complete(&self) -> bool {
        self.passes.is_empty()
    }
}

pub struct RunController<'a, C, E> {
    config: &'a Config,
    catalog: &'a C,
    engine: &'a E,
}

impl<'a, C, E> RunController<'a, C, E>
where
    C: PartitionCatalog,
    E: RoutingEngine,
{
    pub fn new(config: &'a Config, catalog: &'a C, engine: &'a E) -> Self {
        Self { config, catalog, engine }
    }

    pub fn run(&self) -> Result<RunReport, PipelineError> {
        let store = ResultStore::open(&self.config.store)?;
        store.bootstrap()?;

        let goal = completion_goal(self.catalog, &self.config.classes);
        for name in &goal.skipped {
            tracing::warn!(class = %name, "Too few destinations in region; class skipped");
        }
        tracing::info!(
            origins = goal.origins,
            classes = goal.eligible.len(),
            goal = goal.total,
            "Completion goal"
        );

        let baseline = store.progress().current()?;
        if baseline >= goal.total {
            tracing::info!(processed = baseline, goal = goal.total, "Progress already at or beyond the goal; nothing dispatched");
            let verdict = self.conclude(baseline, goal.total);
            return Ok(RunReport {
                goal,
                baseline,
                verdict,
                passes: Vec::new(),
            });
        }

        let partitions = self.catalog.list_partitions();
        let handler = PartitionHandler::new(
            self.catalog,
            &goal.eligible,
            self.config.pool.max_origins_per_solve,
        );
        let pool = WorkerPool::new(self.config.pool.workers);
        let eta = EtaEstimator::new(baseline, goal.total);

        let mut passes = Vec::new();
        let first = pool.run(&partitions, &self.config.store, self.engine, &handler, &eta)?;
        tracing::info!("First pass finished. {first}");
        let mut processed = store.progress().current()?;

        if self.config.run.retry_shortfall && processed < goal.total && first.had_failures() {
            tracing::warn!(
                missing = goal.total - processed,
                errors = first.errors,
                "Shortfall after first pass; dispatching once more"
            );
            passes.push(first);
            let retry = pool.run(&partitions, &self.config.store, self.engine, &handler, &eta)?;
            tracing::info!("Retry pass finished. {retry}");
            passes.push(retry);
            processed = store.progress().current()?;
        } else {
            passes.push(first);
        }

        let verdict = self.conclude(processed, goal.total);
        Ok(RunReport {
            goal,
            baseline,
            verdict,
            passes,
        })
    }

    fn conclude(&self, processed: u64, goal: u64) -> RunVerdict {
        let verdict = RunVerdict::classify(processed, goal);
        match verdict {
            RunVerdict::Complete { processed } => {
                tracing::info!(processed, "Run complete: processed count matches goal");
            }
            RunVerdict::Shortfall { processed, goal, missing } => {
                tracing::warn!(
                    processed,
                    goal,
                    missing,
                    "Goal shortfall: {missing} units were not processed; check run_log for error entries"
                );
            }
            RunVerdict::Anomaly { processed, goal, excess } => {
                tracing::error!(
                    processed,
                    goal,
                    excess,
                    "Processed count exceeds goal by {excess}; units were counted more than once"
                );
            }
        }
        verdict
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::MemoryCatalog;
    use crate::model::{Destination, Origin};

    #[test]
    fn test_goal_counts_only_eligible_classes() {
        let origins = (1..=5).map(|id| Origin::new(id, 1, -37.81, 144.96)).collect();
        let destinations = vec![
            Destination::new(1, "supermarket", -37.81, 144.97),
            Destination::new(2, "park", -37.81, 144.97),
            Destination::new(3, "park", -37.82, 144.97),
        ];
        let catalog = MemoryCatalog::new(origins, destinations);
        let classes = vec![
            DestinationClass::closest("supermarket", 1_000),
            DestinationClass::closest("park", 400).with_min_count(3),
            DestinationClass::closest("school", 1_600),
        ];

        let goal = completion_goal(&catalog, &classes);
        assert_eq!(goal.origins, 5);
        assert_eq!(goal.eligible.len(), 1);
        assert_eq!(goal.skipped, vec!["park".to_string(), "school".to_string()]);
        assert_eq!(goal.total, 5);
    }

    #[test]
    fn test_verdict_distinguishes_anomaly_from_success() {
        assert_eq!(RunVerdict::classify(10, 10), RunVerdict::Complete { processed: 10 });
        assert_eq!(
            RunVerdict::classify(7, 10),
            RunVerdict::Shortfall {
                processed: 7,
                goal: 10,
                missing: 3
            }
        );
        let anomaly = RunVerdict::classify(12, 10);
        assert_eq!(anomaly.exit_code(), 3);
        assert!(!anomaly.is_complete());
        assert!(anomaly.to_string().contains("2 over goal"));
        assert_eq!(RunVerdict::classify(0, 0).exit_code(), 0);
    }
}
