//! Executor
//!
//! Runs a cycle's sorted operations as jobs on the tokio runtime, at most
//! `max_concurrency` at a time. A job starts once every operation it depends
//! on has completed; if one of them failed the job is skipped. Two jobs never
//! touch the same pairing at once.

use super::job::{CycleSnapshots, Job, JobContext};
use super::sorter::{sort_operations, SortRules};
use crate::config::PropagationConfig;
use crate::error::{ExitCause, ExitCode, ExitInfo, SyncError};
use crate::reconciliation::{OperationEffect, PendingOperation};
use crate::types::{NodeId, OperationType, ReplicaSide, SyncPath};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// Identity of an operation across cycles, for retry accounting
type AttemptKey = (OperationType, OperationEffect, ReplicaSide, NodeId);

fn attempt_key(op: &PendingOperation) -> AttemptKey {
    (op.kind, op.effect, op.source_side, op.item_id.clone())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Waiting,
    Running,
    Done,
    Failed,
    Skipped,
}

/// A job that did not complete
#[derive(Debug, Clone)]
pub struct JobFailure {
    pub operation: usize,
    pub kind: OperationType,
    pub path: SyncPath,
    pub info: ExitInfo,
    pub message: String,
    /// Whether the operation will be attempted again next cycle
    pub will_retry: bool,
}

/// Outcome of one propagation pass
#[derive(Debug, Clone, Default)]
pub struct PropagationReport {
    pub completed: usize,
    pub failed: Vec<JobFailure>,
    /// Operations not run because a dependency failed, the engine stopped,
    /// or their retries are exhausted
    pub skipped: Vec<usize>,
}

impl PropagationReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Executor: bounded-concurrency job runner with retry accounting
pub struct Executor {
    ctx: Arc<JobContext>,
    config: PropagationConfig,
    rules: SortRules,
    running: Arc<RwLock<bool>>,
    attempts: HashMap<AttemptKey, u32>,
}

impl Executor {
    pub fn new(ctx: Arc<JobContext>, config: PropagationConfig, rules: SortRules) -> Self {
        Self {
            ctx,
            config,
            rules,
            running: Arc::new(RwLock::new(true)),
            attempts: HashMap::new(),
        }
    }

    /// Share the engine's running flag; jobs not yet started are skipped once it drops
    pub fn with_running_flag(mut self, running: Arc<RwLock<bool>>) -> Self {
        self.running = running;
        self
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    /// Forget failure counts, e.g. after a full resync
    pub fn clear_attempts(&mut self) {
        self.attempts.clear();
    }

    fn exhausted(&self, op: &PendingOperation) -> bool {
        self.attempts
            .get(&attempt_key(op))
            .map(|count| *count >= self.config.retry_limit)
            .unwrap_or(false)
    }

    /// Sort and run `operations`. Fails only when they cannot be ordered.
    pub async fn propagate(
        &mut self,
        operations: Vec<PendingOperation>,
        snapshots: CycleSnapshots,
    ) -> Result<PropagationReport, SyncError> {
        let total = operations.len();
        let mut queue: VecDeque<PendingOperation> = sort_operations(operations, &self.rules)?.into();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut states: HashMap<usize, JobState> = queue.iter().map(|op| (op.id, JobState::Waiting)).collect();
        let mut busy_pairs: HashSet<u64> = HashSet::new();
        let mut in_flight: HashMap<usize, PendingOperation> = HashMap::new();
        let mut running = FuturesUnordered::new();
        let mut report = PropagationReport::default();

        info!(operations = total, concurrency = self.config.max_concurrency, "Propagating");

        loop {
            let mut waiting = VecDeque::new();
            while let Some(op) = queue.pop_front() {
                if !*self.running.read() {
                    states.insert(op.id, JobState::Skipped);
                    report.skipped.push(op.id);
                    continue;
                }
                if self.exhausted(&op) {
                    warn!(operation = %op, "Retries exhausted, not attempting again");
                    states.insert(op.id, JobState::Failed);
                    report.skipped.push(op.id);
                    continue;
                }
                let blocked = op
                    .depends_on
                    .iter()
                    .any(|d| matches!(states.get(d), Some(JobState::Failed | JobState::Skipped)));
                if blocked {
                    debug!(operation = %op, "Dependency failed, skipping");
                    states.insert(op.id, JobState::Skipped);
                    report.skipped.push(op.id);
                    continue;
                }
                let ready = op
                    .depends_on
                    .iter()
                    .all(|d| matches!(states.get(d), Some(JobState::Done) | None));
                let pair_busy = op.db_id.map(|db_id| busy_pairs.contains(&db_id)).unwrap_or(false);
                if !ready || pair_busy {
                    waiting.push_back(op);
                    continue;
                }

                if let Some(db_id) = op.db_id {
                    busy_pairs.insert(db_id);
                }
                states.insert(op.id, JobState::Running);
                let id = op.id;
                let job = Job::new(op.clone(), Arc::clone(&self.ctx), snapshots.clone());
                in_flight.insert(id, op);
                let permits = Arc::clone(&semaphore);
                let handle = tokio::spawn(async move {
                    let _permit = permits
                        .acquire_owned()
                        .await
                        .map_err(|_| SyncError::Aborted("job pool closed".to_string()))?;
                    job.run().await
                });
                running.push(async move { (id, handle.await) });
            }
            queue = waiting;

            let Some((id, joined)) = running.next().await else {
                break;
            };
            let result = joined.unwrap_or_else(|e| {
                Err(SyncError::exit(
                    ExitInfo::new(ExitCode::LogicError, ExitCause::Unknown),
                    format!("job panicked: {}", e),
                ))
            });
            let Some(op) = in_flight.remove(&id) else {
                continue;
            };
            if let Some(db_id) = op.db_id {
                busy_pairs.remove(&db_id);
            }
            let key = attempt_key(&op);
            match result {
                Ok(()) => {
                    self.attempts.remove(&key);
                    states.insert(id, JobState::Done);
                    report.completed += 1;
                }
                Err(e) => {
                    let info = e.exit_info();
                    let count = self.attempts.entry(key).or_insert(0);
                    *count += 1;
                    if !info.is_retryable() {
                        *count = (*count).max(self.config.retry_limit);
                    }
                    let will_retry = *count < self.config.retry_limit;
                    if will_retry {
                        warn!(operation = %op, error = %e, exit = %info, attempt = *count, "Job failed, will retry next cycle");
                    } else {
                        error!(operation = %op, error = %e, exit = %info, "Job failed");
                    }
                    states.insert(id, JobState::Failed);
                    report.failed.push(JobFailure {
                        operation: id,
                        kind: op.kind,
                        path: op.path.clone(),
                        info,
                        message: e.to_string(),
                        will_retry,
                    });
                }
            }
        }

        for op in queue {
            report.skipped.push(op.id);
        }
        info!(
            completed = report.completed,
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "Propagation finished"
        );
        Ok(report)
    }
}
