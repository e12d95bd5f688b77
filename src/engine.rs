//! Sync engine
//!
//! Drives the cycle: observe both replicas, freeze their snapshots, reconcile
//! against the sync database, propagate. A failing cycle is aborted and
//! retried on the next tick; only fatal causes stop the engine.

use crate::config::{SyncConfig, WatcherConfig};
use crate::db::{DbIndex, SledSyncDb, SyncDbStore};
use crate::error::{ExitCode, ExitInfo, SnapshotError, SyncError};
use crate::observer::{local_root_id, LocalObserver, RemoteObserver};
use crate::propagation::{
    CycleSnapshots, Executor, JobContext, JobFailure, PropagationReport, SortRules, StatusTracker, Vfs,
};
use crate::reconciliation::{
    summarize, ConflictReport, ConflictSink, LocalContentProbe, LogConflictSink, Reconciler,
};
use crate::remote::{HttpRemoteApi, RemoteApi};
use crate::snapshot::{NameCaseRule, SharedSnapshot, Snapshot};
use crate::status::{StatusService, UnsyncableRegistry};
use crate::types::{OperationType, ReplicaSide};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Result of one completed cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    pub operations: BTreeMap<OperationType, usize>,
    pub conflicts: Vec<ConflictReport>,
    pub unsyncable: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub elapsed_ms: u64,
}

impl CycleReport {
    pub fn total_operations(&self) -> usize {
        self.operations.values().sum()
    }
}

/// Engine state shared with status queries
#[derive(Debug, Clone, Default)]
pub struct EngineState {
    pub cycles: u64,
    pub last_cycle: Option<CycleReport>,
    pub last_error: Option<(ExitInfo, String)>,
    pub failures: Vec<JobFailure>,
}

/// Whether an error stops the engine instead of aborting one cycle
fn is_fatal(info: &ExitInfo) -> bool {
    matches!(
        info.code,
        ExitCode::FatalError | ExitCode::InvalidToken | ExitCode::InvalidSync
    )
}

/// SyncEngine: owner of the observers, the database and the executor
pub struct SyncEngine {
    config: SyncConfig,
    root: PathBuf,
    db: Arc<dyn SyncDbStore>,
    local: LocalObserver,
    remote: RemoteObserver,
    executor: Executor,
    vfs: Arc<dyn Vfs>,
    sink: Arc<dyn ConflictSink>,
    unsyncable: UnsyncableRegistry,
    running: Arc<RwLock<bool>>,
    state: Arc<RwLock<EngineState>>,
    watching: bool,
}

impl SyncEngine {
    /// Engine over the HTTP remote and the on-disk database
    pub fn open(config: SyncConfig) -> Result<Self, SyncError> {
        let root = Self::root_of(&config)?;
        let db_path = config.storage.resolve_db_path(&root)?;
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| SyncError::io(parent, e))?;
        }
        let db = Arc::new(SledSyncDb::open(&db_path)?);
        let api: Arc<dyn RemoteApi> = Arc::new(HttpRemoteApi::new(&config.remote)?);
        Self::new(config, api, db)
    }

    fn root_of(config: &SyncConfig) -> Result<PathBuf, SyncError> {
        config
            .sync
            .root
            .clone()
            .ok_or_else(|| SyncError::ConfigError("sync.root is not set".to_string()))
    }

    pub fn new(config: SyncConfig, api: Arc<dyn RemoteApi>, db: Arc<SledSyncDb>) -> Result<Self, SyncError> {
        Self::with_vfs(config, api, db, Arc::new(StatusTracker::new()))
    }

    /// Engine reporting per-item syncing state and progress to `vfs`
    pub fn with_vfs(
        config: SyncConfig,
        api: Arc<dyn RemoteApi>,
        db: Arc<SledSyncDb>,
        vfs: Arc<dyn Vfs>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        let root = Self::root_of(&config)?;
        let root = dunce::canonicalize(&root).map_err(|e| SyncError::io(&root, e))?;
        let local_root = local_root_id(&root)?;
        db.ensure_root(&local_root, &config.remote.root_id)?;
        let db: Arc<dyn SyncDbStore> = db;

        let case_rule = match config.sync.case_sensitive {
            Some(true) => NameCaseRule::Sensitive,
            Some(false) => NameCaseRule::Insensitive,
            None => NameCaseRule::for_local_platform(),
        };
        let local_snapshot = SharedSnapshot::new(Snapshot::new(ReplicaSide::Local, local_root, case_rule));
        let remote_snapshot = SharedSnapshot::new(RemoteObserver::empty_snapshot(config.remote.root_id.clone()));

        let local = LocalObserver::new(root.clone(), local_snapshot.clone(), config.watcher.clone(), case_rule);
        let remote = RemoteObserver::new(Arc::clone(&api), Arc::clone(&db), remote_snapshot.clone(), &config.remote);

        let running = Arc::new(RwLock::new(true));
        let ctx = Arc::new(JobContext {
            local_root: root.clone(),
            remote: api,
            db: Arc::clone(&db),
            vfs: Arc::clone(&vfs),
            local_snapshot,
            remote_snapshot,
        });
        let rules = SortRules {
            local: case_rule,
            remote: NameCaseRule::Sensitive,
        };
        let executor = Executor::new(ctx, config.propagation.clone(), rules).with_running_flag(Arc::clone(&running));

        Ok(Self {
            config,
            root,
            db,
            local,
            remote,
            executor,
            vfs,
            sink: Arc::new(LogConflictSink),
            unsyncable: UnsyncableRegistry::default(),
            running,
            state: Arc::new(RwLock::new(EngineState::default())),
            watching: false,
        })
    }

    /// Report conflicts somewhere other than the log
    pub fn with_conflict_sink(mut self, sink: Arc<dyn ConflictSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn root(&self) -> &PathBuf {
        &self.root
    }

    pub fn watcher_config(&self) -> &WatcherConfig {
        &self.config.watcher
    }

    pub fn state(&self) -> EngineState {
        self.state.read().clone()
    }

    pub fn running_flag(&self) -> Arc<RwLock<bool>> {
        Arc::clone(&self.running)
    }

    pub fn stop(&self) {
        *self.running.write() = false;
    }

    pub fn local_snapshot(&self) -> &SharedSnapshot {
        self.local.snapshot()
    }

    pub fn remote_snapshot(&self) -> &SharedSnapshot {
        self.remote.snapshot()
    }

    pub fn status_service(&self) -> StatusService {
        StatusService::new(
            self.root.clone(),
            self.local.snapshot().clone(),
            Arc::clone(&self.db),
            Arc::clone(&self.vfs),
            self.unsyncable.clone(),
        )
    }

    /// Start live monitoring of the sync root
    pub fn start_watching(&mut self) -> Result<(), SyncError> {
        self.local.start()?;
        self.watching = true;
        Ok(())
    }

    /// Observe, reconcile and propagate once
    pub async fn run_cycle(&mut self) -> Result<CycleReport, SyncError> {
        let started = Instant::now();
        if let Some((info, message)) = self.local.state().fatal {
            return Err(SyncError::exit(info, message));
        }

        self.remote.refresh().await?;
        if !self.watching || !self.local.snapshot().is_valid() {
            self.local.explore()?;
        }

        let local = Arc::new(self.local.snapshot().frozen());
        let remote = Arc::new(self.remote.snapshot().frozen());
        if !local.is_valid() || !remote.is_valid() {
            return Err(SnapshotError::Invalidated.into());
        }

        let index = DbIndex::load(self.db.as_ref())?;
        let probe = LocalContentProbe::new(self.root.clone());
        let outcome = Reconciler::new(&local, &remote, &index, &self.config.reconciliation, self.sink.as_ref())
            .with_content_probe(&probe)
            .reconcile()?;
        self.unsyncable.replace(&outcome.unsyncable);

        let operations = summarize(&outcome.operations);
        let propagation = if outcome.operations.is_empty() {
            PropagationReport::default()
        } else {
            let snapshots = CycleSnapshots {
                local: Arc::clone(&local),
                remote: Arc::clone(&remote),
            };
            self.executor.propagate(outcome.operations, snapshots).await?
        };
        self.db.flush()?;

        let report = CycleReport {
            operations,
            conflicts: outcome.conflicts,
            unsyncable: outcome.unsyncable.len(),
            completed: propagation.completed,
            failed: propagation.failed.len(),
            skipped: propagation.skipped.len(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        {
            let mut state = self.state.write();
            state.cycles += 1;
            state.last_cycle = Some(report.clone());
            state.last_error = None;
            state.failures = propagation.failed;
        }
        info!(
            operations = report.total_operations(),
            conflicts = report.conflicts.len(),
            completed = report.completed,
            failed = report.failed,
            elapsed_ms = report.elapsed_ms,
            "Cycle complete"
        );
        Ok(report)
    }

    /// Cycle until stopped or a fatal error
    pub async fn run(&mut self) -> Result<(), SyncError> {
        *self.running.write() = true;
        let tick = Duration::from_secs(self.config.sync.tick_interval_secs.max(1));
        while *self.running.read() {
            match self.run_cycle().await {
                Ok(_) => {}
                Err(e) => {
                    let info = e.exit_info();
                    self.state.write().last_error = Some((info, e.to_string()));
                    if is_fatal(&info) {
                        error!(exit = %info, error = %e, "Stopping synchronization");
                        self.stop();
                        self.local.stop();
                        return Err(e);
                    }
                    warn!(exit = %info, error = %e, "Cycle aborted, retrying next tick");
                    if matches!(e, SyncError::DependencyCycle(_) | SyncError::Snapshot(_)) {
                        self.local.snapshot().invalidate();
                        self.remote.snapshot().invalidate();
                        self.executor.clear_attempts();
                    }
                }
            }
            self.wait_for_activity(tick).await;
        }
        self.local.stop();
        info!("Synchronization stopped");
        Ok(())
    }

    /// Sleep until the tick elapses, the remote reports changes or the local
    /// snapshot moves on
    async fn wait_for_activity(&self, tick: Duration) {
        let revision = self.local.snapshot().read().revision();
        let local_changed = async {
            loop {
                tokio::time::sleep(Duration::from_millis(500)).await;
                if self.local.snapshot().read().revision() != revision || !*self.running.read() {
                    break;
                }
            }
        };
        let remote_changed = async {
            match self.remote.wait_for_changes().await {
                Ok(true) => {}
                Ok(false) => std::future::pending::<()>().await,
                Err(e) => {
                    debug!(error = %e, "Long poll failed");
                    std::future::pending::<()>().await
                }
            }
        };
        tokio::select! {
            _ = tokio::time::sleep(tick) => {}
            _ = local_changed => debug!("Local changes pending"),
            _ = remote_changed => debug!("Remote changes pending"),
        }
    }
}
