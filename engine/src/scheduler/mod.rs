//! Multi-project scheduler
//!
//! Drives pipeline runs of many projects from one process. The unit of work
//! is a single step: a project gets at most one step in flight, and as soon
//! as that step returns its run goes to the back of the queue. A slow step in
//! one project never holds back another project's steps.

use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use sdk::errors::EngineResult;
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::conductor::{PipelineRequest, PipelineStatus, RunStatus};
use crate::config::SchedulerConfig;
use crate::registry::ProjectRegistry;
use crate::tasks::TaskKind;

/// One queued pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct WorkItem {
    pub project: String,
    pub run_id: String,
}

/// Totals for one scheduler session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerReport {
    pub steps: usize,
    pub completed: usize,
    pub failed: usize,
    pub stopped: usize,
}

/// What a spawned step hands back
struct StepOutcome {
    item: WorkItem,
    result: Result<EngineResult<PipelineStatus>, String>,
}

pub struct MultiProjectScheduler {
    registry: Arc<ProjectRegistry>,
    settings: SchedulerConfig,
    queue: Mutex<VecDeque<WorkItem>>,
}

impl MultiProjectScheduler {
    pub fn new(registry: Arc<ProjectRegistry>) -> Self {
        let settings = registry.config().scheduler.clone();
        Self {
            registry,
            settings,
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ProjectRegistry> {
        &self.registry
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<WorkItem>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue an existing run. Queuing the same run twice is a no-op.
    pub fn submit(&self, project: &str, run_id: &str) {
        let item = WorkItem {
            project: project.to_string(),
            run_id: run_id.to_string(),
        };
        let mut queue = self.queue();
        if !queue.contains(&item) {
            debug!(project, run_id, "Run queued");
            queue.push_back(item);
        }
    }

    /// Start a pipeline on `project` and queue it.
    pub fn start(&self, project: &str, request: PipelineRequest) -> EngineResult<PipelineStatus> {
        let status = self.registry.producer(project)?.start(request)?;
        self.submit(project, &status.run_id);
        Ok(status)
    }

    pub fn queued(&self) -> Vec<WorkItem> {
        self.queue().iter().cloned().collect()
    }

    /// Queue every PENDING/RUNNING pipeline task found on disk.
    ///
    /// A project that cannot be loaded is logged and skipped. Returns the
    /// number of runs queued.
    pub fn discover(&self) -> EngineResult<usize> {
        let mut queued = 0;
        for project in self.registry.known_projects()? {
            match self.discover_project(&project) {
                Ok(n) => queued += n,
                Err(e) => {
                    warn!(project = %project, error = %e, "Skipping project during discovery")
                }
            }
        }
        if queued > 0 {
            info!(runs = queued, "Discovered active pipeline runs");
        }
        Ok(queued)
    }

    fn discover_project(&self, project: &str) -> EngineResult<usize> {
        let paths = self.registry.paths(project)?;
        if !paths.tasks.exists() {
            return Ok(0);
        }
        let active = self.registry.tasks(project)?.active(TaskKind::Pipeline);
        if active.is_empty() {
            return Ok(0);
        }
        let producer = self.registry.producer(project)?;
        let mut queued = 0;
        for task in active {
            match producer.resume_task(&task) {
                Ok(status) => {
                    self.submit(project, &status.run_id);
                    queued += 1;
                }
                Err(e) => {
                    warn!(project, task_id = %task.id, error = %e, "Could not recover pipeline task")
                }
            }
        }
        Ok(queued)
    }

    /// Drive queued runs until none can make progress (all finished or
    /// paused).
    pub async fn run_until_idle(&self) -> SchedulerReport {
        self.drive(None::<futures::future::Pending<()>>).await
    }

    /// Drive queued runs until `shutdown` resolves, polling for new work
    /// every `poll_interval` while idle. Steps in flight at shutdown are
    /// allowed to finish.
    pub async fn run<F>(&self, shutdown: F) -> SchedulerReport
    where
        F: Future<Output = ()>,
    {
        self.drive(Some(shutdown)).await
    }

    async fn drive<F>(&self, shutdown: Option<F>) -> SchedulerReport
    where
        F: Future<Output = ()>,
    {
        let idle_exit = shutdown.is_none();
        let shutdown = async move {
            match shutdown {
                Some(signal) => signal.await,
                None => futures::future::pending::<()>().await,
            }
        };
        tokio::pin!(shutdown);

        let mut report = SchedulerReport::default();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut steps: JoinSet<StepOutcome> = JoinSet::new();
        let mut stopping = false;

        loop {
            if !stopping {
                self.fill(&mut in_flight, &mut steps);
            }

            if steps.is_empty() {
                if stopping || idle_exit {
                    break;
                }
                tokio::select! {
                    _ = &mut shutdown => stopping = true,
                    _ = tokio::time::sleep(self.settings.poll_interval()) => {}
                }
                continue;
            }

            tokio::select! {
                _ = &mut shutdown, if !stopping => {
                    info!(in_flight = steps.len(), "Scheduler shutting down; finishing steps in flight");
                    stopping = true;
                }
                joined = steps.join_next() => {
                    let Some(joined) = joined else { continue };
                    match joined {
                        Ok(outcome) => {
                            in_flight.remove(&outcome.item.project);
                            self.settle(outcome, &mut report).await;
                        }
                        Err(e) => error!(error = %e, "Scheduler task aborted"),
                    }
                }
            }
        }

        info!(
            steps = report.steps,
            completed = report.completed,
            failed = report.failed,
            "Scheduler idle"
        );
        report
    }

    /// Spawn the next step of each queued run whose project is not busy.
    fn fill(&self, in_flight: &mut HashSet<String>, steps: &mut JoinSet<StepOutcome>) {
        let mut queue = self.queue();
        let mut kept = VecDeque::with_capacity(queue.len());

        while let Some(item) = queue.pop_front() {
            if in_flight.contains(&item.project) || in_flight.len() >= self.settings.max_projects {
                kept.push_back(item);
                continue;
            }
            let producer = match self.registry.producer(&item.project) {
                Ok(producer) => producer,
                Err(e) => {
                    error!(project = %item.project, run_id = %item.run_id, error = %e, "Dropping run of unloadable project");
                    continue;
                }
            };
            match producer.status(&item.run_id) {
                Ok(status) if status.status == RunStatus::Paused => {
                    kept.push_back(item);
                    continue;
                }
                Ok(status) if status.status.is_terminal() => continue,
                Ok(_) => {}
                Err(e) => {
                    warn!(project = %item.project, run_id = %item.run_id, error = %e, "Dropping unknown run");
                    continue;
                }
            }

            in_flight.insert(item.project.clone());
            steps.spawn(async move {
                let result = AssertUnwindSafe(producer.step(&item.run_id))
                    .catch_unwind()
                    .await
                    .map_err(|panic| panic_message(&*panic));
                StepOutcome { item, result }
            });
        }
        *queue = kept;
    }

    async fn settle(&self, outcome: StepOutcome, report: &mut SchedulerReport) {
        let StepOutcome { item, result } = outcome;
        match result {
            Ok(Ok(status)) => {
                report.steps += 1;
                match status.status {
                    RunStatus::Completed => report.completed += 1,
                    RunStatus::Failed => {
                        report.failed += 1;
                        warn!(project = %item.project, run_id = %item.run_id, error = ?status.error, "Run failed");
                    }
                    RunStatus::Stopped => report.stopped += 1,
                    RunStatus::Pending | RunStatus::Running | RunStatus::Paused => {
                        self.queue().push_back(item)
                    }
                }
            }
            Ok(Err(e)) => {
                report.failed += 1;
                error!(project = %item.project, run_id = %item.run_id, error = %e, "Run could not be driven");
                self.abandon(&item, &e.to_string()).await;
            }
            Err(panic) => {
                report.failed += 1;
                error!(project = %item.project, run_id = %item.run_id, panic = %panic, "Step panicked");
                self.abandon(&item, &format!("step panicked: {}", panic)).await;
            }
        }
    }

    /// Mark a run and its task FAILED so it is not recovered after a restart.
    async fn abandon(&self, item: &WorkItem, reason: &str) {
        let failed = match self.registry.producer(&item.project) {
            Ok(producer) => producer.fail_run(&item.run_id, reason).await,
            Err(e) => Err(e),
        };
        if let Err(e) = failed {
            warn!(project = %item.project, run_id = %item.run_id, error = %e, "Could not mark run failed");
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::Scripted;
    use crate::conductor::StoryIdea;
    use crate::config::Config;
    use crate::llm::{self, Embedder};
    use crate::registry::ModelProvider;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct Flat;

    #[async_trait]
    impl Embedder for Flat {
        async fn embed(&self, _text: &str) -> llm::Result<Vec<f32>> {
            Ok(vec![1.0])
        }
    }

    fn scheduler(dir: &TempDir) -> MultiProjectScheduler {
        let config = Config::with_data_dir(dir.path()).unwrap();
        let registry = ProjectRegistry::new(
            config,
            ModelProvider::new(Scripted::new("text"), Arc::new(Flat)),
        );
        MultiProjectScheduler::new(Arc::new(registry))
    }

    #[tokio::test]
    async fn test_idle_scheduler_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let report = scheduler(&dir).run_until_idle().await;
        assert_eq!(report, SchedulerReport::default());
    }

    #[test]
    fn test_submit_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        scheduler.submit("skyhold", "r1");
        scheduler.submit("skyhold", "r1");
        scheduler.submit("tidewater", "r1");
        assert_eq!(scheduler.queued().len(), 2);
    }

    #[tokio::test]
    async fn test_paused_runs_stay_queued() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        let status = scheduler
            .start("skyhold", PipelineRequest::StoryBible(StoryIdea::new("Skyhold")))
            .unwrap();
        let producer = scheduler.registry().producer("skyhold").unwrap();
        producer.pause(&status.run_id).unwrap();

        let report = scheduler.run_until_idle().await;
        assert_eq!(report.steps, 0);
        assert_eq!(scheduler.queued().len(), 1);

        producer.resume(&status.run_id).unwrap();
        let report = scheduler.run_until_idle().await;
        assert_eq!(report.completed, 1);
        assert_eq!(report.steps, 3);
        assert!(scheduler.queued().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_polling() {
        let dir = TempDir::new().unwrap();
        let scheduler = scheduler(&dir);
        let report = scheduler
            .run(tokio::time::sleep(std::time::Duration::from_millis(20)))
            .await;
        assert_eq!(report.steps, 0);
    }
}
