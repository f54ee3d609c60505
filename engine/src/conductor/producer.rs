//! Producer: drives pipeline runs for one project
//!
//! A run advances one step (one agent invocation) per call to
//! [`Producer::step`]. Pause and stop requests are honoured only at step
//! boundaries: if a step is in flight the request is recorded and applied
//! when the step returns.
//!
//! Audit records written here:
//!
//! - `pipeline_started` / `pipeline_completed` / `pipeline_stopped`
//! - `step_completed` after every successful step
//! - `task_failed` when a step (or a critique analysis task) fails
//! - `user_feedback` for every injected piece of feedback
//! - `canon_rules_added` when critique analysis yields new rules
//!
//! The knowledge graph gains a `character` entity per character bible entry
//! and a timeline event per finished chapter.
//!
//! Agent handoffs (`agent_message_*`) are written by the agents themselves.
//!
//! Finished runs stay queryable until more than [`RETAINED_FINISHED_RUNS`]
//! have piled up; the oldest are then forgotten. Their results, tasks and
//! audit records are already on disk.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use sdk::errors::{EngineError, EngineResult};
use sdk::types::{FeedbackPriority, Recipient};
use serde_json::json;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use super::canon::derive_rules;
use super::lore::{self, APPEARS_IN, CHARACTER};
use super::pipeline::{plan_chapters, PipelineKind, PipelineRequest};
use super::run::{
    chapter_steps, revision_checks, Artifacts, ChapterResult, PipelineRun, PipelineStatus,
    PlannedStep, RunStatus, StepRecord,
};
use crate::agents::{
    create_agent, report_passed, truncate_chars, AgentContext, AgentInput, AgentKind,
    AgentOutput, FeedbackLedger, Revision, PRODUCER,
};
use crate::audit::{AuditEntry, AuditLog};
use crate::config::PipelineConfig;
use crate::event_bus::{kinds, Event, EventBus};
use crate::graph::{CanonRule, GraphStore};
use crate::llm::ModelEndpoint;
use crate::memory::MemoryStore;
use crate::outputs::OutputManager;
use crate::state::{OutputSlot, StateHandle};
use crate::tasks::{Task, TaskKind, TaskStatus, TaskStore};

/// Bus address for pipeline status updates
pub const STATUS_WATCHER: &str = "ui";

/// Sender name for injected feedback
const USER: &str = "user";

/// Finished runs kept in memory per producer
pub const RETAINED_FINISHED_RUNS: usize = 32;

/// Shared per-project resources a producer works with
#[derive(Clone)]
pub struct ProjectHandles {
    pub bus: Arc<EventBus>,
    pub audit: Arc<AuditLog>,
    pub state: Arc<StateHandle>,
    pub graph: Arc<GraphStore>,
    pub tasks: Arc<TaskStore>,
    pub outputs: Arc<OutputManager>,
    pub memory: Arc<dyn MemoryStore>,
}

#[derive(Debug, Default)]
struct Requests {
    pause: bool,
    stop: bool,
}

struct RunSlot {
    /// Locked for the whole of a step
    run: AsyncMutex<PipelineRun>,
    /// Last published status; readable while a step is in flight
    status: Mutex<PipelineStatus>,
    requests: Mutex<Requests>,
    created_at: DateTime<Utc>,
    /// Insertion order within the producer
    admitted: u64,
}

impl RunSlot {
    fn new(run: PipelineRun, admitted: u64) -> Self {
        Self {
            created_at: run.created_at,
            admitted,
            status: Mutex::new(run.status()),
            run: AsyncMutex::new(run),
            requests: Mutex::new(Requests::default()),
        }
    }

    fn requests(&self) -> MutexGuard<'_, Requests> {
        self.requests.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self) -> PipelineStatus {
        self.status
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn publish_status(&self, run: &PipelineRun) -> PipelineStatus {
        let status = run.status();
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status.clone();
        status
    }
}

pub struct Producer {
    project: String,
    handles: ProjectHandles,
    model: ModelEndpoint,
    settings: PipelineConfig,
    runs: Mutex<HashMap<String, Arc<RunSlot>>>,
    admitted: AtomicU64,
    /// Highest bus seq already scanned for critiques
    critique_mark: Mutex<Option<u64>>,
    delivered: Arc<FeedbackLedger>,
}

impl Producer {
    pub fn new(
        project: impl Into<String>,
        handles: ProjectHandles,
        model: ModelEndpoint,
        settings: PipelineConfig,
    ) -> Self {
        Self {
            project: project.into(),
            handles,
            model,
            settings,
            runs: Mutex::new(HashMap::new()),
            admitted: AtomicU64::new(0),
            critique_mark: Mutex::new(None),
            delivered: Arc::new(FeedbackLedger::default()),
        }
    }

    pub fn project(&self) -> &str {
        &self.project
    }

    fn agent_context(&self) -> AgentContext {
        AgentContext {
            project: self.project.clone(),
            bus: Arc::clone(&self.handles.bus),
            audit: Arc::clone(&self.handles.audit),
            model: self.model.clone(),
            memory: self
                .settings
                .auto_memory
                .then(|| Arc::clone(&self.handles.memory)),
            feedback_window: self.settings.feedback_window,
            delivered: Arc::clone(&self.delivered),
        }
    }

    fn runs(&self) -> MutexGuard<'_, HashMap<String, Arc<RunSlot>>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, run_id: &str) -> EngineResult<Arc<RunSlot>> {
        self.runs()
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    // ----- lifecycle -----

    /// Validate the request, record a pipeline task and start a run.
    ///
    /// Nothing executes until [`step`](Self::step) is called. The returned
    /// status is RUNNING.
    pub fn start(&self, request: PipelineRequest) -> EngineResult<PipelineStatus> {
        request.validate(self.settings.max_chapters)?;

        let task = self
            .handles
            .tasks
            .create(TaskKind::Pipeline, serde_json::to_value(&request)?)?;
        let mut run = PipelineRun::new(&task.id, self.project.clone(), request);
        self.begin(&mut run, TaskStatus::Pending)?;

        info!(project = %self.project, run_id = %run.id, pipeline = %run.kind(), "Pipeline started");
        Ok(self.insert(run))
    }

    /// Re-create a run for a persisted pipeline task (after a restart).
    ///
    /// The run starts from its first step.
    pub fn resume_task(&self, task: &Task) -> EngineResult<PipelineStatus> {
        if let Ok(slot) = self.slot(&task.id) {
            return Ok(slot.status());
        }
        let request: PipelineRequest = match serde_json::from_value(task.payload.clone()) {
            Ok(request) => request,
            Err(e) => {
                let err = EngineError::from(e);
                self.handles.tasks.mark_failed(&task.id, err.to_string())?;
                return Err(err);
            }
        };
        let run = PipelineRun::new(&task.id, self.project.clone(), request);
        info!(project = %self.project, run_id = %run.id, pipeline = %run.kind(), "Pipeline task recovered");
        Ok(self.insert(run))
    }

    fn insert(&self, run: PipelineRun) -> PipelineStatus {
        let id = run.id.clone();
        let admitted = self.admitted.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(RunSlot::new(run, admitted));
        let status = slot.status();
        let mut runs = self.runs();
        runs.insert(id, slot);
        let evicted = prune_finished(&mut runs, RETAINED_FINISHED_RUNS);
        if evicted > 0 {
            debug!(project = %self.project, evicted, "Finished runs forgotten");
        }
        status
    }

    /// PENDING → RUNNING, marking the backing task running too.
    fn begin(&self, run: &mut PipelineRun, task_status: TaskStatus) -> EngineResult<()> {
        run.transition(RunStatus::Running)?;
        if task_status == TaskStatus::Pending {
            self.handles.tasks.mark_running(&run.id)?;
        }
        self.handles.audit.append(
            "pipeline_started",
            PRODUCER,
            Recipient::Broadcast,
            json!({
                "run_id": run.id,
                "pipeline": run.kind(),
                "request": run.request,
            }),
        )?;
        Ok(())
    }

    /// Request a pause. Takes effect now if no step is in flight, otherwise
    /// when the current step finishes.
    pub fn pause(&self, run_id: &str) -> EngineResult<PipelineStatus> {
        let slot = self.slot(run_id)?;
        ensure_open(&slot.status())?;
        slot.requests().pause = true;
        self.apply_if_idle(&slot)
    }

    pub fn resume(&self, run_id: &str) -> EngineResult<PipelineStatus> {
        let slot = self.slot(run_id)?;
        ensure_open(&slot.status())?;
        slot.requests().pause = false;
        if let Ok(mut run) = slot.run.try_lock() {
            if run.status == RunStatus::Paused {
                run.transition(RunStatus::Running)?;
                info!(project = %self.project, run_id, "Pipeline resumed");
                return Ok(self.announce(&slot, &run));
            }
        }
        Ok(slot.status())
    }

    /// Request a stop at the next step boundary. Results produced so far are
    /// kept.
    pub fn stop(&self, run_id: &str) -> EngineResult<PipelineStatus> {
        let slot = self.slot(run_id)?;
        slot.requests().stop = true;
        self.apply_if_idle(&slot)
    }

    fn apply_if_idle(&self, slot: &RunSlot) -> EngineResult<PipelineStatus> {
        match slot.run.try_lock() {
            Ok(mut run) => {
                self.apply_requests(slot, &mut run)?;
                Ok(self.announce(slot, &run))
            }
            Err(_) => Ok(slot.status()),
        }
    }

    /// Honour pending pause/stop requests. Only called between steps.
    fn apply_requests(&self, slot: &RunSlot, run: &mut PipelineRun) -> EngineResult<()> {
        if run.status.is_terminal() {
            return Ok(());
        }
        let (pause, stop) = {
            let requests = slot.requests();
            (requests.pause, requests.stop)
        };

        if stop {
            run.transition(RunStatus::Stopped)?;
            if let Err(e) = self.handles.tasks.mark_failed(&run.id, "stopped") {
                warn!(project = %self.project, run_id = %run.id, error = %e, "Could not close stopped task");
            }
            self.handles.audit.append(
                "pipeline_stopped",
                PRODUCER,
                Recipient::Broadcast,
                json!({
                    "run_id": run.id,
                    "pipeline": run.kind(),
                    "completed_steps": run.cursor,
                }),
            )?;
            info!(project = %self.project, run_id = %run.id, step = run.cursor, "Pipeline stopped");
        } else if pause && run.status == RunStatus::Running {
            run.transition(RunStatus::Paused)?;
            info!(project = %self.project, run_id = %run.id, step = run.cursor, "Pipeline paused");
        }
        Ok(())
    }

    /// Update the status snapshot and tell watchers.
    fn announce(&self, slot: &RunSlot, run: &PipelineRun) -> PipelineStatus {
        let status = slot.publish_status(run);
        self.handles.bus.publish(
            PRODUCER,
            Recipient::agent(STATUS_WATCHER),
            kinds::PIPELINE_STATUS,
            serde_json::to_value(&status).unwrap_or_default(),
        );
        status
    }

    // ----- execution -----

    /// Execute the next step of a run.
    ///
    /// Step failures do not surface as `Err`: they are audited as
    /// `task_failed` and leave the run FAILED. `Err` means the run could not
    /// be driven at all (unknown id, storage failure at a boundary).
    pub async fn step(&self, run_id: &str) -> EngineResult<PipelineStatus> {
        let slot = self.slot(run_id)?;
        let mut run = slot.run.lock().await;

        self.apply_requests(&slot, &mut run)?;
        match run.status {
            RunStatus::Pending => {
                let task_status = self
                    .handles
                    .tasks
                    .get(&run.id)
                    .map_or(TaskStatus::Running, |t| t.status);
                self.begin(&mut run, task_status)?;
                self.apply_requests(&slot, &mut run)?;
                if run.status != RunStatus::Running {
                    return Ok(self.announce(&slot, &run));
                }
            }
            RunStatus::Running => {}
            _ => return Ok(slot.publish_status(&run)),
        }

        let Some(planned) = run.next_step().cloned() else {
            if let Err(e) = self.complete(&mut run) {
                self.fail(&mut run, None, &e);
            }
            return Ok(self.announce(&slot, &run));
        };
        slot.publish_status(&run);

        let index = run.cursor + 1;
        let started = Instant::now();
        let started_at = Utc::now();
        debug!(project = %self.project, run_id, step = index, agent = %planned.agent, "Step starting");

        match self.execute(&mut run, &planned).await {
            Ok(output) => {
                let feedback = output.feedback.clone();
                run.steps.push(StepRecord {
                    index,
                    agent: planned.agent,
                    started_at,
                    finished_at: Utc::now(),
                    input_context: output.input_context,
                    feedback,
                    output: Some(output.text),
                    error: None,
                });
                run.cursor += 1;
                debug!(
                    project = %self.project,
                    run_id,
                    step = index,
                    agent = %planned.agent,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Step finished"
                );
                if run.cursor >= run.plan.len() {
                    if let Err(e) = self.complete(&mut run) {
                        self.fail(&mut run, Some(&planned), &e);
                    }
                }
            }
            Err(e) => {
                run.steps.push(StepRecord {
                    index,
                    agent: planned.agent,
                    started_at,
                    finished_at: Utc::now(),
                    input_context: String::new(),
                    feedback: Vec::new(),
                    output: None,
                    error: Some(e.to_string()),
                });
                self.fail(&mut run, Some(&planned), &e);
            }
        }

        self.apply_requests(&slot, &mut run)?;
        Ok(self.announce(&slot, &run))
    }

    /// Step until the run completes, fails, stops or pauses.
    pub async fn run_to_completion(&self, run_id: &str) -> EngineResult<PipelineStatus> {
        loop {
            let status = self.step(run_id).await?;
            if !matches!(status.status, RunStatus::Running | RunStatus::Pending) {
                return Ok(status);
            }
        }
    }

    /// Fail a run whose step could not be driven to an outcome (a storage
    /// error at a boundary or a panic). Terminal runs are left as they are.
    pub async fn fail_run(&self, run_id: &str, reason: &str) -> EngineResult<PipelineStatus> {
        let slot = self.slot(run_id)?;
        let mut run = slot.run.lock().await;
        if run.status.is_terminal() {
            return Ok(slot.publish_status(&run));
        }
        let planned = run.next_step().cloned();
        let err = EngineError::PipelineStep {
            step_index: run.cursor + 1,
            agent: planned
                .as_ref()
                .map_or(PRODUCER, |p| p.agent.name())
                .to_string(),
            message: reason.to_string(),
        };
        self.fail(&mut run, planned.as_ref(), &err);
        Ok(self.announce(&slot, &run))
    }

    async fn execute(
        &self,
        run: &mut PipelineRun,
        planned: &PlannedStep,
    ) -> EngineResult<AgentOutput> {
        let input = self.build_input(run, planned)?;
        let agent = create_agent(planned.agent, self.agent_context());
        let output = agent.run(input).await?;

        self.absorb(run, planned, &output).await?;

        let recipient = match run.following_step() {
            Some(next) => Recipient::agent(next.agent.name()),
            None => Recipient::agent(PRODUCER),
        };
        agent.send(
            recipient,
            kinds::HANDOFF,
            json!({
                "run_id": run.id,
                "pipeline": run.kind(),
                "step_index": run.cursor + 1,
                "chapter": planned.chapter,
                "text": output.text,
            }),
        )?;

        let feedback: Vec<&str> = output.feedback.iter().map(|f| f.message.as_str()).collect();
        self.handles.audit.append(
            "step_completed",
            PRODUCER,
            Recipient::Broadcast,
            json!({
                "run_id": run.id,
                "pipeline": run.kind(),
                "step_index": run.cursor + 1,
                "agent": planned.agent,
                "chapter": planned.chapter,
                "pass": planned.pass,
                "feedback": feedback,
                "output_chars": output.text.chars().count(),
            }),
        )?;
        Ok(output)
    }

    fn build_input(&self, run: &PipelineRun, planned: &PlannedStep) -> EngineResult<AgentInput> {
        let state = self.handles.state.snapshot();
        let art = &run.artifacts;
        let canon: Vec<String> = self
            .handles
            .graph
            .canon_rules()
            .into_iter()
            .map(|r| r.rule)
            .collect();
        let world = art
            .world
            .clone()
            .unwrap_or_else(|| state.agent_outputs.world.clone());
        let characters = art
            .characters
            .clone()
            .unwrap_or_else(|| state.agent_outputs.characters.clone());
        let current = art.current.clone().unwrap_or_default();

        let input = match (planned.agent, run.request.idea()) {
            (AgentKind::PlotArchitect, Some(idea)) => {
                let meta = idea.resolve(&state.metadata);
                AgentInput::Plot {
                    idea: idea.idea.clone(),
                    genre: meta.genre,
                    tone: meta.tone,
                    themes: meta.themes,
                    setting: meta.setting,
                }
            }
            (AgentKind::Worldbuilder, Some(idea)) => {
                let meta = idea.resolve(&state.metadata);
                AgentInput::World {
                    outline: art.outline.clone().unwrap_or_default(),
                    genre: meta.genre,
                    tone: meta.tone,
                    themes: meta.themes,
                    setting: meta.setting,
                }
            }
            (AgentKind::CharacterAgent, _) => AgentInput::Characters {
                outline: art.outline.clone().unwrap_or_default(),
                world,
            },
            (AgentKind::SceneGenerator, _) => {
                let (goal, excerpt) = scene_brief(run, planned);
                let revise = planned.pass.map(|_| {
                    let source = revision_source(art, planned).cloned().unwrap_or_default();
                    Revision {
                        draft: source.final_text,
                        critique: source.continuity,
                    }
                });
                AgentInput::Scene {
                    goal,
                    outline_excerpt: excerpt,
                    world,
                    characters,
                    canon,
                    revise,
                }
            }
            (AgentKind::ContinuityAgent, _) => {
                let (_, excerpt) = scene_brief(run, planned);
                let scene = match planned.pass {
                    Some(_) => revision_source(art, planned)
                        .map(|c| c.final_text.clone())
                        .unwrap_or_default(),
                    None => current.raw,
                };
                AgentInput::Continuity {
                    scene,
                    context: continuity_context(&excerpt, &canon),
                }
            }
            (AgentKind::EditorAgent, _) => AgentInput::Edit {
                notes: if report_passed(&current.continuity) {
                    String::new()
                } else {
                    current.continuity.clone()
                },
                scene: current.raw,
            },
            (agent, None) => {
                return Err(EngineError::PipelineStep {
                    step_index: run.cursor + 1,
                    agent: agent.name().to_string(),
                    message: format!("agent not used by the {} pipeline", run.kind()),
                })
            }
        };
        Ok(input)
    }

    /// Fold a step's output into the run and persist what it produced.
    async fn absorb(
        &self,
        run: &mut PipelineRun,
        planned: &PlannedStep,
        output: &AgentOutput,
    ) -> EngineResult<()> {
        let text = output.text.clone();
        match planned.agent {
            AgentKind::PlotArchitect => {
                self.handles.state.set_agent_output(OutputSlot::Outline, &text)?;
                run.artifacts.outline = Some(text);
            }
            AgentKind::Worldbuilder => {
                self.handles.state.set_agent_output(OutputSlot::World, &text)?;
                run.artifacts.world = Some(text);
            }
            AgentKind::CharacterAgent => {
                self.handles
                    .state
                    .set_agent_output(OutputSlot::Characters, &text)?;
                self.record_characters(&text)?;
                run.artifacts.characters = Some(text);
                if let Some((_, requested)) = run.request.story() {
                    let max = requested
                        .unwrap_or(self.settings.max_chapters)
                        .min(self.settings.max_chapters);
                    let plan = plan_chapters(run.artifacts.outline.as_deref().unwrap_or(""), max);
                    info!(project = %self.project, run_id = %run.id, chapters = plan.len(), "Chapters planned");
                    run.plan.extend(chapter_steps(&plan));
                    run.artifacts.chapter_plan = plan;
                }
            }
            AgentKind::SceneGenerator => {
                let index = match planned.chapter {
                    Some(index) => index,
                    None => self.next_chapter_index()?,
                };
                let title = run
                    .artifacts
                    .chapter_plan
                    .iter()
                    .find(|c| c.index == index)
                    .map(|c| c.title.clone())
                    .unwrap_or_else(|| format!("Chapter {}", index));
                // A revision carries the critique it answers on to the editor
                let continuity = match planned.pass {
                    Some(_) => {
                        run.artifacts.revisions += 1;
                        revision_source(&run.artifacts, planned)
                            .map(|c| c.continuity.clone())
                            .unwrap_or_default()
                    }
                    None => String::new(),
                };
                run.artifacts.current = Some(ChapterResult {
                    index,
                    title,
                    raw: text,
                    continuity,
                    ..ChapterResult::default()
                });
            }
            AgentKind::ContinuityAgent => {
                // The agent has just sent its critique; turn it into canon now
                self.ingest_critiques()?;
                let added = self.process_pending_tasks().await?;

                match (planned.pass, planned.chapter) {
                    (Some(pass), Some(index)) => {
                        let art = &mut run.artifacts;
                        art.canon_added += added.len();
                        if let Some(chapter) = art.chapters.iter_mut().find(|c| c.index == index) {
                            chapter.continuity = text.clone();
                        }
                        let passed = report_passed(&text);
                        let revise = !passed && !added.is_empty();
                        if revise {
                            art.pass_revised = true;
                            let at = run.cursor + 1;
                            run.plan.splice(
                                at..at,
                                [
                                    PlannedStep::revision(AgentKind::SceneGenerator, index, pass),
                                    PlannedStep::revision(AgentKind::EditorAgent, index, pass),
                                ],
                            );
                        }
                        debug!(
                            project = %self.project,
                            run_id = %run.id,
                            pass,
                            chapter = index,
                            rules_added = added.len(),
                            passed,
                            revise,
                            "Chapter critiqued"
                        );
                    }
                    _ => {
                        let current = run.artifacts.current.get_or_insert_with(ChapterResult::default);
                        current.continuity = text;
                    }
                }
            }
            AgentKind::EditorAgent => {
                let mut chapter = run.artifacts.current.take().unwrap_or_default();
                chapter.final_text = text;
                if run.kind() != PipelineKind::StoryBible {
                    self.handles
                        .outputs
                        .save_chapter(chapter.index, serde_json::to_value(&chapter)?)?;
                    self.record_chapter(&chapter)?;
                }
                let revised = planned.pass.and_then(|_| {
                    run.artifacts
                        .chapters
                        .iter()
                        .position(|c| c.index == chapter.index)
                });
                match revised {
                    Some(position) => run.artifacts.chapters[position] = chapter,
                    None => run.artifacts.chapters.push(chapter),
                }
                let draft = match run.kind() {
                    PipelineKind::FullStory => Some("full_story"),
                    PipelineKind::DirectorMode => Some("director_mode"),
                    _ => None,
                };
                if let Some(name) = draft {
                    self.handles
                        .outputs
                        .save_draft(name, &full_text(&run.artifacts.chapters))?;
                }
            }
        }

        if run.kind() == PipelineKind::DirectorMode && run.is_last_step() {
            self.close_director_pass(run);
        }
        Ok(())
    }

    fn record_characters(&self, bible: &str) -> EngineResult<()> {
        let characters = lore::character_entities(bible);
        let count = characters.len();
        for character in characters {
            self.handles.graph.add_entity(character)?;
        }
        debug!(project = %self.project, characters = count, "Characters added to graph");
        Ok(())
    }

    /// Timeline event for the chapter, linked to the characters it names.
    fn record_chapter(&self, chapter: &ChapterResult) -> EngineResult<()> {
        let characters = self.handles.graph.entities_of_type(CHARACTER);
        let event = lore::chapter_event(chapter, &characters);
        for character in &event.involved_entities {
            self.handles
                .graph
                .add_relationship(character, &event.id, APPEARS_IN, &chapter.title)?;
        }
        self.handles.graph.add_event(event)
    }

    /// Director mode: at the end of the plan, open the next revision pass
    /// over every chapter, or settle on whether a fixed point was reached.
    fn close_director_pass(&self, run: &mut PipelineRun) {
        let limit = self.settings.max_revision_passes;
        let max_passes = match &run.request {
            PipelineRequest::DirectorMode(input) => input.max_passes.unwrap_or(limit).min(limit),
            _ => return,
        };
        let art = &mut run.artifacts;
        if art.passes > 0 {
            art.fixed_point = !art.pass_revised;
            if art.fixed_point {
                return;
            }
        }
        if art.passes >= max_passes || art.chapter_plan.is_empty() {
            return;
        }
        art.passes += 1;
        art.pass_revised = false;
        run.plan.extend(revision_checks(&art.chapter_plan, art.passes));
        info!(project = %self.project, run_id = %run.id, pass = art.passes, "Revision pass started");
    }

    fn next_chapter_index(&self) -> EngineResult<usize> {
        let saved = self.handles.outputs.list_chapters()?;
        Ok(saved.last().map_or(1, |last| last + 1))
    }

    /// Record the result and close the run. Only reached after the last step.
    fn complete(&self, run: &mut PipelineRun) -> EngineResult<()> {
        let result = self.result_of(run);
        self.handles
            .state
            .add_pipeline_result(run.kind().as_str(), result)?;
        self.handles.tasks.mark_done(&run.id)?;
        run.transition(RunStatus::Completed)?;
        self.handles.audit.append(
            "pipeline_completed",
            PRODUCER,
            Recipient::Broadcast,
            json!({
                "run_id": run.id,
                "pipeline": run.kind(),
                "steps": run.steps.len(),
            }),
        )?;
        info!(project = %self.project, run_id = %run.id, pipeline = %run.kind(), steps = run.steps.len(), "Pipeline completed");
        Ok(())
    }

    fn result_of(&self, run: &PipelineRun) -> serde_json::Value {
        let art = &run.artifacts;
        match run.kind() {
            PipelineKind::StoryBible => json!({
                "outline": art.outline,
                "world": art.world,
                "characters": art.characters,
            }),
            PipelineKind::Chapter => json!({
                "chapter": art.chapters.last(),
            }),
            PipelineKind::FullStory => json!({
                "outline": art.outline,
                "world": art.world,
                "characters": art.characters,
                "plan": art.chapter_plan,
                "chapters": art.chapters,
                "full_story": full_text(&art.chapters),
            }),
            PipelineKind::DirectorMode => json!({
                "outline": art.outline,
                "world": art.world,
                "characters": art.characters,
                "plan": art.chapter_plan,
                "chapters": art.chapters,
                "full_story": full_text(&art.chapters),
                "passes": art.passes,
                "revisions": art.revisions,
                "canon_rules_added": art.canon_added,
                "fixed_point": art.fixed_point,
            }),
        }
    }

    /// Mark the run FAILED and audit `task_failed`. Partial results stay.
    fn fail(&self, run: &mut PipelineRun, planned: Option<&PlannedStep>, err: &EngineError) {
        let step_index = run.cursor + 1;
        let agent = planned.map(|p| p.agent.name()).unwrap_or(PRODUCER);
        run.error = Some(format!("step {} ({}): {}", step_index, agent, err));

        if let Err(e) = self.handles.audit.append(
            "task_failed",
            PRODUCER,
            Recipient::Broadcast,
            json!({
                "run_id": run.id,
                "pipeline": run.kind(),
                "step_index": step_index,
                "agent": agent,
                "error": err.to_string(),
                "error_type": err.kind(),
            }),
        ) {
            error!(project = %self.project, run_id = %run.id, error = %e, "Could not audit step failure");
        }
        if let Err(e) = self.handles.tasks.mark_failed(&run.id, err.to_string()) {
            warn!(project = %self.project, run_id = %run.id, error = %e, "Could not mark task failed");
        }
        if let Err(e) = run.transition(RunStatus::Failed) {
            warn!(project = %self.project, run_id = %run.id, error = %e, "Unexpected run state on failure");
        }
        error!(project = %self.project, run_id = %run.id, step = step_index, agent, error = %err, "Pipeline step failed");
    }

    // ----- feedback and critiques -----

    /// Deliver feedback to `target` through the bus. Accepted in any run
    /// state; the target sees it the next time it runs.
    pub fn inject(
        &self,
        target: &str,
        message: &str,
        priority: FeedbackPriority,
    ) -> EngineResult<Event> {
        let target: AgentKind = target.parse()?;
        if message.trim().is_empty() {
            return Err(EngineError::Validation("feedback must not be empty".into()));
        }
        let payload = json!({ "message": message, "priority": priority });
        self.handles.audit.append(
            "user_feedback",
            USER,
            Recipient::agent(target.name()),
            payload.clone(),
        )?;
        let event = self.handles.bus.publish(
            USER,
            Recipient::agent(target.name()),
            kinds::FEEDBACK,
            payload,
        );
        info!(project = %self.project, agent = %target, priority = %priority, "Feedback injected");
        Ok(event)
    }

    /// Turn critiques addressed to the producer that have not been seen yet
    /// into critique-analysis tasks. Returns how many were created.
    pub fn ingest_critiques(&self) -> EngineResult<usize> {
        let mut mark = self
            .critique_mark
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let mut created = 0;
        for event in self.handles.bus.events_after(*mark) {
            if event.event_type == kinds::CRITIQUE && event.recipient.reaches(PRODUCER) {
                if let Some(critique) = event.payload_str("critique").filter(|c| !c.trim().is_empty()) {
                    self.handles.tasks.create(
                        TaskKind::CritiqueAnalysis,
                        json!({
                            "critique": critique,
                            "source_event": event.id,
                            "sender": event.sender,
                        }),
                    )?;
                    created += 1;
                }
            }
            *mark = Some(event.seq);
        }
        Ok(created)
    }

    /// Derive canon rules from every active critique-analysis task.
    ///
    /// Returns the rules that were actually added (duplicates are skipped).
    pub async fn process_pending_tasks(&self) -> EngineResult<Vec<CanonRule>> {
        let mut added = Vec::new();
        for task in self.handles.tasks.active(TaskKind::CritiqueAnalysis) {
            if task.status == TaskStatus::Pending {
                self.handles.tasks.mark_running(&task.id)?;
            }
            match self.analyse_critique(&task).await {
                Ok(rules) => {
                    self.handles.tasks.mark_done(&task.id)?;
                    added.extend(rules);
                }
                Err(e) => {
                    self.handles.tasks.mark_failed(&task.id, e.to_string())?;
                    self.handles.audit.append(
                        "task_failed",
                        PRODUCER,
                        Recipient::Broadcast,
                        json!({
                            "task_id": task.id,
                            "kind": task.kind.as_str(),
                            "error": e.to_string(),
                            "error_type": e.kind(),
                        }),
                    )?;
                    warn!(project = %self.project, task_id = %task.id, error = %e, "Critique analysis failed");
                }
            }
        }
        Ok(added)
    }

    async fn analyse_critique(&self, task: &Task) -> EngineResult<Vec<CanonRule>> {
        let critique = task
            .payload
            .get("critique")
            .and_then(|c| c.as_str())
            .ok_or_else(|| EngineError::Validation("critique task has no critique text".into()))?;

        let mut added = Vec::new();
        for derived in derive_rules(critique) {
            let rule = derived.into_canon_rule(&task.id);
            if self.handles.graph.add_canon_rule(rule.clone())? {
                added.push(rule);
            }
        }

        self.handles.state.add_continuity_note(&format!(
            "Critique analysed ({} new canon rule(s)): {}",
            added.len(),
            truncate_chars(critique, 200)
        ))?;

        if !added.is_empty() {
            let texts: Vec<&str> = added.iter().map(|r| r.rule.as_str()).collect();
            self.handles.audit.append(
                "canon_rules_added",
                PRODUCER,
                Recipient::Broadcast,
                json!({ "task_id": task.id, "rules": texts }),
            )?;
            self.handles.bus.publish(
                PRODUCER,
                Recipient::Broadcast,
                kinds::CANON_UPDATE,
                json!({ "task_id": task.id, "rules": texts }),
            );
            if self.settings.auto_memory {
                if let Err(e) = self
                    .handles
                    .memory
                    .add(&format!("Canon rules: {}", texts.join("; ")))
                    .await
                {
                    warn!(project = %self.project, error = %e, "Could not store canon summary in memory");
                }
            }
            info!(project = %self.project, task_id = %task.id, rules = added.len(), "Canon rules derived");
        }
        Ok(added)
    }

    // ----- read APIs -----

    pub fn status(&self, run_id: &str) -> EngineResult<PipelineStatus> {
        Ok(self.slot(run_id)?.status())
    }

    /// Status of every run this producer knows about, oldest first.
    pub fn list_runs(&self) -> Vec<PipelineStatus> {
        let mut statuses: Vec<(DateTime<Utc>, PipelineStatus)> = self
            .runs()
            .values()
            .map(|slot| (slot.created_at, slot.status()))
            .collect();
        statuses.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.run_id.cmp(&b.1.run_id)));
        statuses.into_iter().map(|(_, s)| s).collect()
    }

    /// Full copy of a run, waiting for any in-flight step to finish.
    pub async fn run_snapshot(&self, run_id: &str) -> EngineResult<PipelineRun> {
        let slot = self.slot(run_id)?;
        let run = slot.run.lock().await;
        Ok(run.clone())
    }

    pub fn recent_events(&self, limit: usize) -> Vec<Event> {
        self.handles.bus.recent_all(limit)
    }

    pub fn audit_search(
        &self,
        event_type: Option<&str>,
        sender: Option<&str>,
        limit: Option<usize>,
    ) -> EngineResult<Vec<AuditEntry>> {
        self.handles.audit.search(event_type, sender, limit)
    }

    pub fn pipeline_results(&self) -> Vec<crate::state::PipelineResult> {
        self.handles.state.pipeline_results()
    }

    pub fn canon_rules(&self) -> Vec<CanonRule> {
        self.handles.graph.canon_rules()
    }
}

/// Drop the oldest finished runs beyond `keep`. Returns how many went.
fn prune_finished(runs: &mut HashMap<String, Arc<RunSlot>>, keep: usize) -> usize {
    let mut finished: Vec<(u64, String)> = runs
        .iter()
        .filter(|(_, slot)| slot.status().status.is_terminal())
        .map(|(id, slot)| (slot.admitted, id.clone()))
        .collect();
    if finished.len() <= keep {
        return 0;
    }
    finished.sort_unstable();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
    excess
}

fn ensure_open(status: &PipelineStatus) -> EngineResult<()> {
    if status.status.is_terminal() {
        return Err(EngineError::InvalidTransition(format!(
            "run {} is already {}",
            status.run_id, status.status
        )));
    }
    Ok(())
}

/// Goal and outline excerpt for scene-level steps.
fn scene_brief(run: &PipelineRun, planned: &PlannedStep) -> (String, String) {
    match &run.request {
        PipelineRequest::Chapter(input) => (
            input
                .goal
                .clone()
                .unwrap_or_else(|| input.outline_excerpt.clone()),
            input.outline_excerpt.clone(),
        ),
        PipelineRequest::FullStory(_) | PipelineRequest::DirectorMode(_) => {
            let chapter = planned
                .chapter
                .and_then(|i| run.artifacts.chapter_plan.iter().find(|c| c.index == i));
            match chapter {
                Some(c) => (
                    format!("Chapter {}: {}", c.index, c.title),
                    c.excerpt.clone(),
                ),
                None => (String::new(), run.artifacts.outline.clone().unwrap_or_default()),
            }
        }
        PipelineRequest::StoryBible(idea) => (idea.idea.clone(), String::new()),
    }
}

/// Finished chapter a director revision step works from.
fn revision_source<'a>(art: &'a Artifacts, planned: &PlannedStep) -> Option<&'a ChapterResult> {
    planned
        .chapter
        .and_then(|index| art.chapters.iter().find(|c| c.index == index))
}

fn continuity_context(excerpt: &str, canon: &[String]) -> String {
    if canon.is_empty() {
        return excerpt.to_string();
    }
    let rules: Vec<String> = canon.iter().map(|r| format!("- {}", r)).collect();
    format!("{}\n\nEstablished canon:\n{}", excerpt, rules.join("\n"))
}

fn full_text(chapters: &[ChapterResult]) -> String {
    chapters
        .iter()
        .map(|c| c.final_text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::testing::Scripted;
    use crate::agents::PASS_MARKER;
    use crate::conductor::pipeline::{ChapterInput, DirectorInput, StoryIdea};
    use crate::llm::{self, Embedder, GenerationParams, TextGenerator};
    use crate::memory::VectorMemory;
    use crate::state::ProjectPaths;
    use async_trait::async_trait;
    use sdk::errors::ModelError;
    use tempfile::TempDir;

    struct Flat;

    #[async_trait]
    impl Embedder for Flat {
        async fn embed(&self, _text: &str) -> llm::Result<Vec<f32>> {
            Ok(vec![1.0, 0.0])
        }
    }

    /// Answers by agent role
    struct Studio {
        critique: String,
        fail_on: Option<&'static str>,
    }

    #[async_trait]
    impl TextGenerator for Studio {
        fn name(&self) -> &str {
            "studio"
        }

        async fn generate(&self, prompt: &str, _params: &GenerationParams) -> llm::Result<String> {
            if let Some(role) = self.fail_on {
                if prompt.contains(role) {
                    return Err(ModelError::Connection("refused".into()));
                }
            }
            if prompt.starts_with("You are the Continuity Agent") {
                return Ok(self.critique.clone());
            }
            Ok("The engines hum over Skyhold.".to_string())
        }
    }

    fn producer(dir: &TempDir, generator: Arc<dyn TextGenerator>) -> Producer {
        let paths = ProjectPaths::for_project(dir.path(), "demo");
        paths.ensure_directories().unwrap();
        let handles = ProjectHandles {
            bus: Arc::new(EventBus::new("demo")),
            audit: Arc::new(AuditLog::open(&paths.audit, "demo", 0).unwrap()),
            state: Arc::new(StateHandle::open(paths.clone(), None, "demo").unwrap()),
            graph: Arc::new(GraphStore::open(&paths.graph).unwrap()),
            tasks: Arc::new(TaskStore::open(&paths.tasks, "demo").unwrap()),
            outputs: Arc::new(OutputManager::new(&paths)),
            memory: Arc::new(VectorMemory::open(paths.clone(), Arc::new(Flat)).unwrap()),
        };
        Producer::new(
            "demo",
            handles,
            ModelEndpoint::new(generator, GenerationParams::default()),
            PipelineConfig::default(),
        )
    }

    fn chapter_request() -> PipelineRequest {
        PipelineRequest::Chapter(ChapterInput {
            outline_excerpt: "ACT 1: Mira reaches the cloud city".into(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_story_bible_runs_to_completion() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, Scripted::new("Generated text"));

        let started = producer
            .start(PipelineRequest::StoryBible(StoryIdea::new("A city in the clouds")))
            .unwrap();
        assert_eq!(started.status, RunStatus::Running);

        let done = producer.run_to_completion(&started.run_id).await.unwrap();
        assert_eq!(done.status, RunStatus::Completed);
        assert_eq!(done.step_index, 3);

        let results = producer.pipeline_results();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].pipeline_type, "story_bible");

        let handoffs: Vec<AuditEntry> = producer
            .audit_search(None, None, None)
            .unwrap()
            .into_iter()
            .filter(|e| e.event_type.starts_with("agent_message_"))
            .collect();
        assert_eq!(handoffs.len(), 3);
        assert_eq!(
            producer
                .audit_search(Some("step_completed"), None, None)
                .unwrap()
                .len(),
            3
        );

        let task = producer.handles.tasks.get(&started.run_id).unwrap();
        assert_eq!(task.status, TaskStatus::Done);
    }

    #[tokio::test]
    async fn test_feedback_while_paused_reaches_next_agent() {
        let dir = TempDir::new().unwrap();
        let model = Scripted::new("Scene text");
        let producer = producer(&dir, model.clone());

        let run_id = producer.start(chapter_request()).unwrap().run_id;
        let paused = producer.pause(&run_id).unwrap();
        assert_eq!(paused.status, RunStatus::Paused);

        // Nothing runs while paused
        let still = producer.step(&run_id).await.unwrap();
        assert_eq!(still.status, RunStatus::Paused);
        assert!(model.prompts.lock().unwrap().is_empty());

        producer
            .inject("scene_generator", "Open with a storm", FeedbackPriority::High)
            .unwrap();
        producer.resume(&run_id).unwrap();
        producer.step(&run_id).await.unwrap();

        let run = producer.run_snapshot(&run_id).await.unwrap();
        assert_eq!(run.steps.len(), 1);
        assert!(run.steps[0].input_context.contains("Open with a storm"));
        assert_eq!(run.steps[0].feedback[0].message, "Open with a storm");
    }

    #[tokio::test]
    async fn test_pause_then_resume_continues_with_next_step() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, Scripted::new("Scene text"));
        let run_id = producer.start(chapter_request()).unwrap().run_id;

        producer.step(&run_id).await.unwrap();
        producer.pause(&run_id).unwrap();
        producer.resume(&run_id).unwrap();
        producer.step(&run_id).await.unwrap();

        let run = producer.run_snapshot(&run_id).await.unwrap();
        let agents: Vec<AgentKind> = run.steps.iter().map(|s| s.agent).collect();
        assert_eq!(
            agents,
            vec![AgentKind::SceneGenerator, AgentKind::ContinuityAgent]
        );
    }

    #[tokio::test]
    async fn test_stop_keeps_partial_results() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, Scripted::new("Outline text"));
        let run_id = producer
            .start(PipelineRequest::StoryBible(StoryIdea::new("Skyhold")))
            .unwrap()
            .run_id;

        producer.step(&run_id).await.unwrap();
        let stopped = producer.stop(&run_id).unwrap();
        assert_eq!(stopped.status, RunStatus::Stopped);

        // Further steps are no-ops
        let after = producer.step(&run_id).await.unwrap();
        assert_eq!(after.status, RunStatus::Stopped);
        assert!(producer.resume(&run_id).is_err());

        let state = producer.handles.state.snapshot();
        assert_eq!(state.agent_outputs.outline, "Outline text");
        assert!(producer.pipeline_results().is_empty());
        let task = producer.handles.tasks.get(&run_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.error.as_deref(), Some("stopped"));
    }

    #[tokio::test]
    async fn test_step_failure_fails_run_and_audits() {
        let dir = TempDir::new().unwrap();
        let producer = producer(
            &dir,
            Arc::new(Studio {
                critique: String::new(),
                fail_on: Some("You are the Worldbuilder"),
            }),
        );
        let run_id = producer
            .start(PipelineRequest::StoryBible(StoryIdea::new("Skyhold")))
            .unwrap()
            .run_id;

        let status = producer.run_to_completion(&run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert!(status.error.unwrap().contains("worldbuilder"));
        assert!(producer.pipeline_results().is_empty());

        let failures = producer
            .audit_search(Some("task_failed"), None, None)
            .unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].payload["step_index"], 2);
        assert_eq!(failures[0].payload["error_type"], "model");

        // The outline from step 1 survives
        let state = producer.handles.state.snapshot();
        assert!(!state.agent_outputs.outline.is_empty());
    }

    const THREE_CHAPTERS: &str = "Chapter 1: Arrival\nMira reaches Skyhold.\n\n\
                                  Chapter 2: The Storm\nThe kites fall.\n\n\
                                  Chapter 3: Landfall\nMira walks home.";

    /// Plots three chapters and serves continuity critiques in order,
    /// passing once they run out
    struct Director {
        critiques: Mutex<Vec<&'static str>>,
    }

    impl Director {
        fn new(critiques: &[&'static str]) -> Arc<Self> {
            Arc::new(Self {
                critiques: Mutex::new(critiques.to_vec()),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for Director {
        fn name(&self) -> &str {
            "director"
        }

        async fn generate(&self, prompt: &str, _params: &GenerationParams) -> llm::Result<String> {
            if prompt.starts_with("You are the Plot Architect") {
                return Ok(THREE_CHAPTERS.to_string());
            }
            if prompt.starts_with("You are the Continuity Agent") {
                let mut critiques = self.critiques.lock().unwrap();
                if critiques.is_empty() {
                    return Ok(PASS_MARKER.to_string());
                }
                return Ok(critiques.remove(0).to_string());
            }
            Ok("The engines hum over Skyhold.".to_string())
        }
    }

    fn director_request(max_chapters: usize, max_passes: usize) -> PipelineRequest {
        PipelineRequest::DirectorMode(DirectorInput {
            idea: StoryIdea::new("A city in the clouds"),
            max_chapters: Some(max_chapters),
            max_passes: Some(max_passes),
        })
    }

    #[tokio::test]
    async fn test_director_mode_revises_until_fixed_point() {
        let dir = TempDir::new().unwrap();
        // Both chapters pass first time; the first revision pass flags chapter 1
        let critiques = [
            PASS_MARKER,
            PASS_MARKER,
            "Issues found:\n1. Engines must never run at night.",
        ];
        let producer = producer(&dir, Director::new(&critiques));
        let run_id = producer.start(director_request(2, 3)).unwrap().run_id;

        let status = producer.run_to_completion(&run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Completed);

        let run = producer.run_snapshot(&run_id).await.unwrap();
        let agents: Vec<AgentKind> = run.steps.iter().map(|s| s.agent).collect();
        assert_eq!(agents.len(), 15);
        assert_eq!(
            &agents[9..],
            &[
                AgentKind::ContinuityAgent,
                AgentKind::SceneGenerator,
                AgentKind::EditorAgent,
                AgentKind::ContinuityAgent,
                AgentKind::ContinuityAgent,
                AgentKind::ContinuityAgent,
            ]
        );
        assert_eq!(run.plan[10], PlannedStep::revision(AgentKind::SceneGenerator, 1, 1));
        assert_eq!(run.artifacts.passes, 2);
        assert_eq!(run.artifacts.revisions, 1);
        assert_eq!(run.artifacts.canon_added, 1);
        assert!(run.artifacts.fixed_point);
        assert_eq!(run.artifacts.chapters.len(), 2);

        // The rewrite saw both the critique and the new rule
        assert!(run.steps[10].input_context.contains("Engines must never run at night."));
        assert_eq!(producer.canon_rules().len(), 1);
        assert_eq!(producer.handles.outputs.list_chapters().unwrap(), vec![1, 2]);
        assert!(producer.handles.outputs.latest_draft("director_mode").unwrap().is_some());

        let result = &producer.pipeline_results()[0];
        assert_eq!(result.pipeline_type, "director_mode");
        assert_eq!(result.result["chapters"].as_array().unwrap().len(), 2);
        assert_eq!(result.result["fixed_point"], true);
    }

    #[tokio::test]
    async fn test_director_plan_grows_with_the_story() {
        for (chapters, steps) in [(2, 11), (3, 15)] {
            let dir = TempDir::new().unwrap();
            let producer = producer(&dir, Director::new(&[]));
            let run_id = producer.start(director_request(chapters, 2)).unwrap().run_id;

            let status = producer.run_to_completion(&run_id).await.unwrap();
            assert_eq!(status.status, RunStatus::Completed);
            assert_eq!(status.total_steps, steps);

            let run = producer.run_snapshot(&run_id).await.unwrap();
            assert_eq!(run.artifacts.passes, 1);
            assert_eq!(run.artifacts.revisions, 0);
            assert!(run.artifacts.fixed_point);
        }
    }

    #[tokio::test]
    async fn test_director_mode_respects_pass_limit() {
        let dir = TempDir::new().unwrap();
        let critiques = [
            PASS_MARKER,
            "Issues found:\n1. Kites must always stay tethered.",
        ];
        let producer = producer(&dir, Director::new(&critiques));
        let run_id = producer.start(director_request(1, 1)).unwrap().run_id;

        let status = producer.run_to_completion(&run_id).await.unwrap();
        assert_eq!(status.status, RunStatus::Completed);
        assert_eq!(status.total_steps, 9);

        let run = producer.run_snapshot(&run_id).await.unwrap();
        assert_eq!(run.artifacts.passes, 1);
        assert_eq!(run.artifacts.revisions, 1);
        assert!(!run.artifacts.fixed_point);
    }

    #[tokio::test]
    async fn test_critiques_become_canon_once() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, Scripted::new("unused"));

        for _ in 0..2 {
            producer.handles.bus.publish(
                "continuity_agent",
                Recipient::agent(PRODUCER),
                kinds::CRITIQUE,
                json!({ "critique": "The sky whales must never be hunted." }),
            );
        }
        assert_eq!(producer.ingest_critiques().unwrap(), 2);
        assert_eq!(producer.ingest_critiques().unwrap(), 0);

        let added = producer.process_pending_tasks().await.unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(producer.canon_rules().len(), 1);
        assert!(producer.handles.tasks.active(TaskKind::CritiqueAnalysis).is_empty());
        assert_eq!(producer.handles.state.continuity_notes().len(), 2);
    }

    #[test]
    fn test_inject_rejects_unknown_agent_and_empty_message() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, Scripted::new("unused"));
        assert!(matches!(
            producer.inject("narrator", "hi", FeedbackPriority::Normal),
            Err(EngineError::Validation(_))
        ));
        assert!(producer
            .inject("editor_agent", "  ", FeedbackPriority::Normal)
            .is_err());
        assert!(producer.audit_search(Some("user_feedback"), None, None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_only_recent_finished_runs_are_kept() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, Scripted::new("unused"));
        let bible = || PipelineRequest::StoryBible(StoryIdea::new("Skyhold"));

        let active = producer.start(bible()).unwrap().run_id;
        let mut finished = Vec::new();
        for _ in 0..RETAINED_FINISHED_RUNS + 2 {
            let run_id = producer.start(bible()).unwrap().run_id;
            producer.stop(&run_id).unwrap();
            finished.push(run_id);
        }

        assert_eq!(producer.list_runs().len(), RETAINED_FINISHED_RUNS + 2);
        assert!(matches!(
            producer.status(&finished[0]),
            Err(EngineError::RunNotFound(_))
        ));
        assert_eq!(producer.status(&active).unwrap().status, RunStatus::Running);
        let last = finished.last().unwrap();
        assert_eq!(producer.status(last).unwrap().status, RunStatus::Stopped);

        // Forgotten runs keep their persisted task
        let task = producer.handles.tasks.get(&finished[0]).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
    }

    #[tokio::test]
    async fn test_fail_run_closes_a_paused_run() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, Scripted::new("Outline text"));
        let run_id = producer
            .start(PipelineRequest::StoryBible(StoryIdea::new("Skyhold")))
            .unwrap()
            .run_id;
        producer.step(&run_id).await.unwrap();
        producer.pause(&run_id).unwrap();

        let status = producer.fail_run(&run_id, "step panicked: boom").await.unwrap();
        assert_eq!(status.status, RunStatus::Failed);
        assert!(status.error.unwrap().contains("boom"));
        let task = producer.handles.tasks.get(&run_id).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        let failures = producer.audit_search(Some("task_failed"), None, None).unwrap();
        assert_eq!(failures[0].payload["agent"], "worldbuilder");

        // Already finished: left alone
        let again = producer.fail_run(&run_id, "late").await.unwrap();
        assert_eq!(again.status, RunStatus::Failed);
        assert_eq!(producer.audit_search(Some("task_failed"), None, None).unwrap().len(), 1);
    }

    #[test]
    fn test_invalid_request_creates_no_task() {
        let dir = TempDir::new().unwrap();
        let producer = producer(&dir, Scripted::new("unused"));
        let err = producer
            .start(PipelineRequest::StoryBible(StoryIdea::new("")))
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
        assert!(producer.handles.tasks.list().is_empty());
        assert!(matches!(
            producer.status("missing"),
            Err(EngineError::RunNotFound(_))
        ));
    }
}
