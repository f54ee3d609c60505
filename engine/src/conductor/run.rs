//! Pipeline run state
//!
//! A run is a cursor over a list of planned steps plus the artifacts
//! threaded from one step to the next. The plan can grow while the run is in
//! progress (a full story learns its chapters from the outline, director
//! mode adds a revision pass over every chapter until it reaches a fixed
//! point).
//!
//! ```text
//! PENDING → RUNNING → (PAUSED ⇄ RUNNING)* → COMPLETED | STOPPED | FAILED
//! ```

use std::fmt;

use chrono::{DateTime, Utc};
use sdk::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

use super::pipeline::{ChapterPlan, PipelineKind, PipelineRequest};
use crate::agents::{AgentKind, FeedbackItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Stopped,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "PENDING",
            RunStatus::Running => "RUNNING",
            RunStatus::Paused => "PAUSED",
            RunStatus::Completed => "COMPLETED",
            RunStatus::Stopped => "STOPPED",
            RunStatus::Failed => "FAILED",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Stopped | RunStatus::Failed
        )
    }

    pub fn can_transition_to(&self, next: RunStatus) -> bool {
        use RunStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Stopped)
                | (Pending, Failed)
                | (Running, Paused)
                | (Paused, Running)
                | (Running, Completed)
                | (Running, Stopped)
                | (Paused, Stopped)
                | (Running, Failed)
                | (Paused, Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One planned agent invocation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedStep {
    pub agent: AgentKind,
    /// Chapter the step works on (1-based)
    #[serde(default)]
    pub chapter: Option<usize>,
    /// Director mode revision pass (1-based)
    #[serde(default)]
    pub pass: Option<usize>,
}

impl PlannedStep {
    pub fn new(agent: AgentKind) -> Self {
        Self {
            agent,
            chapter: None,
            pass: None,
        }
    }

    pub fn for_chapter(agent: AgentKind, chapter: usize) -> Self {
        Self {
            chapter: Some(chapter),
            ..Self::new(agent)
        }
    }

    /// Director mode revision of one chapter
    pub fn revision(agent: AgentKind, chapter: usize, pass: usize) -> Self {
        Self {
            agent,
            chapter: Some(chapter),
            pass: Some(pass),
        }
    }
}

/// What happened at one executed step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    /// 1-based
    pub index: usize,
    pub agent: AgentKind,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Prompt the agent sent to the model
    pub input_context: String,
    pub feedback: Vec<FeedbackItem>,
    pub output: Option<String>,
    pub error: Option<String>,
}

/// Finished chapter text at each stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterResult {
    pub index: usize,
    pub title: String,
    pub raw: String,
    pub continuity: String,
    #[serde(rename = "final")]
    pub final_text: String,
}

/// Data threaded forward between steps
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Artifacts {
    pub outline: Option<String>,
    pub world: Option<String>,
    pub characters: Option<String>,
    pub chapter_plan: Vec<ChapterPlan>,
    pub chapters: Vec<ChapterResult>,
    /// Chapter being produced right now
    pub current: Option<ChapterResult>,
    /// Director mode: canon rules added across passes
    pub canon_added: usize,
    /// Director mode: chapter rewrites performed
    pub revisions: usize,
    /// Director mode: passes started
    pub passes: usize,
    /// Director mode: whether the current pass rewrote any chapter
    pub pass_revised: bool,
    /// Director mode: whether the last pass found nothing to rewrite
    pub fixed_point: bool,
}

/// Snapshot exposed to UIs and the CLI
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStatus {
    pub run_id: String,
    pub project: String,
    pub pipeline: PipelineKind,
    pub status: RunStatus,
    /// Agent of the step in flight or next to run
    pub current_step: Option<String>,
    /// 1-based index of `current_step`; equals `total_steps` once finished
    pub step_index: usize,
    pub total_steps: usize,
    pub error: Option<String>,
}

/// Full state of one run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineRun {
    pub id: String,
    pub project: String,
    pub request: PipelineRequest,
    pub status: RunStatus,
    pub plan: Vec<PlannedStep>,
    /// Index into `plan` of the next step to execute
    pub cursor: usize,
    pub steps: Vec<StepRecord>,
    pub artifacts: Artifacts,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl PipelineRun {
    pub fn new(id: impl Into<String>, project: impl Into<String>, request: PipelineRequest) -> Self {
        let now = Utc::now();
        let plan = initial_plan(&request);
        Self {
            id: id.into(),
            project: project.into(),
            request,
            status: RunStatus::Pending,
            plan,
            cursor: 0,
            steps: Vec::new(),
            artifacts: Artifacts::default(),
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn kind(&self) -> PipelineKind {
        self.request.kind()
    }

    pub fn transition(&mut self, next: RunStatus) -> EngineResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition(format!(
                "run {} cannot go from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn next_step(&self) -> Option<&PlannedStep> {
        self.plan.get(self.cursor)
    }

    /// Agent of the step after the current one, if any.
    pub fn following_step(&self) -> Option<&PlannedStep> {
        self.plan.get(self.cursor + 1)
    }

    pub fn is_last_step(&self) -> bool {
        self.cursor + 1 >= self.plan.len()
    }

    pub fn status(&self) -> PipelineStatus {
        let finished = self.status == RunStatus::Completed;
        PipelineStatus {
            run_id: self.id.clone(),
            project: self.project.clone(),
            pipeline: self.kind(),
            status: self.status,
            current_step: if finished {
                None
            } else {
                self.next_step().map(|s| s.agent.name().to_string())
            },
            step_index: if finished {
                self.plan.len()
            } else {
                (self.cursor + 1).min(self.plan.len())
            },
            total_steps: self.plan.len(),
            error: self.error.clone(),
        }
    }
}

fn initial_plan(request: &PipelineRequest) -> Vec<PlannedStep> {
    let bible = [
        AgentKind::PlotArchitect,
        AgentKind::Worldbuilder,
        AgentKind::CharacterAgent,
    ];
    match request {
        PipelineRequest::StoryBible(_)
        | PipelineRequest::FullStory(_)
        | PipelineRequest::DirectorMode(_) => bible.into_iter().map(PlannedStep::new).collect(),
        PipelineRequest::Chapter(input) => [
            AgentKind::SceneGenerator,
            AgentKind::ContinuityAgent,
            AgentKind::EditorAgent,
        ]
        .into_iter()
        .map(|agent| PlannedStep {
            chapter: input.chapter_index,
            ..PlannedStep::new(agent)
        })
        .collect(),
    }
}

/// Steps for each planned chapter of a full story.
pub fn chapter_steps(plan: &[ChapterPlan]) -> Vec<PlannedStep> {
    plan.iter()
        .flat_map(|chapter| {
            [
                AgentKind::SceneGenerator,
                AgentKind::ContinuityAgent,
                AgentKind::EditorAgent,
            ]
            .into_iter()
            .map(move |agent| PlannedStep::for_chapter(agent, chapter.index))
        })
        .collect()
}

/// Continuity checks opening a director revision pass, one per chapter.
///
/// A chapter whose check raises new canon gets its rewrite steps inserted
/// right after the check.
pub fn revision_checks(plan: &[ChapterPlan], pass: usize) -> Vec<PlannedStep> {
    plan.iter()
        .map(|chapter| PlannedStep::revision(AgentKind::ContinuityAgent, chapter.index, pass))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conductor::pipeline::{ChapterInput, DirectorInput, StoryIdea};

    #[test]
    fn test_status_machine() {
        assert!(RunStatus::Pending.can_transition_to(RunStatus::Running));
        assert!(RunStatus::Running.can_transition_to(RunStatus::Paused));
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Paused.can_transition_to(RunStatus::Completed));
        assert!(!RunStatus::Completed.can_transition_to(RunStatus::Running));
        assert!(!RunStatus::Failed.can_transition_to(RunStatus::Stopped));
    }

    #[test]
    fn test_story_bible_plan_and_status() {
        let mut run = PipelineRun::new(
            "r1",
            "demo",
            PipelineRequest::StoryBible(StoryIdea::new("Skyhold")),
        );
        let status = run.status();
        assert_eq!(status.total_steps, 3);
        assert_eq!(status.step_index, 1);
        assert_eq!(status.current_step.as_deref(), Some("plot_architect"));

        run.transition(RunStatus::Running).unwrap();
        run.cursor = 3;
        run.transition(RunStatus::Completed).unwrap();
        let status = run.status();
        assert_eq!(status.step_index, 3);
        assert!(status.current_step.is_none());
        assert!(run.transition(RunStatus::Running).is_err());
    }

    #[test]
    fn test_chapter_and_director_plans() {
        let chapter = PipelineRun::new(
            "c",
            "demo",
            PipelineRequest::Chapter(ChapterInput {
                outline_excerpt: "ACT 1".into(),
                ..Default::default()
            }),
        );
        let agents: Vec<AgentKind> = chapter.plan.iter().map(|s| s.agent).collect();
        assert_eq!(
            agents,
            vec![
                AgentKind::SceneGenerator,
                AgentKind::ContinuityAgent,
                AgentKind::EditorAgent
            ]
        );

        let director = PipelineRun::new(
            "d",
            "demo",
            PipelineRequest::DirectorMode(DirectorInput {
                idea: StoryIdea::new("Skyhold"),
                max_chapters: None,
                max_passes: Some(1),
            }),
        );
        let agents: Vec<AgentKind> = director.plan.iter().map(|s| s.agent).collect();
        assert_eq!(
            agents,
            vec![
                AgentKind::PlotArchitect,
                AgentKind::Worldbuilder,
                AgentKind::CharacterAgent
            ]
        );
    }

    #[test]
    fn test_chapter_steps_expand_per_chapter() {
        let plan = vec![
            ChapterPlan {
                index: 1,
                title: "One".into(),
                excerpt: "a".into(),
            },
            ChapterPlan {
                index: 2,
                title: "Two".into(),
                excerpt: "b".into(),
            },
        ];
        let steps = chapter_steps(&plan);
        assert_eq!(steps.len(), 6);
        assert_eq!(steps[3], PlannedStep::for_chapter(AgentKind::SceneGenerator, 2));

        let checks = revision_checks(&plan, 2);
        assert_eq!(
            checks,
            vec![
                PlannedStep::revision(AgentKind::ContinuityAgent, 1, 2),
                PlannedStep::revision(AgentKind::ContinuityAgent, 2, 2),
            ]
        );
    }

    #[test]
    fn test_paused_run_can_fail() {
        assert!(RunStatus::Paused.can_transition_to(RunStatus::Failed));
        assert!(!RunStatus::Stopped.can_transition_to(RunStatus::Failed));
    }
}
