//! Conductor System
//!
//! Sequences agent invocations into pipelines, threads data between steps,
//! turns critiques into canon and keeps the knowledge graph current.

pub mod canon;
pub mod lore;
pub mod pipeline;
pub mod producer;
pub mod run;

pub use canon::{derive_rules, DerivedRule};
pub use pipeline::{
    plan_chapters, ChapterInput, ChapterPlan, DirectorInput, FullStoryInput, PipelineKind,
    PipelineRequest, StoryIdea,
};
pub use producer::{ProjectHandles, Producer, RETAINED_FINISHED_RUNS, STATUS_WATCHER};
pub use run::{ChapterResult, PipelineRun, PipelineStatus, PlannedStep, RunStatus, StepRecord};
