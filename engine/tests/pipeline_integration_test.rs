//! End-to-end pipeline runs through the project registry
//!
//! The model is replaced by a generator that answers by agent role, so
//! these tests exercise the real agents, persistence and audit trail.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use inkwell_engine::agents::{AgentKind, PASS_MARKER};
use inkwell_engine::conductor::{
    ChapterInput, FullStoryInput, PipelineRequest, RunStatus, StoryIdea,
};
use inkwell_engine::config::Config;
use inkwell_engine::llm::{self, Embedder, GenerationParams, TextGenerator};
use inkwell_engine::registry::{ModelProvider, ProjectRegistry};
use inkwell_engine::tasks::TaskStatus;
use sdk::errors::ModelError;
use sdk::types::FeedbackPriority;
use tempfile::TempDir;

const OUTLINE: &str = "Chapter 1: Arrival\nMira reaches Skyhold.\n\n\
                       Chapter 2: The Storm\nThe kites fall.\n\n\
                       Chapter 3: Landfall\nMira walks home.";

struct Flat;

#[async_trait]
impl Embedder for Flat {
    async fn embed(&self, _text: &str) -> llm::Result<Vec<f32>> {
        Ok(vec![1.0, 0.0])
    }
}

/// Answers by agent role and records every prompt
#[derive(Default)]
struct Writers {
    fail_on: Option<&'static str>,
    prompts: Mutex<Vec<String>>,
}

impl Writers {
    fn failing_on(role: &'static str) -> Self {
        Self {
            fail_on: Some(role),
            ..Self::default()
        }
    }

    fn prompts_for(&self, role: &str) -> Vec<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.starts_with(role))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TextGenerator for Writers {
    fn name(&self) -> &str {
        "writers"
    }

    async fn generate(&self, prompt: &str, _params: &GenerationParams) -> llm::Result<String> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        if let Some(role) = self.fail_on {
            if prompt.starts_with(role) {
                return Err(ModelError::Server {
                    status: 500,
                    body: "overloaded".into(),
                });
            }
        }
        let reply = if prompt.starts_with("You are the Plot Architect") {
            OUTLINE.to_string()
        } else if prompt.starts_with("You are the Worldbuilder") {
            "Skyhold floats on tethered kites.".to_string()
        } else if prompt.starts_with("You are the Character Agent") {
            "Mira: a pilot who fears falling.".to_string()
        } else if prompt.starts_with("You are the Continuity Agent") {
            PASS_MARKER.to_string()
        } else if prompt.starts_with("You are the Editor Agent") {
            "Polished: Mira hears the engines hum over Skyhold.".to_string()
        } else {
            "The engines hum over Skyhold.".to_string()
        };
        Ok(reply)
    }
}

fn registry(dir: &TempDir, writers: Arc<Writers>) -> ProjectRegistry {
    let config = Config::with_data_dir(dir.path()).unwrap();
    ProjectRegistry::new(config, ModelProvider::new(writers, Arc::new(Flat)))
}

#[tokio::test]
async fn test_story_bible_fills_state_and_audit() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir, Arc::new(Writers::default()));
    let producer = registry.producer("skyhold").unwrap();

    let run_id = producer
        .start(PipelineRequest::StoryBible(StoryIdea::new("A city in the clouds")))
        .unwrap()
        .run_id;
    let done = producer.run_to_completion(&run_id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);

    let state = registry.state("skyhold").unwrap().snapshot();
    assert_eq!(state.agent_outputs.outline, OUTLINE);
    assert_eq!(state.agent_outputs.world, "Skyhold floats on tethered kites.");
    assert_eq!(state.agent_outputs.characters, "Mira: a pilot who fears falling.");
    assert_eq!(state.pipeline_results.len(), 1);
    assert_eq!(state.pipeline_results[0].pipeline_type, "story_bible");

    let graph = registry.graph("skyhold").unwrap();
    let mira = graph.get_entity("character", "mira").unwrap();
    assert_eq!(mira.summary, "a pilot who fears falling.");

    let audit = registry.audit_log("skyhold").unwrap();
    let handoffs = audit
        .search(None, None, None)
        .unwrap()
        .into_iter()
        .filter(|e| e.event_type.starts_with("agent_message_"))
        .count();
    assert_eq!(handoffs, 3);
    assert_eq!(audit.search(Some("pipeline_completed"), None, None).unwrap().len(), 1);
}

#[tokio::test]
async fn test_feedback_while_paused_shapes_the_scene() {
    let dir = TempDir::new().unwrap();
    let writers = Arc::new(Writers::default());
    let registry = registry(&dir, Arc::clone(&writers));
    let producer = registry.producer("skyhold").unwrap();

    let run_id = producer
        .start(PipelineRequest::Chapter(ChapterInput {
            outline_excerpt: "Mira reaches Skyhold".into(),
            ..Default::default()
        }))
        .unwrap()
        .run_id;
    producer.pause(&run_id).unwrap();
    producer
        .inject("scene_generator", "Open with a storm", FeedbackPriority::High)
        .unwrap();
    producer.resume(&run_id).unwrap();

    let done = producer.run_to_completion(&run_id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);

    let scene_prompts = writers.prompts_for("You are the Scene Generator");
    assert_eq!(scene_prompts.len(), 1);
    assert!(scene_prompts[0].contains("Open with a storm"));

    let feedback = registry
        .audit_log("skyhold")
        .unwrap()
        .search(Some("user_feedback"), Some("user"), None)
        .unwrap();
    assert_eq!(feedback.len(), 1);

    // The chapter is saved under the next free number
    let outputs = registry.outputs("skyhold").unwrap();
    assert_eq!(outputs.list_chapters().unwrap(), vec![1]);
    let chapter = outputs.load_chapter(1).unwrap().unwrap();
    assert_eq!(chapter["chapter_index"], 1);
}

#[tokio::test]
async fn test_failed_step_is_recorded_and_stops_the_run() {
    let dir = TempDir::new().unwrap();
    let writers = Arc::new(Writers::failing_on("You are the Worldbuilder"));
    let registry = registry(&dir, Arc::clone(&writers));
    let producer = registry.producer("skyhold").unwrap();

    let run_id = producer
        .start(PipelineRequest::StoryBible(StoryIdea::new("Skyhold")))
        .unwrap()
        .run_id;
    let done = producer.run_to_completion(&run_id).await.unwrap();
    assert_eq!(done.status, RunStatus::Failed);
    assert!(done.error.unwrap().contains("worldbuilder"));

    // The character agent never ran
    assert!(writers.prompts_for("You are the Character Agent").is_empty());

    let failures = registry
        .audit_log("skyhold")
        .unwrap()
        .search(Some("task_failed"), None, None)
        .unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].payload["step_index"], 2);

    let task = registry.tasks("skyhold").unwrap().get(&run_id).unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert!(registry.state("skyhold").unwrap().pipeline_results().is_empty());
}

#[tokio::test]
async fn test_full_story_writes_chapters_and_draft() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir, Arc::new(Writers::default()));
    let producer = registry.producer("skyhold").unwrap();

    let run_id = producer
        .start(PipelineRequest::FullStory(FullStoryInput {
            idea: StoryIdea::new("A city in the clouds"),
            max_chapters: Some(2),
        }))
        .unwrap()
        .run_id;
    let done = producer.run_to_completion(&run_id).await.unwrap();
    assert_eq!(done.status, RunStatus::Completed);
    assert_eq!(done.total_steps, 9);

    let run = producer.run_snapshot(&run_id).await.unwrap();
    let agents: Vec<AgentKind> = run.steps.iter().map(|s| s.agent).collect();
    assert_eq!(&agents[3..6], &[
        AgentKind::SceneGenerator,
        AgentKind::ContinuityAgent,
        AgentKind::EditorAgent,
    ]);
    assert_eq!(run.artifacts.chapters.len(), 2);

    let outputs = registry.outputs("skyhold").unwrap();
    assert_eq!(outputs.list_chapters().unwrap(), vec![1, 2]);
    let draft = outputs.latest_draft("full_story").unwrap().unwrap();
    let text = std::fs::read_to_string(draft).unwrap();
    assert!(text.contains("Polished: Mira hears the engines hum over Skyhold."));

    let result = &producer.pipeline_results()[0];
    assert_eq!(result.pipeline_type, "full_story");
    assert_eq!(result.result["chapters"].as_array().unwrap().len(), 2);

    // Each chapter is on the timeline, with the character it names
    let graph = registry.graph("skyhold").unwrap();
    let events = graph.events();
    let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec!["chapter-1", "chapter-2"]);
    assert_eq!(events[0].name, "Chapter 1: Arrival");
    assert_eq!(graph.relationships_for("mira").len(), 2);
}

#[tokio::test]
async fn test_state_survives_clearing_the_project() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir, Arc::new(Writers::default()));
    let producer = registry.producer("skyhold").unwrap();
    let run_id = producer
        .start(PipelineRequest::StoryBible(StoryIdea::new("Skyhold")))
        .unwrap()
        .run_id;
    producer.run_to_completion(&run_id).await.unwrap();
    drop(producer);

    assert!(registry.clear_project("skyhold"));
    assert!(registry.event_bus("skyhold").unwrap().is_empty());

    let state = registry.state("skyhold").unwrap().snapshot();
    assert_eq!(state.pipeline_results.len(), 1);
    assert_eq!(state.agent_outputs.outline, OUTLINE);
    assert_eq!(
        registry
            .audit_log("skyhold")
            .unwrap()
            .search(Some("step_completed"), None, None)
            .unwrap()
            .len(),
        3
    );
}

#[tokio::test]
async fn test_projects_do_not_share_state() {
    let dir = TempDir::new().unwrap();
    let registry = registry(&dir, Arc::new(Writers::default()));

    let skyhold = registry.producer("skyhold").unwrap();
    let run_id = skyhold
        .start(PipelineRequest::StoryBible(StoryIdea::new("Skyhold")))
        .unwrap()
        .run_id;
    skyhold.run_to_completion(&run_id).await.unwrap();

    let tidewater = registry.producer("tidewater").unwrap();
    assert!(tidewater.pipeline_results().is_empty());
    assert!(tidewater.recent_events(10).is_empty());
    assert!(tidewater.status(&run_id).is_err());
    assert_eq!(
        registry.known_projects().unwrap(),
        vec!["skyhold".to_string(), "tidewater".to_string()]
    );
}
