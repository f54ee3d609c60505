//! Agent runtime
//!
//! Agents are stateless: [`create_agent`] builds a fresh instance for every
//! step from an [`AgentContext`] (project bus, audit log, model endpoint and
//! optional memory). Nothing survives between invocations except what an
//! agent writes to the memory store.
//!
//! Every agent follows the same contract:
//!
//! 1. Pull its recent bus events and fold any `feedback` it has not been
//!    shown before into the prompt, in arrival order, with the priority shown
//! 2. Optionally search memory for context
//! 3. Call the model once (errors are audited as `agent_error_model` and
//!    propagated, never replaced by a sentinel)
//! 4. Optionally ask the model for the lasting facts in its output and store
//!    each one in memory
//!
//! Messages between agents go through [`Agent::send`], which appends to the
//! audit log and publishes on the bus as one unit.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};

use async_trait::async_trait;
use regex::Regex;
use sdk::errors::{EngineError, EngineResult, ModelError};
use sdk::types::{FeedbackPriority, Recipient};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::audit::AuditLog;
use crate::event_bus::{kinds, Event, EventBus};
use crate::llm::ModelEndpoint;
use crate::memory::MemoryStore;

mod character;
mod continuity;
mod editor;
mod plot_architect;
mod scene_generator;
mod worldbuilder;

pub use character::CharacterAgent;
pub use continuity::{report_passed, ContinuityAgent, PASS_MARKER};
pub use editor::EditorAgent;
pub use plot_architect::PlotArchitect;
pub use scene_generator::SceneGenerator;
pub use worldbuilder::Worldbuilder;

/// Name the orchestrator uses as sender/recipient on the bus
pub const PRODUCER: &str = "producer";

/// Upper bound on facts stored from one output
const MAX_FACTS: usize = 12;

/// Characters of output handed to fact extraction
const FACT_SOURCE_CHARS: usize = 4000;

/// Every agent kind the factory can build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    PlotArchitect,
    Worldbuilder,
    CharacterAgent,
    SceneGenerator,
    ContinuityAgent,
    EditorAgent,
}

impl AgentKind {
    pub const ALL: [AgentKind; 6] = [
        AgentKind::PlotArchitect,
        AgentKind::Worldbuilder,
        AgentKind::CharacterAgent,
        AgentKind::SceneGenerator,
        AgentKind::ContinuityAgent,
        AgentKind::EditorAgent,
    ];

    /// Bus address of the agent
    pub fn name(&self) -> &'static str {
        match self {
            AgentKind::PlotArchitect => "plot_architect",
            AgentKind::Worldbuilder => "worldbuilder",
            AgentKind::CharacterAgent => "character_agent",
            AgentKind::SceneGenerator => "scene_generator",
            AgentKind::ContinuityAgent => "continuity_agent",
            AgentKind::EditorAgent => "editor_agent",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for AgentKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AgentKind::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| EngineError::Validation(format!("unknown agent '{}'", s)))
    }
}

/// Everything an agent instance is bound to
#[derive(Clone)]
pub struct AgentContext {
    pub project: String,
    pub bus: Arc<EventBus>,
    pub audit: Arc<AuditLog>,
    pub model: ModelEndpoint,
    /// Set only when auto-memory is enabled
    pub memory: Option<Arc<dyn MemoryStore>>,
    /// How many recent bus events to scan for feedback
    pub feedback_window: usize,
    /// Feedback already delivered, shared by every step of the project
    pub delivered: Arc<FeedbackLedger>,
}

/// Highest feedback `seq` each agent has already been shown.
///
/// Feedback reaches exactly one invocation of its target: the first one
/// that generates successfully after it was published.
#[derive(Debug, Default)]
pub struct FeedbackLedger {
    seen: Mutex<HashMap<String, u64>>,
}

impl FeedbackLedger {
    /// Feedback for `agent` in the recent window that it has not seen yet.
    pub fn pending(&self, bus: &EventBus, agent: &str, window: usize) -> Vec<FeedbackItem> {
        let seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let mark = seen.get(agent).copied();
        collect_feedback(bus, agent, window)
            .into_iter()
            .filter(|f| mark.map_or(true, |m| f.seq > m))
            .collect()
    }

    /// Record that `agent` has been shown everything up to `items`' last seq.
    pub fn mark_delivered(&self, agent: &str, items: &[FeedbackItem]) {
        let Some(last) = items.iter().map(|f| f.seq).max() else {
            return;
        };
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        let mark = seen.entry(agent.to_string()).or_insert(last);
        *mark = (*mark).max(last);
    }
}

impl fmt::Debug for AgentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentContext")
            .field("project", &self.project)
            .field("model", &self.model)
            .field("memory", &self.memory.is_some())
            .field("feedback_window", &self.feedback_window)
            .finish()
    }
}

/// Typed input, one variant per kind of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentInput {
    Plot {
        idea: String,
        genre: String,
        tone: String,
        themes: String,
        setting: String,
    },
    World {
        outline: String,
        genre: String,
        tone: String,
        themes: String,
        setting: String,
    },
    Characters {
        outline: String,
        world: String,
    },
    Scene {
        goal: String,
        outline_excerpt: String,
        world: String,
        characters: String,
        /// Canon rules the scene must respect
        #[serde(default)]
        canon: Vec<String>,
        /// Previous draft and critique when revising
        #[serde(default)]
        revise: Option<Revision>,
    },
    Continuity {
        scene: String,
        context: String,
    },
    Edit {
        scene: String,
        notes: String,
    },
}

impl AgentInput {
    fn variant(&self) -> &'static str {
        match self {
            AgentInput::Plot { .. } => "plot",
            AgentInput::World { .. } => "world",
            AgentInput::Characters { .. } => "characters",
            AgentInput::Scene { .. } => "scene",
            AgentInput::Continuity { .. } => "continuity",
            AgentInput::Edit { .. } => "edit",
        }
    }

    /// Error for an input handed to the wrong agent
    pub(crate) fn mismatch(&self, agent: AgentKind) -> EngineError {
        EngineError::Validation(format!(
            "{} cannot handle '{}' input",
            agent,
            self.variant()
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Revision {
    pub draft: String,
    pub critique: String,
}

/// One piece of feedback an agent saw before generating
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeedbackItem {
    pub seq: u64,
    pub sender: String,
    pub message: String,
    pub priority: FeedbackPriority,
}

/// Artifact of one invocation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    pub agent: AgentKind,
    pub text: String,
    /// The full prompt sent to the model
    pub input_context: String,
    pub feedback: Vec<FeedbackItem>,
}

#[async_trait]
pub trait Agent: Send + Sync {
    fn kind(&self) -> AgentKind;

    fn context(&self) -> &AgentContext;

    fn name(&self) -> &'static str {
        self.kind().name()
    }

    async fn run(&self, input: AgentInput) -> EngineResult<AgentOutput>;

    /// Record in the audit log as `agent_message_<type>`, then publish.
    ///
    /// If the audit append fails nothing is published.
    fn send(
        &self,
        recipient: Recipient,
        event_type: &str,
        payload: serde_json::Value,
    ) -> EngineResult<Event> {
        let ctx = self.context();
        ctx.audit.append(
            &format!("agent_message_{}", event_type),
            self.name(),
            recipient.clone(),
            payload.clone(),
        )?;
        let event = ctx.bus.publish(self.name(), recipient, event_type, payload);
        debug!(project = %ctx.project, agent = self.name(), event_type, seq = event.seq, "Agent message sent");
        Ok(event)
    }
}

/// Build a fresh agent of `kind` bound to `ctx`.
pub fn create_agent(kind: AgentKind, ctx: AgentContext) -> Box<dyn Agent> {
    match kind {
        AgentKind::PlotArchitect => Box::new(PlotArchitect::new(ctx)),
        AgentKind::Worldbuilder => Box::new(Worldbuilder::new(ctx)),
        AgentKind::CharacterAgent => Box::new(CharacterAgent::new(ctx)),
        AgentKind::SceneGenerator => Box::new(SceneGenerator::new(ctx)),
        AgentKind::ContinuityAgent => Box::new(ContinuityAgent::new(ctx)),
        AgentKind::EditorAgent => Box::new(EditorAgent::new(ctx)),
    }
}

/// Feedback addressed to `agent` among its recent bus events, oldest first.
pub fn collect_feedback(bus: &EventBus, agent: &str, window: usize) -> Vec<FeedbackItem> {
    bus.get_recent(agent, window)
        .into_iter()
        .filter(|e| e.event_type == kinds::FEEDBACK)
        .filter_map(|e| {
            let message = e.payload_str("message")?.to_string();
            let priority = e
                .payload
                .get("priority")
                .cloned()
                .and_then(|p| serde_json::from_value(p).ok())
                .unwrap_or_default();
            Some(FeedbackItem {
                seq: e.seq,
                sender: e.sender,
                message,
                priority,
            })
        })
        .collect()
}

/// Prompt section listing feedback; empty when there is none.
pub fn feedback_section(feedback: &[FeedbackItem]) -> String {
    if feedback.is_empty() {
        return String::new();
    }
    let lines: Vec<String> = feedback
        .iter()
        .map(|f| format!("- ({}) {}", f.priority, f.message))
        .collect();
    format!("\n[User Feedback]:\n{}\n", lines.join("\n"))
}

/// Shared generation path used by every agent.
///
/// `build_prompt` receives the feedback and memory sections and returns the
/// final prompt.
pub(crate) async fn generate<F>(
    ctx: &AgentContext,
    kind: AgentKind,
    memory_query: &str,
    memory_k: usize,
    temperature: f32,
    build_prompt: F,
) -> EngineResult<AgentOutput>
where
    F: FnOnce(&str, &str) -> String,
{
    let feedback = ctx
        .delivered
        .pending(&ctx.bus, kind.name(), ctx.feedback_window);
    let memory = memory_section(ctx, memory_query, memory_k).await;
    let prompt = build_prompt(&feedback_section(&feedback), &memory);

    let mut model = ctx.model.clone();
    model.defaults.temperature = temperature;

    match model.generate(&prompt, None).await {
        Ok(text) => {
            ctx.delivered.mark_delivered(kind.name(), &feedback);
            debug!(
                project = %ctx.project,
                agent = kind.name(),
                prompt_len = prompt.len(),
                feedback = feedback.len(),
                "Generation finished"
            );
            Ok(AgentOutput {
                agent: kind,
                text,
                input_context: prompt,
                feedback,
            })
        }
        Err(e) => Err(audit_model_error(ctx, kind, e, prompt.len())),
    }
}

fn audit_model_error(
    ctx: &AgentContext,
    kind: AgentKind,
    error: ModelError,
    prompt_length: usize,
) -> EngineError {
    let payload = json!({
        "error": error.to_string(),
        "error_type": error.kind(),
        "prompt_length": prompt_length,
    });
    if let Err(e) = ctx
        .audit
        .append("agent_error_model", kind.name(), Recipient::agent("system"), payload)
    {
        warn!(project = %ctx.project, agent = kind.name(), error = %e, "Could not audit model error");
    }
    error.into()
}

async fn memory_section(ctx: &AgentContext, query: &str, k: usize) -> String {
    let Some(memory) = &ctx.memory else {
        return String::new();
    };
    match memory.search(query, k).await {
        Ok(hits) if !hits.is_empty() => format!("\n[Relevant Memory]:\n{}\n", hits.join("\n")),
        Ok(_) => String::new(),
        Err(e) => {
            warn!(project = %ctx.project, error = %e, "Memory search failed; continuing without it");
            String::new()
        }
    }
}

/// Store the lasting facts of `text` in memory when auto-memory is on.
///
/// Each fact becomes one `label: fact` note. If extraction fails or finds
/// nothing, a single excerpt is stored instead.
pub(crate) async fn remember(ctx: &AgentContext, label: &str, text: &str) {
    let Some(memory) = &ctx.memory else {
        return;
    };
    let facts = match extract_facts(ctx, text).await {
        Ok(facts) => facts,
        Err(e) => {
            warn!(project = %ctx.project, error = %e, "Fact extraction failed; storing an excerpt");
            Vec::new()
        }
    };
    let notes: Vec<String> = if facts.is_empty() {
        vec![format!("{}: {}", label, truncate_chars(text, 300))]
    } else {
        facts.iter().map(|fact| format!("{}: {}", label, fact)).collect()
    };
    for note in &notes {
        if let Err(e) = memory.add(note).await {
            warn!(project = %ctx.project, error = %e, "Memory add failed");
        }
    }
    debug!(project = %ctx.project, label, notes = notes.len(), "Memory updated");
}

async fn extract_facts(ctx: &AgentContext, text: &str) -> Result<Vec<String>, ModelError> {
    let prompt = format!(
        "Extract the key factual statements from the text below that a story's long-term \
         memory should keep: character traits and relationships, world rules and \
         constraints, important events and decisions, setting details that matter.\n\n\
         Text:\n\"\"\"{}\"\"\"\n\n\
         Return the facts as a numbered list of short standalone sentences. \
         No commentary, explanation or headings.",
        truncate_chars(text, FACT_SOURCE_CHARS)
    );
    let mut model = ctx.model.clone();
    model.defaults.temperature = 0.2;
    let reply = model.generate(&prompt, None).await?;
    Ok(parse_facts(&reply))
}

fn list_marker() -> &'static Regex {
    static MARKER: OnceLock<Regex> = OnceLock::new();
    MARKER.get_or_init(|| Regex::new(r"^(?:[0-9]+[.)]|[-*•])\s*").expect("Invalid list marker pattern"))
}

/// One fact per non-empty line, list markers stripped.
pub(crate) fn parse_facts(reply: &str) -> Vec<String> {
    reply
        .lines()
        .map(|line| list_marker().replace(line.trim(), "").trim().to_string())
        .filter(|fact| !fact.is_empty())
        .take(MAX_FACTS)
        .collect()
}

pub(crate) fn truncate_chars(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted model and context builders shared by agent tests

    use std::sync::Mutex;

    use super::*;
    use crate::llm::{self, GenerationParams, TextGenerator};

    /// Records prompts and answers with a fixed reply
    pub struct Scripted {
        pub reply: String,
        pub prompts: Mutex<Vec<String>>,
    }

    impl Scripted {
        pub fn new(reply: &str) -> Arc<Self> {
            Arc::new(Self {
                reply: reply.to_string(),
                prompts: Mutex::new(Vec::new()),
            })
        }

        pub fn last_prompt(&self) -> String {
            self.prompts.lock().unwrap().last().cloned().unwrap_or_default()
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, prompt: &str, _params: &GenerationParams) -> llm::Result<String> {
            self.prompts.lock().unwrap().push(prompt.to_string());
            Ok(self.reply.clone())
        }
    }

    pub fn context(dir: &tempfile::TempDir, generator: Arc<dyn TextGenerator>) -> AgentContext {
        AgentContext {
            project: "demo".to_string(),
            bus: Arc::new(EventBus::new("demo")),
            audit: Arc::new(AuditLog::open(dir.path().join("audit.jsonl"), "demo", 0).unwrap()),
            model: ModelEndpoint::new(generator, GenerationParams::default()),
            memory: None,
            feedback_window: 10,
            delivered: Arc::new(FeedbackLedger::default()),
        }
    }
}
