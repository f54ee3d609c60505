//! Unified per-project state
//!
//! `ProjectState` is the single snapshot behind resumable sessions: metadata,
//! the story-bible outputs, pipeline history, continuity notes and UI inputs.
//! It lives in `state.json` and is written through on every mutation via
//! [`StateHandle`]; there is no dirty flag and no deferred flush.

mod migrate;
pub mod paths;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use sdk::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::persist;
pub use paths::{validate_project_name, LegacyPaths, ProjectPaths};

/// Current on-disk schema
pub const SCHEMA_VERSION: &str = "2.0.0";

fn current_version() -> String {
    SCHEMA_VERSION.to_string()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectMetadata {
    pub genre: String,
    pub tone: String,
    pub themes: String,
    pub setting: String,
}

impl Default for ProjectMetadata {
    fn default() -> Self {
        Self {
            genre: "Sci-Fi".to_string(),
            tone: "Epic, serious".to_string(),
            themes: "Destiny, sacrifice, technology vs humanity".to_string(),
            setting: "Far future galaxy".to_string(),
        }
    }
}

/// Latest story-bible artifacts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOutputs {
    pub outline: String,
    pub world: String,
    pub characters: String,
}

/// Which story-bible slot an agent output fills
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputSlot {
    Outline,
    World,
    Characters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub pipeline_type: String,
    pub timestamp: DateTime<Utc>,
    pub result: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuityNote {
    pub timestamp: DateTime<Utc>,
    pub note: String,
}

/// Snapshot of everything a project needs to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectState {
    #[serde(default = "current_version")]
    pub version: String,
    pub project_name: String,
    #[serde(default)]
    pub metadata: ProjectMetadata,
    #[serde(default)]
    pub agent_outputs: AgentOutputs,
    #[serde(default)]
    pub pipeline_results: Vec<PipelineResult>,
    #[serde(default)]
    pub continuity_notes: Vec<ContinuityNote>,
    #[serde(default)]
    pub ui_inputs: BTreeMap<String, String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

impl ProjectState {
    pub fn new(project_name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            version: current_version(),
            project_name: project_name.into(),
            metadata: ProjectMetadata::default(),
            agent_outputs: AgentOutputs::default(),
            pipeline_results: Vec::new(),
            continuity_notes: Vec::new(),
            ui_inputs: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Load a project's state.
    ///
    /// - missing everywhere: a fresh default (nothing written)
    /// - current schema: parsed as is
    /// - old schema in place: backed up to `state.legacy.json`, migrated, saved
    /// - old flat file in `legacy`: migrated and saved to the new layout, the
    ///   flat file is left alone
    ///
    /// An unparseable file is `CorruptState` and is never overwritten.
    pub fn load(
        paths: &ProjectPaths,
        legacy: Option<&LegacyPaths>,
        project: &str,
    ) -> EngineResult<Self> {
        if let Some(doc) = persist::read_json::<serde_json::Value>(&paths.state)? {
            if !migrate::is_legacy(&doc) {
                return serde_json::from_value(doc).map_err(|e| corrupt(&paths.state, e));
            }

            if !paths.state_backup.exists() {
                std::fs::copy(&paths.state, &paths.state_backup)?;
            }
            let state = migrate::migrate(doc, project).map_err(|e| corrupt(&paths.state, e))?;
            state.save(&paths.state)?;
            info!(project, backup = ?paths.state_backup, "Migrated project state in place");
            return Ok(state);
        }

        if let Some(legacy) = legacy {
            let legacy_path = legacy.state(project);
            if let Some(doc) = persist::read_json::<serde_json::Value>(&legacy_path)? {
                let state =
                    migrate::migrate(doc, project).map_err(|e| corrupt(&legacy_path, e))?;
                state.save(&paths.state)?;
                info!(project, from = ?legacy_path, "Migrated legacy project file");
                return Ok(state);
            }
        }

        Ok(Self::new(project))
    }

    /// Atomically overwrite the snapshot. Does not touch any field, so
    /// repeated saves produce identical bytes.
    pub fn save(&self, path: &Path) -> EngineResult<()> {
        persist::write_json_atomic(path, self)
    }

    fn touch(&mut self) {
        let now = Utc::now();
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at
        };
    }

    /// Most recent result of the given pipeline kind, if any.
    pub fn last_result(&self, pipeline_type: &str) -> Option<&PipelineResult> {
        self.pipeline_results
            .iter()
            .rev()
            .find(|r| r.pipeline_type == pipeline_type)
    }
}

fn corrupt(path: &Path, err: serde_json::Error) -> EngineError {
    EngineError::CorruptState {
        path: path.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Shared, write-through access to one project's state.
///
/// Every mutator updates the in-memory copy and saves before returning. Saves
/// for one project are serialized by the handle's mutex.
pub struct StateHandle {
    paths: ProjectPaths,
    inner: Mutex<ProjectState>,
}

impl StateHandle {
    pub fn open(
        paths: ProjectPaths,
        legacy: Option<&LegacyPaths>,
        project: &str,
    ) -> EngineResult<Self> {
        let state = ProjectState::load(&paths, legacy, project)?;
        Ok(Self {
            paths,
            inner: Mutex::new(state),
        })
    }

    fn lock(&self) -> MutexGuard<'_, ProjectState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Clone of the current state
    pub fn snapshot(&self) -> ProjectState {
        self.lock().clone()
    }

    pub fn save(&self) -> EngineResult<()> {
        let state = self.lock();
        state.save(&self.paths.state)
    }

    fn mutate<F>(&self, f: F) -> EngineResult<()>
    where
        F: FnOnce(&mut ProjectState),
    {
        let mut state = self.lock();
        let before = state.clone();
        f(&mut state);
        state.touch();
        if let Err(e) = state.save(&self.paths.state) {
            warn!(project = %state.project_name, error = %e, "State save failed; change reverted");
            *state = before;
            return Err(e);
        }
        Ok(())
    }

    pub fn add_pipeline_result(
        &self,
        pipeline_type: &str,
        result: serde_json::Value,
    ) -> EngineResult<()> {
        self.mutate(|s| {
            s.pipeline_results.push(PipelineResult {
                pipeline_type: pipeline_type.to_string(),
                timestamp: Utc::now(),
                result,
            })
        })
    }

    pub fn add_continuity_note(&self, note: &str) -> EngineResult<()> {
        self.mutate(|s| {
            s.continuity_notes.push(ContinuityNote {
                timestamp: Utc::now(),
                note: note.to_string(),
            })
        })
    }

    pub fn set_agent_output(&self, slot: OutputSlot, text: &str) -> EngineResult<()> {
        self.mutate(|s| {
            let target = match slot {
                OutputSlot::Outline => &mut s.agent_outputs.outline,
                OutputSlot::World => &mut s.agent_outputs.world,
                OutputSlot::Characters => &mut s.agent_outputs.characters,
            };
            *target = text.to_string();
        })
    }

    pub fn set_ui_input(&self, key: &str, value: &str) -> EngineResult<()> {
        self.mutate(|s| {
            s.ui_inputs.insert(key.to_string(), value.to_string());
        })
    }

    pub fn set_metadata(&self, metadata: ProjectMetadata) -> EngineResult<()> {
        self.mutate(|s| s.metadata = metadata)
    }

    pub fn pipeline_results(&self) -> Vec<PipelineResult> {
        self.lock().pipeline_results.clone()
    }

    pub fn continuity_notes(&self) -> Vec<ContinuityNote> {
        self.lock().continuity_notes.clone()
    }
}
