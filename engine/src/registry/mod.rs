//! Project registry
//!
//! The only place per-project resources are constructed. Each resource is
//! created on first use and cached, so every caller asking for the same
//! project gets the same event bus, audit log, state handle, stores and
//! producer.
//!
//! # Examples
//!
//! ```no_run
//! use inkwell_engine::config::Config;
//! use inkwell_engine::registry::{ModelProvider, ProjectRegistry};
//!
//! # fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! let models = ModelProvider::from_config(&config.model)?;
//! let registry = ProjectRegistry::new(config, models);
//!
//! let bus = registry.event_bus("skyhold")?;
//! assert!(std::sync::Arc::ptr_eq(&bus, &registry.event_bus("skyhold")?));
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sdk::errors::{EngineError, EngineResult};
use tracing::{debug, info, warn};

use crate::audit::AuditLog;
use crate::conductor::{ProjectHandles, Producer};
use crate::config::{Config, ModelConfig};
use crate::event_bus::EventBus;
use crate::graph::GraphStore;
use crate::llm::openai::OpenAiCompatClient;
use crate::llm::retry::{Resilient, RetryPolicy};
use crate::llm::{Embedder, GenerationParams, ModelEndpoint, TextGenerator};
use crate::memory::VectorMemory;
use crate::outputs::OutputManager;
use crate::state::{validate_project_name, LegacyPaths, ProjectPaths, StateHandle};
use crate::tasks::TaskStore;

/// Model capabilities shared by every project
#[derive(Clone)]
pub struct ModelProvider {
    pub generator: Arc<dyn TextGenerator>,
    pub embedder: Arc<dyn Embedder>,
    pub defaults: GenerationParams,
}

impl ModelProvider {
    pub fn new(generator: Arc<dyn TextGenerator>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            generator,
            embedder,
            defaults: GenerationParams::default(),
        }
    }

    /// HTTP client for the configured endpoints, with timeouts and retries.
    pub fn from_config(config: &ModelConfig) -> EngineResult<Self> {
        let client = Arc::new(OpenAiCompatClient::from_config(config)?);
        let policy = RetryPolicy::from_config(config);
        Ok(Self {
            generator: Arc::new(Resilient::new(Arc::clone(&client), policy)),
            embedder: Arc::new(Resilient::new(client, policy)),
            defaults: GenerationParams::from_config(config),
        })
    }

    pub fn endpoint(&self) -> ModelEndpoint {
        ModelEndpoint::new(Arc::clone(&self.generator), self.defaults.clone())
    }
}

type Cell<T> = Mutex<Option<Arc<T>>>;

/// Cached resources of one project
struct ProjectSlot {
    paths: ProjectPaths,
    bus: Cell<EventBus>,
    audit: Cell<AuditLog>,
    state: Cell<StateHandle>,
    memory: Cell<VectorMemory>,
    graph: Cell<GraphStore>,
    tasks: Cell<TaskStore>,
    outputs: Cell<OutputManager>,
    producer: Cell<Producer>,
}

impl ProjectSlot {
    fn new(paths: ProjectPaths) -> Self {
        Self {
            paths,
            bus: Mutex::new(None),
            audit: Mutex::new(None),
            state: Mutex::new(None),
            memory: Mutex::new(None),
            graph: Mutex::new(None),
            tasks: Mutex::new(None),
            outputs: Mutex::new(None),
            producer: Mutex::new(None),
        }
    }
}

/// Return the cached value or build, cache and return it. Failed builds are
/// not cached.
fn cached<T>(cell: &Cell<T>, build: impl FnOnce() -> EngineResult<T>) -> EngineResult<Arc<T>> {
    let mut guard = cell.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = guard.as_ref() {
        return Ok(Arc::clone(existing));
    }
    let value = Arc::new(build()?);
    *guard = Some(Arc::clone(&value));
    Ok(value)
}

pub struct ProjectRegistry {
    config: Config,
    models: ModelProvider,
    legacy: LegacyPaths,
    projects: Mutex<HashMap<String, Arc<ProjectSlot>>>,
}

impl ProjectRegistry {
    pub fn new(config: Config, models: ModelProvider) -> Self {
        let legacy = LegacyPaths::new(&config.storage.legacy_dir);
        Self {
            config,
            models,
            legacy,
            projects: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn models(&self) -> &ModelProvider {
        &self.models
    }

    fn projects(&self) -> MutexGuard<'_, HashMap<String, Arc<ProjectSlot>>> {
        self.projects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn slot(&self, project: &str) -> EngineResult<Arc<ProjectSlot>> {
        validate_project_name(project).map_err(EngineError::Validation)?;
        let mut projects = self.projects();
        if let Some(slot) = projects.get(project) {
            return Ok(Arc::clone(slot));
        }
        let paths = ProjectPaths::for_project(&self.config.core.data_dir, project);
        paths.ensure_directories()?;
        let slot = Arc::new(ProjectSlot::new(paths));
        projects.insert(project.to_string(), Arc::clone(&slot));
        debug!(project, "Project registered");
        Ok(slot)
    }

    pub fn paths(&self, project: &str) -> EngineResult<ProjectPaths> {
        Ok(self.slot(project)?.paths.clone())
    }

    pub fn event_bus(&self, project: &str) -> EngineResult<Arc<EventBus>> {
        let slot = self.slot(project)?;
        cached(&slot.bus, || {
            Ok(EventBus::with_capacity(
                project,
                self.config.storage.event_buffer_size,
            ))
        })
    }

    pub fn audit_log(&self, project: &str) -> EngineResult<Arc<AuditLog>> {
        let slot = self.slot(project)?;
        cached(&slot.audit, || {
            AuditLog::open(
                &slot.paths.audit,
                project,
                self.config.storage.audit_rotate_bytes,
            )
        })
    }

    /// State handle, loaded (or migrated) from disk on first use.
    ///
    /// A corrupt state file is reported every time it is asked for and is
    /// never replaced with a fresh state.
    pub fn state(&self, project: &str) -> EngineResult<Arc<StateHandle>> {
        let slot = self.slot(project)?;
        cached(&slot.state, || {
            StateHandle::open(slot.paths.clone(), Some(&self.legacy), project)
        })
    }

    pub fn memory(&self, project: &str) -> EngineResult<Arc<VectorMemory>> {
        let slot = self.slot(project)?;
        cached(&slot.memory, || {
            VectorMemory::open(slot.paths.clone(), Arc::clone(&self.models.embedder))
        })
    }

    pub fn graph(&self, project: &str) -> EngineResult<Arc<GraphStore>> {
        let slot = self.slot(project)?;
        cached(&slot.graph, || GraphStore::open(&slot.paths.graph))
    }

    pub fn tasks(&self, project: &str) -> EngineResult<Arc<TaskStore>> {
        let slot = self.slot(project)?;
        cached(&slot.tasks, || TaskStore::open(&slot.paths.tasks, project))
    }

    pub fn outputs(&self, project: &str) -> EngineResult<Arc<OutputManager>> {
        let slot = self.slot(project)?;
        cached(&slot.outputs, || Ok(OutputManager::new(&slot.paths)))
    }

    /// Every resource a producer needs, all from this registry's caches.
    pub fn handles(&self, project: &str) -> EngineResult<ProjectHandles> {
        Ok(ProjectHandles {
            bus: self.event_bus(project)?,
            audit: self.audit_log(project)?,
            state: self.state(project)?,
            graph: self.graph(project)?,
            tasks: self.tasks(project)?,
            outputs: self.outputs(project)?,
            memory: self.memory(project)?,
        })
    }

    pub fn producer(&self, project: &str) -> EngineResult<Arc<Producer>> {
        let slot = self.slot(project)?;
        cached(&slot.producer, || {
            let handles = self.handles(project)?;
            info!(project, "Producer ready");
            Ok(Producer::new(
                project,
                handles,
                self.models.endpoint(),
                self.config.pipeline.clone(),
            ))
        })
    }

    /// Drop every cached resource of `project`. On-disk data is untouched;
    /// the next access reloads state and audit from disk with an empty bus.
    ///
    /// Returns whether the project was loaded.
    pub fn clear_project(&self, project: &str) -> bool {
        let removed = self.projects().remove(project).is_some();
        if removed {
            info!(project, "Project cleared from registry");
        }
        removed
    }

    /// Names of projects with live resources, sorted.
    pub fn projects_loaded(&self) -> Vec<String> {
        let mut names: Vec<String> = self.projects().keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of projects that have a directory under the data dir, sorted.
    pub fn known_projects(&self) -> EngineResult<Vec<String>> {
        let dir = &self.config.core.data_dir;
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                warn!(path = ?entry.path(), "Skipping project directory with a non UTF-8 name");
                continue;
            };
            if validate_project_name(&name).is_ok() {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}
