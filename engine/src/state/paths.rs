//! On-disk layout of a project

use std::fs;
use std::path::{Path, PathBuf};

use sdk::errors::EngineResult;

/// Every file a project owns, rooted at `<data_dir>/<project>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub state: PathBuf,
    pub state_backup: PathBuf,
    pub graph: PathBuf,
    pub audit: PathBuf,
    pub tasks: PathBuf,
    pub memory_dir: PathBuf,
    pub memory_index: PathBuf,
    pub memory_texts: PathBuf,
    pub memory_vectors: PathBuf,
    pub outputs_dir: PathBuf,
    pub chapters_dir: PathBuf,
    pub drafts_dir: PathBuf,
}

impl ProjectPaths {
    pub fn for_project(data_dir: &Path, project: &str) -> Self {
        let root = data_dir.join(project);
        let memory_dir = root.join("memory");
        let outputs_dir = root.join("outputs");
        Self {
            state: root.join("state.json"),
            state_backup: root.join("state.legacy.json"),
            graph: root.join("graph.json"),
            audit: root.join("audit.jsonl"),
            tasks: root.join("tasks.json"),
            memory_index: memory_dir.join("index.json"),
            memory_texts: memory_dir.join("texts.json"),
            memory_vectors: memory_dir.join("vectors.json"),
            chapters_dir: outputs_dir.join("chapters"),
            drafts_dir: outputs_dir.join("drafts"),
            memory_dir,
            outputs_dir,
            root,
        }
    }

    pub fn ensure_directories(&self) -> EngineResult<()> {
        fs::create_dir_all(&self.root)?;
        fs::create_dir_all(&self.memory_dir)?;
        Ok(())
    }
}

/// Flat files from the single-directory layout that predates per-project roots.
#[derive(Debug, Clone)]
pub struct LegacyPaths {
    dir: PathBuf,
}

impl LegacyPaths {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<legacy_dir>/<project>.json`
    pub fn state(&self, project: &str) -> PathBuf {
        self.dir.join(format!("{}.json", project))
    }
}

/// Reject names that would escape the data directory or collide with files.
pub fn validate_project_name(name: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        return Err("project name must not be empty".to_string());
    }
    if name.starts_with('.') {
        return Err(format!("project name '{}' must not start with '.'", name));
    }
    if name
        .chars()
        .any(|c| matches!(c, '/' | '\\' | ':' | '\0') || c.is_control())
    {
        return Err(format!("project name '{}' contains a path separator", name));
    }
    Ok(())
}
