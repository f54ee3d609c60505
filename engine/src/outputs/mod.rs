//! Chapter and draft artifacts under `outputs/`
//!
//! ```text
//! outputs/
//! ├── chapters/chapter_001.json
//! └── drafts/full_story_20250116_120000.txt
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use sdk::errors::EngineResult;
use serde_json::json;
use tracing::info;

use crate::persist;
use crate::state::ProjectPaths;

pub struct OutputManager {
    chapters_dir: PathBuf,
    drafts_dir: PathBuf,
}

fn chapter_file(index: usize) -> String {
    format!("chapter_{:03}.json", index)
}

impl OutputManager {
    pub fn new(paths: &ProjectPaths) -> Self {
        Self {
            chapters_dir: paths.chapters_dir.clone(),
            drafts_dir: paths.drafts_dir.clone(),
        }
    }

    /// Save a chapter as JSON, adding `chapter_index` and `saved_at`.
    pub fn save_chapter(&self, index: usize, data: serde_json::Value) -> EngineResult<PathBuf> {
        let mut record = match data {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("content".to_string(), other);
                map
            }
        };
        record.insert("chapter_index".to_string(), json!(index));
        record.insert("saved_at".to_string(), json!(Utc::now()));

        let path = self.chapters_dir.join(chapter_file(index));
        persist::write_json_atomic(&path, &record)?;
        info!(chapter = index, path = ?path, "Chapter saved");
        Ok(path)
    }

    pub fn load_chapter(&self, index: usize) -> EngineResult<Option<serde_json::Value>> {
        persist::read_json(&self.chapters_dir.join(chapter_file(index)))
    }

    /// Saved chapter indices in ascending order.
    pub fn list_chapters(&self) -> EngineResult<Vec<usize>> {
        let mut indices: Vec<usize> = list_dir(&self.chapters_dir)?
            .iter()
            .filter_map(|name| {
                name.strip_prefix("chapter_")
                    .and_then(|rest| rest.strip_suffix(".json"))
                    .and_then(|n| n.parse().ok())
            })
            .collect();
        indices.sort_unstable();
        Ok(indices)
    }

    /// Write `<name>_<YYYYmmdd_HHMMSS>.txt`. Never overwrites an existing draft.
    pub fn save_draft(&self, name: &str, content: &str) -> EngineResult<PathBuf> {
        fs::create_dir_all(&self.drafts_dir)?;
        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut path = self.drafts_dir.join(format!("{}_{}.txt", name, stamp));
        let mut n = 1;
        while path.exists() {
            path = self.drafts_dir.join(format!("{}_{}_{}.txt", name, stamp, n));
            n += 1;
        }
        persist::write_bytes_atomic(&path, content.as_bytes())?;
        info!(draft = name, path = ?path, "Draft snapshot saved");
        Ok(path)
    }

    /// Draft files, newest first, optionally filtered by draft name.
    pub fn list_drafts(&self, name: Option<&str>) -> EngineResult<Vec<PathBuf>> {
        let prefix = name.map(|n| format!("{}_", n));
        let mut names: Vec<String> = list_dir(&self.drafts_dir)?
            .into_iter()
            .filter(|f| f.ends_with(".txt"))
            .filter(|f| prefix.as_ref().map_or(true, |p| f.starts_with(p.as_str())))
            .collect();
        names.sort_unstable_by(|a, b| b.cmp(a));
        Ok(names.into_iter().map(|n| self.drafts_dir.join(n)).collect())
    }

    pub fn latest_draft(&self, name: &str) -> EngineResult<Option<PathBuf>> {
        Ok(self.list_drafts(Some(name))?.into_iter().next())
    }
}

fn list_dir(dir: &Path) -> EngineResult<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            if let Ok(name) = entry.file_name().into_string() {
                names.push(name);
            }
        }
    }
    Ok(names)
}
