//! Project knowledge graph
//!
//! Entities grouped by type, relationships between them, timeline events and
//! the canon rules derived from critiques. Persisted as `graph.json` with a
//! full atomic rewrite after every change. A change whose rewrite fails is
//! not applied in memory either.
//!
//! Canon rules are append-only. The only way to drop or edit one is an
//! explicit [`GraphStore::replace_canon_rules`] / [`GraphStore::replace_graph`]
//! call from an admin action.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use sdk::errors::EngineResult;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::persist;

/// Entity kinds every graph starts with
pub const ENTITY_TYPES: [&str; 5] = ["character", "location", "faction", "artifact", "concept"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub from_id: String,
    pub to_id: String,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub order: Option<i64>,
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub involved_entities: Vec<String>,
}

/// A derived normative statement constraining future generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonRule {
    pub id: String,
    pub rule: String,
    /// Critique or task id the rule came from
    pub source: String,
    pub confidence: f32,
    #[serde(default)]
    pub scope: Vec<String>,
    #[serde(default)]
    pub notes: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    #[serde(default)]
    pub entities: BTreeMap<String, BTreeMap<String, Entity>>,
    #[serde(default)]
    pub relationships: Vec<Relationship>,
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
    #[serde(default)]
    pub canon_rules: Vec<CanonRule>,
}

impl Default for Graph {
    fn default() -> Self {
        Self {
            entities: ENTITY_TYPES
                .iter()
                .map(|t| (t.to_string(), BTreeMap::new()))
                .collect(),
            relationships: Vec::new(),
            events: Vec::new(),
            canon_rules: Vec::new(),
        }
    }
}

/// Collapse whitespace so trivially different spellings of a rule compare equal.
pub fn normalize_rule(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub struct GraphStore {
    path: PathBuf,
    graph: Mutex<Graph>,
}

impl GraphStore {
    pub fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let graph = persist::read_json(&path)?.unwrap_or_default();
        Ok(Self {
            path,
            graph: Mutex::new(graph),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Graph> {
        self.graph.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn save(&self, graph: &Graph) -> EngineResult<()> {
        persist::write_json_atomic(&self.path, graph)
    }

    /// Apply `change` to a copy, persist the copy, then swap it in.
    fn update<T>(&self, change: impl FnOnce(&mut Graph) -> T) -> EngineResult<T> {
        let mut graph = self.lock();
        let mut next = graph.clone();
        let out = change(&mut next);
        self.save(&next)?;
        *graph = next;
        Ok(out)
    }

    /// Insert or replace an entity, keyed by type and id.
    pub fn add_entity(&self, entity: Entity) -> EngineResult<()> {
        self.update(|graph| {
            graph
                .entities
                .entry(entity.entity_type.clone())
                .or_default()
                .insert(entity.id.clone(), entity);
        })
    }

    pub fn get_entity(&self, entity_type: &str, id: &str) -> Option<Entity> {
        self.lock()
            .entities
            .get(entity_type)
            .and_then(|m| m.get(id))
            .cloned()
    }

    pub fn entities_of_type(&self, entity_type: &str) -> Vec<Entity> {
        self.lock()
            .entities
            .get(entity_type)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        rel_type: &str,
        description: &str,
    ) -> EngineResult<()> {
        let relationship = Relationship {
            id: format!("{}->{}:{}", from_id, to_id, rel_type),
            from_id: from_id.to_string(),
            to_id: to_id.to_string(),
            rel_type: rel_type.to_string(),
            description: description.to_string(),
        };
        if self.lock().relationships.iter().any(|r| r.id == relationship.id) {
            return Ok(());
        }
        self.update(|graph| graph.relationships.push(relationship))
    }

    pub fn relationships_for(&self, entity_id: &str) -> Vec<Relationship> {
        self.lock()
            .relationships
            .iter()
            .filter(|r| r.from_id == entity_id || r.to_id == entity_id)
            .cloned()
            .collect()
    }

    /// Append a timeline event, replacing one with the same id.
    pub fn add_event(&self, event: TimelineEvent) -> EngineResult<()> {
        self.update(|graph| match graph.events.iter_mut().find(|e| e.id == event.id) {
            Some(existing) => *existing = event,
            None => graph.events.push(event),
        })
    }

    pub fn events(&self) -> Vec<TimelineEvent> {
        self.lock().events.clone()
    }

    /// Append a canon rule unless one with the same normalized text exists.
    ///
    /// Returns whether the rule was added.
    pub fn add_canon_rule(&self, mut rule: CanonRule) -> EngineResult<bool> {
        rule.rule = normalize_rule(&rule.rule);
        if rule.rule.is_empty() {
            return Ok(false);
        }
        let known = |graph: &Graph| graph.canon_rules.iter().any(|r| r.rule == rule.rule);
        if known(&*self.lock()) {
            return Ok(false);
        }
        self.update(|graph| {
            let added = !known(graph);
            if added {
                graph.canon_rules.push(rule.clone());
            }
            added
        })
    }

    pub fn canon_rules(&self) -> Vec<CanonRule> {
        self.lock().canon_rules.clone()
    }

    /// Admin operation: overwrite the whole canon rule list.
    pub fn replace_canon_rules(&self, rules: Vec<CanonRule>) -> EngineResult<()> {
        let after = rules.len();
        let before = self.update(|graph| std::mem::replace(&mut graph.canon_rules, rules).len())?;
        info!(path = ?self.path, before, after, "Canon rules replaced");
        Ok(())
    }

    /// Admin operation: overwrite the whole graph.
    pub fn replace_graph(&self, new_graph: Graph) -> EngineResult<()> {
        self.update(|graph| *graph = new_graph)?;
        info!(path = ?self.path, "Graph replaced");
        Ok(())
    }

    pub fn snapshot(&self) -> Graph {
        self.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn rule(text: &str) -> CanonRule {
        CanonRule {
            id: uuid::Uuid::new_v4().to_string(),
            rule: text.to_string(),
            source: "critique-1".to_string(),
            confidence: 0.8,
            scope: Vec::new(),
            notes: String::new(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_new_graph_has_entity_buckets() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(dir.path().join("graph.json")).unwrap();
        let graph = store.snapshot();
        for t in ENTITY_TYPES {
            assert!(graph.entities.contains_key(t));
        }
    }

    #[test]
    fn test_canon_rule_exact_dedup() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(dir.path().join("graph.json")).unwrap();
        assert!(store.add_canon_rule(rule("Magic must cost blood.")).unwrap());
        assert!(!store.add_canon_rule(rule("Magic  must cost\tblood.")).unwrap());
        assert!(store.add_canon_rule(rule("Magic must always cost blood.")).unwrap());
        assert_eq!(store.canon_rules().len(), 2);
    }

    #[test]
    fn test_persistence_and_relationships() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("graph.json");
        {
            let store = GraphStore::open(&path).unwrap();
            store
                .add_entity(Entity {
                    id: "mira".into(),
                    entity_type: "character".into(),
                    name: "Mira".into(),
                    summary: "Sky pilot".into(),
                    tags: vec![],
                    attributes: BTreeMap::new(),
                })
                .unwrap();
            store
                .add_relationship("mira", "skyhold", "lives_in", "")
                .unwrap();
            store.add_canon_rule(rule("Rule: no engines at night")).unwrap();
        }
        let store = GraphStore::open(&path).unwrap();
        assert_eq!(store.get_entity("character", "mira").unwrap().name, "Mira");
        assert_eq!(store.relationships_for("skyhold").len(), 1);
        assert_eq!(store.canon_rules().len(), 1);

        store.replace_canon_rules(Vec::new()).unwrap();
        assert!(GraphStore::open(&path).unwrap().canon_rules().is_empty());
    }

    #[test]
    fn test_events_and_relationships_are_keyed_by_id() {
        let dir = TempDir::new().unwrap();
        let store = GraphStore::open(dir.path().join("graph.json")).unwrap();
        let event = |summary: &str| TimelineEvent {
            id: "chapter-1".into(),
            name: "Arrival".into(),
            summary: summary.into(),
            order: Some(1),
            time: None,
            involved_entities: vec![],
        };
        store.add_event(event("first draft")).unwrap();
        store.add_event(event("revised")).unwrap();
        assert_eq!(store.events().len(), 1);
        assert_eq!(store.events()[0].summary, "revised");

        store.add_relationship("mira", "chapter-1", "appears_in", "").unwrap();
        store.add_relationship("mira", "chapter-1", "appears_in", "").unwrap();
        assert_eq!(store.relationships_for("mira").len(), 1);
    }

    #[test]
    fn test_failed_save_leaves_graph_unchanged() {
        let dir = TempDir::new().unwrap();
        let home = dir.path().join("skyhold");
        let store = GraphStore::open(home.join("graph.json")).unwrap();
        assert!(store.add_canon_rule(rule("Kites must stay tethered.")).unwrap());

        // A file where the project directory should be makes every write fail
        std::fs::remove_dir_all(&home).unwrap();
        std::fs::write(&home, "not a directory").unwrap();

        assert!(store.add_canon_rule(rule("Engines must never run at night.")).is_err());
        assert!(store
            .add_relationship("mira", "skyhold", "lives_in", "")
            .is_err());
        assert_eq!(store.canon_rules().len(), 1);
        assert!(store.relationships_for("mira").is_empty());

        // The rule that failed to persist can be added once storage is back
        std::fs::remove_file(&home).unwrap();
        assert!(store.add_canon_rule(rule("Engines must never run at night.")).unwrap());
        assert_eq!(store.canon_rules().len(), 2);
    }
}
