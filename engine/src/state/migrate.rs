//! Conversion from the flat single-file project format
//!
//! Old files keep agent outputs at the top level (`outline`, `world`, ...),
//! call metadata `meta` and UI inputs `inputs`, and store naive timestamps.
//! They carry either no `version` or `"1.0.0"`. A document without a
//! `version` that already uses the current sections is treated as current.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;

use super::{
    AgentOutputs, ContinuityNote, PipelineResult, ProjectMetadata, ProjectState, SCHEMA_VERSION,
};

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyState {
    project_name: Option<String>,
    meta: Option<ProjectMetadata>,
    outline: String,
    world: String,
    characters: String,
    pipeline_outline: String,
    pipeline_world: String,
    pipeline_characters: String,
    scene_continuity: String,
    pipeline_results: Vec<LegacyPipelineResult>,
    inputs: BTreeMap<String, serde_json::Value>,
    created_at: Option<String>,
    updated_at: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LegacyPipelineResult {
    pipeline_type: String,
    timestamp: Option<String>,
    result: serde_json::Value,
}

/// Sections only the current schema has
const CURRENT_SECTIONS: [&str; 4] = ["agent_outputs", "metadata", "continuity_notes", "ui_inputs"];

/// True when a parsed state document is not in the current schema.
pub(super) fn is_legacy(doc: &serde_json::Value) -> bool {
    match doc.get("version").and_then(|v| v.as_str()) {
        Some(version) => version != SCHEMA_VERSION,
        None => !CURRENT_SECTIONS.iter().any(|key| doc.get(key).is_some()),
    }
}

fn parse_timestamp(raw: Option<&str>, fallback: DateTime<Utc>) -> DateTime<Utc> {
    let Some(raw) = raw else {
        return fallback;
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.with_timezone(&Utc);
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .unwrap_or(fallback)
}

fn prefer(primary: String, secondary: String) -> String {
    if primary.trim().is_empty() {
        secondary
    } else {
        primary
    }
}

/// Build a current-schema state from a legacy document.
pub(super) fn migrate(
    doc: serde_json::Value,
    project: &str,
) -> Result<ProjectState, serde_json::Error> {
    let legacy: LegacyState = serde_json::from_value(doc)?;
    let now = Utc::now();
    let created_at = parse_timestamp(legacy.created_at.as_deref(), now);
    let updated_at = parse_timestamp(legacy.updated_at.as_deref(), created_at);

    let pipeline_results = legacy
        .pipeline_results
        .into_iter()
        .map(|r| PipelineResult {
            pipeline_type: r.pipeline_type,
            timestamp: parse_timestamp(r.timestamp.as_deref(), created_at),
            result: r.result,
        })
        .collect();

    let mut continuity_notes = Vec::new();
    if !legacy.scene_continuity.trim().is_empty() {
        continuity_notes.push(ContinuityNote {
            timestamp: updated_at,
            note: legacy.scene_continuity,
        });
    }

    let ui_inputs = legacy
        .inputs
        .into_iter()
        .filter_map(|(k, v)| match v {
            serde_json::Value::String(s) => Some((k, s)),
            serde_json::Value::Null => None,
            other => Some((k, other.to_string())),
        })
        .collect();

    Ok(ProjectState {
        version: SCHEMA_VERSION.to_string(),
        project_name: legacy
            .project_name
            .unwrap_or_else(|| project.to_string()),
        metadata: legacy.meta.unwrap_or_default(),
        agent_outputs: AgentOutputs {
            outline: prefer(legacy.outline, legacy.pipeline_outline),
            world: prefer(legacy.world, legacy.pipeline_world),
            characters: prefer(legacy.characters, legacy.pipeline_characters),
        },
        pipeline_results,
        continuity_notes,
        ui_inputs,
        created_at,
        updated_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_migrate_flat_document() {
        let doc = json!({
            "project_name": "skyhold",
            "version": "1.0.0",
            "meta": {"genre": "Fantasy", "tone": "Light", "themes": "Home", "setting": "Clouds"},
            "outline": "",
            "pipeline_outline": "Act I",
            "world": "Floating isles",
            "inputs": {"seed_idea_plot": "A city in the clouds", "empty": null},
            "pipeline_results": [
                {"pipeline_type": "story_bible", "timestamp": "2024-03-01T10:00:00.123456", "result": {"outline": "Act I"}}
            ],
            "created_at": "2024-03-01T09:00:00"
        });

        assert!(is_legacy(&doc));
        let state = migrate(doc, "ignored").unwrap();
        assert_eq!(state.version, SCHEMA_VERSION);
        assert_eq!(state.project_name, "skyhold");
        assert_eq!(state.metadata.genre, "Fantasy");
        assert_eq!(state.agent_outputs.outline, "Act I");
        assert_eq!(state.agent_outputs.world, "Floating isles");
        assert_eq!(state.pipeline_results.len(), 1);
        assert_eq!(
            state.ui_inputs.get("seed_idea_plot").map(String::as_str),
            Some("A city in the clouds")
        );
        assert!(!state.ui_inputs.contains_key("empty"));
        assert_eq!(
            state.created_at.format("%Y-%m-%d %H:%M").to_string(),
            "2024-03-01 09:00"
        );
    }

    #[test]
    fn test_versionless_current_document_is_not_legacy() {
        let doc = json!({
            "project_name": "skyhold",
            "agent_outputs": {"outline": "Act I", "world": "", "characters": ""},
            "pipeline_results": []
        });
        assert!(!is_legacy(&doc));
        assert!(is_legacy(&json!({"project_name": "skyhold", "outline": "Act I"})));
        assert!(is_legacy(&json!({"version": "1.0.0", "metadata": {}})));
    }

    #[test]
    fn test_versionless_minimal_document() {
        let doc = json!({"outline": "x"});
        let state = migrate(doc, "fallback").unwrap();
        assert_eq!(state.project_name, "fallback");
        assert_eq!(state.metadata, ProjectMetadata::default());
    }
}
