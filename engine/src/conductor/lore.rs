//! Lore extraction
//!
//! Keeps the knowledge graph in step with what the pipelines write: entries
//! of a character bible become `character` entities, and every finished
//! chapter becomes a timeline event linked to the characters named in it.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use regex::Regex;

use super::run::ChapterResult;
use crate::agents::truncate_chars;
use crate::graph::{Entity, TimelineEvent};

/// Entity type of characters in the graph
pub const CHARACTER: &str = "character";

/// Relationship from a character to a chapter event it appears in
pub const APPEARS_IN: &str = "appears_in";

/// Profile field labels that look like names but are not
const FIELD_LABELS: [&str; 16] = [
    "Name",
    "Role",
    "Age",
    "Appearance",
    "Personality",
    "Backstory",
    "Background",
    "Motivation",
    "Arc",
    "Traits",
    "Goal",
    "Goals",
    "Notes",
    "Summary",
    "Relationships",
    "Chapter",
];

static ENTRY: OnceLock<Regex> = OnceLock::new();

/// `Name: description`, optionally numbered, bulleted or bold
fn entry() -> &'static Regex {
    ENTRY.get_or_init(|| {
        Regex::new(
            r"^\s*(?:[0-9]+[.)]|[-*•])?\s*\**\s*([A-Z][\w'.-]*(?: [A-Z][\w'.-]*){0,3})\s*\**\s*:\s*\**\s*(.+)$",
        )
        .expect("Invalid entry pattern")
    })
}

/// Lowercase id made of the alphanumeric runs of `name`.
pub fn slug(name: &str) -> String {
    name.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

/// Characters introduced by a character bible, in order, one per name.
pub fn character_entities(bible: &str) -> Vec<Entity> {
    let mut found: Vec<Entity> = Vec::new();
    for line in bible.lines() {
        let Some(caps) = entry().captures(line) else {
            continue;
        };
        let name = caps[1].trim_end_matches(['.', '-']).to_string();
        if FIELD_LABELS.contains(&name.as_str()) {
            continue;
        }
        let id = slug(&name);
        if id.is_empty() || found.iter().any(|e| e.id == id) {
            continue;
        }
        found.push(Entity {
            id,
            entity_type: CHARACTER.to_string(),
            name,
            summary: caps[2].trim().trim_end_matches('*').trim().to_string(),
            tags: Vec::new(),
            attributes: BTreeMap::new(),
        });
    }
    found
}

/// Timeline event for a finished chapter.
pub fn chapter_event(chapter: &ChapterResult, characters: &[Entity]) -> TimelineEvent {
    let text = if chapter.final_text.is_empty() {
        &chapter.raw
    } else {
        &chapter.final_text
    };
    TimelineEvent {
        id: format!("chapter-{}", chapter.index),
        name: chapter.title.clone(),
        summary: truncate_chars(text.trim(), 200),
        order: i64::try_from(chapter.index).ok(),
        time: None,
        involved_entities: characters
            .iter()
            .filter(|c| mentions(text, &c.name))
            .map(|c| c.id.clone())
            .collect(),
    }
}

fn mentions(text: &str, name: &str) -> bool {
    Regex::new(&format!(r"\b{}\b", regex::escape(name)))
        .map(|re| re.is_match(text))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BIBLE: &str = "Main cast\n\n\
                         1. **Mira Sol**: a pilot who fears falling.\n\
                         Age: 19\n\
                         - Oren: the harbour master, Mira's uncle\n\
                         Mira Sol: appears twice\n\
                         the kites are alive: not a character";

    #[test]
    fn test_character_entries_become_entities() {
        let characters = character_entities(BIBLE);
        let names: Vec<&str> = characters.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Mira Sol", "Oren"]);
        assert_eq!(characters[0].id, "mira-sol");
        assert_eq!(characters[0].summary, "a pilot who fears falling.");
        assert_eq!(characters[1].entity_type, CHARACTER);
    }

    #[test]
    fn test_chapter_event_links_named_characters() {
        let characters = character_entities(BIBLE);
        let chapter = ChapterResult {
            index: 2,
            title: "The Storm".into(),
            raw: "draft".into(),
            continuity: String::new(),
            final_text: "Oren cuts the tethers while the storm howls.".into(),
        };
        let event = chapter_event(&chapter, &characters);
        assert_eq!(event.id, "chapter-2");
        assert_eq!(event.order, Some(2));
        assert_eq!(event.involved_entities, vec!["oren".to_string()]);
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Captain O'Hara"), "captain-o-hara");
        assert_eq!(slug("  "), "");
    }
}
