//! Pipeline requests and chapter planning

use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;
use sdk::errors::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

use crate::state::ProjectMetadata;

/// Named pipeline kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineKind {
    StoryBible,
    Chapter,
    FullStory,
    DirectorMode,
}

impl PipelineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineKind::StoryBible => "story_bible",
            PipelineKind::Chapter => "chapter",
            PipelineKind::FullStory => "full_story",
            PipelineKind::DirectorMode => "director_mode",
        }
    }
}

impl fmt::Display for PipelineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "story_bible" => Ok(PipelineKind::StoryBible),
            "chapter" => Ok(PipelineKind::Chapter),
            "full_story" => Ok(PipelineKind::FullStory),
            "director_mode" | "director" => Ok(PipelineKind::DirectorMode),
            other => Err(EngineError::Validation(format!(
                "unknown pipeline '{}' (expected story_bible, chapter, full_story or director_mode)",
                other
            ))),
        }
    }
}

/// Story idea plus optional overrides of the project metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoryIdea {
    pub idea: String,
    #[serde(default)]
    pub genre: Option<String>,
    #[serde(default)]
    pub tone: Option<String>,
    #[serde(default)]
    pub themes: Option<String>,
    #[serde(default)]
    pub setting: Option<String>,
}

impl StoryIdea {
    pub fn new(idea: impl Into<String>) -> Self {
        Self {
            idea: idea.into(),
            ..Self::default()
        }
    }

    /// Project metadata with this idea's overrides applied.
    pub fn resolve(&self, base: &ProjectMetadata) -> ProjectMetadata {
        ProjectMetadata {
            genre: self.genre.clone().unwrap_or_else(|| base.genre.clone()),
            tone: self.tone.clone().unwrap_or_else(|| base.tone.clone()),
            themes: self.themes.clone().unwrap_or_else(|| base.themes.clone()),
            setting: self.setting.clone().unwrap_or_else(|| base.setting.clone()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChapterInput {
    pub outline_excerpt: String,
    /// Scene goal; the excerpt is used when absent
    #[serde(default)]
    pub goal: Option<String>,
    /// Chapter number to save under; next free number when absent
    #[serde(default)]
    pub chapter_index: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullStoryInput {
    #[serde(flatten)]
    pub idea: StoryIdea,
    #[serde(default)]
    pub max_chapters: Option<usize>,
}

/// A full story followed by critique/revise passes over every chapter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectorInput {
    #[serde(flatten)]
    pub idea: StoryIdea,
    #[serde(default)]
    pub max_chapters: Option<usize>,
    /// Revision passes; capped by the configured maximum
    #[serde(default)]
    pub max_passes: Option<usize>,
}

/// Typed input for each pipeline kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "pipeline", rename_all = "snake_case")]
pub enum PipelineRequest {
    StoryBible(StoryIdea),
    Chapter(ChapterInput),
    FullStory(FullStoryInput),
    DirectorMode(DirectorInput),
}

impl PipelineRequest {
    pub fn kind(&self) -> PipelineKind {
        match self {
            PipelineRequest::StoryBible(_) => PipelineKind::StoryBible,
            PipelineRequest::Chapter(_) => PipelineKind::Chapter,
            PipelineRequest::FullStory(_) => PipelineKind::FullStory,
            PipelineRequest::DirectorMode(_) => PipelineKind::DirectorMode,
        }
    }

    /// Reject bad input before any step runs.
    pub fn validate(&self, max_chapters: usize) -> EngineResult<()> {
        match self {
            PipelineRequest::StoryBible(idea) => require("idea", &idea.idea),
            PipelineRequest::FullStory(input) => {
                validate_story(&input.idea, input.max_chapters, max_chapters)
            }
            PipelineRequest::DirectorMode(input) => {
                validate_story(&input.idea, input.max_chapters, max_chapters)
            }
            PipelineRequest::Chapter(input) => {
                require("outline_excerpt", &input.outline_excerpt)?;
                if input.chapter_index == Some(0) {
                    return Err(EngineError::Validation(
                        "chapter_index starts at 1".into(),
                    ));
                }
                Ok(())
            }
        }
    }

    /// Story idea behind the request; a single chapter has none.
    pub fn idea(&self) -> Option<&StoryIdea> {
        match self {
            PipelineRequest::StoryBible(idea) => Some(idea),
            _ => self.story().map(|(idea, _)| idea),
        }
    }

    /// Idea and chapter cap of the requests that write a whole story.
    pub fn story(&self) -> Option<(&StoryIdea, Option<usize>)> {
        match self {
            PipelineRequest::FullStory(input) => Some((&input.idea, input.max_chapters)),
            PipelineRequest::DirectorMode(input) => Some((&input.idea, input.max_chapters)),
            _ => None,
        }
    }
}

fn validate_story(idea: &StoryIdea, requested: Option<usize>, limit: usize) -> EngineResult<()> {
    require("idea", &idea.idea)?;
    match requested {
        Some(0) => Err(EngineError::Validation(
            "max_chapters must be at least 1".into(),
        )),
        Some(n) if n > limit => Err(EngineError::Validation(format!(
            "max_chapters {} exceeds the configured limit of {}",
            n, limit
        ))),
        _ => Ok(()),
    }
}

fn require(field: &str, value: &str) -> EngineResult<()> {
    if value.trim().is_empty() {
        Err(EngineError::Validation(format!("{} must not be empty", field)))
    } else {
        Ok(())
    }
}

/// One planned chapter of a full story
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChapterPlan {
    /// 1-based
    pub index: usize,
    pub title: String,
    pub excerpt: String,
}

/// Split an outline into at most `max` chapter excerpts.
///
/// Tries, in order: chapter/act/part headings, numbered items,
/// blank-line separated blocks. Falls back to the whole outline as a single
/// chapter.
pub fn plan_chapters(outline: &str, max: usize) -> Vec<ChapterPlan> {
    let outline = outline.trim();
    if outline.is_empty() || max == 0 {
        return Vec::new();
    }

    let heading = heading_regex();
    let item = item_regex();
    let blocks = split_on(outline, |line| heading.is_match(line))
        .filter(|b| b.len() > 1)
        .or_else(|| split_on(outline, |line| item.is_match(line)).filter(|b| b.len() > 1))
        .unwrap_or_else(|| {
            outline
                .split("\n\n")
                .map(str::trim)
                .filter(|b| !b.is_empty())
                .map(str::to_string)
                .collect()
        });

    blocks
        .into_iter()
        .take(max)
        .enumerate()
        .map(|(i, block)| {
            let title = block
                .lines()
                .next()
                .map(|l| l.trim().trim_start_matches(['#', '-', '*', ' ']).to_string())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| format!("Chapter {}", i + 1));
            ChapterPlan {
                index: i + 1,
                title,
                excerpt: block,
            }
        })
        .collect()
}

static HEADING: OnceLock<Regex> = OnceLock::new();
static NUMBERED_ITEM: OnceLock<Regex> = OnceLock::new();

/// "Chapter 3", "ACT II", "## Part One"
fn heading_regex() -> &'static Regex {
    HEADING.get_or_init(|| {
        Regex::new(r"(?i)^\s*(#+\s*)?(chapter|act|part)\s+([0-9]+|[ivxlc]+|one|two|three|four|five)\b")
            .expect("Invalid heading pattern")
    })
}

/// "1. Arrival", "2) Storm"
fn item_regex() -> &'static Regex {
    NUMBERED_ITEM
        .get_or_init(|| Regex::new(r"^\s*[0-9]+[.)]\s+\S").expect("Invalid item pattern"))
}

/// Blocks starting at each line that matches `starts`. Text before the first
/// match is kept with the first block.
fn split_on(text: &str, starts: impl Fn(&str) -> bool) -> Option<Vec<String>> {
    let mut blocks: Vec<Vec<&str>> = Vec::new();
    let mut preamble: Vec<&str> = Vec::new();
    for line in text.lines() {
        if starts(line) {
            blocks.push(vec![line]);
        } else if let Some(current) = blocks.last_mut() {
            current.push(line);
        } else {
            preamble.push(line);
        }
    }
    if blocks.is_empty() {
        return None;
    }
    if preamble.iter().any(|l| !l.trim().is_empty()) {
        let mut first = preamble;
        first.append(&mut blocks[0]);
        blocks[0] = first;
    }
    Some(
        blocks
            .into_iter()
            .map(|lines| lines.join("\n").trim().to_string())
            .collect(),
    )
}
