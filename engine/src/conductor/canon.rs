//! Canon derivation
//!
//! Pulls normative statements out of free-text critiques. A critique line
//! becomes a rule when it is explicitly labelled (`Rule:`) or phrased as a
//! constraint (must, never, always, cannot, should).

use std::sync::OnceLock;

use chrono::Utc;
use regex::Regex;
use uuid::Uuid;

use crate::agents::report_passed;
use crate::graph::{normalize_rule, CanonRule};

/// Confidence for lines labelled `Rule:`
pub const LABELLED_CONFIDENCE: f32 = 0.9;
/// Confidence for must/never/always/cannot statements
pub const STRICT_CONFIDENCE: f32 = 0.8;
/// Confidence for should statements
pub const SOFT_CONFIDENCE: f32 = 0.6;

/// A candidate rule before it is stored
#[derive(Debug, Clone, PartialEq)]
pub struct DerivedRule {
    pub text: String,
    pub confidence: f32,
}

impl DerivedRule {
    pub fn into_canon_rule(self, source: &str) -> CanonRule {
        CanonRule {
            id: Uuid::new_v4().to_string(),
            rule: self.text,
            source: source.to_string(),
            confidence: self.confidence,
            scope: Vec::new(),
            notes: String::new(),
            created_at: Utc::now(),
        }
    }
}

static LABEL: OnceLock<Regex> = OnceLock::new();
static STRICT: OnceLock<Regex> = OnceLock::new();
static SOFT: OnceLock<Regex> = OnceLock::new();
static MARKER: OnceLock<Regex> = OnceLock::new();

fn label() -> &'static Regex {
    LABEL.get_or_init(|| Regex::new(r"(?i)^(canon\s+)?rule\s*:\s*").expect("Invalid label pattern"))
}

fn strict() -> &'static Regex {
    STRICT.get_or_init(|| {
        Regex::new(r"(?i)\b(must|never|always|cannot|can't|may not)\b").expect("Invalid strict pattern")
    })
}

fn soft() -> &'static Regex {
    SOFT.get_or_init(|| Regex::new(r"(?i)\bshould\b").expect("Invalid soft pattern"))
}

/// Leading list markers: "1.", "2)", "-", "*", "•"
fn marker() -> &'static Regex {
    MARKER.get_or_init(|| Regex::new(r"^\s*([0-9]+[.)]|[-*•])\s*").expect("Invalid marker pattern"))
}

/// Extract rules from one critique, in order of appearance, without
/// duplicates. A passing continuity report yields nothing.
pub fn derive_rules(critique: &str) -> Vec<DerivedRule> {
    if report_passed(critique) {
        return Vec::new();
    }

    let mut rules: Vec<DerivedRule> = Vec::new();
    for sentence in sentences(critique) {
        let Some(rule) = classify(&sentence) else {
            continue;
        };
        if !rules.iter().any(|r| r.text == rule.text) {
            rules.push(rule);
        }
    }
    rules
}

fn classify(sentence: &str) -> Option<DerivedRule> {
    if let Some(m) = label().find(sentence) {
        let text = normalize_rule(&sentence[m.end()..]);
        return (!text.is_empty()).then_some(DerivedRule {
            text,
            confidence: LABELLED_CONFIDENCE,
        });
    }

    let confidence = if strict().is_match(sentence) {
        STRICT_CONFIDENCE
    } else if soft().is_match(sentence) {
        SOFT_CONFIDENCE
    } else {
        return None;
    };
    Some(DerivedRule {
        text: normalize_rule(sentence),
        confidence,
    })
}

/// Lines with list markers stripped, further split on sentence ends.
fn sentences(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| marker().replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
        .flat_map(|line| {
            split_sentences(&line)
                .into_iter()
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .collect()
}

fn split_sentences(line: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let bytes = line.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        let at_end = i + 1 == bytes.len() || bytes[i + 1] == b' ';
        if matches!(b, b'.' | b'!' | b'?') && at_end {
            let piece = line[start..=i].trim();
            if !piece.is_empty() {
                out.push(piece);
            }
            start = i + 1;
        }
    }
    let rest = line[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}
