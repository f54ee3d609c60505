//! Wire types shared between the engine and its front-ends

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Addressee of a bus message.
///
/// Broadcast is a distinct variant so a real agent can never collide with
/// the "everyone" address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "name")]
pub enum Recipient {
    Agent(String),
    Broadcast,
}

impl Recipient {
    /// Shorthand for addressing one agent.
    pub fn agent(name: impl Into<String>) -> Self {
        Self::Agent(name.into())
    }

    /// True when a message with this recipient should reach `agent`.
    pub fn reaches(&self, agent: &str) -> bool {
        match self {
            Self::Agent(name) => name == agent,
            Self::Broadcast => true,
        }
    }
}

impl fmt::Display for Recipient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(name) => f.write_str(name),
            Self::Broadcast => f.write_str("*"),
        }
    }
}

/// Advisory priority attached to injected feedback.
///
/// Priority is surfaced to the receiving agent but never reorders delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedbackPriority {
    Low = 1,
    Normal = 2,
    High = 3,
    Critical = 4,
    Urgent = 5,
}

impl Default for FeedbackPriority {
    fn default() -> Self {
        Self::Normal
    }
}

impl FeedbackPriority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Critical => "critical",
            Self::Urgent => "urgent",
        }
    }
}

impl fmt::Display for FeedbackPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FeedbackPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "low" | "1" => Ok(Self::Low),
            "normal" | "2" => Ok(Self::Normal),
            "high" | "3" => Ok(Self::High),
            "critical" | "4" => Ok(Self::Critical),
            "urgent" | "5" => Ok(Self::Urgent),
            other => Err(format!("unknown feedback priority: {}", other)),
        }
    }
}
