//! CLI interface for Inkwell
//!
//! This module provides the command-line interface using clap's derive API.
//! It defines all commands and global flags for driving the studio engine.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Inkwell creative-writing studio engine
///
/// Runs story pipelines (plot, world, characters, chapters) for one or more
/// projects against an OpenAI-compatible model server.
#[derive(Parser, Debug)]
#[command(name = "inkwell")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output in JSON format
    #[arg(long, global = true)]
    pub json: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log: Option<String>,

    /// Specify alternate configuration file
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run a pipeline for a project in the foreground
    Run {
        /// Project name
        project: String,

        /// story_bible, chapter, full_story or director_mode
        pipeline: String,

        #[command(flatten)]
        input: PipelineArgs,
    },

    /// Resume unfinished pipelines of every project and keep driving them
    /// until Ctrl-C
    Serve,

    /// Search a project's audit log, newest first
    Audit {
        /// Project name
        project: String,

        /// Only entries of this event type
        #[arg(long)]
        event_type: Option<String>,

        /// Only entries from this sender
        #[arg(long)]
        sender: Option<String>,

        /// Maximum number of entries (default: 20)
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show a project's pipeline results
    History {
        /// Project name
        project: String,

        /// Number of results to show (default: 10)
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// List a project's canon rules
    Canon {
        /// Project name
        project: String,
    },

    /// List a project's tasks
    Tasks {
        /// Project name
        project: String,
    },

    /// List projects in the data directory
    Projects,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

/// Pipeline input flags; which ones are required depends on the pipeline
#[derive(clap::Args, Debug, Default, Clone)]
pub struct PipelineArgs {
    /// Story idea (story_bible, full_story, director_mode)
    #[arg(long)]
    pub idea: Option<String>,

    /// Outline excerpt to write from (chapter)
    #[arg(long)]
    pub outline: Option<String>,

    /// Scene goal (chapter)
    #[arg(long)]
    pub goal: Option<String>,

    /// Chapter number to save under (chapter)
    #[arg(long)]
    pub chapter: Option<usize>,

    /// Chapter cap (full_story, director_mode)
    #[arg(long)]
    pub max_chapters: Option<usize>,

    /// Revision pass cap (director_mode)
    #[arg(long)]
    pub max_passes: Option<usize>,

    #[arg(long)]
    pub genre: Option<String>,

    #[arg(long)]
    pub tone: Option<String>,

    #[arg(long)]
    pub themes: Option<String>,

    #[arg(long)]
    pub setting: Option<String>,
}

/// Configuration management actions
#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show,

    /// Print the configuration file path
    Path,

    /// Validate configuration file
    Validate,
}
