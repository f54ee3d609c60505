//! Command handlers for CLI operations
//!
//! This module implements the handlers for all CLI commands:
//! - run: Drive one pipeline to completion in the foreground
//! - serve: Resume unfinished pipelines across projects until Ctrl-C
//! - audit / history / canon / tasks: Read a project's persisted records
//! - projects: List projects in the data directory
//! - config: Show or validate configuration

use anyhow::{bail, Context, Result};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;

use crate::cli::{ConfigAction, PipelineArgs};
use crate::conductor::{
    ChapterInput, DirectorInput, FullStoryInput, PipelineKind, PipelineRequest, RunStatus,
    StoryIdea,
};
use crate::config::Config;
use crate::registry::{ModelProvider, ProjectRegistry};
use crate::scheduler::MultiProjectScheduler;

/// Output format for command results
#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    /// Human-readable text output
    Text,
    /// JSON output for machine consumption
    Json,
}

/// Registry backed by the configured model server
pub fn open_registry(config: &Config) -> Result<Arc<ProjectRegistry>> {
    let models =
        ModelProvider::from_config(&config.model).context("Failed to set up model client")?;
    Ok(Arc::new(ProjectRegistry::new(config.clone(), models)))
}

/// Turn CLI flags into a typed pipeline request.
pub fn build_request(pipeline: &str, args: PipelineArgs) -> Result<PipelineRequest> {
    let kind: PipelineKind = pipeline.parse()?;
    let idea = || StoryIdea {
        idea: args.idea.clone().unwrap_or_default(),
        genre: args.genre.clone(),
        tone: args.tone.clone(),
        themes: args.themes.clone(),
        setting: args.setting.clone(),
    };

    let request = match kind {
        PipelineKind::StoryBible => PipelineRequest::StoryBible(idea()),
        PipelineKind::FullStory => PipelineRequest::FullStory(FullStoryInput {
            idea: idea(),
            max_chapters: args.max_chapters,
        }),
        PipelineKind::Chapter => PipelineRequest::Chapter(ChapterInput {
            outline_excerpt: args.outline.clone().unwrap_or_default(),
            goal: args.goal.clone(),
            chapter_index: args.chapter,
        }),
        PipelineKind::DirectorMode => PipelineRequest::DirectorMode(DirectorInput {
            idea: idea(),
            max_chapters: args.max_chapters,
            max_passes: args.max_passes,
        }),
    };
    Ok(request)
}

/// Run a pipeline in the foreground, printing progress after each step
pub async fn handle_run(
    project: String,
    pipeline: String,
    args: PipelineArgs,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let request = build_request(&pipeline, args)?;
    let registry = open_registry(config)?;
    let producer = registry.producer(&project)?;

    let started = producer.start(request)?;
    tracing::info!(project = %project, run_id = %started.run_id, "Running pipeline");

    let mut status = started;
    while matches!(status.status, RunStatus::Running | RunStatus::Pending) {
        if let OutputFormat::Text = format {
            if let Some(step) = &status.current_step {
                println!("[{}/{}] {}", status.step_index, status.total_steps, step);
            }
        }
        status = producer.step(&status.run_id).await?;
    }

    let result = producer
        .pipeline_results()
        .into_iter()
        .rev()
        .find(|r| r.pipeline_type == status.pipeline.as_str())
        .filter(|_| status.status == RunStatus::Completed);

    match format {
        OutputFormat::Text => {
            println!();
            println!("Run {}: {}", status.run_id, status.status);
            if let Some(error) = &status.error {
                println!("  Error: {}", error);
            }
            if let Some(result) = &result {
                println!("{}", serde_json::to_string_pretty(&result.result)?);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "status": status,
                "result": result.map(|r| r.result),
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }

    if status.status == RunStatus::Failed {
        bail!("pipeline {} failed", status.pipeline);
    }
    Ok(())
}

/// Resume every unfinished pipeline and keep driving until Ctrl-C
pub async fn handle_serve(config: &Config, format: OutputFormat) -> Result<()> {
    let registry = open_registry(config)?;
    let scheduler = MultiProjectScheduler::new(registry);

    let discovered = scheduler.discover()?;
    if let OutputFormat::Text = format {
        println!(
            "Serving {} (resumed {} run(s)). Press Ctrl-C to stop.",
            config.core.data_dir.display(),
            discovered
        );
    }

    let report = scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            }
        })
        .await;

    match format {
        OutputFormat::Text => {
            println!(
                "Stopped: {} step(s), {} completed, {} failed, {} stopped",
                report.steps, report.completed, report.failed, report.stopped
            );
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }
    Ok(())
}

/// Search a project's audit log
pub fn handle_audit(
    project: String,
    event_type: Option<String>,
    sender: Option<String>,
    limit: usize,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let registry = open_registry(config)?;
    let entries = registry.audit_log(&project)?.search(
        event_type.as_deref(),
        sender.as_deref(),
        Some(limit),
    )?;

    match format {
        OutputFormat::Text => {
            if entries.is_empty() {
                println!("No matching audit entries");
                return Ok(());
            }
            for entry in &entries {
                println!(
                    "#{} {} {} {} -> {}",
                    entry.seq,
                    entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    entry.event_type,
                    entry.sender,
                    entry.recipient
                );
                println!("    {}", entry.payload);
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "entries": entries,
                "count": entries.len(),
                "limit": limit,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// Show the most recent pipeline results of a project
pub fn handle_history(
    project: String,
    limit: usize,
    config: &Config,
    format: OutputFormat,
) -> Result<()> {
    let registry = open_registry(config)?;
    let results = registry.state(&project)?.pipeline_results();
    let recent: Vec<_> = results.iter().rev().take(limit).collect();

    match format {
        OutputFormat::Text => {
            if recent.is_empty() {
                println!("No pipeline results for {}", project);
                return Ok(());
            }
            println!("Pipeline History (last {} results):", limit);
            println!();
            for result in recent {
                println!(
                    "{}  {}",
                    result.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    result.pipeline_type
                );
            }
        }
        OutputFormat::Json => {
            let output = json!({
                "results": recent,
                "count": recent.len(),
                "limit": limit,
            });
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
    }
    Ok(())
}

/// List a project's canon rules
pub fn handle_canon(project: String, config: &Config, format: OutputFormat) -> Result<()> {
    let registry = open_registry(config)?;
    let rules = registry.graph(&project)?.canon_rules();

    match format {
        OutputFormat::Text => {
            if rules.is_empty() {
                println!("No canon rules for {}", project);
                return Ok(());
            }
            for rule in &rules {
                println!("- {} (confidence {:.1})", rule.rule, rule.confidence);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&rules)?),
    }
    Ok(())
}

/// List a project's tasks
pub fn handle_tasks(project: String, config: &Config, format: OutputFormat) -> Result<()> {
    let registry = open_registry(config)?;
    let tasks = registry.tasks(&project)?.list();

    match format {
        OutputFormat::Text => {
            if tasks.is_empty() {
                println!("No tasks for {}", project);
                return Ok(());
            }
            for task in &tasks {
                println!("Task ID: {}", task.id);
                println!("  Kind:    {}", task.kind.as_str());
                println!("  Status:  {}", task.status.as_str());
                if let Some(error) = &task.error {
                    println!("  Error:   {}", error);
                }
                println!("  Created: {}", task.created_at.format("%Y-%m-%d %H:%M:%S"));
                println!();
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tasks)?),
    }
    Ok(())
}

/// List projects in the data directory
pub fn handle_projects(config: &Config, format: OutputFormat) -> Result<()> {
    let registry = open_registry(config)?;
    let projects = registry.known_projects()?;

    match format {
        OutputFormat::Text => {
            if projects.is_empty() {
                println!("No projects in {}", config.core.data_dir.display());
            }
            for project in &projects {
                println!("{}", project);
            }
        }
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&projects)?),
    }
    Ok(())
}

/// Show, locate or validate the configuration
pub fn handle_config(
    action: ConfigAction,
    config: &Config,
    config_path: Option<&Path>,
    format: OutputFormat,
) -> Result<()> {
    match action {
        ConfigAction::Show => match format {
            OutputFormat::Text => println!("{}", toml::to_string_pretty(config)?),
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(config)?),
        },
        ConfigAction::Path => {
            let path = match config_path {
                Some(path) => path.to_path_buf(),
                None => Config::default_config_path()?,
            };
            println!("{}", path.display());
        }
        ConfigAction::Validate => {
            // Loading already validated it
            match format {
                OutputFormat::Text => println!("Configuration is valid"),
                OutputFormat::Json => println!("{}", json!({ "valid": true })),
            }
        }
    }
    Ok(())
}
