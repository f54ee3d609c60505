// Inkwell studio engine
// Main entry point for the inkwell binary

use clap::Parser;
use inkwell_engine::cli::{Cli, Command};
use inkwell_engine::config::Config;
use inkwell_engine::handlers::{
    handle_audit, handle_canon, handle_config, handle_history, handle_projects, handle_run,
    handle_serve, handle_tasks, OutputFormat,
};
use inkwell_engine::telemetry::{init_telemetry, LogFormat};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments
    let cli = Cli::parse();

    // Determine output format
    let format = if cli.json {
        OutputFormat::Json
    } else {
        OutputFormat::Text
    };

    // Load configuration (or use custom path if provided)
    let config = if let Some(config_path) = &cli.config {
        Config::load_from_path(config_path)?
    } else {
        Config::load_or_create()?
    };

    // --log beats the config file; RUST_LOG beats both
    let level = cli.log.as_deref().unwrap_or(&config.core.log_level);
    init_telemetry(level, LogFormat::for_output(cli.json));

    tracing::info!("Inkwell v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Run {
            project,
            pipeline,
            input,
        } => {
            tracing::info!("Running {} for {}", pipeline, project);
            handle_run(project, pipeline, input, &config, format).await
        }

        Command::Serve => {
            tracing::info!("Starting scheduler...");
            handle_serve(&config, format).await
        }

        Command::Audit {
            project,
            event_type,
            sender,
            limit,
        } => handle_audit(project, event_type, sender, limit, &config, format),

        Command::History { project, limit } => handle_history(project, limit, &config, format),

        Command::Canon { project } => handle_canon(project, &config, format),

        Command::Tasks { project } => handle_tasks(project, &config, format),

        Command::Projects => handle_projects(&config, format),

        Command::Config { action } => {
            tracing::info!("Config management: {:?}", action);
            handle_config(action, &config, cli.config.as_deref(), format)
        }
    }
}
