//! SmartFlow CLI - AI-assisted task decomposition

use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use smartflow_core::config::Config;
use smartflow_core::decomposition::{
    DecompositionOrchestrator, DecompositionRequest, DecompositionResult, Granularity,
    PreferenceProfile, PromptBuilder,
};
use smartflow_core::llm::{LlmClient, ModelBackend};
use smartflow_core::{Error, Result};
use tracing::{debug, info};

#[derive(Parser)]
#[command(name = "smartflow")]
#[command(author, version, about = "Break tasks into ordered, executable subtasks", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompose a task using the configured model
    Decompose {
        /// Task description
        description: String,
        #[command(flatten)]
        preferences: PreferenceArgs,
        /// Fail instead of returning the single-step fallback
        #[arg(long)]
        no_fallback: bool,
    },

    /// Render the model prompt without calling the model
    Prompt {
        /// Task description
        description: String,
        #[command(flatten)]
        preferences: PreferenceArgs,
    },

    /// Print the cache fingerprint of a request
    Fingerprint {
        /// Task description
        description: String,
        #[command(flatten)]
        preferences: PreferenceArgs,
    },

    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Args)]
struct PreferenceArgs {
    /// How finely to split the task (coarse, balanced, fine)
    #[arg(short, long, default_value = "balanced", value_parser = parse_granularity)]
    granularity: Granularity,

    /// Upper bound on the number of subtasks (defaults to config)
    #[arg(short, long)]
    max_subtasks: Option<u32>,

    /// Area to emphasize; may be repeated
    #[arg(long = "focus")]
    focus: Vec<String>,
}

impl PreferenceArgs {
    fn request(&self, description: &str, config: &Config) -> DecompositionRequest {
        let mut preferences = PreferenceProfile::from_config(&config.decomposition);
        preferences.granularity = self.granularity;
        if let Some(max_subtasks) = self.max_subtasks {
            preferences.max_subtasks = max_subtasks;
        }
        DecompositionRequest::new(description, preferences.with_focus_areas(&self.focus))
    }
}

fn parse_granularity(value: &str) -> std::result::Result<Granularity, String> {
    value.parse().map_err(|e: smartflow_core::decomposition::DecompositionError| e.to_string())
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Logs go to stderr so JSON output stays parseable
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("smartflow=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Decompose {
            description,
            preferences,
            no_fallback,
        } => cmd_decompose(&description, &preferences, no_fallback, cli.format, cli.quiet).await,

        Commands::Prompt {
            description,
            preferences,
        } => cmd_prompt(&description, &preferences, cli.format),

        Commands::Fingerprint {
            description,
            preferences,
        } => cmd_fingerprint(&description, &preferences, cli.format),

        Commands::Config { action } => cmd_config(action, cli.quiet),
    }
}

async fn cmd_decompose(
    description: &str,
    preferences: &PreferenceArgs,
    no_fallback: bool,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if no_fallback {
        config.decomposition.fallback_enabled = false;
    }

    let request = preferences.request(description, &config);
    request.validate().map_err(|e| with_hint(e.into(), quiet))?;

    let backend = build_backend(&config).map_err(|e| with_hint(e, quiet))?;
    let orchestrator = DecompositionOrchestrator::with_backend(backend, &config);

    info!(fingerprint = %request.fingerprint().short(), "Decomposing task");
    let result = orchestrator
        .decompose(request)
        .await
        .map_err(|e| with_hint(e.into(), quiet))?;
    debug!(stats = ?orchestrator.stats(), "Orchestrator stats");

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Text => print_result(&result, quiet),
    }
    Ok(())
}

fn build_backend(config: &Config) -> Result<Arc<dyn ModelBackend>> {
    let api_key = config
        .llm
        .resolved_api_key()
        .map_err(|e| Error::ConfigError(e.to_string()))?
        .ok_or_else(|| Error::LLMError("no API key configured".to_string()))?;

    let client = LlmClient::new(config.llm.clone(), api_key)?;
    Ok(Arc::new(client))
}

/// Print the error's suggestion before handing it to anyhow
fn with_hint(err: Error, quiet: bool) -> anyhow::Error {
    if !quiet {
        if let Some(suggestion) = err.suggestion() {
            eprintln!("Hint [{}]: {}", err.code(), suggestion);
        }
    }
    err.into()
}

fn print_result(result: &DecompositionResult, quiet: bool) {
    if quiet {
        for subtask in &result.subtasks {
            println!("{}", subtask.title);
        }
        return;
    }

    println!("Task: {}", result.main_task_summary);
    println!(
        "  Source: {}  Priority: {:.1}/10  Estimated: {} min",
        result.source, result.priority_score, result.estimated_duration_minutes
    );
    println!("\nSubtasks:");
    for subtask in &result.subtasks {
        match subtask.estimated_minutes {
            Some(minutes) => println!("  {}. {} ({} min)", subtask.order + 1, subtask.title, minutes),
            None => println!("  {}. {}", subtask.order + 1, subtask.title),
        }
        if let Some(desc) = &subtask.description {
            println!("     {}", desc);
        }
    }
}

fn cmd_prompt(
    description: &str,
    preferences: &PreferenceArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let request = preferences.request(description, &config);
    let prompt = PromptBuilder::new()
        .build(&request)
        .map_err(|e| with_hint(e.into(), false))?;

    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::to_string_pretty(&serde_json::json!({
                "system": prompt.system,
                "user": prompt.user,
            }))?
        ),
        OutputFormat::Text => {
            println!("--- system ---\n{}\n", prompt.system);
            println!("--- user ---\n{}", prompt.user);
        }
    }
    Ok(())
}

fn cmd_fingerprint(
    description: &str,
    preferences: &PreferenceArgs,
    format: OutputFormat,
) -> anyhow::Result<()> {
    let config = Config::load()?;
    let request = preferences.request(description, &config);
    request.validate().map_err(|e| with_hint(e.into(), false))?;

    let fingerprint = request.fingerprint();
    match format {
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({
                "fingerprint": fingerprint.as_str(),
                "normalizedDescription": request.normalized_description(),
            })
        ),
        OutputFormat::Text => println!("{}", fingerprint),
    }
    Ok(())
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            println!("{}", config.get(&key)?);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            println!("{}", Config::config_path()?.display());
        }
    }
    Ok(())
}
