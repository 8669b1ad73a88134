//! lm-predict CLI - Cached predictions from hosted and local language models

mod cli;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use cli::{render_result, spinner::WaitSpinner, PromptArgs};
use lm_predict::{
    backends::{Backend, BackendKind, LocalBackend, OpenAiBackend},
    cache::DiskCache,
    config::{Config, ConfigError},
    model::LanguageModel,
};
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing::{debug, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "lm-predict")]
#[command(about = "Predict completions from language models with a local disk cache")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbosity level
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Predict completions for a prompt
    Predict {
        #[command(flatten)]
        args: PromptArgs,

        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Remove a prompt's cached completions so the next prediction resamples
    Forget {
        #[command(flatten)]
        args: PromptArgs,
    },

    /// Manage the disk cache
    #[command(subcommand)]
    Cache(CacheCommands),

    /// Check if the local model server is reachable
    CheckLocal {
        /// Server URL (defaults to the configured one)
        #[arg(long)]
        url: Option<String>,
    },

    /// Manage configuration
    #[command(subcommand)]
    Config(ConfigCommands),
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Delete every cached completion
    Clear {
        /// Skip the confirmation prompt
        #[arg(long)]
        yes: bool,
    },

    /// Show cache location and usage
    Stats,
}

#[derive(Subcommand)]
enum ConfigCommands {
    /// Initialize configuration file with defaults
    Init {
        /// Overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Show current configuration
    Show {
        /// Show only one section (openai, local, cache)
        #[arg(short, long)]
        section: Option<String>,

        /// Print an example file with every default instead
        #[arg(long, conflicts_with = "section")]
        example: bool,
    },

    /// Show configuration file path
    Path,

    /// Validate configuration
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };

    // RUST_LOG takes precedence over --log-level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::default().add_directive(log_level.into()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Predict { args, json } => run_predict(args, json).await?,
        Commands::Forget { args } => run_forget(args).await?,
        Commands::Cache(cmd) => run_cache_command(cmd)?,
        Commands::CheckLocal { url } => run_check_local(url).await?,
        Commands::Config(cmd) => run_config_command(cmd)?,
    }

    Ok(())
}

/// Build the model a prompt command asked for
fn build_model(config: &Config, args: &PromptArgs) -> Result<LanguageModel> {
    let kind = args.backend.unwrap_or(config.default_backend);

    let backend: Arc<dyn Backend> = match kind {
        BackendKind::OpenAi => {
            let mut settings = config.openai_backend()?;
            if let Some(model) = &args.model {
                settings.model = model.clone();
            }
            Arc::new(OpenAiBackend::new(settings))
        }
        BackendKind::Local => {
            let mut settings = config.local_backend();
            if let Some(model) = &args.model {
                settings.model = model.clone();
            }
            Arc::new(LocalBackend::new(settings))
        }
    };

    if !config.cache.enabled {
        debug!("disk cache disabled in config");
        return Ok(LanguageModel::new(backend));
    }

    let cache = DiskCache::open(config.cache_store()).context("failed to open disk cache")?;
    Ok(LanguageModel::with_cache(backend, Arc::new(cache)))
}

async fn run_predict(args: PromptArgs, json: bool) -> Result<()> {
    let config = Config::load()?;
    let model = build_model(&config, &args)?;
    let prompt = args.to_prompt();

    info!(backend = %model.backend().namespace(), "predicting");

    let mut spinner = WaitSpinner::new();
    if !json {
        spinner.start(format!("Waiting on {}", model.backend().namespace()));
    }
    let results = model.predict_many(&prompt).await;
    spinner.stop();
    let results = results?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else {
        for (i, result) in results.iter().enumerate() {
            let readable = model.remove_special_chars_from_tokens(&result.completion_tokens);
            print!("{}", render_result(i, result, &readable));
        }
    }

    debug!("cache activity:\n{}", model.cache_metrics());
    Ok(())
}

async fn run_forget(args: PromptArgs) -> Result<()> {
    let config = Config::load()?;
    let model = build_model(&config, &args)?;
    let prompt = args.to_prompt();

    if model.cache().is_none() {
        println!("Disk cache is disabled; nothing to forget");
        return Ok(());
    }

    let key = model.fingerprint(&prompt);
    if model.remove_prompt_from_cache(&prompt).await? {
        println!("Removed cached completions for {}", key);
    } else {
        println!("No cached completions for {}", key);
    }

    Ok(())
}

fn run_cache_command(cmd: CacheCommands) -> Result<()> {
    let config = Config::load()?;
    let cache = DiskCache::open(config.cache_store()).context("failed to open disk cache")?;

    match cmd {
        CacheCommands::Clear { yes } => {
            if !yes && !confirm(&format!("Delete everything under {}?", cache.dir().display()))? {
                println!("Aborted");
                return Ok(());
            }
            cache.clear_all()?;
            println!("Cache cleared: {}", cache.dir().display());
        }
        CacheCommands::Stats => {
            let limit = cache.config().size_limit;
            let used = cache.volume()?;
            println!("=== Disk Cache ===");
            println!("Location: {}", cache.dir().display());
            println!("Cached prompts: {}", cache.len()?);
            println!(
                "Size: {} / {} bytes ({:.2}%)",
                used,
                limit,
                used as f64 / limit as f64 * 100.0
            );
            println!("Shards: {}", cache.config().shards);
            println!("Variants per prompt: {}", cache.config().max_variants);
            if !config.cache.enabled {
                println!("(disabled in config)");
            }
        }
    }

    Ok(())
}

fn confirm(question: &str) -> Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;

    let mut answer = String::new();
    io::stdin().lock().read_line(&mut answer)?;
    Ok(matches!(answer.trim().to_lowercase().as_str(), "y" | "yes"))
}

async fn run_check_local(url: Option<String>) -> Result<()> {
    let config = Config::load()?;
    let mut settings = config.local_backend();
    if let Some(url) = url {
        settings.url = url;
    }

    let target = settings.url.clone();
    let backend = LocalBackend::new(settings);
    if backend.is_available().await {
        println!("Local model server is available at {}", target);
    } else {
        println!("Local model server is NOT available at {}", target);
        println!("Start a text-generation server, e.g.:");
        println!("  text-generation-launcher --model-id gpt2 --port 8080");
    }

    Ok(())
}

fn run_config_command(cmd: ConfigCommands) -> Result<()> {
    match cmd {
        ConfigCommands::Init { force } => config_init(force)?,
        ConfigCommands::Show { example: true, .. } => print!("{}", Config::example()),
        ConfigCommands::Show { section, .. } => config_show(section)?,
        ConfigCommands::Path => println!("{}", Config::default_path().display()),
        ConfigCommands::Validate => config_validate()?,
    }
    Ok(())
}

fn config_init(force: bool) -> Result<()> {
    let path = Config::default_path();

    if path.exists() && !force {
        println!("Configuration file already exists at: {}", path.display());
        println!("Use --force to overwrite");
        return Ok(());
    }

    Config::default().save()?;

    println!("Configuration file created at: {}", path.display());
    println!();
    println!("Next steps:");
    println!("  1. Edit the config file to add your API key, or");
    println!("  2. Set environment variables:");
    println!("     export OPENAI_API_KEY=your_key");
    println!("     export LOCAL_LM_URL=http://localhost:8080");

    Ok(())
}

fn config_show(section: Option<String>) -> Result<()> {
    let mut config = Config::load()?;
    if config.openai.api_key.is_some() {
        config.openai.api_key = Some("***".to_string());
    }

    let display = match section.as_deref().map(str::to_lowercase).as_deref() {
        None => toml::to_string_pretty(&config)?,
        Some("openai") => toml::to_string_pretty(&config.openai)?,
        Some("local") => toml::to_string_pretty(&config.local)?,
        Some("cache") => toml::to_string_pretty(&config.cache)?,
        Some(other) => bail!("Unknown section: {} (available: openai, local, cache)", other),
    };
    println!("{}", display);

    println!("\n--- Environment Variables ---");
    for var in ["OPENAI_API_KEY", "OPENAI_BASE_URL", "OPENAI_MODEL"] {
        let state = if std::env::var(var).is_ok() { "set" } else { "not set" };
        println!("{}: {}", var, state);
    }
    for var in ["LOCAL_LM_URL", "LOCAL_LM_MODEL", "LM_PREDICT_CACHE_DIR"] {
        println!(
            "{}: {}",
            var,
            std::env::var(var).unwrap_or_else(|_| "not set".to_string())
        );
    }

    Ok(())
}

fn config_validate() -> Result<()> {
    let path = Config::default_path();
    if !path.exists() {
        println!("{}", ConfigError::NotFound(path));
        println!("Using defaults and environment variables");
    }

    let config = Config::load()?;
    match config.validate() {
        Ok(()) => {
            println!("Configuration is valid");
            println!("Default backend: {}", config.default_backend);
            println!("Cache: {}", config.cache_store().dir.display());
            Ok(())
        }
        Err(e) => bail!("Configuration is invalid: {}", e),
    }
}
