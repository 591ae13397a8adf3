use anyhow::{Context, Result, bail};
use chrono::Datelike;
use clap::{Parser, Subcommand};
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod config;
mod prompt;
mod reporter;

use ayaz_core::project::{AGENTS_FILE, TASKS_FILE, bundled_agents_yaml, bundled_tasks_yaml};
use ayaz_core::training::validate_training_args;
use ayaz_core::{
    Backend, Crew, CrewProject, HookChain, KickoffRecorder, LlmProvider, ProviderSettings,
    build_failover_provider, build_provider, load_trained_suggestions,
};
use ayaz_store::KickoffStore;

use config::AyazConfig;
use prompt::Console;
use tokio::io::AsyncBufRead;
use reporter::ConsoleReporter;

#[derive(Parser)]
#[command(name = "ayaz")]
#[command(version)]
#[command(about = "Ayaz — a crew of AI agents for email, calendar, documents and spreadsheets")]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding agents.yaml and tasks.yaml
    #[arg(short, long, global = true)]
    project: Option<PathBuf>,

    /// LLM backend: watsonx or gemini
    #[arg(long, global = true, env = "AYAZ_PROVIDER")]
    provider: Option<Backend>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the crew once (the default)
    Run,

    /// Train the crew with human feedback
    Train {
        /// Number of training iterations
        iterations: u32,
        /// Where to write the training results (.json)
        filename: PathBuf,
    },

    /// Re-run the latest kickoff from a given task
    Replay {
        /// Task id, as listed by `ayaz log-tasks-outputs`
        task_id: String,
    },

    /// Run the crew several times and score every task
    Test {
        /// Number of test runs
        iterations: u32,
        /// Model used to score the results (defaults to MODEL)
        model_name: Option<String>,
    },

    /// List the task ids stored from the latest kickoff
    LogTasksOutputs,

    /// Write the default config and crew definition
    Init,

    /// Show current configuration
    Config,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let filter = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let env = |name: &str| std::env::var(name).ok();
    let mut console = Console::stdio();
    if let Err(e) = execute(&cli, &env, &mut console).await {
        println!("\n=== Error ===");
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

/// Environment variable lookup, injectable for tests
type Env<'a> = &'a (dyn Fn(&str) -> Option<String> + Sync);

async fn execute<R, W>(cli: &Cli, env: Env<'_>, console: &mut Console<R, W>) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    match &cli.command {
        None | Some(Commands::Run) => cmd_run(cli, env, console)
            .await
            .context("An error occurred while running the crew"),
        Some(Commands::Train {
            iterations,
            filename,
        }) => cmd_train(cli, env, console, *iterations, filename)
            .await
            .context("An error occurred while training the crew"),
        Some(Commands::Replay { task_id }) => cmd_replay(cli, env, console, task_id)
            .await
            .context("An error occurred while replaying the crew"),
        Some(Commands::Test {
            iterations,
            model_name,
        }) => cmd_test(cli, env, console, *iterations, model_name.as_deref())
            .await
            .context("An error occurred while testing the crew"),
        Some(Commands::LogTasksOutputs) => cmd_log_tasks_outputs(cli),
        Some(Commands::Init) => cmd_init(cli).await,
        Some(Commands::Config) => cmd_config(cli),
    }
}

/// Config and credentials, checked before the user is asked anything
struct Session {
    cfg: AyazConfig,
    settings: ProviderSettings,
    fallback: Option<ProviderSettings>,
}

impl Session {
    fn prepare(cli: &Cli, env: Env<'_>) -> Result<Self> {
        let cfg = AyazConfig::load(&cli.config)?;
        let backend = cli.provider.unwrap_or(cfg.llm.provider);
        let settings = ProviderSettings::from_lookup(backend, env)?;
        info!("Using {} backend with model {}", backend, settings.model());

        let fallback = match cfg.llm.fallback {
            Some(other) if other != backend => {
                let fallback = ProviderSettings::from_lookup(other, env)
                    .with_context(|| format!("fallback backend {} is not configured", other))?;
                info!("Failing over to {} with model {}", other, fallback.model());
                Some(fallback)
            }
            _ => None,
        };
        Ok(Self {
            cfg,
            settings,
            fallback,
        })
    }

    /// Primary settings followed by the fallback, if any
    fn provider_chain(&self) -> Vec<ProviderSettings> {
        std::iter::once(self.settings.clone())
            .chain(self.fallback.clone())
            .collect()
    }

    fn project_dir(&self, cli: &Cli) -> PathBuf {
        cli.project
            .clone()
            .unwrap_or_else(|| self.cfg.project_dir())
    }

    fn open_store(&self) -> Result<KickoffStore> {
        KickoffStore::open(self.cfg.kickoff_db_path())
    }

    fn build_crew(&self, cli: &Cli) -> Result<Crew> {
        let project = CrewProject::load(Some(self.project_dir(cli).as_path()))?;
        let options = self.cfg.llm.provider_options();
        let provider = build_failover_provider(&self.provider_chain(), options)?;

        let mut overrides: Vec<(String, Arc<dyn LlmProvider>)> = Vec::new();
        for (name, agent) in project.agents.iter() {
            let Some(llm) = agent.llm.as_deref() else {
                continue;
            };
            let settings = self
                .settings
                .with_model(llm)
                .with_context(|| format!("agent '{}' has an unusable llm setting", name))?;
            if settings.model() != self.settings.model() {
                info!("Agent '{}' uses model {}", name, settings.model());
                overrides.push((name.to_string(), build_provider(&settings, options)?));
            }
        }

        let suggestions = load_trained_suggestions(&self.cfg.trained_agents_path())?;
        let crew = overrides
            .into_iter()
            .fold(Crew::new(project, provider), |crew, (name, provider)| {
                crew.with_agent_provider(name, provider)
            });
        Ok(crew.with_trained_suggestions(suggestions))
    }
}

fn current_year() -> i32 {
    chrono::Local::now().year()
}

/// Run `fut`, aborting on Ctrl+C
async fn interruptible<T>(fut: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        result = fut => result,
        _ = signal::ctrl_c() => {
            warn!("Received Ctrl+C, aborting");
            bail!("interrupted by Ctrl+C")
        }
    }
}

async fn cmd_run<R, W>(cli: &Cli, env: Env<'_>, console: &mut Console<R, W>) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    let session = Session::prepare(cli, env)?;
    let crew = session.build_crew(cli)?;
    let store = session.open_store()?;

    let inputs = console.prompt_workflow_inputs(current_year()).await?;

    println!("\n=== Starting Workflow ===");
    println!("Processing request: {}", inputs.get("action").unwrap_or_default());

    let mut recorder = KickoffRecorder::new(store);
    let mut reporter = ConsoleReporter::stdout(crew.tasks().len());
    let mut hooks = HookChain::new().with(&mut recorder).with(&mut reporter);
    let output = interruptible(crew.kickoff(&inputs, &mut hooks)).await?;

    println!("\n=== Workflow Complete ===");
    println!("{}", output);
    info!(
        "Used {} tokens across {} tasks",
        output.token_usage.total(),
        output.tasks_output.len()
    );
    Ok(())
}

async fn cmd_train<R, W>(
    cli: &Cli,
    env: Env<'_>,
    console: &mut Console<R, W>,
    iterations: u32,
    filename: &Path,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    validate_training_args(iterations, filename)?;
    let session = Session::prepare(cli, env)?;
    let crew = session.build_crew(cli)?;
    let store = session.open_store()?;

    let inputs = console.prompt_workflow_inputs(current_year()).await?;

    println!("\n=== Starting Training ===");
    println!("Processing request: {}", inputs.get("action").unwrap_or_default());

    let mut recorder = KickoffRecorder::new(store);
    let mut reporter = ConsoleReporter::stdout(crew.tasks().len());
    let mut hooks = HookChain::new().with(&mut recorder).with(&mut reporter);
    let summary = interruptible(ayaz_core::train(
        &crew,
        iterations,
        filename,
        &inputs,
        console,
        &mut hooks,
    ))
    .await?;

    println!("\n=== Training Complete ===");
    for (agent, result) in &summary.results {
        println!(
            "{}: quality {:.1}, {} suggestion(s)",
            agent,
            result.quality,
            result.suggestions.len()
        );
        for suggestion in &result.suggestions {
            println!("  - {}", suggestion);
        }
    }
    println!("Results written to {}", summary.results_file.display());
    println!("Training records written to {}", summary.records_file.display());
    if summary.results_file != session.cfg.trained_agents_path() {
        println!(
            "To use these results, set storage.trained_agents_file = \"{}\" in your config.",
            summary.results_file.display()
        );
    }
    Ok(())
}

async fn cmd_replay<R, W>(
    cli: &Cli,
    env: Env<'_>,
    console: &mut Console<R, W>,
    task_id: &str,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    let session = Session::prepare(cli, env)?;
    let store = session.open_store()?;
    if store.find(task_id.trim())?.is_none() {
        bail!(
            "task with id {} not found in the latest kickoff. \
             Run `ayaz log-tasks-outputs` to list the stored task ids",
            task_id.trim()
        );
    }
    let crew = session.build_crew(cli)?;

    let overrides = console.prompt_replay_overrides(current_year()).await?;

    println!("\n=== Starting Workflow ===");
    println!("Replaying task {}", task_id.trim());

    let mut recorder = KickoffRecorder::new(store.clone());
    let mut reporter = ConsoleReporter::stdout(crew.tasks().len());
    let mut hooks = HookChain::new().with(&mut recorder).with(&mut reporter);
    let output = interruptible(ayaz_core::replay(
        &crew, &store, task_id, &overrides, &mut hooks,
    ))
    .await?;

    println!("\n=== Workflow Complete ===");
    println!("{}", output);
    Ok(())
}

async fn cmd_test<R, W>(
    cli: &Cli,
    env: Env<'_>,
    console: &mut Console<R, W>,
    iterations: u32,
    model_name: Option<&str>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin + Send,
    W: Write + Send,
{
    if iterations == 0 {
        bail!("the number of test iterations must be a positive integer");
    }
    let session = Session::prepare(cli, env)?;
    let crew = session.build_crew(cli)?;
    let store = session.open_store()?;

    let evaluator: Arc<dyn LlmProvider> = match model_name {
        Some(model) => build_provider(
            &session.settings.with_model(model)?,
            session.cfg.llm.provider_options(),
        )?,
        None => crew.provider().clone(),
    };

    let inputs = console.prompt_workflow_inputs(current_year()).await?;

    println!("\n=== Starting Test ===");
    println!("Processing request: {}", inputs.get("action").unwrap_or_default());

    let mut recorder = KickoffRecorder::new(store);
    let mut reporter = ConsoleReporter::stdout(crew.tasks().len());
    let mut hooks = HookChain::new().with(&mut recorder).with(&mut reporter);
    let report = interruptible(ayaz_core::test_crew(
        &crew,
        iterations,
        evaluator.as_ref(),
        &inputs,
        &mut hooks,
    ))
    .await?;

    println!("\n=== Test Complete ===");
    print!("{}", report);
    Ok(())
}

fn cmd_log_tasks_outputs(cli: &Cli) -> Result<()> {
    let cfg = AyazConfig::load(&cli.config)?;
    let path = cfg.kickoff_db_path();
    if !path.exists() {
        println!("No kickoff has been recorded yet. Run `ayaz` first.");
        return Ok(());
    }
    let stored = KickoffStore::open(&path)?.load()?;
    if stored.is_empty() {
        println!("No kickoff has been recorded yet. Run `ayaz` first.");
        return Ok(());
    }

    println!("Tasks of the latest kickoff ({}):", path.display());
    for record in stored {
        println!(
            "{:>2}. {}  {:<22} {}{}",
            record.task_index + 1,
            record.task_id,
            record.task_name,
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            if record.was_replayed { "  (replayed)" } else { "" }
        );
    }
    Ok(())
}

async fn cmd_init(cli: &Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| config::config_dir().join("config.toml"));
    if let Some(dir) = config_path.parent().filter(|d| !d.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create config dir: {}", dir.display()))?;
    }

    if config_path.exists() {
        warn!("Config already exists at {}", config_path.display());
    } else {
        tokio::fs::write(&config_path, config::DEFAULT_CONFIG).await?;
        info!("Created default config at {}", config_path.display());
    }

    let cfg = AyazConfig::load(&Some(config_path.clone()))?;
    let project_dir = cli.project.clone().unwrap_or_else(|| cfg.project_dir());
    tokio::fs::create_dir_all(&project_dir)
        .await
        .with_context(|| format!("Failed to create project dir: {}", project_dir.display()))?;

    for (file, content) in [
        (AGENTS_FILE, bundled_agents_yaml()),
        (TASKS_FILE, bundled_tasks_yaml()),
    ] {
        let path = project_dir.join(file);
        if path.exists() {
            warn!("{} already exists at {}", file, path.display());
        } else {
            tokio::fs::write(&path, content).await?;
            info!("Created {} at {}", file, path.display());
        }
    }

    println!("Ayaz initialized with config {}", config_path.display());
    println!("Edit {} to adjust the crew.", project_dir.display());
    println!(
        "Set MODEL plus WATSONX_URL, WATSONX_APIKEY, WATSONX_PROJECT_ID (watsonx) \
         or GOOGLE_API_KEY (gemini) in your environment."
    );
    Ok(())
}

fn cmd_config(cli: &Cli) -> Result<()> {
    let mut cfg = AyazConfig::load(&cli.config)?;
    if let Some(provider) = cli.provider {
        cfg.llm.provider = provider;
    }
    if let Some(dir) = &cli.project {
        cfg.project.dir = dir.display().to_string();
    }
    println!("{}", toml::to_string_pretty(&cfg)?);
    Ok(())
}
