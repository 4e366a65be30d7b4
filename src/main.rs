use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use brainchain::config::{self, Config};
use brainchain::executor::{Executor, Task};
use brainchain::runner::RunnerRegistry;
use brainchain::session::SessionManager;
use brainchain::store::SessionStatus;
use brainchain::util::truncate_chars;
use brainchain::workflow::{Engine, WorkflowResult};

#[derive(Parser, Debug)]
#[command(name = "brainchain", version)]
#[command(about = "Orchestrate agent CLIs through a configured workflow", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.config/brainchain/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the workflow on a prompt
    Run {
        prompt: String,
        #[arg(long)]
        cwd: Option<PathBuf>,
        /// Override workflow.max_loops
        #[arg(long)]
        max_loops: Option<usize>,
        /// Do not persist a session for this run
        #[arg(long, default_value_t = false)]
        no_session: bool,
    },
    /// Run a JSON batch of {id, role, prompt} tasks concurrently
    Parallel {
        file: PathBuf,
        #[arg(long)]
        cwd: Option<PathBuf>,
    },
    /// Print the configured workflow
    Info,
    /// List sessions, newest first
    Sessions {
        #[arg(long)]
        status: Option<SessionStatus>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Show a session with its transcript and checkpoint
    Show { id: String },
    /// Resume an interrupted or failed session from its checkpoint
    Resume {
        id: String,
        /// Run in this directory instead of the session's recorded one
        #[arg(long)]
        cwd: Option<PathBuf>,
        #[arg(long)]
        max_loops: Option<usize>,
    },
    /// Give a session a name
    Rename { id: String, name: String },
    /// Delete a session and everything recorded for it
    Delete { id: String },
    /// Delete completed and failed sessions older than the retention period
    Cleanup {
        #[arg(long)]
        days: Option<u32>,
    },
}

/// Everything a command needs, built once from the config file.
struct App {
    config: Arc<Config>,
    executor: Executor,
    sessions: Option<Arc<SessionManager>>,
}

impl App {
    async fn load(path: Option<&Path>, with_sessions: bool) -> anyhow::Result<Self> {
        let config = Config::load(path).context("loading configuration")?;
        let base_dir = path
            .and_then(Path::parent)
            .map(Path::to_path_buf)
            .unwrap_or_else(config::config_dir);
        let prompts = config::load_prompts(&config, &base_dir)?;
        let registry = RunnerRegistry::from_config(&config);
        info!(
            agents = registry.count(),
            roles = config.roles.len(),
            steps = config.workflow.steps.len(),
            "Configuration loaded"
        );

        let config = Arc::new(config);
        let executor = Executor::new(config.clone(), prompts, Arc::new(registry));

        let sessions = if with_sessions && config.session.enabled {
            let manager = SessionManager::open(&config.session)
                .await
                .with_context(|| {
                    format!(
                        "opening session database at {}",
                        config.session.resolved_db_path().display()
                    )
                })?;
            Some(Arc::new(manager))
        } else {
            None
        };

        Ok(Self {
            config,
            executor,
            sessions,
        })
    }

    fn engine(&self, max_loops: Option<usize>) -> Engine {
        let engine = Engine::new(
            self.config.clone(),
            self.executor.clone(),
            self.sessions.clone(),
        );
        match max_loops {
            Some(n) => engine.with_max_loops(n),
            None => engine,
        }
    }

    fn require_sessions(&self) -> anyhow::Result<&SessionManager> {
        match &self.sessions {
            Some(manager) => Ok(manager),
            None => bail!("sessions are disabled in the configuration"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Run {
            prompt,
            cwd,
            max_loops,
            no_session,
        } => {
            let app = App::load(config_path, !no_session).await?;
            run_workflow(&app, &prompt, resolve_cwd(cwd)?, max_loops).await
        }
        Command::Parallel { file, cwd } => {
            let app = App::load(config_path, false).await?;
            run_batch(&app, &file, resolve_cwd(cwd)?).await
        }
        Command::Info => {
            let app = App::load(config_path, false).await?;
            println!("{}", serde_json::to_string_pretty(&app.engine(None).info())?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Sessions { status, limit } => {
            let app = App::load(config_path, true).await?;
            let sessions = app.require_sessions()?.list_sessions(status, limit).await?;
            if sessions.is_empty() {
                eprintln!("No sessions.");
            }
            for s in sessions {
                println!(
                    "{}  {:<11}  {}  {}",
                    s.short_id(),
                    s.status,
                    s.updated_at.format("%Y-%m-%d %H:%M"),
                    s.display_name()
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Show { id } => {
            let app = App::load(config_path, true).await?;
            let Some(details) = app.require_sessions()?.session_info(&id).await? else {
                bail!("session {id} not found");
            };
            println!("{}", serde_json::to_string_pretty(&details)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Resume { id, cwd, max_loops } => {
            let app = App::load(config_path, true).await?;
            let cwd = cwd.map(|dir| resolve_cwd(Some(dir))).transpose()?;
            resume_workflow(&app, &id, cwd, max_loops).await
        }
        Command::Rename { id, name } => {
            let app = App::load(config_path, true).await?;
            app.require_sessions()?.rename_session(&id, &name).await?;
            eprintln!("Renamed {id} to \"{name}\"");
            Ok(ExitCode::SUCCESS)
        }
        Command::Delete { id } => {
            let app = App::load(config_path, true).await?;
            if !app.require_sessions()?.delete_session(&id).await? {
                bail!("session {id} not found");
            }
            eprintln!("Deleted {id}");
            Ok(ExitCode::SUCCESS)
        }
        Command::Cleanup { days } => {
            let app = App::load(config_path, true).await?;
            let days = days.unwrap_or(app.config.session.retention_days);
            let removed = app.require_sessions()?.cleanup_old_sessions(days).await?;
            eprintln!("Removed {removed} session(s) older than {days} day(s)");
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_workflow(
    app: &App,
    prompt: &str,
    cwd: PathBuf,
    max_loops: Option<usize>,
) -> anyhow::Result<ExitCode> {
    if let Some(manager) = &app.sessions {
        if app.config.session.recovery.auto_detect {
            let interrupted = manager.get_interrupted_sessions().await?;
            if !interrupted.is_empty() {
                eprintln!("Interrupted sessions (resume with `brainchain resume <id>`):");
                for s in &interrupted {
                    eprintln!("   {}  {}", s.id, s.display_name());
                }
                eprintln!();
            }
        }
        let session = manager
            .create_session(
                prompt,
                &cwd.display().to_string(),
                app.config.workflow.name.as_deref(),
                app.config.snapshot(),
            )
            .await?;
        eprintln!("Session {} ({})", session.short_id(), session.display_name());
    }

    let engine = app.engine(max_loops);
    let cancel = cancel_on_ctrl_c();
    let result = engine.run(prompt, &cwd, &cancel).await;

    if let Some(manager) = &app.sessions {
        close_session(manager, &result, &cancel).await;
    }
    Ok(report(&result))
}

async fn resume_workflow(
    app: &App,
    session_id: &str,
    cwd: Option<PathBuf>,
    max_loops: Option<usize>,
) -> anyhow::Result<ExitCode> {
    let manager = app.require_sessions()?;
    let point = manager.prepare_resume(session_id).await?;
    let checkpoint = point.checkpoint();

    let engine = app.engine(max_loops);
    eprintln!(
        "Resuming {} ({}) at step {}/{}",
        point.session.short_id(),
        point.session.display_name(),
        point.resume_from_step + 1,
        engine.steps().len()
    );

    let cancel = cancel_on_ctrl_c();
    let cwd = cwd.unwrap_or_else(|| PathBuf::from(&point.session.cwd));
    let result = engine
        .resume(checkpoint, &point.session.initial_prompt, &cwd, &cancel)
        .await?;

    close_session(manager, &result, &cancel).await;
    Ok(report(&result))
}

async fn run_batch(app: &App, file: &Path, cwd: PathBuf) -> anyhow::Result<ExitCode> {
    let raw = std::fs::read_to_string(file)
        .with_context(|| format!("reading task file {}", file.display()))?;
    let tasks: Vec<Task> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing task file {}", file.display()))?;
    let mut ids = HashSet::new();
    if let Some(dup) = tasks.iter().find(|t| !ids.insert(t.id.as_str())) {
        bail!("task file {} repeats task id '{}'", file.display(), dup.id);
    }

    let cancel = cancel_on_ctrl_c();
    let results = app.executor.run_parallel(tasks, &cwd, &cancel).await;
    println!("{}", serde_json::to_string_pretty(&results)?);

    let failed = results.iter().filter(|r| !r.success).count();
    eprintln!("{} task(s), {failed} failed", results.len());
    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn resolve_cwd(cwd: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    match cwd {
        Some(dir) if dir.is_dir() => Ok(dir),
        Some(dir) => bail!("working directory {} does not exist", dir.display()),
        None => std::env::current_dir().context("reading current directory"),
    }
}

/// A token that is cancelled on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current step");
            trigger.cancel();
        }
    });
    token
}

async fn close_session(
    manager: &SessionManager,
    result: &WorkflowResult,
    cancel: &CancellationToken,
) {
    let outcome = if cancel.is_cancelled() {
        manager.interrupt_session(None).await
    } else if result.success {
        manager.complete_session(None).await
    } else {
        manager.fail_session(None, &result.error).await
    };
    if let Err(e) = outcome {
        warn!("Failed to update session status: {e}");
    }
}

fn report(result: &WorkflowResult) -> ExitCode {
    for step in &result.step_results {
        let mark = if step.success { "ok" } else { "FAIL" };
        let jump = step
            .jump_target
            .as_deref()
            .map(|t| format!(" -> {t}"))
            .unwrap_or_default();
        eprintln!(
            "   [{mark:>4}] step {} {} ({:.1}s){jump}",
            step.step_index + 1,
            step.role,
            step.duration.as_secs_f64()
        );
        if !step.success && !step.error.is_empty() {
            eprintln!("          {}", truncate_chars(&step.error, 200));
        }
    }

    eprintln!(
        "Completed {}/{} steps in {:.1}s",
        result.steps_completed,
        result.total_steps,
        result.total_duration.as_secs_f64()
    );

    if result.success {
        if !result.final_output.is_empty() {
            println!("{}", result.final_output);
        }
        ExitCode::SUCCESS
    } else {
        eprintln!("Workflow failed: {}", result.error);
        ExitCode::FAILURE
    }
}
