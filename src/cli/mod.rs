mod output;

use anyhow::{Result, bail};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, broadcast};
use tokio_cron_scheduler::JobScheduler;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::EngineConfig;
use crate::core::agent::AgentDefinition;
use crate::core::engine::Engine;
use crate::core::error::EngineError;
use crate::core::lifecycle::LifecycleManager;
use crate::core::queue::WorkerPool;
use crate::core::runner::RunStatus;
use crate::interfaces::web::{ApiServer, ApiServerConfig};
use crate::logging::init_tracing;
use output::{print_error, print_help, print_info, print_status, print_success, print_warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Serve,
    Worker,
    Scheduler,
    Run(RunCommandArgs),
    Validate(PathBuf),
    Help,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RunCommandArgs {
    pub agent: String,
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Invocation {
    pub config_path: Option<PathBuf>,
    pub command: Command,
}

/// Value following `flag`, if any. Missing values are treated as absent.
fn flag_value(args: &[String], i: usize) -> Option<String> {
    args.get(i + 1).cloned()
}

pub(crate) fn parse_run_command_args(args: &[String], start: usize) -> RunCommandArgs {
    let mut agent = String::new();
    let mut prompt = String::new();
    let mut i = start;
    while i < args.len() {
        match args[i].as_str() {
            "--agent" | "-a" => {
                if let Some(v) = flag_value(args, i) {
                    agent = v;
                }
                i += 2;
            }
            "--prompt" | "-p" => {
                if let Some(v) = flag_value(args, i) {
                    prompt = v;
                }
                i += 2;
            }
            _ => i += 1,
        }
    }
    RunCommandArgs { agent, prompt }
}

/// `args[0]` is the program name.
pub(crate) fn parse_args(args: &[String]) -> Result<Invocation> {
    let mut config_path = None;
    let mut rest = Vec::new();
    let mut i = 1;
    while i < args.len() {
        if args[i] == "--config" || args[i] == "-c" {
            match flag_value(args, i) {
                Some(v) => config_path = Some(PathBuf::from(v)),
                None => bail!("--config needs a file path"),
            }
            i += 2;
        } else {
            rest.push(args[i].clone());
            i += 1;
        }
    }

    let command = match rest.first().map(String::as_str) {
        None | Some("help") | Some("--help") | Some("-h") => Command::Help,
        Some("serve") => Command::Serve,
        Some("worker") => Command::Worker,
        Some("scheduler") => Command::Scheduler,
        Some("run") => {
            let parsed = parse_run_command_args(&rest, 1);
            if parsed.agent.is_empty() {
                bail!("--agent is required for run");
            }
            Command::Run(parsed)
        }
        Some("validate") => match rest.get(1) {
            Some(path) => Command::Validate(PathBuf::from(path)),
            None => bail!("validate needs a definition file"),
        },
        Some(other) => bail!("unknown command '{}'", other),
    };
    Ok(Invocation {
        config_path,
        command,
    })
}

pub async fn run_main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    let invocation = match parse_args(&args) {
        Ok(inv) => inv,
        Err(e) => {
            print_error(&e.to_string());
            print_help();
            return Ok(());
        }
    };

    match invocation.command {
        Command::Help => {
            print_help();
            Ok(())
        }
        Command::Validate(path) => run_validate(&path),
        command => {
            let config = EngineConfig::load(invocation.config_path.as_deref())?;
            let log_tx = init_tracing(&config.log_level);
            match command {
                Command::Serve => run_services(config, log_tx, Services::all()).await,
                Command::Scheduler => {
                    run_services(config, log_tx, Services::without_api()).await
                }
                Command::Worker => run_services(config, log_tx, Services::workers_only()).await,
                Command::Run(run) => run_once(config, run).await,
                Command::Help | Command::Validate(_) => Ok(()),
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Services {
    api: bool,
    triggers: bool,
}

impl Services {
    fn all() -> Self {
        Self {
            api: true,
            triggers: true,
        }
    }

    fn without_api() -> Self {
        Self {
            api: false,
            triggers: true,
        }
    }

    fn workers_only() -> Self {
        Self {
            api: false,
            triggers: false,
        }
    }
}

async fn run_services(
    config: EngineConfig,
    log_tx: broadcast::Sender<String>,
    services: Services,
) -> Result<()> {
    let mut lifecycle = LifecycleManager::new().await?;
    // Schedules registered on a scheduler that is never started never fire.
    let scheduler = if services.triggers {
        lifecycle.scheduler.clone()
    } else {
        JobScheduler::new().await?
    };

    let engine = Arc::new(Engine::from_config(&config, scheduler)?);
    let loaded = engine.load_from_dir(&config.agents_dir()).await?;

    let workers = WorkerPool::new(
        engine.queue(),
        engine.clone(),
        config.worker.concurrency,
        config.poll_interval(),
    );
    lifecycle.attach(Arc::new(Mutex::new(workers)));
    if services.triggers {
        lifecycle.attach(Arc::new(Mutex::new(engine.triggers())));
    }
    if services.api {
        lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(ApiServerConfig {
            engine: engine.clone(),
            log_tx,
            api_host: config.api.host.clone(),
            api_port: config.api.port,
            admin_token: config.api.admin_token.clone(),
        }))));
    }

    lifecycle.start().await?;

    print_success("agentflow is running");
    print_status("Agents", &loaded.to_string());
    print_status("Workers", &config.worker.concurrency.to_string());
    if services.api {
        print_status(
            "API",
            &format!("{}", style(format!("http://{}", config.api_addr())).underlined().cyan()),
        );
    }
    print_status("Data", &config.data_dir.display().to_string());
    print_info("Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down agentflow...");
    lifecycle.shutdown().await
}

async fn run_once(config: EngineConfig, args: RunCommandArgs) -> Result<()> {
    let engine = Engine::from_config(&config, JobScheduler::new().await?)?;
    engine.load_from_dir(&config.agents_dir()).await?;

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            on_signal.cancel();
        }
    });

    match engine.run_agent(&args.agent, &args.prompt, &cancel).await {
        Ok(outcome) => {
            match outcome.status {
                RunStatus::Completed(text) => println!("{}", text),
                RunStatus::MaxTurnsReached => print_warn(&format!(
                    "Agent {} used all its turns without a final answer",
                    args.agent
                )),
            }
            print_status("Session", &outcome.session_id);
            print_status("Turns", &outcome.turns.to_string());
            Ok(())
        }
        Err(e) => bail!("run failed: {}", e),
    }
}

fn run_validate(path: &std::path::Path) -> Result<()> {
    let def = AgentDefinition::from_file(path)?;
    match def.prepare() {
        Ok(def) => {
            print_success(&format!("{} is a valid definition for agent {}", path.display(), def.id));
            Ok(())
        }
        Err(EngineError::Config(errors)) => {
            print_error(&format!("{} has {} problem(s):", path.display(), errors.0.len()));
            for e in errors.iter() {
                eprintln!("  {} {}", style(&e.field).bold(), e.message);
            }
            bail!("invalid agent definition")
        }
        Err(e) => Err(e.into()),
    }
}
