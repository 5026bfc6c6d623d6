//! Drives a project from raw spec to provisioned delivery.
//!
//! Planning phases checkpoint under `<state_dir>/<project_id>/`, so `run` can
//! be re-issued after a crash and resumes where it stopped. Creating
//! `<state_dir>/<project_id>/STOP` ends the monitor loop at its next iteration.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::info;

use forgeline::core::parser::{ParseTier, parse_response};
use forgeline::core::types::{AgentRole, Mode};
use forgeline::core::validator::validate_for_mode;
use forgeline::exit_codes;
use forgeline::io::agent_client::HttpAgentClient;
use forgeline::io::checkpoint::load_checkpoint;
use forgeline::io::config::{DEFAULT_CONFIG_FILE, ForgeConfig, load_config, write_config};
use forgeline::io::generator::HttpGenerator;
use forgeline::io::project_store::ProjectStore;
use forgeline::io::task_board::HttpTaskBoard;
use forgeline::logging;
use forgeline::monitor::{LoopStop, ShutdownSignal};
use forgeline::pipeline::Services;
use forgeline::pipeline::context::PipelineContext;
use forgeline::pipeline::phases::{PhaseDriver, PipelineOutcome};
use forgeline::runtime::{AgentInvoker, InvocationRuntime};

#[derive(Parser)]
#[command(name = "forgeline", version, about = "LLM agent-chain orchestrator")]
struct Cli {
    /// Config file; defaults apply when it does not exist.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run (or resume) a project: planning phases, then the monitor loop.
    Run {
        project_id: String,
        /// Raw product spec. Optional when resuming from a checkpoint.
        #[arg(long)]
        spec: Option<PathBuf>,
    },
    /// Run only the monitor loop for a project whose tasks are seeded.
    Monitor { project_id: String },
    /// Parse raw model output and print the recovered envelope as JSON.
    Parse {
        /// Input file; reads stdin when omitted.
        file: Option<PathBuf>,
        /// Also validate against this role's gates (requires --mode).
        #[arg(long, requires = "mode")]
        role: Option<AgentRole>,
        #[arg(long, requires = "role")]
        mode: Option<Mode>,
        #[arg(long)]
        task_id: Option<String>,
    },
    /// Write a config file with every default filled in.
    InitConfig {
        /// Overwrite an existing file.
        #[arg(short, long)]
        force: bool,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run { project_id, spec } => {
            let config = load_config(&cli.config)?;
            let spec_text = spec
                .map(|path| {
                    fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))
                })
                .transpose()?;
            cmd_run(&config, &project_id, spec_text.as_deref())
        }
        Command::Monitor { project_id } => {
            let config = load_config(&cli.config)?;
            cmd_monitor(&config, &project_id)
        }
        Command::Parse {
            file,
            role,
            mode,
            task_id,
        } => cmd_parse(file.as_deref(), role.zip(mode), task_id.as_deref()),
        Command::InitConfig { force } => cmd_init_config(&cli.config, force),
    }
}

/// The agent service when configured, otherwise an in-process runtime.
fn build_invoker(config: &ForgeConfig) -> Result<Box<dyn AgentInvoker>> {
    if let Some(url) = config.pipeline.agents_url.as_deref() {
        // Repairs and retries all happen behind one service call.
        let calls = (config.runtime.max_attempts * (config.runtime.max_repairs + 1)).max(1);
        let budget = config.generator.timeout() * calls;
        info!(agents_url = url, "using agent service");
        return Ok(Box::new(HttpAgentClient::new(url, budget)?));
    }
    let generator = HttpGenerator::from_config(&config.generator)?;
    if !generator.is_configured() {
        bail!("no generator API key; set FORGELINE_GENERATOR_API_KEY or pipeline.agents_url");
    }
    Ok(Box::new(InvocationRuntime::new(generator, config)?))
}

fn with_services<T>(
    config: &ForgeConfig,
    body: impl FnOnce(&Services<'_>) -> Result<T>,
) -> Result<T> {
    let invoker = build_invoker(config)?;
    let board = HttpTaskBoard::from_config(&config.board)?;
    let store = ProjectStore::new(&config.pipeline.state_dir);
    let services = Services {
        invoker: invoker.as_ref(),
        board: &board,
        store: &store,
        config,
    };
    body(&services)
}

fn shutdown_for(services: &Services<'_>, project_id: &str) -> Result<ShutdownSignal> {
    let stop_file = services.store.stop_file(project_id)?;
    Ok(ShutdownSignal::new().with_stop_file(stop_file))
}

fn cmd_run(config: &ForgeConfig, project_id: &str, spec_text: Option<&str>) -> Result<i32> {
    with_services(config, |services| {
        let shutdown = shutdown_for(services, project_id)?;
        let driver = PhaseDriver::new(services).with_shutdown(shutdown);
        Ok(match driver.run(project_id, spec_text)? {
            PipelineOutcome::Finished(stop) => stop_code(stop),
            PipelineOutcome::Failed { phase, reason } => {
                eprintln!(
                    "project {project_id} failed in {}: {reason}",
                    phase.as_str()
                );
                exit_codes::PHASE_FAILED
            }
        })
    })
}

fn cmd_monitor(config: &ForgeConfig, project_id: &str) -> Result<i32> {
    with_services(config, |services| {
        let mut ctx = load_checkpoint(services.store.state_dir(), project_id)?
            .unwrap_or_else(|| PipelineContext::new(project_id));
        let shutdown = shutdown_for(services, project_id)?;
        let driver = PhaseDriver::new(services).with_shutdown(shutdown);
        Ok(stop_code(driver.monitor(&mut ctx)?))
    })
}

fn stop_code(stop: LoopStop) -> i32 {
    match stop {
        LoopStop::Accepted => exit_codes::OK,
        LoopStop::Stopped | LoopStop::Shutdown => exit_codes::INTERRUPTED,
        LoopStop::MaxIterations => exit_codes::INCOMPLETE,
    }
}

fn cmd_parse(
    file: Option<&Path>,
    gate: Option<(AgentRole, Mode)>,
    task_id: Option<&str>,
) -> Result<i32> {
    let raw = match file {
        Some(path) => fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?,
        None => {
            let mut buf = String::new();
            std::io::stdin()
                .read_to_string(&mut buf)
                .context("read stdin")?;
            buf
        }
    };
    let outcome = parse_response(&raw, "cli-parse");
    let validation_errors =
        gate.map(|(role, mode)| validate_for_mode(&outcome.envelope, role, mode, task_id));
    let report = json!({
        "tier": outcome.tier.as_str(),
        "errors": outcome.errors,
        "envelope": outcome.envelope,
        "validation_errors": validation_errors,
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).context("serialize parse report")?
    );
    Ok(if outcome.tier == ParseTier::Failed {
        exit_codes::UNPARSEABLE
    } else {
        exit_codes::OK
    })
}

fn cmd_init_config(path: &Path, force: bool) -> Result<i32> {
    if path.exists() && !force {
        bail!(
            "{} already exists; pass --force to overwrite",
            path.display()
        );
    }
    write_config(path, &ForgeConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_spec() {
        let cli = Cli::parse_from(["forgeline", "run", "demo", "--spec", "spec.md"]);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
        assert!(matches!(
            cli.command,
            Command::Run { ref project_id, spec: Some(_) } if project_id == "demo"
        ));
    }

    #[test]
    fn parse_gate_requires_both_role_and_mode() {
        assert!(Cli::try_parse_from(["forgeline", "parse", "--role", "qa"]).is_err());
        let cli = Cli::parse_from([
            "forgeline",
            "--config",
            "alt.toml",
            "parse",
            "out.txt",
            "--role",
            "qa",
            "--mode",
            "validate_task",
        ]);
        assert_eq!(cli.config, PathBuf::from("alt.toml"));
        assert!(matches!(
            cli.command,
            Command::Parse {
                role: Some(AgentRole::Qa),
                mode: Some(Mode::ValidateTask),
                ..
            }
        ));
    }

    #[test]
    fn stop_reasons_map_to_exit_codes() {
        assert_eq!(stop_code(LoopStop::Accepted), exit_codes::OK);
        assert_eq!(stop_code(LoopStop::Shutdown), exit_codes::INTERRUPTED);
        assert_eq!(stop_code(LoopStop::MaxIterations), exit_codes::INCOMPLETE);
    }
}
