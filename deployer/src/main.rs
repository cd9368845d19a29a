//! nixdeploy - Entry Point
//!
//! Deploys a NixOS configuration to a remote host over SSH.

use std::env;
use std::sync::Arc;

use anyhow::Context;
use colored::Colorize;
use secrecy::SecretString;
use tracing::{error, info};

use nixdeploy::app::cli::{self, CliArgs, Command};
use nixdeploy::app::options::DeployOptions;
use nixdeploy::app::run::run;
use nixdeploy::errors::DeployError;
use nixdeploy::eval::evaluate;
use nixdeploy::filesys::file::File;
use nixdeploy::logs::{init_logging, LogLevel, LogOptions};
use nixdeploy::models::request::DeployRequest;
use nixdeploy::models::secrets::SecretBundle;
use nixdeploy::session::runner::{CommandRunner, ProcessRunner};
use nixdeploy::storage::settings::Settings;
use nixdeploy::utils::version_info;

const SSH_KEY_ENV_VAR: &str = "NIXDEPLOY_SSH_PRIVATE_KEY";

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().skip(1).collect();

    let cli = match cli::parse_command(&args) {
        Command::Version => {
            match serde_json::to_string_pretty(&version_info()) {
                Ok(json) => println!("{}", json),
                Err(e) => eprintln!("{}", e),
            }
            return;
        }
        Command::Help => {
            println!("{}", cli::USAGE);
            return;
        }
        Command::Positional(positional) => Invocation::Positional(positional),
        Command::Deploy(flags) => Invocation::Named(flags),
    };

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);

    let (settings, request) = match prepare(&cli, runner.as_ref()).await {
        Ok(prepared) => prepared,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("{} {:#}", "[ERROR]".red().bold(), e);
            std::process::exit(1);
        }
    };

    let mut options = DeployOptions::from_settings(&settings);
    if let Ok(key) = env::var(SSH_KEY_ENV_VAR) {
        if !key.trim().is_empty() && key.trim() != "-" {
            options.ssh.identity_key = Some(SecretString::from(key));
        }
    }
    if let Invocation::Named(flags) = &cli {
        if let Some(path) = flags.get("ssh-key-file") {
            options.ssh.identity_file = Some(path.into());
        }
    }

    match run(&request, &options, runner, await_shutdown_signal()).await {
        Ok(outcome) => {
            match serde_json::to_string(&outcome) {
                Ok(json) => println!("{}", json),
                Err(e) => error!("Unable to serialize deploy outcome: {}", e),
            }
            eprintln!(
                "{} {} is active on {}",
                "[SUCCESS]".green().bold(),
                outcome.out_path,
                outcome.target
            );
            for warning in &outcome.prune.warnings {
                eprintln!("{} {}", "[WARNING]".yellow().bold(), warning);
            }
        }
        Err(e) => {
            report_failure(&e);
            std::process::exit(e.exit_code());
        }
    }
}

enum Invocation {
    Positional(Vec<String>),
    Named(CliArgs),
}

/// Load settings, start logging and build the request
async fn prepare(
    cli: &Invocation,
    runner: &dyn CommandRunner,
) -> anyhow::Result<(Settings, DeployRequest)> {
    match cli {
        Invocation::Positional(args) => {
            let settings = Settings::default();
            let request = DeployRequest::from_positional(args)?;
            start_logging(&settings, request.verbose.then_some(LogLevel::Debug));
            Ok((settings, request))
        }
        Invocation::Named(flags) => {
            let settings = match flags.get("config") {
                Some(path) => Settings::load(&File::new(path)).await?,
                None => Settings::default(),
            };
            let verbose = flags.bool_flag("verbose", false)?;
            let level = match flags.get("log-level") {
                Some(level) => Some(level.parse::<LogLevel>().map_err(anyhow::Error::msg)?),
                None => verbose.then_some(LogLevel::Debug),
            };
            start_logging(&settings, level);

            let secrets = match flags.get("secrets-file") {
                Some(path) => {
                    let json = File::new(path)
                        .read_string()
                        .await
                        .with_context(|| format!("Unable to read secrets file {}", path))?;
                    SecretBundle::from_json(&json)?
                }
                None => SecretBundle::new(),
            };

            let eval = match cli::eval_request_from_flags(flags)? {
                Some(eval_request) => Some(
                    evaluate(runner, &eval_request)
                        .await
                        .context("Unable to evaluate the NixOS configuration")?,
                ),
                None => None,
            };
            if let Some(eval) = &eval {
                info!("Evaluated {} ({})", eval.out_path, eval.current_system);
            }

            let request = cli::request_from_flags(flags, eval.as_ref(), secrets)?;
            Ok((settings, request))
        }
    }
}

fn start_logging(settings: &Settings, level: Option<LogLevel>) {
    let log_options = LogOptions {
        log_level: level.unwrap_or_else(|| settings.log_level.clone()),
        json_format: settings.log_json,
        log_dir: settings.log_dir.clone(),
        ..Default::default()
    };
    if let Err(e) = init_logging(log_options) {
        eprintln!("Failed to initialize logging: {e}");
    }
}

fn report_failure(e: &DeployError) {
    if e.is_partial_activation() {
        eprintln!(
            "{} {}\nThe profile was switched but activation did not complete. \
             Inspect the target before deploying again.",
            "[PARTIALLY APPLIED]".yellow().bold(),
            e
        );
    } else {
        eprintln!("{} {}", "[ERROR]".red().bold(), e);
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => {
                        info!("SIGTERM received, stopping deploy...");
                    }
                    _ = sigint.recv() => {
                        info!("SIGINT received, stopping deploy...");
                    }
                }
            }
            _ => {
                error!("Unable to install signal handlers, falling back to Ctrl+C");
                ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c().await;
}

async fn ctrl_c() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Ctrl+C received, stopping deploy...");
    } else {
        // Never resolve: without a handler there is nothing to wait for
        std::future::pending::<()>().await;
    }
}
