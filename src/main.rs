mod cli;
mod client;
mod cloud;
mod config;
mod docker;
mod error;
mod event;
mod k8s;
mod model;
mod orchestrator;
mod session;
mod template;
mod tunnel;
mod ui;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{BoxCommand, CliArgs, Command};
use client::CreateOptions;
use config::HckConfig;
use error::{BoxError, compact_error};
use event::EventBus;
use model::ResourceSize;
use orchestrator::{BoxOrchestrator, ConfigClientFactory};
use session::{BoxStreams, interrupt_token};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let args = CliArgs::parse();
    if let Err(error) = init_tracing(&args.log_filter) {
        eprintln!("{}", compact_error(&error));
        return ExitCode::FAILURE;
    }

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            eprintln!("{}", compact_error(&error));
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .try_init();

    Ok(())
}

async fn run(args: CliArgs) -> Result<()> {
    let config = HckConfig::load(args.config.as_deref())?;
    if let Some(source) = &config.source {
        debug!(path = %source.display(), "configuration loaded");
    }

    let events = Arc::new(EventBus::new());
    ui::subscribe_terminal(&events);
    let orchestrator = BoxOrchestrator::new(Box::new(ConfigClientFactory::new(
        config.clone(),
        events.clone(),
    )));

    let Command::Box(command) = args.command;
    let output = run_box_command(command, &config, &orchestrator).await;
    // drain progress before printing the result
    events.close().await;

    let output = output?;
    if !output.is_empty() {
        print!("{output}");
    }
    Ok(())
}

async fn run_box_command(
    command: BoxCommand,
    config: &HckConfig,
    orchestrator: &BoxOrchestrator,
) -> Result<String> {
    match command {
        BoxCommand::Create {
            template,
            target,
            size,
        } => {
            let provider = target.provider.unwrap_or(config.box_.provider);
            let opts = create_options(&template, size, config)?;
            let info = orchestrator.create(provider, opts).await?;
            Ok(format!("{}\n", info.name))
        }
        BoxCommand::Open {
            template,
            target,
            size,
            attach,
        } => {
            let provider = target.provider.unwrap_or(config.box_.provider);
            let opts = create_options(&template, size, config)?;
            orchestrator
                .open(
                    provider,
                    opts,
                    BoxStreams::standard(),
                    attach.mode(),
                    interrupt_token(),
                )
                .await?;
            Ok(String::new())
        }
        BoxCommand::Connect {
            name,
            target,
            attach,
        } => {
            orchestrator
                .connect(
                    target.provider,
                    &name,
                    BoxStreams::standard(),
                    attach.mode(),
                    interrupt_token(),
                )
                .await?;
            Ok(String::new())
        }
        BoxCommand::Describe {
            name,
            target,
            format,
        } => {
            let details = orchestrator.describe(target.provider, &name).await?;
            ui::render_details(&details, format)
        }
        BoxCommand::List { target } => {
            let reports = orchestrator.list(target.provider).await?;
            Ok(ui::render_list(&reports))
        }
        BoxCommand::Delete { names, all, target } => {
            let report = orchestrator.delete(target.provider, &names, all).await?;
            if let Some(missing) = report.missing.first() {
                print!("{}", ui::render_delete(&report));
                return Err(BoxError::not_found(missing.as_str()).into());
            }
            Ok(ui::render_delete(&report))
        }
    }
}

fn create_options(
    reference: &str,
    size: Option<ResourceSize>,
    config: &HckConfig,
) -> Result<CreateOptions> {
    let loaded = template::load(reference, &config.box_.template_dir)?;
    Ok(CreateOptions {
        template: loaded.template,
        source: loaded.source,
        size: size.unwrap_or(config.box_.size),
    })
}
