use std::{io::Write, path::Path, process, sync::Arc};

use serde::Serialize;
use tiercache::{
    cache::InvalidationBindings,
    config::{self, Command, Settings},
    error::AppError,
    infra::{error::InfraError, telemetry},
    replay::{self, Scenario, registry_from_settings},
    warm::{FixtureSource, WarmCommand},
};
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let (cli_args, settings) = config::load_with_cli()?;
    let command = cli_args.command.unwrap_or(Command::Namespaces);

    telemetry::init(&settings.logging)?;

    match command {
        Command::Namespaces => run_namespaces(&settings),
        Command::Bindings => print_json(&InvalidationBindings::table()),
        Command::Replay(args) => run_replay(&settings, &args.file).await,
        Command::Warm(args) => run_warm(&settings, &args.file, args.follow).await,
    }
}

fn run_namespaces(settings: &Settings) -> Result<(), AppError> {
    let registry = registry_from_settings(settings);
    print_json(&registry.policies())
}

async fn run_replay(settings: &Settings, file: &Path) -> Result<(), AppError> {
    info!(file = %file.display(), "Replaying cache scenario");
    let scenario = Scenario::load(file).await?;
    let report = replay::replay(settings, &scenario).await?;
    print_json(&report)
}

async fn run_warm(settings: &Settings, file: &Path, follow: bool) -> Result<(), AppError> {
    info!(file = %file.display(), "Warming cache from fixture");
    let source = FixtureSource::load(file).await?;
    let command = WarmCommand::new(settings, Arc::new(source));
    print_json(&command.run_once().await)?;

    if !follow {
        return Ok(());
    }

    let handle = command.spawn_periodic();
    let interrupted = tokio::signal::ctrl_c().await;
    handle.abort();
    let _ = handle.await;
    interrupted.map_err(InfraError::from)?;

    info!("Periodic warming stopped");
    print_json(&command.registry().all_stats())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<(), AppError> {
    let rendered = serde_json::to_string_pretty(value)?;
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{rendered}").map_err(InfraError::from)?;
    Ok(())
}
