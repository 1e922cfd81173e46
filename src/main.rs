use std::{process, sync::Arc};

use axum::Router;
use cachekeeper::{
    cache::{CacheEngine, CdnPurger, HttpPurger, NoopPurger},
    config::{self, CheckArgs, Settings},
    error::AppError,
    infra::{error::InfraError, http, telemetry},
};
use tracing::{Dispatch, Level, dispatcher, error, info, warn};
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

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Check(args) => run_check(settings, args),
    }
}

fn build_engine(settings: &Settings) -> Result<CacheEngine, AppError> {
    let purger: Arc<dyn CdnPurger> = match &settings.edge.purge_endpoint {
        Some(endpoint) => Arc::new(HttpPurger::new(
            endpoint.as_str(),
            settings.edge.purge_token.clone(),
        )?),
        None => Arc::new(NoopPurger),
    };

    Ok(CacheEngine::builder(settings.cache.clone())
        .purger(purger)
        .build()?)
}

fn run_check(settings: Settings, args: CheckArgs) -> Result<(), AppError> {
    let engine = build_engine(&settings)?;
    let rules = engine.invalidation().rules();
    info!(
        rules = rules.len(),
        routes = settings.http.routes.len(),
        "Configuration and invalidation rules are valid"
    );

    if args.print_rules {
        let rendered = serde_json::to_string_pretty(&rules)
            .map_err(|err| AppError::unexpected(format!("failed to render rules: {err}")))?;
        println!("{rendered}");
    }
    Ok(())
}

async fn run_serve(settings: Settings) -> Result<(), AppError> {
    let engine = Arc::new(build_engine(&settings)?);
    engine.start();

    let warming = engine.clone();
    tokio::spawn(async move {
        let pass = warming.warm_on_startup().await;
        info!(tasks = pass.results().len(), "Startup warming finished");
    });

    let router = http::build_router(
        engine.clone(),
        Arc::new(settings.http.clone()),
        Router::new(),
    );

    let addr = settings.server.addr;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|source| InfraError::Bind { addr, source })?;
    info!(%addr, "Serving cache endpoints");

    let served = axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(InfraError::from);

    let aborted = engine.shutdown(settings.server.graceful_shutdown).await;
    if aborted > 0 {
        warn!(aborted, "Background tasks aborted after grace period");
    }

    served?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
