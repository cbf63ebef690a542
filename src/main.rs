use std::{process, sync::Arc};

use sosta::{
    cache::{CacheState, spawn_sweeper},
    config,
    infra::{bootstrap, error::InfraError, http, telemetry},
    proxy::UpstreamClient,
    request_log::RequestLogService,
    storage::StorageRegistry,
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

fn report_application_error(error: &InfraError) {
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

async fn run() -> Result<(), InfraError> {
    let (_cli_args, settings) = config::load_with_cli()
        .map_err(|err| InfraError::configuration(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging)?;
    info!(upstream = %settings.upstream.url, "starting sosta");

    let registry = Arc::new(StorageRegistry::with_builtin_plugins());
    let tiers = Arc::new(bootstrap::build_tiers(&registry, &settings.cache).await?);
    let cache_service = Arc::new(bootstrap::build_cache_service(
        &settings.cache,
        tiers.clone(),
    )?);

    let request_log = if settings.request_log.enabled {
        let adapter = registry
            .create_adapter(
                settings.request_log.storage.kind(),
                &settings.request_log.storage,
            )
            .await?;
        Some(Arc::new(RequestLogService::new(
            Arc::from(adapter),
            settings.request_log.ttl,
        )))
    } else {
        None
    };

    let upstream = UpstreamClient::new(&settings.upstream)?;

    let sweeper = if settings.cache.enabled {
        Some(spawn_sweeper(tiers.clone(), settings.cache.cleanup_interval))
    } else {
        None
    };

    let state = http::AppState {
        cache: CacheState {
            service: cache_service,
        },
        upstream,
        registry,
        request_log,
    };
    let router = http::build_router(state);

    let result = http::serve(settings.server.addr, router).await;

    if let Some(handle) = sweeper {
        handle.abort();
        let _ = handle.await;
    }
    tiers.close_all().await;

    result
}
