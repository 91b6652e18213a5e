use crate::{
    config::Config,
    ort_service::OrtModelService,
    server::{spawn_model_loader, HttpServer, SharedState},
    state::ClassRegistry,
    telemetry::Metrics,
};
use std::sync::Arc;
use tokio::signal;

pub async fn start_app(config: Config) -> anyhow::Result<()> {
    let registry = match ClassRegistry::load(
        &config.model.get_classes_path(),
        config.model.num_classes,
    ) {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            tracing::error!("Failed to load class registry: {}", e);
            return Err(e.into());
        }
    };
    let metrics = Arc::new(Metrics::new()?);

    let state = SharedState::<OrtModelService>::new(&config, registry, metrics);
    let server = HttpServer::new(state.clone(), &config).await?;

    let model_config = config.model.clone();
    let preprocessing = config.preprocessing.clone();
    spawn_model_loader(state, move || {
        OrtModelService::new(&model_config, &preprocessing)
    });

    server
        .run(async {
            shutdown_signal().await;
            tracing::info!("Shutdown signal received, starting graceful shutdown");
        })
        .await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
