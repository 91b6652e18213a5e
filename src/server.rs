use crate::{
    config::{ApiConfig, Config, ModelConfig},
    model_handler::ModelHandler,
    model_service::{ModelLoadError, ModelService},
    preprocessing::Preprocessor,
    routes::{api_routes, ApiError},
    state::ClassRegistry,
    telemetry::Metrics,
};
use axum::Router;
use axum_prometheus::PrometheusMetricLayer;
use std::{
    any::Any,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, OnceLock},
};
use tokio::{net::TcpListener, task::JoinHandle};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Outcome of the one-time model load.
pub enum ModelState<M: ModelService> {
    Ready(Arc<ModelHandler<M>>),
    Failed(String),
}

pub struct SharedState<M: ModelService> {
    pub model: Arc<OnceLock<ModelState<M>>>,
    pub registry: Arc<ClassRegistry>,
    pub preprocessor: Arc<Preprocessor>,
    pub model_config: Arc<ModelConfig>,
    pub api_config: ApiConfig,
    pub metrics: Arc<Metrics>,
}

impl<M: ModelService> Clone for SharedState<M> {
    fn clone(&self) -> Self {
        Self {
            model: self.model.clone(),
            registry: self.registry.clone(),
            preprocessor: self.preprocessor.clone(),
            model_config: self.model_config.clone(),
            api_config: self.api_config.clone(),
            metrics: self.metrics.clone(),
        }
    }
}

impl<M: ModelService> SharedState<M> {
    pub fn new(config: &Config, registry: Arc<ClassRegistry>, metrics: Arc<Metrics>) -> Self {
        Self {
            model: Arc::new(OnceLock::new()),
            registry,
            preprocessor: Arc::new(Preprocessor::new(&config.preprocessing, &config.upload)),
            model_config: Arc::new(config.model.clone()),
            api_config: config.api.clone(),
            metrics,
        }
    }

    /// Records the load outcome. The slot is written once; later writes are ignored.
    pub fn set_model(&self, result: Result<ModelHandler<M>, ModelLoadError>) {
        let state = match result {
            Ok(handler) => {
                tracing::info!("Model `{}` is ready", self.model_config.name);
                ModelState::Ready(Arc::new(handler))
            }
            Err(e) => {
                tracing::error!(
                    "Failed to load model `{}`, serving in degraded mode: {}",
                    self.model_config.name,
                    e
                );
                ModelState::Failed(e.to_string())
            }
        };
        if self.model.set(state).is_err() {
            tracing::warn!("Model state was already set, ignoring reload");
        }
    }

    pub fn is_model_loaded(&self) -> bool {
        matches!(self.model.get(), Some(ModelState::Ready(_)))
    }

    pub fn model_status(&self) -> &'static str {
        match self.model.get() {
            None => "loading",
            Some(ModelState::Ready(_)) => "ready",
            Some(ModelState::Failed(_)) => "failed",
        }
    }

    pub fn ready_model(&self) -> Result<Arc<ModelHandler<M>>, ApiError> {
        match self.model.get() {
            Some(ModelState::Ready(handler)) => Ok(handler.clone()),
            Some(ModelState::Failed(reason)) => Err(ApiError::ServiceUnavailable(format!(
                "model not loaded: {}",
                reason
            ))),
            None => Err(ApiError::ServiceUnavailable(
                "model is still loading".to_string(),
            )),
        }
    }
}

/// Loads the classifier on the blocking pool and publishes it into the state.
/// A panicking loader is recorded as a failed load.
pub fn spawn_model_loader<M, F>(state: SharedState<M>, load: F) -> JoinHandle<()>
where
    M: ModelService,
    F: FnOnce() -> Result<M, ModelLoadError> + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let registry = state.registry.clone();
        let result = panic::catch_unwind(AssertUnwindSafe(move || {
            load().and_then(|model| ModelHandler::new(model, registry))
        }))
        .unwrap_or_else(|payload| {
            Err(ModelLoadError::Task(panic_message(payload.as_ref())))
        });
        state.set_model(result);
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("model loader panicked: {}", message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("model loader panicked: {}", message)
    } else {
        "model loader panicked".to_string()
    }
}

pub fn build_router<M: ModelService>(state: SharedState<M>) -> Router {
    api_routes(&state)
        .with_state(state)
        .layer(PrometheusMetricLayer::new())
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

pub struct HttpServer {
    router: Router,
    listener: TcpListener,
}

impl HttpServer {
    pub async fn new<M: ModelService>(
        state: SharedState<M>,
        config: &Config,
    ) -> anyhow::Result<Self> {
        let addr = config.server.get_address();
        let router = build_router(state);
        let listener = TcpListener::bind(&addr).await?;

        Ok(Self { router, listener })
    }

    pub async fn run(self, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
        tracing::info!("Starting app on {}", self.listener.local_addr()?);

        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await?;

        Ok(())
    }
}
