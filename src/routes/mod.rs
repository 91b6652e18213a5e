mod error;
mod health;
mod metrics;
mod model_info;
mod predict;

use crate::{model_service::ModelService, server::SharedState};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};

pub use error::ApiError;
pub use health::healthcheck;
pub use metrics::metrics_handler;
pub use model_info::model_info;
pub use predict::{predict, predict_batch};

/// Slack for multipart boundaries and headers on top of the image bytes.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn api_routes<M: ModelService>(state: &SharedState<M>) -> Router<SharedState<M>> {
    let max_bytes = state.preprocessor.max_bytes();
    let single_limit = max_bytes.saturating_add(MULTIPART_OVERHEAD);
    let batch_limit = max_bytes
        .saturating_mul(state.api_config.max_batch_size)
        .saturating_add(MULTIPART_OVERHEAD);

    Router::new()
        .route("/health", get(healthcheck::<M>))
        .route("/model/info", get(model_info::<M>))
        .route(
            "/predict",
            post(predict::<M>).layer(DefaultBodyLimit::max(single_limit)),
        )
        .route(
            "/predict/batch",
            post(predict_batch::<M>).layer(DefaultBodyLimit::max(batch_limit)),
        )
        .route("/metrics", get(metrics_handler::<M>))
}
