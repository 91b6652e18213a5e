use crate::{model_service::ModelService, server::SharedState};
use axum::{extract::State, response::Json};
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize)]
pub struct Health {
    status: String,
    model_loaded: bool,
    model_status: String,
}

/// Liveness probe; answers 200 whatever the model state.
pub async fn healthcheck<M: ModelService>(State(state): State<SharedState<M>>) -> Json<Health> {
    Json(Health {
        status: "healthy".into(),
        model_loaded: state.is_model_loaded(),
        model_status: state.model_status().into(),
    })
}
