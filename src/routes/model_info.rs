use crate::{
    model_service::ModelService,
    server::{ModelState, SharedState},
};
use axum::{extract::State, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct ModelInfo {
    model_loaded: bool,
    model_name: String,
    model_source: Option<String>,
    model_path: String,
    input_size: [u32; 2],
    num_classes: usize,
    classes: Vec<String>,
    input_shape: Vec<i64>,
    output_shape: Option<Vec<i64>>,
    input_tensor: String,
    output_tensor: String,
    output_kind: Option<&'static str>,
}

/// Static model metadata. Keeps the same shape while the model is unavailable.
pub async fn model_info<M: ModelService>(State(state): State<SharedState<M>>) -> Json<ModelInfo> {
    let (width, height) = state.preprocessor.input_size();
    let model_config = &state.model_config;

    let mut info = ModelInfo {
        model_loaded: false,
        model_name: model_config.name.clone(),
        model_source: model_config.source.clone(),
        model_path: model_config.get_path().display().to_string(),
        input_size: [width, height],
        num_classes: state.registry.len(),
        classes: state.registry.labels().to_vec(),
        input_shape: vec![1, height as i64, width as i64, 3],
        output_shape: None,
        input_tensor: model_config.input_tensor.clone(),
        output_tensor: model_config.output_tensor.clone(),
        output_kind: None,
    };

    if let Some(ModelState::Ready(handler)) = state.model.get() {
        let descriptor = handler.descriptor();
        info.model_loaded = true;
        info.input_shape = descriptor.input_shape.clone();
        info.output_shape = Some(descriptor.output_shape.clone());
        info.input_tensor = descriptor.input_tensor.clone();
        info.output_tensor = descriptor.output_tensor.clone();
        info.output_kind = Some(descriptor.output_kind.as_str());
    }

    Json(info)
}
