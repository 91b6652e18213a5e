use super::ApiError;
use crate::{
    model_handler::{Prediction, PredictionResult},
    model_service::ModelService,
    preprocessing::Upload,
    server::SharedState,
};
use axum::{
    extract::{
        multipart::{Multipart, MultipartRejection},
        State,
    },
    response::Json,
};
use serde::Serialize;
use std::time::Instant;
use tracing::instrument;

const IMAGE_FIELD: &str = "image";

#[derive(Serialize, Debug, Clone)]
pub struct ClassScore {
    #[serde(rename = "class")]
    class_label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    probability: Option<String>,
}

impl ClassScore {
    fn new(prediction: &Prediction, include_scores: bool) -> Self {
        Self {
            class_label: prediction.label.clone(),
            confidence: include_scores.then_some(prediction.score),
            probability: include_scores.then(|| format!("{:.2}%", prediction.score * 100.)),
        }
    }
}

#[derive(Serialize, Debug)]
pub struct PredictResponse {
    success: bool,
    model: String,
    predictions: Vec<ClassScore>,
    top_prediction: Option<ClassScore>,
    #[serde(skip_serializing_if = "Option::is_none")]
    raw_prediction: Option<f32>,
}

#[derive(Serialize, Debug)]
pub struct BatchItem {
    file_name: Option<String>,
    predictions: Vec<ClassScore>,
    top_prediction: Option<ClassScore>,
}

#[derive(Serialize, Debug)]
pub struct BatchResponse {
    success: bool,
    model: String,
    results: Vec<BatchItem>,
}

fn render(result: &PredictionResult, include_scores: bool) -> (Vec<ClassScore>, Option<ClassScore>) {
    let predictions: Vec<ClassScore> = result
        .predictions
        .iter()
        .map(|prediction| ClassScore::new(prediction, include_scores))
        .collect();
    let top_prediction = predictions.first().cloned();
    (predictions, top_prediction)
}

async fn read_image_fields(
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Vec<Upload>, ApiError> {
    let mut multipart = multipart?;
    let mut uploads = Vec::new();

    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(IMAGE_FIELD) {
            continue;
        }
        // Plain form values named `image` are not files.
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        if file_name.is_empty() {
            return Err(ApiError::BadRequest("no image selected".into()));
        }
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?;

        uploads.push(Upload {
            file_name: Some(file_name),
            content_type,
            bytes: bytes.to_vec(),
        });
    }

    Ok(uploads)
}

#[instrument(skip(state, multipart))]
pub async fn predict<M: ModelService>(
    State(state): State<SharedState<M>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<PredictResponse>, ApiError> {
    let mut uploads = read_image_fields(multipart).await?;
    let upload = match uploads.len() {
        0 => return Err(ApiError::BadRequest("no image provided".into())),
        1 => uploads.remove(0),
        n => {
            return Err(ApiError::BadRequest(format!(
                "expected exactly one image, got {}",
                n
            )))
        }
    };

    let handler = state.ready_model()?;
    let preprocessor = state.preprocessor.clone();
    let started = Instant::now();

    let result = tokio::task::spawn_blocking(move || -> Result<PredictionResult, ApiError> {
        let tensor = preprocessor.preprocess(&upload)?;
        handler.infer(&tensor).map_err(|e| {
            tracing::error!(
                file_name = ?upload.file_name,
                size = upload.bytes.len(),
                "Inference failed: {}",
                e
            );
            ApiError::from(e)
        })
    })
    .await
    .map_err(|e| ApiError::Internal(format!("prediction worker failed: {}", e)))??;

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.;
    state
        .metrics
        .record_inference_duration(elapsed_ms, "/predict");

    let include_scores = state.api_config.include_scores;
    let (predictions, top_prediction) = render(&result, include_scores);
    if let Some(top) = result.top() {
        state.metrics.record_prediction(&top.label);
        tracing::debug!(
            "Predicted {} ({:.3}) in {:.1} ms",
            top.label,
            top.score,
            elapsed_ms
        );
    }

    Ok(Json(PredictResponse {
        success: true,
        model: state.model_config.name.clone(),
        predictions,
        top_prediction,
        raw_prediction: result.raw_output.filter(|_| include_scores),
    }))
}

#[instrument(skip(state, multipart))]
pub async fn predict_batch<M: ModelService>(
    State(state): State<SharedState<M>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<BatchResponse>, ApiError> {
    let uploads = read_image_fields(multipart).await?;
    let max_batch_size = state.api_config.max_batch_size;
    if uploads.is_empty() {
        return Err(ApiError::BadRequest("no image provided".into()));
    }
    if uploads.len() > max_batch_size {
        return Err(ApiError::BadRequest(format!(
            "at most {} images per batch, got {}",
            max_batch_size,
            uploads.len()
        )));
    }

    let handler = state.ready_model()?;
    let preprocessor = state.preprocessor.clone();
    let file_names: Vec<Option<String>> = uploads.iter().map(|u| u.file_name.clone()).collect();
    let started = Instant::now();

    let results = tokio::task::spawn_blocking(move || -> Result<Vec<PredictionResult>, ApiError> {
        let tensors = uploads
            .iter()
            .map(|upload| {
                preprocessor.preprocess(upload).map_err(|e| {
                    let name = upload.file_name.as_deref().unwrap_or("upload");
                    match ApiError::from(e) {
                        ApiError::BadRequest(msg) => ApiError::BadRequest(format!("{}: {}", name, msg)),
                        ApiError::UnsupportedMediaType(msg) => {
                            ApiError::UnsupportedMediaType(format!("{}: {}", name, msg))
                        }
                        ApiError::PayloadTooLarge(msg) => {
                            ApiError::PayloadTooLarge(format!("{}: {}", name, msg))
                        }
                        other => other,
                    }
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()?;

        handler.infer_batch(&tensors).map_err(|e| {
            tracing::error!(batch = tensors.len(), "Batch inference failed: {}", e);
            ApiError::from(e)
        })
    })
    .await
    .map_err(|e| ApiError::Internal(format!("prediction worker failed: {}", e)))??;

    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.;
    state
        .metrics
        .record_inference_duration(elapsed_ms, "/predict/batch");

    let include_scores = state.api_config.include_scores;
    let results = results
        .iter()
        .zip(file_names)
        .map(|(result, file_name)| {
            if let Some(top) = result.top() {
                state.metrics.record_prediction(&top.label);
            }
            let (predictions, top_prediction) = render(result, include_scores);
            BatchItem {
                file_name,
                predictions,
                top_prediction,
            }
        })
        .collect();

    Ok(Json(BatchResponse {
        success: true,
        model: state.model_config.name.clone(),
        results,
    }))
}
