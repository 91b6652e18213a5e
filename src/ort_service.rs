use crate::{
    config::{ModelConfig, PreprocessingConfig},
    model_service::{InferenceError, ModelDescriptor, ModelLoadError, ModelService, OutputKind},
};
use ndarray::{Array2, ArrayView4, CowArray, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// ONNX Runtime classifier backed by a round-robin pool of sessions.
#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    descriptor: ModelDescriptor,
}

impl OrtModelService {
    pub fn new(
        model_config: &ModelConfig,
        preprocessing: &PreprocessingConfig,
    ) -> Result<Self, ModelLoadError> {
        let model_path = model_config.get_path();
        if !model_path.exists() {
            return Err(ModelLoadError::MissingFile(model_path));
        }

        ort::init().with_name("pet_classifier").commit()?;

        let num_instances = model_config.num_instances.max(1);
        let sessions = (0..num_instances)
            .map(|_| {
                let mut builder = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?;
                if let Some(threads) = model_config.intra_threads {
                    builder = builder.with_intra_threads(threads)?;
                }
                let session = builder.commit_from_file(&model_path)?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()?;

        let descriptor = {
            let session = sessions[0].lock();
            describe_session(&session, model_config, preprocessing)?
        };

        tracing::info!(
            "Created {} ONNX sessions from {:?} (input `{}` {:?}, output `{}` {:?}, {})",
            num_instances,
            model_path,
            descriptor.input_tensor,
            descriptor.input_shape,
            descriptor.output_tensor,
            descriptor.output_shape,
            descriptor.output_kind.as_str()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            descriptor,
        })
    }
}

fn describe_session(
    session: &Session,
    model_config: &ModelConfig,
    preprocessing: &PreprocessingConfig,
) -> Result<ModelDescriptor, ModelLoadError> {
    let input = session
        .inputs
        .iter()
        .find(|input| input.name == model_config.input_tensor)
        .ok_or_else(|| ModelLoadError::TensorNotFound {
            kind: "input",
            name: model_config.input_tensor.clone(),
            available: session.inputs.iter().map(|i| i.name.clone()).collect(),
        })?;
    let output = session
        .outputs
        .iter()
        .find(|output| output.name == model_config.output_tensor)
        .ok_or_else(|| ModelLoadError::TensorNotFound {
            kind: "output",
            name: model_config.output_tensor.clone(),
            available: session.outputs.iter().map(|o| o.name.clone()).collect(),
        })?;

    let input_shape: Vec<i64> = input
        .input_type
        .tensor_shape()
        .map(|dims| dims.iter().copied().collect())
        .ok_or_else(|| ModelLoadError::UnsupportedShape("input is not a tensor".into()))?;
    let output_shape: Vec<i64> = output
        .output_type
        .tensor_shape()
        .map(|dims| dims.iter().copied().collect())
        .ok_or_else(|| ModelLoadError::UnsupportedShape("output is not a tensor".into()))?;

    validate_input_shape(&input_shape, preprocessing)?;

    let output_width = output_shape.last().copied().unwrap_or(-1);
    let output_kind = OutputKind::from_output_width(
        output_width,
        model_config.num_classes,
        model_config.output_logits,
    )
    .ok_or_else(|| {
        ModelLoadError::UnsupportedShape(format!(
            "output {:?} does not match {} classes",
            output_shape, model_config.num_classes
        ))
    })?;

    Ok(ModelDescriptor {
        input_tensor: model_config.input_tensor.clone(),
        output_tensor: model_config.output_tensor.clone(),
        input_shape,
        output_shape,
        output_kind,
    })
}

/// Expects NHWC with three channels; spatial dims must match the resize target or be dynamic.
fn validate_input_shape(
    shape: &[i64],
    preprocessing: &PreprocessingConfig,
) -> Result<(), ModelLoadError> {
    let matches = |dim: i64, expected: u32| dim < 0 || dim == expected as i64;

    if shape.len() != 4
        || !matches(shape[1], preprocessing.input_height)
        || !matches(shape[2], preprocessing.input_width)
        || !matches(shape[3], 3)
    {
        return Err(ModelLoadError::UnsupportedShape(format!(
            "input {:?} is not compatible with [N, {}, {}, 3]",
            shape, preprocessing.input_height, preprocessing.input_width
        )));
    }
    Ok(())
}

/// Row-major copy of `input`, borrowed when the view already is.
fn standard_layout(input: ArrayView4<'_, f32>) -> CowArray<'_, f32, Ix4> {
    if input.is_standard_layout() {
        CowArray::from(input)
    } else {
        CowArray::from(input.to_owned())
    }
}

/// Splits a flat output buffer into one row per image.
fn split_rows(values: Vec<f32>, batch: usize) -> Result<Array2<f32>, InferenceError> {
    if batch == 0 || values.is_empty() || values.len() % batch != 0 {
        return Err(InferenceError::Output(format!(
            "{} values cannot be split into {} rows",
            values.len(),
            batch
        )));
    }
    let width = values.len() / batch;

    Array2::from_shape_vec((batch, width), values)
        .map_err(|e| InferenceError::Output(format!("invalid tensor shape: {}", e)))
}

impl ModelService for OrtModelService {
    fn run(&self, input: ArrayView4<'_, f32>) -> Result<Array2<f32>, InferenceError> {
        let batch = input.shape()[0];
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index].lock();

        tracing::debug!("Handling batch of {} with session {}", batch, index);
        let input = standard_layout(input);
        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| InferenceError::Runtime(format!("failed to build tensor: {}", e)))?;

        let outputs = session
            .run(ort::inputs![self.descriptor.input_tensor.as_str() => tensor_ref])
            .map_err(|e| InferenceError::Runtime(e.to_string()))?;

        let output = outputs[self.descriptor.output_tensor.as_str()]
            .try_extract_array::<f32>()
            .map_err(|e| InferenceError::Output(format!("failed to extract tensor: {}", e)))?;

        split_rows(output.iter().copied().collect(), batch)
    }

    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }
}
