use ndarray::{Array2, ArrayView4};
use serde::Serialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelLoadError {
    #[error("Model file not found: {0:?}")]
    MissingFile(PathBuf),
    #[error("ONNX runtime error: {0}")]
    Runtime(#[from] ort::Error),
    #[error("Model has no {kind} tensor named `{name}`, available: {available:?}")]
    TensorNotFound {
        kind: &'static str,
        name: String,
        available: Vec<String>,
    },
    #[error("Unsupported model shape: {0}")]
    UnsupportedShape(String),
    #[error("Model loading task failed: {0}")]
    Task(String),
}

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference failed: {0}")]
    Runtime(String),
    #[error("unexpected model output: {0}")]
    Output(String),
    #[error("class lookup failed: {0}")]
    Label(#[from] crate::state::IndexOutOfRange),
}

/// How raw model output maps to class scores, fixed when the model is loaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputKind {
    /// A single probability for class 1.
    BinarySigmoid,
    /// One value per class, optionally logits.
    MulticlassSoftmax { from_logits: bool },
}

impl OutputKind {
    /// Picks the output kind from the trailing output dimension.
    pub fn from_output_width(width: i64, num_classes: usize, from_logits: bool) -> Option<Self> {
        if width == 1 && num_classes == 2 {
            Some(OutputKind::BinarySigmoid)
        } else if width > 1 && width as usize == num_classes {
            Some(OutputKind::MulticlassSoftmax { from_logits })
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OutputKind::BinarySigmoid => "binary_sigmoid",
            OutputKind::MulticlassSoftmax { .. } => "multiclass_softmax",
        }
    }

    pub fn output_width(&self, num_classes: usize) -> usize {
        match self {
            OutputKind::BinarySigmoid => 1,
            OutputKind::MulticlassSoftmax { .. } => num_classes,
        }
    }
}

/// Static facts about a loaded classifier.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModelDescriptor {
    pub input_tensor: String,
    pub output_tensor: String,
    /// `-1` marks a dynamic dimension.
    pub input_shape: Vec<i64>,
    pub output_shape: Vec<i64>,
    pub output_kind: OutputKind,
}

impl ModelDescriptor {
    /// A fixed leading dimension of 1 forbids stacking several images in one pass.
    pub fn accepts_batches(&self) -> bool {
        self.input_shape.first().map_or(true, |&dim| dim != 1)
    }
}

pub trait ModelService: Send + Sync + 'static {
    /// Runs one forward pass over an NHWC batch, returning one row of raw output per image.
    fn run(&self, input: ArrayView4<'_, f32>) -> Result<Array2<f32>, InferenceError>;

    fn descriptor(&self) -> &ModelDescriptor;
}
