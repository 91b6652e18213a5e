use crate::{
    model_service::{InferenceError, ModelDescriptor, ModelLoadError, ModelService, OutputKind},
    preprocessing::ImageTensor,
    state::ClassRegistry,
};
use ndarray::{concatenate, Axis};
use serde::Serialize;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Prediction {
    pub class_index: usize,
    pub label: String,
    pub score: f32,
}

/// Predictions ordered by descending score, ties by ascending class index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    pub predictions: Vec<Prediction>,
    /// The sigmoid output before it was expanded to two scores.
    pub raw_output: Option<f32>,
}

impl PredictionResult {
    pub fn top(&self) -> Option<&Prediction> {
        self.predictions.first()
    }
}

/// Pairs a loaded classifier with the class registry and ranks its output.
pub struct ModelHandler<M: ModelService> {
    model: M,
    registry: Arc<ClassRegistry>,
}

impl<M: ModelService> ModelHandler<M> {
    pub fn new(model: M, registry: Arc<ClassRegistry>) -> Result<Self, ModelLoadError> {
        let descriptor = model.descriptor();
        let kind = descriptor.output_kind;
        let expected = match kind {
            OutputKind::BinarySigmoid => 2,
            OutputKind::MulticlassSoftmax { .. } => descriptor
                .output_shape
                .last()
                .filter(|&&width| width > 0)
                .map_or(registry.len(), |&width| width as usize),
        };
        if registry.len() != expected {
            return Err(ModelLoadError::UnsupportedShape(format!(
                "{} output needs {} classes, registry has {}",
                kind.as_str(),
                expected,
                registry.len()
            )));
        }
        Ok(Self { model, registry })
    }

    pub fn descriptor(&self) -> &ModelDescriptor {
        self.model.descriptor()
    }

    pub fn infer(&self, tensor: &ImageTensor) -> Result<PredictionResult, InferenceError> {
        let output = self.model.run(tensor.view())?;
        let row = output
            .rows()
            .into_iter()
            .next()
            .ok_or_else(|| InferenceError::Output("model returned no rows".into()))?;
        let row: Vec<f32> = row.iter().copied().collect();
        self.rank(&row)
    }

    pub fn infer_batch(
        &self,
        tensors: &[ImageTensor],
    ) -> Result<Vec<PredictionResult>, InferenceError> {
        if tensors.is_empty() {
            return Ok(Vec::new());
        }
        if !self.descriptor().accepts_batches() {
            return tensors.iter().map(|tensor| self.infer(tensor)).collect();
        }

        let views: Vec<_> = tensors.iter().map(ImageTensor::view).collect();
        let batch = concatenate(Axis(0), &views)
            .map_err(|e| InferenceError::Runtime(format!("failed to stack batch: {}", e)))?;
        let output = self.model.run(batch.view())?;
        if output.nrows() != tensors.len() {
            return Err(InferenceError::Output(format!(
                "expected {} rows, model returned {}",
                tensors.len(),
                output.nrows()
            )));
        }

        output
            .rows()
            .into_iter()
            .map(|row| {
                let row: Vec<f32> = row.iter().copied().collect();
                self.rank(&row)
            })
            .collect()
    }

    fn rank(&self, row: &[f32]) -> Result<PredictionResult, InferenceError> {
        let kind = self.descriptor().output_kind;
        let scores = class_scores(kind, row, self.registry.len())?;

        let mut predictions = scores
            .iter()
            .enumerate()
            .map(|(class_index, &score)| {
                Ok(Prediction {
                    class_index,
                    label: self.registry.label_for(class_index)?.to_string(),
                    score,
                })
            })
            .collect::<Result<Vec<_>, InferenceError>>()?;

        predictions.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.class_index.cmp(&b.class_index))
        });

        let raw_output = match kind {
            OutputKind::BinarySigmoid => row.first().copied(),
            OutputKind::MulticlassSoftmax { .. } => None,
        };

        Ok(PredictionResult {
            predictions,
            raw_output,
        })
    }
}

/// Converts one row of raw model output into per-class scores in `[0, 1]`.
pub fn class_scores(
    kind: OutputKind,
    row: &[f32],
    num_classes: usize,
) -> Result<Vec<f32>, InferenceError> {
    let expected = kind.output_width(num_classes);
    if row.len() != expected {
        return Err(InferenceError::Output(format!(
            "expected {} values, got {}",
            expected,
            row.len()
        )));
    }
    if row.iter().any(|v| !v.is_finite()) {
        return Err(InferenceError::Output(format!(
            "non-finite values in {:?}",
            row
        )));
    }

    match kind {
        OutputKind::BinarySigmoid => {
            let p = row[0];
            if !(0.0..=1.0).contains(&p) {
                return Err(InferenceError::Output(format!(
                    "sigmoid output {} is outside [0, 1]",
                    p
                )));
            }
            Ok(vec![1.0 - p, p])
        }
        OutputKind::MulticlassSoftmax { from_logits: true } => Ok(softmax(row)),
        OutputKind::MulticlassSoftmax { from_logits: false } => {
            if row.iter().any(|v| !(0.0..=1.0).contains(v)) {
                return Err(InferenceError::Output(format!(
                    "probabilities {:?} are outside [0, 1]",
                    row
                )));
            }
            Ok(row.to_vec())
        }
    }
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|v| v / sum).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array2, Array4, ArrayView4};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedModel {
        descriptor: ModelDescriptor,
        row: Vec<f32>,
        calls: AtomicUsize,
    }

    impl FixedModel {
        fn new(kind: OutputKind, batch_dim: i64, row: Vec<f32>) -> Self {
            Self {
                descriptor: ModelDescriptor {
                    input_tensor: "input_1".into(),
                    output_tensor: "dense_1".into(),
                    input_shape: vec![batch_dim, 150, 150, 3],
                    output_shape: vec![batch_dim, row.len() as i64],
                    output_kind: kind,
                },
                row,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ModelService for FixedModel {
        fn run(&self, input: ArrayView4<'_, f32>) -> Result<Array2<f32>, InferenceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let batch = input.shape()[0];
            let values = self.row.repeat(batch);
            Array2::from_shape_vec((batch, self.row.len()), values)
                .map_err(|e| InferenceError::Output(e.to_string()))
        }

        fn descriptor(&self) -> &ModelDescriptor {
            &self.descriptor
        }
    }

    fn registry() -> Arc<ClassRegistry> {
        Arc::new(ClassRegistry::from_labels(["Dog", "Cat"]).unwrap())
    }

    fn tensor() -> ImageTensor {
        ImageTensor::from_array(Array4::from_elem((1, 150, 150, 3), 0.5)).unwrap()
    }

    #[test]
    fn test_sigmoid_output_is_probability_of_class_one() {
        let model = FixedModel::new(OutputKind::BinarySigmoid, -1, vec![0.8]);
        let handler = ModelHandler::new(model, registry()).unwrap();

        let result = handler.infer(&tensor()).unwrap();

        assert_eq!(result.top().unwrap().label, "Cat");
        assert_eq!(result.predictions[0].class_index, 1);
        assert!((result.predictions[0].score - 0.8).abs() < 1e-6);
        assert_eq!(result.predictions[1].label, "Dog");
        assert!((result.predictions[1].score - 0.2).abs() < 1e-6);
        assert_eq!(result.raw_output, Some(0.8));
    }

    #[test]
    fn test_binary_scores_sum_to_one() {
        for p in [0.0, 1e-7, 0.3, 0.5, 0.999_99, 1.0] {
            let scores = class_scores(OutputKind::BinarySigmoid, &[p], 2).unwrap();
            let sum: f32 = scores.iter().sum();
            assert!((sum - 1.0).abs() <= 1e-5, "p={} sum={}", p, sum);
        }
    }

    #[test]
    fn test_ties_break_by_ascending_index() {
        let model = FixedModel::new(OutputKind::BinarySigmoid, -1, vec![0.5]);
        let handler = ModelHandler::new(model, registry()).unwrap();

        let result = handler.infer(&tensor()).unwrap();

        assert_eq!(result.predictions[0].label, "Dog");
        assert_eq!(result.predictions[1].label, "Cat");
    }

    #[test]
    fn test_infer_is_deterministic() {
        let model = FixedModel::new(OutputKind::BinarySigmoid, -1, vec![0.123_456_7]);
        let handler = ModelHandler::new(model, registry()).unwrap();
        let input = tensor();

        let first = handler.infer(&input).unwrap();
        for _ in 0..10 {
            let next = handler.infer(&input).unwrap();
            assert_eq!(next, first);
            assert_eq!(
                next.predictions[0].score.to_bits(),
                first.predictions[0].score.to_bits()
            );
        }
    }

    #[test]
    fn test_softmax_vector_is_used_directly() {
        let kind = OutputKind::MulticlassSoftmax { from_logits: false };
        let model = FixedModel::new(kind, -1, vec![0.9, 0.1]);
        let handler = ModelHandler::new(model, registry()).unwrap();

        let result = handler.infer(&tensor()).unwrap();

        assert_eq!(result.top().unwrap().label, "Dog");
        assert_eq!(result.predictions[0].score, 0.9);
        assert_eq!(result.raw_output, None);
    }

    #[test]
    fn test_logits_are_normalized() {
        let scores = class_scores(
            OutputKind::MulticlassSoftmax { from_logits: true },
            &[2.0, 0.0, -1.0],
            3,
        )
        .unwrap();

        let sum: f32 = scores.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(scores[0] > scores[1] && scores[1] > scores[2]);
    }

    #[test]
    fn test_malformed_output_is_an_inference_error() {
        assert!(class_scores(OutputKind::BinarySigmoid, &[0.2, 0.8], 2).is_err());
        assert!(class_scores(OutputKind::BinarySigmoid, &[1.5], 2).is_err());
        assert!(class_scores(OutputKind::BinarySigmoid, &[f32::NAN], 2).is_err());
        assert!(class_scores(
            OutputKind::MulticlassSoftmax { from_logits: false },
            &[2.0, -1.0],
            2
        )
        .is_err());
    }

    #[test]
    fn test_sigmoid_model_needs_two_classes() {
        let model = FixedModel::new(OutputKind::BinarySigmoid, -1, vec![0.5]);
        let registry = Arc::new(ClassRegistry::from_labels(["a", "b", "c"]).unwrap());

        assert!(ModelHandler::new(model, registry).is_err());
    }

    #[test]
    fn test_batch_is_stacked_into_one_pass() {
        let model = FixedModel::new(OutputKind::BinarySigmoid, -1, vec![0.7]);
        let handler = ModelHandler::new(model, registry()).unwrap();

        let results = handler.infer_batch(&[tensor(), tensor(), tensor()]).unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.top().unwrap().label == "Cat"));
        assert_eq!(handler.model.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fixed_batch_dimension_runs_one_pass_per_image() {
        let model = FixedModel::new(OutputKind::BinarySigmoid, 1, vec![0.7]);
        let handler = ModelHandler::new(model, registry()).unwrap();

        let results = handler.infer_batch(&[tensor(), tensor()]).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(handler.model.calls.load(Ordering::SeqCst), 2);
    }
}
