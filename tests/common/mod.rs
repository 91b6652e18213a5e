#![allow(dead_code)]

use axum::{
    body::Body,
    http::{header, Request},
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use ndarray::{Array2, ArrayView4, Axis};
use pet_classifier::{
    config::{
        ApiConfig, Config, LogLevel, ModelConfig, PreprocessingConfig, ServerConfig,
        UploadConfig,
    },
    model_handler::ModelHandler,
    model_service::{InferenceError, ModelDescriptor, ModelService, OutputKind},
    server::SharedState,
    state::ClassRegistry,
    telemetry::Metrics,
};
use std::{io::Cursor, path::PathBuf, sync::Arc};

pub const BOUNDARY: &str = "pet-classifier-test-boundary";

pub const BROWN: [u8; 3] = [139, 69, 19];
pub const ORANGE: [u8; 3] = [255, 165, 0];

/// Scores an image as `Cat` in proportion to its mean green intensity, so
/// orange fixtures lean `Cat` and brown ones lean `Dog`.
pub struct GreenChannelModel {
    descriptor: ModelDescriptor,
}

impl GreenChannelModel {
    pub fn new() -> Self {
        Self {
            descriptor: ModelDescriptor {
                input_tensor: "input_1".into(),
                output_tensor: "dense_1".into(),
                input_shape: vec![-1, 150, 150, 3],
                output_shape: vec![-1, 1],
                output_kind: OutputKind::BinarySigmoid,
            },
        }
    }
}

impl ModelService for GreenChannelModel {
    fn run(&self, input: ArrayView4<'_, f32>) -> Result<Array2<f32>, InferenceError> {
        let batch = input.shape()[0];
        let values = (0..batch)
            .map(|i| {
                input
                    .index_axis(Axis(0), i)
                    .index_axis(Axis(2), 1)
                    .mean()
                    .unwrap_or(0.)
            })
            .collect::<Vec<f32>>();
        Array2::from_shape_vec((batch, 1), values)
            .map_err(|e| InferenceError::Output(e.to_string()))
    }

    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }
}

/// A model whose forward pass always fails.
pub struct BrokenModel {
    descriptor: ModelDescriptor,
}

impl BrokenModel {
    pub fn new() -> Self {
        Self {
            descriptor: GreenChannelModel::new().descriptor,
        }
    }
}

impl ModelService for BrokenModel {
    fn run(&self, _input: ArrayView4<'_, f32>) -> Result<Array2<f32>, InferenceError> {
        Err(InferenceError::Runtime("shape mismatch".into()))
    }

    fn descriptor(&self) -> &ModelDescriptor {
        &self.descriptor
    }
}

pub fn test_config() -> Config {
    Config {
        server: ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
        },
        log_level: LogLevel::Debug,
        model: ModelConfig {
            name: "cats_vs_dogs_classifier".into(),
            source: Some("carlosaguayo/cats_vs_dogs".into()),
            model_dir: PathBuf::from("models"),
            onnx_file: "cats_vs_dogs.onnx".into(),
            classes_file: "classes.txt".into(),
            input_tensor: "input_1".into(),
            output_tensor: "dense_1".into(),
            num_classes: 2,
            output_logits: false,
            num_instances: 1,
            intra_threads: None,
        },
        preprocessing: PreprocessingConfig::default(),
        upload: UploadConfig::default(),
        api: ApiConfig::default(),
    }
}

pub fn registry() -> Arc<ClassRegistry> {
    Arc::new(ClassRegistry::from_labels(["Dog", "Cat"]).unwrap())
}

pub fn empty_state<M: ModelService>(config: &Config) -> SharedState<M> {
    SharedState::new(config, registry(), Arc::new(Metrics::new().unwrap()))
}

pub fn ready_state<M: ModelService>(config: &Config, model: M) -> SharedState<M> {
    let state = empty_state(config);
    state.set_model(ModelHandler::new(model, state.registry.clone()));
    state
}

fn fill_ellipse(image: &mut RgbImage, bounds: [i64; 4], color: [u8; 3]) {
    let [x0, y0, x1, y1] = bounds;
    let (cx, cy) = ((x0 + x1) as f64 / 2., (y0 + y1) as f64 / 2.);
    let (rx, ry) = ((x1 - x0) as f64 / 2., (y1 - y0) as f64 / 2.);

    for y in y0.max(0)..=y1.min(image.height() as i64 - 1) {
        for x in x0.max(0)..=x1.min(image.width() as i64 - 1) {
            let dx = (x as f64 - cx) / rx;
            let dy = (y as f64 - cy) / ry;
            if dx * dx + dy * dy <= 1.0 {
                image.put_pixel(x as u32, y as u32, Rgb(color));
            }
        }
    }
}

fn lighten(color: [u8; 3], amount: u8) -> [u8; 3] {
    color.map(|c| c.saturating_add(amount))
}

/// Draws a flat-colored "pet": body, head and two eyes on a solid background.
pub fn synthetic_pet_image(color: [u8; 3], size: u32) -> RgbImage {
    let mut image = RgbImage::from_pixel(size, size, Rgb(color));
    let (cx, cy) = (size as i64 / 2, size as i64 / 2);

    fill_ellipse(&mut image, [cx - 40, cy - 20, cx + 40, cy + 40], lighten(color, 20));
    fill_ellipse(&mut image, [cx - 25, cy - 40, cx + 25, cy - 10], lighten(color, 30));
    fill_ellipse(&mut image, [cx - 15, cy - 32, cx - 10, cy - 27], [0, 0, 0]);
    fill_ellipse(&mut image, [cx + 10, cy - 32, cx + 15, cy - 27], [0, 0, 0]);

    image
}

pub fn encode(image: RgbImage, format: ImageFormat) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(image)
        .write_to(&mut cursor, format)
        .unwrap();
    cursor.into_inner()
}

pub fn pet_png(color: [u8; 3]) -> Vec<u8> {
    encode(synthetic_pet_image(color, 150), ImageFormat::Png)
}

pub struct Part {
    pub name: &'static str,
    pub file_name: Option<&'static str>,
    pub content_type: Option<&'static str>,
    pub bytes: Vec<u8>,
}

impl Part {
    pub fn image(file_name: &'static str, bytes: Vec<u8>) -> Self {
        Self {
            name: "image",
            file_name: Some(file_name),
            content_type: Some("image/png"),
            bytes,
        }
    }
}

pub fn multipart_body(parts: &[Part]) -> Vec<u8> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        let disposition = match part.file_name {
            Some(file_name) => format!(
                "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n",
                part.name, file_name
            ),
            None => format!("Content-Disposition: form-data; name=\"{}\"\r\n", part.name),
        };
        body.extend_from_slice(disposition.as_bytes());
        if let Some(content_type) = part.content_type {
            body.extend_from_slice(format!("Content-Type: {}\r\n", content_type).as_bytes());
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(&part.bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());
    body
}

pub fn multipart_request(uri: &str, parts: &[Part]) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(multipart_body(parts)))
        .unwrap()
}

pub fn get_request(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

pub async fn json_body(response: axum::response::Response) -> serde_json::Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
