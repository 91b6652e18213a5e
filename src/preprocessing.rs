use crate::config::{Normalization, PreprocessingConfig, UploadConfig};
use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbImage};
use ndarray::{Array4, ArrayView4};
use std::io::Cursor;
use thiserror::Error;

const VGG16_BGR_MEAN: [f32; 3] = [103.939, 116.779, 123.68];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PreprocessError {
    #[error("empty image file")]
    EmptyPayload,
    #[error("image is {size} bytes, the limit is {limit} bytes")]
    PayloadTooLarge { size: usize, limit: usize },
    #[error("unsupported media type: {0}")]
    UnsupportedMediaType(String),
    #[error("invalid image file: {0}")]
    CorruptImage(String),
}

/// Raw upload as received from the client.
#[derive(Debug, Clone, Default)]
pub struct Upload {
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub bytes: Vec<u8>,
}

/// Model input of shape `[batch, height, width, 3]`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor(Array4<f32>);

impl ImageTensor {
    /// Wraps a single-image NHWC array; `None` unless the shape is `[1, h, w, 3]`.
    pub fn from_array(array: Array4<f32>) -> Option<Self> {
        let shape = array.shape();
        if shape[0] == 1 && shape[1] > 0 && shape[2] > 0 && shape[3] == 3 {
            Some(Self(array))
        } else {
            None
        }
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    width: u32,
    height: u32,
    filter: FilterType,
    normalization: Normalization,
    max_bytes: usize,
    allowed_extensions: Vec<String>,
    allowed_formats: Vec<ImageFormat>,
}

impl Preprocessor {
    pub fn new(preprocessing: &PreprocessingConfig, upload: &UploadConfig) -> Self {
        let allowed_extensions: Vec<String> = upload
            .allowed_extensions
            .iter()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
            .collect();
        let mut allowed_formats: Vec<ImageFormat> = allowed_extensions
            .iter()
            .filter_map(ImageFormat::from_extension)
            .collect();
        allowed_formats.dedup();

        Self {
            width: preprocessing.input_width,
            height: preprocessing.input_height,
            filter: preprocessing.filter.as_filter_type(),
            normalization: preprocessing.normalization,
            max_bytes: upload.max_bytes,
            allowed_extensions,
            allowed_formats,
        }
    }

    pub fn input_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    /// Validates, decodes and normalizes an upload. Same bytes give the same tensor.
    pub fn preprocess(&self, upload: &Upload) -> Result<ImageTensor, PreprocessError> {
        self.validate(upload)?;
        let image = self.decode(&upload.bytes)?;
        Ok(self.to_tensor(&image))
    }

    fn validate(&self, upload: &Upload) -> Result<(), PreprocessError> {
        if upload.bytes.is_empty() {
            return Err(PreprocessError::EmptyPayload);
        }
        if upload.bytes.len() > self.max_bytes {
            return Err(PreprocessError::PayloadTooLarge {
                size: upload.bytes.len(),
                limit: self.max_bytes,
            });
        }

        let extension = upload
            .file_name
            .as_deref()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext.to_lowercase());

        match (extension, upload.content_type.as_deref()) {
            (Some(ext), _) if self.allowed_extensions.contains(&ext) => Ok(()),
            (Some(ext), _) => Err(PreprocessError::UnsupportedMediaType(format!(
                "file type `.{}` is not allowed, supported types: {}",
                ext,
                self.allowed_extensions.join(", ")
            ))),
            (None, Some(content_type)) if self.allows_content_type(content_type) => Ok(()),
            (None, content_type) => Err(PreprocessError::UnsupportedMediaType(format!(
                "content type `{}` is not allowed, supported types: {}",
                content_type.unwrap_or("unknown"),
                self.allowed_extensions.join(", ")
            ))),
        }
    }

    fn allows_content_type(&self, content_type: &str) -> bool {
        let mime = content_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        ImageFormat::from_mime_type(mime)
            .map(|format| self.allowed_formats.contains(&format))
            .unwrap_or(false)
    }

    fn decode(&self, bytes: &[u8]) -> Result<DynamicImage, PreprocessError> {
        let image_reader = image::ImageReader::new(Cursor::new(bytes))
            .with_guessed_format()
            .map_err(|e| PreprocessError::CorruptImage(e.to_string()))?;

        let format = image_reader.format().ok_or_else(|| {
            PreprocessError::CorruptImage("unrecognized image data".to_string())
        })?;
        if !self.allowed_formats.contains(&format) {
            return Err(PreprocessError::UnsupportedMediaType(format!(
                "decoded {:?} data is not an allowed image format",
                format
            )));
        }

        let image = image_reader
            .decode()
            .map_err(|e| PreprocessError::CorruptImage(e.to_string()))?;

        if image.width() == 0 || image.height() == 0 {
            return Err(PreprocessError::CorruptImage(
                "image has zero width or height".to_string(),
            ));
        }

        Ok(image)
    }

    fn to_tensor(&self, image: &DynamicImage) -> ImageTensor {
        // Grayscale is expanded and alpha is dropped here.
        let rgb = image.to_rgb8();
        let rgb: RgbImage = if rgb.dimensions() == (self.width, self.height) {
            rgb
        } else {
            image::imageops::resize(&rgb, self.width, self.height, self.filter)
        };

        let normalization = self.normalization;
        let input = Array4::from_shape_fn(
            (1, self.height as usize, self.width as usize, 3),
            |(_, y, x, c)| {
                let pixel = rgb.get_pixel(x as u32, y as u32);
                match normalization {
                    Normalization::Unit => pixel[c] as f32 / 255.,
                    Normalization::Vgg16 => pixel[2 - c] as f32 - VGG16_BGR_MEAN[c],
                }
            },
        );

        ImageTensor(input)
    }
}
