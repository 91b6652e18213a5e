use image::imageops::FilterType;
use serde::Deserialize;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigurationError {
    #[error("Failed to load settings: {0}")]
    Settings(#[from] config::ConfigError),
    #[error("Invalid setting: {0}")]
    Invalid(String),
    #[error("Failed to read class file {path:?}: {source}")]
    ClassFile {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Class file {0:?} contains no labels")]
    EmptyClassFile(PathBuf),
    #[error("Class file {path:?} lists {found} labels but the model has {expected} outputs")]
    ClassCountMismatch {
        path: PathBuf,
        expected: usize,
        found: usize,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    pub model: ModelConfig,
    #[serde(default)]
    pub preprocessing: PreprocessingConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    pub name: String,
    #[serde(default)]
    pub source: Option<String>,
    pub model_dir: PathBuf,
    pub onnx_file: String,
    pub classes_file: String,
    pub input_tensor: String,
    pub output_tensor: String,
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Multiclass outputs are raw logits and need a softmax.
    #[serde(default)]
    pub output_logits: bool,
    #[serde(default = "default_model_instances")]
    pub num_instances: usize,
    #[serde(default)]
    pub intra_threads: Option<usize>,
}

fn default_num_classes() -> usize {
    2
}

fn default_model_instances() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl ModelConfig {
    pub fn get_path(&self) -> PathBuf {
        self.model_dir.join(&self.onnx_file)
    }

    pub fn get_classes_path(&self) -> PathBuf {
        self.model_dir.join(&self.classes_file)
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResizeFilter {
    Nearest,
    Bilinear,
    CatmullRom,
    Lanczos3,
}

impl ResizeFilter {
    pub fn as_filter_type(&self) -> FilterType {
        match self {
            ResizeFilter::Nearest => FilterType::Nearest,
            ResizeFilter::Bilinear => FilterType::Triangle,
            ResizeFilter::CatmullRom => FilterType::CatmullRom,
            ResizeFilter::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Normalization {
    /// Intensities divided by 255, range [0, 1].
    Unit,
    /// Caffe style: BGR channel order with the ImageNet mean subtracted.
    Vgg16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PreprocessingConfig {
    #[serde(default = "default_input_size")]
    pub input_width: u32,
    #[serde(default = "default_input_size")]
    pub input_height: u32,
    #[serde(default = "default_filter")]
    pub filter: ResizeFilter,
    #[serde(default = "default_normalization")]
    pub normalization: Normalization,
}

fn default_input_size() -> u32 {
    150
}

fn default_filter() -> ResizeFilter {
    ResizeFilter::Bilinear
}

fn default_normalization() -> Normalization {
    Normalization::Unit
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            input_width: default_input_size(),
            input_height: default_input_size(),
            filter: default_filter(),
            normalization: default_normalization(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct UploadConfig {
    #[serde(default = "default_max_bytes")]
    pub max_bytes: usize,
    #[serde(default = "default_allowed_extensions")]
    pub allowed_extensions: Vec<String>,
}

fn default_max_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_allowed_extensions() -> Vec<String> {
    ["png", "jpg", "jpeg", "gif", "bmp"]
        .iter()
        .map(|ext| ext.to_string())
        .collect()
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_max_bytes(),
            allowed_extensions: default_allowed_extensions(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    #[serde(default = "default_include_scores")]
    pub include_scores: bool,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_include_scores() -> bool {
    true
}

fn default_max_batch_size() -> usize {
    16
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            include_scores: default_include_scores(),
            max_batch_size: default_max_batch_size(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.preprocessing.input_width == 0 || self.preprocessing.input_height == 0 {
            return Err(ConfigurationError::Invalid(
                "preprocessing input size must be non-zero".into(),
            ));
        }
        if self.upload.max_bytes == 0 {
            return Err(ConfigurationError::Invalid(
                "upload.max_bytes must be non-zero".into(),
            ));
        }
        if self.upload.allowed_extensions.is_empty() {
            return Err(ConfigurationError::Invalid(
                "upload.allowed_extensions must not be empty".into(),
            ));
        }
        if self.model.num_instances == 0 {
            return Err(ConfigurationError::Invalid(
                "model.num_instances must be at least 1".into(),
            ));
        }
        if self.model.num_classes < 2 {
            return Err(ConfigurationError::Invalid(
                "model.num_classes must be at least 2".into(),
            ));
        }
        if self.model.input_tensor.trim().is_empty() || self.model.output_tensor.trim().is_empty()
        {
            return Err(ConfigurationError::Invalid(
                "model.input_tensor and model.output_tensor must be set".into(),
            ));
        }
        if self.api.max_batch_size == 0 {
            return Err(ConfigurationError::Invalid(
                "api.max_batch_size must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug`, `info` or `warn`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, ConfigurationError> {
    let base_path = std::env::current_dir().map_err(|e| {
        ConfigurationError::Invalid(format!("failed to determine the current directory: {}", e))
    })?;
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(ConfigurationError::Invalid)?;

    get_configuration_from(&base_path.join("configuration"), environment)
}

pub fn get_configuration_from(
    configuration_directory: &std::path::Path,
    environment: Environment,
) -> Result<Config, ConfigurationError> {
    let config = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let config: Config = config.try_deserialize::<Config>()?;
    config.validate()?;

    Ok(config)
}
