use crate::config::ConfigurationError;
use std::{
    fs::File,
    io::{self, BufRead},
    path::Path,
};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Class index {index} is out of range for {len} classes")]
pub struct IndexOutOfRange {
    pub index: usize,
    pub len: usize,
}

/// Ordered class labels; position `i` names model output `i`.
#[derive(Debug, Clone)]
pub struct ClassRegistry {
    class_labels: Vec<String>,
}

impl ClassRegistry {
    pub fn load(path: &Path, expected_classes: usize) -> Result<Self, ConfigurationError> {
        let class_labels =
            load_class_labels(path).map_err(|source| ConfigurationError::ClassFile {
                path: path.to_path_buf(),
                source,
            })?;

        if class_labels.is_empty() {
            return Err(ConfigurationError::EmptyClassFile(path.to_path_buf()));
        }
        if class_labels.len() != expected_classes {
            return Err(ConfigurationError::ClassCountMismatch {
                path: path.to_path_buf(),
                expected: expected_classes,
                found: class_labels.len(),
            });
        }

        tracing::info!("Loaded {} classes from {:?}", class_labels.len(), path);
        Ok(Self { class_labels })
    }

    pub fn from_labels<I, S>(labels: I) -> Result<Self, ConfigurationError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let class_labels: Vec<String> = labels.into_iter().map(Into::into).collect();
        if class_labels.is_empty() {
            return Err(ConfigurationError::Invalid(
                "class registry needs at least one label".into(),
            ));
        }
        Ok(Self { class_labels })
    }

    pub fn label_for(&self, index: usize) -> Result<&str, IndexOutOfRange> {
        self.class_labels
            .get(index)
            .map(String::as_str)
            .ok_or(IndexOutOfRange {
                index,
                len: self.class_labels.len(),
            })
    }

    pub fn labels(&self) -> &[String] {
        &self.class_labels
    }

    pub fn len(&self) -> usize {
        self.class_labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.class_labels.is_empty()
    }
}

fn load_class_labels(filepath: &Path) -> io::Result<Vec<String>> {
    let file = File::open(filepath)?;
    let reader = io::BufReader::new(file);
    let mut class_labels = Vec::new();

    for line_result in reader.lines() {
        let line = line_result?;
        let label = line.trim();
        if label.is_empty() {
            continue;
        }
        class_labels.push(label.to_string());
    }

    Ok(class_labels)
}
