use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{0:?} does not exist")]
    FileNotFound(PathBuf),

    #[error("{file:?}: schema violation at `{field}`: {reason}")]
    SchemaViolation {
        file: PathBuf,
        field: String,
        reason: String,
    },

    #[error("no editor registered for operator {0:?}")]
    UnknownOperator(String),

    #[error("tensor {0:?} is not in the graph")]
    MissingTensor(String),

    #[error("config error: {0}")]
    ConfigError(String),

    #[error("{0} is not implemented")]
    NotImplemented(String),

    #[error("node {node:?}: {reason}")]
    UnsupportedPattern { node: String, reason: String },

    #[error("graph contains a cycle through node {0:?}")]
    Cycle(String),

    #[error("node {node:?} references unknown tensor {tensor:?}")]
    DanglingReference { node: String, tensor: String },

    #[error("failed to decode ONNX model: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("json error {0}")]
    Json(#[from] serde_json::Error),

    #[error("image error {0}")]
    Image(#[from] image::ImageError),

    #[error("io error {0:?}")]
    Io(#[from] std::io::Error),

    #[error("io error {0:?} while {1}")]
    IoWhen(std::io::Error, String),
}

impl Error {
    pub fn io_ctx(msg: impl AsRef<str>) -> impl FnOnce(std::io::Error) -> Self {
        move |err| Self::IoWhen(err, msg.as_ref().to_string())
    }

    /// Attributes a schema violation raised without file context to `file`.
    pub fn in_file(self, file: &std::path::Path) -> Self {
        match self {
            Self::SchemaViolation {
                file: f,
                field,
                reason,
            } if f.as_os_str().is_empty() => Self::SchemaViolation {
                file: file.to_path_buf(),
                field,
                reason,
            },
            other => other,
        }
    }

    pub(crate) fn schema(
        file: impl Into<PathBuf>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self::SchemaViolation {
            file: file.into(),
            field: field.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
