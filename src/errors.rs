use std::path::PathBuf;
use thiserror::Error;

type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Structured error types for detection and explanation.
///
/// Variants carry the context of their domain; [`XaiError::category`] tells transport
/// layers whether the caller or the server is at fault.
#[derive(Error, Debug)]
pub enum XaiError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// The model cannot be explained the requested way (no convolutional layer,
    /// empty activation/gradient capture).
    #[error("Model integrity error: {message}")]
    Integrity { message: String },

    #[error("Invalid input: {field} {reason}")]
    InvalidInput { field: String, reason: String },

    #[error("Upload too large: {reason}")]
    PayloadTooLarge { reason: String },

    #[error("Shape error: expected {expected}, got {actual:?}")]
    Shape { expected: String, actual: Vec<usize> },

    #[error("Unknown XAI method: {method}")]
    UnknownMethod { method: String },

    #[error("XAI method {method} is not offered by the {service} service")]
    UnsupportedMethod { method: String, service: String },

    #[error("Filesystem error: {operation} failed for {path:?}")]
    FileSystem {
        path: PathBuf,
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Image processing error: {operation} failed (file: {path})")]
    ImageProcessing {
        path: String,
        operation: String,
        #[source]
        source: BoxedError,
    },

    #[error("Audio decoding error: {operation} failed (file: {path})")]
    AudioDecoding {
        path: String,
        operation: String,
        #[source]
        source: BoxedError,
    },

    #[error("Model error: {operation} failed")]
    Model {
        operation: String,
        #[source]
        source: BoxedError,
    },
}

pub type Result<T> = std::result::Result<T, XaiError>;

/// Coarse classification used by transport layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// The caller sent something unusable; retrying the same request will not help.
    InvalidInput,
    /// The request body exceeded the configured upload limit.
    PayloadTooLarge,
    Configuration,
    Internal,
}

impl XaiError {
    pub fn shape(expected: impl Into<String>, actual: &[usize]) -> Self {
        Self::Shape {
            expected: expected.into(),
            actual: actual.to_vec(),
        }
    }

    pub fn invalid_input(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidInput {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn model(operation: impl Into<String>, source: impl Into<BoxedError>) -> Self {
        Self::Model {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::InvalidInput { .. }
            | Self::UnknownMethod { .. }
            | Self::UnsupportedMethod { .. }
            | Self::ImageProcessing { .. }
            | Self::AudioDecoding { .. } => ErrorCategory::InvalidInput,
            Self::PayloadTooLarge { .. } => ErrorCategory::PayloadTooLarge,
            Self::Configuration { .. } | Self::Integrity { .. } => ErrorCategory::Configuration,
            Self::Shape { .. } | Self::FileSystem { .. } | Self::Model { .. } => {
                ErrorCategory::Internal
            }
        }
    }

    /// Flattened `source()` chain, outermost first.
    pub fn chain(&self) -> Vec<String> {
        let mut chain = vec![self.to_string()];
        let mut current = std::error::Error::source(self);
        while let Some(err) = current {
            chain.push(err.to_string());
            current = err.source();
        }
        chain
    }
}

/// Convert anyhow errors to configuration errors.
///
/// Startup code in the binary works with anyhow; anything crossing back into the
/// library is reported as a configuration problem.
impl From<anyhow::Error> for XaiError {
    fn from(err: anyhow::Error) -> Self {
        XaiError::Configuration {
            message: format!("{err:#}"),
        }
    }
}

/// Convert I/O errors to filesystem errors.
///
/// Code that has context should construct `XaiError::FileSystem` directly with the
/// specific path and operation.
impl From<std::io::Error> for XaiError {
    fn from(err: std::io::Error) -> Self {
        Self::FileSystem {
            path: PathBuf::from("unknown"),
            operation: "unknown".to_string(),
            source: err,
        }
    }
}

impl From<image::ImageError> for XaiError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageProcessing {
            path: "unknown".to_string(),
            operation: "image processing".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<ort::Error> for XaiError {
    fn from(err: ort::Error) -> Self {
        Self::Model {
            operation: "ort operation".to_string(),
            source: Box::new(err),
        }
    }
}

/// Tensor reshapes around inference report as model errors.
impl From<ndarray::ShapeError> for XaiError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model {
            operation: "tensor shape conversion".to_string(),
            source: Box::new(err),
        }
    }
}

impl From<hound::Error> for XaiError {
    fn from(err: hound::Error) -> Self {
        Self::AudioDecoding {
            path: "unknown".to_string(),
            operation: "wav decoding".to_string(),
            source: Box::new(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(
            XaiError::UnknownMethod {
                method: "foo".into()
            }
            .category(),
            ErrorCategory::InvalidInput
        );
        assert_eq!(
            XaiError::Integrity {
                message: "no conv".into()
            }
            .category(),
            ErrorCategory::Configuration
        );
        assert_eq!(
            XaiError::shape("(H,W,3)", &[2, 2, 5]).category(),
            ErrorCategory::Internal
        );
        assert_eq!(
            XaiError::PayloadTooLarge {
                reason: "over 1024 bytes".into()
            }
            .category(),
            ErrorCategory::PayloadTooLarge
        );
    }

    #[test]
    fn test_chain_includes_source() {
        let err = XaiError::FileSystem {
            path: "/tmp/x".into(),
            operation: "read".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "gone"),
        };
        let chain = err.chain();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1], "gone");
    }
}
