pub mod config;
pub mod detector;
pub mod errors;
pub mod model;
pub mod server;
pub mod traits;
pub mod xai;

pub mod mocks;

pub use config::Cli;
pub use detector::{DetectionService, Detector, DetectorResult, ServiceKind};
pub use errors::{Result, XaiError};
pub use model::OnnxClassifier;
pub use traits::*;
pub use xai::{BaseImage, Explainer, OverlayConfig, XaiMethod};
