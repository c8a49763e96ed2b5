use std::path::{Path, PathBuf};
use std::sync::Arc;

use ndarray::prelude::*;

use crate::detector::{Prediction, ServiceKind};
use crate::errors::Result;
use crate::xai::BaseImage;

/// Abstraction over a trained image classifier.
///
/// Inference backends (ONNX Runtime, test doubles) depend on this trait rather than the
/// other way round, so explainers never see a concrete session type.
pub trait Classifier: Send + Sync {
    /// Batched scores `(B, K)` for a batch of model inputs.
    fn predict(&self, input: ArrayView4<f32>) -> Result<Array2<f32>>;

    fn class_names(&self) -> &[String];

    fn num_classes(&self) -> usize {
        self.class_names().len()
    }
}

/// Activations and gradients of one convolutional layer for a single input.
///
/// Returned by value: nothing stays attached to the model once the capture is done.
#[derive(Debug, Clone)]
pub struct LayerCapture {
    pub layer: String,
    /// `(C, h, w)`
    pub activations: Array3<f32>,
    /// `(C, h, w)`, d score / d activation
    pub gradients: Array3<f32>,
    /// Scores `(K,)` from the same forward pass.
    pub scores: Array1<f32>,
}

/// A classifier that can differentiate its output.
pub trait GradientClassifier: Classifier {
    /// Name of the last convolutional layer, if the model has one.
    fn last_conv_layer(&self) -> Option<String>;

    /// Forward and backward pass for `class_index`, capturing `layer`.
    fn capture_layer(
        &self,
        input: ArrayView4<f32>,
        layer: &str,
        class_index: usize,
    ) -> Result<LayerCapture>;

    /// d score[class_index] / d input, same shape as `input`.
    fn input_gradient(&self, input: ArrayView4<f32>, class_index: usize) -> Result<Array4<f32>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorLayout {
    Nchw,
    Nhwc,
}

impl TensorLayout {
    pub const fn channel_axis(&self) -> Axis {
        match self {
            Self::Nchw => Axis(1),
            Self::Nhwc => Axis(3),
        }
    }

    /// `(height, width)` of a 4-D tensor in this layout.
    pub fn spatial_dims(&self, shape: &[usize]) -> (usize, usize) {
        match self {
            Self::Nchw => (shape[2], shape[3]),
            Self::Nhwc => (shape[1], shape[2]),
        }
    }
}

/// Maps display-space RGB images back into model inputs.
///
/// Perturbation explainers edit the picture the user sees and then need the exact
/// preprocessing the deployed model expects.
pub trait InputPipeline: Send + Sync {
    fn layout(&self) -> TensorLayout;

    /// Convert RGB images in `[0, 1]`, each `(H, W, 3)`, into one batched model input.
    fn rgb01_to_input(&self, images: &[Array3<f32>]) -> Result<Array4<f32>>;
}

/// Output of a service's preprocessing stage.
#[derive(Debug)]
pub struct Preprocessed {
    pub model_input: Array4<f32>,
    pub base_image: BaseImage,
    /// Intermediate file produced while preprocessing, removed by the orchestrator.
    pub artifact: Option<PathBuf>,
}

/// Service-specific wrapper around a classifier: preprocessing, thresholding and
/// labelling.
pub trait DetectorModel: Send + Sync {
    fn service(&self) -> ServiceKind;

    fn preprocess(&self, path: &Path) -> Result<Preprocessed>;

    fn predict(&self, model_input: ArrayView4<f32>) -> Result<Prediction>;

    /// Class the explanation should target for this prediction.
    fn explanation_class(&self, prediction: &Prediction) -> Result<isize>;

    fn classifier(&self) -> Arc<dyn GradientClassifier>;

    fn pipeline(&self) -> Arc<dyn InputPipeline>;
}
