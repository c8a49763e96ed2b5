//! Lung lesion screening on chest X-rays with a multi-label pathology classifier.

use std::path::Path;
use std::sync::Arc;

use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::detector::{LungPrediction, Prediction, ServiceKind, XrayPipeline};
use crate::errors::{Result, XaiError};
use crate::traits::{DetectorModel, GradientClassifier, InputPipeline, Preprocessed};
use crate::xai::helpers::resize_2d;
use crate::xai::BaseImage;

/// Output order of the chest X-ray classifier.
pub const PATHOLOGIES: [&str; 18] = [
    "Atelectasis",
    "Consolidation",
    "Infiltration",
    "Pneumothorax",
    "Edema",
    "Emphysema",
    "Fibrosis",
    "Effusion",
    "Pneumonia",
    "Pleural_Thickening",
    "Cardiomegaly",
    "Nodule",
    "Mass",
    "Hernia",
    "Lung Lesion",
    "Fracture",
    "Lung Opacity",
    "Enlarged Cardiomediastinum",
];

pub const DEFAULT_TARGET_LABEL: &str = "Lung Lesion";
pub const IMAGE_SIZE: usize = 224;

pub struct LungDetectorModel {
    classifier: Arc<dyn GradientClassifier>,
    pipeline: Arc<XrayPipeline>,
    threshold: f32,
    target_label: String,
    target_index: usize,
}

impl LungDetectorModel {
    pub fn new(classifier: Arc<dyn GradientClassifier>, threshold: f32, target_label: &str) -> Result<Self> {
        let target_index = classifier
            .class_names()
            .iter()
            .position(|name| name == target_label)
            .ok_or_else(|| {
                XaiError::invalid_input(
                    "target_label",
                    format!("{target_label:?} is not one of {:?}", classifier.class_names()),
                )
            })?;
        tracing::debug!(target_label, target_index, threshold, "lung detector configured");
        Ok(Self {
            classifier,
            pipeline: Arc::new(XrayPipeline::new(IMAGE_SIZE)),
            threshold,
            target_label: target_label.to_string(),
            target_index,
        })
    }

    pub fn with_image_size(mut self, size: usize) -> Self {
        self.pipeline = Arc::new(XrayPipeline::new(size));
        self
    }

    pub fn target_label(&self) -> &str {
        &self.target_label
    }

    /// Pathology name to score for one model input.
    pub fn predict_scores(&self, model_input: ArrayView4<f32>) -> Result<Vec<(String, f32)>> {
        let scores = self.classifier.predict(model_input)?;
        if scores.nrows() < 1 || scores.ncols() != self.classifier.num_classes() {
            return Err(XaiError::shape(
                format!("(1, {}) scores", self.classifier.num_classes()),
                scores.shape(),
            ));
        }
        Ok(self
            .classifier
            .class_names()
            .iter()
            .cloned()
            .zip(scores.row(0).iter().copied())
            .collect())
    }
}

/// Largest centred square.
fn center_crop(image: ArrayView2<'_, f32>) -> ArrayView2<'_, f32> {
    let (h, w) = image.dim();
    let side = h.min(w);
    let (y0, x0) = ((h - side) / 2, (w - side) / 2);
    image.slice_move(s![y0..y0 + side, x0..x0 + side])
}

impl DetectorModel for LungDetectorModel {
    fn service(&self) -> ServiceKind {
        ServiceKind::Lung
    }

    fn preprocess(&self, path: &Path) -> Result<Preprocessed> {
        if !path.exists() {
            return Err(XaiError::FileSystem {
                path: path.to_path_buf(),
                operation: "image lookup".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "image file not found"),
            });
        }
        let image = image::open(path).map_err(|e| XaiError::ImageProcessing {
            path: path.display().to_string(),
            operation: "X-ray decoding".to_string(),
            source: Box::new(e),
        })?;
        let rgb = image.to_rgb32f();
        let channels = rgb.as_ndarray3();
        let gray = channels
            .mean_axis(Axis(0))
            .ok_or_else(|| XaiError::shape("(C, H, W) image", channels.shape()))?
            .mapv(|v| v.clamp(0.0, 1.0));
        tracing::debug!(shape = ?gray.shape(), "decoded X-ray");

        let size = self.pipeline.size();
        let display = resize_2d(center_crop(gray.view()).into_dyn(), size, size)?;
        let model_input = XrayPipeline::normalize(display.view())
            .insert_axis(Axis(0))
            .insert_axis(Axis(0));

        Ok(Preprocessed {
            model_input,
            base_image: BaseImage::from(display),
            artifact: None,
        })
    }

    fn predict(&self, model_input: ArrayView4<f32>) -> Result<Prediction> {
        let scores = self.predict_scores(model_input)?;
        tracing::debug!(?scores, "pathology scores");
        let score = scores[self.target_index].1;
        let prediction = LungPrediction::from_score(score, self.threshold);
        tracing::info!(
            decision = %prediction.decision,
            score,
            threshold = self.threshold,
            "lung prediction"
        );
        Ok(Prediction::Lung(prediction))
    }

    fn explanation_class(&self, _prediction: &Prediction) -> Result<isize> {
        Ok(self.target_index as isize)
    }

    fn classifier(&self) -> Arc<dyn GradientClassifier> {
        self.classifier.clone()
    }

    fn pipeline(&self) -> Arc<dyn InputPipeline> {
        self.pipeline.clone()
    }
}
