//! Deepfake audio detection over mel spectrogram images.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::imageops::{self, FilterType};
use image::{DynamicImage, ImageFormat, RgbImage};
use ndarray::prelude::*;

use crate::detector::spectrogram::{load_wav, mel_spectrogram_db, render_spectrogram, SpectrogramConfig};
use crate::detector::{ArtifactGuard, AudioPrediction, Prediction, RgbPipeline, ServiceKind};
use crate::errors::{Result, XaiError};
use crate::traits::{DetectorModel, GradientClassifier, InputPipeline, Preprocessed, TensorLayout};
use crate::xai::BaseImage;

pub const CLASS_NAMES: [&str; 2] = ["real", "fake"];
pub const IMAGE_SIZE: u32 = 224;

pub struct AudioDetectorModel {
    classifier: Arc<dyn GradientClassifier>,
    pipeline: Arc<RgbPipeline>,
    spectrogram: SpectrogramConfig,
    image_size: u32,
}

impl AudioDetectorModel {
    pub fn new(classifier: Arc<dyn GradientClassifier>) -> Result<Self> {
        if classifier.num_classes() != CLASS_NAMES.len() {
            return Err(XaiError::Configuration {
                message: format!(
                    "audio classifier must have {} classes {:?}, got {:?}",
                    CLASS_NAMES.len(),
                    CLASS_NAMES,
                    classifier.class_names()
                ),
            });
        }
        Ok(Self {
            classifier,
            pipeline: Arc::new(RgbPipeline::new(TensorLayout::Nhwc)),
            spectrogram: SpectrogramConfig::default(),
            image_size: IMAGE_SIZE,
        })
    }

    pub fn with_spectrogram(mut self, spectrogram: SpectrogramConfig) -> Self {
        self.spectrogram = spectrogram;
        self
    }

    pub fn with_image_size(mut self, image_size: u32) -> Self {
        self.image_size = image_size;
        self
    }

    /// Render the spectrogram of `audio_path` to a temporary PNG.
    pub fn create_spectrogram(&self, audio_path: &Path) -> Result<PathBuf> {
        if !audio_path.exists() {
            return Err(XaiError::FileSystem {
                path: audio_path.to_path_buf(),
                operation: "audio lookup".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "audio file not found"),
            });
        }
        let (samples, sample_rate) = load_wav(audio_path)?;
        tracing::debug!(samples = samples.len(), sample_rate, "decoded audio");
        let db = mel_spectrogram_db(&samples, sample_rate, &self.spectrogram)?;
        let image = render_spectrogram(db.view());

        let file = tempfile::Builder::new()
            .prefix("spectrogram-")
            .suffix(".png")
            .tempfile()?;
        let path = file.into_temp_path().keep().map_err(|e| XaiError::FileSystem {
            path: e.path.to_path_buf(),
            operation: "spectrogram persist".to_string(),
            source: e.error,
        })?;
        let guard = ArtifactGuard::new(Some(path.clone()));
        save_spectrogram(&image, &path)?;
        guard.disarm();
        tracing::debug!(path = %path.display(), "spectrogram written");
        Ok(path)
    }
}

impl DetectorModel for AudioDetectorModel {
    fn service(&self) -> ServiceKind {
        ServiceKind::Audio
    }

    fn preprocess(&self, path: &Path) -> Result<Preprocessed> {
        let spectrogram = self.create_spectrogram(path)?;
        let guard = ArtifactGuard::new(Some(spectrogram.clone()));

        let image = load_spectrogram(&spectrogram)?;
        let rgb = imageops::resize(
            &image.to_rgb8(),
            self.image_size,
            self.image_size,
            FilterType::Nearest,
        );
        let base_image = BaseImage::from(&rgb);
        let model_input = self.pipeline.rgb01_to_input(&[base_image.rgb01()?])?;
        tracing::debug!(shape = ?model_input.shape(), "model input ready");

        Ok(Preprocessed {
            model_input,
            base_image,
            artifact: guard.disarm(),
        })
    }

    fn predict(&self, model_input: ArrayView4<f32>) -> Result<Prediction> {
        let scores = self.classifier.predict(model_input)?;
        if scores.nrows() < 1 {
            return Err(XaiError::shape("(1, 2) scores", scores.shape()));
        }
        let prediction = AudioPrediction::from_scores(scores.row(0), self.classifier.class_names())?;
        tracing::info!(
            decision = %prediction.decision,
            label = %prediction.label,
            confidence = prediction.confidence,
            "audio prediction"
        );
        Ok(Prediction::Audio(prediction))
    }

    fn explanation_class(&self, prediction: &Prediction) -> Result<isize> {
        match prediction {
            Prediction::Audio(p) => Ok(p.class_index as isize),
            Prediction::Lung(_) => Err(XaiError::invalid_input(
                "prediction",
                "lung prediction passed to the audio model",
            )),
        }
    }

    fn classifier(&self) -> Arc<dyn GradientClassifier> {
        self.classifier.clone()
    }

    fn pipeline(&self) -> Arc<dyn InputPipeline> {
        self.pipeline.clone()
    }
}

/// The spectrogram PNG is our own artifact, so failures on it are server-side.
fn spectrogram_io_error(path: &Path, operation: &str, error: image::ImageError) -> XaiError {
    XaiError::FileSystem {
        path: path.to_path_buf(),
        operation: operation.to_string(),
        source: std::io::Error::other(error),
    }
}

fn save_spectrogram(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|e| spectrogram_io_error(path, "spectrogram save", e))
}

fn load_spectrogram(path: &Path) -> Result<DynamicImage> {
    image::open(path).map_err(|e| spectrogram_io_error(path, "spectrogram reload", e))
}
