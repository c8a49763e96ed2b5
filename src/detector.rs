//! Detection orchestrator: preprocess, predict, explain, assemble.

pub mod audio;
mod cleanup;
pub mod lung;
mod pipeline;
mod prediction;
pub mod spectrogram;

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::errors::{Result, XaiError};
use crate::traits::{DetectorModel, GradientClassifier};
use crate::xai::gradcam::{GradCamConfig, GradCamExplainer, GradCamSource, ProxyPreprocessing};
use crate::xai::helpers::HeatPalette;
use crate::xai::lime::{LimeConfig, LimeExplainer};
use crate::xai::shap::{ShapConfig, ShapExplainer};
use crate::xai::{Explainer, OverlayConfig, XaiMethod};

pub use cleanup::ArtifactGuard;
pub use pipeline::{RgbPipeline, XrayPipeline, XRAY_MAX};
pub use prediction::{AudioPrediction, DetectorResult, LungPrediction, Prediction, FAKE_LABEL};

/// The two deployed detection services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    Audio,
    Lung,
}

impl ServiceKind {
    /// Route segment under `{base}detector/`.
    pub const fn endpoint(&self) -> &'static str {
        match self {
            Self::Audio => "fake_audio_detection",
            Self::Lung => "lung_cancer_detection",
        }
    }

    pub const fn supported_methods(&self) -> &'static [XaiMethod] {
        match self {
            Self::Audio => &[XaiMethod::Gradcam, XaiMethod::Lime, XaiMethod::Shap],
            Self::Lung => &[XaiMethod::Gradcam, XaiMethod::Lime],
        }
    }

    pub const fn palette(&self) -> HeatPalette {
        match self {
            Self::Audio => HeatPalette::AUDIO,
            Self::Lung => HeatPalette::XRAY,
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Lung => "lung",
        })
    }
}

/// Per-method explainer settings shared by every request.
#[derive(Clone, Default)]
pub struct ExplainerSettings {
    pub gradcam: GradCamConfig,
    pub lime: LimeConfig,
    pub shap: ShapConfig,
    /// Backbone explained by Grad-CAM in place of the deployed classifier.
    pub gradcam_proxy: Option<(Arc<dyn GradientClassifier>, ProxyPreprocessing)>,
}

/// One explainer per method the service supports, built up front.
pub struct ExplainerSet {
    service: ServiceKind,
    explainers: HashMap<XaiMethod, Arc<dyn Explainer>>,
}

impl ExplainerSet {
    pub fn build<M: DetectorModel + ?Sized>(model: &M, settings: &ExplainerSettings) -> Result<Self> {
        let service = model.service();
        let classifier = model.classifier();
        let pipeline = model.pipeline();
        let palette = service.palette();

        let mut explainers: HashMap<XaiMethod, Arc<dyn Explainer>> = HashMap::new();
        for &method in service.supported_methods() {
            let explainer: Arc<dyn Explainer> = match method {
                XaiMethod::Gradcam => {
                    let source = match &settings.gradcam_proxy {
                        Some((backbone, preprocessing)) => GradCamSource::Proxy {
                            backbone: backbone.clone(),
                            preprocessing: *preprocessing,
                        },
                        None => GradCamSource::Classifier {
                            classifier: classifier.clone(),
                            layout: pipeline.layout(),
                        },
                    };
                    Arc::new(GradCamExplainer::new(source, settings.gradcam.clone()))
                }
                XaiMethod::Lime => Arc::new(LimeExplainer::new(
                    classifier.clone(),
                    pipeline.clone(),
                    LimeConfig {
                        palette,
                        ..settings.lime.clone()
                    },
                )),
                XaiMethod::Shap => Arc::new(ShapExplainer::new(
                    classifier.clone(),
                    pipeline.clone(),
                    ShapConfig {
                        palette,
                        ..settings.shap.clone()
                    },
                )?),
            };
            explainers.insert(method, explainer);
        }
        tracing::info!(
            service = %service,
            methods = ?service.supported_methods(),
            "explainers ready"
        );
        Ok(Self {
            service,
            explainers,
        })
    }

    pub fn get(&self, method: XaiMethod) -> Result<&dyn Explainer> {
        self.explainers
            .get(&method)
            .map(|explainer| explainer.as_ref())
            .ok_or_else(|| XaiError::UnsupportedMethod {
                method: method.to_string(),
                service: self.service.to_string(),
            })
    }
}

/// Stages a detection request moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectionStage {
    Received,
    Preprocessed,
    Predicted,
    Explained,
    Assembled,
    Failed,
}

/// Object-safe view of a detector, held by the HTTP layer.
pub trait DetectionService: Send + Sync {
    fn service(&self) -> ServiceKind;

    fn detect(&self, path: &Path, method: XaiMethod) -> Result<DetectorResult>;
}

pub struct Detector<M: DetectorModel> {
    model: M,
    explainers: ExplainerSet,
    overlay: OverlayConfig,
}

impl<M: DetectorModel> Detector<M> {
    pub fn new(model: M, settings: &ExplainerSettings, overlay: OverlayConfig) -> Result<Self> {
        let explainers = ExplainerSet::build(&model, settings)?;
        Ok(Self {
            model,
            explainers,
            overlay,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    fn run(&self, path: &Path, method: XaiMethod) -> Result<DetectorResult> {
        let explainer = self.explainers.get(method)?;
        log_stage(DetectionStage::Received);

        let preprocessed = self.model.preprocess(path)?;
        let _artifact = ArtifactGuard::new(preprocessed.artifact);
        log_stage(DetectionStage::Preprocessed);

        let prediction = self.model.predict(preprocessed.model_input.view())?;
        tracing::info!(?prediction, "prediction ready");
        log_stage(DetectionStage::Predicted);

        let class_index = self.model.explanation_class(&prediction)?;
        let xai_explain = explainer.explain(
            preprocessed.model_input.view(),
            class_index,
            &preprocessed.base_image,
            &self.overlay,
        )?;
        log_stage(DetectionStage::Explained);

        Ok(DetectorResult {
            xai_method: method,
            xai_explain,
            prediction,
        })
    }
}

fn log_stage(stage: DetectionStage) {
    tracing::debug!(?stage, "detection stage");
}

impl<M: DetectorModel> DetectionService for Detector<M> {
    fn service(&self) -> ServiceKind {
        self.model.service()
    }

    fn detect(&self, path: &Path, method: XaiMethod) -> Result<DetectorResult> {
        let span = tracing::info_span!(
            "detect",
            service = %self.model.service(),
            xai_method = %method
        );
        let _enter = span.enter();
        tracing::info!(path = %path.display(), "detection started");

        match self.run(path, method) {
            Ok(result) => {
                log_stage(DetectionStage::Assembled);
                tracing::info!("detection completed");
                Ok(result)
            }
            Err(e) => {
                tracing::error!(stage = ?DetectionStage::Failed, error = %e, "detection failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::{MockDetectorModel, TinyConvNet};
    use image::{Rgb, RgbImage};

    fn write_image(dir: &Path) -> Result<std::path::PathBuf> {
        let path = dir.join("input.png");
        RgbImage::from_fn(24, 24, |x, y| Rgb([(x * 10) as u8, (y * 10) as u8, 128])).save(&path)?;
        Ok(path)
    }

    fn fast_settings() -> ExplainerSettings {
        ExplainerSettings {
            lime: LimeConfig {
                num_samples: 40,
                segmentation: crate::xai::segmentation::SlicConfig {
                    n_segments: 9,
                    ..Default::default()
                },
                ..LimeConfig::default()
            },
            shap: ShapConfig {
                max_evals: 64,
                masker: "blur(4,4)".to_string(),
                ..ShapConfig::default()
            },
            ..ExplainerSettings::default()
        }
    }

    fn detector(service: ServiceKind) -> Result<Detector<MockDetectorModel>> {
        let net = TinyConvNet::seeded(2, 3, 4, 2, 9).with_class_names(&["real", "fake"]);
        let model = MockDetectorModel::new(service, Arc::new(net), 24).with_artifact();
        Detector::new(model, &fast_settings(), OverlayConfig::default())
    }

    #[test]
    fn test_supported_methods_per_service() {
        assert_eq!(ServiceKind::Audio.supported_methods().len(), 3);
        assert!(!ServiceKind::Lung.supported_methods().contains(&XaiMethod::Shap));
    }

    #[test]
    fn test_audio_detection_for_every_method() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_image(dir.path())?;
        let detector = detector(ServiceKind::Audio)?;
        for method in XaiMethod::ALL {
            let result = detector.detect(&path, method)?;
            assert_eq!(result.xai_method, method);
            assert_eq!(result.xai_explain.shape(), &[24, 24, 3]);
            assert!(matches!(result.prediction, Prediction::Audio(_)));
        }
        assert!(!path.with_extension("artifact.png").exists());
        Ok(())
    }

    #[test]
    fn test_unsupported_method_is_rejected_before_work() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let detector = detector(ServiceKind::Lung)?;
        let missing = dir.path().join("never-read.png");
        let err = detector.detect(&missing, XaiMethod::Shap).err();
        assert!(matches!(err, Some(XaiError::UnsupportedMethod { .. })));
        Ok(())
    }

    #[test]
    fn test_lung_detection() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = write_image(dir.path())?;
        let result = detector(ServiceKind::Lung)?.detect(&path, XaiMethod::Gradcam)?;
        match result.prediction {
            Prediction::Lung(p) => assert_eq!(p.threshold, 0.5),
            other => panic!("unexpected prediction {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_missing_input_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let result = detector(ServiceKind::Audio)?.detect(&dir.path().join("nope.png"), XaiMethod::Lime);
        assert!(result.is_err());
        Ok(())
    }
}
