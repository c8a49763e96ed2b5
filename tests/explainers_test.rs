use std::collections::HashSet;
use std::f32::consts::PI;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::{GrayImage, Luma};
use ndarray::prelude::*;
use tempfile::TempDir;

use med_xai_rs::detector::audio::{AudioDetectorModel, CLASS_NAMES};
use med_xai_rs::detector::lung::{LungDetectorModel, DEFAULT_TARGET_LABEL, PATHOLOGIES};
use med_xai_rs::detector::{DetectionService, Detector, ExplainerSettings, Prediction, RgbPipeline};
use med_xai_rs::mocks::{FailingClassifier, TinyConvNet};
use med_xai_rs::xai::gradcam::{GradCamConfig, GradCamExplainer, GradCamSource};
use med_xai_rs::xai::helpers::{clip_and_normalize_signed, ensure_rgb, ensure_rgb_uint8};
use med_xai_rs::xai::lime::LimeConfig;
use med_xai_rs::xai::segmentation::SlicConfig;
use med_xai_rs::xai::shap::{ShapConfig, ShapExplainer};
use med_xai_rs::{BaseImage, Explainer, OverlayConfig, Result, TensorLayout, XaiError, XaiMethod};

fn fast_settings() -> ExplainerSettings {
    ExplainerSettings {
        lime: LimeConfig {
            num_samples: 48,
            segmentation: SlicConfig {
                n_segments: 16,
                ..SlicConfig::default()
            },
            ..LimeConfig::default()
        },
        shap: ShapConfig {
            max_evals: 64,
            masker: "blur(8,8)".to_string(),
            ..ShapConfig::default()
        },
        ..ExplainerSettings::default()
    }
}

fn write_chirp(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("clip.wav");
    let spec = hound::WavSpec {
        channels: 2,
        sample_rate: 22_050,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&path, spec)?;
    for i in 0..11_025 {
        let t = i as f32 / 22_050.0;
        let s = (2.0 * PI * (200.0 + 1500.0 * t) * t).sin() * 9_000.0;
        writer.write_sample(s as i16)?;
        writer.write_sample((s * 0.5) as i16)?;
    }
    writer.finalize()?;
    Ok(path)
}

fn write_xray(dir: &Path) -> Result<PathBuf> {
    let path = dir.join("chest.png");
    GrayImage::from_fn(48, 40, |x, y| {
        let d = ((x as f32 - 24.0).powi(2) + (y as f32 - 20.0).powi(2)).sqrt();
        Luma([if d < 8.0 { 230 } else { 60 }])
    })
    .save(&path)?;
    Ok(path)
}

fn spectrogram_files() -> Result<HashSet<PathBuf>> {
    Ok(std::fs::read_dir(std::env::temp_dir())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("spectrogram-"))
        })
        .collect())
}

#[test]
fn test_mid_gray_input_yields_overlay_of_base_size() -> Result<()> {
    let net = TinyConvNet::seeded(2, 1, 4, 4, 21).with_head_bias(&[0.0, 4.0]);
    let scores = med_xai_rs::Classifier::predict(&net, Array4::from_elem((1, 1, 224, 224), 0.5).view())?;
    assert!(scores[[0, 1]] > 0.8);

    let gradcam = GradCamExplainer::new(
        GradCamSource::Classifier {
            classifier: Arc::new(net),
            layout: TensorLayout::Nchw,
        },
        GradCamConfig::default(),
    );
    let base = BaseImage::from(Array2::<f32>::from_elem((180, 150), 0.5));
    let overlay = gradcam.explain(
        Array4::from_elem((1, 1, 224, 224), 0.5).view(),
        1,
        &base,
        &OverlayConfig::default(),
    )?;
    assert_eq!(overlay.shape(), &[180, 150, 3]);
    Ok(())
}

#[test]
fn test_percentile_clip_of_opposite_peaks() {
    let heat = array![[5.0f32, -5.0], [0.0, 0.0]];
    let signed = clip_and_normalize_signed(heat.view(), 50.0);
    let expected = array![[1.0f32, -1.0], [0.0, 0.0]];
    for (got, want) in signed.iter().zip(expected.iter()) {
        assert!((got - want).abs() < 1e-4, "{got} vs {want}");
    }
}

#[test]
fn test_grayscale_becomes_three_identical_channels() -> Result<()> {
    let gray = Array2::from_shape_fn((10, 10), |(y, x)| (y * 10 + x) as f32 / 100.0);
    let rgb = ensure_rgb(gray.view().into_dyn())?;
    assert_eq!(rgb.shape(), &[10, 10, 3]);
    for c in 0..3 {
        assert_eq!(rgb.index_axis(Axis(2), c), gray);
    }
    Ok(())
}

#[test]
fn test_shap_returns_base_image_when_everything_fails() -> Result<()> {
    let shap = ShapExplainer::new(
        Arc::new(FailingClassifier::new(2)),
        Arc::new(RgbPipeline::new(TensorLayout::Nchw)),
        ShapConfig::default(),
    )?;
    let base = BaseImage::from(Array3::<f32>::from_shape_fn((16, 16, 3), |(y, x, c)| {
        ((y + x + c) % 7) as f32 / 7.0
    }));
    let input = Array4::<f32>::from_elem((1, 3, 16, 16), 0.3);
    let overlay = shap.explain(input.view(), 0, &base, &OverlayConfig::default())?;
    assert_eq!(overlay, base.rgb_u8()?);
    assert_eq!(overlay, ensure_rgb_uint8(base.rgb01()?.view().into_dyn())?);
    Ok(())
}

#[test]
fn test_audio_service_end_to_end() -> Result<()> {
    let dir = TempDir::new()?;
    let wav = write_chirp(dir.path())?;
    let net = TinyConvNet::seeded(2, 3, 4, 4, 5)
        .with_class_names(&CLASS_NAMES)
        .with_layout(TensorLayout::Nhwc);
    let model = AudioDetectorModel::new(Arc::new(net))?.with_image_size(48);
    let detector = Detector::new(model, &fast_settings(), OverlayConfig::default())?;
    let before = spectrogram_files()?;

    for method in XaiMethod::ALL {
        let result = detector.detect(&wav, method)?;
        assert_eq!(result.xai_method, method);
        assert_eq!(result.xai_explain.shape(), &[48, 48, 3]);
        let Prediction::Audio(prediction) = &result.prediction else {
            panic!("audio detector produced {:?}", result.prediction);
        };
        assert!(CLASS_NAMES.contains(&prediction.label.as_str()));
        assert!((0.0..=1.0).contains(&prediction.confidence));
    }

    let after = spectrogram_files()?;
    assert!(after.is_subset(&before), "spectrograms left behind: {:?}", after.difference(&before));
    assert!(wav.exists());
    Ok(())
}

#[test]
fn test_lung_service_end_to_end() -> Result<()> {
    let dir = TempDir::new()?;
    let xray = write_xray(dir.path())?;
    let net = TinyConvNet::seeded(PATHOLOGIES.len(), 1, 4, 2, 8).with_class_names(&PATHOLOGIES);
    let model = LungDetectorModel::new(Arc::new(net), 0.5, DEFAULT_TARGET_LABEL)?.with_image_size(32);
    let detector = Detector::new(model, &fast_settings(), OverlayConfig::default())?;

    for method in [XaiMethod::Gradcam, XaiMethod::Lime] {
        let result = detector.detect(&xray, method)?;
        assert_eq!(result.xai_explain.shape(), &[32, 32, 3]);
        let Prediction::Lung(prediction) = &result.prediction else {
            panic!("lung detector produced {:?}", result.prediction);
        };
        assert_eq!(prediction.threshold, 0.5);
        let suspected = prediction.score >= prediction.threshold;
        assert_eq!(prediction.decision == "Cancer suspected", suspected);
    }

    assert!(matches!(
        detector.detect(&xray, XaiMethod::Shap),
        Err(XaiError::UnsupportedMethod { .. })
    ));
    Ok(())
}

#[test]
fn test_unknown_method_string_is_rejected() {
    let err = "integrated_gradients".parse::<XaiMethod>().err();
    assert!(matches!(err, Some(XaiError::UnknownMethod { .. })));
    assert_eq!(
        err.map(|e| e.category()),
        Some(med_xai_rs::errors::ErrorCategory::InvalidInput)
    );
}
