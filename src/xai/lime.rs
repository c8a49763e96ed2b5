//! Local surrogate explanations over superpixels.

use std::sync::Arc;

use image::{ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use ndarray::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::errors::{Result, XaiError};
use crate::traits::{GradientClassifier, InputPipeline};
use crate::xai::gradcam::select_class;
use crate::xai::helpers::{render_signed_overlay, HeatPalette};
use crate::xai::segmentation::{slic, Segmentation, SlicConfig};
use crate::xai::surrogate::{fit_weighted_ridge, LinearSurrogate};
use crate::xai::{new_run_id, BaseImage, Explainer, OverlayConfig, XaiMethod};

const BOUNDARY_COLOR: [u8; 3] = [255, 255, 0];

#[derive(Debug, Clone, PartialEq)]
pub struct LimeConfig {
    /// Perturbed samples, including the unperturbed image.
    pub num_samples: usize,
    /// Keep only the strongest superpixels; `None` keeps all of them.
    pub num_features: Option<usize>,
    pub batch_size: usize,
    /// Width of the exponential kernel over cosine distance.
    pub kernel_width: f32,
    pub ridge_alpha: f32,
    pub segmentation: SlicConfig,
    /// Smooth the per-pixel weight map before rendering.
    pub heat_sigma: Option<f32>,
    /// Value written into hidden superpixels.
    pub hide_value: f32,
    pub seed: u64,
    /// Outline the kept superpixels.
    pub mark_boundaries: bool,
    pub palette: HeatPalette,
}

impl Default for LimeConfig {
    fn default() -> Self {
        Self {
            num_samples: 1000,
            num_features: Some(10),
            batch_size: 10,
            kernel_width: 0.25,
            ridge_alpha: 1.0,
            segmentation: SlicConfig::default(),
            heat_sigma: Some(2.0),
            hide_value: 0.0,
            seed: 0,
            mark_boundaries: false,
            palette: HeatPalette::default(),
        }
    }
}

/// Superpixel weights for one explained class.
#[derive(Debug, Clone)]
pub struct LimeAttribution {
    pub class_index: usize,
    pub segmentation: Segmentation,
    /// One weight per superpixel; zero for superpixels dropped by feature selection.
    pub weights: Array1<f32>,
    pub surrogate: LinearSurrogate,
}

pub struct LimeExplainer {
    classifier: Arc<dyn GradientClassifier>,
    pipeline: Arc<dyn InputPipeline>,
    config: LimeConfig,
}

impl LimeExplainer {
    pub fn new(
        classifier: Arc<dyn GradientClassifier>,
        pipeline: Arc<dyn InputPipeline>,
        config: LimeConfig,
    ) -> Self {
        Self {
            classifier,
            pipeline,
            config,
        }
    }

    pub fn attribute(
        &self,
        model_input: ArrayView4<'_, f32>,
        class_index: isize,
        base_image: &BaseImage,
    ) -> Result<LimeAttribution> {
        let rgb = base_image.rgb01()?;
        let segmentation = slic(rgb.view(), &self.config.segmentation)?;
        let class = select_class(self.classifier.as_ref(), model_input, class_index)?;
        let num_segments = segmentation.num_segments();
        tracing::debug!(num_segments, class, "segmented base image");

        let data = self.sample_masks(num_segments);
        let targets = self.score_samples(&rgb, &segmentation, data.view(), class)?;
        let weights = cosine_kernel(data.view(), self.config.kernel_width);

        let surrogate = fit_weighted_ridge(
            data.view(),
            targets.view(),
            weights.view(),
            self.config.ridge_alpha,
        )?;
        let (weights, surrogate) = match self.config.num_features {
            Some(k) if k < num_segments => {
                self.refit_top_features(data.view(), targets.view(), weights.view(), &surrogate, k)?
            }
            _ => (surrogate.coefficients.clone(), surrogate),
        };
        tracing::debug!(
            intercept = surrogate.intercept,
            score = surrogate.score,
            "fitted local surrogate"
        );

        Ok(LimeAttribution {
            class_index: class,
            segmentation,
            weights,
            surrogate,
        })
    }

    /// Binary on/off masks, the first row keeping every superpixel.
    fn sample_masks(&self, num_segments: usize) -> Array2<f32> {
        let num_samples = self.config.num_samples.max(2);
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut data = Array2::<f32>::ones((num_samples, num_segments));
        for mut row in data.rows_mut().into_iter().skip(1) {
            row.mapv_inplace(|_| if rng.gen_bool(0.5) { 1.0 } else { 0.0 });
        }
        data
    }

    fn score_samples(
        &self,
        rgb: &Array3<f32>,
        segmentation: &Segmentation,
        data: ArrayView2<'_, f32>,
        class: usize,
    ) -> Result<Array1<f32>> {
        let labels = segmentation.labels();
        let batch_size = self.config.batch_size.max(1);
        let mut targets = Vec::with_capacity(data.nrows());

        for (batch_index, chunk) in data.axis_chunks_iter(Axis(0), batch_size).enumerate() {
            let images: Vec<Array3<f32>> = chunk
                .rows()
                .into_iter()
                .map(|active| {
                    let mut image = rgb.clone();
                    for ((y, x, _), value) in image.indexed_iter_mut() {
                        if active[labels[[y, x]]] == 0.0 {
                            *value = self.config.hide_value;
                        }
                    }
                    image
                })
                .collect();
            let input = self.pipeline.rgb01_to_input(&images)?;
            let scores = self.classifier.predict(input.view())?;
            if scores.ncols() <= class || scores.nrows() != images.len() {
                return Err(XaiError::shape(
                    format!("({}, >{class}) scores", images.len()),
                    scores.shape(),
                ));
            }
            targets.extend(scores.column(class).iter().copied());
            if batch_index % 20 == 0 {
                tracing::debug!(done = targets.len(), total = data.nrows(), "PROGRESS");
            }
        }
        Ok(Array1::from(targets))
    }

    fn refit_top_features(
        &self,
        data: ArrayView2<'_, f32>,
        targets: ArrayView1<'_, f32>,
        kernel: ArrayView1<'_, f32>,
        full: &LinearSurrogate,
        k: usize,
    ) -> Result<(Array1<f32>, LinearSurrogate)> {
        let mut order: Vec<usize> = (0..full.coefficients.len()).collect();
        order.sort_by(|&a, &b| {
            full.coefficients[b]
                .abs()
                .total_cmp(&full.coefficients[a].abs())
        });
        order.truncate(k);

        let selected = data.select(Axis(1), &order);
        let refit = fit_weighted_ridge(selected.view(), targets, kernel, self.config.ridge_alpha)?;
        let mut weights = Array1::<f32>::zeros(full.coefficients.len());
        for (&feature, &coefficient) in order.iter().zip(refit.coefficients.iter()) {
            weights[feature] = coefficient;
        }
        Ok((weights, refit))
    }
}

impl Explainer for LimeExplainer {
    fn method(&self) -> XaiMethod {
        XaiMethod::Lime
    }

    fn explain(
        &self,
        model_input: ArrayView4<'_, f32>,
        class_index: isize,
        base_image: &BaseImage,
        overlay: &OverlayConfig,
    ) -> Result<Array3<u8>> {
        let run_id = new_run_id();
        let span = tracing::info_span!("lime", run_id = %run_id);
        let _enter = span.enter();
        tracing::info!(
            class_index,
            num_samples = self.config.num_samples,
            "START"
        );

        let result = self
            .attribute(model_input, class_index, base_image)
            .and_then(|attribution| self.render(&attribution, base_image, overlay));
        match &result {
            Ok(_) => tracing::info!("END"),
            Err(e) => tracing::error!(error = %e, "FAILED"),
        }
        result
    }
}

impl LimeExplainer {
    fn render(
        &self,
        attribution: &LimeAttribution,
        base_image: &BaseImage,
        overlay: &OverlayConfig,
    ) -> Result<Array3<u8>> {
        let segmentation = &attribution.segmentation;
        let weights = attribution.weights.as_slice().unwrap_or(&[]);
        let mut heat = segmentation.broadcast(weights);
        if let Some(sigma) = self.config.heat_sigma.filter(|s| *s > 0.0) {
            heat = blur_map(heat, sigma)?;
        }
        let mut pixels = render_signed_overlay(
            base_image,
            heat.view().into_dyn(),
            overlay,
            &self.config.palette,
        )?;

        if self.config.mark_boundaries {
            let labels = segmentation.labels();
            for ((y, x), &edge) in segmentation.boundaries().indexed_iter() {
                if edge && attribution.weights[labels[[y, x]]] != 0.0 {
                    for (ch, &value) in BOUNDARY_COLOR.iter().enumerate() {
                        pixels[[y, x, ch]] = value;
                    }
                }
            }
        }
        Ok(pixels)
    }
}

/// LIME's similarity kernel: `sqrt(exp(-d^2 / width^2))` of the cosine distance to the
/// all-on sample.
fn cosine_kernel(data: ArrayView2<'_, f32>, width: f32) -> Array1<f32> {
    let reference_norm = (data.ncols() as f32).sqrt();
    data.map_axis(Axis(1), |row| {
        let norm = row.dot(&row).sqrt();
        let distance = if norm == 0.0 || reference_norm == 0.0 {
            1.0
        } else {
            1.0 - row.sum() / (norm * reference_norm)
        };
        (-(distance * distance) / (width * width)).exp().sqrt()
    })
}

fn blur_map(heat: Array2<f32>, sigma: f32) -> Result<Array2<f32>> {
    let (h, w) = heat.dim();
    let raw: Vec<f32> = heat.iter().copied().collect();
    let buffer = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| XaiError::shape("2-D weight map", heat.shape()))?;
    let blurred = gaussian_blur_f32(&buffer, sigma);
    Ok(Array2::from_shape_vec((h, w), blurred.into_raw())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::RgbPipeline;
    use crate::mocks::TinyConvNet;
    use crate::traits::{Classifier, LayerCapture, TensorLayout};

    /// Scores class 1 by the brightness of the left half of the image.
    struct LeftHalfBrightness {
        names: Vec<String>,
    }

    impl LeftHalfBrightness {
        fn new() -> Self {
            Self {
                names: vec!["dark".into(), "bright_left".into()],
            }
        }
    }

    impl Classifier for LeftHalfBrightness {
        fn predict(&self, input: ArrayView4<f32>) -> Result<Array2<f32>> {
            let width = input.shape()[3];
            let left = input.slice(s![.., .., .., ..width / 2]);
            let brightness = left
                .mean_axis(Axis(3))
                .and_then(|m| m.mean_axis(Axis(2)))
                .and_then(|m| m.mean_axis(Axis(1)))
                .ok_or_else(|| XaiError::shape("non-empty input", input.shape()))?;
            Ok(Array2::from_shape_fn((input.shape()[0], 2), |(b, k)| {
                if k == 1 {
                    brightness[b]
                } else {
                    1.0 - brightness[b]
                }
            }))
        }

        fn class_names(&self) -> &[String] {
            &self.names
        }
    }

    impl GradientClassifier for LeftHalfBrightness {
        fn last_conv_layer(&self) -> Option<String> {
            None
        }

        fn capture_layer(&self, _: ArrayView4<f32>, _: &str, _: usize) -> Result<LayerCapture> {
            Err(XaiError::Integrity {
                message: "not a CNN".into(),
            })
        }

        fn input_gradient(&self, _: ArrayView4<f32>, _: usize) -> Result<Array4<f32>> {
            Err(XaiError::Integrity {
                message: "not differentiable".into(),
            })
        }
    }

    fn small_config() -> LimeConfig {
        LimeConfig {
            num_samples: 80,
            num_features: None,
            segmentation: SlicConfig {
                n_segments: 16,
                sigma: 0.0,
                ..SlicConfig::default()
            },
            ..LimeConfig::default()
        }
    }

    fn pipeline() -> Arc<dyn InputPipeline> {
        Arc::new(RgbPipeline::new(TensorLayout::Nchw))
    }

    fn textured(h: usize, w: usize) -> Array3<f32> {
        Array3::from_shape_fn((h, w, 3), |(y, x, c)| {
            0.2 + 0.6 * (((y / 8 + x / 8 + c) % 3) as f32 / 2.0)
        })
    }

    #[test]
    fn test_weights_follow_the_informative_half() -> Result<()> {
        let rgb = Array3::<f32>::from_elem((32, 32, 3), 0.8);
        let base = BaseImage::from(rgb.clone());
        let input = RgbPipeline::new(TensorLayout::Nchw).rgb01_to_input(&[rgb])?;
        let lime = LimeExplainer::new(Arc::new(LeftHalfBrightness::new()), pipeline(), small_config());

        let attribution = lime.attribute(input.view(), 1, &base)?;
        let labels = attribution.segmentation.labels();
        let (mut left, mut right) = (Vec::new(), Vec::new());
        for segment in 0..attribution.segmentation.num_segments() {
            let columns: Vec<usize> = labels
                .indexed_iter()
                .filter(|(_, &l)| l == segment)
                .map(|((_, x), _)| x)
                .collect();
            if columns.iter().all(|&x| x < 16) {
                left.push(attribution.weights[segment]);
            } else if columns.iter().all(|&x| x >= 16) {
                right.push(attribution.weights[segment]);
            }
        }
        assert!(!left.is_empty() && !right.is_empty());
        let weakest_left = left.iter().copied().fold(f32::INFINITY, f32::min);
        assert!(weakest_left > 0.0);
        assert!(right.iter().all(|&w| w.abs() < 0.25 * weakest_left));
        Ok(())
    }

    #[test]
    fn test_output_shape_and_determinism() -> Result<()> {
        let rgb = textured(24, 28);
        let base = BaseImage::from(rgb.clone());
        let input = RgbPipeline::new(TensorLayout::Nchw).rgb01_to_input(&[rgb])?;
        let net = TinyConvNet::seeded(2, 3, 3, 2, 8);
        let lime = LimeExplainer::new(Arc::new(net), pipeline(), small_config());

        let config = OverlayConfig::default();
        let first = lime.explain(input.view(), 0, &base, &config)?;
        assert_eq!(first.shape(), &[24, 28, 3]);
        assert_eq!(lime.explain(input.view(), 0, &base, &config)?, first);
        Ok(())
    }

    #[test]
    fn test_fixed_seed_reproduces_across_instances() -> Result<()> {
        let rgb = textured(24, 24);
        let base = BaseImage::from(rgb.clone());
        let input = RgbPipeline::new(TensorLayout::Nchw).rgb01_to_input(&[rgb])?;
        let net: Arc<dyn GradientClassifier> = Arc::new(LeftHalfBrightness::new());
        let seeded = |seed| {
            LimeExplainer::new(
                net.clone(),
                pipeline(),
                LimeConfig {
                    seed,
                    ..small_config()
                },
            )
        };

        let first = seeded(7).attribute(input.view(), 1, &base)?;
        let second = seeded(7).attribute(input.view(), 1, &base)?;
        assert_eq!(first.weights, second.weights);
        assert_eq!(first.surrogate, second.surrogate);

        let config = OverlayConfig::default();
        assert_eq!(
            seeded(7).explain(input.view(), 1, &base, &config)?,
            seeded(7).explain(input.view(), 1, &base, &config)?
        );

        let reseeded = seeded(8).attribute(input.view(), 1, &base)?;
        assert_ne!(first.weights, reseeded.weights);
        Ok(())
    }

    #[test]
    fn test_invalid_class_index_falls_back_to_argmax() -> Result<()> {
        let rgb = textured(24, 24);
        let base = BaseImage::from(rgb.clone());
        let input = RgbPipeline::new(TensorLayout::Nchw).rgb01_to_input(&[rgb])?;
        let net = TinyConvNet::seeded(3, 3, 3, 2, 12);
        let top = crate::xai::argmax(net.predict(input.view())?.row(0)) as isize;
        let lime = LimeExplainer::new(Arc::new(net), pipeline(), small_config());
        let config = OverlayConfig::default();

        let expected = lime.explain(input.view(), top, &base, &config)?;
        assert_eq!(lime.explain(input.view(), -1, &base, &config)?, expected);
        assert_eq!(lime.explain(input.view(), 3, &base, &config)?, expected);
        Ok(())
    }

    #[test]
    fn test_feature_selection_keeps_k_superpixels() -> Result<()> {
        let rgb = textured(32, 32);
        let base = BaseImage::from(rgb.clone());
        let input = RgbPipeline::new(TensorLayout::Nchw).rgb01_to_input(&[rgb])?;
        let config = LimeConfig {
            num_features: Some(3),
            mark_boundaries: true,
            ..small_config()
        };
        let lime = LimeExplainer::new(Arc::new(LeftHalfBrightness::new()), pipeline(), config);
        let attribution = lime.attribute(input.view(), 1, &base)?;
        assert!(attribution.weights.iter().filter(|&&w| w != 0.0).count() <= 3);

        let overlay = lime.explain(input.view(), 1, &base, &OverlayConfig::default())?;
        assert_eq!(overlay.shape(), &[32, 32, 3]);
        Ok(())
    }

    #[test]
    fn test_cosine_kernel() {
        let data = array![[1.0f32, 1.0, 1.0, 1.0], [0.0, 0.0, 0.0, 0.0], [1.0, 0.0, 1.0, 0.0]];
        let kernel = cosine_kernel(data.view(), 0.25);
        assert!((kernel[0] - 1.0).abs() < 1e-6);
        assert!(kernel[1] < 1e-3);
        assert!(kernel[2] > kernel[1] && kernel[2] < kernel[0]);
    }
}
