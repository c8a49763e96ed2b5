use std::path::Path;
use std::sync::Arc;

use image::imageops::{self, FilterType};
use ndarray::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::detector::{AudioPrediction, LungPrediction, Prediction, RgbPipeline, ServiceKind};
use crate::errors::{Result, XaiError};
use crate::traits::{
    Classifier, DetectorModel, GradientClassifier, InputPipeline, LayerCapture, Preprocessed,
    TensorLayout,
};
use crate::xai::BaseImage;

pub const TINY_CONV_LAYER: &str = "conv";

/// Test double: one 3x3 convolution, ReLU, global average pooling, a linear head and
/// softmax, with analytic gradients for Grad-CAM and input saliency.
#[derive(Debug, Clone)]
pub struct TinyConvNet {
    /// `(F, C, 3, 3)`
    filters: Array4<f32>,
    conv_bias: Array1<f32>,
    stride: usize,
    /// `(K, F)`
    head: Array2<f32>,
    head_bias: Array1<f32>,
    class_names: Vec<String>,
    layout: TensorLayout,
    expose_conv: bool,
    expose_input_gradient: bool,
}

struct Forward {
    pre: Array3<f32>,
    act: Array3<f32>,
    scores: Array1<f32>,
}

impl TinyConvNet {
    pub fn seeded(
        num_classes: usize,
        in_channels: usize,
        num_filters: usize,
        stride: usize,
        seed: u64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let filters = Array4::<f32>::from_shape_simple_fn((num_filters, in_channels, 3, 3), || {
            rng.gen_range(-0.5..0.5)
        });
        let head = Array2::<f32>::from_shape_simple_fn((num_classes, num_filters), || {
            rng.gen_range(-0.5..0.5)
        });
        Self {
            filters,
            conv_bias: Array1::from_elem(num_filters, 0.05),
            stride: stride.max(1),
            head,
            head_bias: Array1::zeros(num_classes),
            class_names: (0..num_classes).map(|k| format!("class_{k}")).collect(),
            layout: TensorLayout::Nchw,
            expose_conv: true,
            expose_input_gradient: true,
        }
    }

    pub fn with_class_names(mut self, names: &[&str]) -> Self {
        assert_eq!(names.len(), self.class_names.len());
        self.class_names = names.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Shift the logits so that a neutral input lands on a chosen class.
    pub fn with_head_bias(mut self, bias: &[f32]) -> Self {
        assert_eq!(bias.len(), self.head_bias.len());
        self.head_bias = Array1::from(bias.to_vec());
        self
    }

    pub fn with_layout(mut self, layout: TensorLayout) -> Self {
        self.layout = layout;
        self
    }

    /// Behave like a model with no convolutional layer to hook.
    pub fn without_conv_layer(mut self) -> Self {
        self.expose_conv = false;
        self
    }

    pub fn without_input_gradient(mut self) -> Self {
        self.expose_input_gradient = false;
        self
    }

    fn sample_chw(&self, input: &ArrayView4<f32>, b: usize) -> Result<Array3<f32>> {
        let sample = input.index_axis(Axis(0), b);
        let chw = match self.layout {
            TensorLayout::Nchw => sample.to_owned(),
            TensorLayout::Nhwc => sample.permuted_axes([2, 0, 1]).as_standard_layout().into_owned(),
        };
        if chw.shape()[0] != self.filters.shape()[1] {
            return Err(XaiError::shape(
                format!("{} input channels", self.filters.shape()[1]),
                input.shape(),
            ));
        }
        Ok(chw)
    }

    fn out_len(&self, len: usize) -> usize {
        (len + 2 - 3) / self.stride + 1
    }

    fn forward(&self, x: &Array3<f32>) -> Forward {
        let (channels, h, w) = x.dim();
        let num_filters = self.filters.shape()[0];
        let (oh, ow) = (self.out_len(h), self.out_len(w));

        let mut pre = Array3::<f32>::zeros((num_filters, oh, ow));
        for ((f, oy, ox), value) in pre.indexed_iter_mut() {
            let mut acc = self.conv_bias[f];
            for c in 0..channels {
                for ky in 0..3 {
                    let iy = (oy * self.stride + ky) as isize - 1;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for kx in 0..3 {
                        let ix = (ox * self.stride + kx) as isize - 1;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        acc += self.filters[[f, c, ky, kx]] * x[[c, iy as usize, ix as usize]];
                    }
                }
            }
            *value = acc;
        }
        let act = pre.mapv(|v| v.max(0.0));

        let pooled = Array1::from_shape_fn(num_filters, |f| {
            act.index_axis(Axis(0), f).mean().unwrap_or(0.0)
        });
        let logits = self.head.dot(&pooled) + &self.head_bias;
        let max = logits.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        let exp = logits.mapv(|v| (v - max).exp());
        let scores = &exp / exp.sum();

        Forward { pre, act, scores }
    }

    /// d score[k] / d activation, `(F, h, w)`.
    fn activation_gradient(&self, forward: &Forward, class_index: usize) -> Array3<f32> {
        let s = &forward.scores;
        let dlogits = Array1::from_shape_fn(s.len(), |j| {
            let delta = if j == class_index { 1.0 } else { 0.0 };
            s[class_index] * (delta - s[j])
        });
        let dpooled = self.head.t().dot(&dlogits);
        let (_, oh, ow) = forward.act.dim();
        let area = (oh * ow) as f32;
        Array3::from_shape_fn(forward.act.raw_dim(), |(f, _, _)| dpooled[f] / area)
    }

    fn check_class(&self, class_index: usize) -> Result<()> {
        if class_index >= self.class_names.len() {
            return Err(XaiError::invalid_input(
                "class_index",
                format!("{class_index} outside [0, {})", self.class_names.len()),
            ));
        }
        Ok(())
    }

    fn single_sample<'a>(&self, input: &ArrayView4<'a, f32>) -> Result<Array3<f32>> {
        if input.shape()[0] != 1 {
            return Err(XaiError::shape("a single-sample batch", input.shape()));
        }
        self.sample_chw(input, 0)
    }
}

impl Classifier for TinyConvNet {
    fn predict(&self, input: ArrayView4<f32>) -> Result<Array2<f32>> {
        let batch = input.shape()[0];
        let mut scores = Array2::<f32>::zeros((batch, self.class_names.len()));
        for b in 0..batch {
            let x = self.sample_chw(&input, b)?;
            scores.row_mut(b).assign(&self.forward(&x).scores);
        }
        Ok(scores)
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }
}

impl GradientClassifier for TinyConvNet {
    fn last_conv_layer(&self) -> Option<String> {
        self.expose_conv.then(|| TINY_CONV_LAYER.to_string())
    }

    fn capture_layer(
        &self,
        input: ArrayView4<f32>,
        layer: &str,
        class_index: usize,
    ) -> Result<LayerCapture> {
        if !self.expose_conv || layer != TINY_CONV_LAYER {
            return Err(XaiError::Integrity {
                message: format!("layer {layer} cannot be captured"),
            });
        }
        self.check_class(class_index)?;
        let x = self.single_sample(&input)?;
        let forward = self.forward(&x);
        let gradients = self.activation_gradient(&forward, class_index);
        Ok(LayerCapture {
            layer: layer.to_string(),
            activations: forward.act,
            gradients,
            scores: forward.scores,
        })
    }

    fn input_gradient(&self, input: ArrayView4<f32>, class_index: usize) -> Result<Array4<f32>> {
        if !self.expose_input_gradient {
            return Err(XaiError::Integrity {
                message: "input gradients are not available".to_string(),
            });
        }
        self.check_class(class_index)?;
        let x = self.single_sample(&input)?;
        let forward = self.forward(&x);
        let dact = self.activation_gradient(&forward, class_index);
        let dpre = &dact * &forward.pre.mapv(|v| if v > 0.0 { 1.0 } else { 0.0 });

        let (channels, h, w) = x.dim();
        let mut dx = Array3::<f32>::zeros((channels, h, w));
        for ((f, oy, ox), &g) in dpre.indexed_iter() {
            if g == 0.0 {
                continue;
            }
            for c in 0..channels {
                for ky in 0..3 {
                    let iy = (oy * self.stride + ky) as isize - 1;
                    if iy < 0 || iy >= h as isize {
                        continue;
                    }
                    for kx in 0..3 {
                        let ix = (ox * self.stride + kx) as isize - 1;
                        if ix < 0 || ix >= w as isize {
                            continue;
                        }
                        dx[[c, iy as usize, ix as usize]] += self.filters[[f, c, ky, kx]] * g;
                    }
                }
            }
        }

        let dx = match self.layout {
            TensorLayout::Nchw => dx,
            TensorLayout::Nhwc => dx.permuted_axes([1, 2, 0]).as_standard_layout().into_owned(),
        };
        Ok(dx.insert_axis(Axis(0)))
    }
}

/// Classifier whose every operation fails.
#[derive(Debug, Clone)]
pub struct FailingClassifier {
    class_names: Vec<String>,
}

impl FailingClassifier {
    pub fn new(num_classes: usize) -> Self {
        Self {
            class_names: (0..num_classes).map(|k| format!("class_{k}")).collect(),
        }
    }

    fn failure(operation: &str) -> XaiError {
        XaiError::model(
            operation,
            std::io::Error::new(std::io::ErrorKind::Other, "backend unavailable"),
        )
    }
}

impl Classifier for FailingClassifier {
    fn predict(&self, _input: ArrayView4<f32>) -> Result<Array2<f32>> {
        Err(Self::failure("predict"))
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }
}

impl GradientClassifier for FailingClassifier {
    fn last_conv_layer(&self) -> Option<String> {
        None
    }

    fn capture_layer(&self, _: ArrayView4<f32>, _: &str, _: usize) -> Result<LayerCapture> {
        Err(Self::failure("capture_layer"))
    }

    fn input_gradient(&self, _: ArrayView4<f32>, _: usize) -> Result<Array4<f32>> {
        Err(Self::failure("input_gradient"))
    }
}

/// Detector model over any image file, backed by an arbitrary gradient classifier.
///
/// Audio-kind models label by arg-max; lung-kind models threshold the score of the
/// first class.
pub struct MockDetectorModel {
    service: ServiceKind,
    classifier: Arc<dyn GradientClassifier>,
    pipeline: Arc<RgbPipeline>,
    image_size: u32,
    threshold: f32,
    write_artifact: bool,
}

impl MockDetectorModel {
    pub fn new(service: ServiceKind, classifier: Arc<dyn GradientClassifier>, image_size: u32) -> Self {
        Self {
            service,
            classifier,
            pipeline: Arc::new(RgbPipeline::new(TensorLayout::Nchw)),
            image_size,
            threshold: 0.5,
            write_artifact: false,
        }
    }

    /// Write a scratch copy of every input next to it, mimicking spectrogram rendering.
    pub fn with_artifact(mut self) -> Self {
        self.write_artifact = true;
        self
    }
}

impl DetectorModel for MockDetectorModel {
    fn service(&self) -> ServiceKind {
        self.service
    }

    fn preprocess(&self, path: &Path) -> Result<Preprocessed> {
        let image = image::open(path).map_err(|e| XaiError::ImageProcessing {
            path: path.display().to_string(),
            operation: "image decoding".to_string(),
            source: Box::new(e),
        })?;
        let rgb = imageops::resize(
            &image.to_rgb8(),
            self.image_size,
            self.image_size,
            FilterType::Triangle,
        );

        let artifact = if self.write_artifact {
            let artifact = path.with_extension("artifact.png");
            rgb.save(&artifact)?;
            Some(artifact)
        } else {
            None
        };

        let base_image = BaseImage::from(&rgb);
        let model_input = self.pipeline.rgb01_to_input(&[base_image.rgb01()?])?;
        Ok(Preprocessed {
            model_input,
            base_image,
            artifact,
        })
    }

    fn predict(&self, model_input: ArrayView4<f32>) -> Result<Prediction> {
        let scores = self.classifier.predict(model_input)?;
        let scores = scores.row(0);
        Ok(match self.service {
            ServiceKind::Audio => {
                Prediction::Audio(AudioPrediction::from_scores(scores, self.classifier.class_names())?)
            }
            ServiceKind::Lung => Prediction::Lung(LungPrediction::from_score(scores[0], self.threshold)),
        })
    }

    fn explanation_class(&self, prediction: &Prediction) -> Result<isize> {
        Ok(match prediction {
            Prediction::Audio(p) => p.class_index as isize,
            Prediction::Lung(_) => 0,
        })
    }

    fn classifier(&self) -> Arc<dyn GradientClassifier> {
        self.classifier.clone()
    }

    fn pipeline(&self) -> Arc<dyn InputPipeline> {
        self.pipeline.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn finite_difference(net: &TinyConvNet, input: &Array4<f32>, idx: [usize; 4], class: usize) -> f32 {
        let eps = 1e-2;
        let mut plus = input.clone();
        plus[idx] += eps;
        let mut minus = input.clone();
        minus[idx] -= eps;
        let up = net.predict(plus.view()).map(|s| s[[0, class]]).unwrap_or(0.0);
        let down = net.predict(minus.view()).map(|s| s[[0, class]]).unwrap_or(0.0);
        (up - down) / (2.0 * eps)
    }

    #[test]
    fn test_scores_are_probabilities() -> Result<()> {
        let net = TinyConvNet::seeded(3, 3, 4, 2, 7);
        let input = Array4::from_shape_fn((2, 3, 9, 9), |(b, c, y, x)| {
            ((b + c + y * x) % 5) as f32 / 5.0
        });
        let scores = net.predict(input.view())?;
        assert_eq!(scores.dim(), (2, 3));
        for row in scores.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn test_head_bias_selects_class() -> Result<()> {
        let net = TinyConvNet::seeded(2, 3, 4, 4, 1).with_head_bias(&[0.0, 2.2]);
        let input = Array4::from_elem((1, 3, 32, 32), 0.5);
        let scores = net.predict(input.view())?;
        assert!(scores[[0, 1]] > 0.8);
        Ok(())
    }

    #[test]
    fn test_input_gradient_matches_finite_difference() -> Result<()> {
        let net = TinyConvNet::seeded(2, 3, 4, 1, 3);
        let input = Array4::from_shape_fn((1, 3, 6, 6), |(_, c, y, x)| {
            0.1 + ((c * 7 + y * 3 + x) % 11) as f32 / 11.0
        });
        let grad = net.input_gradient(input.view(), 1)?;
        assert_eq!(grad.shape(), input.shape());

        for idx in [[0, 0, 2, 3], [0, 2, 5, 0], [0, 1, 3, 3]] {
            let numeric = finite_difference(&net, &input, idx, 1);
            assert!(
                (numeric - grad[idx]).abs() < 5e-3,
                "{idx:?}: analytic {} vs numeric {numeric}",
                grad[idx]
            );
        }
        Ok(())
    }

    #[test]
    fn test_capture_shapes_and_missing_layer() -> Result<()> {
        let net = TinyConvNet::seeded(2, 1, 5, 4, 9);
        let input = Array4::from_elem((1, 1, 16, 16), 0.3);
        let capture = net.capture_layer(input.view(), TINY_CONV_LAYER, 0)?;
        assert_eq!(capture.activations.dim(), (5, 4, 4));
        assert_eq!(capture.gradients.dim(), (5, 4, 4));

        let flat = net.without_conv_layer();
        assert!(flat.last_conv_layer().is_none());
        assert!(flat.capture_layer(input.view(), TINY_CONV_LAYER, 0).is_err());
        Ok(())
    }

    #[test]
    fn test_nhwc_layout_round_trips_gradient_shape() -> Result<()> {
        let net = TinyConvNet::seeded(2, 3, 2, 2, 5).with_layout(TensorLayout::Nhwc);
        let input = Array4::from_elem((1, 8, 10, 3), 0.4);
        assert_eq!(net.predict(input.view())?.dim(), (1, 2));
        assert_eq!(net.input_gradient(input.view(), 0)?.shape(), &[1, 8, 10, 3]);
        Ok(())
    }

    #[test]
    fn test_failing_classifier_fails() {
        let failing = FailingClassifier::new(2);
        let input = Array4::zeros((1, 3, 4, 4));
        assert!(failing.predict(input.view()).is_err());
        assert!(failing.input_gradient(input.view(), 0).is_err());
    }
}
