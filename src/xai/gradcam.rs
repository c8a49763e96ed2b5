//! Gradient-weighted class activation mapping.

use std::sync::Arc;

use image::imageops::{self, FilterType};
use ndarray::prelude::*;

use crate::errors::{Result, XaiError};
use crate::traits::{Classifier, GradientClassifier, LayerCapture, TensorLayout};
use crate::xai::helpers::{
    array_to_rgb_image, normalize_01, render_unsigned_overlay, resize_2d, UnsignedColoring,
};
use crate::xai::{new_run_id, resolve_class_index, BaseImage, Explainer, OverlayConfig, XaiMethod};

/// ImageNet channel means in BGR order, 0..255 scale.
const CAFFE_BGR_MEAN: [f32; 3] = [103.939, 116.779, 123.68];

/// Input construction for a proxy backbone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProxyPreprocessing {
    /// Resize to `size`, RGB to BGR, subtract the ImageNet means; NHWC on a 0..255 scale.
    Vgg16Caffe { size: u32 },
}

impl ProxyPreprocessing {
    fn layout(&self) -> TensorLayout {
        match self {
            Self::Vgg16Caffe { .. } => TensorLayout::Nhwc,
        }
    }

    fn build_input(&self, base_image: &BaseImage) -> Result<Array4<f32>> {
        match *self {
            Self::Vgg16Caffe { size } => {
                let rgb = array_to_rgb_image(base_image.rgb_u8()?.view())?;
                let resized = imageops::resize(&rgb, size, size, FilterType::Triangle);
                let side = size as usize;
                Ok(Array4::from_shape_fn((1, side, side, 3), |(_, y, x, c)| {
                    let rgb_channel = 2 - c;
                    resized.get_pixel(x as u32, y as u32)[rgb_channel] as f32 - CAFFE_BGR_MEAN[c]
                }))
            }
        }
    }
}

/// Which network the heatmap is computed on.
#[derive(Clone)]
pub enum GradCamSource {
    /// The deployed classifier, fed the same model input it was scored on.
    Classifier {
        classifier: Arc<dyn GradientClassifier>,
        layout: TensorLayout,
    },
    /// A separate backbone fed from the base image. Used when the deployed classifier
    /// cannot be differentiated.
    Proxy {
        backbone: Arc<dyn GradientClassifier>,
        preprocessing: ProxyPreprocessing,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GradCamConfig {
    /// Layer to hook; defaults to the last convolutional layer.
    pub layer: Option<String>,
    /// Zero out normalised activations below this value.
    pub threshold: Option<f32>,
}

pub struct GradCamExplainer {
    source: GradCamSource,
    config: GradCamConfig,
}

impl GradCamExplainer {
    pub fn new(source: GradCamSource, config: GradCamConfig) -> Self {
        Self { source, config }
    }

    /// Normalised class activation map at model input resolution.
    pub fn heatmap(
        &self,
        model_input: ArrayView4<'_, f32>,
        class_index: isize,
        base_image: &BaseImage,
    ) -> Result<Array2<f32>> {
        let (model, input, layout) = match &self.source {
            GradCamSource::Classifier { classifier, layout } => {
                (classifier.clone(), model_input.to_owned(), *layout)
            }
            GradCamSource::Proxy {
                backbone,
                preprocessing,
            } => (
                backbone.clone(),
                preprocessing.build_input(base_image)?,
                preprocessing.layout(),
            ),
        };

        let layer = match &self.config.layer {
            Some(layer) => layer.clone(),
            None => model.last_conv_layer().ok_or_else(|| XaiError::Integrity {
                message: "model has no convolutional layer to explain".to_string(),
            })?,
        };
        let class = select_class(model.as_ref(), input.view(), class_index)?;
        tracing::debug!(layer = %layer, class, "capturing activations");

        let capture = model.capture_layer(input.view(), &layer, class)?;
        let cam = class_activation_map(&capture)?;

        let (h, w) = layout.spatial_dims(input.shape());
        let cam = resize_2d(cam.view().into_dyn(), h, w)?;
        let mut cam = normalize_01(cam.view());
        if let Some(threshold) = self.config.threshold {
            cam.mapv_inplace(|v| if v < threshold { 0.0 } else { v });
        }
        Ok(cam)
    }
}

impl Explainer for GradCamExplainer {
    fn method(&self) -> XaiMethod {
        XaiMethod::Gradcam
    }

    fn explain(
        &self,
        model_input: ArrayView4<'_, f32>,
        class_index: isize,
        base_image: &BaseImage,
        overlay: &OverlayConfig,
    ) -> Result<Array3<u8>> {
        let run_id = new_run_id();
        let span = tracing::info_span!("gradcam", run_id = %run_id);
        let _enter = span.enter();
        tracing::info!(class_index, "START");

        let result = self.heatmap(model_input, class_index, base_image).and_then(|cam| {
            render_unsigned_overlay(base_image, cam.view().into_dyn(), overlay, UnsignedColoring::Jet)
        });
        match &result {
            Ok(_) => tracing::info!("END"),
            Err(e) => tracing::error!(error = %e, "FAILED"),
        }
        result
    }
}

/// Use `requested` when it is a valid class, otherwise score the input and take the
/// arg-max.
pub(crate) fn select_class<C>(model: &C, input: ArrayView4<'_, f32>, requested: isize) -> Result<usize>
where
    C: Classifier + ?Sized,
{
    match usize::try_from(requested) {
        Ok(index) if index < model.num_classes() => Ok(index),
        _ => {
            let scores = model.predict(input)?;
            if scores.nrows() == 0 {
                return Err(XaiError::shape("(1, K) scores", scores.shape()));
            }
            Ok(resolve_class_index(scores.row(0), requested))
        }
    }
}

/// ReLU of the gradient-weighted sum of activation channels, at layer resolution.
pub fn class_activation_map(capture: &LayerCapture) -> Result<Array2<f32>> {
    let activations = &capture.activations;
    let gradients = &capture.gradients;
    if activations.is_empty() || gradients.is_empty() {
        return Err(XaiError::Integrity {
            message: format!(
                "could not capture activations or gradients at layer {}",
                capture.layer
            ),
        });
    }
    if activations.dim() != gradients.dim() {
        return Err(XaiError::shape(
            format!("gradients matching activations {:?}", activations.shape()),
            gradients.shape(),
        ));
    }

    let (_, h, w) = activations.dim();
    let weights = gradients
        .mean_axis(Axis(2))
        .and_then(|g| g.mean_axis(Axis(1)))
        .ok_or_else(|| XaiError::shape("non-empty gradients", gradients.shape()))?;

    let cam = activations
        .axis_iter(Axis(0))
        .zip(weights.iter())
        .fold(Array2::<f32>::zeros((h, w)), |acc, (channel, &weight)| {
            acc + &channel * weight
        });
    Ok(cam.mapv(|v| v.max(0.0)))
}
