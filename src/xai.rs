//! Explainable-AI core: overlay helpers and the Grad-CAM, LIME and SHAP explainers.

pub mod gradcam;
pub mod helpers;
pub mod lime;
pub mod masker;
mod overlay_config;
pub mod segmentation;
pub mod shap;
mod surrogate;

use std::fmt;
use std::str::FromStr;

use image::RgbImage;
use ndarray::prelude::*;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, XaiError};
use helpers::{as_float01, ensure_rgb, ensure_rgb_uint8};

pub use overlay_config::OverlayConfig;

/// Explanation techniques known to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum XaiMethod {
    Gradcam,
    Lime,
    Shap,
}

impl XaiMethod {
    pub const ALL: [XaiMethod; 3] = [XaiMethod::Gradcam, XaiMethod::Lime, XaiMethod::Shap];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Gradcam => "gradcam",
            Self::Lime => "lime",
            Self::Shap => "shap",
        }
    }
}

impl fmt::Display for XaiMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for XaiMethod {
    type Err = XaiError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gradcam" => Ok(Self::Gradcam),
            "lime" => Ok(Self::Lime),
            "shap" => Ok(Self::Shap),
            _ => Err(XaiError::UnknownMethod {
                method: s.to_string(),
            }),
        }
    }
}

/// The image the user sees, before any model-specific normalisation.
///
/// Grayscale or RGB(A); 8-bit or floating point in either `[0, 1]` or `[0, 255]`.
#[derive(Debug, Clone, PartialEq)]
pub enum BaseImage {
    U8(ArrayD<u8>),
    F32(ArrayD<f32>),
}

impl BaseImage {
    pub fn shape(&self) -> &[usize] {
        match self {
            Self::U8(pixels) => pixels.shape(),
            Self::F32(pixels) => pixels.shape(),
        }
    }

    /// `(height, width)`, the first two axes.
    pub fn spatial_dims(&self) -> Result<(usize, usize)> {
        match self.shape() {
            [h, w] | [h, w, _] => Ok((*h, *w)),
            other => Err(XaiError::shape("image with shape (H,W) or (H,W,C)", other)),
        }
    }

    /// RGB, `f32` in `[0, 1]`.
    pub fn rgb01(&self) -> Result<Array3<f32>> {
        match self {
            Self::U8(pixels) => Ok(as_float01(ensure_rgb(pixels.view())?.view())),
            Self::F32(pixels) => Ok(as_float01(ensure_rgb(pixels.view())?.view())),
        }
    }

    pub fn rgb_u8(&self) -> Result<Array3<u8>> {
        match self {
            Self::U8(pixels) => ensure_rgb_uint8(pixels.view()),
            Self::F32(pixels) => ensure_rgb_uint8(pixels.view()),
        }
    }
}

impl From<Array2<f32>> for BaseImage {
    fn from(pixels: Array2<f32>) -> Self {
        Self::F32(pixels.into_dyn())
    }
}

impl From<Array3<f32>> for BaseImage {
    fn from(pixels: Array3<f32>) -> Self {
        Self::F32(pixels.into_dyn())
    }
}

impl From<Array3<u8>> for BaseImage {
    fn from(pixels: Array3<u8>) -> Self {
        Self::U8(pixels.into_dyn())
    }
}

impl From<&RgbImage> for BaseImage {
    fn from(image: &RgbImage) -> Self {
        let (w, h) = image.dimensions();
        let pixels = Array3::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
            image.get_pixel(x as u32, y as u32)[c]
        });
        Self::U8(pixels.into_dyn())
    }
}

/// A technique that turns a model decision into an overlay on the base image.
///
/// Implementations hold a read-only handle to the model they explain and are safe to
/// share between request handlers.
pub trait Explainer: Send + Sync {
    fn method(&self) -> XaiMethod;

    /// Produce an `(H, W, 3)` 8-bit overlay matching the spatial size of `base_image`.
    ///
    /// `class_index` outside `[0, num_classes)` falls back to the arg-max class.
    fn explain(
        &self,
        model_input: ArrayView4<'_, f32>,
        class_index: isize,
        base_image: &BaseImage,
        overlay: &OverlayConfig,
    ) -> Result<Array3<u8>>;
}

/// Pick the requested class, or the arg-max of `scores` when the request is out of range.
pub fn resolve_class_index(scores: ArrayView1<'_, f32>, requested: isize) -> usize {
    match usize::try_from(requested) {
        Ok(index) if index < scores.len() => index,
        _ => {
            let fallback = argmax(scores);
            tracing::warn!(
                requested,
                fallback,
                num_classes = scores.len(),
                "class index out of range, explaining arg-max class"
            );
            fallback
        }
    }
}

pub fn argmax(scores: ArrayView1<'_, f32>) -> usize {
    scores
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_score), (i, &s)| {
            if s > best_score {
                (i, s)
            } else {
                (best, best_score)
            }
        })
        .0
}

/// Short correlation id attached to every explanation run.
pub fn new_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}
