//! Display-space RGB back to model inputs.

use ndarray::prelude::*;

use crate::errors::{Result, XaiError};
use crate::traits::{InputPipeline, TensorLayout};
use crate::xai::helpers::resize_2d;

fn check_batch(images: &[Array3<f32>]) -> Result<(usize, usize)> {
    let first = images
        .first()
        .ok_or_else(|| XaiError::invalid_input("images", "batch is empty"))?;
    let (h, w, c) = first.dim();
    if c != 3 {
        return Err(XaiError::shape("(H, W, 3) images", first.shape()));
    }
    if let Some(odd) = images.iter().find(|image| image.dim() != (h, w, 3)) {
        return Err(XaiError::shape(format!("({h}, {w}, 3) like the first image"), odd.shape()));
    }
    Ok((h, w))
}

/// RGB in `[0, 1]` passed through unchanged, batched in the model's layout.
#[derive(Debug, Clone, Copy)]
pub struct RgbPipeline {
    layout: TensorLayout,
}

impl RgbPipeline {
    pub const fn new(layout: TensorLayout) -> Self {
        Self { layout }
    }
}

impl InputPipeline for RgbPipeline {
    fn layout(&self) -> TensorLayout {
        self.layout
    }

    fn rgb01_to_input(&self, images: &[Array3<f32>]) -> Result<Array4<f32>> {
        let (h, w) = check_batch(images)?;
        let mut batch = match self.layout {
            TensorLayout::Nchw => Array4::<f32>::zeros((images.len(), 3, h, w)),
            TensorLayout::Nhwc => Array4::<f32>::zeros((images.len(), h, w, 3)),
        };
        for (mut slot, image) in batch.outer_iter_mut().zip(images) {
            match self.layout {
                TensorLayout::Nchw => slot.assign(&image.view().permuted_axes([2, 0, 1])),
                TensorLayout::Nhwc => slot.assign(image),
            }
        }
        Ok(batch)
    }
}

/// Chest X-ray normalisation: channel-mean grayscale mapped to `[-1024, 1024]`, one
/// channel, NCHW, resized to the model's square input.
#[derive(Debug, Clone, Copy)]
pub struct XrayPipeline {
    size: usize,
}

pub const XRAY_MAX: f32 = 1024.0;

impl XrayPipeline {
    pub const fn new(size: usize) -> Self {
        Self { size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// `[0, 1]` intensities to the `[-1024, 1024]` range the model was trained on.
    pub fn normalize(gray01: ArrayView2<'_, f32>) -> Array2<f32> {
        gray01.mapv(|v| (2.0 * v - 1.0) * XRAY_MAX)
    }
}

impl InputPipeline for XrayPipeline {
    fn layout(&self) -> TensorLayout {
        TensorLayout::Nchw
    }

    fn rgb01_to_input(&self, images: &[Array3<f32>]) -> Result<Array4<f32>> {
        check_batch(images)?;
        let mut batch = Array4::<f32>::zeros((images.len(), 1, self.size, self.size));
        for (mut slot, image) in batch.outer_iter_mut().zip(images) {
            let gray = image
                .mean_axis(Axis(2))
                .ok_or_else(|| XaiError::shape("(H, W, 3) image", image.shape()))?;
            let gray = resize_2d(gray.view().into_dyn(), self.size, self.size)?;
            slot.index_axis_mut(Axis(0), 0)
                .assign(&Self::normalize(gray.view()));
        }
        Ok(batch)
    }
}
