use ndarray::{concatenate, prelude::*, stack};
use num_traits::AsPrimitive;

use crate::errors::{Result, XaiError};
use crate::xai::helpers::{is_u8, min_max};

/// Coerce a grayscale, single-channel, RGB or RGBA array into `(H, W, 3)`.
///
/// Alpha is dropped; any other layout is a shape error.
pub fn ensure_rgb<S: Clone>(image: ArrayViewD<'_, S>) -> Result<Array3<S>> {
    let shape = image.shape().to_vec();
    match shape.as_slice() {
        [_, _] => {
            let gray = image.into_dimensionality::<Ix2>()?;
            Ok(stack(Axis(2), &[gray, gray, gray])?)
        }
        [_, _, 1] => {
            let single = image.into_dimensionality::<Ix3>()?;
            Ok(concatenate(Axis(2), &[single, single, single])?)
        }
        [_, _, 3] => Ok(image.into_dimensionality::<Ix3>()?.to_owned()),
        [_, _, 4] => Ok(image
            .into_dimensionality::<Ix3>()?
            .slice(s![.., .., 0..3])
            .to_owned()),
        _ => Err(XaiError::shape("image with shape (H,W,3)", &shape)),
    }
}

/// Map to `f32` in `[0, 1]`, treating anything with a maximum above 1 as 0..255 data.
pub fn as_float01<S, D>(image: ArrayView<'_, S, D>) -> Array<f32, D>
where
    S: AsPrimitive<f32>,
    D: Dimension,
{
    let values = image.mapv(|v| v.as_());
    let scale = match min_max(values.iter()) {
        Some((_, max)) if max > 1.0 => 1.0 / 255.0,
        _ => 1.0,
    };
    values.mapv(|v| (v * scale).clamp(0.0, 1.0))
}

/// Map to 8-bit. `u8` data passes through, `[0, 1]` data is scaled by 255, anything
/// else is clipped and rounded.
pub fn to_uint8<S, D>(image: ArrayView<'_, S, D>) -> Array<u8, D>
where
    S: AsPrimitive<f32>,
    D: Dimension,
{
    if is_u8::<S>() {
        return image.mapv(|v| v.as_() as u8);
    }
    let values = image.mapv(|v| v.as_());
    let scale = match min_max(values.iter()) {
        Some((_, max)) if max <= 1.0 => 255.0,
        _ => 1.0,
    };
    values.mapv(|v| (v * scale).round().clamp(0.0, 255.0) as u8)
}

pub fn ensure_rgb_uint8<S>(image: ArrayViewD<'_, S>) -> Result<Array3<u8>>
where
    S: AsPrimitive<f32>,
{
    Ok(to_uint8(ensure_rgb(image)?.view()))
}
