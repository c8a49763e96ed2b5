//! Numeric and image helpers shared by every explainer.
//!
//! All helpers are pure: they never mutate their inputs and fail only on shape
//! mismatches.

mod convert;
mod normalize;
mod render;
mod resize;

pub use convert::{as_float01, ensure_rgb, ensure_rgb_uint8, to_uint8};
pub use normalize::{clip_and_normalize_signed, normalize_01, normalize_01_eps, percentile};
pub use render::{
    alpha_blend, array_to_rgb_image, jet, render_signed_overlay, render_unsigned_overlay,
    signed_heat_to_rgba, HeatPalette, UnsignedColoring,
};
pub use resize::resize_2d;

use std::any::TypeId;

pub fn is_u8<T: 'static>() -> bool {
    TypeId::of::<T>() == TypeId::of::<u8>()
}

pub(crate) fn min_max<'a>(values: impl IntoIterator<Item = &'a f32>) -> Option<(f32, f32)> {
    values.into_iter().fold(None, |acc, &v| match acc {
        None => Some((v, v)),
        Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
    })
}
