use image::RgbImage;
use ndarray::{prelude::*, Zip};

use crate::errors::{Result, XaiError};
use crate::xai::helpers::{clip_and_normalize_signed, normalize_01, resize_2d};
use crate::xai::{BaseImage, OverlayConfig};

/// Colours for the two signs of a signed heatmap, RGB in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeatPalette {
    pub positive: [f32; 3],
    pub negative: [f32; 3],
}

impl HeatPalette {
    /// Slightly desaturated red/blue used on spectrograms.
    pub const AUDIO: Self = Self {
        positive: [1.0, 0.12, 0.12],
        negative: [0.12, 0.12, 1.0],
    };

    pub const XRAY: Self = Self {
        positive: [1.0, 0.1, 0.1],
        negative: [0.1, 0.1, 1.0],
    };
}

impl Default for HeatPalette {
    fn default() -> Self {
        Self::AUDIO
    }
}

/// How an unsigned importance map is coloured before blending.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UnsignedColoring {
    /// Blue to red ramp, an approximation of the classic jet colormap.
    Jet,
    Solid([f32; 3]),
}

impl UnsignedColoring {
    pub const SALIENCY: Self = Self::Solid([1.0, 0.55, 0.0]);

    fn color(&self, value: f32) -> [f32; 3] {
        match self {
            Self::Jet => jet(value),
            Self::Solid(color) => *color,
        }
    }
}

pub fn jet(value: f32) -> [f32; 3] {
    let v = value.clamp(0.0, 1.0);
    let channel = |center: f32| (1.5 - (4.0 * v - center).abs()).clamp(0.0, 1.0);
    [channel(3.0), channel(2.0), channel(1.0)]
}

fn alpha_for(magnitude: f32, config: &OverlayConfig) -> f32 {
    (config.alpha_min() + (config.alpha_max() - config.alpha_min()) * magnitude).clamp(0.0, 1.0)
}

/// Turn a signed map in `[-1, 1]` into an RGBA layer `(H, W, 4)`.
///
/// Non-negative values take the positive colour. Opacity grows linearly with `|h|`.
pub fn signed_heat_to_rgba(
    heat: ArrayView2<'_, f32>,
    config: &OverlayConfig,
    palette: &HeatPalette,
) -> Array3<f32> {
    let (h, w) = heat.dim();
    let mut rgba = Array3::<f32>::zeros((h, w, 4));
    Zip::from(rgba.lanes_mut(Axis(2)))
        .and(&heat)
        .for_each(|mut px, &value| {
            let color = if value >= 0.0 {
                palette.positive
            } else {
                palette.negative
            };
            px[0] = color[0];
            px[1] = color[1];
            px[2] = color[2];
            px[3] = alpha_for(value.abs().min(1.0), config);
        });
    rgba
}

/// `base * (1 - a) + overlay * a`, returned as 8-bit RGB.
pub fn alpha_blend(base: ArrayView3<'_, f32>, overlay: ArrayView3<'_, f32>) -> Result<Array3<u8>> {
    let (h, w, c) = base.dim();
    if c != 3 {
        return Err(XaiError::shape("base image (H,W,3)", base.shape()));
    }
    if overlay.dim() != (h, w, 4) {
        return Err(XaiError::shape(
            format!("overlay ({h},{w},4)"),
            overlay.shape(),
        ));
    }

    let mut out = Array3::<u8>::zeros((h, w, 3));
    Zip::from(out.lanes_mut(Axis(2)))
        .and(base.lanes(Axis(2)))
        .and(overlay.lanes(Axis(2)))
        .for_each(|mut px, rgb, rgba| {
            let a = rgba[3].clamp(0.0, 1.0);
            for ch in 0..3 {
                let blended = rgb[ch] * (1.0 - a) + rgba[ch] * a;
                px[ch] = (blended.clamp(0.0, 1.0) * 255.0).round() as u8;
            }
        });
    Ok(out)
}

/// Resize, robustly normalise and blend a signed attribution map onto the base image.
pub fn render_signed_overlay(
    base_image: &BaseImage,
    heat: ArrayViewD<'_, f32>,
    config: &OverlayConfig,
    palette: &HeatPalette,
) -> Result<Array3<u8>> {
    let base = base_image.rgb01()?;
    let (h, w, _) = base.dim();
    let heat = resize_2d(heat, h, w)?;
    let heat = clip_and_normalize_signed(heat.view(), config.clip_percentile());
    let overlay = signed_heat_to_rgba(heat.view(), config, palette);
    alpha_blend(base.view(), overlay.view())
}

/// Resize, min-max normalise and blend a non-negative importance map onto the base image.
pub fn render_unsigned_overlay(
    base_image: &BaseImage,
    importance: ArrayViewD<'_, f32>,
    config: &OverlayConfig,
    coloring: UnsignedColoring,
) -> Result<Array3<u8>> {
    let base = base_image.rgb01()?;
    let (h, w, _) = base.dim();
    let importance = resize_2d(importance, h, w)?;
    let importance = normalize_01(importance.view()).mapv(|v| v.clamp(0.0, 1.0));

    let mut overlay = Array3::<f32>::zeros((h, w, 4));
    Zip::from(overlay.lanes_mut(Axis(2)))
        .and(&importance)
        .for_each(|mut px, &value| {
            let color = coloring.color(value);
            px[0] = color[0];
            px[1] = color[1];
            px[2] = color[2];
            px[3] = alpha_for(value, config);
        });
    alpha_blend(base.view(), overlay.view())
}

pub fn array_to_rgb_image(pixels: ArrayView3<'_, u8>) -> Result<RgbImage> {
    let (h, w, c) = pixels.dim();
    if c != 3 {
        return Err(XaiError::shape("RGB pixels (H,W,3)", pixels.shape()));
    }
    RgbImage::from_raw(w as u32, h as u32, pixels.iter().copied().collect())
        .ok_or_else(|| XaiError::shape("RGB pixels (H,W,3)", pixels.shape()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jet_endpoints() {
        assert_eq!(jet(0.0), [0.0, 0.0, 0.5]);
        assert_eq!(jet(1.0), [0.5, 0.0, 0.0]);
        assert_eq!(jet(0.5), [0.5, 1.0, 0.5]);
    }

    #[test]
    fn test_signed_heat_colours_and_alpha() {
        let config = OverlayConfig::default();
        let heat = array![[1.0f32, -1.0], [0.0, -0.5]];
        let rgba = signed_heat_to_rgba(heat.view(), &config, &HeatPalette::AUDIO);

        assert_eq!(rgba.shape(), &[2, 2, 4]);
        assert_eq!(rgba[[0, 0, 0]], 1.0);
        assert_eq!(rgba[[0, 1, 2]], 1.0);
        assert!((rgba[[0, 0, 3]] - config.alpha_max()).abs() < 1e-6);
        assert!((rgba[[1, 0, 3]] - config.alpha_min()).abs() < 1e-6);
        // zero counts as positive
        assert_eq!(rgba[[1, 0, 0]], 1.0);
    }

    #[test]
    fn test_alpha_blend_shapes() {
        let base = Array3::<f32>::zeros((4, 4, 3));
        let overlay = Array3::<f32>::zeros((4, 4, 4));
        assert!(alpha_blend(base.view(), overlay.view()).is_ok());

        let wrong_base = Array3::<f32>::zeros((4, 4, 4));
        assert!(alpha_blend(wrong_base.view(), overlay.view()).is_err());
        let wrong_overlay = Array3::<f32>::zeros((4, 4, 3));
        assert!(alpha_blend(base.view(), wrong_overlay.view()).is_err());
    }

    #[test]
    fn test_alpha_blend_mixes_colours() -> Result<()> {
        let base = Array3::<f32>::from_elem((1, 1, 3), 1.0);
        let overlay = array![[[0.0f32, 0.0, 0.0, 0.5]]];
        let out = alpha_blend(base.view(), overlay.view())?;
        assert_eq!(out, array![[[128u8, 128, 128]]]);
        Ok(())
    }

    #[test]
    fn test_zero_heat_keeps_base_mostly_visible() -> Result<()> {
        let base = BaseImage::from(Array2::<f32>::from_elem((8, 8), 0.5));
        let heat = Array2::<f32>::zeros((2, 2));
        let out = render_signed_overlay(
            &base,
            heat.view().into_dyn(),
            &OverlayConfig::default(),
            &HeatPalette::AUDIO,
        )?;
        assert_eq!(out.shape(), &[8, 8, 3]);
        // a minimal tint of the positive colour at alpha_min
        let expected_red = ((0.5 * 0.95 + 1.0 * 0.05) * 255.0f32).round() as u8;
        assert!(out.iter().step_by(3).all(|&r| r == expected_red));
        Ok(())
    }

    #[test]
    fn test_zero_heat_with_transparent_floor_leaves_base_untouched() -> Result<()> {
        let pixels = Array3::from_shape_fn((6, 5, 3), |(y, x, c)| (y * 40 + x * 9 + c * 3) as u8);
        let base = BaseImage::from(pixels.clone());
        let config = OverlayConfig::new(0.0, 0.7, 99.0)?;

        let heat = Array2::<f32>::zeros((6, 5));
        let out = render_signed_overlay(&base, heat.view().into_dyn(), &config, &HeatPalette::XRAY)?;
        assert_eq!(out, pixels);

        let mut sparse = Array2::<f32>::zeros((6, 5));
        sparse[[0, 0]] = 1.0;
        let rgba = signed_heat_to_rgba(sparse.view(), &config, &HeatPalette::XRAY);
        let out = alpha_blend(base.rgb01()?.view(), rgba.view())?;
        assert_ne!(out.slice(s![0, 0, ..]), pixels.slice(s![0, 0, ..]));
        assert_eq!(out.slice(s![1.., .., ..]), pixels.slice(s![1.., .., ..]));
        Ok(())
    }

    #[test]
    fn test_unsigned_overlay_preserves_base_shape() -> Result<()> {
        let base = BaseImage::from(Array3::<u8>::from_elem((10, 6, 3), 40));
        let importance = Array2::from_shape_fn((3, 3), |(y, x)| (y * 3 + x) as f32);
        let out = render_unsigned_overlay(
            &base,
            importance.view().into_dyn(),
            &OverlayConfig::default(),
            UnsignedColoring::Jet,
        )?;
        assert_eq!(out.shape(), &[10, 6, 3]);
        Ok(())
    }

    #[test]
    fn test_array_to_rgb_image_layout() -> Result<()> {
        let mut pixels = Array3::<u8>::zeros((2, 3, 3));
        pixels[[1, 2, 0]] = 200;
        let image = array_to_rgb_image(pixels.view())?;
        assert_eq!(image.dimensions(), (3, 2));
        assert_eq!(image.get_pixel(2, 1).0, [200, 0, 0]);
        Ok(())
    }
}
