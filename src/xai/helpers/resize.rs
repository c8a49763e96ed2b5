use ndarray::prelude::*;

use crate::errors::{Result, XaiError};

/// Bilinear resize of a 2-D map to `(height, width)` using pixel-centre alignment.
///
/// Values are not clamped, so signed maps survive the resize. When the shape already
/// matches the map is returned as is.
pub fn resize_2d(heat: ArrayViewD<'_, f32>, height: usize, width: usize) -> Result<Array2<f32>> {
    if heat.ndim() != 2 {
        return Err(XaiError::shape("2-D heatmap", heat.shape()));
    }
    let heat = heat.into_dimensionality::<Ix2>()?;
    let (src_h, src_w) = heat.dim();
    if (src_h, src_w) == (height, width) {
        return Ok(heat.to_owned());
    }
    if src_h == 0 || src_w == 0 || height == 0 || width == 0 {
        return Err(XaiError::shape(
            format!("non-empty heatmap resizable to ({height},{width})"),
            &[src_h, src_w],
        ));
    }

    let scale_y = src_h as f32 / height as f32;
    let scale_x = src_w as f32 / width as f32;
    let sample = |src: f32, len: usize| -> (usize, usize, f32) {
        let pos = src.clamp(0.0, (len - 1) as f32);
        let i0 = pos.floor() as usize;
        let i1 = (i0 + 1).min(len - 1);
        (i0, i1, pos - i0 as f32)
    };

    Ok(Array2::from_shape_fn((height, width), |(y, x)| {
        let (y0, y1, dy) = sample((y as f32 + 0.5) * scale_y - 0.5, src_h);
        let (x0, x1, dx) = sample((x as f32 + 0.5) * scale_x - 0.5, src_w);
        let top = heat[[y0, x0]] * (1.0 - dx) + heat[[y0, x1]] * dx;
        let bottom = heat[[y1, x0]] * (1.0 - dx) + heat[[y1, x1]] * dx;
        top * (1.0 - dy) + bottom * dy
    }))
}
