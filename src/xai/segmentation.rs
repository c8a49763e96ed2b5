//! SLIC superpixels over CIE-Lab colour.

use std::collections::VecDeque;

use image::{ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use ndarray::{prelude::*, Zip};
use palette::{FromColor, Lab, LinSrgb, Srgb};

use crate::errors::{Result, XaiError};

#[derive(Debug, Clone, PartialEq)]
pub struct SlicConfig {
    /// Approximate number of superpixels.
    pub n_segments: usize,
    /// Balance between colour and spatial proximity. Higher means squarer segments.
    pub compactness: f32,
    /// Gaussian pre-smoothing, in pixels. `0` disables it.
    pub sigma: f32,
    pub max_iter: usize,
}

impl Default for SlicConfig {
    fn default() -> Self {
        Self {
            n_segments: 100,
            compactness: 10.0,
            sigma: 1.0,
            max_iter: 10,
        }
    }
}

/// Label map with consecutive labels `0..num_segments`.
#[derive(Debug, Clone, PartialEq)]
pub struct Segmentation {
    labels: Array2<usize>,
    num_segments: usize,
}

impl Segmentation {
    pub fn from_labels(labels: Array2<usize>) -> Result<Self> {
        let num_segments = labels.iter().max().map_or(0, |&m| m + 1);
        let mut seen = vec![false; num_segments];
        labels.iter().for_each(|&l| seen[l] = true);
        if seen.iter().any(|&s| !s) {
            return Err(XaiError::invalid_input(
                "labels",
                "must be consecutive starting at 0",
            ));
        }
        Ok(Self {
            labels,
            num_segments,
        })
    }

    pub fn labels(&self) -> ArrayView2<'_, usize> {
        self.labels.view()
    }

    pub fn num_segments(&self) -> usize {
        self.num_segments
    }

    /// Per-pixel value of each pixel's segment.
    pub fn broadcast(&self, values: &[f32]) -> Array2<f32> {
        self.labels.mapv(|l| values.get(l).copied().unwrap_or(0.0))
    }

    /// Pixels with a 4-neighbour in another segment.
    pub fn boundaries(&self) -> Array2<bool> {
        let (h, w) = self.labels.dim();
        Array2::from_shape_fn((h, w), |(y, x)| {
            let label = self.labels[[y, x]];
            (y > 0 && self.labels[[y - 1, x]] != label)
                || (y + 1 < h && self.labels[[y + 1, x]] != label)
                || (x > 0 && self.labels[[y, x - 1]] != label)
                || (x + 1 < w && self.labels[[y, x + 1]] != label)
        })
    }
}

fn smooth_channels(image: ArrayView3<'_, f32>, sigma: f32) -> Result<Array3<f32>> {
    let (h, w, c) = image.dim();
    if sigma <= 0.0 {
        return Ok(image.to_owned());
    }
    let mut out = Array3::<f32>::zeros((h, w, c));
    for ch in 0..c {
        let plane: Vec<f32> = image.index_axis(Axis(2), ch).iter().copied().collect();
        let buffer = ImageBuffer::<Luma<f32>, Vec<f32>>::from_raw(w as u32, h as u32, plane)
            .ok_or_else(|| XaiError::shape("(H,W,C) image", image.shape()))?;
        let blurred = gaussian_blur_f32(&buffer, sigma);
        out.index_axis_mut(Axis(2), ch)
            .assign(&Array2::from_shape_vec((h, w), blurred.into_raw())?);
    }
    Ok(out)
}

fn to_lab(rgb: ArrayView3<'_, f32>) -> Array3<f32> {
    let (h, w, _) = rgb.dim();
    let mut lab = Array3::<f32>::zeros((h, w, 3));
    Zip::from(lab.lanes_mut(Axis(2)))
        .and(rgb.lanes(Axis(2)))
        .for_each(|mut out, px| {
            let srgb: Srgb<f32> = Srgb::new(px[0], px[1], px[2]);
            let lin: LinSrgb<f32> = srgb.into_linear();
            let color: Lab = Lab::from_color(lin);
            out[0] = color.l;
            out[1] = color.a;
            out[2] = color.b;
        });
    lab
}

/// Segment an RGB image in `[0, 1]` into roughly `n_segments` compact superpixels.
pub fn slic(rgb: ArrayView3<'_, f32>, config: &SlicConfig) -> Result<Segmentation> {
    let (h, w, c) = rgb.dim();
    if c != 3 || h == 0 || w == 0 {
        return Err(XaiError::shape("non-empty (H,W,3) image", rgb.shape()));
    }
    let lab = to_lab(smooth_channels(rgb, config.sigma)?.view());

    let n_segments = config.n_segments.max(1);
    let step = (((h * w) as f32 / n_segments as f32).sqrt()).max(1.0);
    let spatial_weight = (config.compactness / step).powi(2);

    // [l, a, b, y, x]
    let mut centers: Vec<[f32; 5]> = Vec::new();
    let mut cy = step / 2.0;
    while cy < h as f32 {
        let mut cx = step / 2.0;
        while cx < w as f32 {
            let (y, x) = (cy as usize, cx as usize);
            centers.push([lab[[y, x, 0]], lab[[y, x, 1]], lab[[y, x, 2]], cy, cx]);
            cx += step;
        }
        cy += step;
    }

    let mut labels = Array2::<usize>::zeros((h, w));
    let mut distances = Array2::<f32>::from_elem((h, w), f32::INFINITY);
    let window = step.ceil() as isize;

    for _ in 0..config.max_iter.max(1) {
        distances.fill(f32::INFINITY);
        for (k, center) in centers.iter().enumerate() {
            let (ccy, ccx) = (center[3] as isize, center[4] as isize);
            let y0 = (ccy - window).max(0) as usize;
            let y1 = ((ccy + window) as usize).min(h - 1);
            let x0 = (ccx - window).max(0) as usize;
            let x1 = ((ccx + window) as usize).min(w - 1);
            for y in y0..=y1 {
                for x in x0..=x1 {
                    let dl = lab[[y, x, 0]] - center[0];
                    let da = lab[[y, x, 1]] - center[1];
                    let db = lab[[y, x, 2]] - center[2];
                    let dy = y as f32 - center[3];
                    let dx = x as f32 - center[4];
                    let d = dl * dl + da * da + db * db + (dy * dy + dx * dx) * spatial_weight;
                    if d < distances[[y, x]] {
                        distances[[y, x]] = d;
                        labels[[y, x]] = k;
                    }
                }
            }
        }

        let mut sums = vec![[0.0f32; 6]; centers.len()];
        for ((y, x), &k) in labels.indexed_iter() {
            let acc = &mut sums[k];
            acc[0] += lab[[y, x, 0]];
            acc[1] += lab[[y, x, 1]];
            acc[2] += lab[[y, x, 2]];
            acc[3] += y as f32;
            acc[4] += x as f32;
            acc[5] += 1.0;
        }
        for (center, acc) in centers.iter_mut().zip(&sums) {
            if acc[5] > 0.0 {
                for i in 0..5 {
                    center[i] = acc[i] / acc[5];
                }
            }
        }
    }

    let min_size = ((h * w) as f32 / centers.len() as f32 * 0.5) as usize;
    Segmentation::from_labels(enforce_connectivity(&labels, min_size))
}

/// Relabel 4-connected components consecutively, folding components smaller than
/// `min_size` into the neighbouring segment that was labelled before them.
fn enforce_connectivity(labels: &Array2<usize>, min_size: usize) -> Array2<usize> {
    let (h, w) = labels.dim();
    let unset = usize::MAX;
    let mut out = Array2::from_elem((h, w), unset);
    let mut next = 0;
    let mut queue = VecDeque::new();
    let mut component = Vec::new();

    for y in 0..h {
        for x in 0..w {
            if out[[y, x]] != unset {
                continue;
            }
            let original = labels[[y, x]];
            let adjacent = if x > 0 {
                Some(out[[y, x - 1]])
            } else if y > 0 {
                Some(out[[y - 1, x]])
            } else {
                None
            };

            component.clear();
            out[[y, x]] = next;
            queue.push_back((y, x));
            while let Some((cy, cx)) = queue.pop_front() {
                component.push((cy, cx));
                let neighbours = [
                    (cy.wrapping_sub(1), cx),
                    (cy + 1, cx),
                    (cy, cx.wrapping_sub(1)),
                    (cy, cx + 1),
                ];
                for (ny, nx) in neighbours {
                    if ny < h && nx < w && out[[ny, nx]] == unset && labels[[ny, nx]] == original {
                        out[[ny, nx]] = next;
                        queue.push_back((ny, nx));
                    }
                }
            }

            match adjacent {
                Some(label) if component.len() < min_size => {
                    for &(cy, cx) in &component {
                        out[[cy, cx]] = label;
                    }
                }
                _ => next += 1,
            }
        }
    }
    out
}
