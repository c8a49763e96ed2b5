//! Image maskers for partition-based Shapley estimation.

use std::str::FromStr;

use image::{ImageBuffer, Luma};
use imageproc::filter::gaussian_blur_f32;
use ndarray::prelude::*;

use crate::errors::{Result, XaiError};

/// How hidden pixels are replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaskerSpec {
    /// Blurred copy of the image with a `kx` by `ky` kernel.
    Blur { kx: usize, ky: usize },
}

impl FromStr for MaskerSpec {
    type Err = XaiError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || XaiError::Configuration {
            message: format!("unsupported SHAP masker {s:?}, expected blur(kx,ky)"),
        };
        let args = s
            .trim()
            .strip_prefix("blur(")
            .and_then(|rest| rest.strip_suffix(')'))
            .ok_or_else(invalid)?;
        let (kx, ky) = args.split_once(',').ok_or_else(invalid)?;
        let kx: usize = kx.trim().parse().map_err(|_| invalid())?;
        let ky: usize = ky.trim().parse().map_err(|_| invalid())?;
        if kx == 0 || ky == 0 {
            return Err(invalid());
        }
        Ok(Self::Blur { kx, ky })
    }
}

/// Half-open pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub y0: usize,
    pub y1: usize,
    pub x0: usize,
    pub x1: usize,
}

impl Region {
    pub fn area(&self) -> usize {
        (self.y1 - self.y0) * (self.x1 - self.x0)
    }
}

#[derive(Debug, Clone)]
pub struct PartitionNode {
    pub region: Region,
    pub children: Option<(usize, usize)>,
}

/// Binary hierarchy of image rectangles, split along the longer side.
#[derive(Debug, Clone)]
pub struct PartitionTree {
    nodes: Vec<PartitionNode>,
}

impl PartitionTree {
    pub const ROOT: usize = 0;

    /// Split until no side exceeds `min_cell`.
    pub fn build(height: usize, width: usize, min_cell: usize) -> Self {
        let min_cell = min_cell.max(1);
        let mut nodes = vec![PartitionNode {
            region: Region {
                y0: 0,
                y1: height,
                x0: 0,
                x1: width,
            },
            children: None,
        }];
        let mut pending = vec![Self::ROOT];
        while let Some(index) = pending.pop() {
            let region = nodes[index].region;
            let (h, w) = (region.y1 - region.y0, region.x1 - region.x0);
            if h.max(w) <= min_cell {
                continue;
            }
            let (first, second) = if h >= w {
                let mid = region.y0 + h / 2;
                (Region { y1: mid, ..region }, Region { y0: mid, ..region })
            } else {
                let mid = region.x0 + w / 2;
                (Region { x1: mid, ..region }, Region { x0: mid, ..region })
            };
            let left = nodes.len();
            nodes.push(PartitionNode {
                region: first,
                children: None,
            });
            nodes.push(PartitionNode {
                region: second,
                children: None,
            });
            nodes[index].children = Some((left, left + 1));
            pending.extend([left, left + 1]);
        }
        Self { nodes }
    }

    pub fn node(&self, index: usize) -> &PartitionNode {
        &self.nodes[index]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

/// Masker bound to one image shape. Building the partition is the expensive part, so
/// instances are cached by shape.
#[derive(Debug)]
pub struct ImageMasker {
    spec: MaskerSpec,
    shape: (usize, usize),
    tree: PartitionTree,
}

impl ImageMasker {
    pub fn new(spec: MaskerSpec, shape: (usize, usize), min_cell: usize) -> Self {
        Self {
            spec,
            shape,
            tree: PartitionTree::build(shape.0, shape.1, min_cell),
        }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.shape
    }

    pub fn tree(&self) -> &PartitionTree {
        &self.tree
    }

    /// Replacement values for hidden pixels.
    pub fn background(&self, image: ArrayView3<'_, f32>) -> Result<Array3<f32>> {
        let (h, w, c) = image.dim();
        if (h, w) != self.shape {
            return Err(XaiError::shape(
                format!("image of {:?}", self.shape),
                image.shape(),
            ));
        }
        let MaskerSpec::Blur { kx, ky } = self.spec;
        // standard deviation of a box filter of the same width
        let sigma = (kx + ky) as f32 / 2.0 / 12f32.sqrt();
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

    /// Start from `image` (context on) or `background` (context off) and flip the given
    /// nodes to the other source.
    pub fn compose<'a>(
        &self,
        image: ArrayView3<'a, f32>,
        background: ArrayView3<'a, f32>,
        context_on: bool,
        flipped: &[usize],
    ) -> Array3<f32> {
        let (base, other) = if context_on {
            (image, background)
        } else {
            (background, image)
        };
        let mut out = base.to_owned();
        for &node in flipped {
            let r = self.tree.node(node).region;
            out.slice_mut(s![r.y0..r.y1, r.x0..r.x1, ..])
                .assign(&other.slice(s![r.y0..r.y1, r.x0..r.x1, ..]));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_masker_spec() -> Result<()> {
        assert_eq!(
            "blur(32,32)".parse::<MaskerSpec>()?,
            MaskerSpec::Blur { kx: 32, ky: 32 }
        );
        assert_eq!(
            " blur(8, 4) ".parse::<MaskerSpec>()?,
            MaskerSpec::Blur { kx: 8, ky: 4 }
        );
        for bad in ["inpaint_telea", "blur(0,3)", "blur(3)", "blur(a,b)"] {
            assert!(matches!(
                bad.parse::<MaskerSpec>(),
                Err(XaiError::Configuration { .. })
            ));
        }
        Ok(())
    }

    #[test]
    fn test_partition_tree_tiles_image() {
        let tree = PartitionTree::build(10, 7, 3);
        let root = tree.node(PartitionTree::ROOT).region;
        assert_eq!(root.area(), 70);

        let mut leaf_area = 0;
        let mut stack = vec![PartitionTree::ROOT];
        while let Some(index) = stack.pop() {
            let node = tree.node(index);
            match node.children {
                Some((a, b)) => {
                    assert_eq!(
                        tree.node(a).region.area() + tree.node(b).region.area(),
                        node.region.area()
                    );
                    stack.extend([a, b]);
                }
                None => {
                    let r = node.region;
                    assert!(r.y1 - r.y0 <= 3 && r.x1 - r.x0 <= 3);
                    leaf_area += r.area();
                }
            }
        }
        assert_eq!(leaf_area, 70);
    }

    #[test]
    fn test_compose_flips_regions() -> Result<()> {
        let masker = ImageMasker::new(MaskerSpec::Blur { kx: 4, ky: 4 }, (4, 4), 2);
        let image = Array3::<f32>::ones((4, 4, 3));
        let background = Array3::<f32>::zeros((4, 4, 3));
        let (first, _) = masker
            .tree()
            .node(PartitionTree::ROOT)
            .children
            .ok_or_else(|| XaiError::shape("split root", &[4, 4]))?;

        let composed = masker.compose(image.view(), background.view(), false, &[first]);
        assert_eq!(composed.sum(), 8.0 * 3.0);
        let composed = masker.compose(image.view(), background.view(), true, &[first]);
        assert_eq!(composed.sum(), 8.0 * 3.0);
        Ok(())
    }

    #[test]
    fn test_background_blurs_edges() -> Result<()> {
        let masker = ImageMasker::new(MaskerSpec::Blur { kx: 6, ky: 6 }, (12, 12), 4);
        let image = Array3::from_shape_fn((12, 12, 1), |(_, x, _)| if x < 6 { 1.0 } else { 0.0 });
        let background = masker.background(image.view())?;
        assert!(background[[6, 5, 0]] < 1.0 && background[[6, 6, 0]] > 0.0);
        assert!(masker.background(Array3::<f32>::zeros((5, 5, 1)).view()).is_err());
        Ok(())
    }
}
