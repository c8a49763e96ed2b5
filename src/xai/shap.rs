//! Partition SHAP with a blur masker, degrading to gradient saliency and finally to the
//! plain base image.

use std::collections::HashMap;
use std::sync::Arc;

use ndarray::prelude::*;
use parking_lot::Mutex;

use crate::errors::{Result, XaiError};
use crate::traits::{GradientClassifier, InputPipeline};
use crate::xai::gradcam::select_class;
use crate::xai::helpers::{
    render_signed_overlay, render_unsigned_overlay, HeatPalette, UnsignedColoring,
};
use crate::xai::masker::{ImageMasker, MaskerSpec, PartitionTree};
use crate::xai::{new_run_id, BaseImage, Explainer, OverlayConfig, XaiMethod};

const MIN_MAX_EVALS: usize = 64;
const SALIENCY_EPS: f32 = 1e-8;

#[derive(Debug, Clone, PartialEq)]
pub struct ShapConfig {
    /// Model evaluation budget, raised to at least 64.
    pub max_evals: usize,
    /// Masked images per model call, at least 1.
    pub batch_size: usize,
    /// Masker description, `blur(kx,ky)`.
    pub masker: String,
    /// Smallest partition cell side.
    pub min_cell: usize,
    pub palette: HeatPalette,
}

impl Default for ShapConfig {
    fn default() -> Self {
        Self {
            max_evals: 256,
            batch_size: 16,
            masker: "blur(32,32)".to_string(),
            min_cell: 4,
            palette: HeatPalette::default(),
        }
    }
}

/// Which layer of the fallback chain produced the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapOutcome {
    Shap,
    GradientSaliency,
    BaseImage,
}

pub struct ShapExplainer {
    classifier: Arc<dyn GradientClassifier>,
    pipeline: Arc<dyn InputPipeline>,
    config: ShapConfig,
    masker_spec: MaskerSpec,
    cache: Mutex<Option<Arc<ImageMasker>>>,
}

/// Cache key of a masked evaluation: the starting context plus flipped partition nodes.
type MaskKey = (bool, Vec<usize>);

impl ShapExplainer {
    pub fn new(
        classifier: Arc<dyn GradientClassifier>,
        pipeline: Arc<dyn InputPipeline>,
        config: ShapConfig,
    ) -> Result<Self> {
        let masker_spec = config.masker.parse()?;
        Ok(Self {
            classifier,
            pipeline,
            config,
            masker_spec,
            cache: Mutex::new(None),
        })
    }

    fn max_evals(&self) -> usize {
        self.config.max_evals.max(MIN_MAX_EVALS)
    }

    fn batch_size(&self) -> usize {
        self.config.batch_size.max(1)
    }

    /// Shape of the masker currently cached, if any.
    pub fn cached_shape(&self) -> Option<(usize, usize)> {
        self.cache.lock().as_ref().map(|masker| masker.shape())
    }

    /// One cached masker per input shape; a new shape replaces it.
    fn masker_for(&self, shape: (usize, usize)) -> Arc<ImageMasker> {
        let mut cache = self.cache.lock();
        match cache.as_ref() {
            Some(masker) if masker.shape() == shape => masker.clone(),
            _ => {
                tracing::debug!(?shape, "building SHAP masker");
                let masker = Arc::new(ImageMasker::new(
                    self.masker_spec,
                    shape,
                    self.config.min_cell,
                ));
                *cache = Some(masker.clone());
                masker
            }
        }
    }

    /// Signed per-pixel attribution `(H, W)` for the selected class.
    pub fn shap_values(
        &self,
        model_input: ArrayView4<'_, f32>,
        class_index: isize,
        base_image: &BaseImage,
    ) -> Result<Array2<f32>> {
        let image = base_image.rgb01()?;
        let (h, w, _) = image.dim();
        let class = select_class(self.classifier.as_ref(), model_input, class_index)?;
        let masker = self.masker_for((h, w));
        let background = masker.background(image.view())?;
        let tree = masker.tree();

        let mut evaluator = MaskedEvaluator {
            explainer: self,
            masker: &masker,
            image: image.view(),
            background: background.view(),
            class,
            cache: HashMap::new(),
        };

        let root = PartitionTree::ROOT;
        let full = (false, vec![root]);
        let empty = (true, vec![root]);
        evaluator.evaluate(&[full.clone(), empty.clone()])?;
        let mut phi: HashMap<usize, f32> = HashMap::new();
        phi.insert(root, evaluator.value(&full)? - evaluator.value(&empty)?);

        let per_expansion = 4;
        let nodes_per_round = (self.batch_size() / per_expansion).max(1);
        while evaluator.cache.len() + per_expansion <= self.max_evals() {
            let mut candidates: Vec<usize> = phi
                .keys()
                .copied()
                .filter(|&n| tree.node(n).children.is_some())
                .collect();
            if candidates.is_empty() {
                break;
            }
            candidates.sort_by(|a, b| phi[b].abs().total_cmp(&phi[a].abs()).then(a.cmp(b)));
            let remaining = (self.max_evals() - evaluator.cache.len()) / per_expansion;
            candidates.truncate(nodes_per_round.min(remaining).max(1));

            let keys: Vec<MaskKey> = candidates
                .iter()
                .filter_map(|&n| tree.node(n).children)
                .flat_map(|(l, r)| {
                    [
                        (false, vec![l]),
                        (false, vec![r]),
                        (true, vec![l]),
                        (true, vec![r]),
                    ]
                })
                .collect();
            evaluator.evaluate(&keys)?;

            for node in candidates {
                let Some((l, r)) = tree.node(node).children else {
                    continue;
                };
                let (phi_l, phi_r) = evaluator.split(node, l, r)?;
                let parent = phi.remove(&node).unwrap_or(0.0);
                // efficiency: children sum to the parent
                let residual = (parent - phi_l - phi_r) / 2.0;
                phi.insert(l, phi_l + residual);
                phi.insert(r, phi_r + residual);
            }
        }
        tracing::debug!(
            evaluations = evaluator.cache.len(),
            regions = phi.len(),
            "PROGRESS"
        );

        let mut values = Array2::<f32>::zeros((h, w));
        for (&node, &value) in &phi {
            let region = tree.node(node).region;
            let per_pixel = value / region.area().max(1) as f32;
            values
                .slice_mut(s![region.y0..region.y1, region.x0..region.x1])
                .fill(per_pixel);
        }
        Ok(values)
    }

    /// Mean absolute input gradient over channels, scaled to `[0, 1]`.
    pub fn gradient_saliency(
        &self,
        model_input: ArrayView4<'_, f32>,
        class_index: isize,
    ) -> Result<Array2<f32>> {
        let class = select_class(self.classifier.as_ref(), model_input, class_index)?;
        let gradient = self.classifier.input_gradient(model_input, class)?;
        if gradient.shape() != model_input.shape() {
            return Err(XaiError::shape(
                format!("gradient shaped like input {:?}", model_input.shape()),
                gradient.shape(),
            ));
        }
        let saliency = gradient
            .mapv(f32::abs)
            .mean_axis(self.pipeline.layout().channel_axis())
            .ok_or_else(|| XaiError::shape("non-empty gradient", gradient.shape()))?
            .index_axis_move(Axis(0), 0);
        let max = saliency.fold(0.0f32, |m, &v| m.max(v));
        Ok(saliency.mapv(|v| v / (max + SALIENCY_EPS)))
    }

    /// Run the fallback chain and report which layer succeeded.
    pub fn explain_with_outcome(
        &self,
        model_input: ArrayView4<'_, f32>,
        class_index: isize,
        base_image: &BaseImage,
        overlay: &OverlayConfig,
    ) -> Result<(Array3<u8>, ShapOutcome)> {
        let shap = self
            .shap_values(model_input, class_index, base_image)
            .and_then(|values| {
                render_signed_overlay(
                    base_image,
                    values.view().into_dyn(),
                    overlay,
                    &self.config.palette,
                )
            });
        match shap {
            Ok(pixels) => return Ok((pixels, ShapOutcome::Shap)),
            Err(e) => tracing::warn!(error = %e, "SHAP failed, falling back to gradient saliency"),
        }

        let saliency = self
            .gradient_saliency(model_input, class_index)
            .and_then(|saliency| {
                render_unsigned_overlay(
                    base_image,
                    saliency.view().into_dyn(),
                    overlay,
                    UnsignedColoring::SALIENCY,
                )
            });
        match saliency {
            Ok(pixels) => return Ok((pixels, ShapOutcome::GradientSaliency)),
            Err(e) => tracing::warn!(error = %e, "gradient saliency failed, returning base image"),
        }

        Ok((base_image.rgb_u8()?, ShapOutcome::BaseImage))
    }
}

impl Explainer for ShapExplainer {
    fn method(&self) -> XaiMethod {
        XaiMethod::Shap
    }

    fn explain(
        &self,
        model_input: ArrayView4<'_, f32>,
        class_index: isize,
        base_image: &BaseImage,
        overlay: &OverlayConfig,
    ) -> Result<Array3<u8>> {
        let run_id = new_run_id();
        let span = tracing::info_span!("shap", run_id = %run_id);
        let _enter = span.enter();
        tracing::info!(
            class_index,
            max_evals = self.max_evals(),
            batch_size = self.batch_size(),
            masker = %self.config.masker,
            "START"
        );
        let (pixels, outcome) =
            self.explain_with_outcome(model_input, class_index, base_image, overlay)?;
        tracing::info!(?outcome, "END");
        Ok(pixels)
    }
}

struct MaskedEvaluator<'a> {
    explainer: &'a ShapExplainer,
    masker: &'a ImageMasker,
    image: ArrayView3<'a, f32>,
    background: ArrayView3<'a, f32>,
    class: usize,
    cache: HashMap<MaskKey, f32>,
}

impl MaskedEvaluator<'_> {
    fn evaluate(&mut self, keys: &[MaskKey]) -> Result<()> {
        let pending: Vec<&MaskKey> = keys.iter().filter(|k| !self.cache.contains_key(*k)).collect();
        for chunk in pending.chunks(self.explainer.batch_size()) {
            let images: Vec<Array3<f32>> = chunk
                .iter()
                .map(|(context_on, flipped)| {
                    self.masker
                        .compose(self.image, self.background, *context_on, flipped)
                })
                .collect();
            let input = self.explainer.pipeline.rgb01_to_input(&images)?;
            let scores = self.explainer.classifier.predict(input.view())?;
            if scores.nrows() != chunk.len() || scores.ncols() <= self.class {
                return Err(XaiError::shape(
                    format!("({}, >{}) scores", chunk.len(), self.class),
                    scores.shape(),
                ));
            }
            for (key, &score) in chunk.iter().zip(scores.column(self.class).iter()) {
                self.cache.insert((*key).clone(), score);
            }
        }
        Ok(())
    }

    fn value(&self, key: &MaskKey) -> Result<f32> {
        self.cache.get(key).copied().ok_or_else(|| XaiError::Integrity {
            message: format!("masked evaluation {key:?} missing"),
        })
    }

    /// Two-player Shapley split of `parent` into `l` and `r`, averaged over the
    /// background-off and background-on contexts.
    fn split(&self, parent: usize, l: usize, r: usize) -> Result<(f32, f32)> {
        // context off: start from background, reveal
        let none = self.value(&(false, vec![]))
            .or_else(|_| self.value(&(true, vec![PartitionTree::ROOT])))?;
        let only_l = self.value(&(false, vec![l]))?;
        let only_r = self.value(&(false, vec![r]))?;
        let both = self.value(&(false, vec![parent]))?;
        let off_l = 0.5 * ((only_l - none) + (both - only_r));
        let off_r = 0.5 * ((only_r - none) + (both - only_l));

        // context on: start from the image, hide
        let all = self.value(&(true, vec![]))
            .or_else(|_| self.value(&(false, vec![PartitionTree::ROOT])))?;
        let hide_l = self.value(&(true, vec![l]))?;
        let hide_r = self.value(&(true, vec![r]))?;
        let hide_both = self.value(&(true, vec![parent]))?;
        let on_l = 0.5 * ((all - hide_l) + (hide_r - hide_both));
        let on_r = 0.5 * ((all - hide_r) + (hide_l - hide_both));

        Ok((0.5 * (off_l + on_l), 0.5 * (off_r + on_r)))
    }
}
