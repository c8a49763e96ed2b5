use serde::Serialize;

use crate::errors::{Result, XaiError};

/// Visual parameters shared by every overlay renderer.
///
/// Only built through [`OverlayConfig::new`] or `Default`, so a value in hand is valid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OverlayConfig {
    alpha_max: f32,
    alpha_min: f32,
    clip_percentile: f32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            alpha_max: 0.70,
            alpha_min: 0.05,
            clip_percentile: 99.0,
        }
    }
}

impl OverlayConfig {
    pub fn new(alpha_min: f32, alpha_max: f32, clip_percentile: f32) -> Result<Self> {
        let config = Self {
            alpha_max,
            alpha_min,
            clip_percentile,
        };
        config.validate()?;
        Ok(config)
    }

    /// Opacity at `|h| = 1`.
    pub fn alpha_max(&self) -> f32 {
        self.alpha_max
    }

    /// Opacity at `h = 0`.
    pub fn alpha_min(&self) -> f32 {
        self.alpha_min
    }

    /// Percentile of `|h|` used as the symmetric clipping threshold.
    pub fn clip_percentile(&self) -> f32 {
        self.clip_percentile
    }

    fn validate(&self) -> Result<()> {
        let unit = 0.0..=1.0;
        if !unit.contains(&self.alpha_min) || !unit.contains(&self.alpha_max) {
            return Err(XaiError::Configuration {
                message: format!(
                    "overlay alphas must lie in [0,1] (alpha_min={}, alpha_max={})",
                    self.alpha_min, self.alpha_max
                ),
            });
        }
        if self.alpha_min > self.alpha_max {
            return Err(XaiError::Configuration {
                message: "alpha_min must not exceed alpha_max".to_string(),
            });
        }
        if !(0.0..=100.0).contains(&self.clip_percentile) {
            return Err(XaiError::Configuration {
                message: format!("clip_percentile {} outside [0,100]", self.clip_percentile),
            });
        }
        Ok(())
    }
}
