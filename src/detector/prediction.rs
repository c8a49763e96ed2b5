use ndarray::prelude::*;
use serde::{Deserialize, Serialize, Serializer};

use crate::errors::{Result, XaiError};
use crate::xai::{argmax, XaiMethod};

pub const FAKE_LABEL: &str = "fake";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AudioPrediction {
    /// `Real Audio` or `Fake Audio Detected`.
    pub decision: String,
    pub label: String,
    /// Probability of the predicted class.
    pub confidence: f32,
    pub class_index: usize,
}

impl AudioPrediction {
    /// Label the arg-max of one row of class probabilities.
    pub fn from_scores(scores: ArrayView1<'_, f32>, class_names: &[String]) -> Result<Self> {
        if scores.is_empty() {
            return Err(XaiError::shape("(K,) scores with K > 0", scores.shape()));
        }
        let class_index = argmax(scores);
        let label = class_names.get(class_index).cloned().ok_or_else(|| {
            XaiError::invalid_input(
                "class_index",
                format!("{class_index} has no name among {class_names:?}"),
            )
        })?;
        let decision = if label == FAKE_LABEL {
            "Fake Audio Detected"
        } else {
            "Real Audio"
        };
        Ok(Self {
            decision: decision.to_string(),
            label,
            confidence: scores[class_index],
            class_index,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LungPrediction {
    /// `Cancer suspected` or `No cancer detected`.
    pub decision: String,
    pub threshold: f32,
    /// Score of the target pathology.
    pub score: f32,
}

impl LungPrediction {
    pub fn from_score(score: f32, threshold: f32) -> Self {
        let decision = if score >= threshold {
            "Cancer suspected"
        } else {
            "No cancer detected"
        };
        Self {
            decision: decision.to_string(),
            threshold,
            score,
        }
    }
}

/// Service-specific prediction, serialised under the key the service's clients expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Prediction {
    #[serde(rename = "audio_prediction")]
    Audio(AudioPrediction),
    #[serde(rename = "lung_prediction")]
    Lung(LungPrediction),
}

/// Outcome of one detection request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectorResult {
    pub xai_method: XaiMethod,
    /// `(H, W, 3)` overlay, serialised as nested `[H][W][3]` integers.
    #[serde(serialize_with = "serialize_pixels")]
    pub xai_explain: Array3<u8>,
    #[serde(flatten)]
    pub prediction: Prediction,
}

fn serialize_pixels<S: Serializer>(pixels: &Array3<u8>, serializer: S) -> std::result::Result<S::Ok, S::Error> {
    serializer.collect_seq(pixels.outer_iter().map(|row| {
        row.outer_iter()
            .map(|pixel| pixel.to_vec())
            .collect::<Vec<_>>()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn names() -> Vec<String> {
        vec!["real".to_string(), "fake".to_string()]
    }

    #[test]
    fn test_audio_decision() -> Result<()> {
        let fake = AudioPrediction::from_scores(array![0.2, 0.8].view(), &names())?;
        assert_eq!(fake.decision, "Fake Audio Detected");
        assert_eq!(fake.label, "fake");
        assert_eq!(fake.class_index, 1);
        assert!((fake.confidence - 0.8).abs() < 1e-6);

        let real = AudioPrediction::from_scores(array![0.6, 0.4].view(), &names())?;
        assert_eq!(real.decision, "Real Audio");
        Ok(())
    }

    #[test]
    fn test_audio_prediction_needs_names() {
        assert!(AudioPrediction::from_scores(array![0.1, 0.2, 0.7].view(), &names()).is_err());
        assert!(AudioPrediction::from_scores(Array1::<f32>::zeros(0).view(), &names()).is_err());
    }

    #[test]
    fn test_lung_threshold_is_inclusive() {
        assert_eq!(LungPrediction::from_score(0.5, 0.5).decision, "Cancer suspected");
        assert_eq!(LungPrediction::from_score(0.49, 0.5).decision, "No cancer detected");
    }

    #[test]
    fn test_result_serialisation() -> std::result::Result<(), serde_json::Error> {
        let result = DetectorResult {
            xai_method: XaiMethod::Gradcam,
            xai_explain: Array3::from_shape_vec((1, 2, 3), vec![1, 2, 3, 4, 5, 6]).unwrap(),
            prediction: Prediction::Lung(LungPrediction::from_score(0.75, 0.5)),
        };
        assert_eq!(
            serde_json::to_value(&result)?,
            json!({
                "xai_method": "gradcam",
                "xai_explain": [[[1, 2, 3], [4, 5, 6]]],
                "lung_prediction": {
                    "decision": "Cancer suspected",
                    "threshold": 0.5,
                    "score": 0.75
                }
            })
        );
        Ok(())
    }
}
