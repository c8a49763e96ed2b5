use std::path::Path;

use ndarray::prelude::*;
use ort::value::TensorRef;
use ort::{
    execution_providers::{CUDAExecutionProvider, TensorRTExecutionProvider},
    session::{builder::SessionBuilder, Session},
};
use parking_lot::Mutex;

use crate::errors::{Result, XaiError};
use crate::traits::{Classifier, GradientClassifier, LayerCapture};

const GRADIENT_INPUT: &str = "input";
const GRADIENT_CLASS_MASK: &str = "class_mask";
const GRADIENT_ACTIVATIONS: &str = "activations";
const GRADIENT_GRADIENTS: &str = "gradients";
const GRADIENT_INPUT_GRADIENT: &str = "input_gradient";

fn build_session(model_path: &Path, device_id: i32) -> Result<Session> {
    SessionBuilder::new()
        .map_err(|e| XaiError::model("session builder init", e))?
        .with_execution_providers([
            TensorRTExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
            CUDAExecutionProvider::default()
                .with_device_id(device_id)
                .build(),
        ])
        .map_err(|e| XaiError::model("execution provider setup", e))?
        .with_memory_pattern(true)
        .map_err(|e| XaiError::model("memory pattern setup", e))?
        .commit_from_file(model_path)
        .map_err(|e| XaiError::model(format!("model load: {}", model_path.display()), e))
}

/// Companion graph exposing the activations and gradients ONNX Runtime cannot compute
/// on its own.
///
/// Inputs: `input` (the model input) and `class_mask` (one-hot, `(1, K)`). Outputs:
/// `activations` and `gradients` of one convolution, `(1, C, h, w)`, and optionally
/// `input_gradient` shaped like `input`.
struct GradientGraph {
    session: Mutex<Session>,
    layer: String,
    has_input_gradient: bool,
}

/// Image classifier backed by an ONNX Runtime session.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    input_name: String,
    output_name: String,
    class_names: Vec<String>,
    gradients: Option<GradientGraph>,
}

impl OnnxClassifier {
    /// Load `model_path`. Without `class_names`, classes are named `class_<i>` after the
    /// static width of the first output.
    pub fn new(model_path: &Path, device_id: i32, class_names: Option<Vec<String>>) -> Result<Self> {
        let session = build_session(model_path, device_id)?;
        let input_name = session
            .inputs
            .first()
            .map(|input| input.name.clone())
            .ok_or_else(|| XaiError::Configuration {
                message: format!("{} declares no inputs", model_path.display()),
            })?;
        let output = session.outputs.first().ok_or_else(|| XaiError::Configuration {
            message: format!("{} declares no outputs", model_path.display()),
        })?;
        let output_name = output.name.clone();
        let width = output
            .output_type
            .tensor_shape()
            .and_then(|shape| shape.get(1).copied())
            .filter(|&k| k > 0);

        let class_names = match (class_names, width) {
            (Some(names), Some(k)) if names.len() as i64 != k => {
                return Err(XaiError::Configuration {
                    message: format!(
                        "{} class names given but {} outputs {k} scores",
                        names.len(),
                        model_path.display()
                    ),
                })
            }
            (Some(names), _) => names,
            (None, Some(k)) => (0..k).map(|i| format!("class_{i}")).collect(),
            (None, None) => {
                return Err(XaiError::Configuration {
                    message: format!(
                        "{} has a dynamic class dimension, class names are required",
                        model_path.display()
                    ),
                })
            }
        };
        tracing::info!(
            model = %model_path.display(),
            input = %input_name,
            output = %output_name,
            num_classes = class_names.len(),
            "classifier loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            input_name,
            output_name,
            class_names,
            gradients: None,
        })
    }

    /// Attach a gradient graph tapping `layer`.
    pub fn with_gradient_graph(mut self, graph_path: &Path, device_id: i32, layer: &str) -> Result<Self> {
        let session = build_session(graph_path, device_id)?;
        let has = |name: &str| session.outputs.iter().any(|output| output.name == name);
        for required in [GRADIENT_ACTIVATIONS, GRADIENT_GRADIENTS] {
            if !has(required) {
                return Err(XaiError::Integrity {
                    message: format!(
                        "gradient graph {} lacks the {required:?} output",
                        graph_path.display()
                    ),
                });
            }
        }
        let has_input_gradient = has(GRADIENT_INPUT_GRADIENT);
        tracing::info!(
            graph = %graph_path.display(),
            layer,
            has_input_gradient,
            "gradient graph loaded"
        );
        self.gradients = Some(GradientGraph {
            session: Mutex::new(session),
            layer: layer.to_string(),
            has_input_gradient,
        });
        Ok(self)
    }

    fn class_mask(&self, class_index: usize) -> Result<Array2<f32>> {
        if class_index >= self.class_names.len() {
            return Err(XaiError::invalid_input(
                "class_index",
                format!("{class_index} outside 0..{}", self.class_names.len()),
            ));
        }
        let mut mask = Array2::<f32>::zeros((1, self.class_names.len()));
        mask[[0, class_index]] = 1.0;
        Ok(mask)
    }

    fn gradient_graph(&self) -> Result<&GradientGraph> {
        self.gradients.as_ref().ok_or_else(|| XaiError::Integrity {
            message: "no gradient graph attached, activations and gradients are unavailable"
                .to_string(),
        })
    }

    /// Run the gradient graph and pull the named outputs.
    fn run_gradients(
        &self,
        input: ArrayView4<f32>,
        class_index: usize,
        outputs: &[&str],
    ) -> Result<Vec<ArrayD<f32>>> {
        if input.shape()[0] != 1 {
            return Err(XaiError::shape("a single-image batch", input.shape()));
        }
        let graph = self.gradient_graph()?;
        let mask = self.class_mask(class_index)?;
        let mut session = graph.session.lock();
        let results = session.run(ort::inputs![
            GRADIENT_INPUT => TensorRef::from_array_view(&input.as_standard_layout())?,
            GRADIENT_CLASS_MASK => TensorRef::from_array_view(&mask)?
        ])?;
        let extracted = outputs
            .iter()
            .map(|&name| Ok(results[name].try_extract_array::<f32>()?.to_owned()))
            .collect::<Result<Vec<_>>>()?;
        Ok(extracted)
    }
}

impl Classifier for OnnxClassifier {
    fn predict(&self, input: ArrayView4<f32>) -> Result<Array2<f32>> {
        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![
            self.input_name.as_str() => TensorRef::from_array_view(&input.as_standard_layout())?
        ])?;
        Ok(outputs[self.output_name.as_str()]
            .try_extract_array::<f32>()?
            .into_dimensionality::<Ix2>()?
            .to_owned())
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }
}

impl GradientClassifier for OnnxClassifier {
    fn last_conv_layer(&self) -> Option<String> {
        self.gradients.as_ref().map(|graph| graph.layer.clone())
    }

    fn capture_layer(&self, input: ArrayView4<f32>, layer: &str, class_index: usize) -> Result<LayerCapture> {
        let graph = self.gradient_graph()?;
        if graph.layer != layer {
            return Err(XaiError::Integrity {
                message: format!(
                    "gradient graph taps {:?}, cannot capture {layer:?}",
                    graph.layer
                ),
            });
        }
        let mut captured = self
            .run_gradients(input, class_index, &[GRADIENT_ACTIVATIONS, GRADIENT_GRADIENTS])?
            .into_iter()
            .map(|tensor| -> Result<Array3<f32>> {
                Ok(tensor
                    .into_dimensionality::<Ix4>()?
                    .index_axis_move(Axis(0), 0))
            });
        let activations = captured
            .next()
            .ok_or_else(|| XaiError::Integrity {
                message: "gradient graph returned no activations".to_string(),
            })??;
        let gradients = captured
            .next()
            .ok_or_else(|| XaiError::Integrity {
                message: "gradient graph returned no gradients".to_string(),
            })??;
        let scores = self.predict(input)?.index_axis_move(Axis(0), 0);

        Ok(LayerCapture {
            layer: layer.to_string(),
            activations,
            gradients,
            scores,
        })
    }

    fn input_gradient(&self, input: ArrayView4<f32>, class_index: usize) -> Result<Array4<f32>> {
        if !self.gradient_graph()?.has_input_gradient {
            return Err(XaiError::Integrity {
                message: "gradient graph has no input_gradient output".to_string(),
            });
        }
        let gradient = self
            .run_gradients(input, class_index, &[GRADIENT_INPUT_GRADIENT])?
            .pop()
            .ok_or_else(|| XaiError::Integrity {
                message: "gradient graph returned no input gradient".to_string(),
            })?;
        Ok(gradient.into_dimensionality::<Ix4>()?)
    }
}
