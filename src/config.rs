use std::path::PathBuf;
use std::str::FromStr;

use clap::{Args, Parser, Subcommand};

use crate::detector::ServiceKind;
use crate::errors::Result;
use crate::server::DEFAULT_MAX_UPLOAD_BYTES;
use crate::xai::lime::LimeConfig;
use crate::xai::masker::MaskerSpec;
use crate::xai::segmentation::SlicConfig;
use crate::xai::shap::ShapConfig;
use crate::xai::{OverlayConfig, XaiMethod};

#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the detection API over HTTP.
    Serve(ServeArgs),
    /// Run one detection offline and write the overlay image.
    Explain(ExplainArgs),
}

impl Command {
    pub fn detector(&self) -> &DetectorArgs {
        match self {
            Self::Serve(args) => &args.detector,
            Self::Explain(args) => &args.detector,
        }
    }
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    #[arg(long, env = "PORT", default_value_t = 8000)]
    pub port: u16,

    /// Prefix of every route, normalised to `/prefix/`.
    #[arg(long, env = "BASE_API_PATH", default_value = "/api/", value_parser = check_base_api_path)]
    pub base_api_path: String,

    /// Largest accepted request body, in bytes.
    #[arg(long, env = "MAX_UPLOAD_BYTES", default_value_t = DEFAULT_MAX_UPLOAD_BYTES, value_parser = check_upload_limit)]
    pub max_upload_bytes: usize,

    #[command(flatten)]
    pub detector: DetectorArgs,
}

#[derive(Args, Debug, Clone)]
pub struct ExplainArgs {
    #[arg(short, long, value_parser = check_existing_file)]
    pub input: PathBuf,

    #[arg(short, long, value_parser = check_method)]
    pub method: XaiMethod,

    #[arg(short, long, default_value = "explanation.png")]
    pub output: PathBuf,

    #[command(flatten)]
    pub detector: DetectorArgs,
}

#[derive(Args, Debug, Clone)]
pub struct DetectorArgs {
    #[arg(long, env = "XAI_SERVICE", value_parser = check_service)]
    pub service: ServiceKind,

    #[arg(long, env = "MODEL_PATH", value_parser = check_existing_file)]
    pub model_path: PathBuf,

    /// Companion graph producing activations and gradients for Grad-CAM and saliency.
    #[arg(long, value_parser = check_existing_file)]
    pub gradient_model_path: Option<PathBuf>,

    /// Convolution tapped by the gradient graph.
    #[arg(long, default_value = "last_conv")]
    pub gradient_layer: String,

    /// Backbone explained by Grad-CAM instead of the deployed classifier.
    #[arg(long, value_parser = check_existing_file, requires = "gradcam_proxy_gradient_model")]
    pub gradcam_proxy_model: Option<PathBuf>,

    #[arg(long, value_parser = check_existing_file, requires = "gradcam_proxy_model")]
    pub gradcam_proxy_gradient_model: Option<PathBuf>,

    #[arg(long, default_value = "block5_conv3")]
    pub gradcam_proxy_layer: String,

    #[arg(short, long, default_value_t = 0)]
    pub device_id: i32,

    /// Lung decision threshold on the target pathology score.
    #[arg(long, default_value_t = 0.5, value_parser = check_unit_interval)]
    pub threshold: f32,

    #[arg(long, default_value = "Lung Lesion")]
    pub target_label: String,

    /// Override the class names declared for the service.
    #[arg(long, value_delimiter = ',')]
    pub class_names: Option<Vec<String>>,

    #[arg(long, default_value_t = 0.05, value_parser = check_unit_interval)]
    pub alpha_min: f32,

    #[arg(long, default_value_t = 0.70, value_parser = check_unit_interval)]
    pub alpha_max: f32,

    #[arg(long, default_value_t = 99.0, value_parser = check_percentile)]
    pub clip_percentile: f32,

    #[arg(long, default_value_t = 1000)]
    pub lime_num_samples: usize,

    /// Superpixels kept in the LIME overlay, `0` keeps all of them.
    #[arg(long, default_value_t = 10)]
    pub lime_num_features: usize,

    #[arg(long, default_value_t = 100)]
    pub lime_segments: usize,

    #[arg(long, default_value_t = 10.0)]
    pub lime_compactness: f32,

    #[arg(long, default_value_t = 1.0)]
    pub lime_sigma: f32,

    /// Gaussian smoothing of the LIME weight map, `0` disables it.
    #[arg(long, default_value_t = 2.0)]
    pub lime_heat_sigma: f32,

    #[arg(long, default_value_t = 0)]
    pub lime_seed: u64,

    /// Outline the kept superpixels in yellow.
    #[arg(long)]
    pub lime_mark_boundaries: bool,

    #[arg(long, default_value_t = 256)]
    pub shap_max_evals: usize,

    #[arg(long, default_value_t = 16)]
    pub shap_batch_size: usize,

    #[arg(long, default_value = "blur(32,32)", value_parser = check_masker)]
    pub shap_masker: String,
}

impl DetectorArgs {
    /// Overlay parameters; fails when `alpha_min > alpha_max`.
    pub fn overlay(&self) -> Result<OverlayConfig> {
        OverlayConfig::new(self.alpha_min, self.alpha_max, self.clip_percentile)
    }

    pub fn lime_config(&self) -> LimeConfig {
        LimeConfig {
            num_samples: self.lime_num_samples,
            num_features: (self.lime_num_features > 0).then_some(self.lime_num_features),
            segmentation: SlicConfig {
                n_segments: self.lime_segments,
                compactness: self.lime_compactness,
                sigma: self.lime_sigma,
                ..SlicConfig::default()
            },
            heat_sigma: (self.lime_heat_sigma > 0.0).then_some(self.lime_heat_sigma),
            seed: self.lime_seed,
            mark_boundaries: self.lime_mark_boundaries,
            ..LimeConfig::default()
        }
    }

    pub fn shap_config(&self) -> ShapConfig {
        ShapConfig {
            max_evals: self.shap_max_evals,
            batch_size: self.shap_batch_size,
            masker: self.shap_masker.clone(),
            ..ShapConfig::default()
        }
    }
}

fn check_service(s: &str) -> std::result::Result<ServiceKind, String> {
    match s.to_ascii_lowercase().as_str() {
        "audio" => Ok(ServiceKind::Audio),
        "lung" => Ok(ServiceKind::Lung),
        _ => Err(format!("{s} is not a service. Supported services: `audio`, `lung`")),
    }
}

fn check_method(s: &str) -> std::result::Result<XaiMethod, String> {
    XaiMethod::from_str(s).map_err(|_| {
        let supported: Vec<_> = XaiMethod::ALL.iter().map(|m| format!("`{m}`")).collect();
        format!("{s} is not supported. Supported methods: {}", supported.join(", "))
    })
}

fn check_existing_file(s: &str) -> std::result::Result<PathBuf, String> {
    let path = PathBuf::from(s);
    if !path.is_file() {
        return Err(format!("{s} does not exist or is not a file"));
    }
    Ok(path)
}

fn check_unit_interval(s: &str) -> std::result::Result<f32, String> {
    let value: f32 = s.parse().map_err(|_| format!("{s} is not a number"))?;
    if !(0.0..=1.0).contains(&value) {
        return Err(format!("{s} must lie in [0, 1]"));
    }
    Ok(value)
}

fn check_percentile(s: &str) -> std::result::Result<f32, String> {
    let value: f32 = s.parse().map_err(|_| format!("{s} is not a number"))?;
    if !(0.0..=100.0).contains(&value) {
        return Err(format!("{s} must lie in [0, 100]"));
    }
    Ok(value)
}

fn check_upload_limit(s: &str) -> std::result::Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("upload limit must be positive".to_string()),
        Ok(value) => Ok(value),
        Err(_) => Err(format!("{s} is not a byte count")),
    }
}

fn check_masker(s: &str) -> std::result::Result<String, String> {
    MaskerSpec::from_str(s).map_err(|e| e.to_string())?;
    Ok(s.trim().to_string())
}

fn check_base_api_path(s: &str) -> std::result::Result<String, String> {
    let trimmed = s.trim().trim_matches('/');
    if trimmed.chars().any(|c| c.is_whitespace() || matches!(c, '?' | '#' | ':')) {
        return Err(format!("{s} is not a valid route prefix"));
    }
    if trimmed.is_empty() {
        return Ok("/".to_string());
    }
    Ok(format!("/{trimmed}/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_file() -> std::io::Result<tempfile::NamedTempFile> {
        tempfile::Builder::new().suffix(".onnx").tempfile()
    }

    #[test]
    fn test_serve_defaults() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let model = model_file()?;
        let model_path = model.path().to_string_lossy().to_string();
        let cli = Cli::try_parse_from([
            "med-xai-rs",
            "serve",
            "--service",
            "lung",
            "--model-path",
            &model_path,
        ])?;
        let Command::Serve(args) = cli.command else {
            panic!("expected the serve subcommand");
        };
        assert_eq!(args.port, 8000);
        assert_eq!(args.base_api_path, "/api/");
        assert_eq!(args.max_upload_bytes, 100 * 1024 * 1024);
        assert_eq!(args.detector.service, ServiceKind::Lung);
        assert_eq!(args.detector.target_label, "Lung Lesion");
        assert_eq!(args.detector.overlay()?, OverlayConfig::default());

        let lime = args.detector.lime_config();
        assert_eq!(lime.num_samples, 1000);
        assert_eq!(lime.num_features, Some(10));
        assert_eq!(lime.segmentation.n_segments, 100);
        assert!(!lime.mark_boundaries);
        assert_eq!(args.detector.shap_config().masker, "blur(32,32)");
        Ok(())
    }

    #[test]
    fn test_explain_parses_method_and_class_names() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let model = model_file()?;
        let input = model_file()?;
        let cli = Cli::try_parse_from([
            "med-xai-rs",
            "explain",
            "--input",
            &input.path().to_string_lossy(),
            "--method",
            "SHAP",
            "--service",
            "audio",
            "--model-path",
            &model.path().to_string_lossy(),
            "--class-names",
            "real,fake",
            "--lime-num-features",
            "0",
        ])?;
        let Command::Explain(args) = cli.command else {
            panic!("expected the explain subcommand");
        };
        assert_eq!(args.method, XaiMethod::Shap);
        assert_eq!(
            args.detector.class_names,
            Some(vec!["real".to_string(), "fake".to_string()])
        );
        assert_eq!(args.detector.lime_config().num_features, None);
        Ok(())
    }

    #[test]
    fn test_proxy_requires_its_gradient_graph() -> std::io::Result<()> {
        let model = model_file()?;
        let model_path = model.path().to_string_lossy().to_string();
        let result = Cli::try_parse_from([
            "med-xai-rs",
            "serve",
            "--service",
            "audio",
            "--model-path",
            &model_path,
            "--gradcam-proxy-model",
            &model_path,
        ]);
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn test_inverted_alphas_rejected_at_startup() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let model = model_file()?;
        let cli = Cli::try_parse_from([
            "med-xai-rs",
            "serve",
            "--service",
            "audio",
            "--model-path",
            &model.path().to_string_lossy(),
            "--alpha-min",
            "0.9",
            "--alpha-max",
            "0.1",
        ])?;
        assert!(cli.command.detector().overlay().is_err());
        Ok(())
    }

    #[test]
    fn test_value_checks() {
        assert!(check_unit_interval("0.3").is_ok());
        assert!(check_unit_interval("1.2").is_err());
        assert!(check_unit_interval("abc").is_err());
        assert!(check_percentile("100").is_ok());
        assert!(check_percentile("-1").is_err());
        assert_eq!(check_upload_limit("5242880"), Ok(5_242_880));
        assert!(check_upload_limit("0").is_err());
        assert!(check_upload_limit("5MB").is_err());
        assert!(check_masker("blur(8, 8)").is_ok());
        assert!(check_masker("inpaint_telea").is_err());
        assert!(check_method("occlusion").is_err());
        assert!(check_service("heart").is_err());
        assert!(check_existing_file("/definitely/not/here.onnx").is_err());
    }

    #[test]
    fn test_base_api_path_normalisation() {
        assert_eq!(check_base_api_path("/api/").as_deref(), Ok("/api/"));
        assert_eq!(check_base_api_path("api").as_deref(), Ok("/api/"));
        assert_eq!(check_base_api_path("/v1/xai").as_deref(), Ok("/v1/xai/"));
        assert_eq!(check_base_api_path("/").as_deref(), Ok("/"));
        assert!(check_base_api_path("/a pi/").is_err());
    }
}
