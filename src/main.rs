use std::sync::Arc;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use image::ImageFormat;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use med_xai_rs::config::{Cli, Command, DetectorArgs, ExplainArgs, ServeArgs};
use med_xai_rs::detector::audio::{self, AudioDetectorModel};
use med_xai_rs::detector::lung::{self, LungDetectorModel};
use med_xai_rs::detector::{DetectionService, Detector, ExplainerSettings, ServiceKind};
use med_xai_rs::model::OnnxClassifier;
use med_xai_rs::server::{create_router, AppState};
use med_xai_rs::traits::GradientClassifier;
use med_xai_rs::xai::gradcam::ProxyPreprocessing;
use med_xai_rs::xai::helpers::array_to_rgb_image;

const PROXY_INPUT_SIZE: u32 = 224;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "med_xai_rs=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let detector = build_detector(cli.command.detector())?;

    match cli.command {
        Command::Serve(args) => serve(args, detector).await,
        Command::Explain(args) => explain(args, detector).await,
    }
}

fn build_detector(args: &DetectorArgs) -> Result<Arc<dyn DetectionService>> {
    let overlay = args.overlay()?;
    let class_names = args.class_names.clone().unwrap_or_else(|| {
        let defaults: &[&str] = match args.service {
            ServiceKind::Audio => &audio::CLASS_NAMES,
            ServiceKind::Lung => &lung::PATHOLOGIES,
        };
        defaults.iter().map(|name| name.to_string()).collect()
    });

    let mut classifier = OnnxClassifier::new(&args.model_path, args.device_id, Some(class_names))
        .with_context(|| format!("Failed to load model: {}", args.model_path.display()))?;
    if let Some(graph) = &args.gradient_model_path {
        classifier = classifier.with_gradient_graph(graph, args.device_id, &args.gradient_layer)?;
    } else {
        tracing::warn!("no gradient graph given, Grad-CAM on the classifier and SHAP saliency are unavailable");
    }
    let classifier: Arc<dyn GradientClassifier> = Arc::new(classifier);

    let gradcam_proxy = match (&args.gradcam_proxy_model, &args.gradcam_proxy_gradient_model) {
        (Some(model), Some(graph)) => {
            let backbone = OnnxClassifier::new(model, args.device_id, None)
                .with_context(|| format!("Failed to load proxy backbone: {}", model.display()))?
                .with_gradient_graph(graph, args.device_id, &args.gradcam_proxy_layer)?;
            tracing::info!(
                backbone = %model.display(),
                layer = %args.gradcam_proxy_layer,
                "Grad-CAM explains the proxy backbone, not the deployed classifier"
            );
            let backbone: Arc<dyn GradientClassifier> = Arc::new(backbone);
            Some((backbone, ProxyPreprocessing::Vgg16Caffe { size: PROXY_INPUT_SIZE }))
        }
        _ => None,
    };

    let settings = ExplainerSettings {
        lime: args.lime_config(),
        shap: args.shap_config(),
        gradcam_proxy,
        ..ExplainerSettings::default()
    };

    let detector: Arc<dyn DetectionService> = match args.service {
        ServiceKind::Audio => Arc::new(Detector::new(
            AudioDetectorModel::new(classifier)?,
            &settings,
            overlay,
        )?),
        ServiceKind::Lung => Arc::new(Detector::new(
            LungDetectorModel::new(classifier, args.threshold, &args.target_label)?,
            &settings,
            overlay,
        )?),
    };
    Ok(detector)
}

async fn serve(args: ServeArgs, detector: Arc<dyn DetectionService>) -> Result<()> {
    let service = detector.service();
    let app = create_router(
        AppState::new(detector, args.base_api_path.clone())
            .with_max_upload_bytes(args.max_upload_bytes),
    );

    let addr = format!("{}:{}", args.host, args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    tracing::info!(service = %service, "listening on http://{addr}{}", args.base_api_path);

    axum::serve(listener, app).await?;
    Ok(())
}

async fn explain(args: ExplainArgs, detector: Arc<dyn DetectionService>) -> Result<()> {
    ensure!(
        ImageFormat::from_path(&args.output).is_ok(),
        "Output path must end in an image extension"
    );

    let input = args.input.clone();
    let method = args.method;
    let result = tokio::task::spawn_blocking(move || detector.detect(&input, method)).await??;

    array_to_rgb_image(result.xai_explain.view())?
        .save(&args.output)
        .with_context(|| format!("Failed to save overlay: {}", args.output.display()))?;
    tracing::info!(output = %args.output.display(), "overlay written");

    println!("{}", serde_json::to_string_pretty(&result.prediction)?);
    Ok(())
}
