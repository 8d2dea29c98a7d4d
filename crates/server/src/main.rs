mod settings;
mod transport;

use std::net::TcpListener;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use clap::Parser;

use emostream_core::detection::infrastructure::model_handles::ModelHandles;
use emostream_core::hub::stream_hub::StreamHub;

use settings::ServerSettings;

/// Realtime face emotion detection over a line-delimited JSON protocol.
#[derive(Parser)]
#[command(name = "emostream")]
struct Cli {
    /// Settings file (defaults to the per-user EmoStream/settings.json).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. 0.0.0.0:8765.
    #[arg(long)]
    bind: Option<String>,

    /// Frame worker threads (0 = one per core).
    #[arg(long)]
    workers: Option<usize>,

    /// ONNX face detector model.
    #[arg(long)]
    detector_model: Option<PathBuf>,

    /// ONNX emotion classifier model.
    #[arg(long)]
    classifier_model: Option<PathBuf>,

    /// Face detection confidence threshold (0.0-1.0).
    #[arg(long)]
    confidence: Option<f64>,

    /// Print the effective settings as JSON and exit.
    #[arg(long)]
    print_config: bool,
}

fn main() {
    env_logger::init();

    if let Err(e) = run() {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let settings = resolve_settings(&cli)?;

    if cli.print_config {
        println!("{}", serde_json::to_string_pretty(&settings)?);
        return Ok(());
    }
    settings.validate()?;

    let hub = Arc::new(StreamHub::new(
        settings.hub.clone(),
        Arc::new(build_models(&settings)?),
        Arc::new(settings.verifier()),
    ));
    spawn_reaper(hub.clone(), Duration::from_secs(settings.reap_interval_secs.max(1)));

    let listener = TcpListener::bind(&settings.bind)
        .map_err(|e| format!("Cannot bind {}: {e}", settings.bind))?;
    transport::serve(listener, hub)?;
    Ok(())
}

/// Settings file values, overridden by any flags given on the command line.
fn resolve_settings(cli: &Cli) -> Result<ServerSettings, Box<dyn std::error::Error>> {
    let mut settings = ServerSettings::load(cli.config.as_deref())?;
    if let Some(bind) = &cli.bind {
        settings.bind = bind.clone();
    }
    if let Some(workers) = cli.workers {
        settings.hub.workers = workers;
    }
    if let Some(path) = &cli.detector_model {
        settings.detector_model = Some(path.clone());
    }
    if let Some(path) = &cli.classifier_model {
        settings.classifier_model = Some(path.clone());
    }
    if let Some(confidence) = cli.confidence {
        settings.confidence = confidence;
    }
    Ok(settings)
}

fn build_models(settings: &ServerSettings) -> Result<ModelHandles, Box<dyn std::error::Error>> {
    let (Some(detector), Some(classifier)) = (&settings.detector_model, &settings.classifier_model)
    else {
        return Err("detector_model and classifier_model are required".into());
    };

    let models = ModelHandles::load_onnx(
        detector,
        classifier,
        settings.emotion_labels.clone(),
        settings.confidence,
    )?;
    log::info!(
        "Loaded models: detector {}, classifier {}",
        detector.display(),
        classifier.display()
    );

    if settings.inference_permits > 0 {
        return Ok(models.with_admission_limit(
            settings.inference_permits,
            Duration::from_millis(settings.admission_timeout_ms),
        ));
    }
    Ok(models)
}

fn spawn_reaper(hub: Arc<StreamHub>, interval: Duration) {
    thread::spawn(move || loop {
        thread::sleep(interval);
        let reaped = hub.reap_idle();
        if !reaped.is_empty() {
            log::info!("Closed {} idle sessions", reaped.len());
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_override_settings() {
        let cli = Cli::parse_from([
            "emostream",
            "--bind",
            "0.0.0.0:9999",
            "--workers",
            "3",
            "--confidence",
            "0.7",
        ]);
        let settings = resolve_settings(&cli).unwrap();
        assert_eq!(settings.bind, "0.0.0.0:9999");
        assert_eq!(settings.hub.workers, 3);
        assert_eq!(settings.confidence, 0.7);
    }

    #[test]
    fn test_models_required() {
        let settings = ServerSettings::default();
        assert!(build_models(&settings).is_err());
    }
}
