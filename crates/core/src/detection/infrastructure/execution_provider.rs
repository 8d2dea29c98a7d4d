use std::path::Path;

use ort::execution_providers::ExecutionProviderDispatch;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;

/// Intra-op threads per session. Several frame workers call into the same
/// session, so each call only gets a small share of the cores.
const INTRA_OP_THREADS: usize = 2;

/// Hardware providers to try for this platform; ONNX Runtime falls back to
/// CPU when none of them load.
fn platform_providers() -> Vec<ExecutionProviderDispatch> {
    let mut providers = Vec::new();
    #[cfg(target_os = "macos")]
    providers.push(ort::execution_providers::CoreMLExecutionProvider::default().build());
    #[cfg(target_os = "windows")]
    providers.push(ort::execution_providers::DirectMLExecutionProvider::default().build());
    providers
}

/// Opens `model_path` as a fully optimized inference session.
pub fn open_session(model_path: &Path) -> Result<Session, Box<dyn std::error::Error>> {
    let intra = std::thread::available_parallelism()
        .map_or(1, |n| n.get())
        .min(INTRA_OP_THREADS);
    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra)?
        .with_execution_providers(platform_providers())?
        .commit_from_file(model_path)
        .map_err(|e| format!("Cannot load model {}: {e}", model_path.display()))?;
    Ok(session)
}
