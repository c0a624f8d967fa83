use std::path::Path;
use tracing::info;
use vision_relay_common::analysis::AnalysisResult;
use vision_relay_common::engine::{load_engine, SharedEngine};

use crate::StandaloneError;

/// Decode the image at `path` and run one inference on it.
pub fn analyze_file(engine: &SharedEngine, path: &Path) -> Result<AnalysisResult, StandaloneError> {
    let image = image::open(path)
        .map_err(|e| StandaloneError::Decode(path.display().to_string(), e))?
        .to_rgb8();
    Ok(engine.analyze(&image)?)
}

/// Load the model, analyze one image and write the result JSON to `output`.
pub fn run(model: &Path, input: &Path, output: &Path) -> Result<AnalysisResult, StandaloneError> {
    let engine = load_engine(model)?;
    let result = analyze_file(&engine, input)?;
    std::fs::write(output, result.to_json_bytes(None))
        .map_err(|e| StandaloneError::Write(output.display().to_string(), e))?;
    info!(
        input = %input.display(),
        output = %output.display(),
        items = result.len(),
        "result written"
    );
    Ok(result)
}
