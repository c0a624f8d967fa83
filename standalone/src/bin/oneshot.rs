use clap::Parser;
use std::path::PathBuf;
use tracing::error;
use vision_relay_common::config::LoggingConfig;
use vision_relay_common::logging;

/// Run one inference on one image and write the result as JSON.
#[derive(Debug, Parser)]
#[command(name = "vision-relay-oneshot", version)]
struct Args {
    /// Model description file (TOML).
    model_path: PathBuf,
    input_image_path: PathBuf,
    output_json_path: PathBuf,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { -1 } else { 0 });
        }
    };

    logging::init(&LoggingConfig::default());

    if let Err(e) = vision_relay_standalone::oneshot::run(
        &args.model_path,
        &args.input_image_path,
        &args.output_json_path,
    ) {
        error!(error = %e, "single-shot inference failed");
        std::process::exit(1);
    }
}
