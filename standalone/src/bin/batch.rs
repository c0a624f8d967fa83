use clap::Parser;
use std::path::PathBuf;
use tracing::{error, info};
use vision_relay_common::config::Config;
use vision_relay_common::engine::load_engine;
use vision_relay_common::logging;

/// Analyze every image in a directory and print one line per image.
#[derive(Debug, Parser)]
#[command(name = "vision-relay-batch", version)]
struct Args {
    /// Model description file (TOML).
    model_path: PathBuf,
    images_dir: PathBuf,
    /// Save annotated images into this directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            let _ = e.print();
            std::process::exit(if e.use_stderr() { 1 } else { 0 });
        }
    };

    let config = match Config::load_or_default(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&config.logging);

    let engine = match load_engine(&args.model_path) {
        Ok(engine) => engine,
        Err(e) => {
            error!(model = %args.model_path.display(), error = %e, "failed to load model");
            std::process::exit(1);
        }
    };

    let mut stdout = std::io::stdout();
    let overlay_dir = args.output_dir.as_deref();
    match vision_relay_standalone::batch::run(&engine, &args.images_dir, overlay_dir, &mut stdout) {
        Ok(summary) => info!(
            images = summary.images,
            analyzed = summary.analyzed,
            reported = summary.reported,
            "batch finished"
        ),
        Err(e) => {
            error!(error = %e, "batch failed");
            std::process::exit(1);
        }
    }
}
