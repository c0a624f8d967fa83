mod capture;
mod pipeline;
mod receiver;
mod renderer;
mod uploader;

use clap::Parser;
use pipeline::ClientError;
use renderer::{DirectorySink, FrameSink, LogSink, Sinks};
use std::path::PathBuf;
use tracing::{error, info, warn};
use vision_relay_common::config::Config;
use vision_relay_common::logging;

/// Stream video frames to an inference server and overlay the results.
#[derive(Debug, Parser)]
#[command(name = "vision-relay-client", version)]
struct Args {
    /// Inference server host name or address.
    server_host: String,
    server_port: u16,
    /// Video file, camera device (/dev/videoN) or directory of images.
    video_source: String,
    /// TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Write each rendered frame as a PNG into this directory.
    #[arg(long)]
    output_dir: Option<PathBuf>,
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

    info!(
        server = format!("{}:{}", args.server_host, args.server_port),
        source = args.video_source,
        width = config.frame.width,
        height = config.frame.height,
        sequenced = config.protocol.sequenced,
        "starting vision-relay client"
    );

    if let Err(e) = run(args, config) {
        error!(error = %e, "client failed");
        std::process::exit(1);
    }
}

fn run(args: Args, config: Config) -> Result<(), ClientError> {
    let source = capture::open_source(&args.video_source, config.geometry())?;

    let mut sinks: Vec<Box<dyn FrameSink>> = vec![Box::new(LogSink)];
    if let Some(dir) = args.output_dir.as_ref().or(config.client.output_dir.as_ref()) {
        sinks.push(Box::new(DirectorySink::new(dir)?));
        info!(dir = %dir.display(), "writing rendered frames");
    }

    let socket = pipeline::connect(&args.server_host, args.server_port)?;
    let summary = pipeline::run(socket, source, Box::new(Sinks(sinks)), &config)?;

    match &summary.stop_reason {
        None => info!(
            captured = summary.captured,
            uploaded = summary.uploaded,
            received = summary.received,
            rendered = summary.rendered,
            "pipeline finished"
        ),
        Some(reason) => warn!(
            captured = summary.captured,
            uploaded = summary.uploaded,
            received = summary.received,
            rendered = summary.rendered,
            reason = %reason,
            "pipeline stopped early"
        ),
    }
    Ok(())
}
