mod acceptor;
mod session;
mod transport;
mod worker;

use acceptor::Acceptor;
use clap::Parser;
use session::SessionSettings;
use std::path::PathBuf;
use tracing::{error, info};
use vision_relay_common::config::Config;
use vision_relay_common::engine::{load_engine, InferenceError};
use vision_relay_common::logging;

/// Run inference on frames streamed by vision-relay clients.
#[derive(Debug, Parser)]
#[command(name = "vision-relay-server", version)]
struct Args {
    /// Model description file (TOML).
    model_path: PathBuf,
    /// Port to listen on; overrides the configured one.
    port: Option<u16>,
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

    let mut config = match Config::load_or_default(args.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };
    if let Some(port) = args.port {
        config.server.port = port;
    }

    logging::init(&config.logging);

    if let Err(e) = run(&args, &config) {
        error!(error = %e, "server failed");
        std::process::exit(1);
    }
}

#[derive(Debug, thiserror::Error)]
enum ServerError {
    #[error("failed to load model: {0}")]
    Model(#[from] InferenceError),
    #[error("failed to bind {0}: {1}")]
    Bind(String, std::io::Error),
}

fn run(args: &Args, config: &Config) -> Result<(), ServerError> {
    let engine = load_engine(&args.model_path)?;

    let addr = format!("{}:{}", config.server.bind_addr, config.server.port);
    let acceptor = Acceptor::bind(&addr, engine.clone(), SessionSettings::from_config(config))
        .map_err(|e| ServerError::Bind(addr.clone(), e))?;

    info!(
        addr,
        model = %args.model_path.display(),
        engine = engine.name(),
        task = ?engine.task(),
        width = config.frame.width,
        height = config.frame.height,
        sequenced = config.protocol.sequenced,
        "launched vision-relay server"
    );

    acceptor.serve();
    Ok(())
}
