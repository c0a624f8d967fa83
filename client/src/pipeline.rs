use std::io;
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};
use vision_relay_common::config::{Config, ConfigError};
use vision_relay_common::frame::{Frame, FrameCodec, WireMode};
use vision_relay_common::queue::HandoffQueue;
use vision_relay_common::stop::{StageExit, StopReason, StopToken};

use crate::capture::{run_capture, CaptureError, FrameSource};
use crate::receiver::{run_receiver, InboundResult};
use crate::renderer::{FrameSink, RenderWaits, Renderer, SinkError};
use crate::uploader::{finish_upload, run_uploader, UploadPacing};

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to open capture source: {0}")]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Sink(#[from] SinkError),
    #[error("failed to connect to {0}: {1}")]
    Connect(String, io::Error),
    #[error("failed to set up socket: {0}")]
    Socket(io::Error),
    #[error("failed to spawn {0} thread: {1}")]
    Spawn(&'static str, io::Error),
}

/// What one pipeline run did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PipelineSummary {
    pub captured: u64,
    pub uploaded: u64,
    pub received: u64,
    pub rendered: u64,
    /// Set when a stage stopped the pipeline early.
    pub stop_reason: Option<StopReason>,
}

/// Connect to the inference server with Nagle disabled.
pub fn connect(host: &str, port: u16) -> Result<TcpStream, ClientError> {
    let addr = format!("{host}:{port}");
    let socket = TcpStream::connect(&addr).map_err(|e| ClientError::Connect(addr.clone(), e))?;
    socket.set_nodelay(true).map_err(ClientError::Socket)?;
    info!(server = addr, "connected");
    Ok(socket)
}

/// Run the four client stages over `socket` until they have all exited.
///
/// Capture feeds the uplink and retained queues, the uploader writes frames,
/// the result reader decodes replies and the renderer pairs each reply with
/// its retained frame. A stage that stops the pipeline also shuts the socket
/// down so stages blocked on it wake up.
pub fn run(
    socket: TcpStream,
    mut source: Box<dyn FrameSource>,
    mut sink: Box<dyn FrameSink>,
    config: &Config,
) -> Result<PipelineSummary, ClientError> {
    let geometry = config.geometry();
    let mode = WireMode::from_sequenced(config.protocol.sequenced);
    let codec = FrameCodec::new(geometry, mode);
    let max_message_bytes = config.protocol.max_message_bytes;
    let pacing = UploadPacing {
        frame_wait: config.client.capture_timeout(),
        interval: config.client.send_interval(),
    };
    let waits = RenderWaits {
        result: config.client.result_timeout(),
        frame: config.client.capture_timeout(),
    };

    let uplink = HandoffQueue::from_config(config.client.uplink_queue_capacity);
    let retained = HandoffQueue::from_config(config.client.retained_queue_capacity);
    let results = HandoffQueue::unbounded();
    let stop = StopToken::new();

    let mut upload_socket = socket.try_clone().map_err(ClientError::Socket)?;
    let mut read_socket = socket.try_clone().map_err(ClientError::Socket)?;
    let mut stages = Stages {
        stop: stop.clone(),
        control: Arc::new(socket),
        uplink: uplink.clone(),
        retained: retained.clone(),
        results: results.clone(),
        started: Vec::with_capacity(4),
    };

    {
        let (uplink, retained, token) = (uplink.clone(), retained.clone(), stop.clone());
        stages.spawn("capture", move || {
            run_capture(source.as_mut(), geometry, &uplink, &retained, &token)
        })?;
    }

    {
        let token = stop.clone();
        stages.spawn("uploader", move || {
            let exit = run_uploader(&mut upload_socket, codec, &uplink, pacing, &token);
            finish_upload(&upload_socket);
            exit
        })?;
    }

    {
        let (results, token) = (results.clone(), stop.clone());
        stages.spawn("result-reader", move || {
            run_receiver(&mut read_socket, mode, max_message_bytes, &results, &token)
        })?;
    }

    {
        let token = stop.clone();
        stages.spawn("renderer", move || {
            Renderer::new(mode, waits, &results, &retained, sink.as_mut(), &token).run()
        })?;
    }

    let mut counts = stages.join_all().into_iter();
    Ok(PipelineSummary {
        captured: counts.next().unwrap_or(0),
        uploaded: counts.next().unwrap_or(0),
        received: counts.next().unwrap_or(0),
        rendered: counts.next().unwrap_or(0),
        stop_reason: stop.reason(),
    })
}

/// The stage threads of one run, with the handles needed to unwind them.
struct Stages {
    stop: StopToken,
    control: Arc<TcpStream>,
    uplink: HandoffQueue<Frame>,
    retained: HandoffQueue<Frame>,
    results: HandoffQueue<InboundResult>,
    started: Vec<(&'static str, JoinHandle<StageExit>)>,
}

impl Stages {
    /// Start one stage. If the thread cannot be spawned, the stages already
    /// running are stopped and joined before the error is returned.
    fn spawn<F>(&mut self, name: &'static str, body: F) -> Result<(), ClientError>
    where
        F: FnOnce() -> StageExit + Send + 'static,
    {
        match spawn_stage(name, &self.control, &self.stop, body) {
            Ok(handle) => {
                self.started.push((name, handle));
                Ok(())
            }
            Err(e) => {
                self.abort(&e);
                Err(e)
            }
        }
    }

    fn abort(&mut self, cause: &ClientError) {
        error!(error = %cause, started = self.started.len(), "aborting pipeline startup");
        self.stop.stop(StopReason::ConnectionFault(cause.to_string()));
        self.uplink.close();
        self.retained.close();
        self.results.close();
        shutdown_both(&self.control);
        for (name, handle) in self.started.drain(..) {
            join_stage(name, handle);
        }
    }

    /// Join every started stage in start order, returning what each handled.
    fn join_all(self) -> Vec<u64> {
        self.started
            .into_iter()
            .map(|(name, handle)| join_stage(name, handle))
            .collect()
    }
}

fn spawn_stage<F>(
    name: &'static str,
    control: &Arc<TcpStream>,
    stop: &StopToken,
    body: F,
) -> Result<JoinHandle<StageExit>, ClientError>
where
    F: FnOnce() -> StageExit + Send + 'static,
{
    let control = Arc::clone(control);
    let stop = stop.clone();
    thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            let exit = body();
            if stop.is_stopped() {
                shutdown_both(&control);
            }
            exit
        })
        .map_err(|e| ClientError::Spawn(name, e))
}

fn shutdown_both(socket: &TcpStream) {
    match socket.shutdown(Shutdown::Both) {
        Ok(()) => debug!("socket shut down"),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
        Err(e) => warn!(error = %e, "failed to shut socket down"),
    }
}

/// Join one stage thread, log how it ended and return how many items it handled.
fn join_stage(name: &'static str, handle: JoinHandle<StageExit>) -> u64 {
    match handle.join() {
        Ok(exit) if exit.is_clean() => {
            info!(stage = exit.stage, processed = exit.processed, "joined stage");
            exit.processed
        }
        Ok(exit) => {
            warn!(
                stage = exit.stage,
                processed = exit.processed,
                reason = %exit.reason,
                "joined stage"
            );
            exit.processed
        }
        Err(_) => {
            error!(stage = name, "stage thread panicked");
            0
        }
    }
}
