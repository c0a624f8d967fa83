use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};
use vision_relay_common::config::Config;
use vision_relay_common::engine::SharedEngine;
use vision_relay_common::frame::{FrameCodec, FrameGeometry, FrameReader, WireMode};
use vision_relay_common::queue::HandoffQueue;
use vision_relay_common::stop::{StageExit, StopReason, StopToken};

use crate::transport::{run_frame_reader, run_result_writer};
use crate::worker::run_worker;

/// Lifecycle of one accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Accepted,
    /// Reader, worker and writer are running.
    Active,
    /// A stage has finished or failed; the rest are draining.
    Stopping,
    /// Every stage thread has exited.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SessionState::Accepted => "ACCEPTED",
            SessionState::Active => "ACTIVE",
            SessionState::Stopping => "STOPPING",
            SessionState::Terminated => "TERMINATED",
        })
    }
}

/// Per-session settings derived from the server configuration.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub geometry: FrameGeometry,
    pub mode: WireMode,
    pub queue_timeout: Duration,
}

impl SessionSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            geometry: config.geometry(),
            mode: WireMode::from_sequenced(config.protocol.sequenced),
            queue_timeout: config.server.queue_timeout(),
        }
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionReport {
    pub id: u64,
    pub frames_received: u64,
    pub frames_analyzed: u64,
    pub results_sent: u64,
    /// Set when a stage stopped the session rather than the client closing it.
    pub stop_reason: Option<StopReason>,
}

/// Run one session to completion on the calling thread.
///
/// Spawns the reader, worker and writer stages, joins them and closes the
/// socket. Meant to run on a dedicated coordinator thread per connection.
pub fn run_session(
    id: u64,
    socket: TcpStream,
    engine: SharedEngine,
    settings: SessionSettings,
) -> SessionReport {
    let peer = peer_label(socket.peer_addr().ok());
    log_state(id, &peer, SessionState::Accepted);
    if let Err(e) = socket.set_nodelay(true) {
        debug!(session = id, error = %e, "could not disable Nagle");
    }

    let stop = StopToken::new();
    let mut report = SessionReport {
        id,
        frames_received: 0,
        frames_analyzed: 0,
        results_sent: 0,
        stop_reason: None,
    };

    let stages = match spawn_stages(id, &socket, engine, settings, &stop) {
        Ok(stages) => stages,
        Err(e) => {
            error!(session = id, peer, error = %e, "failed to start session stages");
            stop.stop(StopReason::ConnectionFault(e.to_string()));
            shutdown(&socket);
            report.stop_reason = stop.reason();
            log_state(id, &peer, SessionState::Terminated);
            return report;
        }
    };
    log_state(id, &peer, SessionState::Active);

    report.frames_received = join_stage(id, stages.reader);
    log_state(id, &peer, SessionState::Stopping);
    report.frames_analyzed = join_stage(id, stages.worker);
    report.results_sent = join_stage(id, stages.writer);

    shutdown(&socket);
    report.stop_reason = stop.reason();
    info!(
        session = report.id,
        peer,
        state = %SessionState::Terminated,
        frames = report.frames_received,
        analyzed = report.frames_analyzed,
        results = report.results_sent,
        reason = ?report.stop_reason,
        "connection is now fully closed"
    );
    report
}

struct Stages {
    reader: JoinHandle<StageExit>,
    worker: JoinHandle<StageExit>,
    writer: JoinHandle<StageExit>,
}

fn spawn_stages(
    id: u64,
    socket: &TcpStream,
    engine: SharedEngine,
    settings: SessionSettings,
    stop: &StopToken,
) -> io::Result<Stages> {
    let codec = FrameCodec::new(settings.geometry, settings.mode);
    let frames = HandoffQueue::unbounded();
    let results = HandoffQueue::unbounded();
    let read_half = socket.try_clone()?;
    let mut write_half = socket.try_clone()?;
    let control = Arc::new(socket.try_clone()?);

    // Consumers start first; a failed spawn closes the queue feeding the ones already running.
    let writer = {
        let (results, stop) = (results.clone(), stop.clone());
        thread::Builder::new()
            .name(format!("session-{id}-writer"))
            .spawn(move || {
                let (mode, wait) = (settings.mode, settings.queue_timeout);
                run_result_writer(&mut write_half, mode, &results, wait, &stop, || {
                    shutdown(&control)
                })
            })?
    };

    let worker = {
        let (frames_in, results_out, stop) = (frames.clone(), results.clone(), stop.clone());
        let spawned = thread::Builder::new()
            .name(format!("session-{id}-worker"))
            .spawn(move || {
                run_worker(&engine, &frames_in, &results_out, settings.queue_timeout, &stop)
            });
        match spawned {
            Ok(handle) => handle,
            Err(e) => {
                results.close();
                return Err(e);
            }
        }
    };

    let reader = {
        let (frames_in, stop) = (frames.clone(), stop.clone());
        let spawned = thread::Builder::new()
            .name(format!("session-{id}-reader"))
            .spawn(move || {
                let mut reader = FrameReader::new(read_half, codec);
                run_frame_reader(&mut reader, &frames_in, &stop)
            });
        match spawned {
            Ok(handle) => handle,
            Err(e) => {
                frames.close();
                return Err(e);
            }
        }
    };

    Ok(Stages {
        reader,
        worker,
        writer,
    })
}

fn join_stage(id: u64, handle: JoinHandle<StageExit>) -> u64 {
    match handle.join() {
        Ok(exit) if exit.is_clean() => {
            debug!(session = id, stage = exit.stage, processed = exit.processed, "stage exited");
            exit.processed
        }
        Ok(exit) => {
            warn!(
                session = id,
                stage = exit.stage,
                processed = exit.processed,
                reason = %exit.reason,
                "stage exited"
            );
            exit.processed
        }
        Err(_) => {
            error!(session = id, "stage thread panicked");
            0
        }
    }
}

fn log_state(id: u64, peer: &str, state: SessionState) {
    info!(session = id, peer, state = %state, "session state");
}

fn shutdown(socket: &TcpStream) {
    match socket.shutdown(Shutdown::Both) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
        Err(e) => debug!(error = %e, "socket shutdown failed"),
    }
}

pub fn peer_label(addr: Option<SocketAddr>) -> String {
    addr.map(|a| a.to_string()).unwrap_or_else(|| "unknown".into())
}
