use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{error, info, warn};
use vision_relay_common::engine::SharedEngine;

use crate::session::{peer_label, run_session, SessionReport, SessionSettings};

/// Accepts connections and gives each its own session.
///
/// Every session runs on a coordinator thread of its own, so the accept loop
/// never waits on a slow client.
pub struct Acceptor {
    listener: TcpListener,
    engine: SharedEngine,
    settings: SessionSettings,
    active: Arc<AtomicUsize>,
    next_id: AtomicU64,
}

/// Decrements the active-session count when the coordinator thread ends.
struct ActiveGuard(Arc<AtomicUsize>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Acceptor {
    pub fn bind(addr: &str, engine: SharedEngine, settings: SessionSettings) -> io::Result<Self> {
        let listener = TcpListener::bind(addr)?;
        Ok(Self {
            listener,
            engine,
            settings,
            active: Arc::new(AtomicUsize::new(0)),
            next_id: AtomicU64::new(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn active_sessions(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Accept connections forever. Accept errors are logged and skipped.
    pub fn serve(&self) {
        info!(addr = ?self.local_addr().ok(), engine = self.engine.name(), "accepting connections");
        for stream in self.listener.incoming() {
            match stream {
                Ok(socket) => {
                    if let Err(e) = self.spawn_session(socket) {
                        error!(error = %e, "failed to start session");
                    }
                }
                Err(e) => warn!(error = %e, "accept failed"),
            }
        }
    }

    /// Start a session for `socket` on its own coordinator thread.
    pub fn spawn_session(&self, socket: TcpStream) -> io::Result<JoinHandle<SessionReport>> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let peer = peer_label(socket.peer_addr().ok());
        let engine = self.engine.clone();
        let settings = self.settings;

        self.active.fetch_add(1, Ordering::SeqCst);
        let guard = ActiveGuard(Arc::clone(&self.active));
        let handle = thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || {
                let _guard = guard;
                run_session(id, socket, engine, settings)
            })?;

        info!(session = id, peer, active = self.active_sessions(), "new client");
        Ok(handle)
    }
}
