use std::io::{self, Write};
use std::net::{Shutdown, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use vision_relay_common::frame::{Frame, FrameCodec};
use vision_relay_common::queue::{HandoffQueue, Pop};
use vision_relay_common::stop::{StageExit, StopReason, StopToken};

/// Pacing and wait bounds for the uploader loop.
#[derive(Debug, Clone, Copy)]
pub struct UploadPacing {
    /// How long to wait for the next captured frame.
    pub frame_wait: Duration,
    /// Sleep after each frame written.
    pub interval: Duration,
}

/// Write captured frames to the server, one every `pacing.interval` at most.
///
/// A frame wait that times out ends the stage without stopping the session:
/// results already in flight are still rendered.
pub fn run_uploader<W: Write>(
    socket: &mut W,
    codec: FrameCodec,
    frames: &HandoffQueue<Frame>,
    pacing: UploadPacing,
    stop: &StopToken,
) -> StageExit {
    let mut sent: u64 = 0;
    debug!(mode = ?codec.mode(), "uploader started");

    let reason = loop {
        if let Some(reason) = stop.reason() {
            break reason;
        }
        match frames.pop_wait(pacing.frame_wait) {
            Pop::Item(frame) => {
                if let Err(e) = codec.write_frame(socket, &frame) {
                    let reason = StopReason::ConnectionFault(e.to_string());
                    stop.stop(reason.clone());
                    break reason;
                }
                sent += 1;
                debug!(seq = frame.seq, age_ms = frame.age_ms(), "frame sent");
                if !pacing.interval.is_zero() {
                    thread::sleep(pacing.interval);
                }
            }
            Pop::TimedOut => {
                warn!(
                    wait_ms = pacing.frame_wait.as_millis() as u64,
                    "captured frame did not reach the uplink queue in time"
                );
                break StopReason::Timeout("captured frame");
            }
            Pop::Closed => break StopReason::EndOfInput,
        }
    };

    info!(sent, "uploader finished");
    StageExit::new("uploader", reason, sent)
}

/// Half-close the connection so the server reads a clean end of stream
/// after the last frame.
pub fn finish_upload(socket: &TcpStream) {
    match socket.shutdown(Shutdown::Write) {
        Ok(()) => debug!("uplink half-closed"),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => {}
        Err(e) => warn!(error = %e, "failed to half-close uplink"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::time::Instant;
    use vision_relay_common::frame::{FrameGeometry, WireMode};

    fn pacing(wait_ms: u64) -> UploadPacing {
        UploadPacing {
            frame_wait: Duration::from_millis(wait_ms),
            interval: Duration::ZERO,
        }
    }

    #[test]
    fn writes_queued_frames_until_closed() {
        let geometry = FrameGeometry::new(4, 2);
        let codec = FrameCodec::new(geometry, WireMode::Sequenced);
        let frames = HandoffQueue::unbounded();
        for seq in 0..3 {
            frames.push(Frame::new(RgbImage::new(4, 2), seq, 0));
        }
        frames.close();

        let mut wire = Vec::new();
        let exit = run_uploader(&mut wire, codec, &frames, pacing(100), &StopToken::new());
        assert!(exit.is_clean());
        assert_eq!(exit.processed, 3);
        assert_eq!(wire.len(), 3 * codec.message_size());
        assert_eq!(&wire[codec.message_size()..codec.message_size() + 8], &1u64.to_be_bytes());
    }

    #[test]
    fn exits_after_frame_wait_timeout() {
        let codec = FrameCodec::new(FrameGeometry::new(4, 2), WireMode::Legacy);
        let frames = HandoffQueue::unbounded();
        let stop = StopToken::new();
        let start = Instant::now();
        let exit = run_uploader(&mut Vec::new(), codec, &frames, pacing(30), &stop);
        assert_eq!(exit.reason, StopReason::Timeout("captured frame"));
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(!stop.is_stopped(), "a stalled capture does not stop the session");
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer gone"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failure_stops_the_session() {
        let codec = FrameCodec::new(FrameGeometry::new(4, 2), WireMode::Legacy);
        let frames = HandoffQueue::unbounded();
        frames.push(Frame::new(RgbImage::new(4, 2), 0, 0));
        let stop = StopToken::new();
        let exit = run_uploader(&mut BrokenPipe, codec, &frames, pacing(100), &stop);
        assert!(matches!(exit.reason, StopReason::ConnectionFault(_)));
        assert!(stop.is_stopped());
    }
}
