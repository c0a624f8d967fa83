use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, info, warn};
use vision_relay_common::frame::{Frame, FrameReader, WireMode};
use vision_relay_common::message::write_message;
use vision_relay_common::queue::{HandoffQueue, Pop};
use vision_relay_common::stop::{StageExit, StopReason, StopToken};

use crate::worker::OutboundResult;

/// Frame reader stage: decode fixed-size frames from the client until it
/// closes the stream.
///
/// A short read or socket error stops the session; a partial frame is never
/// queued. The frame queue is closed on exit so the worker can drain.
pub fn run_frame_reader<R: Read>(
    reader: &mut FrameReader<R>,
    frames: &HandoffQueue<Frame>,
    stop: &StopToken,
) -> StageExit {
    let mut received: u64 = 0;
    debug!("frame reader started");

    let reason = loop {
        if let Some(reason) = stop.reason() {
            break reason;
        }
        match reader.read_frame() {
            Ok(Some(frame)) => {
                debug!(seq = frame.seq, "frame received");
                frames.push(frame);
                received += 1;
            }
            Ok(None) => break stop.reason().unwrap_or(StopReason::EndOfInput),
            Err(e) => {
                if let Some(reason) = stop.reason() {
                    break reason;
                }
                warn!(error = %e, "frame read failed");
                let reason = StopReason::ConnectionFault(e.to_string());
                stop.stop(reason.clone());
                break reason;
            }
        }
    };

    frames.close();
    info!(received, "frame reader finished");
    StageExit::new("reader", reason, received)
}

/// Result writer stage: send each queued result as a length-prefixed JSON
/// message.
///
/// After a write failure the session is stopped, `on_fault` is called once and
/// remaining results are drained without writing, until the worker closes the
/// result queue.
pub fn run_result_writer<W: Write, F: FnOnce()>(
    writer: &mut W,
    mode: WireMode,
    results: &HandoffQueue<OutboundResult>,
    wait: Duration,
    stop: &StopToken,
    on_fault: F,
) -> StageExit {
    let mut written: u64 = 0;
    debug!(mode = ?mode, "result writer started");
    let mut on_fault = Some(on_fault);

    let reason = loop {
        match results.pop_wait(wait) {
            Pop::Item(out) => {
                if on_fault.is_none() {
                    debug!(seq = out.seq, "discarding result after write failure");
                    continue;
                }
                let seq = (mode == WireMode::Sequenced).then_some(out.seq);
                let payload = out.result.to_json_bytes(seq);
                match write_message(writer, &payload) {
                    Ok(()) => {
                        written += 1;
                        debug!(seq = out.seq, bytes = payload.len(), "result sent");
                    }
                    Err(e) => {
                        warn!(seq = out.seq, error = %e, "result write failed");
                        stop.stop(StopReason::ConnectionFault(e.to_string()));
                        if let Some(shutdown) = on_fault.take() {
                            shutdown();
                        }
                    }
                }
            }
            Pop::TimedOut => continue,
            Pop::Closed => break stop.reason().unwrap_or(StopReason::EndOfInput),
        }
    };

    info!(written, "result writer finished");
    StageExit::new("writer", reason, written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;
    use std::io::{self, Cursor};
    use vision_relay_common::analysis::AnalysisResult;
    use vision_relay_common::frame::{FrameCodec, FrameGeometry};
    use vision_relay_common::message::read_message;

    use crate::worker::tests::FIXED;

    fn outbound(seq: u64) -> OutboundResult {
        let (_, result) = AnalysisResult::from_json_slice(FIXED.as_bytes()).unwrap();
        OutboundResult { seq, result }
    }

    #[test]
    fn reader_queues_whole_frames_and_closes() {
        let codec = FrameCodec::new(FrameGeometry::new(4, 4), WireMode::Sequenced);
        let mut wire = Vec::new();
        for seq in [5, 6] {
            codec.write_frame(&mut wire, &Frame::new(RgbImage::new(4, 4), seq, 0)).unwrap();
        }
        let mut reader = FrameReader::new(Cursor::new(wire), codec);
        let frames = HandoffQueue::unbounded();
        let stop = StopToken::new();

        let exit = run_frame_reader(&mut reader, &frames, &stop);
        assert!(exit.is_clean());
        assert!(!stop.is_stopped());
        assert!(frames.is_closed());
        let seqs: Vec<u64> = std::iter::from_fn(|| frames.try_pop()).map(|f| f.seq).collect();
        assert_eq!(seqs, vec![5, 6]);
    }

    #[test]
    fn reader_short_frame_stops_session() {
        let codec = FrameCodec::new(FrameGeometry::new(64, 64), WireMode::Legacy);
        let mut reader = FrameReader::new(Cursor::new(vec![7u8; 100]), codec);
        let frames = HandoffQueue::unbounded();
        let stop = StopToken::new();

        let exit = run_frame_reader(&mut reader, &frames, &stop);
        assert!(matches!(exit.reason, StopReason::ConnectionFault(_)));
        assert!(stop.is_stopped());
        assert!(frames.is_empty(), "partial frame is never queued");
    }

    #[test]
    fn writer_frames_results_with_seq() {
        let results = HandoffQueue::unbounded();
        results.push(outbound(3));
        results.push(outbound(4));
        results.close();
        let mut wire = Vec::new();

        let (wait, stop) = (Duration::from_millis(50), StopToken::new());
        let exit = run_result_writer(&mut wire, WireMode::Sequenced, &results, wait, &stop, || {});
        assert_eq!(exit.processed, 2);

        let mut cursor = Cursor::new(wire);
        let first = read_message(&mut cursor, 1 << 20).unwrap().unwrap();
        let (seq, result) = AnalysisResult::from_json_slice(&first).unwrap();
        assert_eq!(seq, Some(3));
        assert_eq!(result, outbound(3).result);
        let second = read_message(&mut cursor, 1 << 20).unwrap().unwrap();
        assert_eq!(AnalysisResult::from_json_slice(&second).unwrap().0, Some(4));
        assert_eq!(read_message(&mut cursor, 1 << 20).unwrap(), None);
    }

    #[test]
    fn legacy_writer_omits_seq() {
        let results = HandoffQueue::unbounded();
        results.push(outbound(9));
        results.close();
        let mut wire = Vec::new();
        let (wait, stop) = (Duration::from_millis(50), StopToken::new());
        run_result_writer(&mut wire, WireMode::Legacy, &results, wait, &stop, || {});
        let payload = read_message(&mut Cursor::new(wire), 1 << 20).unwrap().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        assert!(json.get("seq").is_none());
        assert_eq!(json["1"]["size_col"], 50);
    }

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_failure_stops_session_and_keeps_draining() {
        let results = HandoffQueue::unbounded();
        for seq in 0..3 {
            results.push(outbound(seq));
        }
        results.close();
        let stop = StopToken::new();
        let mut shutdowns = 0;

        let wait = Duration::from_millis(50);
        let exit = run_result_writer(
            &mut FailingWriter,
            WireMode::Sequenced,
            &results,
            wait,
            &stop,
            || shutdowns += 1,
        );
        assert_eq!(exit.processed, 0);
        assert!(matches!(exit.reason, StopReason::ConnectionFault(_)));
        assert!(results.is_empty(), "remaining results drained");
        assert_eq!(shutdowns, 1);
    }
}
