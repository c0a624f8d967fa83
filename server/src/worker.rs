use std::time::Duration;
use tracing::{debug, info, warn};
use vision_relay_common::analysis::AnalysisResult;
use vision_relay_common::engine::SharedEngine;
use vision_relay_common::frame::Frame;
use vision_relay_common::queue::{HandoffQueue, Pop};
use vision_relay_common::stop::{StageExit, StopReason, StopToken};

/// A result waiting to be written back, tagged with its frame's sequence number.
#[derive(Debug, Clone)]
pub struct OutboundResult {
    pub seq: u64,
    pub result: AnalysisResult,
}

/// Inference worker stage.
///
/// Pops frames, runs the shared engine on each and queues one result per
/// frame. An engine failure yields an empty result so frames and results stay
/// one to one. Idle waits simply loop until the session stops or the frame
/// queue is closed. The result queue is closed on exit.
pub fn run_worker(
    engine: &SharedEngine,
    frames: &HandoffQueue<Frame>,
    results: &HandoffQueue<OutboundResult>,
    wait: Duration,
    stop: &StopToken,
) -> StageExit {
    let mut processed: u64 = 0;
    debug!(engine = engine.name(), "inference worker started");

    let reason = loop {
        let frame = match frames.pop_wait(wait) {
            Pop::Item(frame) => frame,
            Pop::Closed => break stop.reason().unwrap_or(StopReason::EndOfInput),
            Pop::TimedOut => match stop.reason() {
                Some(reason) => break reason,
                None => {
                    debug!("no frame yet");
                    continue;
                }
            },
        };
        if let Some(reason) = stop.reason() {
            break reason;
        }

        let (width, height) = frame.image().dimensions();
        let result = match engine.analyze(frame.image()) {
            Ok(result) => result,
            Err(e) => {
                warn!(seq = frame.seq, error = %e, "inference failed, sending empty result");
                AnalysisResult::empty(engine.task(), width, height)
            }
        };
        debug!(seq = frame.seq, items = result.len(), age_ms = frame.age_ms(), "frame analyzed");
        results.push(OutboundResult {
            seq: frame.seq,
            result,
        });
        processed += 1;
    };

    results.close();
    info!(processed, "inference worker finished");
    StageExit::new("worker", reason, processed)
}
