use std::io::Read;
use tracing::{debug, info};
use vision_relay_common::analysis::AnalysisResult;
use vision_relay_common::frame::WireMode;
use vision_relay_common::message::{read_message, MessageError};
use vision_relay_common::queue::HandoffQueue;
use vision_relay_common::stop::{StageExit, StopReason, StopToken};

/// One decoded result message.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundResult {
    /// Sequence number of the frame it belongs to, when the protocol carries one.
    pub seq: Option<u64>,
    pub result: AnalysisResult,
}

/// Result reader stage: decode length-prefixed JSON results from `socket`
/// until the server closes the stream.
///
/// A malformed message ends the session since the stream cannot be
/// resynchronized. The result queue is closed on exit.
pub fn run_receiver<R: Read>(
    socket: &mut R,
    mode: WireMode,
    max_message_bytes: u64,
    results: &HandoffQueue<InboundResult>,
    stop: &StopToken,
) -> StageExit {
    let mut received: u64 = 0;
    debug!(mode = ?mode, "result reader started");

    let reason = loop {
        let payload = match read_message(socket, max_message_bytes) {
            Ok(Some(payload)) => payload,
            Ok(None) => break stop.reason().unwrap_or(StopReason::EndOfInput),
            Err(e) => {
                // Reads fail once a sibling stage has shut the socket down.
                if let Some(reason) = stop.reason() {
                    break reason;
                }
                let reason = match e {
                    MessageError::TooLarge { .. } => StopReason::ProtocolFault(e.to_string()),
                    _ => StopReason::ConnectionFault(e.to_string()),
                };
                stop.stop(reason.clone());
                break reason;
            }
        };

        let inbound = match decode(&payload, mode) {
            Ok(inbound) => inbound,
            Err(reason) => {
                stop.stop(reason.clone());
                break reason;
            }
        };
        debug!(seq = ?inbound.seq, items = inbound.result.len(), "result received");
        results.push(inbound);
        received += 1;
    };

    results.close();
    info!(received, "result reader finished");
    StageExit::new("result reader", reason, received)
}

fn decode(payload: &[u8], mode: WireMode) -> Result<InboundResult, StopReason> {
    let (seq, result) = AnalysisResult::from_json_slice(payload)
        .map_err(|e| StopReason::ProtocolFault(e.to_string()))?;
    if mode == WireMode::Sequenced && seq.is_none() {
        return Err(StopReason::ProtocolFault("result carries no seq".into()));
    }
    Ok(InboundResult { seq, result })
}
