use image::RgbImage;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use vision_relay_common::analysis::AnalysisResult;
use vision_relay_common::frame::{Frame, WireMode};
use vision_relay_common::overlay::draw_result;
use vision_relay_common::queue::{HandoffQueue, Pop};
use vision_relay_common::stop::{StageExit, StopReason, StopToken};

use crate::receiver::InboundResult;

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    #[error("failed to create output directory {0}: {1}")]
    CreateDir(String, std::io::Error),
    #[error("failed to write {0}: {1}")]
    Write(String, image::ImageError),
}

/// Where rendered frames go.
pub trait FrameSink: Send {
    fn show(
        &mut self,
        seq: u64,
        image: &RgbImage,
        result: &AnalysisResult,
    ) -> Result<(), SinkError>;
}

/// Headless sink: one log line per detection or pose.
pub struct LogSink;

impl FrameSink for LogSink {
    fn show(
        &mut self,
        seq: u64,
        _image: &RgbImage,
        result: &AnalysisResult,
    ) -> Result<(), SinkError> {
        match result {
            AnalysisResult::Detections(d) => {
                for (i, r) in d.rects.iter().enumerate() {
                    info!(
                        seq,
                        "Face {}: x={} y={} width={} height={}",
                        i + 1,
                        r.x,
                        r.y,
                        r.width,
                        r.height
                    );
                }
            }
            AnalysisResult::Poses(p) => {
                for (i, pose) in p.poses.iter().enumerate() {
                    let mut line = String::new();
                    for (n, k) in pose.keypoints.iter().enumerate() {
                        let _ = write!(
                            line,
                            "({})type = {}, x = {}, y = {} ",
                            n + 1,
                            k.kind,
                            k.x,
                            k.y
                        );
                    }
                    info!(seq, "Pose {}: {}", i + 1, line.trim_end());
                }
            }
        }
        if result.is_empty() {
            debug!(seq, "nothing detected");
        }
        Ok(())
    }
}

/// Writes each rendered frame as `frame_{seq:06}.png`.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: &Path) -> Result<Self, SinkError> {
        std::fs::create_dir_all(dir)
            .map_err(|e| SinkError::CreateDir(dir.display().to_string(), e))?;
        Ok(Self { dir: dir.to_path_buf() })
    }
}

impl FrameSink for DirectorySink {
    fn show(
        &mut self,
        seq: u64,
        image: &RgbImage,
        _result: &AnalysisResult,
    ) -> Result<(), SinkError> {
        let path = self.dir.join(format!("frame_{seq:06}.png"));
        image
            .save(&path)
            .map_err(|e| SinkError::Write(path.display().to_string(), e))
    }
}

/// Fans each rendered frame out to several sinks.
pub struct Sinks(pub Vec<Box<dyn FrameSink>>);

impl FrameSink for Sinks {
    fn show(
        &mut self,
        seq: u64,
        image: &RgbImage,
        result: &AnalysisResult,
    ) -> Result<(), SinkError> {
        for sink in &mut self.0 {
            sink.show(seq, image, result)?;
        }
        Ok(())
    }
}

/// Wait bounds for the renderer loop.
#[derive(Debug, Clone, Copy)]
pub struct RenderWaits {
    pub result: Duration,
    pub frame: Duration,
}

enum Pairing {
    Matched(Frame),
    /// The frame for this result was dropped before it could be paired.
    Missing,
}

/// Pairs results with retained frames and hands overlays to a sink.
pub struct Renderer<'a, S: FrameSink + ?Sized> {
    mode: WireMode,
    waits: RenderWaits,
    results: &'a HandoffQueue<InboundResult>,
    retained: &'a HandoffQueue<Frame>,
    sink: &'a mut S,
    stop: &'a StopToken,
    held: Option<Frame>,
}

impl<'a, S: FrameSink + ?Sized> Renderer<'a, S> {
    pub fn new(
        mode: WireMode,
        waits: RenderWaits,
        results: &'a HandoffQueue<InboundResult>,
        retained: &'a HandoffQueue<Frame>,
        sink: &'a mut S,
        stop: &'a StopToken,
    ) -> Self {
        Self {
            mode,
            waits,
            results,
            retained,
            sink,
            stop,
            held: None,
        }
    }

    /// Run until the result stream ends or a wait times out. A timeout stops
    /// the whole pipeline.
    pub fn run(mut self) -> StageExit {
        let mut rendered: u64 = 0;
        debug!(mode = ?self.mode, "renderer started");

        let reason = loop {
            let inbound = match self.results.pop_wait(self.waits.result) {
                Pop::Item(inbound) => inbound,
                Pop::Closed => break self.stop.reason().unwrap_or(StopReason::EndOfInput),
                Pop::TimedOut => {
                    let wait_ms = self.waits.result.as_millis() as u64;
                    warn!(wait_ms, "result did not arrive in time");
                    break self.timed_out("result");
                }
            };

            let frame = match self.pair(inbound.seq) {
                Ok(Pairing::Matched(frame)) => frame,
                Ok(Pairing::Missing) => {
                    warn!(seq = ?inbound.seq, "frame for result was dropped, skipping");
                    continue;
                }
                Err(reason) => break reason,
            };

            let seq = frame.seq;
            let mut canvas = frame.into_image();
            let stats = draw_result(&mut canvas, &inbound.result);
            debug!(
                seq,
                rects = stats.rects,
                keypoints = stats.keypoints,
                limbs = stats.limbs,
                "overlay drawn"
            );
            if let Err(e) = self.sink.show(seq, &canvas, &inbound.result) {
                warn!(seq, error = %e, "failed to show frame");
            }
            rendered += 1;
        };

        info!(rendered, "renderer finished");
        StageExit::new("renderer", reason, rendered)
    }

    /// Find the retained frame that `seq` was computed on. Without a sequence
    /// number the next retained frame is taken.
    fn pair(&mut self, seq: Option<u64>) -> Result<Pairing, StopReason> {
        loop {
            let frame = match self.held.take() {
                Some(frame) => frame,
                None => self.next_retained()?,
            };
            let Some(want) = seq.filter(|_| self.mode == WireMode::Sequenced) else {
                return Ok(Pairing::Matched(frame));
            };
            if frame.seq == want {
                return Ok(Pairing::Matched(frame));
            }
            if frame.seq > want {
                self.held = Some(frame);
                return Ok(Pairing::Missing);
            }
            debug!(seq = frame.seq, "no result for retained frame, discarding");
        }
    }

    fn next_retained(&self) -> Result<Frame, StopReason> {
        match self.retained.pop_wait(self.waits.frame) {
            Pop::Item(frame) => Ok(frame),
            Pop::Closed => {
                warn!("result arrived with no retained frame left");
                Err(self.stop.reason().unwrap_or(StopReason::EndOfInput))
            }
            Pop::TimedOut => {
                let wait_ms = self.waits.frame.as_millis() as u64;
                warn!(wait_ms, "retained frame did not arrive in time");
                Err(self.timed_out("retained frame"))
            }
        }
    }

    fn timed_out(&self, what: &'static str) -> StopReason {
        let reason = StopReason::Timeout(what);
        self.stop.stop(reason.clone());
        reason
    }
}
