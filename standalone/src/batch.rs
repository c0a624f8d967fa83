use image::RgbImage;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};
use vision_relay_common::analysis::AnalysisResult;
use vision_relay_common::engine::SharedEngine;
use vision_relay_common::overlay::draw_result;
use vision_relay_common::queue::{HandoffQueue, Pop};
use vision_relay_common::stop::{StageExit, StopReason};

use crate::StandaloneError;

const STAGE_WAIT: Duration = Duration::from_millis(500);

struct Loaded {
    index: u64,
    path: PathBuf,
    image: RgbImage,
}

struct Analyzed {
    loaded: Loaded,
    result: AnalysisResult,
}

/// Counts from one batch run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BatchSummary {
    pub images: u64,
    pub analyzed: u64,
    pub reported: u64,
}

/// Every regular file in `dir`, in path order.
pub fn list_images(dir: &Path) -> Result<Vec<PathBuf>, StandaloneError> {
    let entries = std::fs::read_dir(dir)
        .map_err(|e| StandaloneError::ListDir(dir.display().to_string(), e))?;
    let mut paths: Vec<PathBuf> = entries
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file())
        .collect();
    paths.sort();
    Ok(paths)
}

/// One report line for the `index`-th image (1-based).
pub fn report_line(index: u64, result: &AnalysisResult) -> String {
    let mut line = format!("frame {index}:");
    match result {
        AnalysisResult::Detections(d) => {
            let rects: Vec<String> = d
                .rects
                .iter()
                .map(|r| {
                    format!(
                        "x = {}, y = {}, size_col = {}, size_row = {}",
                        r.x, r.y, r.width, r.height
                    )
                })
                .collect();
            if !rects.is_empty() {
                line.push(' ');
                line.push_str(&rects.join("; "));
            }
        }
        AnalysisResult::Poses(p) => {
            for pose in &p.poses {
                let points: Vec<String> = pose
                    .keypoints
                    .iter()
                    .enumerate()
                    .map(|(n, k)| format!("({})type = {}, x = {}, y = {}", n + 1, k.kind, k.x, k.y))
                    .collect();
                line.push('\n');
                line.push_str(&points.join(" "));
            }
        }
    }
    line
}

/// Analyze every image in `dir` with a reader, an inference worker and a
/// reporter thread joined by hand-off queues.
///
/// Report lines go to `out` in directory order. With `overlay_dir` set each
/// annotated image is also saved there.
pub fn run<W: Write + Send>(
    engine: &SharedEngine,
    dir: &Path,
    overlay_dir: Option<&Path>,
    out: &mut W,
) -> Result<BatchSummary, StandaloneError> {
    let paths = list_images(dir)?;
    if let Some(overlay_dir) = overlay_dir {
        std::fs::create_dir_all(overlay_dir)
            .map_err(|e| StandaloneError::Write(overlay_dir.display().to_string(), e))?;
    }
    info!(dir = %dir.display(), images = paths.len(), "starting batch");

    let loaded = HandoffQueue::unbounded();
    let analyzed = HandoffQueue::unbounded();

    thread::scope(|scope| {
        let reader = thread::Builder::new()
            .name("reader".into())
            .spawn_scoped(scope, || read_images(&paths, &loaded))
            .map_err(|e| StandaloneError::Spawn("reader", e))?;
        let worker = match thread::Builder::new()
            .name("inference".into())
            .spawn_scoped(scope, || analyze_images(engine, &loaded, &analyzed))
        {
            Ok(handle) => handle,
            Err(e) => {
                loaded.close();
                analyzed.close();
                return Err(StandaloneError::Spawn("inference", e));
            }
        };
        let reporter = match thread::Builder::new()
            .name("reporter".into())
            .spawn_scoped(scope, || report(&analyzed, overlay_dir, out))
        {
            Ok(handle) => handle,
            Err(e) => {
                analyzed.close();
                return Err(StandaloneError::Spawn("reporter", e));
            }
        };

        Ok(BatchSummary {
            images: joined(reader.join()),
            analyzed: joined(worker.join()),
            reported: joined(reporter.join()),
        })
    })
}

fn joined(outcome: thread::Result<StageExit>) -> u64 {
    match outcome {
        Ok(exit) => {
            debug!(
                stage = exit.stage,
                processed = exit.processed,
                reason = %exit.reason,
                "stage joined"
            );
            exit.processed
        }
        Err(_) => {
            warn!("stage thread panicked");
            0
        }
    }
}

fn read_images(paths: &[PathBuf], loaded: &HandoffQueue<Loaded>) -> StageExit {
    let mut index = 0;
    for path in paths {
        match image::open(path) {
            Ok(image) => {
                index += 1;
                loaded.push(Loaded {
                    index,
                    path: path.clone(),
                    image: image.to_rgb8(),
                });
            }
            Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable image"),
        }
    }
    loaded.close();
    StageExit::new("reader", StopReason::EndOfInput, index)
}

fn analyze_images(
    engine: &SharedEngine,
    loaded: &HandoffQueue<Loaded>,
    analyzed: &HandoffQueue<Analyzed>,
) -> StageExit {
    let mut processed = 0;
    loop {
        match loaded.pop_wait(STAGE_WAIT) {
            Pop::Item(item) => {
                let result = match engine.analyze(&item.image) {
                    Ok(result) => result,
                    Err(e) => {
                        warn!(path = %item.path.display(), error = %e, "inference failed");
                        let (w, h) = item.image.dimensions();
                        AnalysisResult::empty(engine.task(), w, h)
                    }
                };
                analyzed.push(Analyzed {
                    loaded: item,
                    result,
                });
                processed += 1;
            }
            Pop::TimedOut => continue,
            Pop::Closed => break,
        }
    }
    analyzed.close();
    StageExit::new("inference", StopReason::EndOfInput, processed)
}

fn report<W: Write>(
    analyzed: &HandoffQueue<Analyzed>,
    overlay_dir: Option<&Path>,
    out: &mut W,
) -> StageExit {
    let mut reported = 0;
    let reason = loop {
        let Analyzed { loaded, result } = match analyzed.pop_wait(STAGE_WAIT) {
            Pop::Item(item) => item,
            Pop::TimedOut => continue,
            Pop::Closed => break StopReason::EndOfInput,
        };
        if let Err(e) = writeln!(out, "{}", report_line(loaded.index, &result)) {
            break StopReason::ConnectionFault(e.to_string());
        }
        if let Some(dir) = overlay_dir {
            let mut canvas = loaded.image;
            draw_result(&mut canvas, &result);
            let path = dir.join(format!("frame_{:06}.png", loaded.index));
            if let Err(e) = canvas.save(&path) {
                let error = StandaloneError::Overlay(path.display().to_string(), e);
                warn!(error = %error, "overlay not saved");
            }
        }
        reported += 1;
    };
    StageExit::new("reporter", reason, reported)
}
