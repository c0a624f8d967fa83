use image::RgbImage;
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdout, Command, Stdio};
use tracing::{debug, info, warn};
use vision_relay_common::frame::{read_full, Frame, FrameGeometry};
use vision_relay_common::queue::HandoffQueue;
use vision_relay_common::stop::{StageExit, StopReason, StopToken};

const CAMERA_DEVICE_PREFIX: &str = "/dev/video";

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("capture source not found: {0}")]
    NotFound(String),
    #[error("failed to list image directory {0}: {1}")]
    ListDir(String, std::io::Error),
    #[error("no images in {0}")]
    EmptyDir(String),
    #[error("failed to decode {0}: {1}")]
    Decode(String, image::ImageError),
    #[error("failed to spawn ffmpeg: {0}")]
    Spawn(String),
    #[error("ffmpeg produced no frames for {0}")]
    NoFrames(String),
    #[error("ffmpeg stream ended mid-frame: got {got} of {expected} bytes")]
    Truncated { got: usize, expected: usize },
    #[error("failed to read from ffmpeg: {0}")]
    Read(#[from] std::io::Error),
}

/// Where captured images come from.
pub trait FrameSource: Send {
    /// The next image, or `None` once the source is exhausted.
    fn next_frame(&mut self) -> Result<Option<RgbImage>, CaptureError>;

    /// Number of frames the source will yield, `None` when unbounded or unknown.
    fn frame_count(&self) -> Option<u64>;
}

/// Open `source` as a directory of still images or, failing that, as anything
/// ffmpeg can decode.
pub fn open_source(
    source: &str,
    geometry: FrameGeometry,
) -> Result<Box<dyn FrameSource>, CaptureError> {
    let path = Path::new(source);
    if path.is_dir() {
        return Ok(Box::new(ImageDirSource::open(path)?));
    }
    Ok(Box::new(FfmpegSource::open(source, geometry)?))
}

/// Still images in a directory, taken in path order.
pub struct ImageDirSource {
    paths: Vec<PathBuf>,
    next: usize,
}

impl ImageDirSource {
    pub fn open(dir: &Path) -> Result<Self, CaptureError> {
        let entries = std::fs::read_dir(dir)
            .map_err(|e| CaptureError::ListDir(dir.display().to_string(), e))?;
        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file() && image::ImageFormat::from_path(p).is_ok())
            .collect();
        if paths.is_empty() {
            return Err(CaptureError::EmptyDir(dir.display().to_string()));
        }
        paths.sort();
        debug!(dir = %dir.display(), images = paths.len(), "opened image directory");
        Ok(Self { paths, next: 0 })
    }
}

impl FrameSource for ImageDirSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        let Some(path) = self.paths.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;
        let image = image::open(path)
            .map_err(|e| CaptureError::Decode(path.display().to_string(), e))?;
        Ok(Some(image.to_rgb8()))
    }

    fn frame_count(&self) -> Option<u64> {
        Some(self.paths.len() as u64)
    }
}

/// A video file or camera device decoded by an `ffmpeg` child process that
/// writes raw RGB24 frames, already scaled to the agreed size, to its stdout.
pub struct FfmpegSource {
    child: Child,
    stdout: ChildStdout,
    geometry: FrameGeometry,
    frame_count: Option<u64>,
    pending: Option<RgbImage>,
}

impl FfmpegSource {
    /// Spawn ffmpeg and read the first frame, so a source that cannot be
    /// decoded fails here rather than mid-pipeline.
    pub fn open(source: &str, geometry: FrameGeometry) -> Result<Self, CaptureError> {
        let is_device = source.starts_with(CAMERA_DEVICE_PREFIX);
        if !source.contains("://") && !Path::new(source).exists() {
            return Err(CaptureError::NotFound(source.to_string()));
        }

        let scale = format!("scale={}:{}", geometry.width, geometry.height);
        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-hide_banner", "-loglevel", "error", "-nostdin"]);
        if is_device {
            cmd.args(["-f", "v4l2"]);
        }
        cmd.args(["-i", source, "-vf", &scale])
            .args(["-f", "rawvideo", "-pix_fmt", "rgb24", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| CaptureError::Spawn(e.to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Spawn("could not get stdout handle".into()))?;

        let frame_count = if is_device { None } else { probe_frame_count(source) };
        let mut capture = Self {
            child,
            stdout,
            geometry,
            frame_count,
            pending: None,
        };
        match capture.read_frame()? {
            Some(first) => capture.pending = Some(first),
            None => return Err(CaptureError::NoFrames(source.to_string())),
        }

        info!(source, device = is_device, frame_count = ?frame_count, "ffmpeg capture opened");
        Ok(capture)
    }

    fn read_frame(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        let expected = self.geometry.pixel_bytes();
        let mut buf = vec![0u8; expected];
        let got = read_full(&mut self.stdout, &mut buf)?;
        if got == 0 {
            return Ok(None);
        }
        if got < expected {
            return Err(CaptureError::Truncated { got, expected });
        }
        Ok(RgbImage::from_raw(self.geometry.width, self.geometry.height, buf))
    }
}

impl FrameSource for FfmpegSource {
    fn next_frame(&mut self) -> Result<Option<RgbImage>, CaptureError> {
        if let Some(first) = self.pending.take() {
            return Ok(Some(first));
        }
        self.read_frame()
    }

    fn frame_count(&self) -> Option<u64> {
        self.frame_count
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        // A live device never ends on its own.
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Ask ffprobe how many video frames `source` holds.
fn probe_frame_count(source: &str) -> Option<u64> {
    let output = Command::new("ffprobe")
        .args(["-v", "error", "-select_streams", "v:0", "-count_packets"])
        .args(["-show_entries", "stream=nb_read_packets", "-of", "csv=p=0"])
        .arg(source)
        .stdin(Stdio::null())
        .stderr(Stdio::null())
        .output();
    match output {
        Ok(out) if out.status.success() => {
            let count = String::from_utf8_lossy(&out.stdout).trim().parse::<u64>().ok();
            count.filter(|&n| n > 0)
        }
        Ok(_) => None,
        Err(e) => {
            warn!(error = %e, "ffprobe not available; frame count unknown");
            None
        }
    }
}

/// Capture stage: pull images from `source`, fit them to `geometry`, number
/// them and hand the same frame to both the uplink and the retained queue.
///
/// Both queues are closed on exit so their consumers can drain and finish.
pub fn run_capture(
    source: &mut dyn FrameSource,
    geometry: FrameGeometry,
    uplink: &HandoffQueue<Frame>,
    retained: &HandoffQueue<Frame>,
    stop: &StopToken,
) -> StageExit {
    let limit = source.frame_count();
    let mut seq: u64 = 0;
    debug!(frame_count = ?limit, "capture started");

    let reason = loop {
        if let Some(reason) = stop.reason() {
            break reason;
        }
        if limit.is_some_and(|n| seq >= n) {
            break StopReason::EndOfInput;
        }
        match source.next_frame() {
            Ok(Some(image)) => {
                let frame = Frame::captured_now(image, seq).fit_to(geometry);
                if let Some(dropped) = uplink.push(frame.clone()) {
                    warn!(seq = dropped.seq, "uplink queue full, dropped oldest frame");
                }
                if let Some(dropped) = retained.push(frame) {
                    warn!(seq = dropped.seq, "retained queue full, dropped oldest frame");
                }
                seq += 1;
                if seq % 100 == 0 {
                    debug!(frames = seq, "frames captured");
                }
            }
            Ok(None) => break StopReason::EndOfInput,
            Err(e) => break StopReason::CaptureFault(e.to_string()),
        }
    };

    uplink.close();
    retained.close();
    StageExit::new("capture", reason, seq)
}
