use image::{GrayImage, Luma, RgbImage};
use imageproc::region_labelling::{connected_components, Connectivity};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info};

use crate::analysis::{AnalysisResult, DetectionSet, Rect, SchemaError, Task};
use crate::frame::{resize_image, FrameGeometry};

/// A model that turns one image into one analysis result.
///
/// Implementations are not assumed to be re-entrant; wrap them in a
/// [`SharedEngine`] to share one instance between sessions.
pub trait InferenceEngine: Send {
    fn infer(&mut self, image: &RgbImage) -> Result<AnalysisResult, InferenceError>;

    /// What kind of result this engine produces.
    fn task(&self) -> Task;

    /// Input dimensions the model expects, if it has fixed ones.
    fn input_size(&self) -> Option<FrameGeometry> {
        None
    }

    /// Human-readable name for logging.
    fn name(&self) -> &str {
        "unnamed"
    }
}

/// The single process-wide engine instance, shared by every session.
///
/// Calls are serialized on one mutex regardless of how many connections are
/// active: throughput is bounded by the one engine.
#[derive(Clone)]
pub struct SharedEngine {
    engine: Arc<Mutex<Box<dyn InferenceEngine>>>,
    task: Task,
    input_size: Option<FrameGeometry>,
    name: Arc<str>,
}

impl SharedEngine {
    pub fn new<E: InferenceEngine + 'static>(engine: E) -> Self {
        let task = engine.task();
        let input_size = engine.input_size();
        let name: Arc<str> = Arc::from(engine.name());
        Self {
            engine: Arc::new(Mutex::new(Box::new(engine))),
            task,
            input_size,
            name,
        }
    }

    pub fn task(&self) -> Task {
        self.task
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the engine on `image`.
    ///
    /// The image is resized to the model's input size first when it differs,
    /// and the result is mapped back to `image` coordinates. Only the engine
    /// call itself holds the lock.
    pub fn analyze(&self, image: &RgbImage) -> Result<AnalysisResult, InferenceError> {
        let (width, height) = image.dimensions();
        let resized;
        let input = match self.input_size {
            Some(size) if size != FrameGeometry::new(width, height) => {
                resized = resize_image(image, size);
                &resized
            }
            _ => image,
        };

        let result = {
            let mut engine = self.engine.lock().unwrap_or_else(PoisonError::into_inner);
            engine.infer(input)?
        };

        Ok(result.scaled_to(width, height))
    }
}

// -- Model descriptors ----------------------------------------------------------

/// Contents of the model file passed on the command line.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum ModelSpec {
    Blob(BlobConfig),
    Replay(ReplayConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BlobConfig {
    /// Luma level above which a pixel is foreground.
    #[serde(default = "default_threshold")]
    pub threshold: u8,
    /// Blobs with fewer pixels are ignored.
    #[serde(default = "default_min_area")]
    pub min_area: u32,
    #[serde(default = "default_max_detections")]
    pub max_detections: usize,
    #[serde(default)]
    pub input_width: Option<u32>,
    #[serde(default)]
    pub input_height: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReplayConfig {
    /// JSON-lines file of recorded results, relative to the model file.
    pub results: PathBuf,
}

fn default_threshold() -> u8 {
    200
}
fn default_min_area() -> u32 {
    64
}
fn default_max_detections() -> usize {
    16
}

/// Load the model file and construct the engine it names.
pub fn load_engine(path: &Path) -> Result<SharedEngine, InferenceError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| InferenceError::Load(path.display().to_string(), e))?;
    let spec: ModelSpec =
        toml::from_str(&content).map_err(|e| InferenceError::Spec(e.to_string()))?;
    let base = path.parent().unwrap_or_else(|| Path::new("."));

    let engine = match spec {
        ModelSpec::Blob(config) => SharedEngine::new(BlobDetector::new(config)),
        ModelSpec::Replay(config) => {
            SharedEngine::new(ReplayEngine::from_file(&base.join(&config.results))?)
        }
    };
    info!(
        model = path.display().to_string(),
        engine = engine.name(),
        task = ?engine.task(),
        "inference engine loaded"
    );
    Ok(engine)
}

// -- Blob detector ------------------------------------------------------------

/// Bright-region detector: thresholds luma, labels 8-connected components and
/// reports the bounding box of each large enough component.
pub struct BlobDetector {
    config: BlobConfig,
}

impl BlobDetector {
    pub fn new(config: BlobConfig) -> Self {
        Self { config }
    }
}

#[derive(Clone, Copy)]
struct Extent {
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    area: u32,
}

impl InferenceEngine for BlobDetector {
    fn infer(&mut self, image: &RgbImage) -> Result<AnalysisResult, InferenceError> {
        let (width, height) = image.dimensions();
        if width == 0 || height == 0 {
            return Err(InferenceError::Engine(format!("empty {width}x{height} image")));
        }
        let luma = image::imageops::grayscale(image);
        let mask = GrayImage::from_fn(width, height, |x, y| {
            if luma.get_pixel(x, y).0[0] > self.config.threshold {
                Luma([255])
            } else {
                Luma([0])
            }
        });
        let labels = connected_components(&mask, Connectivity::Eight, Luma([0u8]));

        let mut extents: BTreeMap<u32, Extent> = BTreeMap::new();
        for (x, y, label) in labels.enumerate_pixels() {
            let label = label.0[0];
            if label == 0 {
                continue;
            }
            extents
                .entry(label)
                .and_modify(|e| {
                    e.min_x = e.min_x.min(x);
                    e.min_y = e.min_y.min(y);
                    e.max_x = e.max_x.max(x);
                    e.max_y = e.max_y.max(y);
                    e.area += 1;
                })
                .or_insert(Extent {
                    min_x: x,
                    min_y: y,
                    max_x: x,
                    max_y: y,
                    area: 1,
                });
        }

        let mut blobs: Vec<Extent> = extents
            .into_values()
            .filter(|e| e.area >= self.config.min_area)
            .collect();
        blobs.sort_by(|a, b| {
            b.area
                .cmp(&a.area)
                .then(a.min_y.cmp(&b.min_y))
                .then(a.min_x.cmp(&b.min_x))
        });
        blobs.truncate(self.config.max_detections);

        let (w, h) = (width as f32, height as f32);
        let rects = blobs
            .iter()
            .map(|e| {
                Rect::from_normalized(
                    e.min_x as f32 / w,
                    e.min_y as f32 / h,
                    (e.max_x - e.min_x + 1) as f32 / w,
                    (e.max_y - e.min_y + 1) as f32 / h,
                    width,
                    height,
                )
            })
            .collect::<Vec<_>>();
        debug!(detections = rects.len(), "blob detector finished");

        Ok(AnalysisResult::Detections(DetectionSet {
            width,
            height,
            rects,
        }))
    }

    fn task(&self) -> Task {
        Task::Detect
    }

    fn input_size(&self) -> Option<FrameGeometry> {
        match (self.config.input_width, self.config.input_height) {
            (Some(w), Some(h)) => Some(FrameGeometry::new(w, h)),
            _ => None,
        }
    }

    fn name(&self) -> &str {
        "blob"
    }
}

// -- Replay engine ------------------------------------------------------------

/// Replays recorded results in order, wrapping around at the end.
pub struct ReplayEngine {
    results: Vec<AnalysisResult>,
    next: usize,
}

impl ReplayEngine {
    pub fn new(results: Vec<AnalysisResult>) -> Result<Self, InferenceError> {
        let first = results
            .first()
            .ok_or_else(|| InferenceError::Spec("replay file contains no results".into()))?;
        let task = first.task();
        if let Some(pos) = results.iter().position(|r| r.task() != task) {
            return Err(InferenceError::Spec(format!(
                "replay result {} is a {:?} result, expected {:?}",
                pos + 1,
                results[pos].task(),
                task
            )));
        }
        Ok(Self { results, next: 0 })
    }

    pub fn from_file(path: &Path) -> Result<Self, InferenceError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| InferenceError::Load(path.display().to_string(), e))?;
        let mut results = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let (_, result) = AnalysisResult::from_json_slice(line.as_bytes())
                .map_err(|source| InferenceError::Replay {
                    line: idx + 1,
                    source,
                })?;
            results.push(result);
        }
        Self::new(results)
    }
}

impl InferenceEngine for ReplayEngine {
    fn infer(&mut self, _image: &RgbImage) -> Result<AnalysisResult, InferenceError> {
        let result = self.results[self.next].clone();
        self.next = (self.next + 1) % self.results.len();
        Ok(result)
    }

    fn task(&self) -> Task {
        self.results[0].task()
    }

    fn name(&self) -> &str {
        "replay"
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InferenceError {
    #[error("failed to read {0}: {1}")]
    Load(String, std::io::Error),
    #[error("invalid model description: {0}")]
    Spec(String),
    #[error("replay line {line}: {source}")]
    Replay { line: usize, source: SchemaError },
    #[error("inference failed: {0}")]
    Engine(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    fn blob_config() -> BlobConfig {
        BlobConfig {
            threshold: 128,
            min_area: 4,
            max_detections: 8,
            input_width: None,
            input_height: None,
        }
    }

    fn fill(image: &mut RgbImage, x: u32, y: u32, w: u32, h: u32) {
        for yy in y..y + h {
            for xx in x..x + w {
                image.put_pixel(xx, yy, Rgb([255, 255, 255]));
            }
        }
    }

    #[test]
    fn blob_detector_finds_bright_squares() {
        let mut image = RgbImage::new(64, 64);
        fill(&mut image, 8, 8, 16, 16);
        fill(&mut image, 40, 32, 8, 8);
        fill(&mut image, 60, 60, 1, 1); // below min_area

        let mut detector = BlobDetector::new(blob_config());
        let result = detector.infer(&image).unwrap();
        match result {
            AnalysisResult::Detections(d) => {
                assert_eq!((d.width, d.height), (64, 64));
                assert_eq!(d.rects, vec![Rect::new(8, 8, 16, 16), Rect::new(40, 32, 8, 8)]);
            }
            other => panic!("expected detections, got {other:?}"),
        }
    }

    #[test]
    fn dark_image_has_no_detections() {
        let mut detector = BlobDetector::new(blob_config());
        let result = detector.infer(&RgbImage::new(32, 32)).unwrap();
        assert!(result.is_empty());
        assert_eq!(result.task(), Task::Detect);
    }

    #[test]
    fn empty_image_is_an_engine_error() {
        let engine = SharedEngine::new(BlobDetector::new(blob_config()));
        let err = engine.analyze(&RgbImage::new(0, 0)).unwrap_err();
        assert!(matches!(err, InferenceError::Engine(_)));
    }

    #[test]
    fn shared_engine_maps_back_to_frame_coordinates() {
        let mut config = blob_config();
        config.input_width = Some(32);
        config.input_height = Some(32);
        let engine = SharedEngine::new(BlobDetector::new(config));

        let mut image = RgbImage::new(64, 64);
        fill(&mut image, 16, 16, 32, 32);
        let result = engine.analyze(&image).unwrap();
        assert_eq!(result.dimensions(), (64, 64));
        match result {
            AnalysisResult::Detections(d) => {
                assert_eq!(d.rects.len(), 1);
                let r = d.rects[0];
                assert!((r.x - 16).abs() <= 2 && (r.y - 16).abs() <= 2, "{r:?}");
                assert!((r.width - 32).abs() <= 4 && (r.height - 32).abs() <= 4, "{r:?}");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    struct Exclusive {
        inside: Arc<AtomicUsize>,
        max_seen: Arc<AtomicUsize>,
    }

    impl InferenceEngine for Exclusive {
        fn infer(&mut self, image: &RgbImage) -> Result<AnalysisResult, InferenceError> {
            let now = self.inside.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_seen.fetch_max(now, Ordering::SeqCst);
            thread::sleep(Duration::from_millis(5));
            self.inside.fetch_sub(1, Ordering::SeqCst);
            Ok(AnalysisResult::empty(Task::Detect, image.width(), image.height()))
        }

        fn task(&self) -> Task {
            Task::Detect
        }
    }

    #[test]
    fn shared_engine_serializes_calls() {
        let max_seen = Arc::new(AtomicUsize::new(0));
        let engine = SharedEngine::new(Exclusive {
            inside: Arc::new(AtomicUsize::new(0)),
            max_seen: Arc::clone(&max_seen),
        });
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let engine = engine.clone();
                thread::spawn(move || {
                    for _ in 0..5 {
                        engine.analyze(&RgbImage::new(4, 4)).unwrap();
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replay_engine_cycles() {
        let a = AnalysisResult::Detections(DetectionSet {
            width: 10,
            height: 10,
            rects: vec![Rect::new(1, 1, 2, 2)],
        });
        let b = AnalysisResult::empty(Task::Detect, 10, 10);
        let mut engine = ReplayEngine::new(vec![a.clone(), b.clone()]).unwrap();
        let image = RgbImage::new(10, 10);
        assert_eq!(engine.infer(&image).unwrap(), a);
        assert_eq!(engine.infer(&image).unwrap(), b);
        assert_eq!(engine.infer(&image).unwrap(), a);
    }

    #[test]
    fn replay_engine_rejects_mixed_tasks() {
        let err = ReplayEngine::new(vec![
            AnalysisResult::empty(Task::Detect, 1, 1),
            AnalysisResult::empty(Task::Pose, 1, 1),
        ])
        .err()
        .unwrap();
        assert!(matches!(err, InferenceError::Spec(_)));
    }

    #[test]
    fn model_spec_parses_tagged_engine() {
        let spec: ModelSpec = toml::from_str("engine = \"blob\"\nthreshold = 90\n").unwrap();
        match spec {
            ModelSpec::Blob(c) => {
                assert_eq!(c.threshold, 90);
                assert_eq!(c.min_area, 64);
            }
            other => panic!("unexpected {other:?}"),
        }
        let spec: ModelSpec =
            toml::from_str("engine = \"replay\"\nresults = \"poses.jsonl\"\n").unwrap();
        assert!(matches!(spec, ModelSpec::Replay(c) if c.results == Path::new("poses.jsonl")));
    }

    #[test]
    fn load_engine_reads_replay_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("results.jsonl"),
            "{\"num\":0,\"height\":368,\"width\":368,\"poses\":{}}\n",
        )
        .unwrap();
        let model = dir.path().join("model.toml");
        std::fs::write(&model, "engine = \"replay\"\nresults = \"results.jsonl\"\n").unwrap();

        let engine = load_engine(&model).unwrap();
        assert_eq!(engine.task(), Task::Pose);
        assert_eq!(engine.name(), "replay");
    }
}
