//! Per-frame analysis results and their JSON wire schema.
//!
//! Detection:
//! `{"num":N,"height":H,"width":W,"1":{"x":..,"y":..,"size_col":..,"size_row":..},"2":{..}}`
//!
//! Pose:
//! `{"num":N,"height":H,"width":W,"poses":{"1":{"0":{"type":..,"x":..,"y":..},"1":{..}},"2":{..}}}`
//!
//! Entries are string-keyed maps, not arrays: detections and poses are
//! 1-based, keypoints within a pose are 0-based. In sequenced mode the object
//! also carries `"seq"`.

use serde_json::{Map, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Task {
    Detect,
    Pose,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnalysisResult {
    Detections(DetectionSet),
    Poses(PoseSet),
}

/// Rectangles in absolute pixel units of a `width` x `height` image.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DetectionSet {
    pub width: u32,
    pub height: u32,
    pub rects: Vec<Rect>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PoseSet {
    pub width: u32,
    pub height: u32,
    pub poses: Vec<Pose>,
}

/// Keypoints in model order; index `i` is keypoint `i` of the skeleton.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Pose {
    pub keypoints: Vec<Keypoint>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Keypoint {
    pub kind: i64,
    pub x: f64,
    pub y: f64,
}

impl Rect {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// Convert a rectangle given as fractions of the image size to pixels.
    /// Negative origins are clamped to the image edge.
    pub fn from_normalized(x: f32, y: f32, w: f32, h: f32, width: u32, height: u32) -> Self {
        Self {
            x: (x.max(0.0) * width as f32) as i32,
            y: (y.max(0.0) * height as f32) as i32,
            width: (w * width as f32) as i32,
            height: (h * height as f32) as i32,
        }
    }

    fn scaled(&self, sx: f64, sy: f64) -> Self {
        Self {
            x: (self.x as f64 * sx) as i32,
            y: (self.y as f64 * sy) as i32,
            width: (self.width as f64 * sx) as i32,
            height: (self.height as f64 * sy) as i32,
        }
    }
}

impl Keypoint {
    /// Keypoints the model did not locate are reported at the origin.
    pub fn is_located(&self) -> bool {
        self.x != 0.0 || self.y != 0.0
    }
}

impl AnalysisResult {
    pub fn task(&self) -> Task {
        match self {
            AnalysisResult::Detections(_) => Task::Detect,
            AnalysisResult::Poses(_) => Task::Pose,
        }
    }

    /// Image size the coordinates refer to.
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            AnalysisResult::Detections(d) => (d.width, d.height),
            AnalysisResult::Poses(p) => (p.width, p.height),
        }
    }

    /// Number of rectangles or poses.
    pub fn len(&self) -> usize {
        match self {
            AnalysisResult::Detections(d) => d.rects.len(),
            AnalysisResult::Poses(p) => p.poses.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// A result of `task` with nothing in it.
    pub fn empty(task: Task, width: u32, height: u32) -> Self {
        match task {
            Task::Detect => AnalysisResult::Detections(DetectionSet {
                width,
                height,
                rects: Vec::new(),
            }),
            Task::Pose => AnalysisResult::Poses(PoseSet {
                width,
                height,
                poses: Vec::new(),
            }),
        }
    }

    /// Rescale all coordinates to an image of `width` x `height`.
    pub fn scaled_to(&self, width: u32, height: u32) -> Self {
        let (from_w, from_h) = self.dimensions();
        if (from_w, from_h) == (width, height) || from_w == 0 || from_h == 0 {
            return self.clone();
        }
        let sx = width as f64 / from_w as f64;
        let sy = height as f64 / from_h as f64;
        match self {
            AnalysisResult::Detections(d) => AnalysisResult::Detections(DetectionSet {
                width,
                height,
                rects: d.rects.iter().map(|r| r.scaled(sx, sy)).collect(),
            }),
            AnalysisResult::Poses(p) => AnalysisResult::Poses(PoseSet {
                width,
                height,
                poses: p
                    .poses
                    .iter()
                    .map(|pose| Pose {
                        keypoints: pose
                            .keypoints
                            .iter()
                            .map(|k| Keypoint {
                                kind: k.kind,
                                x: k.x * sx,
                                y: k.y * sy,
                            })
                            .collect(),
                    })
                    .collect(),
            }),
        }
    }

    // -- Serialization ----------------------------------------------------------

    pub fn to_json(&self, seq: Option<u64>) -> Value {
        let mut root = Map::new();
        let (width, height) = self.dimensions();
        root.insert("num".into(), Value::from(self.len() as u64));
        root.insert("height".into(), Value::from(height));
        root.insert("width".into(), Value::from(width));
        if let Some(seq) = seq {
            root.insert("seq".into(), Value::from(seq));
        }

        match self {
            AnalysisResult::Detections(d) => {
                for (i, r) in d.rects.iter().enumerate() {
                    let mut rect = Map::new();
                    rect.insert("x".into(), Value::from(r.x));
                    rect.insert("y".into(), Value::from(r.y));
                    rect.insert("size_col".into(), Value::from(r.width));
                    rect.insert("size_row".into(), Value::from(r.height));
                    root.insert((i + 1).to_string(), Value::Object(rect));
                }
            }
            AnalysisResult::Poses(p) => {
                let mut poses = Map::new();
                for (i, pose) in p.poses.iter().enumerate() {
                    let mut points = Map::new();
                    for (j, k) in pose.keypoints.iter().enumerate() {
                        let mut point = Map::new();
                        point.insert("type".into(), Value::from(k.kind));
                        point.insert("x".into(), Value::from(k.x));
                        point.insert("y".into(), Value::from(k.y));
                        points.insert(j.to_string(), Value::Object(point));
                    }
                    poses.insert((i + 1).to_string(), Value::Object(points));
                }
                root.insert("poses".into(), Value::Object(poses));
            }
        }
        Value::Object(root)
    }

    pub fn to_json_bytes(&self, seq: Option<u64>) -> Vec<u8> {
        self.to_json(seq).to_string().into_bytes()
    }

    /// Parse a result message. Returns the echoed sequence number, if present,
    /// alongside the result.
    pub fn from_json_slice(data: &[u8]) -> Result<(Option<u64>, AnalysisResult), SchemaError> {
        let value: Value = serde_json::from_slice(data)?;
        Self::from_json(&value)
    }

    pub fn from_json(value: &Value) -> Result<(Option<u64>, AnalysisResult), SchemaError> {
        let root = value.as_object().ok_or(SchemaError::NotAnObject("root"))?;
        let num = get_u64(root, "num")?;
        let width = get_u32(root, "width")?;
        let height = get_u32(root, "height")?;
        let seq = match root.get("seq") {
            Some(v) => Some(
                v.as_u64()
                    .ok_or_else(|| SchemaError::invalid("seq", "not an unsigned integer"))?,
            ),
            None => None,
        };

        let result = match root.get("poses") {
            Some(poses) => {
                let poses = poses.as_object().ok_or(SchemaError::NotAnObject("poses"))?;
                let mut parsed = Vec::with_capacity(poses.len());
                for (_, points) in sorted_entries(poses, "poses")? {
                    let points = points
                        .as_object()
                        .ok_or(SchemaError::NotAnObject("pose"))?;
                    let mut keypoints = Vec::with_capacity(points.len());
                    for (_, point) in sorted_entries(points, "pose")? {
                        let point = point
                            .as_object()
                            .ok_or(SchemaError::NotAnObject("keypoint"))?;
                        keypoints.push(Keypoint {
                            kind: get_i64(point, "type")?,
                            x: get_f64(point, "x")?,
                            y: get_f64(point, "y")?,
                        });
                    }
                    parsed.push(Pose { keypoints });
                }
                if parsed.len() as u64 != num {
                    return Err(SchemaError::CountMismatch {
                        num,
                        found: parsed.len(),
                    });
                }
                AnalysisResult::Poses(PoseSet {
                    width,
                    height,
                    poses: parsed,
                })
            }
            None => {
                // Every rectangle is its own key, so `num` can never exceed the key count.
                if num > root.len() as u64 {
                    return Err(SchemaError::CountMismatch {
                        num,
                        found: root.len(),
                    });
                }
                let mut rects = Vec::new();
                for i in 1..=num {
                    let key = i.to_string();
                    let rect = root
                        .get(&key)
                        .ok_or_else(|| SchemaError::Missing(key.clone()))?
                        .as_object()
                        .ok_or(SchemaError::NotAnObject("rect"))?;
                    rects.push(Rect {
                        x: get_i32(rect, "x")?,
                        y: get_i32(rect, "y")?,
                        width: get_i32(rect, "size_col")?,
                        height: get_i32(rect, "size_row")?,
                    });
                }
                AnalysisResult::Detections(DetectionSet {
                    width,
                    height,
                    rects,
                })
            }
        };
        Ok((seq, result))
    }
}

/// Entries of a string-keyed index map, ordered by numeric key.
fn sorted_entries<'a>(
    map: &'a Map<String, Value>,
    context: &'static str,
) -> Result<Vec<(usize, &'a Value)>, SchemaError> {
    let mut entries = map
        .iter()
        .map(|(k, v)| {
            k.parse::<usize>()
                .map(|idx| (idx, v))
                .map_err(|_| SchemaError::invalid(context, format!("non-numeric key {k:?}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    entries.sort_by_key(|(idx, _)| *idx);
    Ok(entries)
}

fn get<'a>(map: &'a Map<String, Value>, key: &str) -> Result<&'a Value, SchemaError> {
    map.get(key).ok_or_else(|| SchemaError::Missing(key.to_string()))
}

fn get_u64(map: &Map<String, Value>, key: &str) -> Result<u64, SchemaError> {
    get(map, key)?
        .as_u64()
        .ok_or_else(|| SchemaError::invalid(key, "not an unsigned integer"))
}

fn get_u32(map: &Map<String, Value>, key: &str) -> Result<u32, SchemaError> {
    u32::try_from(get_u64(map, key)?).map_err(|_| SchemaError::invalid(key, "out of range"))
}

fn get_i32(map: &Map<String, Value>, key: &str) -> Result<i32, SchemaError> {
    i32::try_from(get_i64(map, key)?).map_err(|_| SchemaError::invalid(key, "out of range"))
}

fn get_i64(map: &Map<String, Value>, key: &str) -> Result<i64, SchemaError> {
    let value = get(map, key)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .ok_or_else(|| SchemaError::invalid(key, "not a number"))
}

fn get_f64(map: &Map<String, Value>, key: &str) -> Result<f64, SchemaError> {
    get(map, key)?
        .as_f64()
        .ok_or_else(|| SchemaError::invalid(key, "not a number"))
}

#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("result is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("expected {0} to be a JSON object")]
    NotAnObject(&'static str),
    #[error("missing key {0:?}")]
    Missing(String),
    #[error("invalid {key}: {reason}")]
    Invalid { key: String, reason: String },
    #[error("num is {num} but {found} entries are present")]
    CountMismatch { num: u64, found: usize },
}

impl SchemaError {
    fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        SchemaError::Invalid {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXED: &[u8] =
        br#"{"num":1,"height":360,"width":640,"1":{"x":10,"y":10,"size_col":50,"size_row":60}}"#;

    fn detections() -> AnalysisResult {
        AnalysisResult::Detections(DetectionSet {
            width: 640,
            height: 360,
            rects: vec![Rect::new(10, 10, 50, 60), Rect::new(200, 100, 30, 40)],
        })
    }

    fn poses() -> AnalysisResult {
        let pose = |offset: f64| Pose {
            keypoints: (0..14)
                .map(|i| Keypoint {
                    kind: i,
                    x: offset + i as f64 * 2.5,
                    y: offset + i as f64,
                })
                .collect(),
        };
        AnalysisResult::Poses(PoseSet {
            width: 368,
            height: 368,
            poses: vec![pose(10.0), pose(100.0)],
        })
    }

    #[test]
    fn detection_schema_matches_wire_format() {
        let json = detections().to_json(None);
        assert_eq!(json["num"], 2);
        assert_eq!(json["width"], 640);
        assert_eq!(json["height"], 360);
        assert_eq!(json["1"]["x"], 10);
        assert_eq!(json["1"]["size_col"], 50);
        assert_eq!(json["1"]["size_row"], 60);
        assert_eq!(json["2"]["y"], 100);
        assert!(json.get("0").is_none(), "detections are 1-based");
        assert!(json.get("seq").is_none());
    }

    #[test]
    fn detection_roundtrip() {
        let original = detections();
        let bytes = original.to_json_bytes(Some(7));
        let (seq, decoded) = AnalysisResult::from_json_slice(&bytes).unwrap();
        assert_eq!(seq, Some(7));
        assert_eq!(decoded, original);
    }

    #[test]
    fn pose_schema_uses_nested_string_maps() {
        let json = poses().to_json(None);
        assert_eq!(json["num"], 2);
        assert_eq!(json["poses"]["1"]["0"]["type"], 0);
        assert_eq!(json["poses"]["2"]["13"]["type"], 13);
        assert!(json["poses"].get("0").is_none(), "poses are 1-based");
    }

    #[test]
    fn pose_roundtrip_keeps_keypoint_order() {
        // keys "10".."13" sort before "2" lexicographically
        let original = poses();
        let (seq, decoded) =
            AnalysisResult::from_json_slice(&original.to_json_bytes(None)).unwrap();
        assert_eq!(seq, None);
        assert_eq!(decoded, original);
    }

    #[test]
    fn parses_reference_fixed_result() {
        let (_, result) = AnalysisResult::from_json_slice(FIXED).unwrap();
        match result {
            AnalysisResult::Detections(d) => {
                assert_eq!((d.width, d.height), (640, 360));
                assert_eq!(d.rects, vec![Rect::new(10, 10, 50, 60)]);
            }
            other => panic!("expected detections, got {other:?}"),
        }
    }

    #[test]
    fn missing_rect_is_schema_error() {
        let raw =
            br#"{"num":2,"height":360,"width":640,"1":{"x":1,"y":1,"size_col":1,"size_row":1}}"#;
        let err = AnalysisResult::from_json_slice(raw).unwrap_err();
        assert!(matches!(err, SchemaError::Missing(k) if k == "2"));
    }

    #[test]
    fn garbage_is_json_error() {
        let err = AnalysisResult::from_json_slice(b"{\"num\":").unwrap_err();
        assert!(matches!(err, SchemaError::Json(_)));
    }

    #[test]
    fn huge_count_is_rejected_without_allocating() {
        let err = AnalysisResult::from_json_slice(
            br#"{"num":18446744073709551615,"height":1,"width":1}"#,
        )
        .unwrap_err();
        assert!(matches!(err, SchemaError::CountMismatch { found: 3, .. }));

        let err = AnalysisResult::from_json_slice(br#"{"num":1e12,"height":1,"width":1}"#)
            .unwrap_err();
        assert!(matches!(err, SchemaError::Invalid { key, .. } if key == "num"));
    }

    #[test]
    fn out_of_range_values_are_invalid() {
        let err = AnalysisResult::from_json_slice(br#"{"num":0,"height":1,"width":4294967296}"#)
            .unwrap_err();
        assert!(matches!(err, SchemaError::Invalid { key, .. } if key == "width"));

        let raw = br#"{"num":1,"height":1,"width":1,"1":{"x":3000000000}}"#;
        let err = AnalysisResult::from_json_slice(raw).unwrap_err();
        assert!(matches!(err, SchemaError::Invalid { key, .. } if key == "x"));
    }

    #[test]
    fn normalized_rect_clamps_negative_origin() {
        let rect = Rect::from_normalized(-0.1, 0.5, 0.25, 0.5, 640, 360);
        assert_eq!(rect, Rect::new(0, 180, 160, 180));
    }

    #[test]
    fn scaling_maps_model_space_to_frame_space() {
        let model_space = AnalysisResult::Detections(DetectionSet {
            width: 320,
            height: 180,
            rects: vec![Rect::new(10, 20, 30, 40)],
        });
        let scaled = model_space.scaled_to(640, 360);
        assert_eq!(scaled.dimensions(), (640, 360));
        match scaled {
            AnalysisResult::Detections(d) => assert_eq!(d.rects[0], Rect::new(20, 40, 60, 80)),
            other => panic!("unexpected {other:?}"),
        }
    }
}
