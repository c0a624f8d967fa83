use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};

use crate::analysis::{AnalysisResult, Keypoint};

pub const RECT_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
pub const KEYPOINT_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const LIMB_COLOR: Rgb<u8> = Rgb([0, 0, 255]);

const RECT_THICKNESS: i32 = 3;
const LIMB_THICKNESS: i32 = 3;
const KEYPOINT_RADIUS: i32 = 5;

/// Keypoint index pairs joined by a segment when drawing a pose.
pub const LIMBS: [(usize, usize); 13] = [
    (0, 1),
    (1, 2),
    (2, 3),
    (3, 4),
    (1, 5),
    (5, 6),
    (6, 7),
    (1, 8),
    (8, 9),
    (9, 10),
    (1, 11),
    (11, 12),
    (12, 13),
];

/// What a single overlay pass drew.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OverlayStats {
    pub rects: usize,
    pub keypoints: usize,
    pub limbs: usize,
}

/// Outline a rectangle `thickness` pixels wide, growing inwards.
pub fn draw_rect(
    canvas: &mut RgbImage,
    x: i32,
    y: i32,
    width: i32,
    height: i32,
    thickness: i32,
    color: Rgb<u8>,
) {
    for t in 0..thickness.max(1) {
        let w = width - 2 * t;
        let h = height - 2 * t;
        if w <= 0 || h <= 0 {
            break;
        }
        let rect = imageproc::rect::Rect::at(x + t, y + t).of_size(w as u32, h as u32);
        draw_hollow_rect_mut(canvas, rect, color);
    }
}

pub fn draw_circle(canvas: &mut RgbImage, cx: i32, cy: i32, radius: i32, color: Rgb<u8>) {
    draw_filled_circle_mut(canvas, (cx, cy), radius, color);
}

/// Draw a segment `thickness` pixels wide by stacking parallel 1px lines.
pub fn draw_line(
    canvas: &mut RgbImage,
    from: (f32, f32),
    to: (f32, f32),
    thickness: i32,
    color: Rgb<u8>,
) {
    let (dx, dy) = (to.0 - from.0, to.1 - from.1);
    let len = (dx * dx + dy * dy).sqrt();
    if len == 0.0 {
        draw_filled_circle_mut(canvas, (from.0 as i32, from.1 as i32), thickness / 2, color);
        return;
    }
    // unit normal
    let (nx, ny) = (-dy / len, dx / len);
    let half = (thickness.max(1) - 1) as f32 / 2.0;
    let mut offset = -half;
    while offset <= half {
        draw_line_segment_mut(
            canvas,
            (from.0 + nx * offset, from.1 + ny * offset),
            (to.0 + nx * offset, to.1 + ny * offset),
            color,
        );
        offset += 1.0;
    }
}

/// Draw `result` onto `canvas`, rescaling coordinates if the result was
/// computed for a different image size.
pub fn draw_result(canvas: &mut RgbImage, result: &AnalysisResult) -> OverlayStats {
    let (width, height) = canvas.dimensions();
    let result = result.scaled_to(width, height);
    let mut stats = OverlayStats::default();

    match &result {
        AnalysisResult::Detections(d) => {
            for r in &d.rects {
                draw_rect(canvas, r.x, r.y, r.width, r.height, RECT_THICKNESS, RECT_COLOR);
                stats.rects += 1;
            }
        }
        AnalysisResult::Poses(p) => {
            for pose in &p.poses {
                stats.keypoints += draw_keypoints(canvas, &pose.keypoints);
                for &(a, b) in LIMBS.iter() {
                    let (Some(ka), Some(kb)) = (pose.keypoints.get(a), pose.keypoints.get(b)) else {
                        continue;
                    };
                    if ka.is_located() && kb.is_located() {
                        draw_line(
                            canvas,
                            (ka.x as f32, ka.y as f32),
                            (kb.x as f32, kb.y as f32),
                            LIMB_THICKNESS,
                            LIMB_COLOR,
                        );
                        stats.limbs += 1;
                    }
                }
            }
        }
    }
    stats
}

fn draw_keypoints(canvas: &mut RgbImage, keypoints: &[Keypoint]) -> usize {
    let mut drawn = 0;
    for k in keypoints.iter().filter(|k| k.is_located()) {
        draw_circle(canvas, k.x as i32, k.y as i32, KEYPOINT_RADIUS, KEYPOINT_COLOR);
        drawn += 1;
    }
    drawn
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::{DetectionSet, Pose, PoseSet, Rect};

    #[test]
    fn detection_overlay_outlines_rect() {
        let mut canvas = RgbImage::new(640, 360);
        let result = AnalysisResult::Detections(DetectionSet {
            width: 640,
            height: 360,
            rects: vec![Rect::new(10, 10, 50, 60)],
        });
        let stats = draw_result(&mut canvas, &result);
        assert_eq!(stats.rects, 1);
        assert_eq!(*canvas.get_pixel(10, 10), RECT_COLOR);
        assert_eq!(*canvas.get_pixel(12, 30), RECT_COLOR, "3px border");
        assert_eq!(*canvas.get_pixel(59, 69), RECT_COLOR);
        assert_eq!(*canvas.get_pixel(35, 40), Rgb([0, 0, 0]), "interior untouched");
    }

    #[test]
    fn rect_partly_outside_is_clipped() {
        let mut canvas = RgbImage::new(32, 32);
        draw_rect(&mut canvas, 20, 20, 40, 40, 3, RECT_COLOR);
        assert_eq!(*canvas.get_pixel(20, 31), RECT_COLOR);
    }

    #[test]
    fn pose_overlay_skips_unlocated_points() {
        let mut keypoints: Vec<Keypoint> = (0..14)
            .map(|i| Keypoint {
                kind: i,
                x: 20.0 + 10.0 * i as f64,
                y: 50.0,
            })
            .collect();
        keypoints[4] = Keypoint {
            kind: 4,
            x: 0.0,
            y: 0.0,
        };
        let result = AnalysisResult::Poses(PoseSet {
            width: 368,
            height: 368,
            poses: vec![Pose { keypoints }],
        });

        let mut canvas = RgbImage::new(368, 368);
        let stats = draw_result(&mut canvas, &result);
        assert_eq!(stats.keypoints, 13);
        assert_eq!(stats.limbs, 12, "limb 3-4 touches the missing point");
        assert_eq!(*canvas.get_pixel(20, 54), KEYPOINT_COLOR, "circle below the limb");
        assert_eq!(*canvas.get_pixel(0, 0), Rgb([0, 0, 0]));
    }

    #[test]
    fn short_pose_does_not_panic() {
        let result = AnalysisResult::Poses(PoseSet {
            width: 64,
            height: 64,
            poses: vec![Pose {
                keypoints: vec![Keypoint {
                    kind: 0,
                    x: 5.0,
                    y: 5.0,
                }],
            }],
        });
        let mut canvas = RgbImage::new(64, 64);
        let stats = draw_result(&mut canvas, &result);
        assert_eq!(
            stats,
            OverlayStats {
                rects: 0,
                keypoints: 1,
                limbs: 0,
            }
        );
    }
}
