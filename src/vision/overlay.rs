use image::{Rgba, RgbaImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_line_segment_mut};

use super::DetectionResult;

/// Below this confidence the outline is drawn in the neutral colour.
pub const CANDIDATE_CONFIDENCE: u8 = 40;

pub const SUCCESS_COLOR: Rgba<u8> = Rgba([34, 197, 94, 255]);
pub const CANDIDATE_COLOR: Rgba<u8> = Rgba([245, 158, 11, 255]);
pub const WEAK_COLOR: Rgba<u8> = Rgba([156, 163, 175, 255]);

const CORNER_RADIUS: i32 = 6;
// Offsets giving a 3 px stroke.
const STROKE: [(f32, f32); 5] = [(0.0, 0.0), (-1.0, 0.0), (1.0, 0.0), (0.0, -1.0), (0.0, 1.0)];

/// Outline colour for a detection, `None` when there is nothing to show.
pub fn overlay_color(detection: &DetectionResult) -> Option<Rgba<u8>> {
    match detection.confidence {
        0 => None,
        _ if detection.success => Some(SUCCESS_COLOR),
        c if c >= CANDIDATE_CONFIDENCE => Some(CANDIDATE_COLOR),
        _ => Some(WEAK_COLOR),
    }
}

/// Draws the detected outline and corner markers onto `canvas`.
pub fn draw_detection_overlay(canvas: &mut RgbaImage, detection: &DetectionResult) {
    let Some(color) = overlay_color(detection) else {
        return;
    };
    let corners = detection.corners;
    for i in 0..corners.len() {
        let (a, b) = (corners[i], corners[(i + 1) % corners.len()]);
        for (dx, dy) in STROKE {
            draw_line_segment_mut(canvas, (a.x + dx, a.y + dy), (b.x + dx, b.y + dy), color);
        }
    }
    for corner in corners {
        draw_filled_circle_mut(canvas, (corner.x.round() as i32, corner.y.round() as i32), CORNER_RADIUS, color);
    }
}
