use image::imageops::{self, FilterType};
use image::{GrayImage, RgbaImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::otsu_level;
use imageproc::distance_transform::Norm;
use imageproc::edges::canny;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometry::{approximate_polygon_dp, arc_length};
use imageproc::morphology::dilate;
use imageproc::point::Point;
use log::debug;

use super::{binarize, CardPoint, DetectionResult, USABLE_CONFIDENCE};

/// Frames are analysed at most this wide.
const WORK_WIDTH: u32 = 320;
const MIN_FRAME_SIDE: u32 = 32;
const BLUR_SIGMA: f32 = 1.0;
const CANNY_LOW: f32 = 20.0;
const CANNY_HIGH: f32 = 60.0;

const MIN_CONTOUR_POINTS: usize = 20;
/// Polygon simplification tolerance as a share of the contour perimeter.
const POLYGON_EPSILON: f64 = 0.02;
/// Turns shallower than this are treated as a straight edge.
const STRAIGHT_TURN_DEGREES: f64 = 15.0;

const MIN_AREA_RATIO: f64 = 0.05;
const MAX_AREA_RATIO: f64 = 0.95;
/// Area at which the area score saturates.
const FULL_AREA_RATIO: f64 = 0.25;
/// Contour area over polygon area. Blobs that merely have four extreme
/// points fall well below this.
const MIN_FILL_RATIO: f64 = 0.85;

/// ISO/IEC 7810 ID-1: 85.60 × 53.98 mm.
const CARD_ASPECT: f64 = 1.586;
const ASPECT_TOLERANCE: f64 = 0.35;
const ANGLE_TOLERANCE_DEGREES: f64 = 30.0;

const AREA_WEIGHT: f64 = 0.3;
const ASPECT_WEIGHT: f64 = 0.4;
const ANGLE_WEIGHT: f64 = 0.3;

type Vertex = (f64, f64);

#[derive(Debug, Clone, Copy)]
struct Candidate {
    corners: [Vertex; 4],
    score: f64,
}

/// Looks for an ID card in a frame of RGBA bytes.
///
/// Never fails: a malformed buffer or an empty scene gives an unsuccessful
/// result with zero confidence.
pub fn detect_card(data: &[u8], width: u32, height: u32) -> DetectionResult {
    let expected = (width as usize).checked_mul(height as usize).and_then(|n| n.checked_mul(4));
    if expected != Some(data.len()) {
        debug!("Frame buffer of {} bytes does not match {}x{}", data.len(), width, height);
        return DetectionResult::none();
    }
    match RgbaImage::from_raw(width, height, data.to_vec()) {
        Some(frame) => detect_in_image(&frame),
        None => DetectionResult::none(),
    }
}

pub(crate) fn detect_in_image(frame: &RgbaImage) -> DetectionResult {
    let (width, height) = frame.dimensions();
    if width < MIN_FRAME_SIDE || height < MIN_FRAME_SIDE {
        return DetectionResult::none();
    }

    let scale = if width > WORK_WIDTH { WORK_WIDTH as f64 / width as f64 } else { 1.0 };
    let gray = imageops::grayscale(frame);
    let gray = if scale < 1.0 {
        let work_height = ((height as f64 * scale).round() as u32).max(1);
        imageops::resize(&gray, WORK_WIDTH, work_height, FilterType::Triangle)
    } else {
        gray
    };
    let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);

    let level = otsu_level(&blurred);
    let masks = [
        binarize(&blurred, level, false),
        binarize(&blurred, level, true),
        dilate(&canny(&blurred, CANNY_LOW, CANNY_HIGH), Norm::LInf, 1),
    ];

    let best = masks
        .iter()
        .flat_map(candidates)
        .max_by(|a, b| a.score.total_cmp(&b.score));

    let Some(best) = best else {
        return DetectionResult::none();
    };
    let confidence = (best.score * 100.0).round().clamp(0.0, 100.0) as u8;
    debug!("Best card candidate scored {}", confidence);

    let corners = best
        .corners
        .map(|(x, y)| CardPoint::new((x / scale) as f32, (y / scale) as f32));
    DetectionResult { success: confidence >= USABLE_CONFIDENCE, confidence, corners }
}

fn candidates(mask: &GrayImage) -> Vec<Candidate> {
    let (width, height) = mask.dimensions();
    let frame_area = width as f64 * height as f64;

    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.points.len() >= MIN_CONTOUR_POINTS)
        .filter(|c| !touches_border(&c.points, width, height))
        .filter_map(|c| {
            let quad = quadrilateral(&c.points)?;
            let quad_area = polygon_area(&quad);
            let area_ratio = quad_area / frame_area;
            if !(MIN_AREA_RATIO..=MAX_AREA_RATIO).contains(&area_ratio) {
                return None;
            }
            let outline: Vec<Vertex> = c.points.iter().map(|p| (p.x as f64, p.y as f64)).collect();
            if polygon_area(&outline) / quad_area < MIN_FILL_RATIO {
                return None;
            }
            let corners = order_corners(quad);
            Some(Candidate { corners, score: score(&corners, area_ratio) })
        })
        .collect()
}

fn touches_border(points: &[Point<i32>], width: u32, height: u32) -> bool {
    let (max_x, max_y) = (width as i32 - 2, height as i32 - 2);
    points.iter().any(|p| p.x <= 1 || p.y <= 1 || p.x >= max_x || p.y >= max_y)
}

/// Simplifies a contour to a convex quadrilateral, if it is one.
fn quadrilateral(points: &[Point<i32>]) -> Option<[Vertex; 4]> {
    let perimeter = arc_length(points, true);
    let approx = approximate_polygon_dp(points, (perimeter * POLYGON_EPSILON).max(1.0), false);
    let polygon: Vec<Vertex> = approx.iter().map(|p| (p.x as f64, p.y as f64)).collect();
    let polygon = prune_vertices(polygon, perimeter * POLYGON_EPSILON);

    let quad: [Vertex; 4] = polygon.try_into().ok()?;
    is_convex(&quad).then_some(quad)
}

/// Drops vertices that sit on a straight edge or right next to their
/// neighbour, down to four.
fn prune_vertices(mut polygon: Vec<Vertex>, min_side: f64) -> Vec<Vertex> {
    while polygon.len() > 4 {
        let n = polygon.len();
        let redundant = (0..n).find(|&i| {
            let prev = polygon[(i + n - 1) % n];
            let current = polygon[i];
            let next = polygon[(i + 1) % n];
            distance(prev, current) < min_side || turn_degrees(prev, current, next) < STRAIGHT_TURN_DEGREES
        });
        match redundant {
            Some(i) => {
                polygon.remove(i);
            }
            None => break,
        }
    }
    polygon
}

fn distance(a: Vertex, b: Vertex) -> f64 {
    (a.0 - b.0).hypot(a.1 - b.1)
}

fn cross(a: Vertex, b: Vertex, c: Vertex) -> f64 {
    (b.0 - a.0) * (c.1 - b.1) - (b.1 - a.1) * (c.0 - b.0)
}

/// Change of direction at `b`, 0 for a straight line.
fn turn_degrees(a: Vertex, b: Vertex, c: Vertex) -> f64 {
    let dot = (b.0 - a.0) * (c.0 - b.0) + (b.1 - a.1) * (c.1 - b.1);
    cross(a, b, c).abs().atan2(dot).to_degrees()
}

/// Interior angle at `b`.
fn corner_degrees(a: Vertex, b: Vertex, c: Vertex) -> f64 {
    180.0 - turn_degrees(a, b, c)
}

fn is_convex(quad: &[Vertex; 4]) -> bool {
    let signs: Vec<f64> = (0..4).map(|i| cross(quad[i], quad[(i + 1) % 4], quad[(i + 2) % 4])).collect();
    signs.iter().all(|s| *s > 0.0) || signs.iter().all(|s| *s < 0.0)
}

fn polygon_area(points: &[Vertex]) -> f64 {
    let n = points.len();
    let twice: f64 = (0..n)
        .map(|i| {
            let (a, b) = (points[i], points[(i + 1) % n]);
            a.0 * b.1 - b.0 * a.1
        })
        .sum();
    twice.abs() / 2.0
}

/// Orders corners clockwise on screen starting at the top-left.
fn order_corners(quad: [Vertex; 4]) -> [Vertex; 4] {
    let cx = quad.iter().map(|p| p.0).sum::<f64>() / 4.0;
    let cy = quad.iter().map(|p| p.1).sum::<f64>() / 4.0;
    let mut sorted = quad;
    sorted.sort_by(|a, b| (a.1 - cy).atan2(a.0 - cx).total_cmp(&(b.1 - cy).atan2(b.0 - cx)));
    let top_left = (0..4)
        .min_by(|&i, &j| (sorted[i].0 + sorted[i].1).total_cmp(&(sorted[j].0 + sorted[j].1)))
        .unwrap_or(0);
    sorted.rotate_left(top_left);
    sorted
}

fn score(corners: &[Vertex; 4], area_ratio: f64) -> f64 {
    let [tl, tr, br, bl] = *corners;

    let area_score = (area_ratio / FULL_AREA_RATIO).min(1.0);

    let horizontal = (distance(tl, tr) + distance(bl, br)) / 2.0;
    let vertical = (distance(tl, bl) + distance(tr, br)) / 2.0;
    let (long, short) = if horizontal >= vertical { (horizontal, vertical) } else { (vertical, horizontal) };
    let aspect_score = if short > 0.0 {
        let deviation = (long / short - CARD_ASPECT).abs() / CARD_ASPECT;
        (1.0 - deviation / ASPECT_TOLERANCE).clamp(0.0, 1.0)
    } else {
        0.0
    };

    let mean_deviation = (0..4)
        .map(|i| (corner_degrees(corners[(i + 3) % 4], corners[i], corners[(i + 1) % 4]) - 90.0).abs())
        .sum::<f64>()
        / 4.0;
    let angle_score = (1.0 - mean_deviation / ANGLE_TOLERANCE_DEGREES).clamp(0.0, 1.0);

    AREA_WEIGHT * area_score + ASPECT_WEIGHT * aspect_score + ANGLE_WEIGHT * angle_score
}
