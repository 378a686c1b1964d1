use image::imageops;
use image::{GrayImage, Rgba, RgbaImage};
use imageproc::contrast::{equalize_histogram, otsu_level};
use imageproc::filter::sharpen3x3;
use imageproc::geometric_transformations::{warp_into, Interpolation, Projection};
use log::debug;
use serde::{Deserialize, Serialize};

use super::detection::detect_in_image;
use super::overlay::draw_detection_overlay;
use super::{binarize, DetectionResult};

/// ID-1 card at 10 px/mm.
pub const CARD_WIDTH: u32 = 856;
pub const CARD_HEIGHT: u32 = 540;

const STRETCH_LOW_PERCENTILE: f64 = 0.02;
const STRETCH_HIGH_PERCENTILE: f64 = 0.98;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessOptions {
    pub enable_crop: bool,
    pub enable_enhancement: bool,
}

impl Default for ProcessOptions {
    fn default() -> Self {
        Self { enable_crop: true, enable_enhancement: true }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub original_with_overlay: RgbaImage,
    pub cropped_card: RgbaImage,
    /// Input for the recognizer.
    pub thresholded_card: GrayImage,
    pub detection: DetectionResult,
}

/// Runs detection on `source` and prepares the card for OCR.
///
/// Cropping only happens for a usable detection; otherwise the whole frame
/// goes through. Every call allocates new images.
pub fn process_image(source: &RgbaImage, options: ProcessOptions) -> ProcessedImage {
    let detection = detect_in_image(source);

    let mut original_with_overlay = source.clone();
    draw_detection_overlay(&mut original_with_overlay, &detection);

    let mut cropped_card = if options.enable_crop && detection.is_usable() {
        warp_card(source, &detection).unwrap_or_else(|| {
            debug!("Card corners are degenerate, keeping the full frame");
            source.clone()
        })
    } else {
        source.clone()
    };

    let thresholded_card = if options.enable_enhancement {
        stretch_contrast(&mut cropped_card);
        binarize_for_ocr(&cropped_card)
    } else {
        imageops::grayscale(&cropped_card)
    };

    ProcessedImage { original_with_overlay, cropped_card, thresholded_card, detection }
}

/// Perspective-corrects the card to a landscape `CARD_WIDTH`×`CARD_HEIGHT` image.
fn warp_card(source: &RgbaImage, detection: &DetectionResult) -> Option<RgbaImage> {
    let mut from = detection.corners.map(|p| (p.x, p.y));
    let side = |a: (f32, f32), b: (f32, f32)| (a.0 - b.0).hypot(a.1 - b.1);
    // A card held upright maps its long right edge to the top.
    if side(from[0], from[3]) > side(from[0], from[1]) {
        from.rotate_left(1);
    }
    let (w, h) = (CARD_WIDTH as f32, CARD_HEIGHT as f32);
    let to = [(0.0, 0.0), (w, 0.0), (w, h), (0.0, h)];
    let projection = Projection::from_control_points(from, to)?;

    let mut card = RgbaImage::new(CARD_WIDTH, CARD_HEIGHT);
    warp_into(source, &projection, Interpolation::Bilinear, Rgba([0, 0, 0, 255]), &mut card);
    Some(card)
}

/// Stretches the 2nd–98th percentile of luminance to the full range.
fn stretch_contrast(image: &mut RgbaImage) {
    let luma = imageops::grayscale(&*image);
    let mut histogram = [0u64; 256];
    for pixel in luma.pixels() {
        histogram[pixel[0] as usize] += 1;
    }
    let total = luma.pixels().len() as f64;
    let percentile = |share: f64| {
        let target = (total * share).ceil() as u64;
        let mut seen = 0;
        for (value, count) in histogram.iter().enumerate() {
            seen += count;
            if seen >= target.max(1) {
                return value as u8;
            }
        }
        u8::MAX
    };
    let (low, high) = (percentile(STRETCH_LOW_PERCENTILE), percentile(STRETCH_HIGH_PERCENTILE));
    if high <= low {
        return;
    }

    let range = (high - low) as f32;
    for pixel in image.pixels_mut() {
        for channel in pixel.0.iter_mut().take(3) {
            let stretched = (*channel as f32 - low as f32) * 255.0 / range;
            *channel = stretched.round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn binarize_for_ocr(card: &RgbaImage) -> GrayImage {
    let gray = imageops::grayscale(card);
    let sharpened = sharpen3x3(&equalize_histogram(&gray));
    let level = otsu_level(&sharpened);
    binarize(&sharpened, level, false)
}
