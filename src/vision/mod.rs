//! Card detection and image preparation for OCR
//!
//! Frames arrive as RGBA. [`detection`] finds the card outline, [`overlay`]
//! draws it back onto the preview, and [`pipeline`] produces the cropped and
//! binarised card handed to the recognizer.

pub mod detection;
pub mod overlay;
pub mod pipeline;

use image::{GrayImage, Luma};
use serde::Serialize;

pub use detection::detect_card;
pub use overlay::draw_detection_overlay;
pub use pipeline::{process_image, ProcessOptions, ProcessedImage};

/// Detections below this are shown but never cropped or captured.
pub const USABLE_CONFIDENCE: u8 = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CardPoint {
    pub x: f32,
    pub y: f32,
}

impl CardPoint {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Outcome of one detection attempt.
///
/// Corners are in source-frame pixels, ordered top-left, top-right,
/// bottom-right, bottom-left. A failed attempt may still carry the best
/// candidate and its confidence for the preview.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DetectionResult {
    pub success: bool,
    pub confidence: u8,
    pub corners: [CardPoint; 4],
}

impl DetectionResult {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_usable(&self) -> bool {
        self.success && self.confidence >= USABLE_CONFIDENCE
    }
}

/// Pixels above `level` become foreground (255), or below it when `invert`.
pub(crate) fn binarize(image: &GrayImage, level: u8, invert: bool) -> GrayImage {
    GrayImage::from_fn(image.width(), image.height(), |x, y| {
        let bright = image.get_pixel(x, y)[0] > level;
        Luma([if bright != invert { 255 } else { 0 }])
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_usable_requires_success_and_confidence() {
        let mut detection = DetectionResult { success: true, confidence: 75, ..Default::default() };
        assert!(detection.is_usable());
        detection.confidence = 59;
        assert!(!detection.is_usable());
        detection = DetectionResult { success: false, confidence: 90, ..Default::default() };
        assert!(!detection.is_usable());
    }

    #[test]
    fn test_binarize_polarity() {
        let image = GrayImage::from_fn(2, 1, |x, _| Luma([if x == 0 { 10 } else { 200 }]));
        let normal = binarize(&image, 100, false);
        let inverted = binarize(&image, 100, true);
        assert_eq!(normal.as_raw(), &vec![0, 255]);
        assert_eq!(inverted.as_raw(), &vec![255, 0]);
    }
}
