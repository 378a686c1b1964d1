//! Student-card text recognition and field extraction
//!
//! The recognition engine itself is external and plugs in through
//! [`Recognizer`]. Everything after it (field parsing, confidence, directory
//! validation) lives here.

pub mod parser;
pub mod validate;

use async_trait::async_trait;
use image::GrayImage;
use thiserror::Error;

pub use parser::{parse_ocr_text, FieldConfidence, ParseResult};
pub use validate::{validate_parsed_data, MatchType, ValidationResult};

#[derive(Debug, Error)]
pub enum OcrError {
    #[error("recognition engine failed: {0}")]
    Engine(String),
}

/// Raw output of a recognition engine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecognizedText {
    pub text: String,
}

/// Every OCR backend implements this.
///
/// `progress` receives 0–100 while the engine works. Calls may take seconds;
/// callers drop the future to abandon one.
#[async_trait]
pub trait Recognizer: Send + Sync {
    fn name(&self) -> &str;

    async fn recognize(
        &self,
        image: &GrayImage,
        language_hint: &str,
        progress: &(dyn Fn(u8) + Send + Sync),
    ) -> Result<RecognizedText, OcrError>;
}
