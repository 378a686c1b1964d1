//! Camera capture loop: wait for a steady card, crop it, read it.
//!
//! The camera is released before recognition starts and on every exit path,
//! so the camera stream and the OCR call never run at the same time.

use std::time::Duration;

use async_trait::async_trait;
use image::RgbaImage;
use log::{debug, info, warn};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::ocr::{parse_ocr_text, OcrError, ParseResult, Recognizer};
use crate::vision::detection::detect_in_image;
use crate::vision::{process_image, DetectionResult, ProcessOptions};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureState {
    #[default]
    Idle,
    Detecting,
    Cropping,
    Recognizing,
    Complete,
    Cancelled,
    Failed,
}

impl CaptureState {
    pub fn is_finished(&self) -> bool {
        matches!(self, CaptureState::Complete | CaptureState::Cancelled | CaptureState::Failed)
    }
}

/// What the preview shows while a capture runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct CaptureStatus {
    pub state: CaptureState,
    pub detection: DetectionResult,
    pub ocr_progress: u8,
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture cancelled")]
    Cancelled,
    #[error("camera stopped delivering frames")]
    CameraClosed,
    #[error(transparent)]
    Recognition(#[from] OcrError),
}

#[async_trait]
pub trait FrameSource: Send {
    /// Next camera frame, `None` once the stream has ended.
    async fn next_frame(&mut self) -> Option<RgbaImage>;

    async fn release(&mut self);
}

#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub frame_interval: Duration,
    /// Consecutive usable detections needed before cropping.
    pub stable_frames: u32,
    pub language_hint: String,
    pub options: ProcessOptions,
}

impl CaptureConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            frame_interval: config.capture_frame_interval,
            stable_frames: config.capture_stable_frames,
            language_hint: config.ocr_language_hint.clone(),
            options: ProcessOptions::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CardCapture {
    pub raw_text: String,
    pub parsed: ParseResult,
    pub detection: DetectionResult,
}

struct Camera<'a> {
    source: &'a mut dyn FrameSource,
    released: bool,
}

impl Camera<'_> {
    async fn release(&mut self) {
        if !self.released {
            self.source.release().await;
            self.released = true;
        }
    }
}

fn publish(status: &watch::Sender<CaptureStatus>, state: CaptureState) {
    status.send_modify(|s| s.state = state);
}

/// Runs one capture until a card is read, the camera ends, or `cancel` fires.
pub async fn run_capture(
    source: &mut dyn FrameSource,
    recognizer: &dyn Recognizer,
    config: &CaptureConfig,
    cancel: CancellationToken,
    status: &watch::Sender<CaptureStatus>,
) -> Result<CardCapture, CaptureError> {
    let mut camera = Camera { source, released: false };
    let result = capture(&mut camera, recognizer, config, &cancel, status).await;
    camera.release().await;

    match &result {
        Ok(card) => {
            info!("Card captured with {} field(s) read", card.parsed.found_fields());
            publish(status, CaptureState::Complete);
        }
        Err(CaptureError::Cancelled) => {
            info!("Capture cancelled");
            publish(status, CaptureState::Cancelled);
        }
        Err(e) => {
            warn!("Capture failed: {}", e);
            publish(status, CaptureState::Failed);
        }
    }
    result
}

async fn capture(
    camera: &mut Camera<'_>,
    recognizer: &dyn Recognizer,
    config: &CaptureConfig,
    cancel: &CancellationToken,
    status: &watch::Sender<CaptureStatus>,
) -> Result<CardCapture, CaptureError> {
    let mut ticker = interval(config.frame_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let required = config.stable_frames.max(1);
    let mut stable = 0;

    publish(status, CaptureState::Detecting);
    let frame = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CaptureError::Cancelled),
            _ = ticker.tick() => {}
        }
        let frame = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CaptureError::Cancelled),
            frame = camera.source.next_frame() => frame.ok_or(CaptureError::CameraClosed)?,
        };

        let detection = detect_in_image(&frame);
        status.send_modify(|s| s.detection = detection);
        stable = if detection.is_usable() { stable + 1 } else { 0 };
        debug!("Detection confidence {} ({}/{} stable)", detection.confidence, stable, required);
        if stable >= required {
            break frame;
        }
    };

    publish(status, CaptureState::Cropping);
    let processed = process_image(&frame, config.options);
    drop(frame);
    camera.release().await;

    publish(status, CaptureState::Recognizing);
    info!("Reading card with {}", recognizer.name());
    let progress = |percent: u8| status.send_modify(|s| s.ocr_progress = percent.min(100));
    let recognized = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(CaptureError::Cancelled),
        recognized = recognizer.recognize(&processed.thresholded_card, &config.language_hint, &progress) => recognized?,
    };
    let detection = processed.detection;
    drop(processed);

    Ok(CardCapture { parsed: parse_ocr_text(&recognized.text), raw_text: recognized.text, detection })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::RecognizedText;
    use crate::vision::fixtures::{blank_frame, card_frame};
    use image::GrayImage;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    const CARD_TEXT: &str = "รหัส 1234 ชื่อ สมชาย นามสกุล ใจดี ห้อง 3/1";

    #[derive(Default)]
    struct Recorder {
        camera_open: AtomicBool,
        releases: AtomicUsize,
        frames_served: AtomicUsize,
        overlapped: AtomicBool,
    }

    struct FakeCamera {
        frames: VecDeque<RgbaImage>,
        /// Keep serving blank frames once the queue is empty.
        endless: bool,
        recorder: Arc<Recorder>,
    }

    impl FakeCamera {
        fn new(frames: Vec<RgbaImage>, recorder: &Arc<Recorder>) -> Self {
            recorder.camera_open.store(true, Ordering::SeqCst);
            Self { frames: frames.into(), endless: false, recorder: Arc::clone(recorder) }
        }
    }

    #[async_trait]
    impl FrameSource for FakeCamera {
        async fn next_frame(&mut self) -> Option<RgbaImage> {
            self.recorder.frames_served.fetch_add(1, Ordering::SeqCst);
            self.frames.pop_front().or_else(|| self.endless.then(blank_frame))
        }

        async fn release(&mut self) {
            self.recorder.camera_open.store(false, Ordering::SeqCst);
            self.recorder.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct FakeRecognizer {
        result: Result<&'static str, ()>,
        delay: Duration,
        recorder: Arc<Recorder>,
    }

    #[async_trait]
    impl Recognizer for FakeRecognizer {
        fn name(&self) -> &str {
            "fake"
        }

        async fn recognize(
            &self,
            _image: &GrayImage,
            _language_hint: &str,
            progress: &(dyn Fn(u8) + Send + Sync),
        ) -> Result<RecognizedText, OcrError> {
            if self.recorder.camera_open.load(Ordering::SeqCst) {
                self.recorder.overlapped.store(true, Ordering::SeqCst);
            }
            progress(50);
            tokio::time::sleep(self.delay).await;
            progress(100);
            match self.result {
                Ok(text) => Ok(RecognizedText { text: text.to_string() }),
                Err(()) => Err(OcrError::Engine("engine crashed".to_string())),
            }
        }
    }

    fn config() -> CaptureConfig {
        let mut config = CaptureConfig::from_config(&Config::default());
        config.frame_interval = Duration::from_millis(1);
        config
    }

    #[test]
    fn test_capture_config_follows_app_config() {
        let app = Config { capture_stable_frames: 5, ocr_language_hint: "tha".to_string(), ..Config::default() };
        let capture = CaptureConfig::from_config(&app);
        assert_eq!(capture.stable_frames, 5);
        assert_eq!(capture.language_hint, "tha");
        assert_eq!(capture.frame_interval, app.capture_frame_interval);
        assert_eq!(capture.options, ProcessOptions::default());
    }

    fn recognizer(recorder: &Arc<Recorder>, delay: Duration) -> FakeRecognizer {
        FakeRecognizer { result: Ok(CARD_TEXT), delay, recorder: Arc::clone(recorder) }
    }

    #[tokio::test]
    async fn test_capture_reads_a_steady_card() {
        let recorder = Arc::new(Recorder::default());
        let mut camera = FakeCamera::new(vec![blank_frame(), card_frame(), card_frame(), card_frame()], &recorder);
        let (status, watcher) = watch::channel(CaptureStatus::default());

        let card = run_capture(
            &mut camera,
            &recognizer(&recorder, Duration::ZERO),
            &config(),
            CancellationToken::new(),
            &status,
        )
        .await
        .unwrap();

        assert_eq!(card.raw_text, CARD_TEXT);
        assert_eq!(card.parsed.id.as_deref(), Some("1234"));
        assert!(card.detection.success);
        assert_eq!(recorder.releases.load(Ordering::SeqCst), 1);
        assert!(!recorder.overlapped.load(Ordering::SeqCst));
        assert_eq!(watcher.borrow().state, CaptureState::Complete);
        assert_eq!(watcher.borrow().ocr_progress, 100);
    }

    #[tokio::test]
    async fn test_unsteady_card_restarts_the_count() {
        let recorder = Arc::new(Recorder::default());
        let frames = vec![card_frame(), card_frame(), blank_frame(), card_frame(), card_frame(), card_frame()];
        let mut camera = FakeCamera::new(frames, &recorder);
        let (status, _watcher) = watch::channel(CaptureStatus::default());

        run_capture(&mut camera, &recognizer(&recorder, Duration::ZERO), &config(), CancellationToken::new(), &status)
            .await
            .unwrap();
        assert_eq!(recorder.frames_served.load(Ordering::SeqCst), 6);
    }

    #[tokio::test]
    async fn test_camera_ending_fails_the_capture() {
        let recorder = Arc::new(Recorder::default());
        let mut camera = FakeCamera::new(vec![blank_frame()], &recorder);
        let (status, watcher) = watch::channel(CaptureStatus::default());

        let err = run_capture(&mut camera, &recognizer(&recorder, Duration::ZERO), &config(), CancellationToken::new(), &status)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::CameraClosed));
        assert_eq!(recorder.releases.load(Ordering::SeqCst), 1);
        assert_eq!(watcher.borrow().state, CaptureState::Failed);
    }

    #[tokio::test]
    async fn test_cancel_while_detecting() {
        let recorder = Arc::new(Recorder::default());
        let mut camera = FakeCamera::new(Vec::new(), &recorder);
        camera.endless = true;
        let (status, watcher) = watch::channel(CaptureStatus::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let err = run_capture(&mut camera, &recognizer(&recorder, Duration::ZERO), &config(), cancel, &status)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Cancelled));
        assert!(!recorder.camera_open.load(Ordering::SeqCst));
        assert_eq!(watcher.borrow().state, CaptureState::Cancelled);
    }

    #[tokio::test]
    async fn test_cancel_abandons_recognition() {
        let recorder = Arc::new(Recorder::default());
        let mut camera = FakeCamera::new(vec![card_frame(), card_frame(), card_frame()], &recorder);
        let (status, mut watcher) = watch::channel(CaptureStatus::default());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            while watcher.changed().await.is_ok() {
                if watcher.borrow().state == CaptureState::Recognizing {
                    trigger.cancel();
                    break;
                }
            }
        });

        let slow = recognizer(&recorder, Duration::from_secs(30));
        let err = tokio::time::timeout(Duration::from_secs(5), run_capture(&mut camera, &slow, &config(), cancel, &status))
            .await
            .expect("cancellation did not interrupt recognition")
            .unwrap_err();
        assert!(matches!(err, CaptureError::Cancelled));
        assert_eq!(recorder.releases.load(Ordering::SeqCst), 1);
        assert!(!recorder.overlapped.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_recognition_error_is_reported() {
        let recorder = Arc::new(Recorder::default());
        let mut camera = FakeCamera::new(vec![card_frame(), card_frame(), card_frame()], &recorder);
        let (status, watcher) = watch::channel(CaptureStatus::default());
        let broken = FakeRecognizer { result: Err(()), delay: Duration::ZERO, recorder: Arc::clone(&recorder) };

        let err = run_capture(&mut camera, &broken, &config(), CancellationToken::new(), &status)
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Recognition(OcrError::Engine(_))));
        assert_eq!(watcher.borrow().state, CaptureState::Failed);
        assert!(watcher.borrow().state.is_finished());
    }
}
