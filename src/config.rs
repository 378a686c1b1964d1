use log::info;
use std::env;
use std::fmt::Display;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value {value:?} for {key}: {reason}")]
    Invalid { key: String, value: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub max_connections: u32,
    pub election_check_interval: Duration,
    /// Language hint passed to the text-recognition engine.
    pub ocr_language_hint: String,
    pub capture_frame_interval: Duration,
    /// Consecutive usable detections required before a frame is captured.
    pub capture_stable_frames: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/school_vote".to_string(),
            max_connections: 5,
            election_check_interval: Duration::from_secs(60),
            ocr_language_hint: "tha+eng".to_string(),
            capture_frame_interval: Duration::from_millis(100),
            capture_stable_frames: 3,
        }
    }
}

impl Config {
    /// Reads the process environment. Call `dotenvy::dotenv()` first to pick up `.env`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            database_url: lookup("DATABASE_URL").unwrap_or_else(|| {
                info!("DATABASE_URL not set, using default: {}", defaults.database_url);
                defaults.database_url.clone()
            }),
            max_connections: try_load(&lookup, "DATABASE_MAX_CONNECTIONS", defaults.max_connections)?,
            election_check_interval: Duration::from_secs(try_load(
                &lookup,
                "ELECTION_CHECK_INTERVAL_SECS",
                defaults.election_check_interval.as_secs(),
            )?),
            ocr_language_hint: lookup("OCR_LANGUAGE_HINT").unwrap_or(defaults.ocr_language_hint),
            capture_frame_interval: Duration::from_millis(try_load(
                &lookup,
                "CAPTURE_FRAME_INTERVAL_MS",
                defaults.capture_frame_interval.as_millis() as u64,
            )?),
            capture_stable_frames: try_load(&lookup, "CAPTURE_STABLE_FRAMES", defaults.capture_stable_frames)?,
        })
    }
}

fn try_load<F, T>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr + Display,
    T::Err: Display,
{
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            key: key.to_string(),
            value: value.clone(),
            reason: e.to_string(),
        }),
        None => {
            info!("{} not set, using default: {}", key, default);
            Ok(default)
        }
    }
}
