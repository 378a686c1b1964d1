//! Core of the school election kiosk: student-card reading, voter
//! validation, the anonymous vote transaction and results.

pub mod config;
pub mod db;
pub mod models;
pub mod ocr;
pub mod tasks;
pub mod vision;
pub mod voting;
