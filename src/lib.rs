//! Bone age estimation with Grad-CAM explainability

pub mod config;
pub mod engine;
pub mod error;
pub mod logging;
pub mod service;
pub mod utils;

pub use config::Config;
pub use error::{BoneAgeError, Result};
