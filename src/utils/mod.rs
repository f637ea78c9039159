//! Utility modules

pub mod image;
pub mod math;
