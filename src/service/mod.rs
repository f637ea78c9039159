//! Service layer module

pub mod bone_age_service;
pub mod types;

pub use bone_age_service::BoneAgeService;
pub use types::*;
