//! Model Pool Manager
//!
//! One slot per gender. Checkpoints are resolved when the pool is built: a
//! gender whose file is absent is served by the other gender's slot. Models
//! are loaded on first use and stay resident for the life of the pool.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use candle_core::Device;
use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::checkpoint;
use super::model::FeatureFusionModel;
use crate::config::{ArchitectureConfig, ModelsConfig};
use crate::error::{BoneAgeError, Result};

/// Which gender-tuned model a request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub const ALL: [Gender; 2] = [Gender::Male, Gender::Female];

    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "male",
            Gender::Female => "female",
        }
    }

    pub fn other(&self) -> Gender {
        match self {
            Gender::Male => Gender::Female,
            Gender::Female => Gender::Male,
        }
    }
}

impl std::fmt::Display for Gender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resident model and the lock serializing its gradient passes
pub struct LoadedModel {
    pub model: FeatureFusionModel,
    explain_lock: Mutex<()>,
}

impl LoadedModel {
    fn new(model: FeatureFusionModel) -> Self {
        Self {
            model,
            explain_lock: Mutex::new(()),
        }
    }

    /// Held for the duration of one explain pass
    pub fn lock_explain(&self) -> MutexGuard<'_, ()> {
        self.explain_lock.lock()
    }
}

struct Slot {
    path: PathBuf,
    cache: RwLock<Option<Arc<LoadedModel>>>,
}

/// Load state of one gender, as reported by [`ModelPool::get_status`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SlotStatus {
    pub gender: Gender,
    pub served_by: Gender,
    pub loaded: bool,
}

/// Gender-keyed model pool with lazy loading
pub struct ModelPool {
    device: Device,
    arch: ArchitectureConfig,
    male: Slot,
    female: Slot,
    male_served_by: Gender,
    female_served_by: Gender,
}

impl ModelPool {
    /// Resolve checkpoint paths and validate the header of every present
    /// file. Fails if neither file exists or any present file is unreadable.
    pub fn new(models: &ModelsConfig, arch: &ArchitectureConfig, device: Device) -> Result<Self> {
        let male_present = models.male.is_file();
        let female_present = models.female.is_file();

        let (male_served_by, female_served_by) = match (male_present, female_present) {
            (true, true) => (Gender::Male, Gender::Female),
            (true, false) => (Gender::Male, Gender::Male),
            (false, true) => (Gender::Female, Gender::Female),
            (false, false) => {
                return Err(BoneAgeError::CheckpointMissing(format!(
                    "neither {:?} nor {:?} exists",
                    models.male, models.female
                )))
            }
        };

        for path in [&models.male, &models.female] {
            if path.is_file() {
                let info = checkpoint::verify(path)?;
                debug!("Checkpoint {:?} header ok ({} tensors)", path, info.tensor_count);
            }
        }

        for gender in Gender::ALL {
            let served_by = match gender {
                Gender::Male => male_served_by,
                Gender::Female => female_served_by,
            };
            if served_by != gender {
                warn!(
                    "No {} checkpoint found, the {} model will serve {} requests",
                    gender, served_by, gender
                );
            }
        }

        Ok(Self {
            device,
            arch: arch.clone(),
            male: Slot::new(&models.male),
            female: Slot::new(&models.female),
            male_served_by,
            female_served_by,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Gender whose checkpoint answers requests for `gender`
    pub fn served_by(&self, gender: Gender) -> Gender {
        match gender {
            Gender::Male => self.male_served_by,
            Gender::Female => self.female_served_by,
        }
    }

    pub fn is_substituted(&self, gender: Gender) -> bool {
        self.served_by(gender) != gender
    }

    fn slot(&self, gender: Gender) -> &Slot {
        match self.served_by(gender) {
            Gender::Male => &self.male,
            Gender::Female => &self.female,
        }
    }

    /// Get or load the model serving `gender`
    pub fn get(&self, gender: Gender) -> Result<Arc<LoadedModel>> {
        let slot = self.slot(gender);

        // Try read lock first
        if let Some(loaded) = slot.cache.read().as_ref() {
            return Ok(Arc::clone(loaded));
        }

        let mut write_guard = slot.cache.write();

        // Double-check after acquiring write lock
        if let Some(loaded) = write_guard.as_ref() {
            return Ok(Arc::clone(loaded));
        }

        let served_by = self.served_by(gender);
        info!("Loading {} model from {:?}", served_by, slot.path);
        let start = Instant::now();
        let model = checkpoint::load_model(&slot.path, &self.arch, &self.device)?;
        info!("Model {} ready in {:?}", served_by, start.elapsed());

        let loaded = Arc::new(LoadedModel::new(model));
        *write_guard = Some(Arc::clone(&loaded));
        Ok(loaded)
    }

    /// Load every model that serves at least one gender
    pub fn preload(&self) -> Result<()> {
        for gender in Gender::ALL {
            self.get(gender)?;
        }
        Ok(())
    }

    /// Check if the model serving `gender` is resident
    pub fn is_loaded(&self, gender: Gender) -> bool {
        self.slot(gender).cache.read().is_some()
    }

    pub fn get_status(&self) -> Vec<SlotStatus> {
        Gender::ALL
            .iter()
            .map(|&gender| SlotStatus {
                gender,
                served_by: self.served_by(gender),
                loaded: self.is_loaded(gender),
            })
            .collect()
    }
}

impl Slot {
    fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            cache: RwLock::new(None),
        }
    }
}
