//! On-disk artifact store.
//!
//! Layout: `<root>/<family>/<location>/{model.bin, preproc.json, meta.json}`.
//! A bundle is loaded all-or-nothing: a missing or malformed file fails the
//! whole load.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use thiserror::Error;

use super::cache::ArtifactKey;
use super::model::{ArtifactBundle, ModelFamily, ModelMetadata, PersistedPredictor};
use super::preprocessing::{OccupancyScaler, OneHotEncoder};

pub const MODEL_FILE: &str = "model.bin";
pub const PREPROC_FILE: &str = "preproc.json";
pub const META_FILE: &str = "meta.json";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ArtifactError {
    #[error("unknown model family: {0}")]
    UnknownFamily(String),
    #[error("missing artifact: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("I/O error: {0}")]
    Io(String),
    #[error("failed to serialize artifact: {0}")]
    Serialize(String),
    #[error("failed to deserialize {file}: {message}")]
    Deserialize { file: String, message: String },
    #[error("version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: String, found: String },
    #[error("invalid artifact bundle: {0}")]
    InvalidBundle(String),
}

/// Contents of `model.bin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedModel {
    pub format_version: u32,
    pub predictor: PersistedPredictor,
}

impl PersistedModel {
    /// Current format version number
    pub const CURRENT_VERSION: u32 = 1;

    pub fn new(predictor: PersistedPredictor) -> Self {
        Self {
            format_version: Self::CURRENT_VERSION,
            predictor,
        }
    }
}

/// Contents of `preproc.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PreprocessingBundle {
    pub window: usize,
    #[serde(default)]
    pub feature_order: Option<Vec<String>>,
    #[serde(default)]
    pub occ_scaler: Option<OccupancyScaler>,
    #[serde(default)]
    pub ohe: Option<OneHotEncoder>,
}

/// Contents of `meta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactMeta {
    #[serde(default = "default_model_version")]
    pub model_version: String,
    #[serde(default)]
    pub model_family: Option<String>,
}

fn default_model_version() -> String {
    "v1".to_string()
}

/// Anything that can produce an artifact bundle for a key.
pub trait ArtifactSource: Send + Sync {
    fn load(&self, key: &ArtifactKey) -> Result<ArtifactBundle, ArtifactError>;
}

/// Artifact directory tree rooted at `root`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, family: ModelFamily, location: &str) -> PathBuf {
        self.root.join(family.as_str()).join(location)
    }

    /// Paths of the three files making up a bundle.
    pub fn paths(&self, family: ModelFamily, location: &str) -> [PathBuf; 3] {
        let dir = self.dir(family, location);
        [dir.join(MODEL_FILE), dir.join(PREPROC_FILE), dir.join(META_FILE)]
    }

    /// Whether all three artifact files are present.
    pub fn exists(&self, family: ModelFamily, location: &str) -> bool {
        self.paths(family, location).iter().all(|p| p.is_file())
    }

    fn check_exists(&self, family: ModelFamily, location: &str) -> Result<(), ArtifactError> {
        match self.paths(family, location).into_iter().find(|p| !p.is_file()) {
            Some(missing) => Err(ArtifactError::MissingFile(missing)),
            None => Ok(()),
        }
    }

    pub fn read_meta(&self, family: ModelFamily, location: &str) -> Result<ArtifactMeta, ArtifactError> {
        read_json(&self.dir(family, location).join(META_FILE))
    }

    /// Model version recorded in `meta.json`.
    pub fn read_version(&self, family: ModelFamily, location: &str) -> Result<String, ArtifactError> {
        self.read_meta(family, location).map(|m| m.model_version)
    }

    /// Load and validate a bundle. `version` must match `meta.json`.
    pub fn load_bundle(
        &self,
        family: ModelFamily,
        location: &str,
        version: &str,
    ) -> Result<ArtifactBundle, ArtifactError> {
        self.check_exists(family, location)?;
        let [model_path, preproc_path, meta_path] = self.paths(family, location);

        let bytes = fs::read(&model_path).map_err(|e| ArtifactError::Io(e.to_string()))?;
        let model: PersistedModel =
            bincode::deserialize(&bytes).map_err(|e| ArtifactError::Deserialize {
                file: MODEL_FILE.to_string(),
                message: e.to_string(),
            })?;
        if model.format_version != PersistedModel::CURRENT_VERSION {
            return Err(ArtifactError::VersionMismatch {
                expected: PersistedModel::CURRENT_VERSION.to_string(),
                found: model.format_version.to_string(),
            });
        }

        let preproc: PreprocessingBundle = read_json(&preproc_path)?;
        let meta: ArtifactMeta = read_json(&meta_path)?;

        if meta.model_version != version {
            return Err(ArtifactError::VersionMismatch {
                expected: version.to_string(),
                found: meta.model_version,
            });
        }
        if let Some(recorded) = &meta.model_family {
            let recorded: ModelFamily = recorded.parse()?;
            if recorded != family {
                return Err(ArtifactError::InvalidBundle(format!(
                    "meta.json records family {recorded}, stored under {family}"
                )));
            }
        }

        let mut bundle = ArtifactBundle::new(
            model.predictor.into_predictor(),
            preproc.window,
            ModelMetadata {
                model_version: meta.model_version,
                family,
            },
        );
        bundle.scaler = preproc.occ_scaler;
        bundle.encoder = preproc.ohe;
        bundle.feature_order = preproc.feature_order.unwrap_or_default();
        bundle.validate().map_err(ArtifactError::InvalidBundle)?;

        tracing::info!(
            family = %family,
            location,
            version,
            window = bundle.window_size,
            hybrid = bundle.supports_hybrid(),
            "Loaded artifact bundle"
        );
        Ok(bundle)
    }

    /// Write the three artifact files, creating directories as needed.
    pub fn save(
        &self,
        family: ModelFamily,
        location: &str,
        model: &PersistedModel,
        preproc: &PreprocessingBundle,
        meta: &ArtifactMeta,
    ) -> Result<(), ArtifactError> {
        let dir = self.dir(family, location);
        fs::create_dir_all(&dir).map_err(|e| ArtifactError::Io(e.to_string()))?;

        let bytes =
            bincode::serialize(model).map_err(|e| ArtifactError::Serialize(e.to_string()))?;
        fs::write(dir.join(MODEL_FILE), bytes).map_err(|e| ArtifactError::Io(e.to_string()))?;

        write_json(&dir.join(PREPROC_FILE), preproc)?;
        write_json(&dir.join(META_FILE), meta)?;
        Ok(())
    }

    /// Families with a complete bundle for `location`, with their versions.
    pub fn list_families(&self, location: &str) -> Vec<(ModelFamily, Option<String>)> {
        ModelFamily::ALL
            .into_iter()
            .filter(|f| self.exists(*f, location))
            .map(|f| (f, self.read_version(f, location).ok()))
            .collect()
    }

    /// Location ids present under any family directory.
    pub fn list_locations(&self) -> BTreeSet<String> {
        ModelFamily::ALL
            .into_iter()
            .filter_map(|f| fs::read_dir(self.root.join(f.as_str())).ok())
            .flat_map(|entries| entries.filter_map(|e| e.ok()))
            .filter(|e| e.path().is_dir())
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect()
    }
}

impl ArtifactSource for ArtifactStore {
    fn load(&self, key: &ArtifactKey) -> Result<ArtifactBundle, ArtifactError> {
        self.load_bundle(key.family, &key.location, &key.version)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T, ArtifactError> {
    if !path.is_file() {
        return Err(ArtifactError::MissingFile(path.to_path_buf()));
    }
    let text = fs::read_to_string(path).map_err(|e| ArtifactError::Io(e.to_string()))?;
    serde_json::from_str(&text).map_err(|e| ArtifactError::Deserialize {
        file: path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default(),
        message: e.to_string(),
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ArtifactError> {
    let text =
        serde_json::to_string_pretty(value).map_err(|e| ArtifactError::Serialize(e.to_string()))?;
    fs::write(path, text).map_err(|e| ArtifactError::Io(e.to_string()))
}
