//! Artifact store
//!
//! Resolves a model identifier to its directory inside the cache and reads the
//! JSON side files that accompany each exported graph. Two layouts are accepted:
//! a plain `<cache>/<org>/<name>/` directory, and the pretrained-hub cache layout
//! `<cache>/models--<org>--<name>/snapshots/<revision>/`.

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::preprocess::ImageProcessorConfig;
use crate::compute_target::Precision;

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn resolve(&self, model_id: &str) -> Result<ModelArtifacts> {
        let plain = self.root.join(model_id);
        if plain.is_dir() {
            debug!("Using plain artifact directory {}", plain.display());
            return Ok(ModelArtifacts::new(model_id, plain));
        }

        let hub = self
            .root
            .join(format!("models--{}", model_id.replace('/', "--")));
        if hub.is_dir() {
            let snapshot = Self::hub_snapshot(&hub)?;
            debug!("Using hub snapshot {}", snapshot.display());
            return Ok(ModelArtifacts::new(model_id, snapshot));
        }

        Err(anyhow::anyhow!(
            "No artifacts for model {} under {} (looked for {} and {})",
            model_id,
            self.root.display(),
            plain.display(),
            hub.display()
        ))
    }

    fn hub_snapshot(hub: &Path) -> Result<PathBuf> {
        let snapshots = hub.join("snapshots");

        if let Ok(revision) = fs::read_to_string(hub.join("refs").join("main")) {
            let pinned = snapshots.join(revision.trim());
            if pinned.is_dir() {
                return Ok(pinned);
            }
        }

        let mut revisions: Vec<PathBuf> = fs::read_dir(&snapshots)
            .with_context(|| format!("Failed to list snapshots in {}", snapshots.display()))?
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.is_dir())
            .collect();
        revisions.sort();

        revisions
            .pop()
            .ok_or_else(|| anyhow::anyhow!("No snapshot found in {}", snapshots.display()))
    }
}

#[derive(Debug, Clone)]
pub struct ModelArtifacts {
    model_id: String,
    dir: PathBuf,
}

impl ModelArtifacts {
    pub fn new(model_id: &str, dir: PathBuf) -> Self {
        Self {
            model_id: model_id.to_string(),
            dir,
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Path of a required file in the artifact directory.
    pub fn path(&self, file: &str) -> Result<PathBuf> {
        let path = self.dir.join(file);
        if path.is_file() {
            Ok(path)
        } else {
            Err(anyhow::anyhow!(
                "Missing artifact {} for model {} in {}",
                file,
                self.model_id,
                self.dir.display()
            ))
        }
    }

    fn find_graph(&self, file_name: &str) -> Option<PathBuf> {
        [self.dir.join(file_name), self.dir.join("onnx").join(file_name)]
            .into_iter()
            .find(|p| p.is_file())
    }

    /// Whether a reduced-precision export of `stem` ships with the artifacts.
    /// Its tensor I/O types are checked once a session is built from it.
    pub fn supports_half_precision(&self, stem: &str) -> bool {
        self.find_graph(&format!("{}_fp16.onnx", stem)).is_some()
    }

    pub fn graph(&self, stem: &str, precision: Precision) -> Result<PathBuf> {
        let file_name = match precision {
            Precision::Float16 => format!("{}_fp16.onnx", stem),
            Precision::Float32 => format!("{}.onnx", stem),
        };
        self.find_graph(&file_name).ok_or_else(|| {
            anyhow::anyhow!(
                "Missing graph {} for model {} in {}",
                file_name,
                self.model_id,
                self.dir.display()
            )
        })
    }

    pub fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<T> {
        let path = self.path(file)?;
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn model_config(&self) -> Result<ModelConfig> {
        self.read_json("config.json")
    }

    /// `preprocessor_config.json` when present, otherwise `fallback`.
    pub fn image_processor(&self, fallback: ImageProcessorConfig) -> Result<ImageProcessorConfig> {
        if self.dir.join("preprocessor_config.json").is_file() {
            self.read_json("preprocessor_config.json")
        } else {
            info!(
                "No preprocessor_config.json for {}, using built-in preprocessing defaults",
                self.model_id
            );
            Ok(fallback)
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ModelConfig {
    #[serde(default)]
    pub id2label: HashMap<String, String>,
    #[serde(default)]
    pub max_position_embeddings: Option<usize>,
    #[serde(default)]
    pub text_config: Option<TextConfig>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TextConfig {
    #[serde(default)]
    pub bos_token_id: Option<u32>,
    #[serde(default)]
    pub sep_token_id: Option<u32>,
    #[serde(default)]
    pub eos_token_id: Option<u32>,
    #[serde(default)]
    pub max_length: Option<usize>,
}

impl ModelConfig {
    pub fn labels(&self) -> Result<Labels> {
        let mut labels = HashMap::with_capacity(self.id2label.len());
        for (id, label) in &self.id2label {
            let id: usize = id
                .parse()
                .with_context(|| format!("id2label key '{}' is not an integer", id))?;
            labels.insert(id, label.clone());
        }
        if labels.is_empty() {
            anyhow::bail!("config.json has an empty id2label map");
        }
        Ok(Labels(labels))
    }
}

/// Integer class id to label map.
#[derive(Debug, Clone, Default)]
pub struct Labels(HashMap<usize, String>);

impl Labels {
    pub fn get(&self, id: usize) -> Option<&str> {
        self.0.get(&id).map(String::as_str)
    }

    pub fn resolve(&self, id: usize) -> Result<&str> {
        self.get(id)
            .ok_or_else(|| anyhow::anyhow!("class id {} is missing from id2label", id))
    }
}

impl FromIterator<(usize, String)> for Labels {
    fn from_iter<I: IntoIterator<Item = (usize, String)>>(iter: I) -> Self {
        Labels(iter.into_iter().collect())
    }
}
