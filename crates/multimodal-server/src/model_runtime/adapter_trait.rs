//! Adapter contracts
//!
//! Every capability shares the load half of the lifecycle through [`ModelAdapter`];
//! the inference half is a separate trait per capability because the inputs
//! genuinely differ (image + question for VQA, image only for the rest).

use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{error, info};

use super::artifacts::ArtifactStore;
use crate::compute_target::{ComputeTarget, DeviceResolver};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    Vqa,
    Captioning,
    Ocr,
    ObjectDetection,
}

impl Capability {
    /// Load and report order.
    pub const ALL: [Capability; 4] = [
        Capability::Vqa,
        Capability::Captioning,
        Capability::Ocr,
        Capability::ObjectDetection,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Vqa => "vqa",
            Capability::Captioning => "captioning",
            Capability::Ocr => "ocr",
            Capability::ObjectDetection => "object_detection",
        }
    }

    /// Phrase used in client-facing error messages.
    pub fn display_name(&self) -> &'static str {
        match self {
            Capability::Vqa => "VQA",
            Capability::Captioning => "captioning",
            Capability::Ocr => "OCR",
            Capability::ObjectDetection => "object detection",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdapterState {
    Unloaded,
    Loaded,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VqaAnswer {
    pub answer: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Caption {
    pub caption: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognizedText {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub label: String,
    pub confidence: f64,
    #[serde(rename = "box")]
    pub bbox: [f64; 4],
}

/// Everything an adapter needs to materialize its artifacts.
pub struct LoadContext<'a> {
    pub store: &'a ArtifactStore,
    pub resolver: &'a DeviceResolver,
    pub target: &'a ComputeTarget,
}

pub trait ModelAdapter: Send + Sync {
    fn capability(&self) -> Capability;

    /// Model identifier, also the artifact key in the cache directory.
    fn model_id(&self) -> &str;

    fn state(&self) -> AdapterState;

    /// Materialize artifacts and bind them to the compute target. A failure is
    /// terminal for the adapter.
    fn load(&mut self, ctx: &LoadContext<'_>) -> anyhow::Result<()>;
}

pub trait VisualQa: ModelAdapter {
    fn answer(&self, image: &[u8], question: &str) -> anyhow::Result<VqaAnswer>;
}

pub trait ImageCaptioner: ModelAdapter {
    fn caption(&self, image: &[u8]) -> anyhow::Result<Caption>;
}

pub trait TextReader: ModelAdapter {
    fn read_text(&self, image: &[u8]) -> anyhow::Result<RecognizedText>;
}

pub trait ObjectDetector: ModelAdapter {
    fn detect(&self, image: &[u8]) -> anyhow::Result<Vec<Detection>>;
}

/// Lifecycle holder shared by the concrete adapters.
pub(crate) enum Slot<T> {
    Unloaded,
    Loaded(T),
    Failed(String),
}

impl<T> Slot<T> {
    pub(crate) fn state(&self) -> AdapterState {
        match self {
            Slot::Unloaded => AdapterState::Unloaded,
            Slot::Loaded(_) => AdapterState::Loaded,
            Slot::Failed(reason) => AdapterState::Failed(reason.clone()),
        }
    }

    pub(crate) fn load_with<F>(&mut self, model_id: &str, build: F) -> anyhow::Result<()>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        match self {
            Slot::Loaded(_) => return Ok(()),
            Slot::Failed(reason) => {
                anyhow::bail!("model {} previously failed to load: {}", model_id, reason)
            }
            Slot::Unloaded => {}
        }

        info!("Loading model: {}", model_id);
        match build() {
            Ok(loaded) => {
                *self = Slot::Loaded(loaded);
                info!("✅ Model {} loaded successfully", model_id);
                Ok(())
            }
            Err(e) => {
                error!("Error loading model {}: {:#}", model_id, e);
                *self = Slot::Failed(format!("{:#}", e));
                Err(e)
            }
        }
    }

    pub(crate) fn get(&self, model_id: &str) -> anyhow::Result<&T> {
        match self {
            Slot::Loaded(loaded) => Ok(loaded),
            Slot::Unloaded => Err(anyhow::anyhow!("model {} is not loaded", model_id)),
            Slot::Failed(reason) => Err(anyhow::anyhow!(
                "model {} failed to load: {}",
                model_id,
                reason
            )),
        }
    }
}

/// Log an inference failure with its capability and hand the error back unchanged.
pub(crate) fn log_failure<T>(capability: Capability, result: anyhow::Result<T>) -> anyhow::Result<T> {
    result.map_err(|e| {
        error!("Error during {} inference: {:#}", capability.display_name(), e);
        e
    })
}
