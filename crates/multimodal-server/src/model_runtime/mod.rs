//! Model Runtime Module
//!
//! Hosts the four inference capabilities (VQA, captioning, OCR, object
//! detection) behind capability-specific adapter traits that share one load
//! lifecycle.
//!
//! Architecture:
//! - Each capability has its own adapter over ONNX Runtime sessions
//! - Artifacts are resolved from the local model cache by model identifier
//! - Sessions are bound to the resolved compute target at load time
//! - The registry loads every adapter once at startup and is read-only afterwards
pub mod adapter_trait;
pub mod artifacts;
pub mod captioning_runtime;
pub mod detection_runtime;
pub mod ocr_runtime;
pub mod onnx_session;
pub mod postprocess;
pub mod preprocess;
pub mod registry;
pub mod vqa_runtime;

#[cfg(test)]
pub(crate) mod testing;

pub use adapter_trait::{
    AdapterState, Caption, Capability, Detection, ImageCaptioner, LoadContext, ModelAdapter,
    ObjectDetector, RecognizedText, TextReader, VisualQa, VqaAnswer,
};
pub use artifacts::{ArtifactStore, ModelArtifacts};
pub use captioning_runtime::CaptioningRuntime;
pub use detection_runtime::DetectionRuntime;
pub use ocr_runtime::OcrRuntime;
pub use registry::{ModelRegistry, RegistryState};
pub use vqa_runtime::VqaRuntime;
