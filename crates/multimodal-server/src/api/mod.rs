// multimodal-server/src/api/mod.rs
//! API module - HTTP surface for the inference capabilities

pub mod error;
pub mod inference_api;
pub mod status_api;

// Re-export API handlers
pub use error::ApiError;
pub use inference_api::{image_captioning, object_detection, ocr, visual_qa};
pub use status_api::{system_status, SystemStatus};
