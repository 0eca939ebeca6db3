//! Model registry
//!
//! Owns one adapter per capability for the lifetime of the process. Adapters
//! are constructed unloaded, loaded exactly once in capability order, and are
//! read-only afterwards so the registry can be shared behind an `Arc`.

use anyhow::{Context, Result};
use std::time::Instant;
use tracing::{error, info};

use super::adapter_trait::{
    AdapterState, ImageCaptioner, LoadContext, ObjectDetector, TextReader, VisualQa,
};
use super::captioning_runtime::CaptioningRuntime;
use super::detection_runtime::DetectionRuntime;
use super::ocr_runtime::OcrRuntime;
use super::vqa_runtime::VqaRuntime;
use crate::config::Config;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryState {
    Constructed,
    Loading,
    Ready,
    Failed(String),
}

pub struct ModelRegistry {
    state: RegistryState,
    vqa: Box<dyn VisualQa>,
    captioning: Box<dyn ImageCaptioner>,
    ocr: Box<dyn TextReader>,
    object_detection: Box<dyn ObjectDetector>,
}

impl ModelRegistry {
    pub fn new(
        vqa: Box<dyn VisualQa>,
        captioning: Box<dyn ImageCaptioner>,
        ocr: Box<dyn TextReader>,
        object_detection: Box<dyn ObjectDetector>,
    ) -> Self {
        Self {
            state: RegistryState::Constructed,
            vqa,
            captioning,
            ocr,
            object_detection,
        }
    }

    /// Registry backed by the ONNX adapters for the configured model identifiers.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            Box::new(VqaRuntime::new(&config.model_vqa)),
            Box::new(CaptioningRuntime::new(&config.model_captioning)),
            Box::new(OcrRuntime::new(&config.model_ocr)),
            Box::new(DetectionRuntime::new(&config.model_object_detection)),
        )
    }

    /// Load every adapter, in capability order. The first failure moves the
    /// registry to `Failed` and is returned; the remaining adapters are not
    /// attempted.
    pub fn load_all(&mut self, ctx: &LoadContext<'_>) -> Result<()> {
        if self.state != RegistryState::Constructed {
            anyhow::bail!("load_all called on a registry in state {:?}", self.state);
        }

        self.state = RegistryState::Loading;
        info!("🔄 Loading models onto {}", ctx.target.device_string());
        let started = Instant::now();

        match self.load_each(ctx) {
            Ok(()) => {
                self.state = RegistryState::Ready;
                info!(
                    "✅ All models loaded in {:.1}s",
                    started.elapsed().as_secs_f64()
                );
                Ok(())
            }
            Err(e) => {
                error!("Model registry failed to load: {:#}", e);
                self.state = RegistryState::Failed(format!("{:#}", e));
                Err(e)
            }
        }
    }

    fn load_each(&mut self, ctx: &LoadContext<'_>) -> Result<()> {
        self.vqa
            .load(ctx)
            .with_context(|| format!("Failed to load VQA model {}", self.vqa.model_id()))?;
        self.captioning.load(ctx).with_context(|| {
            format!(
                "Failed to load captioning model {}",
                self.captioning.model_id()
            )
        })?;
        self.ocr
            .load(ctx)
            .with_context(|| format!("Failed to load OCR model {}", self.ocr.model_id()))?;
        self.object_detection.load(ctx).with_context(|| {
            format!(
                "Failed to load object detection model {}",
                self.object_detection.model_id()
            )
        })?;
        Ok(())
    }

    pub fn state(&self) -> &RegistryState {
        &self.state
    }

    /// True once `load_all` succeeded and every adapter reports loaded.
    pub fn is_ready(&self) -> bool {
        self.state == RegistryState::Ready
            && [
                self.vqa.state(),
                self.captioning.state(),
                self.ocr.state(),
                self.object_detection.state(),
            ]
            .iter()
            .all(|s| *s == AdapterState::Loaded)
    }

    /// Configured model identifiers in capability order.
    pub fn model_ids(&self) -> [&str; 4] {
        [
            self.vqa.model_id(),
            self.captioning.model_id(),
            self.ocr.model_id(),
            self.object_detection.model_id(),
        ]
    }

    pub fn vqa(&self) -> &dyn VisualQa {
        self.vqa.as_ref()
    }

    pub fn captioning(&self) -> &dyn ImageCaptioner {
        self.captioning.as_ref()
    }

    pub fn ocr(&self) -> &dyn TextReader {
        self.ocr.as_ref()
    }

    pub fn object_detection(&self) -> &dyn ObjectDetector {
        self.object_detection.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model_runtime::adapter_trait::Capability;
    use crate::model_runtime::testing::{mock_registry, MockAdapter, TestEnv};

    #[test]
    fn test_new_registry_is_constructed() {
        let registry = mock_registry();
        assert_eq!(*registry.state(), RegistryState::Constructed);
        assert!(!registry.is_ready());
    }

    #[test]
    fn test_load_all_reaches_ready() {
        let env = TestEnv::new();
        let mut registry = mock_registry();
        registry.load_all(&env.ctx()).unwrap();

        assert_eq!(*registry.state(), RegistryState::Ready);
        assert!(registry.is_ready());
        assert_eq!(registry.vqa().state(), AdapterState::Loaded);
    }

    #[test]
    fn test_load_all_runs_once() {
        let env = TestEnv::new();
        let mut registry = mock_registry();
        registry.load_all(&env.ctx()).unwrap();

        let err = registry.load_all(&env.ctx()).unwrap_err();
        assert!(err.to_string().contains("Ready"));
        assert!(registry.is_ready());
    }

    #[test]
    fn test_failure_stops_loading_and_is_terminal() {
        let env = TestEnv::new();
        let detector = MockAdapter::new(Capability::ObjectDetection, "detector");
        let detector_loads = detector.loads();
        let mut registry = ModelRegistry::new(
            Box::new(MockAdapter::new(Capability::Vqa, "vqa")),
            Box::new(MockAdapter::new(Capability::Captioning, "captioner")),
            Box::new(MockAdapter::new(Capability::Ocr, "reader").failing_load()),
            Box::new(detector),
        );

        let err = registry.load_all(&env.ctx()).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to load OCR model reader"));
        assert!(matches!(registry.state(), RegistryState::Failed(_)));
        assert!(!registry.is_ready());
        assert_eq!(registry.ocr().state(), AdapterState::Failed("weights missing".into()));
        assert_eq!(detector_loads.load(std::sync::atomic::Ordering::SeqCst), 0);

        assert!(registry.load_all(&env.ctx()).is_err());
    }

    #[test]
    fn test_model_ids_follow_capability_order() {
        let registry = mock_registry();
        assert_eq!(
            registry.model_ids(),
            ["vqa-model", "caption-model", "EasyOCR", "detection-model"]
        );
        assert_eq!(registry.object_detection().capability(), Capability::ObjectDetection);
    }

    #[test]
    fn test_from_config_uses_configured_ids() {
        let config = Config::from_vars(|key| match key {
            "MODEL_OCR" => Some("custom-ocr".to_string()),
            _ => None,
        })
        .unwrap();
        let registry = ModelRegistry::from_config(&config);
        assert_eq!(
            registry.model_ids(),
            [
                "dandelin/vilt-b32-finetuned-vqa",
                "Salesforce/blip-image-captioning-base",
                "custom-ocr",
                "facebook/detr-resnet-50"
            ]
        );
    }
}
