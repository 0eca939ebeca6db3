//! Test doubles for the adapter traits.

use anyhow::Result;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::adapter_trait::{
    AdapterState, Caption, Capability, Detection, ImageCaptioner, LoadContext, ModelAdapter,
    ObjectDetector, RecognizedText, Slot, TextReader, VisualQa, VqaAnswer,
};
use super::artifacts::ArtifactStore;
use super::registry::ModelRegistry;
use crate::compute_target::{ComputeTarget, DeviceResolver, StaticProbe};

/// Adapter that implements every capability with canned results and counts
/// how often it is loaded and invoked.
pub struct MockAdapter {
    capability: Capability,
    model_id: String,
    slot: Slot<()>,
    fail_load: bool,
    fail_infer: Option<String>,
    loads: Arc<AtomicUsize>,
    calls: Arc<AtomicUsize>,
}

impl MockAdapter {
    pub fn new(capability: Capability, model_id: &str) -> Self {
        Self {
            capability,
            model_id: model_id.to_string(),
            slot: Slot::Unloaded,
            fail_load: false,
            fail_infer: None,
            loads: Arc::new(AtomicUsize::new(0)),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_load(mut self) -> Self {
        self.fail_load = true;
        self
    }

    pub fn failing_inference(mut self, message: &str) -> Self {
        self.fail_infer = Some(message.to_string());
        self
    }

    pub fn loads(&self) -> Arc<AtomicUsize> {
        self.loads.clone()
    }

    pub fn calls(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    fn invoke<T>(&self, result: T) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.slot.get(&self.model_id)?;
        match &self.fail_infer {
            Some(message) => Err(anyhow::anyhow!("{}", message)),
            None => Ok(result),
        }
    }
}

impl ModelAdapter for MockAdapter {
    fn capability(&self) -> Capability {
        self.capability
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn state(&self) -> AdapterState {
        self.slot.state()
    }

    fn load(&mut self, _ctx: &LoadContext<'_>) -> Result<()> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail_load;
        let model_id = self.model_id.clone();
        self.slot.load_with(&model_id, || {
            if fail {
                anyhow::bail!("weights missing");
            }
            Ok(())
        })
    }
}

impl VisualQa for MockAdapter {
    fn answer(&self, _image: &[u8], _question: &str) -> Result<VqaAnswer> {
        self.invoke(VqaAnswer {
            answer: "2".to_string(),
            confidence: 0.87,
        })
    }
}

impl ImageCaptioner for MockAdapter {
    fn caption(&self, _image: &[u8]) -> Result<Caption> {
        self.invoke(Caption {
            caption: "a cat sitting on a couch".to_string(),
        })
    }
}

impl TextReader for MockAdapter {
    fn read_text(&self, _image: &[u8]) -> Result<RecognizedText> {
        self.invoke(RecognizedText {
            text: "STOP".to_string(),
        })
    }
}

impl ObjectDetector for MockAdapter {
    fn detect(&self, _image: &[u8]) -> Result<Vec<Detection>> {
        self.invoke(vec![Detection {
            label: "cat".to_string(),
            confidence: 0.998,
            bbox: [12.5, 40.0, 310.25, 280.0],
        }])
    }
}

/// Unloaded registry of mocks with fixed model identifiers.
pub fn mock_registry() -> ModelRegistry {
    ModelRegistry::new(
        Box::new(MockAdapter::new(Capability::Vqa, "vqa-model")),
        Box::new(MockAdapter::new(Capability::Captioning, "caption-model")),
        Box::new(MockAdapter::new(Capability::Ocr, "EasyOCR")),
        Box::new(MockAdapter::new(Capability::ObjectDetection, "detection-model")),
    )
}

/// Owns what a `LoadContext` borrows: an empty cache and a CPU-only resolver.
pub struct TestEnv {
    _cache: tempfile::TempDir,
    pub store: ArtifactStore,
    pub resolver: DeviceResolver,
    pub target: ComputeTarget,
}

impl TestEnv {
    pub fn new() -> Self {
        let cache = tempfile::TempDir::new().expect("tempdir");
        let store = ArtifactStore::new(cache.path());
        Self {
            _cache: cache,
            store,
            resolver: DeviceResolver::new(Arc::new(StaticProbe::default())),
            target: ComputeTarget::cpu(),
        }
    }

    pub fn ctx(&self) -> LoadContext<'_> {
        LoadContext {
            store: &self.store,
            resolver: &self.resolver,
            target: &self.target,
        }
    }
}
