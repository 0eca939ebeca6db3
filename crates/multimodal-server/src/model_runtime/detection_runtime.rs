//! Object detection adapter
//!
//! Set-prediction detector (DETR-style export): `pixel_values` in, `logits`
//! `[1, queries, classes + 1]` and `pred_boxes` `[1, queries, 4]` out. Boxes are
//! reported in the pixel space of the uploaded image, not the resized input.

use anyhow::{Context, Result};
use tracing::debug;

use super::adapter_trait::{
    log_failure, AdapterState, Capability, Detection, LoadContext, ModelAdapter, ObjectDetector,
    Slot,
};
use super::artifacts::Labels;
use super::onnx_session::OnnxModel;
use super::postprocess::{detections_from_queries, DETECTION_THRESHOLD};
use super::preprocess::{decode_rgb, ImageProcessorConfig, IMAGENET_MEAN, IMAGENET_STD};

struct DetectionArtifacts {
    model: OnnxModel,
    processor: ImageProcessorConfig,
    labels: Labels,
}

pub struct DetectionRuntime {
    model_id: String,
    slot: Slot<DetectionArtifacts>,
}

impl DetectionRuntime {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            slot: Slot::Unloaded,
        }
    }

    fn run(&self, image: &[u8]) -> Result<Vec<Detection>> {
        let loaded = self.slot.get(&self.model_id)?;

        let image = decode_rgb(image)?;
        let original_size = image.dimensions();
        let pixel_values = loaded.processor.preprocess(&image);

        let outputs = loaded
            .model
            .session()
            .run(ort::inputs!["pixel_values" => pixel_values.view()]?)?;
        let logits = outputs["logits"].try_extract_tensor::<f32>()?;
        let boxes = outputs["pred_boxes"].try_extract_tensor::<f32>()?;

        let num_queries = *logits
            .shape()
            .get(1)
            .context("detector logits have no query dimension")?;
        let logits: Vec<f32> = logits.iter().copied().collect();
        let boxes: Vec<f32> = boxes.iter().copied().collect();

        let detections = detections_from_queries(
            &logits,
            &boxes,
            num_queries,
            original_size,
            DETECTION_THRESHOLD,
            &loaded.labels,
        )?;
        debug!(
            "{} of {} queries above threshold {}",
            detections.len(),
            num_queries,
            DETECTION_THRESHOLD
        );
        Ok(detections)
    }
}

impl ModelAdapter for DetectionRuntime {
    fn capability(&self) -> Capability {
        Capability::ObjectDetection
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn state(&self) -> AdapterState {
        self.slot.state()
    }

    fn load(&mut self, ctx: &LoadContext<'_>) -> Result<()> {
        let model_id = self.model_id.clone();
        self.slot.load_with(&model_id, || {
            let artifacts = ctx.store.resolve(&model_id)?;
            let labels = artifacts.model_config()?.labels()?;
            let processor = artifacts.image_processor(ImageProcessorConfig::shortest_edge(
                800,
                1333,
                IMAGENET_MEAN,
                IMAGENET_STD,
            ))?;

            let plan = ctx
                .resolver
                .optimize(ctx.target, artifacts.supports_half_precision("model"));
            let model = OnnxModel::load(&artifacts, "model", &plan)?;

            Ok(DetectionArtifacts {
                model,
                processor,
                labels,
            })
        })
    }
}

impl ObjectDetector for DetectionRuntime {
    fn detect(&self, image: &[u8]) -> Result<Vec<Detection>> {
        log_failure(Capability::ObjectDetection, self.run(image))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compute_target::{ComputeTarget, DeviceResolver, StaticProbe};
    use crate::model_runtime::artifacts::ArtifactStore;
    use std::fs;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_detect_before_load_fails() {
        let adapter = DetectionRuntime::new("facebook/detr-resnet-50");
        assert_eq!(adapter.capability(), Capability::ObjectDetection);
        let err = adapter.detect(b"not an image").unwrap_err();
        assert!(err.to_string().contains("not loaded"));
    }

    #[test]
    fn test_load_requires_label_map() {
        let cache = TempDir::new().unwrap();
        let dir = cache.path().join("facebook/detr-resnet-50");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.json"), r#"{"id2label": {}}"#).unwrap();

        let store = ArtifactStore::new(cache.path());
        let resolver = DeviceResolver::new(Arc::new(StaticProbe::default()));
        let target = ComputeTarget::cpu();
        let ctx = LoadContext {
            store: &store,
            resolver: &resolver,
            target: &target,
        };

        let mut adapter = DetectionRuntime::new("facebook/detr-resnet-50");
        assert!(adapter.load(&ctx).is_err());
        assert!(matches!(adapter.state(), AdapterState::Failed(_)));
    }
}
