//! Visual question answering adapter
//!
//! Joint image + question classifier over a fixed answer vocabulary (ViLT-style
//! export). Expected graph I/O: `input_ids`, `attention_mask`, `token_type_ids`,
//! `pixel_values`, `pixel_mask` in; `logits` `[1, num_answers]` out.

use anyhow::{Context, Result};
use ndarray::{Array2, Array3};
use tokenizers::Tokenizer;

use super::adapter_trait::{
    log_failure, AdapterState, Capability, LoadContext, ModelAdapter, Slot, VisualQa, VqaAnswer,
};
use super::artifacts::Labels;
use super::onnx_session::OnnxModel;
use super::postprocess::{argmax, softmax};
use super::preprocess::{decode_rgb, ImageProcessorConfig};

const DEFAULT_MAX_TOKENS: usize = 40;

struct VqaArtifacts {
    model: OnnxModel,
    tokenizer: Tokenizer,
    processor: ImageProcessorConfig,
    labels: Labels,
    max_tokens: usize,
}

pub struct VqaRuntime {
    model_id: String,
    slot: Slot<VqaArtifacts>,
}

impl VqaRuntime {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            slot: Slot::Unloaded,
        }
    }

    fn run(&self, image: &[u8], question: &str) -> Result<VqaAnswer> {
        let loaded = self.slot.get(&self.model_id)?;

        let image = decode_rgb(image)?;
        let pixel_values = loaded.processor.preprocess(&image);
        let (height, width) = (pixel_values.shape()[2], pixel_values.shape()[3]);
        let pixel_mask = Array3::<i64>::ones((1, height, width));

        let encoding = loaded
            .tokenizer
            .encode(question, true)
            .map_err(anyhow::Error::msg)
            .context("failed to tokenize question")?;
        let input_ids = token_row(encoding.get_ids(), loaded.max_tokens)?;
        let attention_mask = token_row(encoding.get_attention_mask(), loaded.max_tokens)?;
        let token_type_ids = token_row(encoding.get_type_ids(), loaded.max_tokens)?;

        let outputs = loaded.model.session().run(ort::inputs![
            "input_ids" => input_ids.view(),
            "attention_mask" => attention_mask.view(),
            "token_type_ids" => token_type_ids.view(),
            "pixel_values" => pixel_values.view(),
            "pixel_mask" => pixel_mask.view()
        ]?)?;
        let logits: Vec<f32> = outputs["logits"]
            .try_extract_tensor::<f32>()?
            .iter()
            .copied()
            .collect();

        answer_from_logits(&logits, &loaded.labels)
    }
}

/// First `max_tokens` values of an encoding as a `[1, len]` model input.
fn token_row(values: &[u32], max_tokens: usize) -> Result<Array2<i64>> {
    let row: Vec<i64> = values.iter().take(max_tokens).map(|&v| v as i64).collect();
    Ok(Array2::from_shape_vec((1, row.len()), row)?)
}

/// Most probable answer and its softmax probability.
fn answer_from_logits(logits: &[f32], labels: &Labels) -> Result<VqaAnswer> {
    let probabilities = softmax(logits);
    let (index, confidence) = argmax(&probabilities).context("model returned no answer logits")?;
    let answer = labels.resolve(index)?.to_string();

    Ok(VqaAnswer {
        answer,
        confidence: (confidence as f64).clamp(0.0, 1.0),
    })
}

impl ModelAdapter for VqaRuntime {
    fn capability(&self) -> Capability {
        Capability::Vqa
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
            let config = artifacts.model_config()?;
            let labels = config.labels()?;
            let processor = artifacts.image_processor(ImageProcessorConfig::shortest_edge(
                384,
                640,
                [0.5; 3],
                [0.5; 3],
            ))?;
            let tokenizer = Tokenizer::from_file(artifacts.path("tokenizer.json")?)
                .map_err(anyhow::Error::msg)
                .context("failed to load tokenizer.json")?;

            let plan = ctx
                .resolver
                .optimize(ctx.target, artifacts.supports_half_precision("model"));
            let model = OnnxModel::load(&artifacts, "model", &plan)?;

            Ok(VqaArtifacts {
                model,
                tokenizer,
                processor,
                labels,
                max_tokens: config.max_position_embeddings.unwrap_or(DEFAULT_MAX_TOKENS),
            })
        })
    }
}

impl VisualQa for VqaRuntime {
    fn answer(&self, image: &[u8], question: &str) -> Result<VqaAnswer> {
        log_failure(Capability::Vqa, self.run(image, question))
    }
}
