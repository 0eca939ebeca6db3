//! Image captioning adapter
//!
//! Encoder/decoder captioner (BLIP-style export) split into two graphs:
//! `vision_model` (`pixel_values` -> `last_hidden_state`) and `text_decoder`
//! (`input_ids`, `attention_mask`, `encoder_hidden_states` -> `logits`).
//! Decoding is greedy and stops at the separator token or the model's
//! default maximum length.

use anyhow::{Context, Result};
use ndarray::{Array2, Array3, Ix3};
use tokenizers::Tokenizer;
use tracing::debug;

use super::adapter_trait::{
    log_failure, AdapterState, Caption, Capability, ImageCaptioner, LoadContext, ModelAdapter, Slot,
};
use super::onnx_session::OnnxModel;
use super::postprocess::argmax;
use super::preprocess::{decode_rgb, ImageProcessorConfig};

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_6, 0.275_777_1];

const DEFAULT_BOS_TOKEN: u32 = 30522;
const DEFAULT_SEP_TOKEN: u32 = 102;
const DEFAULT_MAX_LENGTH: usize = 20;

struct CaptioningArtifacts {
    vision: OnnxModel,
    decoder: OnnxModel,
    tokenizer: Tokenizer,
    processor: ImageProcessorConfig,
    bos_token: u32,
    eos_token: u32,
    max_length: usize,
}

pub struct CaptioningRuntime {
    model_id: String,
    slot: Slot<CaptioningArtifacts>,
}

impl CaptioningRuntime {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            slot: Slot::Unloaded,
        }
    }

    fn run(&self, image: &[u8]) -> Result<Caption> {
        let loaded = self.slot.get(&self.model_id)?;

        let image = decode_rgb(image)?;
        let pixel_values = loaded.processor.preprocess(&image);
        let image_embeds: Array3<f32> = {
            let outputs = loaded
                .vision
                .session()
                .run(ort::inputs!["pixel_values" => pixel_values.view()]?)?;
            let embeds = outputs["last_hidden_state"]
                .try_extract_tensor::<f32>()?
                .into_dimensionality::<Ix3>()?
                .to_owned();
            embeds
        };

        let tokens = greedy_decode(
            loaded.bos_token,
            loaded.eos_token,
            loaded.max_length,
            |sequence| decoder_step(&loaded.decoder, sequence, &image_embeds),
        )?;
        let text = loaded
            .tokenizer
            .decode(&tokens, true)
            .map_err(anyhow::Error::msg)
            .context("failed to decode caption tokens")?;

        caption_from_text(&text)
    }
}

/// Greedy generation from `bos` until `eos` or `max_length` tokens (BOS included).
/// `step` maps the sequence so far to next-token logits. The result excludes
/// BOS and the terminating separator.
fn greedy_decode<F>(bos: u32, eos: u32, max_length: usize, mut step: F) -> Result<Vec<u32>>
where
    F: FnMut(&[i64]) -> Result<Vec<f32>>,
{
    let mut sequence: Vec<i64> = vec![bos as i64];

    while sequence.len() < max_length {
        let logits = step(&sequence)?;
        let (next, _) = argmax(&logits).context("decoder returned no logits")?;
        if next as u32 == eos {
            break;
        }
        sequence.push(next as i64);
    }

    debug!("Caption decode produced {} tokens", sequence.len() - 1);
    Ok(sequence[1..].iter().map(|&t| t as u32).collect())
}

/// Next-token logits for `sequence` conditioned on the image embeddings.
fn decoder_step(decoder: &OnnxModel, sequence: &[i64], image_embeds: &Array3<f32>) -> Result<Vec<f32>> {
    let input_ids = Array2::from_shape_vec((1, sequence.len()), sequence.to_vec())?;
    let attention_mask = Array2::<i64>::ones((1, sequence.len()));

    let outputs = decoder.session().run(ort::inputs![
        "input_ids" => input_ids.view(),
        "attention_mask" => attention_mask.view(),
        "encoder_hidden_states" => image_embeds.view()
    ]?)?;
    let logits = outputs["logits"].try_extract_tensor::<f32>()?;
    let vocab = logits
        .shape()
        .last()
        .copied()
        .context("decoder returned scalar logits")?;
    let flat: Vec<f32> = logits.iter().copied().collect();

    Ok(last_position(&flat, vocab)?.to_vec())
}

/// Logits of the final sequence position in a flattened `[.., vocab]` tensor.
fn last_position(flat: &[f32], vocab: usize) -> Result<&[f32]> {
    let start = flat
        .len()
        .checked_sub(vocab)
        .filter(|_| vocab > 0)
        .with_context(|| format!("decoder returned {} logits for vocab {}", flat.len(), vocab))?;
    Ok(&flat[start..])
}

fn caption_from_text(text: &str) -> Result<Caption> {
    let caption = text.trim();
    if caption.is_empty() {
        anyhow::bail!("model produced an empty caption");
    }
    Ok(Caption {
        caption: caption.to_string(),
    })
}

impl ModelAdapter for CaptioningRuntime {
    fn capability(&self) -> Capability {
        Capability::Captioning
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
            let text = config.text_config.unwrap_or_default();
            let processor = artifacts
                .image_processor(ImageProcessorConfig::fixed(384, 384, CLIP_MEAN, CLIP_STD))?;
            let tokenizer = Tokenizer::from_file(artifacts.path("tokenizer.json")?)
                .map_err(anyhow::Error::msg)
                .context("failed to load tokenizer.json")?;

            let supports_half = artifacts.supports_half_precision("vision_model")
                && artifacts.supports_half_precision("text_decoder");
            let plan = ctx.resolver.optimize(ctx.target, supports_half);
            let vision = OnnxModel::load(&artifacts, "vision_model", &plan)?;
            let decoder = OnnxModel::load(&artifacts, "text_decoder", &plan)?;

            Ok(CaptioningArtifacts {
                vision,
                decoder,
                tokenizer,
                processor,
                bos_token: text.bos_token_id.unwrap_or(DEFAULT_BOS_TOKEN),
                eos_token: text
                    .sep_token_id
                    .or(text.eos_token_id)
                    .unwrap_or(DEFAULT_SEP_TOKEN),
                max_length: text.max_length.unwrap_or(DEFAULT_MAX_LENGTH).max(2),
            })
        })
    }
}

impl ImageCaptioner for CaptioningRuntime {
    fn caption(&self, image: &[u8]) -> Result<Caption> {
        log_failure(Capability::Captioning, self.run(image))
    }
}
