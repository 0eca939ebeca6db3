//! Optical character recognition adapter
//!
//! Two-stage reader in the EasyOCR mould:
//! - `detector` (CRAFT): `input` `[1, 3, H, W]` -> `y` `[1, H/2, W/2, 2]` holding
//!   the region score and the link score per pixel.
//! - `recognizer` (CRNN): `input` `[1, 1, 64, W]` grayscale crop -> `output`
//!   `[1, T, classes]`, decoded with greedy CTC against the charset in `ocr.json`.
//!
//! Regions are read in the order the detector's score map yields them
//! (top-to-bottom raster order of each region's first pixel).

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::{GrayImage, RgbImage};
use ndarray::Array4;
use rayon::prelude::*;
use serde::Deserialize;
use std::collections::VecDeque;
use tracing::debug;

use super::adapter_trait::{
    log_failure, AdapterState, Capability, LoadContext, ModelAdapter, RecognizedText, Slot,
    TextReader,
};
use super::onnx_session::OnnxModel;
use super::postprocess::{ctc_greedy_decode, join_fragments};
use super::preprocess::{decode_rgb, to_nchw, IMAGENET_MEAN, IMAGENET_STD};

/// Minimum number of score-map pixels in a region.
const MIN_REGION_PIXELS: usize = 10;

#[derive(Debug, Clone, Deserialize)]
pub struct OcrSettings {
    pub characters: String,
    #[serde(default = "default_text_threshold")]
    pub text_threshold: f32,
    #[serde(default = "default_low_text")]
    pub low_text: f32,
    #[serde(default = "default_link_threshold")]
    pub link_threshold: f32,
    #[serde(default = "default_canvas_size")]
    pub canvas_size: u32,
    #[serde(default = "default_mag_ratio")]
    pub mag_ratio: f32,
    #[serde(default = "default_min_size")]
    pub min_size: u32,
    #[serde(default = "default_recognizer_height")]
    pub recognizer_height: u32,
    #[serde(default = "default_recognizer_max_width")]
    pub recognizer_max_width: u32,
}

fn default_text_threshold() -> f32 {
    0.7
}
fn default_low_text() -> f32 {
    0.4
}
fn default_link_threshold() -> f32 {
    0.4
}
fn default_canvas_size() -> u32 {
    2560
}
fn default_mag_ratio() -> f32 {
    1.0
}
fn default_min_size() -> u32 {
    20
}
fn default_recognizer_height() -> u32 {
    64
}
fn default_recognizer_max_width() -> u32 {
    2560
}

/// Text region in score-map coordinates (inclusive bounds).
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct Region {
    pub min_x: usize,
    pub min_y: usize,
    pub max_x: usize,
    pub max_y: usize,
    pub size: usize,
    pub peak: f32,
}

/// Axis-aligned crop in original image pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TextBox {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

struct OcrArtifacts {
    detector: OnnxModel,
    recognizer: OnnxModel,
    settings: OcrSettings,
    charset: Vec<char>,
}

pub struct OcrRuntime {
    model_id: String,
    slot: Slot<OcrArtifacts>,
}

impl OcrRuntime {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            slot: Slot::Unloaded,
        }
    }

    fn run(&self, image: &[u8]) -> Result<RecognizedText> {
        let loaded = self.slot.get(&self.model_id)?;
        let image = decode_rgb(image)?;

        let boxes = detect_boxes(loaded, &image)?;
        debug!("OCR detector returned {} text regions", boxes.len());

        let gray = imageops::grayscale(&image);
        let fragments = boxes
            .par_iter()
            .map(|b| recognize(loaded, &gray, b))
            .collect::<Result<Vec<String>>>()?;

        Ok(RecognizedText {
            text: join_fragments(fragments.iter().filter(|f| !f.trim().is_empty())),
        })
    }
}

fn detect_boxes(loaded: &OcrArtifacts, image: &RgbImage) -> Result<Vec<TextBox>> {
    let settings = &loaded.settings;
    let (canvas, ratio) = detector_canvas(image, settings.canvas_size, settings.mag_ratio);
    let input = to_nchw(&canvas, 1.0 / 255.0, IMAGENET_MEAN, IMAGENET_STD);

    let outputs = loaded
        .detector
        .session()
        .run(ort::inputs!["input" => input.view()]?)?;
    let scores = outputs["y"].try_extract_tensor::<f32>()?;
    let shape = scores.shape().to_vec();
    if shape.len() != 4 || shape[3] != 2 {
        anyhow::bail!("unexpected detector output shape {:?}", shape);
    }
    let (map_h, map_w) = (shape[1], shape[2]);

    let mut text = Vec::with_capacity(map_h * map_w);
    let mut link = Vec::with_capacity(map_h * map_w);
    for pair in scores.iter().copied().collect::<Vec<f32>>().chunks_exact(2) {
        text.push(pair[0]);
        link.push(pair[1]);
    }

    // Score map is half the canvas resolution.
    let to_original = 2.0 / ratio;
    let boxes = find_regions(&text, &link, map_w, map_h, settings)
        .into_iter()
        .filter_map(|r| scale_region(&r, to_original, image.width(), image.height()))
        .filter(|b| b.width.max(b.height) >= settings.min_size)
        .collect();
    Ok(boxes)
}

/// Aspect-preserving resize so the long side is `mag_ratio * long side`, capped
/// at `canvas_size`, padded with black to multiples of 32. Returns the canvas
/// and the applied scale.
fn detector_canvas(image: &RgbImage, canvas_size: u32, mag_ratio: f32) -> (RgbImage, f32) {
    let (width, height) = image.dimensions();
    let long_side = width.max(height).max(1) as f32;
    let target = (mag_ratio * long_side).min(canvas_size as f32);
    let ratio = target / long_side;

    let target_w = ((width as f32 * ratio) as u32).max(1);
    let target_h = ((height as f32 * ratio) as u32).max(1);
    let resized = imageops::resize(image, target_w, target_h, FilterType::Triangle);

    let padded_w = target_w.div_ceil(32) * 32;
    let padded_h = target_h.div_ceil(32) * 32;
    let mut canvas = RgbImage::new(padded_w, padded_h);
    imageops::replace(&mut canvas, &resized, 0, 0);
    (canvas, ratio)
}

/// Connected text regions (4-connectivity) of the thresholded score maps.
pub(crate) fn find_regions(
    text: &[f32],
    link: &[f32],
    width: usize,
    height: usize,
    settings: &OcrSettings,
) -> Vec<Region> {
    let mask: Vec<bool> = text
        .iter()
        .zip(link)
        .map(|(&t, &l)| t > settings.low_text || l > settings.link_threshold)
        .collect();
    let mut visited = vec![false; mask.len()];
    let mut regions = Vec::new();
    let mut queue = VecDeque::new();

    for start in 0..mask.len() {
        if !mask[start] || visited[start] {
            continue;
        }
        visited[start] = true;
        queue.push_back(start);

        let mut region = Region {
            min_x: start % width,
            min_y: start / width,
            max_x: start % width,
            max_y: start / width,
            size: 0,
            peak: f32::NEG_INFINITY,
        };

        while let Some(index) = queue.pop_front() {
            let (x, y) = (index % width, index / width);
            region.min_x = region.min_x.min(x);
            region.max_x = region.max_x.max(x);
            region.min_y = region.min_y.min(y);
            region.max_y = region.max_y.max(y);
            region.size += 1;
            region.peak = region.peak.max(text[index]);

            let mut visit = |neighbor: usize| {
                if mask[neighbor] && !visited[neighbor] {
                    visited[neighbor] = true;
                    queue.push_back(neighbor);
                }
            };
            if x > 0 {
                visit(index - 1);
            }
            if x + 1 < width {
                visit(index + 1);
            }
            if y > 0 {
                visit(index - width);
            }
            if y + 1 < height {
                visit(index + width);
            }
        }

        if region.size < MIN_REGION_PIXELS || region.peak < settings.text_threshold {
            continue;
        }

        // Grow the box in proportion to how thin the region is.
        let (w, h) = (region.max_x - region.min_x + 1, region.max_y - region.min_y + 1);
        let grow = (((region.size * w.min(h)) as f32 / (w * h) as f32).sqrt() * 2.0) as usize;
        region.min_x = region.min_x.saturating_sub(grow);
        region.min_y = region.min_y.saturating_sub(grow);
        region.max_x = (region.max_x + grow).min(width - 1);
        region.max_y = (region.max_y + grow).min(height - 1);

        regions.push(region);
    }

    regions
}

fn scale_region(region: &Region, scale: f32, image_w: u32, image_h: u32) -> Option<TextBox> {
    let x0 = ((region.min_x as f32 * scale) as u32).min(image_w);
    let y0 = ((region.min_y as f32 * scale) as u32).min(image_h);
    let x1 = (((region.max_x + 1) as f32 * scale).ceil() as u32).min(image_w);
    let y1 = (((region.max_y + 1) as f32 * scale).ceil() as u32).min(image_h);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(TextBox {
        x: x0,
        y: y0,
        width: x1 - x0,
        height: y1 - y0,
    })
}

/// Width of a crop scaled to the recognizer height, aspect kept, within
/// `[target_h / 4, max_w]`.
fn recognizer_width(crop_w: u32, crop_h: u32, target_h: u32, max_w: u32) -> u32 {
    let scaled = (crop_w as f32 * target_h as f32 / crop_h.max(1) as f32).ceil() as u32;
    let min_w = (target_h / 4).max(1);
    scaled.clamp(min_w, max_w.max(min_w))
}

fn recognize(loaded: &OcrArtifacts, gray: &GrayImage, text_box: &TextBox) -> Result<String> {
    let crop = imageops::crop_imm(gray, text_box.x, text_box.y, text_box.width, text_box.height)
        .to_image();
    let target_h = loaded.settings.recognizer_height;
    let target_w = recognizer_width(
        crop.width(),
        crop.height(),
        target_h,
        loaded.settings.recognizer_max_width,
    );
    let resized = imageops::resize(&crop, target_w, target_h, FilterType::Triangle);

    let mut input = Array4::<f32>::zeros((1, 1, target_h as usize, target_w as usize));
    for (x, y, pixel) in resized.enumerate_pixels() {
        input[[0, 0, y as usize, x as usize]] = (pixel[0] as f32 / 255.0 - 0.5) / 0.5;
    }

    let outputs = loaded
        .recognizer
        .session()
        .run(ort::inputs!["input" => input.view()]?)?;
    let scores = outputs["output"].try_extract_tensor::<f32>()?;
    let classes = scores
        .shape()
        .last()
        .copied()
        .context("recognizer returned a scalar")?;
    let flat: Vec<f32> = scores.iter().copied().collect();

    Ok(ctc_greedy_decode(&flat, classes, &loaded.charset))
}

impl ModelAdapter for OcrRuntime {
    fn capability(&self) -> Capability {
        Capability::Ocr
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
            let settings: OcrSettings = artifacts.read_json("ocr.json")?;
            if settings.characters.is_empty() {
                anyhow::bail!("ocr.json declares an empty character set");
            }

            let supports_half = artifacts.supports_half_precision("detector")
                && artifacts.supports_half_precision("recognizer");
            let plan = ctx.resolver.optimize(ctx.target, supports_half);
            let detector = OnnxModel::load(&artifacts, "detector", &plan)?;
            let recognizer = OnnxModel::load(&artifacts, "recognizer", &plan)?;

            Ok(OcrArtifacts {
                detector,
                recognizer,
                charset: settings.characters.chars().collect(),
                settings,
            })
        })
    }
}

impl TextReader for OcrRuntime {
    fn read_text(&self, image: &[u8]) -> Result<RecognizedText> {
        log_failure(Capability::Ocr, self.run(image))
    }
}
