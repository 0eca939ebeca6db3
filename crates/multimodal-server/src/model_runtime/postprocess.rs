//! Numeric post-processing of raw model outputs.

use anyhow::Result;

use super::adapter_trait::Detection;
use super::artifacts::Labels;

/// Returned by OCR when nothing readable was recognized.
pub const NO_TEXT_DETECTED: &str = "No text detected in the image";

/// Fixed confidence floor for object detection.
pub const DETECTION_THRESHOLD: f32 = 0.9;

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&x| (x - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index and value of the largest element; first one wins on ties.
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if b >= v => best,
            _ => Some((i, v)),
        })
}

pub fn round_to(value: f32, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value as f64 * factor).round() / factor
}

/// Turn DETR-style outputs into labelled detections.
///
/// `logits` is `[queries, classes + 1]` (last column is "no object"), `boxes` is
/// `[queries, 4]` of normalized `(cx, cy, w, h)`. Detections keep query order.
pub fn detections_from_queries(
    logits: &[f32],
    boxes: &[f32],
    num_queries: usize,
    image_size: (u32, u32),
    threshold: f32,
    labels: &Labels,
) -> Result<Vec<Detection>> {
    if num_queries == 0 {
        return Ok(Vec::new());
    }
    if logits.len() % num_queries != 0 || boxes.len() != num_queries * 4 {
        anyhow::bail!(
            "unexpected detector output sizes: {} logits, {} box values for {} queries",
            logits.len(),
            boxes.len(),
            num_queries
        );
    }
    let width_classes = logits.len() / num_queries;
    if width_classes < 2 {
        anyhow::bail!("detector produced {} class columns", width_classes);
    }

    let (img_w, img_h) = (image_size.0 as f32, image_size.1 as f32);
    let mut detections = Vec::new();

    for (query, row) in logits.chunks_exact(width_classes).enumerate() {
        let probs = softmax(row);
        let Some((label_id, score)) = argmax(&probs[..width_classes - 1]) else {
            continue;
        };
        if score <= threshold {
            continue;
        }

        let b = &boxes[query * 4..query * 4 + 4];
        let (cx, cy, w, h) = (b[0], b[1], b[2], b[3]);
        let bbox = [
            round_to((cx - 0.5 * w) * img_w, 2),
            round_to((cy - 0.5 * h) * img_h, 2),
            round_to((cx + 0.5 * w) * img_w, 2),
            round_to((cy + 0.5 * h) * img_h, 2),
        ];

        detections.push(Detection {
            label: labels.resolve(label_id)?.to_string(),
            confidence: round_to(score, 3),
            bbox,
        });
    }

    Ok(detections)
}

/// Greedy CTC decode of `[steps, classes]` scores. Class 0 is the blank and class
/// `i` maps to `charset[i - 1]`.
pub fn ctc_greedy_decode(scores: &[f32], num_classes: usize, charset: &[char]) -> String {
    if num_classes == 0 {
        return String::new();
    }
    let mut text = String::new();
    let mut previous = 0usize;
    for step in scores.chunks_exact(num_classes) {
        let class = argmax(step).map(|(i, _)| i).unwrap_or(0);
        if class != 0 && class != previous {
            if let Some(ch) = charset.get(class - 1) {
                text.push(*ch);
            }
        }
        previous = class;
    }
    text
}

/// Join fragments in the order given, single-space separated, with the
/// no-text sentinel in place of an empty result.
pub fn join_fragments<I, S>(fragments: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined = fragments
        .into_iter()
        .map(|s| s.as_ref().to_string())
        .collect::<Vec<_>>()
        .join(" ");
    if joined.trim().is_empty() {
        NO_TEXT_DETECTED.to_string()
    } else {
        joined
    }
}
