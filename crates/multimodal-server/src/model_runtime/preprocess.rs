//! Image decoding and tensor preparation shared by the adapters.

use anyhow::{Context, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;
use serde::Deserialize;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode any supported raster format, forcing three colour channels.
pub fn decode_rgb(bytes: &[u8]) -> Result<RgbImage> {
    let image = image::load_from_memory(bytes).context("cannot identify image file")?;
    Ok(image.to_rgb8())
}

/// `size` in `preprocessor_config.json` is either a bare edge length or an object.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum SizeSpec {
    Edge(u32),
    Dims {
        #[serde(default)]
        height: Option<u32>,
        #[serde(default)]
        width: Option<u32>,
        #[serde(default)]
        shortest_edge: Option<u32>,
        #[serde(default)]
        longest_edge: Option<u32>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    Keep,
    Exact { width: u32, height: u32 },
    ShortestEdge { shortest: u32, longest: Option<u32> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageProcessorConfig {
    #[serde(default = "default_true")]
    pub do_resize: bool,
    #[serde(default)]
    pub size: Option<SizeSpec>,
    #[serde(default)]
    pub max_size: Option<u32>,
    #[serde(default)]
    pub size_divisor: Option<u32>,
    #[serde(default)]
    pub resample: Option<u32>,
    #[serde(default = "default_true")]
    pub do_rescale: bool,
    #[serde(default = "default_rescale_factor")]
    pub rescale_factor: f32,
    #[serde(default = "default_true")]
    pub do_normalize: bool,
    #[serde(default = "default_mean")]
    pub image_mean: [f32; 3],
    #[serde(default = "default_std")]
    pub image_std: [f32; 3],
}

fn default_true() -> bool {
    true
}

fn default_rescale_factor() -> f32 {
    1.0 / 255.0
}

fn default_mean() -> [f32; 3] {
    IMAGENET_MEAN
}

fn default_std() -> [f32; 3] {
    IMAGENET_STD
}

impl ImageProcessorConfig {
    /// Resize to a fixed `width x height`, then normalize.
    pub fn fixed(width: u32, height: u32, mean: [f32; 3], std: [f32; 3]) -> Self {
        Self {
            do_resize: true,
            size: Some(SizeSpec::Dims {
                height: Some(height),
                width: Some(width),
                shortest_edge: None,
                longest_edge: None,
            }),
            max_size: None,
            size_divisor: None,
            resample: None,
            do_rescale: true,
            rescale_factor: default_rescale_factor(),
            do_normalize: true,
            image_mean: mean,
            image_std: std,
        }
    }

    /// Resize the shortest edge, capping the longest one, then normalize.
    pub fn shortest_edge(shortest: u32, longest: u32, mean: [f32; 3], std: [f32; 3]) -> Self {
        Self {
            size: Some(SizeSpec::Dims {
                height: None,
                width: None,
                shortest_edge: Some(shortest),
                longest_edge: Some(longest),
            }),
            ..Self::fixed(0, 0, mean, std)
        }
    }

    pub fn resize_mode(&self) -> ResizeMode {
        if !self.do_resize {
            return ResizeMode::Keep;
        }
        match &self.size {
            // A bare edge means "shortest edge"; the longer side keeps the 800:1333 ratio.
            Some(SizeSpec::Edge(edge)) => ResizeMode::ShortestEdge {
                shortest: *edge,
                longest: Some(self.max_size.unwrap_or(*edge * 1333 / 800)),
            },
            Some(SizeSpec::Dims {
                height: Some(height),
                width: Some(width),
                ..
            }) => ResizeMode::Exact {
                width: *width,
                height: *height,
            },
            Some(SizeSpec::Dims {
                shortest_edge: Some(shortest),
                longest_edge,
                ..
            }) => ResizeMode::ShortestEdge {
                shortest: *shortest,
                longest: longest_edge.or(self.max_size),
            },
            _ => ResizeMode::Keep,
        }
    }

    /// Output `(width, height)` for an input of `width x height`.
    pub fn output_size(&self, width: u32, height: u32) -> (u32, u32) {
        let (w, h) = match self.resize_mode() {
            ResizeMode::Keep => (width, height),
            ResizeMode::Exact { width, height } => (width, height),
            ResizeMode::ShortestEdge { shortest, longest } => {
                shortest_edge_size(width, height, shortest, longest)
            }
        };
        match self.size_divisor {
            Some(divisor) if divisor > 1 => (
                round_down_to_multiple(w, divisor),
                round_down_to_multiple(h, divisor),
            ),
            _ => (w, h),
        }
    }

    fn filter(&self) -> FilterType {
        match self.resample {
            Some(0) => FilterType::Nearest,
            Some(1) => FilterType::Lanczos3,
            Some(3) => FilterType::CatmullRom,
            _ => FilterType::Triangle,
        }
    }

    /// Resize, rescale and normalize into a `[1, 3, H, W]` tensor.
    pub fn preprocess(&self, image: &RgbImage) -> Array4<f32> {
        let (width, height) = self.output_size(image.width(), image.height());
        let resized;
        let source = if (width, height) != image.dimensions() {
            resized = imageops::resize(image, width, height, self.filter());
            &resized
        } else {
            image
        };

        let scale = if self.do_rescale { self.rescale_factor } else { 1.0 };
        let (mean, std) = if self.do_normalize {
            (self.image_mean, self.image_std)
        } else {
            ([0.0; 3], [1.0; 3])
        };
        to_nchw(source, scale, mean, std)
    }
}

/// Aspect-preserving resize of the shortest edge, with an optional cap on the
/// longest edge.
pub fn shortest_edge_size(width: u32, height: u32, shortest: u32, longest: Option<u32>) -> (u32, u32) {
    let (min_side, max_side) = (width.min(height) as f64, width.max(height) as f64);
    let mut target = shortest as f64;

    if let Some(longest) = longest {
        if max_side / min_side * target > longest as f64 {
            target = (longest as f64 * min_side / max_side).round();
        }
    }

    if width <= height {
        let new_w = target as u32;
        let new_h = (target * height as f64 / width as f64) as u32;
        (new_w.max(1), new_h.max(1))
    } else {
        let new_h = target as u32;
        let new_w = (target * width as f64 / height as f64) as u32;
        (new_w.max(1), new_h.max(1))
    }
}

pub fn round_down_to_multiple(value: u32, divisor: u32) -> u32 {
    (value / divisor * divisor).max(divisor)
}

/// `(pixel * scale - mean) / std` per channel, laid out as `[1, 3, H, W]`.
pub fn to_nchw(image: &RgbImage, scale: f32, mean: [f32; 3], std: [f32; 3]) -> Array4<f32> {
    let (width, height) = image.dimensions();
    let mut tensor = Array4::<f32>::zeros((1, 3, height as usize, width as usize));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = (pixel[c] as f32 * scale - mean[c]) / std[c];
        }
    }
    tensor
}
