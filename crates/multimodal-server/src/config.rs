// multimodal-server/src/config.rs

use anyhow::{Context, Result};
use std::env;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug, Clone)]
pub struct Config {
    pub app_name: String,
    pub debug: bool,
    pub device: String,
    pub api_host: String,
    pub api_port: u16,
    pub model_vqa: String,
    pub model_captioning: String,
    pub model_ocr: String,
    pub model_object_detection: String,
    // Declared for parity with deployments that set them; inference does not read these.
    pub batch_size: u32,
    pub max_length: u32,
    pub cache_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv() {
            warn!("Failed to load .env file: {}. Using system environment variables.", e);
        } else {
            info!("Loaded environment variables from .env file");
        }

        Self::from_vars(|key| env::var(key).ok())
    }

    /// Build a config from an arbitrary variable source. `from_env` feeds it the
    /// process environment.
    pub fn from_vars<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        Ok(Self {
            app_name: var("APP_NAME", "Multimodal Demo"),
            debug: parse_flag(&var("DEBUG", "false")),
            device: var("DEVICE", "cpu"),
            api_host: var("API_HOST", "0.0.0.0"),
            api_port: var("PORT", "8000")
                .parse()
                .context("PORT must be a valid port number")?,
            model_vqa: var("MODEL_VQA", "dandelin/vilt-b32-finetuned-vqa"),
            model_captioning: var("MODEL_CAPTIONING", "Salesforce/blip-image-captioning-base"),
            model_ocr: var("MODEL_OCR", "EasyOCR"),
            model_object_detection: var("MODEL_OBJECT_DETECTION", "facebook/detr-resnet-50"),
            batch_size: var("BATCH_SIZE", "4")
                .parse()
                .context("BATCH_SIZE must be an unsigned integer")?,
            max_length: var("MAX_LENGTH", "50")
                .parse()
                .context("MAX_LENGTH must be an unsigned integer")?,
            cache_dir: PathBuf::from(var("CACHE_DIR", "./models")),
        })
    }

    pub fn print_config(&self) {
        info!("Current Configuration:");
        info!("- App: {}", self.app_name);
        info!("- Debug: {}", self.debug);
        info!("- Device preference: {}", self.device);
        info!("- API: {}:{}", self.api_host, self.api_port);
        info!("- Cache Dir: {}", self.cache_dir.display());
        info!("- VQA Model: {}", self.model_vqa);
        info!("- Captioning Model: {}", self.model_captioning);
        info!("- OCR Model: {}", self.model_ocr);
        info!("- Object Detection Model: {}", self.model_object_detection);
        info!("- Batch Size: {}", self.batch_size);
        info!("- Max Length: {}", self.max_length);
    }

    pub fn api_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.api_host, self.api_port)
            .parse()
            .with_context(|| format!("Invalid API address {}:{}", self.api_host, self.api_port))
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}
