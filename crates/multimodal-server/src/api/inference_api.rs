// Inference API: multipart image (and question) in, model result plus model id out
// Validation happens here so that rejected uploads never reach an adapter.
use axum::{
    extract::{multipart::MultipartRejection, Multipart, State},
    Json,
};
use bytes::Bytes;
use serde::Serialize;
use std::time::Instant;
use tracing::{debug, info};

use super::error::ApiError;
use crate::metrics;
use crate::model_runtime::{Capability, Detection, ModelRegistry};
use crate::shared_state::AppState;

#[derive(Debug, Serialize)]
pub struct VqaResponse {
    pub answer: String,
    pub confidence: f64,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct CaptionResponse {
    pub caption: String,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct OcrResponse {
    pub text: String,
    pub model: String,
}

#[derive(Debug, Serialize)]
pub struct ObjectDetectionResponse {
    pub detections: Vec<Detection>,
    pub model: String,
}

/// Fields collected from a multipart upload.
#[derive(Debug, Default)]
struct UploadForm {
    image: Option<Bytes>,
    question: Option<String>,
}

impl UploadForm {
    async fn read(multipart: Result<Multipart, MultipartRejection>) -> Result<Self, ApiError> {
        let mut multipart = multipart.map_err(ApiError::bad_multipart)?;
        let mut form = UploadForm::default();

        while let Some(field) = multipart
            .next_field()
            .await
            .map_err(ApiError::multipart)?
        {
            let name = field.name().map(str::to_string);
            match name.as_deref() {
                Some("image") => {
                    let is_image = field
                        .content_type()
                        .map(|ct| ct.starts_with("image/"))
                        .unwrap_or(false);
                    if !is_image {
                        debug!("Rejecting upload with content type {:?}", field.content_type());
                        return Err(ApiError::invalid_file_type());
                    }
                    form.image = Some(field.bytes().await.map_err(ApiError::multipart)?);
                }
                Some("question") => {
                    form.question = Some(field.text().await.map_err(ApiError::multipart)?);
                }
                _ => {}
            }
        }

        Ok(form)
    }

    fn image(&mut self) -> Result<Bytes, ApiError> {
        self.image.take().ok_or_else(|| ApiError::missing_field("image"))
    }

    fn question(&mut self) -> Result<String, ApiError> {
        self.question
            .take()
            .filter(|q| !q.trim().is_empty())
            .ok_or_else(|| ApiError::missing_field("question"))
    }
}

/// Run `job` against the registry on the blocking pool and map its failure to
/// a 500 for `capability`.
async fn run_inference<T, F>(state: &AppState, capability: Capability, job: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&ModelRegistry) -> anyhow::Result<T> + Send + 'static,
{
    let registry = state.registry.clone();
    let started = Instant::now();

    let result = tokio::task::spawn_blocking(move || job(registry.as_ref()))
        .await
        .map_err(|e| anyhow::anyhow!("inference task did not complete: {}", e))
        .and_then(|r| r);

    let elapsed = started.elapsed().as_secs_f64();
    metrics::observe_inference(capability.as_str(), elapsed);
    debug!("{} inference finished in {:.3}s", capability, elapsed);

    result.map_err(|e| ApiError::inference(capability, &e))
}

fn record<T>(route: &str, result: Result<T, ApiError>) -> Result<T, ApiError> {
    let status = match &result {
        Ok(_) => "200".to_string(),
        Err(e) => e.status().as_u16().to_string(),
    };
    metrics::inc_request(route, &status);
    result
}

/// Answer a free-form question about an uploaded image.
pub async fn visual_qa(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<VqaResponse>, ApiError> {
    record("vqa", answer_question(&state, multipart).await)
}

async fn answer_question(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<VqaResponse>, ApiError> {
    let mut form = UploadForm::read(multipart).await?;
    let image = form.image()?;
    let question = form.question()?;
    info!("VQA request: {} byte image, question {:?}", image.len(), question);

    let answer = run_inference(state, Capability::Vqa, move |registry| {
        registry.vqa().answer(&image, &question)
    })
    .await?;

    Ok(Json(VqaResponse {
        answer: answer.answer,
        confidence: answer.confidence,
        model: state.registry.vqa().model_id().to_string(),
    }))
}

pub async fn image_captioning(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<CaptionResponse>, ApiError> {
    record("captioning", caption_image(&state, multipart).await)
}

async fn caption_image(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<CaptionResponse>, ApiError> {
    let image = UploadForm::read(multipart).await?.image()?;
    info!("Captioning request: {} byte image", image.len());

    let caption = run_inference(state, Capability::Captioning, move |registry| {
        registry.captioning().caption(&image)
    })
    .await?;

    Ok(Json(CaptionResponse {
        caption: caption.caption,
        model: state.registry.captioning().model_id().to_string(),
    }))
}

pub async fn ocr(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<OcrResponse>, ApiError> {
    record("ocr", read_text(&state, multipart).await)
}

async fn read_text(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<OcrResponse>, ApiError> {
    let image = UploadForm::read(multipart).await?.image()?;
    info!("OCR request: {} byte image", image.len());

    let text = run_inference(state, Capability::Ocr, move |registry| {
        registry.ocr().read_text(&image)
    })
    .await?;

    Ok(Json(OcrResponse {
        text: text.text,
        model: state.registry.ocr().model_id().to_string(),
    }))
}

pub async fn object_detection(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ObjectDetectionResponse>, ApiError> {
    record("object_detection", detect_objects(&state, multipart).await)
}

async fn detect_objects(
    state: &AppState,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<ObjectDetectionResponse>, ApiError> {
    let image = UploadForm::read(multipart).await?.image()?;
    info!("Object detection request: {} byte image", image.len());

    let detections = run_inference(state, Capability::ObjectDetection, move |registry| {
        registry.object_detection().detect(&image)
    })
    .await?;

    Ok(Json(ObjectDetectionResponse {
        detections,
        model: state.registry.object_detection().model_id().to_string(),
    }))
}
