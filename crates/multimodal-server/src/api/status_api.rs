// System status API: resolved compute target, hardware availability and registry state
// Recomputed on every request; reads only, never touches the adapters.
use axum::{extract::State, Json};
use serde::Serialize;

use crate::compute_target::DeviceKind;
use crate::metrics;
use crate::shared_state::AppState;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    pub device: String,
    pub device_type: String,
    pub models_loaded: bool,
    pub active_models: Vec<String>,
    pub cuda_available: bool,
    pub mps_available: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_device: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_device_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cuda_memory_allocated: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mps_device: Option<String>,
}

impl SystemStatus {
    pub fn snapshot(state: &AppState) -> Self {
        let probe = state.resolver.probe();
        let target = state.target;

        let mut status = SystemStatus {
            device: target.device_string(),
            device_type: state.config.device.clone(),
            models_loaded: state.registry.is_ready(),
            active_models: state
                .registry
                .model_ids()
                .iter()
                .map(|id| id.to_string())
                .collect(),
            cuda_available: probe.cuda_available(),
            mps_available: probe.mps_available(),
            cuda_device: None,
            cuda_device_name: None,
            cuda_memory_allocated: None,
            mps_device: None,
        };

        match target.kind {
            DeviceKind::Cuda => {
                status.cuda_device = Some(target.device_index.unwrap_or(0));
                status.cuda_device_name = probe.cuda_device_name();
                status.cuda_memory_allocated = probe.cuda_memory_used_bytes().map(format_gib);
            }
            DeviceKind::Mps => status.mps_device = Some("MPS".to_string()),
            DeviceKind::Cpu => {}
        }

        status
    }
}

fn format_gib(bytes: u64) -> String {
    format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
}

pub async fn system_status(State(state): State<AppState>) -> Json<SystemStatus> {
    metrics::inc_request("system_status", "200");
    Json(SystemStatus::snapshot(&state))
}
