//! ONNX Runtime session construction
//!
//! Turns an [`ExecutionPlan`] into live sessions: the graph file matching the
//! plan's precision, registered with the execution provider for the plan's
//! device. Replicated plans get one session per device and calls are spread
//! across them round-robin.

use anyhow::{Context, Result};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::tensor::TensorElementType;
use ort::value::ValueType;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

use super::artifacts::ModelArtifacts;
use crate::compute_target::{DeviceKind, ExecutionPlan, Precision};

pub struct OnnxModel {
    replicas: Vec<Session>,
    next: AtomicUsize,
}

impl OnnxModel {
    /// Load graph `stem` from `artifacts` according to `plan`.
    ///
    /// Tensors are always exchanged as float32. A half-precision graph whose
    /// inputs or outputs are themselves float16 is dropped in favour of the
    /// float32 graph.
    pub fn load(artifacts: &ModelArtifacts, stem: &str, plan: &ExecutionPlan) -> Result<Self> {
        let mut precision = plan.precision;
        let mut replicas = build_replicas(artifacts, stem, plan, precision)?;

        if precision == Precision::Float16 {
            let io = replicas.first().map(tensor_io).unwrap_or_default();
            if let Some(name) = half_precision_io(&io) {
                warn!(
                    "⚠️ {}/{} fp16 graph exchanges {} as float16, falling back to float32",
                    artifacts.model_id(),
                    stem,
                    name
                );
                precision = Precision::Float32;
                replicas = build_replicas(artifacts, stem, plan, precision)?;
            }
        }

        info!(
            "Bound {}/{} to {} ({}, {} replica{})",
            artifacts.model_id(),
            stem,
            plan.kind,
            precision.as_str(),
            replicas.len(),
            if replicas.len() == 1 { "" } else { "s" }
        );

        Ok(Self {
            replicas,
            next: AtomicUsize::new(0),
        })
    }

    /// Next session in round-robin order.
    pub fn session(&self) -> &Session {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.replicas.len();
        &self.replicas[index]
    }
}

fn build_replicas(
    artifacts: &ModelArtifacts,
    stem: &str,
    plan: &ExecutionPlan,
    precision: Precision,
) -> Result<Vec<Session>> {
    let path = artifacts.graph(stem, precision)?;
    plan.devices
        .iter()
        .map(|device| {
            build_session(&path, plan.kind, *device).with_context(|| {
                format!(
                    "Failed to create {} session for {} on {}",
                    stem,
                    artifacts.model_id(),
                    plan.kind
                )
            })
        })
        .collect()
}

/// Element types of every tensor input and output of `session`.
fn tensor_io(session: &Session) -> Vec<(String, TensorElementType)> {
    let inputs = session
        .inputs
        .iter()
        .map(|input| (&input.name, &input.input_type));
    let outputs = session
        .outputs
        .iter()
        .map(|output| (&output.name, &output.output_type));

    inputs
        .chain(outputs)
        .filter_map(|(name, value_type)| match value_type {
            ValueType::Tensor { ty, .. } => Some((name.clone(), *ty)),
            _ => None,
        })
        .collect()
}

/// First input or output exchanged as a half-precision tensor.
fn half_precision_io(io: &[(String, TensorElementType)]) -> Option<&str> {
    io.iter()
        .find(|(_, ty)| matches!(ty, TensorElementType::Float16 | TensorElementType::Bfloat16))
        .map(|(name, _)| name.as_str())
}

fn build_session(path: &Path, kind: DeviceKind, device: Option<u32>) -> Result<Session> {
    let providers: Vec<ExecutionProviderDispatch> = match kind {
        DeviceKind::Cuda => vec![CUDAExecutionProvider::default()
            .with_device_id(device.unwrap_or(0) as i32)
            .build()
            .error_on_failure()],
        DeviceKind::Mps => vec![CoreMLExecutionProvider::default().build().error_on_failure()],
        DeviceKind::Cpu => vec![CPUExecutionProvider::default().build()],
    };

    let threads = num_cpus::get_physical().max(1);
    debug!(
        "Creating session for {} on {:?} device {:?} ({} intra-op threads)",
        path.display(),
        kind,
        device,
        threads
    );

    let session = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(threads)?
        .with_execution_providers(providers)?
        .commit_from_file(path)?;
    Ok(session)
}
