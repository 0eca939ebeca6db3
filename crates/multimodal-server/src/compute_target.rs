// multimodal-server/src/compute_target.rs
// Device resolution and per-device precision policy

use nvml_wrapper::Nvml;
use ort::execution_providers::{CUDAExecutionProvider, CoreMLExecutionProvider, ExecutionProvider};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Cpu,
    Cuda,
    Mps,
}

impl DeviceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceKind::Cpu => "cpu",
            DeviceKind::Cuda => "cuda",
            DeviceKind::Mps => "mps",
        }
    }

    /// Parse a configured preference. Unknown values yield `None`.
    pub fn from_preference(preference: &str) -> Option<Self> {
        match preference.trim().to_ascii_lowercase().as_str() {
            "cpu" => Some(DeviceKind::Cpu),
            "cuda" => Some(DeviceKind::Cuda),
            "mps" => Some(DeviceKind::Mps),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Float32,
    Float16,
}

impl Precision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Precision::Float32 => "float32",
            Precision::Float16 => "float16",
        }
    }
}

/// Resolved hardware/precision pair. Built once at startup and never mutated.
///
/// `Float16` only ever appears together with `DeviceKind::Cuda`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComputeTarget {
    pub kind: DeviceKind,
    pub precision: Precision,
    pub device_index: Option<u32>,
}

impl ComputeTarget {
    pub fn cpu() -> Self {
        Self {
            kind: DeviceKind::Cpu,
            precision: Precision::Float32,
            device_index: None,
        }
    }

    pub fn device_string(&self) -> String {
        self.kind.as_str().to_string()
    }
}

/// Hardware introspection used by the resolver and the status report.
pub trait HardwareProbe: Send + Sync {
    fn cuda_available(&self) -> bool;
    fn cuda_device_count(&self) -> u32;
    fn cuda_supports_half(&self) -> bool;
    fn mps_available(&self) -> bool;

    fn cuda_device_name(&self) -> Option<String> {
        None
    }

    fn cuda_memory_used_bytes(&self) -> Option<u64> {
        None
    }
}

/// NVML for NVIDIA devices, ONNX Runtime provider registry for everything else.
pub struct NvmlProbe {
    nvml: Option<Nvml>,
}

impl NvmlProbe {
    pub fn new() -> Self {
        let nvml = match Nvml::init() {
            Ok(nvml) => Some(nvml),
            Err(e) => {
                debug!("NVML unavailable, assuming no CUDA devices: {}", e);
                None
            }
        };
        Self { nvml }
    }
}

impl Default for NvmlProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl HardwareProbe for NvmlProbe {
    fn cuda_available(&self) -> bool {
        self.cuda_device_count() > 0
            && CUDAExecutionProvider::default().is_available().unwrap_or(false)
    }

    fn cuda_device_count(&self) -> u32 {
        self.nvml
            .as_ref()
            .and_then(|nvml| nvml.device_count().ok())
            .unwrap_or(0)
    }

    fn cuda_supports_half(&self) -> bool {
        // Same bar as bf16 support: compute capability 8.0 (Ampere) and newer.
        self.nvml
            .as_ref()
            .and_then(|nvml| nvml.device_by_index(0).ok())
            .and_then(|device| device.cuda_compute_capability().ok())
            .map(|cc| cc.major >= 8)
            .unwrap_or(false)
    }

    fn mps_available(&self) -> bool {
        cfg!(target_os = "macos")
            && CoreMLExecutionProvider::default().is_available().unwrap_or(false)
    }

    fn cuda_device_name(&self) -> Option<String> {
        let nvml = self.nvml.as_ref()?;
        nvml.device_by_index(0).ok()?.name().ok()
    }

    fn cuda_memory_used_bytes(&self) -> Option<u64> {
        let nvml = self.nvml.as_ref()?;
        let memory = nvml.device_by_index(0).ok()?.memory_info().ok()?;
        Some(memory.used)
    }
}

/// Fixed answers, for hosts where probing is unwanted and for tests.
#[derive(Debug, Clone, Default)]
pub struct StaticProbe {
    pub cuda_devices: u32,
    pub cuda_half: bool,
    pub mps: bool,
}

impl HardwareProbe for StaticProbe {
    fn cuda_available(&self) -> bool {
        self.cuda_devices > 0
    }

    fn cuda_device_count(&self) -> u32 {
        self.cuda_devices
    }

    fn cuda_supports_half(&self) -> bool {
        self.cuda_devices > 0 && self.cuda_half
    }

    fn mps_available(&self) -> bool {
        self.mps
    }
}

/// How one artifact gets bound to hardware: the precision of the graph to load
/// and one entry per replica. More than one entry means data-parallel
/// replication across CUDA devices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionPlan {
    pub kind: DeviceKind,
    pub precision: Precision,
    pub devices: Vec<Option<u32>>,
}

impl ExecutionPlan {
    pub fn is_replicated(&self) -> bool {
        self.devices.len() > 1
    }
}

#[derive(Clone)]
pub struct DeviceResolver {
    probe: Arc<dyn HardwareProbe>,
}

impl DeviceResolver {
    pub fn new(probe: Arc<dyn HardwareProbe>) -> Self {
        Self { probe }
    }

    pub fn probe(&self) -> &dyn HardwareProbe {
        self.probe.as_ref()
    }

    /// Preference is advisory, hardware availability is authoritative. Never fails.
    pub fn resolve(&self, preference: &str) -> ComputeTarget {
        let requested = DeviceKind::from_preference(preference).unwrap_or_else(|| {
            warn!("Unrecognized device preference '{}', using cpu", preference);
            DeviceKind::Cpu
        });

        let target = match requested {
            DeviceKind::Cuda if self.probe.cuda_available() => ComputeTarget {
                kind: DeviceKind::Cuda,
                precision: if self.probe.cuda_supports_half() {
                    Precision::Float16
                } else {
                    Precision::Float32
                },
                device_index: Some(0),
            },
            DeviceKind::Mps if self.probe.mps_available() => ComputeTarget {
                kind: DeviceKind::Mps,
                precision: Precision::Float32,
                device_index: None,
            },
            DeviceKind::Cpu => ComputeTarget::cpu(),
            other => {
                warn!("Requested device {} is not available, falling back to cpu", other);
                ComputeTarget::cpu()
            }
        };

        info!(
            "🔄 Resolved compute target: {} ({})",
            target.kind,
            target.precision.as_str()
        );
        target
    }

    /// Bind one artifact to the resolved target. Called once per adapter at load time.
    pub fn optimize(&self, target: &ComputeTarget, artifact_supports_half: bool) -> ExecutionPlan {
        match target.kind {
            DeviceKind::Cpu => ExecutionPlan {
                kind: DeviceKind::Cpu,
                precision: Precision::Float32,
                devices: vec![None],
            },
            DeviceKind::Cuda => {
                let precision = if target.precision == Precision::Float16 && artifact_supports_half {
                    Precision::Float16
                } else {
                    if target.precision == Precision::Float16 {
                        debug!("Artifact has no half-precision graph, keeping float32");
                    }
                    Precision::Float32
                };

                let count = self.probe.cuda_device_count();
                let devices = if count > 1 {
                    info!("{} CUDA devices visible, replicating model across all of them", count);
                    (0..count).map(Some).collect()
                } else {
                    vec![Some(target.device_index.unwrap_or(0))]
                };

                ExecutionPlan {
                    kind: DeviceKind::Cuda,
                    precision,
                    devices,
                }
            }
            // CoreML has limited float16 support, so mps stays at float32.
            DeviceKind::Mps => ExecutionPlan {
                kind: DeviceKind::Mps,
                precision: Precision::Float32,
                devices: vec![None],
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver(probe: StaticProbe) -> DeviceResolver {
        DeviceResolver::new(Arc::new(probe))
    }

    #[test]
    fn test_cuda_without_hardware_falls_back_to_cpu() {
        let target = resolver(StaticProbe::default()).resolve("cuda");
        assert_eq!(target, ComputeTarget::cpu());
        assert_eq!(target.precision, Precision::Float32);
    }

    #[test]
    fn test_cuda_with_half_support_resolves_to_float16() {
        let target = resolver(StaticProbe { cuda_devices: 1, cuda_half: true, mps: false })
            .resolve("cuda");

        assert_eq!(target.kind, DeviceKind::Cuda);
        assert_eq!(target.precision, Precision::Float16);
        assert_eq!(target.device_index, Some(0));
    }

    #[test]
    fn test_cuda_without_half_support_stays_float32() {
        let target = resolver(StaticProbe { cuda_devices: 1, cuda_half: false, mps: false })
            .resolve("cuda");
        assert_eq!(target.kind, DeviceKind::Cuda);
        assert_eq!(target.precision, Precision::Float32);
    }

    #[test]
    fn test_mps_is_always_float32() {
        let target = resolver(StaticProbe { cuda_devices: 0, cuda_half: true, mps: true })
            .resolve("mps");
        assert_eq!(target.kind, DeviceKind::Mps);
        assert_eq!(target.precision, Precision::Float32);
    }

    #[test]
    fn test_mps_without_hardware_falls_back_to_cpu() {
        let target = resolver(StaticProbe::default()).resolve("mps");
        assert_eq!(target, ComputeTarget::cpu());
    }

    #[test]
    fn test_preference_is_advisory_even_when_gpu_exists() {
        let target = resolver(StaticProbe { cuda_devices: 2, cuda_half: true, mps: true })
            .resolve("cpu");
        assert_eq!(target, ComputeTarget::cpu());
    }

    #[test]
    fn test_unknown_preference_falls_back_to_cpu() {
        let r = resolver(StaticProbe { cuda_devices: 1, cuda_half: true, mps: true });
        assert_eq!(r.resolve("tpu"), ComputeTarget::cpu());
        assert_eq!(r.resolve(""), ComputeTarget::cpu());
    }

    #[test]
    fn test_preference_is_case_insensitive() {
        let target = resolver(StaticProbe { cuda_devices: 1, cuda_half: false, mps: false })
            .resolve(" CUDA ");
        assert_eq!(target.kind, DeviceKind::Cuda);
    }

    #[test]
    fn test_optimize_cpu_forces_float32() {
        let r = resolver(StaticProbe::default());
        let plan = r.optimize(&ComputeTarget::cpu(), true);

        assert_eq!(plan.precision, Precision::Float32);
        assert_eq!(plan.devices, vec![None]);
        assert!(!plan.is_replicated());
    }

    #[test]
    fn test_optimize_cuda_downgrades_when_artifact_lacks_half() {
        let r = resolver(StaticProbe { cuda_devices: 1, cuda_half: true, mps: false });
        let target = r.resolve("cuda");

        assert_eq!(r.optimize(&target, false).precision, Precision::Float32);
        assert_eq!(r.optimize(&target, true).precision, Precision::Float16);
    }

    #[test]
    fn test_optimize_cuda_never_upgrades_a_float32_target() {
        let r = resolver(StaticProbe { cuda_devices: 1, cuda_half: false, mps: false });
        let target = r.resolve("cuda");
        assert_eq!(r.optimize(&target, true).precision, Precision::Float32);
    }

    #[test]
    fn test_optimize_replicates_across_multiple_gpus() {
        let r = resolver(StaticProbe { cuda_devices: 3, cuda_half: false, mps: false });
        let plan = r.optimize(&r.resolve("cuda"), false);

        assert!(plan.is_replicated());
        assert_eq!(plan.devices, vec![Some(0), Some(1), Some(2)]);
    }

    #[test]
    fn test_optimize_mps_forces_float32() {
        let r = resolver(StaticProbe { cuda_devices: 0, cuda_half: false, mps: true });
        let plan = r.optimize(&r.resolve("mps"), true);
        assert_eq!(plan.kind, DeviceKind::Mps);
        assert_eq!(plan.precision, Precision::Float32);
    }
}
