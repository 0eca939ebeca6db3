// multimodal-server/src/lib.rs

pub mod api;
pub mod compute_target;
pub mod config;
pub mod metrics;
pub mod model_runtime;
pub mod server;
pub mod shared_state;
pub mod telemetry;

// Public API exports
pub use compute_target::{ComputeTarget, DeviceKind, DeviceResolver, Precision};
pub use config::Config;
pub use model_runtime::{Capability, ModelRegistry, RegistryState};
pub use server::{build_router, run_server};
pub use shared_state::AppState;
