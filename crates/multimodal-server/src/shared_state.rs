//! Shared application state
//!
//! Everything the HTTP handlers need, built once at startup and shared through
//! `Arc`. Nothing in here is mutated after the registry has loaded.

use std::sync::Arc;

use crate::compute_target::{ComputeTarget, DeviceResolver};
use crate::config::Config;
use crate::model_runtime::ModelRegistry;

#[derive(Clone)]
pub struct AppState {
    /// Configuration (read-only after initialization)
    pub config: Arc<Config>,

    /// Loaded adapters, one per capability
    pub registry: Arc<ModelRegistry>,

    /// Resolver used at startup; kept for hardware introspection in status reports
    pub resolver: DeviceResolver,

    /// Compute target every adapter was bound to
    pub target: ComputeTarget,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: ModelRegistry,
        resolver: DeviceResolver,
        target: ComputeTarget,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(registry),
            resolver,
            target,
        }
    }
}
