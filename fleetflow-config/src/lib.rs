//! Configuration loading for fleetflow processes.
//!
//! Resolves an [`OrchestratorConfig`](fleetflow_core::OrchestratorConfig)
//! from the environment, a config file or defaults, applies guard rails and
//! installs the tracing subscriber.
#![allow(missing_docs)]

pub mod logging;
pub mod models;
pub mod validation;

pub use logging::init_tracing;
pub use models::{ConfigLoad, ConfigSource, FleetflowConfig};
pub use validation::{
    ConfigGuardRailError, ConfigWarning, ConfigWarnings, apply_guard_rails,
};
