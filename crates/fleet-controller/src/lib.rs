//! Fleet controller bootstrap: capability context, ordered controller
//! registration and leader-gated start

#![deny(missing_docs)]

pub mod apply;
pub mod capabilities;
pub mod config;
pub mod controllers;
pub mod informer;
pub mod manifest;
pub mod registry;
pub mod run_gate;
pub mod seed;
pub mod starter;
pub mod target;

pub use capabilities::CapabilityContext;
pub use registry::{fleet_registry, ControllerRegistry, Phase, Registration};
pub use run_gate::RunGate;
pub use starter::{start_all, Starter, DEFAULT_START_CONCURRENCY};
