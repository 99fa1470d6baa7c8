//! Agent library for per-host workload usage telemetry
//!
//! This crate provides the core functionality for:
//! - Reading CPU and memory accounting from cgroup v1
//! - Locating the workloads placed on this host
//! - Periodic collection with drain and fast-stop semantics
//! - Reporting samples to the central collector
//! - Signal-driven lifecycle, health checks and observability

pub mod api;
pub mod collector;
pub mod health;
pub mod lifecycle;
pub mod models;
pub mod observability;
pub mod registry;
pub mod sync;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{AgentMetrics, StructuredLogger};
