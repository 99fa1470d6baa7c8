//! Reporting to the central collector
//!
//! This module provides:
//! - The wire envelope wrapping each sample with its kind and source host
//! - The reporting pipeline owning the single collector connection

mod client;
mod envelope;


pub use client::{ClientConfig, ReportError, ReporterHandle, ReportingPipeline};
pub use envelope::Envelope;
