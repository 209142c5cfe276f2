//! gpubench -- accelerator compute benchmarking harness.
//!
//! Discovers compute devices through an [`runtime::AcceleratorRuntime`],
//! picks one (GPU first, then CPU), builds and dispatches an elementwise
//! kernel repeatedly, derives filtered timing statistics with throughput and
//! bandwidth, and verifies the device output against a host computation.

pub mod bench;
pub mod catalog;
pub mod config;
pub mod error;
pub mod launch;
pub mod metrics;
pub mod report;
pub mod runtime;
pub mod selector;
pub mod session;
pub mod source;
pub mod timer;
pub mod verify;

pub use error::{BenchError, Result};
