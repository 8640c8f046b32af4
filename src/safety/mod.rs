//! Safety Module
//!
//! Watches sensor readings against configured thresholds and raises the
//! sensor-driven security transitions.

mod monitor;

pub use monitor::{classify, Assessment, Severity, ThresholdMonitor};
