//! Tracking of the paired drone
//!
//! This module handles:
//! - Mirroring the drone's published security state
//! - Out-of-order state detection
//! - Liveness monitoring and OFFLINE detection

mod mirror;

pub use mirror::DroneMirror;
