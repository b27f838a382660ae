//! Process-wide engine configuration
//!
//! The only runtime-tunable knob is the default device: the target of
//! requests issued with [`DEVICE_DEFAULT`](crate::registry::DEVICE_DEFAULT).
//! It is seeded once from `OFFLOAD_DEFAULT_DEVICE` and adjustable at runtime.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::OnceLock;

static DEFAULT_DEVICE: OnceLock<AtomicI64> = OnceLock::new();

fn cell() -> &'static AtomicI64 {
    DEFAULT_DEVICE.get_or_init(|| {
        let seed = std::env::var("OFFLOAD_DEFAULT_DEVICE")
            .ok()
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0);
        AtomicI64::new(seed)
    })
}

/// Device id substituted for the default-device sentinel
pub fn default_device() -> i64 {
    cell().load(Ordering::Relaxed)
}

/// Change the default device for subsequent requests
pub fn set_default_device(id: i64) {
    tracing::debug!(device = id, "default device changed");
    cell().store(id, Ordering::Relaxed);
}
