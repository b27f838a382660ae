//! Device registry: backend discovery, device resolution, image replay
//!
//! The registry is built once from the available backends. Discovery
//! inspects each backend's capability set exactly once: a backend missing a
//! required capability (or on the wrong contract version) is skipped with a
//! warning, and its devices never appear. Surviving backends contribute one
//! device per ordinal, numbered contiguously across backends.
//!
//! Devices initialize lazily on first resolution: backend init runs, then
//! every already-registered image of the matching kind is replayed into the
//! fresh device. Lock order is always registry image table, then device
//! state; nothing takes them in the other order.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use offload_backends::{Backend, CpuBackend};
use parking_lot::Mutex;

use crate::config;
use crate::device::Device;
use crate::error::{check_fatal, Result};
use crate::image::{self, ImageHandle, OffloadImage};

/// Sentinel device id resolving to the configured default device
pub const DEVICE_DEFAULT: i64 = -1;

/// Sentinel device id naming the host itself; resolution yields no device
pub const DEVICE_HOST: i64 = -10;

/// All registered devices plus the image table replayed into late
/// initializers
pub struct Registry {
    devices: Vec<Arc<Device>>,
    images: Mutex<Vec<(ImageHandle, Arc<OffloadImage>)>>,
    next_image: AtomicU64,
}

impl Registry {
    /// Build a registry from a set of backends, applying capability
    /// discovery
    pub fn with_backends(backends: Vec<Arc<dyn Backend>>) -> Self {
        let mut devices = Vec::new();
        for backend in backends {
            let caps = backend.capabilities();
            if !caps.meets_required() {
                tracing::warn!(
                    kind = %backend.kind(),
                    version = caps.contract_version,
                    "backend rejected at discovery"
                );
                continue;
            }
            for ordinal in 0..backend.device_count() {
                let id = devices.len();
                devices.push(Arc::new(Device::new(id, ordinal, backend.clone())));
            }
        }
        tracing::info!(devices = devices.len(), "device registry built");
        Self {
            devices,
            images: Mutex::new(Vec::new()),
            next_image: AtomicU64::new(1),
        }
    }

    /// Process-wide registry over the built-in backends
    pub fn global() -> &'static Registry {
        static GLOBAL: OnceLock<Registry> = OnceLock::new();
        GLOBAL.get_or_init(|| Registry::with_backends(vec![Arc::new(CpuBackend::new())]))
    }

    /// Number of registered devices
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Resolve a requested device id to a ready device.
    ///
    /// [`DEVICE_DEFAULT`] resolves through the configured default;
    /// [`DEVICE_HOST`], out-of-range ids, and devices whose initialization
    /// fails all yield `None`, directing the caller to host fallback. The
    /// first successful resolution of a device initializes it and replays
    /// registered images into it.
    pub fn resolve(&self, id: i64) -> Option<Arc<Device>> {
        let id = if id == DEVICE_DEFAULT {
            config::default_device()
        } else {
            id
        };
        if id == DEVICE_HOST || id < 0 {
            return None;
        }
        let device = self.devices.get(id as usize)?.clone();
        let ready = check_fatal(self.ensure_initialized(&device));
        match ready {
            Ok(()) => Some(device),
            Err(err) => {
                tracing::warn!(device = device.id(), error = %err, "device unusable, falling back to host");
                None
            }
        }
    }

    fn ensure_initialized(&self, device: &Arc<Device>) -> Result<()> {
        {
            let state = device.state.lock();
            if state.initialized {
                return Ok(());
            }
        }
        let images = self.images.lock();
        let mut state = device.state.lock();
        if state.initialized {
            return Ok(());
        }
        device.mark_initialized(&mut state)?;
        for (_, image) in images.iter() {
            if image.kind == device.kind() {
                image::load_into(device, &mut state, image)?;
            }
        }
        tracing::debug!(device = device.id(), "device initialized");
        Ok(())
    }

    /// Register an offload image, loading it into every initialized device
    /// of the matching kind. Devices initialized later replay it.
    ///
    /// # Errors
    ///
    /// Backend load failures are returned. Symbol-table validation failures
    /// (count or size mismatches) are fatal.
    pub fn register_image(&self, image: OffloadImage) -> Result<ImageHandle> {
        let handle = ImageHandle(self.next_image.fetch_add(1, Ordering::Relaxed));
        let result = (|| {
            let mut images = self.images.lock();
            let image = Arc::new(image);
            for device in &self.devices {
                let mut state = device.state.lock();
                if state.initialized && image.kind == device.kind() {
                    image::load_into(device, &mut state, &image)?;
                }
            }
            images.push((handle, image));
            Ok(handle)
        })();
        check_fatal(result)
    }

    /// Unregister an image, dropping its records from every initialized
    /// device of the matching kind.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidImage`](crate::Error::InvalidImage) for a
    /// stale handle.
    pub fn unregister_image(&self, handle: ImageHandle) -> Result<()> {
        let result = (|| {
            let mut images = self.images.lock();
            let position = images
                .iter()
                .position(|(h, _)| *h == handle)
                .ok_or(crate::Error::InvalidImage(handle.0))?;
            let (_, image) = images.remove(position);
            for device in &self.devices {
                let mut state = device.state.lock();
                if state.initialized && image.kind == device.kind() {
                    image::unload_from(device, &mut state, &image)?;
                }
            }
            Ok(())
        })();
        check_fatal(result)
    }

    /// Tear down every initialized device. Best-effort; intended for
    /// process exit.
    pub fn shutdown(&self) {
        for device in &self.devices {
            device.shutdown();
        }
    }
}
