//! Host-emulation backend
//!
//! The CPU backend is the reference implementation of the [`Backend`]
//! contract. Device memory is host heap storage (one `Box<[u8]>` per
//! allocation, addressed by its base pointer), image "loading" resolves
//! kernel entries to host function pointers, and `run` invokes them
//! directly. Because device memory and host memory share an address space,
//! end-to-end map→run→unmap flows execute for real in tests without any
//! accelerator hardware.

use std::collections::{BTreeMap, HashMap, HashSet};

use parking_lot::Mutex;

use crate::error::{BackendError, Result};
use crate::traits::Backend;
use crate::types::{BackendKind, Capabilities, DevicePtr, ImageBlob, LoadedSymbol, SymbolKind, CONTRACT_VERSION};

/// Signature of a host-executable kernel entry point
///
/// Kernels receive a pointer to the device-resident argument block: an array
/// of one device address per mapped item, in item order.
pub type HostKernel = unsafe extern "C" fn(*mut u64);

/// Per-device state of the host-emulation backend
#[derive(Default)]
struct CpuDevice {
    /// Live allocations keyed by base address
    allocations: BTreeMap<u64, Box<[u8]>>,
    /// Device storage of loaded image variables, keyed by host symbol address
    image_vars: HashMap<u64, DevicePtr>,
    /// Loaded kernel entry addresses
    entries: HashSet<u64>,
}

impl CpuDevice {
    /// Resolve a device pointer to `(base, offset)` of its containing
    /// allocation, bounds-checking `len` bytes from the offset.
    fn locate(&self, ptr: DevicePtr, len: usize) -> Result<(u64, usize)> {
        let (base, buf) = self
            .allocations
            .range(..=ptr.addr())
            .next_back()
            .ok_or(BackendError::InvalidDevicePointer(ptr.addr()))?;
        let offset = (ptr.addr() - base) as usize;
        if offset >= buf.len() {
            return Err(BackendError::InvalidDevicePointer(ptr.addr()));
        }
        if offset + len > buf.len() {
            return Err(BackendError::TransferOutOfBounds {
                offset,
                len,
                size: buf.len(),
            });
        }
        Ok((*base, offset))
    }
}

/// Host-emulation backend: device memory is host heap storage
pub struct CpuBackend {
    devices: Vec<Mutex<CpuDevice>>,
}

impl CpuBackend {
    /// Create a backend exposing a single emulated device
    pub fn new() -> Self {
        Self::with_devices(1)
    }

    /// Create a backend exposing `count` emulated devices
    pub fn with_devices(count: usize) -> Self {
        Self {
            devices: (0..count).map(|_| Mutex::new(CpuDevice::default())).collect(),
        }
    }

    fn device(&self, device: usize) -> Result<&Mutex<CpuDevice>> {
        self.devices.get(device).ok_or(BackendError::InvalidDevice(device))
    }

    /// Number of live allocations on a device (test observability)
    pub fn live_allocations(&self, device: usize) -> usize {
        self.device(device).map(|d| d.lock().allocations.len()).unwrap_or(0)
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }

    fn device_count(&self) -> usize {
        self.devices.len()
    }

    fn init(&self, device: usize) -> Result<()> {
        self.device(device)?;
        tracing::debug!(device = device, "cpu_backend_init");
        Ok(())
    }

    fn fini(&self, device: usize) -> Result<()> {
        let dev = self.device(device)?;
        let mut state = dev.lock();
        state.allocations.clear();
        state.image_vars.clear();
        state.entries.clear();
        Ok(())
    }

    fn alloc(&self, device: usize, bytes: usize) -> Result<DevicePtr> {
        if bytes == 0 {
            return Err(BackendError::AllocationFailed { requested: 0 });
        }
        let dev = self.device(device)?;
        let buf = vec![0u8; bytes].into_boxed_slice();
        let base = buf.as_ptr() as u64;
        dev.lock().allocations.insert(base, buf);
        Ok(DevicePtr::new(base))
    }

    fn free(&self, device: usize, ptr: DevicePtr) -> Result<()> {
        let dev = self.device(device)?;
        if dev.lock().allocations.remove(&ptr.addr()).is_none() {
            return Err(BackendError::InvalidDevicePointer(ptr.addr()));
        }
        Ok(())
    }

    fn host_to_device(&self, device: usize, dst: DevicePtr, src: u64, len: usize) -> Result<()> {
        let dev = self.device(device)?;
        let mut state = dev.lock();
        let (base, offset) = state.locate(dst, len)?;
        let buf = state.allocations.get_mut(&base).expect("located allocation");
        // Safety: the caller guarantees src references live host memory
        // readable for len bytes; the destination range was bounds-checked.
        unsafe {
            std::ptr::copy(src as *const u8, buf.as_mut_ptr().add(offset), len);
        }
        Ok(())
    }

    fn device_to_host(&self, device: usize, dst: u64, src: DevicePtr, len: usize) -> Result<()> {
        let dev = self.device(device)?;
        let state = dev.lock();
        let (base, offset) = state.locate(src, len)?;
        let buf = state.allocations.get(&base).expect("located allocation");
        // Safety: the caller guarantees dst references live host memory
        // writable for len bytes; the source range was bounds-checked.
        unsafe {
            std::ptr::copy(buf.as_ptr().add(offset), dst as *mut u8, len);
        }
        Ok(())
    }

    fn device_to_device(&self, device: usize, dst: DevicePtr, src: DevicePtr, len: usize) -> Result<()> {
        let dev = self.device(device)?;
        let mut state = dev.lock();
        let (src_base, src_offset) = state.locate(src, len)?;
        let (dst_base, dst_offset) = state.locate(dst, len)?;
        // Stage through a temporary so aliasing source/destination
        // allocations behave like memmove.
        let tmp = state.allocations[&src_base][src_offset..src_offset + len].to_vec();
        let buf = state.allocations.get_mut(&dst_base).expect("located allocation");
        buf[dst_offset..dst_offset + len].copy_from_slice(&tmp);
        Ok(())
    }

    fn load_image(&self, device: usize, image: &ImageBlob) -> Result<Vec<LoadedSymbol>> {
        if image.version != CONTRACT_VERSION {
            return Err(BackendError::ImageVersionMismatch {
                expected: CONTRACT_VERSION,
                actual: image.version,
            });
        }
        let dev = self.device(device)?;
        let mut entries = Vec::with_capacity(image.symbols.len());
        for (index, symbol) in image.symbols.iter().enumerate() {
            match symbol.kind {
                SymbolKind::Function => {
                    // Host execution: the device entry is the host function.
                    dev.lock().entries.insert(symbol.host_addr);
                    entries.push(LoadedSymbol {
                        host_index: index,
                        device_ptr: DevicePtr::new(symbol.host_addr),
                        device_size: 0,
                    });
                }
                SymbolKind::Variable => {
                    let ptr = self.alloc(device, symbol.size)?;
                    self.host_to_device(device, ptr, symbol.host_addr, symbol.size)?;
                    dev.lock().image_vars.insert(symbol.host_addr, ptr);
                    entries.push(LoadedSymbol {
                        host_index: index,
                        device_ptr: ptr,
                        device_size: symbol.size,
                    });
                }
            }
        }
        tracing::debug!(device = device, symbols = image.symbols.len(), "cpu_image_loaded");
        Ok(entries)
    }

    fn unload_image(&self, device: usize, image: &ImageBlob) -> Result<()> {
        let dev = self.device(device)?;
        for symbol in &image.symbols {
            match symbol.kind {
                SymbolKind::Function => {
                    dev.lock().entries.remove(&symbol.host_addr);
                }
                SymbolKind::Variable => {
                    let ptr = dev
                        .lock()
                        .image_vars
                        .remove(&symbol.host_addr)
                        .ok_or(BackendError::ImageNotLoaded { device })?;
                    self.free(device, ptr)?;
                }
            }
        }
        Ok(())
    }

    fn run(&self, device: usize, entry: DevicePtr, args: DevicePtr) -> Result<()> {
        let dev = self.device(device)?;
        let args_ptr = {
            let state = dev.lock();
            if !state.entries.contains(&entry.addr()) {
                return Err(BackendError::InvalidEntry(entry.addr()));
            }
            if args.is_null() {
                std::ptr::null_mut()
            } else {
                let (base, offset) = state.locate(args, std::mem::size_of::<u64>())?;
                let buf = state.allocations.get(&base).expect("located allocation");
                // Emulated device memory is host memory: hand the kernel a
                // direct pointer into the argument block.
                unsafe { buf.as_ptr().add(offset) as *mut u64 }
            }
        };
        // Safety: entry was registered by load_image from a host function
        // address with the HostKernel ABI; args points at the device-resident
        // argument block (or null for argument-less kernels). The per-device
        // lock is released before the call so the kernel may not re-enter
        // the backend.
        unsafe {
            let kernel: HostKernel = std::mem::transmute(entry.addr() as usize);
            kernel(args_ptr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ImageSymbol;

    #[test]
    fn test_alloc_free_roundtrip() {
        let backend = CpuBackend::new();
        let ptr = backend.alloc(0, 64).unwrap();
        assert!(!ptr.is_null());
        assert_eq!(backend.live_allocations(0), 1);
        backend.free(0, ptr).unwrap();
        assert_eq!(backend.live_allocations(0), 0);
        assert!(backend.free(0, ptr).is_err());
    }

    #[test]
    fn test_zero_byte_alloc_fails() {
        let backend = CpuBackend::new();
        assert!(matches!(
            backend.alloc(0, 0),
            Err(BackendError::AllocationFailed { requested: 0 })
        ));
    }

    #[test]
    fn test_transfer_roundtrip() {
        let backend = CpuBackend::new();
        let ptr = backend.alloc(0, 16).unwrap();

        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        backend
            .host_to_device(0, ptr.offset(4), src.as_ptr() as u64, src.len())
            .unwrap();

        let mut dst = [0u8; 8];
        backend
            .device_to_host(0, dst.as_mut_ptr() as u64, ptr.offset(4), dst.len())
            .unwrap();
        assert_eq!(dst, src);

        backend.free(0, ptr).unwrap();
    }

    #[test]
    fn test_transfer_out_of_bounds() {
        let backend = CpuBackend::new();
        let ptr = backend.alloc(0, 8).unwrap();
        let src = [0u8; 16];
        let result = backend.host_to_device(0, ptr, src.as_ptr() as u64, 16);
        assert!(matches!(result, Err(BackendError::TransferOutOfBounds { .. })));
    }

    #[test]
    fn test_device_to_device() {
        let backend = CpuBackend::new();
        let a = backend.alloc(0, 8).unwrap();
        let b = backend.alloc(0, 8).unwrap();

        let src = [9u8, 8, 7, 6, 5, 4, 3, 2];
        backend.host_to_device(0, a, src.as_ptr() as u64, 8).unwrap();
        backend.device_to_device(0, b, a, 8).unwrap();

        let mut dst = [0u8; 8];
        backend.device_to_host(0, dst.as_mut_ptr() as u64, b, 8).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn test_image_version_mismatch() {
        let backend = CpuBackend::new();
        let image = ImageBlob {
            version: CONTRACT_VERSION + 1,
            symbols: vec![],
            payload: vec![],
        };
        assert!(matches!(
            backend.load_image(0, &image),
            Err(BackendError::ImageVersionMismatch { .. })
        ));
    }

    #[test]
    fn test_variable_load_copies_initial_value() {
        let backend = CpuBackend::new();
        let host_var: [u32; 4] = [7, 11, 13, 17];
        let image = ImageBlob {
            version: CONTRACT_VERSION,
            symbols: vec![ImageSymbol::variable("v", host_var.as_ptr() as u64, 16)],
            payload: vec![],
        };
        let entries = backend.load_image(0, &image).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].device_size, 16);

        let mut dst = [0u8; 16];
        backend
            .device_to_host(0, dst.as_mut_ptr() as u64, entries[0].device_ptr, 16)
            .unwrap();
        assert_eq!(bytemuck::cast_slice::<u8, u32>(&dst), &host_var);

        backend.unload_image(0, &image).unwrap();
        assert_eq!(backend.live_allocations(0), 0);
    }

    extern "C" fn doubler(args: *mut u64) {
        // args[0] points at a single u64 cell in emulated device memory.
        unsafe {
            let cell = *args as *mut u64;
            *cell *= 2;
        }
    }

    #[test]
    fn test_run_invokes_host_kernel() {
        let backend = CpuBackend::new();
        let image = ImageBlob {
            version: CONTRACT_VERSION,
            symbols: vec![ImageSymbol::function("doubler", doubler as usize as u64)],
            payload: vec![],
        };
        let entries = backend.load_image(0, &image).unwrap();
        let entry = entries[0].device_ptr;

        let data = backend.alloc(0, 8).unwrap();
        let value = 21u64;
        backend
            .host_to_device(0, data, &value as *const u64 as u64, 8)
            .unwrap();

        let args = backend.alloc(0, 8).unwrap();
        let arg_value = data.addr();
        backend
            .host_to_device(0, args, &arg_value as *const u64 as u64, 8)
            .unwrap();

        backend.run(0, entry, args).unwrap();

        let mut result = 0u64;
        backend
            .device_to_host(0, &mut result as *mut u64 as u64, data, 8)
            .unwrap();
        assert_eq!(result, 42);
    }

    #[test]
    fn test_run_rejects_unknown_entry() {
        let backend = CpuBackend::new();
        let result = backend.run(0, DevicePtr::new(0x1234), DevicePtr::NULL);
        assert!(matches!(result, Err(BackendError::InvalidEntry(_))));
    }
}
