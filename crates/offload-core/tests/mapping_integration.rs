//! End-to-end engine tests against the CPU emulation backend.
//!
//! Emulated device memory is ordinary host heap storage, so these tests can
//! observe real transfers, kernel execution through host function pointers,
//! and storage lifetimes via the backend's live-allocation count.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use offload_backends::Result as BackendResult;
use offload_core::{
    set_default_device, Backend, BackendError, BackendKind, BatchRequest, Capabilities,
    CopyEndpoint, CpuBackend, DevicePtr, ImageBlob, ImageSymbol, LoadedSymbol, MapItem,
    OffloadImage, PragmaKind, Registry, CONTRACT_VERSION, DEVICE_DEFAULT,
};
use serial_test::serial;

fn cpu_registry() -> (Arc<CpuBackend>, Registry) {
    let cpu = Arc::new(CpuBackend::new());
    let registry = Registry::with_backends(vec![cpu.clone() as Arc<dyn Backend>]);
    (cpu, registry)
}

/// Scales four u64s in place: args[0] is the data array, args[1] points at
/// the embedded factor.
unsafe extern "C" fn scale_kernel(args: *mut u64) {
    let data = *args as *mut u64;
    let factor = *(*args.add(1) as *const u64);
    for i in 0..4 {
        *data.add(i) *= factor;
    }
}

#[test]
fn test_kernel_roundtrip_with_firstprivate() {
    let (_cpu, registry) = cpu_registry();
    let entry = scale_kernel as usize as u64;
    registry
        .register_image(OffloadImage::new(
            BackendKind::Cpu,
            ImageBlob {
                version: CONTRACT_VERSION,
                symbols: vec![ImageSymbol::function("scale_kernel", entry)],
                payload: Vec::new(),
            },
        ))
        .unwrap();

    let device = registry.resolve(0).unwrap();
    let mut data: Vec<u64> = vec![1, 2, 3, 4];
    let addr = data.as_mut_ptr() as u64;
    let factor: u64 = 3;

    let items = vec![
        MapItem::tofrom(addr, 32),
        MapItem::firstprivate(&factor as *const u64 as u64, 8),
    ];
    let batch = device
        .map_batch(BatchRequest::new(PragmaKind::Kernel, items))
        .unwrap()
        .unwrap();
    device.launch(entry, batch).unwrap();
    device.release_batch(batch, true).unwrap();

    assert_eq!(data, vec![3, 6, 9, 12]);
    assert!(!device.is_present(addr, 32));
}

#[test]
fn test_storage_freed_only_after_last_holder() {
    let (cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();
    let baseline = cpu.live_allocations(0);

    let mut data = vec![7u32; 8];
    let addr = data.as_mut_ptr() as u64;
    let map = || BatchRequest::new(PragmaKind::DataRegion, vec![MapItem::tofrom(addr, 32)]);

    let first = device.map_batch(map()).unwrap().unwrap();
    let second = device.map_batch(map()).unwrap().unwrap();
    assert_eq!(cpu.live_allocations(0), baseline + 1, "second map reuses the record");

    // Mutate the device copy so the copy-back is observable.
    let device_addr = device.device_addr(addr).unwrap();
    let updated = [9u32; 8];
    registry
        .copy(
            CopyEndpoint::device(0, device_addr.addr()),
            CopyEndpoint::host(updated.as_ptr() as u64),
            32,
            0,
            0,
        )
        .unwrap();

    device.release_batch(first, true).unwrap();
    assert_eq!(data[0], 7, "copy-back waits for the last holder");
    assert!(device.is_present(addr, 32));

    device.release_batch(second, true).unwrap();
    assert_eq!(data, vec![9u32; 8]);
    assert!(!device.is_present(addr, 32));
    assert_eq!(cpu.live_allocations(0), baseline);
}

#[repr(C)]
struct Node {
    value: u64,
    data: *mut u64,
    tag: u64,
}

#[test]
fn test_struct_group_shares_one_record() {
    let (_cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();

    let mut payload = vec![5u64; 4];
    let payload_addr = payload.as_mut_ptr() as u64;
    let mut node = Node {
        value: 11,
        data: payload.as_mut_ptr(),
        tag: 13,
    };
    let node_addr = &mut node as *mut Node as u64;

    let items = vec![
        MapItem::to(payload_addr, 32),
        MapItem::struct_header(node_addr, 24, 2),
        MapItem::to(node_addr, 8),
        MapItem::pointer(node_addr + 8, 0),
    ];
    let batch = device
        .map_batch(BatchRequest::new(PragmaKind::DataRegion, items))
        .unwrap()
        .unwrap();

    let results = device.item_results(batch).unwrap();
    let header = results[1].device_addr.unwrap();
    assert_eq!(results[1].record, results[2].record, "members share the header's record");
    assert_eq!(results[2].device_addr.unwrap().addr(), header.addr());
    assert_eq!(
        results[3].device_addr.unwrap().addr(),
        header.addr() + 8,
        "member offsets carry over from the host layout"
    );

    // The device-resident pointer cell was rewritten to the device copy of
    // the payload.
    let mut cell = 0u64;
    registry
        .copy(
            CopyEndpoint::host(&mut cell as *mut u64 as u64),
            CopyEndpoint::device(0, header.addr() + 8),
            8,
            0,
            0,
        )
        .unwrap();
    assert_eq!(cell, device.device_addr(payload_addr).unwrap().addr());

    device.release_batch(batch, true).unwrap();
    assert!(!device.is_present(node_addr, 24));
    assert!(!device.is_present(payload_addr, 32));
}

#[test]
fn test_repeated_range_shares_one_block() {
    let (cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();
    let baseline = cpu.live_allocations(0);

    // The same unmapped storage named twice in one request gets one block,
    // with the sub-range attaching at its interior offset.
    let mut data = vec![6u64; 4];
    let addr = data.as_mut_ptr() as u64;
    let items = vec![MapItem::tofrom(addr, 32), MapItem::to(addr + 8, 16)];
    let batch = device
        .map_batch(BatchRequest::new(PragmaKind::Kernel, items))
        .unwrap()
        .unwrap();

    let results = device.item_results(batch).unwrap();
    assert_eq!(results[0].record, results[1].record, "the repeat shares the first item's record");
    assert_eq!(
        results[1].device_addr.unwrap().addr(),
        results[0].device_addr.unwrap().addr() + 8
    );

    // Both references belong to this batch, so one release drains the record.
    device.release_batch(batch, true).unwrap();
    assert!(!device.is_present(addr, 32));
    assert_eq!(cpu.live_allocations(0), baseline);
}

#[test]
fn test_pointer_rebase_applies_bias() {
    let (_cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();

    let mut target = vec![0u64; 4];
    let target_addr = target.as_mut_ptr() as u64;
    device
        .map_batch(BatchRequest::new(
            PragmaKind::EnterData,
            vec![MapItem::to(target_addr, 32)],
        ))
        .unwrap();

    // The cell points at element 2; a bias of 16 walks the device value back
    // to the array base.
    let cell: *mut u64 = unsafe { target.as_mut_ptr().add(2) };
    let cell_addr = &cell as *const *mut u64 as u64;
    let batch = device
        .map_batch(BatchRequest::new(
            PragmaKind::Kernel,
            vec![MapItem::pointer(cell_addr, 16)],
        ))
        .unwrap()
        .unwrap();

    let results = device.item_results(batch).unwrap();
    let mut device_value = 0u64;
    registry
        .copy(
            CopyEndpoint::host(&mut device_value as *mut u64 as u64),
            CopyEndpoint::device(0, results[0].device_addr.unwrap().addr()),
            8,
            0,
            0,
        )
        .unwrap();
    assert_eq!(device_value, device.device_addr(target_addr).unwrap().addr());

    device.release_batch(batch, true).unwrap();
    device
        .exit_partial(&[MapItem::alloc(target_addr, 32)], true)
        .unwrap();
}

#[test]
fn test_zero_length_section() {
    let (_cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();
    let mut data = vec![1u8; 64];
    let addr = data.as_mut_ptr() as u64;

    // Absent probe: silently unmapped, not an error.
    let absent = device
        .map_batch(BatchRequest::new(
            PragmaKind::Kernel,
            vec![MapItem::zero_len(addr + 8)],
        ))
        .unwrap()
        .unwrap();
    assert!(device.item_results(absent).unwrap()[0].device_addr.is_none());
    device.release_batch(absent, true).unwrap();

    // With an enclosing record the probe attaches at its interior offset.
    device
        .map_batch(BatchRequest::new(
            PragmaKind::EnterData,
            vec![MapItem::to(addr, 64)],
        ))
        .unwrap();
    let attached = device
        .map_batch(BatchRequest::new(
            PragmaKind::Kernel,
            vec![MapItem::zero_len(addr + 8)],
        ))
        .unwrap()
        .unwrap();
    let results = device.item_results(attached).unwrap();
    assert_eq!(
        results[0].device_addr.unwrap().addr(),
        device.device_addr(addr).unwrap().addr() + 8
    );
    device.release_batch(attached, true).unwrap();
    assert!(device.is_present(addr, 64), "zero-length holders are symmetric");

    device.exit_partial(&[MapItem::from(addr, 64)], false).unwrap();
    assert!(!device.is_present(addr, 64));
}

#[test]
fn test_enter_exit_data_lifecycle() {
    let (cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();
    let baseline = cpu.live_allocations(0);

    let mut data = vec![3u16; 16];
    let addr = data.as_mut_ptr() as u64;

    let handle = device
        .map_batch(BatchRequest::new(
            PragmaKind::EnterData,
            vec![MapItem::tofrom(addr, 32)],
        ))
        .unwrap();
    assert!(handle.is_none(), "enter-data persists through records, not handles");
    assert!(device.is_present(addr, 32));

    // A second enter raises the count; one exit is not enough.
    device
        .map_batch(BatchRequest::new(
            PragmaKind::EnterData,
            vec![MapItem::tofrom(addr, 32)],
        ))
        .unwrap();
    device.exit_partial(&[MapItem::from(addr, 32)], false).unwrap();
    assert!(device.is_present(addr, 32));

    // Forced delete drops the record regardless of its count.
    device.exit_partial(&[MapItem::alloc(addr, 32)], true).unwrap();
    assert!(!device.is_present(addr, 32));
    assert_eq!(cpu.live_allocations(0), baseline);

    // Exiting an absent range with delete stays silent.
    device.exit_partial(&[MapItem::alloc(addr, 32)], true).unwrap();
}

#[test]
fn test_async_copy_back_single_holder() {
    let (_cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();

    let mut data = vec![0u64; 4];
    let addr = data.as_mut_ptr() as u64;
    let batch = device
        .map_batch(BatchRequest::new(
            PragmaKind::DataRegion,
            vec![MapItem::tofrom(addr, 32)],
        ))
        .unwrap()
        .unwrap();

    let device_addr = device.device_addr(addr).unwrap();
    let nines = [9u64; 4];
    registry
        .copy(
            CopyEndpoint::device(0, device_addr.addr()),
            CopyEndpoint::host(nines.as_ptr() as u64),
            32,
            0,
            0,
        )
        .unwrap();

    device.async_copy_back(batch).unwrap();
    assert_eq!(data, vec![9u64; 4], "last holder copies back immediately");
    assert!(device.is_present(addr, 32), "record survives until the real release");

    // The record must not be copied a second time on release.
    let fives = [5u64; 4];
    registry
        .copy(
            CopyEndpoint::device(0, device_addr.addr()),
            CopyEndpoint::host(fives.as_ptr() as u64),
            32,
            0,
            0,
        )
        .unwrap();
    device.release_batch(batch, true).unwrap();
    assert_eq!(data, vec![9u64; 4]);
    assert!(!device.is_present(addr, 32));
}

#[test]
fn test_async_copy_back_defers_to_remaining_holder() {
    let (_cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();

    let mut data = vec![0u32; 8];
    let addr = data.as_mut_ptr() as u64;
    let map = || BatchRequest::new(PragmaKind::DataRegion, vec![MapItem::tofrom(addr, 32)]);
    let first = device.map_batch(map()).unwrap().unwrap();
    let second = device.map_batch(map()).unwrap().unwrap();

    device.async_copy_back(first).unwrap();
    assert_eq!(data, vec![0u32; 8], "copy deferred while another holder remains");

    let device_addr = device.device_addr(addr).unwrap();
    let ones = [1u32; 8];
    registry
        .copy(
            CopyEndpoint::device(0, device_addr.addr()),
            CopyEndpoint::host(ones.as_ptr() as u64),
            32,
            0,
            0,
        )
        .unwrap();

    // The deferred reference is dropped without keeping the record alive
    // past the remaining holder.
    device.release_batch(first, true).unwrap();
    assert!(device.is_present(addr, 32));
    device.release_batch(second, true).unwrap();
    assert_eq!(data, vec![1u32; 8]);
    assert!(!device.is_present(addr, 32));
}

#[test]
fn test_use_device_ptr_translates_without_mapping() {
    let (_cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();

    let mut data = vec![0u8; 32];
    let addr = data.as_mut_ptr() as u64;
    device
        .map_batch(BatchRequest::new(
            PragmaKind::EnterData,
            vec![MapItem::to(addr, 32)],
        ))
        .unwrap();

    let batch = device
        .map_batch(BatchRequest::new(
            PragmaKind::Kernel,
            vec![MapItem::use_device_ptr(addr + 4), MapItem::use_device_ptr(0xdead_0000)],
        ))
        .unwrap()
        .unwrap();
    let results = device.item_results(batch).unwrap();
    assert_eq!(
        results[0].device_addr.unwrap().addr(),
        device.device_addr(addr).unwrap().addr() + 4
    );
    assert!(results[0].record.is_none(), "translation takes no reference");
    assert!(results[1].device_addr.is_none(), "unmapped address translates to nothing");

    device.release_batch(batch, true).unwrap();
    assert!(device.is_present(addr, 32), "use-device-ptr held no reference to drop");
    device.exit_partial(&[MapItem::alloc(addr, 32)], true).unwrap();
}

#[test]
fn test_force_present_reuses_without_copying() {
    let (_cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();

    let mut data = vec![1u64; 4];
    let addr = data.as_mut_ptr() as u64;
    device
        .map_batch(BatchRequest::new(
            PragmaKind::EnterData,
            vec![MapItem::to(addr, 32)],
        ))
        .unwrap();

    // A later host update must not leak through a presence-only map.
    data.copy_from_slice(&[2, 2, 2, 2]);
    let batch = device
        .map_batch(BatchRequest::new(
            PragmaKind::Kernel,
            vec![MapItem::tofrom(addr, 32).force_present()],
        ))
        .unwrap()
        .unwrap();

    let mut device_copy = [0u64; 4];
    registry
        .copy(
            CopyEndpoint::host(device_copy.as_mut_ptr() as u64),
            CopyEndpoint::device(0, device.device_addr(addr).unwrap().addr()),
            32,
            0,
            0,
        )
        .unwrap();
    assert_eq!(device_copy, [1u64; 4], "reuse issues no to-copy");

    device.release_batch(batch, true).unwrap();
    assert!(device.is_present(addr, 32), "the enter-data reference remains");
    assert_eq!(data, vec![2u64; 4], "copy-back waits for the last holder");

    device.exit_partial(&[MapItem::from(addr, 32)], false).unwrap();
    assert!(!device.is_present(addr, 32));
    assert_eq!(data, vec![1u64; 4]);
}

#[test]
fn test_associate_lifecycle() {
    let (cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();

    let mut data = vec![4u8; 32];
    let addr = data.as_mut_ptr() as u64;
    let storage = cpu.alloc(0, 32).unwrap();

    device.associate(addr, storage, 32).unwrap();
    assert!(device.is_present(addr, 32));

    // Identical re-association is a no-op; a conflicting one is refused.
    device.associate(addr, storage, 32).unwrap();
    assert!(device.associate(addr, DevicePtr::new(storage.addr() + 8), 32).is_err());

    // Mappings reuse the associated storage and never release it.
    let batch = device
        .map_batch(BatchRequest::new(
            PragmaKind::Kernel,
            vec![MapItem::tofrom(addr, 32)],
        ))
        .unwrap()
        .unwrap();
    let results = device.item_results(batch).unwrap();
    assert_eq!(results[0].device_addr.unwrap(), storage);
    device.release_batch(batch, true).unwrap();
    assert!(device.is_present(addr, 32));

    device.disassociate(addr).unwrap();
    assert!(!device.is_present(addr, 32));
    assert!(device.disassociate(addr).is_err());
}

/// Backend that delegates to the CPU emulation but fails a fixed number of
/// device-to-host transfers first.
struct FlakyReadback {
    inner: CpuBackend,
    failures: AtomicUsize,
}

impl FlakyReadback {
    fn failing(n: usize) -> Self {
        Self {
            inner: CpuBackend::new(),
            failures: AtomicUsize::new(n),
        }
    }
}

impl Backend for FlakyReadback {
    fn kind(&self) -> BackendKind {
        self.inner.kind()
    }
    fn capabilities(&self) -> Capabilities {
        self.inner.capabilities()
    }
    fn device_count(&self) -> usize {
        self.inner.device_count()
    }
    fn init(&self, device: usize) -> BackendResult<()> {
        self.inner.init(device)
    }
    fn fini(&self, device: usize) -> BackendResult<()> {
        self.inner.fini(device)
    }
    fn alloc(&self, device: usize, bytes: usize) -> BackendResult<DevicePtr> {
        self.inner.alloc(device, bytes)
    }
    fn free(&self, device: usize, ptr: DevicePtr) -> BackendResult<()> {
        self.inner.free(device, ptr)
    }
    fn host_to_device(&self, device: usize, dst: DevicePtr, src: u64, len: usize) -> BackendResult<()> {
        self.inner.host_to_device(device, dst, src, len)
    }
    fn device_to_host(&self, device: usize, dst: u64, src: DevicePtr, len: usize) -> BackendResult<()> {
        if self.failures.load(Ordering::SeqCst) > 0 {
            self.failures.fetch_sub(1, Ordering::SeqCst);
            return Err(BackendError::Other("injected readback failure".into()));
        }
        self.inner.device_to_host(device, dst, src, len)
    }
    fn device_to_device(&self, device: usize, dst: DevicePtr, src: DevicePtr, len: usize) -> BackendResult<()> {
        self.inner.device_to_device(device, dst, src, len)
    }
    fn load_image(&self, device: usize, image: &ImageBlob) -> BackendResult<Vec<LoadedSymbol>> {
        self.inner.load_image(device, image)
    }
    fn unload_image(&self, device: usize, image: &ImageBlob) -> BackendResult<()> {
        self.inner.unload_image(device, image)
    }
    fn run(&self, device: usize, entry: DevicePtr, args: DevicePtr) -> BackendResult<()> {
        self.inner.run(device, entry, args)
    }
}

#[test]
fn test_failed_copy_back_keeps_batch_retryable() {
    let backend = Arc::new(FlakyReadback::failing(1));
    let registry = Registry::with_backends(vec![backend.clone() as Arc<dyn Backend>]);
    let device = registry.resolve(0).unwrap();
    let baseline = backend.inner.live_allocations(0);

    let mut data = vec![2u64; 4];
    let addr = data.as_mut_ptr() as u64;
    let batch = device
        .map_batch(BatchRequest::new(
            PragmaKind::DataRegion,
            vec![MapItem::tofrom(addr, 32)],
        ))
        .unwrap()
        .unwrap();

    // Mutate the device copy so the retried copy-back is observable.
    let eights = [8u64; 4];
    registry
        .copy(
            CopyEndpoint::device(0, device.device_addr(addr).unwrap().addr()),
            CopyEndpoint::host(eights.as_ptr() as u64),
            32,
            0,
            0,
        )
        .unwrap();

    assert!(device.release_batch(batch, true).is_err());
    assert!(device.item_results(batch).is_ok(), "the handle survives a failed release");
    assert!(device.is_present(addr, 32));
    assert_eq!(data, vec![2u64; 4]);

    // The retry finishes the copy-back and the teardown.
    device.release_batch(batch, true).unwrap();
    assert_eq!(data, vec![8u64; 4]);
    assert!(!device.is_present(addr, 32));
    assert_eq!(backend.inner.live_allocations(0), baseline);
}

#[test]
#[serial]
fn test_default_device_resolution() {
    let registry =
        Registry::with_backends(vec![Arc::new(CpuBackend::with_devices(2)) as Arc<dyn Backend>]);
    set_default_device(1);
    let device = registry.resolve(DEVICE_DEFAULT).unwrap();
    assert_eq!(device.id(), 1);
    set_default_device(0);
}

// ---- fatal-tier behavior ----------------------------------------------------

#[test]
#[should_panic(expected = "offload:")]
fn test_force_present_miss_panics() {
    let (_cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();
    let data = [0u8; 16];
    let item = MapItem::to(data.as_ptr() as u64, 16).force_present();
    let _ = device.map_batch(BatchRequest::new(PragmaKind::Kernel, vec![item]));
}

#[test]
#[should_panic(expected = "offload:")]
fn test_force_present_partial_coverage_panics() {
    let (_cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();
    let data = [0u8; 32];
    let addr = data.as_ptr() as u64;
    device
        .map_batch(BatchRequest::new(
            PragmaKind::EnterData,
            vec![MapItem::to(addr, 16)],
        ))
        .unwrap();
    let _ = device.map_batch(BatchRequest::new(
        PragmaKind::Kernel,
        vec![MapItem::tofrom(addr, 32).force_present()],
    ));
}

#[test]
#[should_panic(expected = "offload:")]
fn test_incompatible_overlap_panics() {
    let (_cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();
    let data = [0u8; 32];
    let addr = data.as_ptr() as u64;
    device
        .map_batch(BatchRequest::new(
            PragmaKind::EnterData,
            vec![MapItem::to(addr, 16)],
        ))
        .unwrap();
    let _ = device.map_batch(BatchRequest::new(
        PragmaKind::Kernel,
        vec![MapItem::to(addr + 8, 16)],
    ));
}

#[test]
#[should_panic(expected = "offload:")]
fn test_partial_struct_panics() {
    let (_cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();
    let data = [0u8; 32];
    let addr = data.as_ptr() as u64;
    let items = vec![
        MapItem::struct_header(addr, 16, 1),
        MapItem::to(addr + 16, 8),
    ];
    let _ = device.map_batch(BatchRequest::new(PragmaKind::Kernel, items));
}

#[test]
#[should_panic(expected = "offload:")]
fn test_unmapped_pointee_panics() {
    let (_cpu, registry) = cpu_registry();
    let device = registry.resolve(0).unwrap();
    let value = 7u64;
    let cell: *const u64 = &value;
    let cell_addr = &cell as *const *const u64 as u64;
    let _ = device.map_batch(BatchRequest::new(
        PragmaKind::Kernel,
        vec![MapItem::pointer(cell_addr, 0)],
    ));
}

/// Backend whose image loader reports the wrong device size for variables.
struct ShrinkingLoader;

impl Backend for ShrinkingLoader {
    fn kind(&self) -> BackendKind {
        BackendKind::Cpu
    }
    fn capabilities(&self) -> Capabilities {
        Capabilities::full()
    }
    fn device_count(&self) -> usize {
        1
    }
    fn init(&self, _device: usize) -> BackendResult<()> {
        Ok(())
    }
    fn fini(&self, _device: usize) -> BackendResult<()> {
        Ok(())
    }
    fn alloc(&self, _device: usize, _bytes: usize) -> BackendResult<DevicePtr> {
        Err(BackendError::unsupported("alloc"))
    }
    fn free(&self, _device: usize, _ptr: DevicePtr) -> BackendResult<()> {
        Err(BackendError::unsupported("free"))
    }
    fn host_to_device(&self, _device: usize, _dst: DevicePtr, _src: u64, _len: usize) -> BackendResult<()> {
        Err(BackendError::unsupported("h2d"))
    }
    fn device_to_host(&self, _device: usize, _dst: u64, _src: DevicePtr, _len: usize) -> BackendResult<()> {
        Err(BackendError::unsupported("d2h"))
    }
    fn device_to_device(&self, _device: usize, _dst: DevicePtr, _src: DevicePtr, _len: usize) -> BackendResult<()> {
        Err(BackendError::unsupported("d2d"))
    }
    fn load_image(&self, _device: usize, image: &ImageBlob) -> BackendResult<Vec<LoadedSymbol>> {
        Ok(image
            .symbols
            .iter()
            .enumerate()
            .map(|(host_index, symbol)| LoadedSymbol {
                host_index,
                device_ptr: DevicePtr::new(0x1000),
                device_size: symbol.size / 2,
            })
            .collect())
    }
    fn unload_image(&self, _device: usize, _image: &ImageBlob) -> BackendResult<()> {
        Ok(())
    }
    fn run(&self, _device: usize, _entry: DevicePtr, _args: DevicePtr) -> BackendResult<()> {
        Err(BackendError::unsupported("run"))
    }
}

#[test]
#[should_panic(expected = "offload:")]
fn test_image_size_mismatch_panics() {
    let registry = Registry::with_backends(vec![Arc::new(ShrinkingLoader) as Arc<dyn Backend>]);
    let global = 0u64;
    registry
        .register_image(OffloadImage::new(
            BackendKind::Cpu,
            ImageBlob {
                version: CONTRACT_VERSION,
                symbols: vec![ImageSymbol::variable("bad_global", &global as *const u64 as u64, 8)],
                payload: Vec::new(),
            },
        ))
        .unwrap();
    // Replay into the lazily initialized device trips the size validation.
    let _ = registry.resolve(0);
}

#[test]
fn test_image_register_unregister() {
    let (_cpu, registry) = cpu_registry();
    let global = 42u64;
    let addr = &global as *const u64 as u64;
    let handle = registry
        .register_image(OffloadImage::new(
            BackendKind::Cpu,
            ImageBlob {
                version: CONTRACT_VERSION,
                symbols: vec![ImageSymbol::variable("lut", addr, 8)],
                payload: Vec::new(),
            },
        ))
        .unwrap();

    let device = registry.resolve(0).unwrap();
    assert!(device.is_present(addr, 8), "image variables map permanently");

    registry.unregister_image(handle).unwrap();
    assert!(!device.is_present(addr, 8));
}

#[test]
fn test_symbol_kinds_share_the_index() {
    // Functions key zero-length ranges; variables key their full range. Both
    // resolve through the same per-device index.
    let (_cpu, registry) = cpu_registry();
    let entry = scale_kernel as usize as u64;
    let global = [1u8; 16];
    registry
        .register_image(OffloadImage::new(
            BackendKind::Cpu,
            ImageBlob {
                version: CONTRACT_VERSION,
                symbols: vec![
                    ImageSymbol::function("scale_kernel", entry),
                    ImageSymbol::variable("table", global.as_ptr() as u64, 16),
                ],
                payload: Vec::new(),
            },
        ))
        .unwrap();
    let device = registry.resolve(0).unwrap();
    assert!(device.device_addr(entry).is_some());
    assert!(device.device_addr(global.as_ptr() as u64 + 4).is_some());
    assert_eq!(device.record_count(), 2);
}
