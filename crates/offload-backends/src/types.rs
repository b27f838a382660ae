//! Types shared across the backend contract

use std::fmt;

/// Version tag of the backend contract.
///
/// Backends reporting a different version in their [`Capabilities`] fail
/// discovery; the engine never calls into a mismatched backend.
pub const CONTRACT_VERSION: u32 = 1;

/// Address in a backend's device address space
///
/// Device pointers are opaque to the engine: only the backend that produced
/// one may interpret it. Arithmetic on the raw value is limited to offsetting
/// within a single allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DevicePtr(pub u64);

impl DevicePtr {
    /// The null device pointer
    pub const NULL: DevicePtr = DevicePtr(0);

    /// Create a device pointer from a raw address
    pub const fn new(addr: u64) -> Self {
        DevicePtr(addr)
    }

    /// Get the raw address
    pub const fn addr(self) -> u64 {
        self.0
    }

    /// Offset within the same allocation
    pub const fn offset(self, bytes: u64) -> Self {
        DevicePtr(self.0 + bytes)
    }

    /// Whether this is the null device pointer
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for DevicePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dev:{:#x}", self.0)
    }
}

/// Backend family a device belongs to
///
/// Offload images are tagged with the backend kind they were compiled for;
/// the loader only replays an image into devices of the matching kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// Host-emulation backend (device memory is host heap storage)
    Cpu,
    /// NVIDIA GPU backend
    Cuda,
    /// Apple GPU backend
    Metal,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Cpu => write!(f, "cpu"),
            BackendKind::Cuda => write!(f, "cuda"),
            BackendKind::Metal => write!(f, "metal"),
        }
    }
}

/// Capability set reported by a backend at discovery time
///
/// The required capabilities (`data_transfer`, `image_load`, `kernel_run`)
/// plus a matching `contract_version` gate registration: a backend missing
/// any of them fails discovery for that backend only. Optional capabilities
/// (`device_to_device`) downgrade individual operations to recoverable
/// errors instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capabilities {
    /// Contract version the backend implements
    pub contract_version: u32,
    /// Host-to-device and device-to-host copies are implemented
    pub data_transfer: bool,
    /// Offload images can be loaded and unloaded
    pub image_load: bool,
    /// Kernels can be launched via `run`
    pub kernel_run: bool,
    /// Same-device device-to-device copies are implemented (optional)
    pub device_to_device: bool,
}

impl Capabilities {
    /// Capability set of a fully featured backend on the current contract
    pub const fn full() -> Self {
        Self {
            contract_version: CONTRACT_VERSION,
            data_transfer: true,
            image_load: true,
            kernel_run: true,
            device_to_device: true,
        }
    }

    /// Whether the required capability subset is present and the contract
    /// version matches
    pub fn meets_required(&self) -> bool {
        self.contract_version == CONTRACT_VERSION && self.data_transfer && self.image_load && self.kernel_run
    }
}

/// Kind of an exported image symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolKind {
    /// Kernel entry point; keyed by its host function address (zero length)
    Function,
    /// Global variable; keyed by its host address range
    Variable,
}

/// One entry of an offload image's host-side symbol table
#[derive(Debug, Clone)]
pub struct ImageSymbol {
    /// Symbol name, for diagnostics
    pub name: String,
    /// Function or variable
    pub kind: SymbolKind,
    /// Host address of the symbol
    pub host_addr: u64,
    /// Declared size in bytes (0 for functions)
    pub size: usize,
}

impl ImageSymbol {
    /// Describe a kernel entry point
    pub fn function(name: impl Into<String>, host_addr: u64) -> Self {
        Self {
            name: name.into(),
            kind: SymbolKind::Function,
            host_addr,
            size: 0,
        }
    }

    /// Describe a global variable
    pub fn variable(name: impl Into<String>, host_addr: u64, size: usize) -> Self {
        Self {
            name: name.into(),
            kind: SymbolKind::Variable,
            host_addr,
            size,
        }
    }
}

/// A compiled offload unit as handed to a backend
///
/// The symbol table is shared with the engine-side image loader; `payload`
/// carries backend-specific device code and is opaque to the engine. The
/// host-emulation backend ignores it and executes host function pointers
/// directly.
#[derive(Debug, Clone)]
pub struct ImageBlob {
    /// Contract version the image was produced against
    pub version: u32,
    /// Exported functions and variables
    pub symbols: Vec<ImageSymbol>,
    /// Backend-specific device code
    pub payload: Vec<u8>,
}

/// One loaded symbol as reported back by `load_image`
///
/// `host_index` refers into the [`ImageBlob::symbols`] table; the engine
/// validates that every symbol is accounted for and that variable sizes
/// match their host declarations.
#[derive(Debug, Clone, Copy)]
pub struct LoadedSymbol {
    /// Index into the image's symbol table
    pub host_index: usize,
    /// Device address of the loaded symbol
    pub device_ptr: DevicePtr,
    /// Device-side size in bytes (0 for functions)
    pub device_size: usize,
}
