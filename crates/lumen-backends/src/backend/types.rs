//! Handles, storage classes and device capability descriptors

use std::fmt;

/// Handle to an engine allocation
///
/// Handles are opaque and only meaningful to the engine that issued them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub u64);

impl BufferHandle {
    pub const fn new(id: u64) -> Self {
        BufferHandle(id)
    }

    pub const fn id(self) -> u64 {
        self.0
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "buf{}", self.0)
    }
}

/// Memory category of an allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Storage {
    /// Host memory, visible to host code and to the engine
    Host,
    /// Device-local memory, reachable only through submitted commands
    Device,
    /// Shared memory migrated on demand between host and device
    Managed,
}

impl Storage {
    pub const ALL: [Storage; 3] = [Storage::Host, Storage::Device, Storage::Managed];

    /// Whether host code may read or write the allocation directly
    pub fn is_host_visible(self) -> bool {
        !matches!(self, Storage::Device)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Storage::Host => "Host",
            Storage::Device => "Device",
            Storage::Managed => "Managed",
        }
    }
}

/// Element type of tensor data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    F32,
    F16,
}

impl DataType {
    /// Size of one element in bytes
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => 4,
            DataType::F16 => 2,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::F32 => f.write_str("f32"),
            DataType::F16 => f.write_str("f16"),
        }
    }
}

/// Operation fused after a convolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PostOp {
    #[default]
    None,
    /// 2x2 max pooling with stride 2
    Pool,
    /// 2x nearest-neighbor upsampling
    Upsample,
}

/// Architecture family reported by device discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArchFamily {
    Scalar,
    Sse41,
    Avx2,
    Avx512,
    Neon,
    /// Asynchronous queue-driven accelerator
    Stream,
}

impl ArchFamily {
    /// Number of f32 lanes of the family's vector unit
    pub const fn vector_width(self) -> usize {
        match self {
            ArchFamily::Scalar => 1,
            ArchFamily::Sse41 | ArchFamily::Neon => 4,
            ArchFamily::Avx2 => 8,
            ArchFamily::Avx512 | ArchFamily::Stream => 16,
        }
    }

    pub const fn is_cpu(self) -> bool {
        !matches!(self, ArchFamily::Stream)
    }
}

/// Capabilities of one device, computed once when its engine is created
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    pub arch: ArchFamily,
    /// f32 lanes processed together by blocked kernels
    pub vector_width: usize,
    /// Post-ops a convolution may fuse on this device
    pub fused_post_ops: Vec<PostOp>,
    /// Whether standalone pooling and upsampling kernels exist
    pub standalone_resample: bool,
    pub device_memory: bool,
    pub managed_memory: bool,
    /// Upper bound for reduction work-group sizes
    pub max_work_group_size: usize,
    /// Smallest tile edge the scheduler may produce
    pub min_tile_size: usize,
    /// Element type used for intermediate tensors
    pub native_type: DataType,
}

impl DeviceCaps {
    /// Capabilities of a CPU engine for the given family
    pub fn cpu(arch: ArchFamily) -> Self {
        Self {
            arch,
            vector_width: arch.vector_width(),
            fused_post_ops: vec![PostOp::None, PostOp::Pool, PostOp::Upsample],
            standalone_resample: true,
            device_memory: false,
            managed_memory: true,
            max_work_group_size: 1,
            min_tile_size: 8,
            native_type: DataType::F32,
        }
    }

    /// Capabilities of the stream engine
    pub fn stream() -> Self {
        Self {
            arch: ArchFamily::Stream,
            vector_width: ArchFamily::Stream.vector_width(),
            fused_post_ops: vec![PostOp::None, PostOp::Pool, PostOp::Upsample],
            standalone_resample: false,
            device_memory: true,
            managed_memory: true,
            max_work_group_size: 1024,
            min_tile_size: 16,
            native_type: DataType::F32,
        }
    }

    /// Detect the vector unit of the host CPU
    pub fn detect_host() -> Self {
        Self::cpu(detect_host_arch())
    }

    pub fn supports_storage(&self, storage: Storage) -> bool {
        match storage {
            Storage::Host => true,
            Storage::Device => self.device_memory,
            Storage::Managed => self.managed_memory,
        }
    }

    pub fn supports_post_op(&self, post_op: PostOp) -> bool {
        self.fused_post_ops.contains(&post_op)
    }
}

#[cfg(target_arch = "x86_64")]
fn detect_host_arch() -> ArchFamily {
    if std::is_x86_feature_detected!("avx512f") {
        ArchFamily::Avx512
    } else if std::is_x86_feature_detected!("avx2") {
        ArchFamily::Avx2
    } else if std::is_x86_feature_detected!("sse4.1") {
        ArchFamily::Sse41
    } else {
        ArchFamily::Scalar
    }
}

#[cfg(target_arch = "aarch64")]
fn detect_host_arch() -> ArchFamily {
    ArchFamily::Neon
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn detect_host_arch() -> ArchFamily {
    ArchFamily::Scalar
}

/// Engine construction options
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    /// Maximum bytes live at once; `None` is unbounded
    pub capacity: Option<usize>,
    /// Override the detected capabilities
    pub caps: Option<DeviceCaps>,
}

impl EngineConfig {
    pub fn with_capacity(mut self, bytes: usize) -> Self {
        self.capacity = Some(bytes);
        self
    }

    pub fn with_caps(mut self, caps: DeviceCaps) -> Self {
        self.caps = Some(caps);
        self
    }
}
