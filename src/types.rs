//! Primitive semantic types shared across the parser, state and snapshot layers.

use serde::{Deserialize, Serialize};

/// Tick count in trace clocks.
pub type Timestamp = u64;
/// GPU virtual or physical address.
pub type Address = u64;
/// Opaque identifier supplied by the trace.
pub type Handle = u64;
pub type ProcessId = u32;

/// Granularity of the page table.
pub const PAGE_SIZE: u64 = 4096;
pub const PAGE_SHIFT: u32 = 12;
pub const MAX_SEGMENTS: usize = 16;
pub const HEAP_PREFERENCE_COUNT: usize = 4;
/// Clock frequency assumed when a trace carries no system info.
pub const DEFAULT_TIMESTAMP_FREQUENCY: u64 = 1_000_000_000;

#[inline]
pub fn bytes_to_pages(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

#[inline]
pub fn address_to_page(address: Address) -> u64 {
    address >> PAGE_SHIFT
}

#[inline]
pub fn page_to_address(page: u64) -> Address {
    page << PAGE_SHIFT
}

/// Index into the segment table of a trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u8);

impl SegmentId {
    pub const UNKNOWN: SegmentId = SegmentId(u8::MAX);

    pub fn is_known(self) -> bool {
        self != Self::UNKNOWN
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl Default for SegmentId {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SegmentKind {
    /// CPU-visible device memory.
    Local,
    /// Device memory invisible to the host.
    Invisible,
    /// Host memory the device reads through the bus.
    HostVisible,
    /// Non-local system memory; residency semantics are driver defined.
    NonLocal,
}

impl SegmentKind {
    pub const COUNT: usize = 4;
    pub const ALL: [SegmentKind; 4] = [
        SegmentKind::Local,
        SegmentKind::Invisible,
        SegmentKind::HostVisible,
        SegmentKind::NonLocal,
    ];

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SegmentKind::Local),
            1 => Some(SegmentKind::Invisible),
            2 => Some(SegmentKind::HostVisible),
            3 => Some(SegmentKind::NonLocal),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            SegmentKind::Local => "local",
            SegmentKind::Invisible => "invisible",
            SegmentKind::HostVisible => "host-visible",
            SegmentKind::NonLocal => "non-local",
        }
    }
}

/// Usage class inferred from a resource's create parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ResourceUsage {
    Image,
    Buffer,
    CommandAllocator,
    Pipeline,
    Heap,
    DescriptorPool,
    AccelerationStructure,
    QueryHeap,
    VideoDecoder,
    VideoEncoder,
    MiscInternal,
    FreeSpace,
    Unknown,
}

impl ResourceUsage {
    pub const COUNT: usize = 13;
    pub const ALL: [ResourceUsage; 13] = [
        ResourceUsage::Image,
        ResourceUsage::Buffer,
        ResourceUsage::CommandAllocator,
        ResourceUsage::Pipeline,
        ResourceUsage::Heap,
        ResourceUsage::DescriptorPool,
        ResourceUsage::AccelerationStructure,
        ResourceUsage::QueryHeap,
        ResourceUsage::VideoDecoder,
        ResourceUsage::VideoEncoder,
        ResourceUsage::MiscInternal,
        ResourceUsage::FreeSpace,
        ResourceUsage::Unknown,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            ResourceUsage::Image => "image",
            ResourceUsage::Buffer => "buffer",
            ResourceUsage::CommandAllocator => "command-allocator",
            ResourceUsage::Pipeline => "pipeline",
            ResourceUsage::Heap => "heap",
            ResourceUsage::DescriptorPool => "descriptor-pool",
            ResourceUsage::AccelerationStructure => "acceleration-structure",
            ResourceUsage::QueryHeap => "query-heap",
            ResourceUsage::VideoDecoder => "video-decoder",
            ResourceUsage::VideoEncoder => "video-encoder",
            ResourceUsage::MiscInternal => "misc-internal",
            ResourceUsage::FreeSpace => "free-space",
            ResourceUsage::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerType {
    Application,
    Driver,
    ClientDriver,
    Kernel,
}

impl OwnerType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(OwnerType::Application),
            1 => Some(OwnerType::Driver),
            2 => Some(OwnerType::ClientDriver),
            3 => Some(OwnerType::Kernel),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommitType {
    Committed,
    Placed,
    Virtual,
}

impl CommitType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(CommitType::Committed),
            1 => Some(CommitType::Placed),
            2 => Some(CommitType::Virtual),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageSize {
    Size4K,
    Size64K,
    Size256K,
    Size1M,
    Size2M,
}

impl PageSize {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PageSize::Size4K),
            1 => Some(PageSize::Size64K),
            2 => Some(PageSize::Size256K),
            3 => Some(PageSize::Size1M),
            4 => Some(PageSize::Size2M),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn bytes(self) -> u64 {
        match self {
            PageSize::Size4K => 4 << 10,
            PageSize::Size64K => 64 << 10,
            PageSize::Size256K => 256 << 10,
            PageSize::Size1M => 1 << 20,
            PageSize::Size2M => 2 << 20,
        }
    }

    /// Number of 4 KiB pages covered by one page of this size.
    pub fn small_pages(self) -> u64 {
        self.bytes() / PAGE_SIZE
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MiscKind {
    SubmitGfx,
    SubmitCompute,
    SubmitCopy,
    Present,
    InvalidateRanges,
    FlushMappedRange,
    TrimMemory,
}

impl MiscKind {
    pub const COUNT: usize = 7;

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(MiscKind::SubmitGfx),
            1 => Some(MiscKind::SubmitCompute),
            2 => Some(MiscKind::SubmitCopy),
            3 => Some(MiscKind::Present),
            4 => Some(MiscKind::InvalidateRanges),
            5 => Some(MiscKind::FlushMappedRange),
            6 => Some(MiscKind::TrimMemory),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

/// Whether backing memory currently sits in its preferred segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Residency {
    #[default]
    Resident,
    Evicted,
}
