//! Token encoding.
//!
//! Every token starts with a two byte header followed by a zigzag LEB128 time
//! delta and a kind-specific little-endian payload:
//!
//! ```text
//! byte 0 : bits 0..5 kind, bits 5..8 reserved (zero)
//! byte 1 : thread id
//! varint : signed delta from the previous token of the stream (max 10 bytes)
//! payload
//! ```

use serde::Serialize;

use super::{put_str, put_u16, put_u32, put_u64, put_u8, ByteReader, ReadError, ReadResult};
use crate::types::{
    Address, CommitType, Handle, MiscKind, OwnerType, PageSize, ProcessId, ResourceUsage,
    SegmentKind, Timestamp, HEAP_PREFERENCE_COUNT,
};

pub const TOKEN_HEADER_LEN: usize = 2;
pub const MAX_VARINT_LEN: usize = 10;
const KIND_MASK: u8 = 0x1f;

/// Buffer usage bit marking an acceleration structure backing store.
pub const BUFFER_USAGE_ACCELERATION_STRUCTURE: u32 = 0x100;

const PTE_FLAG_UNMAP: u8 = 1 << 0;
const PTE_TARGET_SHIFT: u8 = 1;
const PTE_TARGET_MASK: u8 = 0b11 << PTE_TARGET_SHIFT;
const BIND_FLAG_SYSTEM_MEMORY: u8 = 1 << 0;
const VALLOC_FLAG_EXTERNAL: u8 = 1 << 0;
const NO_HEAP: u8 = 0xff;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum TokenKind {
    TimeDelta = 0,
    ProcessEvent = 1,
    PageTableUpdate = 2,
    UserData = 3,
    Misc = 4,
    ResourceCreate = 5,
    ResourceDestroy = 6,
    ResourceBind = 7,
    VirtualFree = 8,
    CpuMap = 9,
    CpuUnmap = 10,
    VirtualAllocate = 11,
    PhysicalAllocate = 12,
    PhysicalFree = 13,
    SnapshotMarker = 14,
}

impl TokenKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        let kind = match value {
            0 => TokenKind::TimeDelta,
            1 => TokenKind::ProcessEvent,
            2 => TokenKind::PageTableUpdate,
            3 => TokenKind::UserData,
            4 => TokenKind::Misc,
            5 => TokenKind::ResourceCreate,
            6 => TokenKind::ResourceDestroy,
            7 => TokenKind::ResourceBind,
            8 => TokenKind::VirtualFree,
            9 => TokenKind::CpuMap,
            10 => TokenKind::CpuUnmap,
            11 => TokenKind::VirtualAllocate,
            12 => TokenKind::PhysicalAllocate,
            13 => TokenKind::PhysicalFree,
            14 => TokenKind::SnapshotMarker,
            _ => return None,
        };
        Some(kind)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProcessEventKind {
    Start,
    Stop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum PageTarget {
    /// Ordinary mapping onto physical memory.
    Physical,
    Invalid,
    SystemReserved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PageTableUpdate {
    pub process: ProcessId,
    pub virtual_address: Address,
    pub physical_address: Address,
    pub page_count: u64,
    pub page_size: PageSize,
    pub unmap: bool,
    pub target: PageTarget,
}

impl PageTableUpdate {
    /// Length of the update in 4 KiB pages.
    pub fn small_pages(&self) -> u64 {
        self.page_count.saturating_mul(self.page_size.small_pages())
    }

    pub fn size_in_bytes(&self) -> u64 {
        self.page_count.saturating_mul(self.page_size.bytes())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum UserData {
    DebugName { correlation: Handle, name: String },
    Correlation { correlation: Handle, resource_id: Handle },
    ImplicitResource { original_id: Handle, resource_type: u8 },
    Binary(Vec<u8>),
    ResidencyHint { process: ProcessId, address: Address, resident: bool },
}

impl UserData {
    fn subtype(&self) -> u8 {
        match self {
            UserData::DebugName { .. } => 0,
            UserData::Correlation { .. } => 1,
            UserData::ImplicitResource { .. } => 2,
            UserData::Binary(_) => 3,
            UserData::ResidencyHint { .. } => 4,
        }
    }
}

/// Create parameters keyed by the resource type discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ResourceDescription {
    Image {
        width: u32,
        height: u32,
        depth: u32,
        mip_levels: u16,
        format: u16,
        usage_flags: u32,
        create_flags: u8,
    },
    Buffer {
        size: u64,
        usage_flags: u32,
        create_flags: u8,
    },
    CommandAllocator {
        executable_size: u64,
        embedded_size: u64,
        flags: u8,
    },
    Pipeline {
        hash_hi: u64,
        hash_lo: u64,
        stages: u32,
    },
    Heap {
        size: u64,
        alignment_log2: u8,
        heap_kind: u8,
    },
    DescriptorPool {
        max_sets: u32,
        pool_size_count: u16,
    },
    AccelerationStructure {
        size: u64,
        kind: u8,
    },
    QueryHeap {
        kind: u8,
        count: u32,
    },
    VideoDecoder {
        engine: u8,
        codec: u8,
        width: u32,
        height: u32,
    },
    VideoEncoder {
        engine: u8,
        codec: u8,
        width: u32,
        height: u32,
    },
    MiscInternal {
        kind: u8,
    },
}

impl ResourceDescription {
    pub fn discriminator(&self) -> u8 {
        match self {
            ResourceDescription::Image { .. } => 0,
            ResourceDescription::Buffer { .. } => 1,
            ResourceDescription::CommandAllocator { .. } => 2,
            ResourceDescription::Pipeline { .. } => 3,
            ResourceDescription::Heap { .. } => 4,
            ResourceDescription::DescriptorPool { .. } => 5,
            ResourceDescription::AccelerationStructure { .. } => 6,
            ResourceDescription::QueryHeap { .. } => 7,
            ResourceDescription::VideoDecoder { .. } => 8,
            ResourceDescription::VideoEncoder { .. } => 9,
            ResourceDescription::MiscInternal { .. } => 10,
        }
    }

    pub fn usage(&self) -> ResourceUsage {
        match self {
            ResourceDescription::Image { .. } => ResourceUsage::Image,
            ResourceDescription::Buffer { usage_flags, .. } => {
                if usage_flags & BUFFER_USAGE_ACCELERATION_STRUCTURE != 0 {
                    ResourceUsage::AccelerationStructure
                } else {
                    ResourceUsage::Buffer
                }
            }
            ResourceDescription::CommandAllocator { .. } => ResourceUsage::CommandAllocator,
            ResourceDescription::Pipeline { .. } => ResourceUsage::Pipeline,
            ResourceDescription::Heap { .. } => ResourceUsage::Heap,
            ResourceDescription::DescriptorPool { .. } => ResourceUsage::DescriptorPool,
            ResourceDescription::AccelerationStructure { .. } => {
                ResourceUsage::AccelerationStructure
            }
            ResourceDescription::QueryHeap { .. } => ResourceUsage::QueryHeap,
            ResourceDescription::VideoDecoder { .. } => ResourceUsage::VideoDecoder,
            ResourceDescription::VideoEncoder { .. } => ResourceUsage::VideoEncoder,
            ResourceDescription::MiscInternal { .. } => ResourceUsage::MiscInternal,
        }
    }

    /// Usage implied by a bare type discriminator, as carried by implicit resources.
    pub fn usage_for_discriminator(discriminator: u8) -> ResourceUsage {
        match discriminator {
            0 => ResourceUsage::Image,
            1 => ResourceUsage::Buffer,
            2 => ResourceUsage::CommandAllocator,
            3 => ResourceUsage::Pipeline,
            4 => ResourceUsage::Heap,
            5 => ResourceUsage::DescriptorPool,
            6 => ResourceUsage::AccelerationStructure,
            7 => ResourceUsage::QueryHeap,
            8 => ResourceUsage::VideoDecoder,
            9 => ResourceUsage::VideoEncoder,
            10 => ResourceUsage::MiscInternal,
            _ => ResourceUsage::Unknown,
        }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        match *self {
            ResourceDescription::Image {
                width,
                height,
                depth,
                mip_levels,
                format,
                usage_flags,
                create_flags,
            } => {
                put_u32(out, width);
                put_u32(out, height);
                put_u32(out, depth);
                put_u16(out, mip_levels);
                put_u16(out, format);
                put_u32(out, usage_flags);
                put_u8(out, create_flags);
            }
            ResourceDescription::Buffer {
                size,
                usage_flags,
                create_flags,
            } => {
                put_u64(out, size);
                put_u32(out, usage_flags);
                put_u8(out, create_flags);
            }
            ResourceDescription::CommandAllocator {
                executable_size,
                embedded_size,
                flags,
            } => {
                put_u64(out, executable_size);
                put_u64(out, embedded_size);
                put_u8(out, flags);
            }
            ResourceDescription::Pipeline {
                hash_hi,
                hash_lo,
                stages,
            } => {
                put_u64(out, hash_hi);
                put_u64(out, hash_lo);
                put_u32(out, stages);
            }
            ResourceDescription::Heap {
                size,
                alignment_log2,
                heap_kind,
            } => {
                put_u64(out, size);
                put_u8(out, alignment_log2);
                put_u8(out, heap_kind);
            }
            ResourceDescription::DescriptorPool {
                max_sets,
                pool_size_count,
            } => {
                put_u32(out, max_sets);
                put_u16(out, pool_size_count);
            }
            ResourceDescription::AccelerationStructure { size, kind } => {
                put_u64(out, size);
                put_u8(out, kind);
            }
            ResourceDescription::QueryHeap { kind, count } => {
                put_u8(out, kind);
                put_u32(out, count);
            }
            ResourceDescription::VideoDecoder {
                engine,
                codec,
                width,
                height,
            }
            | ResourceDescription::VideoEncoder {
                engine,
                codec,
                width,
                height,
            } => {
                put_u8(out, engine);
                put_u8(out, codec);
                put_u32(out, width);
                put_u32(out, height);
            }
            ResourceDescription::MiscInternal { kind } => put_u8(out, kind),
        }
    }

    pub(crate) fn decode(discriminator: u8, reader: &mut ByteReader<'_>) -> ReadResult<Self> {
        let description = match discriminator {
            0 => ResourceDescription::Image {
                width: reader.u32()?,
                height: reader.u32()?,
                depth: reader.u32()?,
                mip_levels: reader.u16()?,
                format: reader.u16()?,
                usage_flags: reader.u32()?,
                create_flags: reader.u8()?,
            },
            1 => ResourceDescription::Buffer {
                size: reader.u64()?,
                usage_flags: reader.u32()?,
                create_flags: reader.u8()?,
            },
            2 => ResourceDescription::CommandAllocator {
                executable_size: reader.u64()?,
                embedded_size: reader.u64()?,
                flags: reader.u8()?,
            },
            3 => ResourceDescription::Pipeline {
                hash_hi: reader.u64()?,
                hash_lo: reader.u64()?,
                stages: reader.u32()?,
            },
            4 => ResourceDescription::Heap {
                size: reader.u64()?,
                alignment_log2: reader.u8()?,
                heap_kind: reader.u8()?,
            },
            5 => ResourceDescription::DescriptorPool {
                max_sets: reader.u32()?,
                pool_size_count: reader.u16()?,
            },
            6 => ResourceDescription::AccelerationStructure {
                size: reader.u64()?,
                kind: reader.u8()?,
            },
            7 => ResourceDescription::QueryHeap {
                kind: reader.u8()?,
                count: reader.u32()?,
            },
            8 => ResourceDescription::VideoDecoder {
                engine: reader.u8()?,
                codec: reader.u8()?,
                width: reader.u32()?,
                height: reader.u32()?,
            },
            9 => ResourceDescription::VideoEncoder {
                engine: reader.u8()?,
                codec: reader.u8()?,
                width: reader.u32()?,
                height: reader.u32()?,
            },
            10 => ResourceDescription::MiscInternal {
                kind: reader.u8()?,
            },
            _ => return Err(ReadError::Invalid("unknown resource type")),
        };
        Ok(description)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceCreate {
    pub id: Handle,
    /// Handle user-data tokens use to refer to this resource; zero when absent.
    pub correlation: Handle,
    pub owner: OwnerType,
    pub commit: CommitType,
    pub description: ResourceDescription,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResourceBind {
    pub process: ProcessId,
    pub id: Handle,
    pub virtual_address: Address,
    pub size: u64,
    pub system_memory: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VirtualAllocate {
    pub process: ProcessId,
    pub handle: Handle,
    pub address: Address,
    pub size: u64,
    pub preferred_heaps: [Option<SegmentKind>; HEAP_PREFERENCE_COUNT],
    pub owner: OwnerType,
    pub external: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PhysicalAllocate {
    pub handle: Handle,
    pub address: Address,
    pub size: u64,
}

/// Decoded token payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Token {
    /// Absolute timestamp that resynchronises the stream.
    TimeDelta { base: Timestamp },
    ProcessEvent {
        process: ProcessId,
        event: ProcessEventKind,
        name: String,
    },
    PageTableUpdate(PageTableUpdate),
    UserData(UserData),
    Misc(MiscKind),
    ResourceCreate(ResourceCreate),
    ResourceDestroy { id: Handle },
    ResourceBind(ResourceBind),
    VirtualFree { process: ProcessId, address: Address },
    CpuMap { process: ProcessId, address: Address },
    CpuUnmap { process: ProcessId, address: Address },
    VirtualAllocate(VirtualAllocate),
    PhysicalAllocate(PhysicalAllocate),
    PhysicalFree { address: Address },
    SnapshotMarker { name: String },
}

impl Token {
    pub fn kind(&self) -> TokenKind {
        match self {
            Token::TimeDelta { .. } => TokenKind::TimeDelta,
            Token::ProcessEvent { .. } => TokenKind::ProcessEvent,
            Token::PageTableUpdate(_) => TokenKind::PageTableUpdate,
            Token::UserData(_) => TokenKind::UserData,
            Token::Misc(_) => TokenKind::Misc,
            Token::ResourceCreate(_) => TokenKind::ResourceCreate,
            Token::ResourceDestroy { .. } => TokenKind::ResourceDestroy,
            Token::ResourceBind(_) => TokenKind::ResourceBind,
            Token::VirtualFree { .. } => TokenKind::VirtualFree,
            Token::CpuMap { .. } => TokenKind::CpuMap,
            Token::CpuUnmap { .. } => TokenKind::CpuUnmap,
            Token::VirtualAllocate(_) => TokenKind::VirtualAllocate,
            Token::PhysicalAllocate(_) => TokenKind::PhysicalAllocate,
            Token::PhysicalFree { .. } => TokenKind::PhysicalFree,
            Token::SnapshotMarker { .. } => TokenKind::SnapshotMarker,
        }
    }

    pub fn encode_payload(&self, out: &mut Vec<u8>) {
        match self {
            Token::TimeDelta { base } => put_u64(out, *base),
            Token::ProcessEvent {
                process,
                event,
                name,
            } => {
                put_u32(out, *process);
                put_u8(
                    out,
                    match event {
                        ProcessEventKind::Start => 0,
                        ProcessEventKind::Stop => 1,
                    },
                );
                put_str(out, name);
            }
            Token::PageTableUpdate(update) => {
                put_u32(out, update.process);
                put_u64(out, update.virtual_address);
                put_u64(out, update.physical_address);
                put_u64(out, update.page_count);
                put_u8(out, update.page_size.as_u8());
                let target = match update.target {
                    PageTarget::Physical => 0u8,
                    PageTarget::Invalid => 1,
                    PageTarget::SystemReserved => 2,
                };
                let mut flags = target << PTE_TARGET_SHIFT;
                if update.unmap {
                    flags |= PTE_FLAG_UNMAP;
                }
                put_u8(out, flags);
            }
            Token::UserData(data) => {
                put_u8(out, data.subtype());
                match data {
                    UserData::DebugName { correlation, name } => {
                        put_u64(out, *correlation);
                        put_str(out, name);
                    }
                    UserData::Correlation {
                        correlation,
                        resource_id,
                    } => {
                        put_u64(out, *correlation);
                        put_u64(out, *resource_id);
                    }
                    UserData::ImplicitResource {
                        original_id,
                        resource_type,
                    } => {
                        put_u64(out, *original_id);
                        put_u8(out, *resource_type);
                    }
                    UserData::Binary(bytes) => {
                        let len = bytes.len().min(u16::MAX as usize);
                        put_u16(out, len as u16);
                        out.extend_from_slice(&bytes[..len]);
                    }
                    UserData::ResidencyHint {
                        process,
                        address,
                        resident,
                    } => {
                        put_u32(out, *process);
                        put_u64(out, *address);
                        put_u8(out, u8::from(*resident));
                    }
                }
            }
            Token::Misc(kind) => put_u8(out, kind.as_u8()),
            Token::ResourceCreate(create) => {
                put_u64(out, create.id);
                put_u64(out, create.correlation);
                put_u8(out, create.owner.as_u8());
                put_u8(out, create.commit.as_u8());
                put_u8(out, create.description.discriminator());
                create.description.encode(out);
            }
            Token::ResourceDestroy { id } => put_u64(out, *id),
            Token::ResourceBind(bind) => {
                put_u32(out, bind.process);
                put_u64(out, bind.id);
                put_u64(out, bind.virtual_address);
                put_u64(out, bind.size);
                put_u8(
                    out,
                    if bind.system_memory {
                        BIND_FLAG_SYSTEM_MEMORY
                    } else {
                        0
                    },
                );
            }
            Token::VirtualFree { process, address }
            | Token::CpuMap { process, address }
            | Token::CpuUnmap { process, address } => {
                put_u32(out, *process);
                put_u64(out, *address);
            }
            Token::VirtualAllocate(alloc) => {
                put_u32(out, alloc.process);
                put_u64(out, alloc.handle);
                put_u64(out, alloc.address);
                put_u64(out, alloc.size);
                for heap in alloc.preferred_heaps {
                    put_u8(out, heap.map_or(NO_HEAP, SegmentKind::as_u8));
                }
                put_u8(out, alloc.owner.as_u8());
                put_u8(
                    out,
                    if alloc.external {
                        VALLOC_FLAG_EXTERNAL
                    } else {
                        0
                    },
                );
            }
            Token::PhysicalAllocate(alloc) => {
                put_u64(out, alloc.handle);
                put_u64(out, alloc.address);
                put_u64(out, alloc.size);
            }
            Token::PhysicalFree { address } => put_u64(out, *address),
            Token::SnapshotMarker { name } => put_str(out, name),
        }
    }

    pub(crate) fn decode_payload(kind: TokenKind, reader: &mut ByteReader<'_>) -> ReadResult<Self> {
        let token = match kind {
            TokenKind::TimeDelta => Token::TimeDelta {
                base: reader.u64()?,
            },
            TokenKind::ProcessEvent => {
                let process = reader.u32()?;
                let event = match reader.u8()? {
                    0 => ProcessEventKind::Start,
                    1 => ProcessEventKind::Stop,
                    _ => return Err(ReadError::Invalid("unknown process event")),
                };
                Token::ProcessEvent {
                    process,
                    event,
                    name: reader.string()?,
                }
            }
            TokenKind::PageTableUpdate => {
                let process = reader.u32()?;
                let virtual_address = reader.u64()?;
                let physical_address = reader.u64()?;
                let page_count = reader.u64()?;
                let page_size = PageSize::from_u8(reader.u8()?)
                    .ok_or(ReadError::Invalid("unknown page size"))?;
                let flags = reader.u8()?;
                let target = match (flags & PTE_TARGET_MASK) >> PTE_TARGET_SHIFT {
                    0 => PageTarget::Physical,
                    1 => PageTarget::Invalid,
                    2 => PageTarget::SystemReserved,
                    _ => return Err(ReadError::Invalid("unknown page table target")),
                };
                Token::PageTableUpdate(PageTableUpdate {
                    process,
                    virtual_address,
                    physical_address,
                    page_count,
                    page_size,
                    unmap: flags & PTE_FLAG_UNMAP != 0,
                    target,
                })
            }
            TokenKind::UserData => {
                let data = match reader.u8()? {
                    0 => UserData::DebugName {
                        correlation: reader.u64()?,
                        name: reader.string()?,
                    },
                    1 => UserData::Correlation {
                        correlation: reader.u64()?,
                        resource_id: reader.u64()?,
                    },
                    2 => UserData::ImplicitResource {
                        original_id: reader.u64()?,
                        resource_type: reader.u8()?,
                    },
                    3 => {
                        let len = reader.u16()? as usize;
                        UserData::Binary(reader.take(len)?.to_vec())
                    }
                    4 => UserData::ResidencyHint {
                        process: reader.u32()?,
                        address: reader.u64()?,
                        resident: reader.bool()?,
                    },
                    _ => return Err(ReadError::Invalid("unknown user data subtype")),
                };
                Token::UserData(data)
            }
            TokenKind::Misc => Token::Misc(
                MiscKind::from_u8(reader.u8()?).ok_or(ReadError::Invalid("unknown misc kind"))?,
            ),
            TokenKind::ResourceCreate => {
                let id = reader.u64()?;
                let correlation = reader.u64()?;
                let owner = OwnerType::from_u8(reader.u8()?)
                    .ok_or(ReadError::Invalid("unknown owner type"))?;
                let commit = CommitType::from_u8(reader.u8()?)
                    .ok_or(ReadError::Invalid("unknown commit type"))?;
                let discriminator = reader.u8()?;
                let description = ResourceDescription::decode(discriminator, reader)?;
                Token::ResourceCreate(ResourceCreate {
                    id,
                    correlation,
                    owner,
                    commit,
                    description,
                })
            }
            TokenKind::ResourceDestroy => Token::ResourceDestroy { id: reader.u64()? },
            TokenKind::ResourceBind => Token::ResourceBind(ResourceBind {
                process: reader.u32()?,
                id: reader.u64()?,
                virtual_address: reader.u64()?,
                size: reader.u64()?,
                system_memory: reader.u8()? & BIND_FLAG_SYSTEM_MEMORY != 0,
            }),
            TokenKind::VirtualFree => Token::VirtualFree {
                process: reader.u32()?,
                address: reader.u64()?,
            },
            TokenKind::CpuMap => Token::CpuMap {
                process: reader.u32()?,
                address: reader.u64()?,
            },
            TokenKind::CpuUnmap => Token::CpuUnmap {
                process: reader.u32()?,
                address: reader.u64()?,
            },
            TokenKind::VirtualAllocate => {
                let process = reader.u32()?;
                let handle = reader.u64()?;
                let address = reader.u64()?;
                let size = reader.u64()?;
                let mut preferred_heaps = [None; HEAP_PREFERENCE_COUNT];
                for slot in preferred_heaps.iter_mut() {
                    let raw = reader.u8()?;
                    if raw != NO_HEAP {
                        *slot = Some(
                            SegmentKind::from_u8(raw)
                                .ok_or(ReadError::Invalid("unknown heap preference"))?,
                        );
                    }
                }
                let owner = OwnerType::from_u8(reader.u8()?)
                    .ok_or(ReadError::Invalid("unknown owner type"))?;
                let external = reader.u8()? & VALLOC_FLAG_EXTERNAL != 0;
                Token::VirtualAllocate(VirtualAllocate {
                    process,
                    handle,
                    address,
                    size,
                    preferred_heaps,
                    owner,
                    external,
                })
            }
            TokenKind::PhysicalAllocate => Token::PhysicalAllocate(PhysicalAllocate {
                handle: reader.u64()?,
                address: reader.u64()?,
                size: reader.u64()?,
            }),
            TokenKind::PhysicalFree => Token::PhysicalFree {
                address: reader.u64()?,
            },
            TokenKind::SnapshotMarker => Token::SnapshotMarker {
                name: reader.string()?,
            },
        };
        Ok(token)
    }
}

/// A token placed in global order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MemoryEvent {
    pub timestamp: Timestamp,
    pub thread: u8,
    pub stream: usize,
    /// Byte offset of the token within its stream.
    pub offset: usize,
    pub token: Token,
}

impl MemoryEvent {
    /// Total order key: timestamp, thread id, then stream index.
    pub fn order_key(&self) -> (Timestamp, u8, usize) {
        (self.timestamp, self.thread, self.stream)
    }
}

#[inline]
pub fn zigzag_encode(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

#[inline]
pub fn zigzag_decode(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

pub fn put_varint(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

pub(crate) fn read_varint(reader: &mut ByteReader<'_>) -> ReadResult<u64> {
    let mut value = 0u64;
    for index in 0..MAX_VARINT_LEN {
        let byte = reader.u8()?;
        let bits = (byte & 0x7f) as u64;
        if index == MAX_VARINT_LEN - 1 && bits > 1 {
            return Err(ReadError::Invalid("varint overflow"));
        }
        value |= bits << (7 * index);
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ReadError::Invalid("varint too long"))
}

pub fn encode_header(out: &mut Vec<u8>, kind: TokenKind, thread: u8, delta: i64) {
    out.push(kind as u8 & KIND_MASK);
    out.push(thread);
    put_varint(out, zigzag_encode(delta));
}

/// Header fields of one token.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenHeader {
    pub kind: TokenKind,
    pub thread: u8,
    pub delta: i64,
}

pub(crate) fn decode_header(reader: &mut ByteReader<'_>) -> ReadResult<TokenHeader> {
    let first = reader.u8()?;
    if first & !KIND_MASK != 0 {
        return Err(ReadError::Invalid("reserved header bits set"));
    }
    let kind = TokenKind::from_u8(first).ok_or(ReadError::Invalid("unknown token kind"))?;
    let thread = reader.u8()?;
    let delta = zigzag_decode(read_varint(reader)?);
    Ok(TokenHeader {
        kind,
        thread,
        delta,
    })
}

/// Encodes tokens for one stream, tracking the running timestamp.
#[derive(Debug, Clone, Default)]
pub struct TokenWriter {
    thread: u8,
    last: Timestamp,
    bytes: Vec<u8>,
    count: u64,
}

impl TokenWriter {
    pub fn new(thread: u8) -> Self {
        Self {
            thread,
            ..Self::default()
        }
    }

    pub fn thread(&self) -> u8 {
        self.thread
    }

    /// Appends `token` at `timestamp`. Earlier timestamps encode a negative delta,
    /// which a decoder reports as a regression.
    pub fn push(&mut self, timestamp: Timestamp, token: &Token) -> &mut Self {
        let delta = timestamp.wrapping_sub(self.last) as i64;
        encode_header(&mut self.bytes, token.kind(), self.thread, delta);
        token.encode_payload(&mut self.bytes);
        self.last = match token {
            Token::TimeDelta { base } => *base,
            _ => timestamp,
        };
        self.count += 1;
        self
    }

    /// Appends raw bytes verbatim.
    pub fn push_raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn token_count(&self) -> u64 {
        self.count
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(bytes: &[u8]) -> ReadResult<(TokenHeader, Token)> {
        let mut reader = ByteReader::new(bytes);
        let header = decode_header(&mut reader)?;
        let token = Token::decode_payload(header.kind, &mut reader)?;
        assert_eq!(reader.remaining(), 0);
        Ok((header, token))
    }

    #[test]
    fn zigzag_maps_small_magnitudes_to_small_codes() {
        assert_eq!(zigzag_encode(0), 0);
        assert_eq!(zigzag_encode(-1), 1);
        assert_eq!(zigzag_encode(1), 2);
        assert_eq!(zigzag_decode(zigzag_encode(i64::MIN)), i64::MIN);
        assert_eq!(zigzag_decode(zigzag_encode(i64::MAX)), i64::MAX);
    }

    #[test]
    fn varint_rejects_eleventh_byte() {
        let bytes = [0xff; 11];
        let mut reader = ByteReader::new(&bytes);
        assert!(matches!(read_varint(&mut reader), Err(ReadError::Invalid(_))));
    }

    #[test]
    fn varint_max_value_fits_ten_bytes() {
        let mut out = Vec::new();
        put_varint(&mut out, u64::MAX);
        assert_eq!(out.len(), MAX_VARINT_LEN);
        let mut reader = ByteReader::new(&out);
        assert_eq!(read_varint(&mut reader), Ok(u64::MAX));
    }

    #[test]
    fn reserved_kind_bits_rejected() {
        let bytes = [0x20 | TokenKind::Misc as u8, 0, 0, 0];
        assert_eq!(
            decode_one(&bytes),
            Err(ReadError::Invalid("reserved header bits set"))
        );
    }

    #[test]
    fn unknown_kind_rejected() {
        assert_eq!(
            decode_one(&[15, 0, 0]),
            Err(ReadError::Invalid("unknown token kind"))
        );
    }

    #[test]
    fn page_table_update_carries_target_and_unmap() {
        let token = Token::PageTableUpdate(PageTableUpdate {
            process: 7,
            virtual_address: 0x10000,
            physical_address: 0,
            page_count: 2,
            page_size: PageSize::Size64K,
            unmap: false,
            target: PageTarget::SystemReserved,
        });
        let mut writer = TokenWriter::new(3);
        writer.push(40, &token);
        let (header, decoded) = decode_one(writer.as_bytes()).unwrap();
        assert_eq!(header.thread, 3);
        assert_eq!(header.delta, 40);
        assert_eq!(decoded, token);
        if let Token::PageTableUpdate(update) = decoded {
            assert_eq!(update.small_pages(), 32);
        }
    }

    #[test]
    fn buffer_with_acceleration_bit_is_acceleration_structure() {
        let description = ResourceDescription::Buffer {
            size: 4096,
            usage_flags: BUFFER_USAGE_ACCELERATION_STRUCTURE | 0x1,
            create_flags: 0,
        };
        assert_eq!(description.usage(), ResourceUsage::AccelerationStructure);
        assert_eq!(description.discriminator(), 1);
    }

    #[test]
    fn truncated_payload_is_short() {
        let mut writer = TokenWriter::new(0);
        writer.push(
            5,
            &Token::PhysicalAllocate(PhysicalAllocate {
                handle: 1,
                address: 0x8000_0000,
                size: 4096,
            }),
        );
        let bytes = writer.as_bytes();
        let mut reader = ByteReader::new(&bytes[..bytes.len() - 3]);
        let header = decode_header(&mut reader).unwrap();
        assert_eq!(
            Token::decode_payload(header.kind, &mut reader),
            Err(ReadError::Short)
        );
    }

    #[test]
    fn earlier_timestamp_encodes_negative_delta() {
        let mut writer = TokenWriter::new(0);
        writer.push(100, &Token::Misc(MiscKind::Present));
        let start = writer.len();
        writer.push(90, &Token::Misc(MiscKind::Present));
        let (header, _) = decode_one(&writer.as_bytes()[start..]).unwrap();
        assert_eq!(header.delta, -10);
    }
}
