//! Canonical, self-contained form of a snapshot.
//!
//! Every entity list is sorted by its natural key and refers to other records
//! by handle or identifier rather than by index, so two images of the same
//! state compare equal regardless of how the state was built. The writers
//! store one section per entity list; the digest hashes the same encoding.

use serde::{Deserialize, Serialize};

use crate::format::{
    put_str, put_u32, put_u64, put_u8, ByteReader, ReadError, ReadResult, SegmentTable,
};
use crate::state::{LiveState, MappedTarget};
use crate::types::{
    Address, CommitType, Handle, OwnerType, ProcessId, Residency, ResourceUsage, SegmentId,
    SegmentKind, Timestamp, HEAP_PREFERENCE_COUNT,
};
use crate::{Error, Result};

/// Schema version of every section encoding below.
pub const IMAGE_SCHEMA_VERSION: u32 = 1;

const NO_HEAP: u8 = u8::MAX;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageProcess {
    pub id: ProcessId,
    pub name: Option<String>,
    pub committed_bytes: u64,
    pub virtual_allocations: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageVirtualAllocation {
    pub handle: Handle,
    pub process: ProcessId,
    pub base: Address,
    pub size_pages: u64,
    pub preferred_heaps: [Option<SegmentKind>; HEAP_PREFERENCE_COUNT],
    pub owner: OwnerType,
    pub created: Timestamp,
    pub residency: Residency,
    pub external: bool,
    pub cpu_map_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePhysicalAllocation {
    pub handle: Handle,
    pub base: Address,
    pub size_pages: u64,
    pub segment: SegmentId,
    pub created: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageResource {
    pub id: Handle,
    pub process: ProcessId,
    /// Handle of the owning virtual allocation when bound.
    pub allocation: Option<Handle>,
    pub virtual_address: Address,
    pub size: u64,
    pub usage: ResourceUsage,
    pub owner: OwnerType,
    pub commit: CommitType,
    pub created: Timestamp,
    pub bound_at: Option<Timestamp>,
    pub name: Option<String>,
    pub implicit: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImagePageRun {
    pub process: ProcessId,
    pub virtual_page: u64,
    pub length: u64,
    pub target: MappedTarget,
    pub segment: SegmentId,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageSection {
    Metadata,
    Processes,
    Segments,
    VirtualAllocations,
    PhysicalAllocations,
    Resources,
    PageRuns,
}

impl ImageSection {
    pub const ALL: [ImageSection; 7] = [
        ImageSection::Metadata,
        ImageSection::Processes,
        ImageSection::Segments,
        ImageSection::VirtualAllocations,
        ImageSection::PhysicalAllocations,
        ImageSection::Resources,
        ImageSection::PageRuns,
    ];

    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Self::ALL.get(value as usize).copied()
    }

    pub fn name(self) -> &'static str {
        match self {
            ImageSection::Metadata => "metadata",
            ImageSection::Processes => "processes",
            ImageSection::Segments => "segments",
            ImageSection::VirtualAllocations => "virtual allocations",
            ImageSection::PhysicalAllocations => "physical allocations",
            ImageSection::Resources => "resources",
            ImageSection::PageRuns => "page runs",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotImage {
    pub name: String,
    pub timestamp: Timestamp,
    pub segments: SegmentTable,
    pub processes: Vec<ImageProcess>,
    pub virtual_allocations: Vec<ImageVirtualAllocation>,
    pub physical_allocations: Vec<ImagePhysicalAllocation>,
    pub resources: Vec<ImageResource>,
    pub page_runs: Vec<ImagePageRun>,
}

impl SnapshotImage {
    /// Projects the live records of `state`, frozen at `timestamp`.
    pub fn capture(
        name: &str,
        timestamp: Timestamp,
        state: &LiveState,
        segments: &SegmentTable,
    ) -> Self {
        let mut processes: Vec<ImageProcess> = state
            .processes
            .iter()
            .map(|process| ImageProcess {
                id: process.id,
                name: process.name.as_deref().map(str::to_owned),
                committed_bytes: process.committed_bytes,
                virtual_allocations: process.virtual_allocations,
            })
            .collect();
        processes.sort_by_key(|process| process.id);

        let mut virtual_allocations: Vec<ImageVirtualAllocation> = state
            .virtual_allocs
            .live()
            .map(|(_, a)| ImageVirtualAllocation {
                handle: a.handle,
                process: a.process,
                base: a.base,
                size_pages: a.size_pages,
                preferred_heaps: a.preferred_heaps,
                owner: a.owner,
                created: a.created,
                residency: a.residency,
                external: a.external,
                cpu_map_count: a.cpu_map_count,
            })
            .collect();
        virtual_allocations.sort_by_key(|a| (a.process, a.base));

        let mut physical_allocations: Vec<ImagePhysicalAllocation> = state
            .physical_allocs
            .live()
            .map(|(_, a)| ImagePhysicalAllocation {
                handle: a.handle,
                base: a.base,
                size_pages: a.size_pages,
                segment: a.segment,
                created: a.created,
            })
            .collect();
        physical_allocations.sort_by_key(|a| (a.segment, a.base));

        let mut resources: Vec<ImageResource> = state
            .resources
            .live()
            .map(|(_, r)| ImageResource {
                id: r.id,
                process: r.process,
                allocation: r
                    .allocation
                    .and_then(|idx| state.virtual_allocs.get(idx))
                    .map(|a| a.handle),
                virtual_address: r.virtual_address,
                size: r.size,
                usage: r.usage,
                owner: r.owner,
                commit: r.commit,
                created: r.created,
                bound_at: r.bound_at,
                name: r.name().map(str::to_owned),
                implicit: r.implicit,
            })
            .collect();
        resources.sort_by_key(|r| r.id);

        let page_runs = state
            .page_table
            .processes()
            .flat_map(|process| {
                state.page_table.runs(process).map(move |run| ImagePageRun {
                    process,
                    virtual_page: run.virtual_page,
                    length: run.length,
                    target: run.target,
                    segment: run.segment,
                    updated_at: run.updated_at,
                })
            })
            .collect();

        Self {
            name: name.to_owned(),
            timestamp,
            segments: segments.clone(),
            processes,
            virtual_allocations,
            physical_allocations,
            resources,
            page_runs,
        }
    }

    pub fn encode_section(&self, section: ImageSection) -> Vec<u8> {
        let mut out = Vec::new();
        match section {
            ImageSection::Metadata => {
                put_u64(&mut out, self.timestamp);
                put_str(&mut out, &self.name);
            }
            ImageSection::Segments => out = self.segments.encode(),
            ImageSection::Processes => put_list(&mut out, &self.processes),
            ImageSection::VirtualAllocations => put_list(&mut out, &self.virtual_allocations),
            ImageSection::PhysicalAllocations => put_list(&mut out, &self.physical_allocations),
            ImageSection::Resources => put_list(&mut out, &self.resources),
            ImageSection::PageRuns => put_list(&mut out, &self.page_runs),
        }
        out
    }

    /// Replaces one section with its decoded payload.
    pub fn decode_section(&mut self, section: ImageSection, bytes: &[u8]) -> Result<()> {
        let what = section.name();
        match section {
            ImageSection::Metadata => {
                let mut reader = ByteReader::new(bytes);
                self.timestamp = finish(what, reader.u64())?;
                self.name = finish(what, reader.string())?;
            }
            ImageSection::Segments => self.segments = SegmentTable::decode(bytes)?,
            ImageSection::Processes => self.processes = read_list(what, bytes)?,
            ImageSection::VirtualAllocations => self.virtual_allocations = read_list(what, bytes)?,
            ImageSection::PhysicalAllocations => {
                self.physical_allocations = read_list(what, bytes)?
            }
            ImageSection::Resources => self.resources = read_list(what, bytes)?,
            ImageSection::PageRuns => self.page_runs = read_list(what, bytes)?,
        }
        Ok(())
    }

    /// blake3 over every section in canonical order.
    pub fn digest(&self) -> [u8; 32] {
        let mut hasher = blake3::Hasher::new();
        for section in ImageSection::ALL {
            let bytes = self.encode_section(section);
            hasher.update(&section.as_u32().to_le_bytes());
            hasher.update(&(bytes.len() as u64).to_le_bytes());
            hasher.update(&bytes);
        }
        *hasher.finalize().as_bytes()
    }
}

fn finish<T>(what: &str, result: ReadResult<T>) -> Result<T> {
    result.map_err(|err| err.into_malformed(what))
}

trait Record: Sized {
    fn put(&self, out: &mut Vec<u8>);
    fn read(reader: &mut ByteReader<'_>) -> ReadResult<Self>;
}

fn put_list<T: Record>(out: &mut Vec<u8>, items: &[T]) {
    put_u32(out, items.len() as u32);
    for item in items {
        item.put(out);
    }
}

fn read_list<T: Record>(what: &str, bytes: &[u8]) -> Result<Vec<T>> {
    let mut reader = ByteReader::new(bytes);
    let count = finish(what, reader.u32())? as usize;
    let mut items = Vec::new();
    items.try_reserve(count.min(reader.remaining()))?;
    for _ in 0..count {
        items.push(finish(what, T::read(&mut reader))?);
    }
    if reader.remaining() != 0 {
        return Err(Error::malformed(format!("{what}: trailing bytes")));
    }
    Ok(items)
}

fn put_opt_u64(out: &mut Vec<u8>, value: Option<u64>) {
    match value {
        Some(value) => {
            put_u8(out, 1);
            put_u64(out, value);
        }
        None => put_u8(out, 0),
    }
}

fn read_opt_u64(reader: &mut ByteReader<'_>) -> ReadResult<Option<u64>> {
    Ok(if reader.bool()? {
        Some(reader.u64()?)
    } else {
        None
    })
}

fn put_opt_str(out: &mut Vec<u8>, value: Option<&str>) {
    match value {
        Some(value) => {
            put_u8(out, 1);
            put_str(out, value);
        }
        None => put_u8(out, 0),
    }
}

fn read_opt_str(reader: &mut ByteReader<'_>) -> ReadResult<Option<String>> {
    Ok(if reader.bool()? {
        Some(reader.string()?)
    } else {
        None
    })
}

fn owner(value: u8) -> ReadResult<OwnerType> {
    OwnerType::from_u8(value).ok_or(ReadError::Invalid("unknown owner type"))
}

fn residency_to_u8(residency: Residency) -> u8 {
    match residency {
        Residency::Resident => 0,
        Residency::Evicted => 1,
    }
}

impl Record for ImageProcess {
    fn put(&self, out: &mut Vec<u8>) {
        put_u32(out, self.id);
        put_opt_str(out, self.name.as_deref());
        put_u64(out, self.committed_bytes);
        put_u64(out, self.virtual_allocations);
    }

    fn read(reader: &mut ByteReader<'_>) -> ReadResult<Self> {
        Ok(Self {
            id: reader.u32()?,
            name: read_opt_str(reader)?,
            committed_bytes: reader.u64()?,
            virtual_allocations: reader.u64()?,
        })
    }
}

impl Record for ImageVirtualAllocation {
    fn put(&self, out: &mut Vec<u8>) {
        put_u64(out, self.handle);
        put_u32(out, self.process);
        put_u64(out, self.base);
        put_u64(out, self.size_pages);
        for heap in self.preferred_heaps {
            put_u8(out, heap.map_or(NO_HEAP, SegmentKind::as_u8));
        }
        put_u8(out, self.owner.as_u8());
        put_u64(out, self.created);
        put_u8(out, residency_to_u8(self.residency));
        put_u8(out, self.external as u8);
        put_u32(out, self.cpu_map_count);
    }

    fn read(reader: &mut ByteReader<'_>) -> ReadResult<Self> {
        let handle = reader.u64()?;
        let process = reader.u32()?;
        let base = reader.u64()?;
        let size_pages = reader.u64()?;
        let mut preferred_heaps = [None; HEAP_PREFERENCE_COUNT];
        for heap in &mut preferred_heaps {
            *heap = match reader.u8()? {
                NO_HEAP => None,
                raw => Some(
                    SegmentKind::from_u8(raw).ok_or(ReadError::Invalid("unknown heap kind"))?,
                ),
            };
        }
        Ok(Self {
            handle,
            process,
            base,
            size_pages,
            preferred_heaps,
            owner: owner(reader.u8()?)?,
            created: reader.u64()?,
            residency: match reader.u8()? {
                0 => Residency::Resident,
                1 => Residency::Evicted,
                _ => return Err(ReadError::Invalid("unknown residency")),
            },
            external: reader.bool()?,
            cpu_map_count: reader.u32()?,
        })
    }
}

impl Record for ImagePhysicalAllocation {
    fn put(&self, out: &mut Vec<u8>) {
        put_u64(out, self.handle);
        put_u64(out, self.base);
        put_u64(out, self.size_pages);
        put_u8(out, self.segment.0);
        put_u64(out, self.created);
    }

    fn read(reader: &mut ByteReader<'_>) -> ReadResult<Self> {
        Ok(Self {
            handle: reader.u64()?,
            base: reader.u64()?,
            size_pages: reader.u64()?,
            segment: SegmentId(reader.u8()?),
            created: reader.u64()?,
        })
    }
}

impl Record for ImageResource {
    fn put(&self, out: &mut Vec<u8>) {
        put_u64(out, self.id);
        put_u32(out, self.process);
        put_opt_u64(out, self.allocation);
        put_u64(out, self.virtual_address);
        put_u64(out, self.size);
        put_u8(out, self.usage.index() as u8);
        put_u8(out, self.owner.as_u8());
        put_u8(out, self.commit.as_u8());
        put_u64(out, self.created);
        put_opt_u64(out, self.bound_at);
        put_opt_str(out, self.name.as_deref());
        put_u8(out, self.implicit as u8);
    }

    fn read(reader: &mut ByteReader<'_>) -> ReadResult<Self> {
        Ok(Self {
            id: reader.u64()?,
            process: reader.u32()?,
            allocation: read_opt_u64(reader)?,
            virtual_address: reader.u64()?,
            size: reader.u64()?,
            usage: ResourceUsage::from_u8(reader.u8()?)
                .ok_or(ReadError::Invalid("unknown resource usage"))?,
            owner: owner(reader.u8()?)?,
            commit: CommitType::from_u8(reader.u8()?)
                .ok_or(ReadError::Invalid("unknown commit type"))?,
            created: reader.u64()?,
            bound_at: read_opt_u64(reader)?,
            name: read_opt_str(reader)?,
            implicit: reader.bool()?,
        })
    }
}

impl Record for ImagePageRun {
    fn put(&self, out: &mut Vec<u8>) {
        put_u32(out, self.process);
        put_u64(out, self.virtual_page);
        put_u64(out, self.length);
        match self.target {
            MappedTarget::Physical(address) => {
                put_u8(out, 0);
                put_u64(out, address);
            }
            MappedTarget::Host => put_u8(out, 1),
            MappedTarget::Invalid => put_u8(out, 2),
            MappedTarget::SystemReserved => put_u8(out, 3),
        }
        put_u8(out, self.segment.0);
        put_u64(out, self.updated_at);
    }

    fn read(reader: &mut ByteReader<'_>) -> ReadResult<Self> {
        let process = reader.u32()?;
        let virtual_page = reader.u64()?;
        let length = reader.u64()?;
        let target = match reader.u8()? {
            0 => MappedTarget::Physical(reader.u64()?),
            1 => MappedTarget::Host,
            2 => MappedTarget::Invalid,
            3 => MappedTarget::SystemReserved,
            _ => return Err(ReadError::Invalid("unknown page target")),
        };
        Ok(Self {
            process,
            virtual_page,
            length,
            target,
            segment: SegmentId(reader.u8()?),
            updated_at: reader.u64()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SegmentInfo;

    fn image() -> SnapshotImage {
        SnapshotImage {
            name: "frame 12".into(),
            timestamp: 900,
            segments: SegmentTable::new(vec![SegmentInfo {
                base_address: 0x8000_0000,
                size: 0x1000_0000,
                kind: SegmentKind::Local,
                memory_index: 0,
            }])
            .unwrap(),
            processes: vec![ImageProcess {
                id: 4,
                name: Some("game.exe".into()),
                committed_bytes: 0x4000,
                virtual_allocations: 1,
            }],
            virtual_allocations: vec![ImageVirtualAllocation {
                handle: 1,
                process: 4,
                base: 0x10000,
                size_pages: 4,
                preferred_heaps: [Some(SegmentKind::Local), None, None, None],
                owner: OwnerType::Application,
                created: 10,
                residency: Residency::Evicted,
                external: false,
                cpu_map_count: 2,
            }],
            physical_allocations: Vec::new(),
            resources: vec![ImageResource {
                id: 7,
                process: 4,
                allocation: Some(1),
                virtual_address: 0x10000,
                size: 0x4000,
                usage: ResourceUsage::Buffer,
                owner: OwnerType::Application,
                commit: CommitType::Placed,
                created: 20,
                bound_at: Some(30),
                name: None,
                implicit: false,
            }],
            page_runs: vec![ImagePageRun {
                process: 4,
                virtual_page: 0x10,
                length: 4,
                target: MappedTarget::Host,
                segment: SegmentId(0),
                updated_at: 40,
            }],
        }
    }

    #[test]
    fn sections_rebuild_the_image() {
        let original = image();
        let mut rebuilt = SnapshotImage::default();
        for section in ImageSection::ALL {
            rebuilt
                .decode_section(section, &original.encode_section(section))
                .unwrap();
        }
        assert_eq!(rebuilt, original);
        assert_eq!(rebuilt.digest(), original.digest());
    }

    #[test]
    fn digest_tracks_content() {
        let a = image();
        let mut b = image();
        b.resources[0].bound_at = Some(31);
        assert_ne!(a.digest(), b.digest());
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut bytes = image().encode_section(ImageSection::Resources);
        bytes.push(0);
        let mut target = SnapshotImage::default();
        assert!(matches!(
            target.decode_section(ImageSection::Resources, &bytes),
            Err(Error::MalformedTrace(_))
        ));
    }
}
