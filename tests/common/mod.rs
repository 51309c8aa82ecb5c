#![allow(dead_code)]

use rmtrace::format::token::{
    PageTableUpdate, PageTarget, ProcessEventKind, ResourceBind, ResourceCreate,
    ResourceDescription, VirtualAllocate,
};
use rmtrace::format::{SegmentInfo, SegmentTable, Token, TokenWriter, TraceBuilder, TraceFile};
use rmtrace::types::{CommitType, OwnerType, PageSize, SegmentKind, PAGE_SIZE};
use rmtrace::{BuildConfig, CancelToken, DataSet, NoProgress};

pub const PID: u32 = 1;
/// Physical base of the local segment.
pub const LOCAL_BASE: u64 = 0;
pub const HOST_BASE: u64 = 0x1_0000_0000;

pub fn segments() -> SegmentTable {
    SegmentTable::new(vec![
        SegmentInfo {
            base_address: LOCAL_BASE,
            size: 0x1_0000_0000,
            kind: SegmentKind::Local,
            memory_index: 0,
        },
        SegmentInfo {
            base_address: HOST_BASE,
            size: 0x4000_0000,
            kind: SegmentKind::HostVisible,
            memory_index: 1,
        },
    ])
    .expect("segment table")
}

pub fn start(name: &str) -> Token {
    Token::ProcessEvent {
        process: PID,
        event: ProcessEventKind::Start,
        name: name.to_string(),
    }
}

pub fn valloc(handle: u64, address: u64, pages: u64) -> Token {
    Token::VirtualAllocate(VirtualAllocate {
        process: PID,
        handle,
        address,
        size: pages * PAGE_SIZE,
        preferred_heaps: [Some(SegmentKind::Local), None, None, None],
        owner: OwnerType::Application,
        external: false,
    })
}

pub fn vfree(address: u64) -> Token {
    Token::VirtualFree {
        process: PID,
        address,
    }
}

fn page_update(virtual_address: u64, physical_address: u64, pages: u64, unmap: bool) -> Token {
    Token::PageTableUpdate(PageTableUpdate {
        process: PID,
        virtual_address,
        physical_address,
        page_count: pages,
        page_size: PageSize::Size4K,
        unmap,
        target: PageTarget::Physical,
    })
}

pub fn map(virtual_address: u64, physical_address: u64, pages: u64) -> Token {
    page_update(virtual_address, physical_address, pages, false)
}

pub fn unmap(virtual_address: u64, pages: u64) -> Token {
    page_update(virtual_address, 0, pages, true)
}

pub fn buffer(id: u64, size: u64) -> Token {
    Token::ResourceCreate(ResourceCreate {
        id,
        correlation: 0,
        owner: OwnerType::Application,
        commit: CommitType::Placed,
        description: ResourceDescription::Buffer {
            size,
            usage_flags: 0,
            create_flags: 0,
        },
    })
}

pub fn bind(id: u64, virtual_address: u64, size: u64) -> Token {
    Token::ResourceBind(ResourceBind {
        process: PID,
        id,
        virtual_address,
        size,
        system_memory: false,
    })
}

/// One stream on thread 0 holding `events` in order.
pub fn stream(events: &[(u64, Token)]) -> TokenWriter {
    let mut writer = TokenWriter::new(0);
    for (timestamp, token) in events {
        writer.push(*timestamp, token);
    }
    writer
}

pub fn legacy_trace(events: &[(u64, Token)]) -> TraceBuilder {
    TraceBuilder::legacy()
        .segments(segments())
        .stream(stream(events))
}

pub fn open(builder: &TraceBuilder, config: BuildConfig) -> DataSet {
    let trace = TraceFile::from_bytes(builder.build()).expect("parse trace");
    DataSet::from_trace(trace, config).expect("data set")
}

pub fn build(builder: &TraceBuilder) -> DataSet {
    let mut dataset = open(builder, BuildConfig::default());
    dataset
        .build(&mut NoProgress, &CancelToken::new())
        .expect("build");
    dataset
}

/// Resources A and B whose physical footprints overlap by half a page.
pub fn aliasing_events(offset: u64) -> Vec<(u64, Token)> {
    vec![
        (offset, start("alias")),
        (offset + 10, valloc(1, 0x1000, 4)),
        (offset + 20, buffer(0xA, PAGE_SIZE)),
        (offset + 21, buffer(0xB, PAGE_SIZE)),
        (offset + 30, bind(0xA, 0x1000, PAGE_SIZE)),
        (offset + 31, bind(0xB, 0x3000, PAGE_SIZE)),
        (offset + 40, map(0x1000, 0x8000, 1)),
        (offset + 41, map(0x3000, 0x8800, 1)),
    ]
}
