use criterion::{black_box, BenchmarkId, Criterion, Throughput};
use criterion::{criterion_group, criterion_main};

use rmtrace::cancel::CancelToken;
use rmtrace::format::token::{PageTableUpdate, PageTarget, VirtualAllocate};
use rmtrace::format::{SegmentInfo, SegmentTable, Token, TokenWriter, TraceBuilder, TraceFile};
use rmtrace::parser::open_heap;
use rmtrace::types::{OwnerType, PageSize, SegmentKind, PAGE_SIZE};
use rmtrace::{BuildConfig, DataSet, NoProgress};

const EVENTS_PER_STREAM: u64 = 20_000;

fn trace_bytes(streams: u8) -> Vec<u8> {
    let segments = SegmentTable::new(vec![SegmentInfo {
        base_address: 0,
        size: 1 << 40,
        kind: SegmentKind::Local,
        memory_index: 0,
    }])
    .expect("segments");
    let mut builder = TraceBuilder::container().segments(segments);
    for thread in 0..streams {
        let process = u32::from(thread) + 1;
        let mut writer = TokenWriter::new(thread);
        for i in 0..EVENTS_PER_STREAM / 2 {
            let address = 0x1_0000_0000 + i * 0x10000;
            writer.push(
                i * 32 + u64::from(thread),
                &Token::VirtualAllocate(VirtualAllocate {
                    process,
                    handle: (u64::from(thread) << 32) | i,
                    address,
                    size: 4 * PAGE_SIZE,
                    preferred_heaps: [Some(SegmentKind::Local), None, None, None],
                    owner: OwnerType::Application,
                    external: false,
                }),
            );
            writer.push(
                i * 32 + 16 + u64::from(thread),
                &Token::PageTableUpdate(PageTableUpdate {
                    process,
                    virtual_address: address,
                    physical_address: 0x1000_0000 + i * 4 * PAGE_SIZE,
                    page_count: 4,
                    page_size: PageSize::Size4K,
                    unmap: false,
                    target: PageTarget::Physical,
                }),
            );
        }
        builder = builder.stream(writer);
    }
    builder.build()
}

fn bench_merge(c: &mut Criterion) {
    let mut group = c.benchmark_group("merge");
    for &streams in &[1_u8, 4, 16] {
        let trace = TraceFile::from_bytes(trace_bytes(streams)).expect("trace");
        group.throughput(Throughput::Bytes(trace.total_stream_bytes()));
        group.bench_with_input(BenchmarkId::from_parameter(streams), &trace, |b, trace| {
            b.iter(|| {
                let mut heap = open_heap(trace, CancelToken::new()).expect("heap");
                let mut count = 0u64;
                while let Some(event) = heap.next().expect("next") {
                    black_box(&event);
                    count += 1;
                }
                count
            });
        });
    }
    group.finish();
}

fn bench_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("build");
    group.sample_size(20);
    for &streams in &[1_u8, 4] {
        let bytes = trace_bytes(streams);
        group.throughput(Throughput::Elements(EVENTS_PER_STREAM * u64::from(streams)));
        group.bench_with_input(BenchmarkId::from_parameter(streams), &bytes, |b, bytes| {
            b.iter(|| {
                let trace = TraceFile::from_bytes(bytes.clone()).expect("trace");
                let mut dataset = DataSet::from_trace(trace, BuildConfig::default()).expect("data set");
                dataset
                    .build(&mut NoProgress, &CancelToken::new())
                    .expect("build");
                black_box(dataset.stats().expect("stats"))
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_merge, bench_build);
criterion_main!(benches);
