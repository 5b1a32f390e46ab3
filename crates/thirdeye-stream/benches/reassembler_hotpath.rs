use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use thirdeye_stream::media::nal;
use thirdeye_stream::NalReassembler;

/// A GOP-shaped Annex-B stream: SPS, PPS, one large IDR and `p_frames`
/// P slices, with no zero bytes inside payloads.
fn synthetic_stream(idr_len: usize, p_len: usize, p_frames: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut unit = |header: u8, len: usize| {
        out.extend_from_slice(&nal::START_CODE);
        out.push(header);
        out.extend((1..len).map(|i| (i % 255) as u8 + 1));
    };
    unit(0x67, 12);
    unit(0x68, 4);
    unit(0x65, idr_len);
    for _ in 0..p_frames {
        unit(0x41, p_len);
    }
    out
}

/// Benchmark feed() + drain_events() with MTU-sized chunks.
fn bench_feed_datagrams(c: &mut Criterion) {
    let stream = synthetic_stream(60_000, 4_000, 29);

    let mut group = c.benchmark_group("reassembler");
    group.throughput(Throughput::Bytes(stream.len() as u64));

    for chunk_size in [1_400usize, 8_192, 65_507] {
        group.bench_function(format!("gop_chunks_{chunk_size}"), |b| {
            b.iter_batched(
                NalReassembler::new,
                |mut r| {
                    for chunk in stream.chunks(chunk_size) {
                        r.feed(black_box(chunk));
                        r.drain_events().for_each(drop);
                    }
                    r
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark the start-code scanner on a payload with none.
fn bench_scan(c: &mut Criterion) {
    let data: Vec<u8> = (0..65_536u32).map(|i| (i % 255) as u8 + 1).collect();

    let mut group = c.benchmark_group("scan");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("no_start_code_64k", |b| {
        b.iter(|| nal::find_start_code(black_box(&data), 0));
    });
    group.finish();
}

criterion_group!(benches, bench_feed_datagrams, bench_scan);
criterion_main!(benches);
