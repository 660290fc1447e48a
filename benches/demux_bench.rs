//! isodemux 性能基准测试.
//!
//! 覆盖头部解析与索引构建、拉模式读取、推模式分块解析以及分片追加.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use isodemux::core::IsoError;
use isodemux::format::test_support::{
    CollectingOutput, FragmentSpec, Layout, TrackSpec, build_fragmented, build_progressive,
};
use isodemux::format::{DemuxConfig, Demuxer, IoContext, Mp4Demuxer, SeekRequest};

/// 约 100 秒的音视频文件 (3000 帧视频 + 4700 帧音频)
fn long_progressive() -> Vec<u8> {
    build_progressive(
        &[
            TrackSpec::video(1, 3000).with_sync_every(30).with_size(64),
            TrackSpec::audio(2, 4700).with_size(16),
        ],
        Layout::MoovFirst,
    )
}

fn long_fragmented() -> Vec<u8> {
    let init = [
        TrackSpec::video(1, 0).with_sync_every(30).with_size(64),
        TrackSpec::audio(2, 0).with_size(16),
    ];
    let fragments: Vec<FragmentSpec> = (1..=100)
        .map(|seq| FragmentSpec::new(seq, &[(1, 30), (2, 47)]))
        .collect();
    build_fragmented(&init, &fragments)
}

fn bench_open_index(c: &mut Criterion) {
    let file = long_progressive();
    c.bench_function("mp4_open_index_7700_samples", |b| {
        b.iter(|| {
            let mut io = IoContext::from_memory(black_box(file.clone()));
            let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
            demuxer.open(&mut io).unwrap();
            black_box(demuxer.streams().len());
        });
    });
}

fn bench_pull_read(c: &mut Criterion) {
    let file = long_progressive();
    c.bench_function("mp4_pull_read_all", |b| {
        b.iter(|| {
            let mut io = IoContext::from_memory(file.clone());
            let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
            demuxer.open(&mut io).unwrap();
            let mut n = 0usize;
            loop {
                match demuxer.read_packet(&mut io) {
                    Ok(p) => n += p.size(),
                    Err(IsoError::Eof) => break,
                    Err(e) => panic!("{e}"),
                }
            }
            black_box(n);
        });
    });
}

fn bench_push_chunks(c: &mut Criterion) {
    let file = long_progressive();
    c.bench_function("mp4_push_4k_chunks", |b| {
        b.iter(|| {
            let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
            let (mut outputs, collected) = CollectingOutput::manager();
            for chunk in file.chunks(4096) {
                demuxer.push_chunk(black_box(chunk), &mut outputs).unwrap();
            }
            demuxer.push_eos(&mut outputs).unwrap();
            black_box(collected.packets().len());
        });
    });
}

fn bench_fragment_seek(c: &mut Criterion) {
    let file = long_fragmented();
    c.bench_function("fmp4_seek_to_end", |b| {
        b.iter(|| {
            let mut io = IoContext::from_memory(file.clone());
            let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
            demuxer.open(&mut io).unwrap();
            let outcome = demuxer.seek(&mut io, &SeekRequest::seconds(95.0)).unwrap();
            black_box(outcome);
        });
    });
}

criterion_group!(
    benches,
    bench_open_index,
    bench_pull_read,
    bench_push_chunks,
    bench_fragment_seek,
);
criterion_main!(benches);
