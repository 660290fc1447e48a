//! 定位集成测试.
//!
//! 关键帧对齐、超出时长截断、快进/倒放以及推模式下的续传偏移.

use isodemux::codec::Packet;
use isodemux::core::IsoError;
use isodemux::format::test_support::{CollectingOutput, Layout, TrackSpec, build_progressive};
use isodemux::format::{
    DemuxConfig, DemuxState, Demuxer, IoContext, Mp4Demuxer, SeekRequest, SeekStatus,
};

fn read_all(demuxer: &mut dyn Demuxer, io: &mut IoContext) -> Vec<Packet> {
    let mut packets = Vec::new();
    loop {
        match demuxer.read_packet(io) {
            Ok(p) => packets.push(p),
            Err(IsoError::Eof) => break,
            Err(e) => panic!("读取数据包失败: {e}"),
        }
    }
    packets
}

/// 视频 30 帧 (每 5 帧一个关键帧) + 音频 40 帧
fn av_file() -> Vec<u8> {
    build_progressive(
        &[TrackSpec::video(1, 30).with_sync_every(5), TrackSpec::audio(2, 40)],
        Layout::MoovFirst,
    )
}

fn open_direct(file: Vec<u8>) -> (Mp4Demuxer, IoContext) {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut io = IoContext::from_memory(file);
    let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
    demuxer.open(&mut io).expect("打开失败");
    (demuxer, io)
}

fn of_stream(packets: &[Packet], stream: usize) -> Vec<&Packet> {
    packets.iter().filter(|p| p.stream_index == stream).collect()
}

#[test]
fn test_定位_落到之前的关键帧并对齐其他轨道() {
    // 轨道 1 为音频, 轨道 2 为视频 (每 4 帧一个关键帧)
    let file = build_progressive(
        &[TrackSpec::audio(1, 40), TrackSpec::video(2, 20).with_sync_every(4)],
        Layout::MoovFirst,
    );
    let (mut demuxer, mut io) = open_direct(file);

    // 视频第 6 帧的时间
    let outcome = demuxer
        .seek(&mut io, &SeekRequest::stream_time(1, 600))
        .expect("定位失败");
    assert_eq!(outcome.status, SeekStatus::Done);
    let position = outcome.position.expect("应给出落点");
    assert!((position - 400.0 / 3000.0).abs() < 1e-9);

    let packets = read_all(&mut demuxer, &mut io);
    let video = of_stream(&packets, 1);
    let audio = of_stream(&packets, 0);
    assert_eq!(video[0].dts, 400, "从第 4 帧 (关键帧) 恢复");
    assert!(video[0].is_keyframe);
    assert!(video[0].discont);
    assert_eq!(video.len(), 16);

    // 400/3000 秒 = 6400 个音频刻度, 落在第 6 个音频采样 (6144)
    assert_eq!(audio[0].dts, 6 * 1024);
    assert_eq!(audio.len(), 34);
}

#[test]
fn test_定位_按秒使用视频作为参考() {
    let (mut demuxer, mut io) = open_direct(av_file());
    let outcome = demuxer
        .seek(&mut io, &SeekRequest::seconds(0.4))
        .expect("定位失败");
    assert_eq!(outcome.status, SeekStatus::Done);
    assert_eq!(outcome.byte_offset, None, "拉模式不需要续传偏移");

    let segment = demuxer.take_pending_segment().expect("定位后应有新时间段");
    assert!((segment.start - 1000.0 / 3000.0).abs() < 1e-9);
    assert_eq!(segment.stop, None);
    assert!(segment.discont);

    let packets = read_all(&mut demuxer, &mut io);
    assert_eq!(of_stream(&packets, 0)[0].dts, 1000);
}

#[test]
fn test_定位_超出时长截断() {
    let (mut demuxer, mut io) = open_direct(av_file());
    let outcome = demuxer
        .seek(&mut io, &SeekRequest::seconds(100.0))
        .expect("定位失败");
    assert_eq!(outcome.status, SeekStatus::Clamped);
    let position = outcome.position.expect("应给出落点");
    assert!((position - 2500.0 / 3000.0).abs() < 1e-9, "落在最后一个关键帧");

    let packets = read_all(&mut demuxer, &mut io);
    let video = of_stream(&packets, 0);
    assert_eq!(video.len(), 5);
    assert_eq!(video[0].dts, 2500);
    let audio = of_stream(&packets, 1);
    assert_eq!(audio.len(), 1);
    assert_eq!(audio[0].dts, 39 * 1024);
}

#[test]
fn test_定位_任意帧() {
    let (mut demuxer, mut io) = open_direct(av_file());
    let mut request = SeekRequest::stream_time(0, 700);
    request.flags.any = true;
    demuxer.seek(&mut io, &request).expect("定位失败");
    let packets = read_all(&mut demuxer, &mut io);
    let video = of_stream(&packets, 0);
    assert_eq!(video[0].dts, 700);
    assert!(!video[0].is_keyframe);
}

#[test]
fn test_定位_快进只输出关键帧() {
    let (mut demuxer, mut io) = open_direct(av_file());
    demuxer
        .seek(&mut io, &SeekRequest::seconds(0.0).with_rate(4.0))
        .expect("定位失败");
    assert_eq!(demuxer.state(), DemuxState::TrickPlay);

    let packets = read_all(&mut demuxer, &mut io);
    assert!(packets.iter().all(|p| p.stream_index == 0), "快进时音频结束");
    assert!(packets.iter().all(|p| p.is_keyframe));
    // 速率 4 / 基准 2 = 每隔一个关键帧
    let dts: Vec<i64> = packets.iter().map(|p| p.dts).collect();
    assert_eq!(dts, vec![0, 1000, 2000]);
}

#[test]
fn test_定位_快进基准速率可配置() {
    let mut io = IoContext::from_memory(av_file());
    let mut demuxer = Mp4Demuxer::new(DemuxConfig {
        trick_base_rate: 8.0,
        ..DemuxConfig::default()
    });
    demuxer.open(&mut io).expect("打开失败");
    demuxer
        .seek(&mut io, &SeekRequest::seconds(0.0).with_rate(4.0))
        .expect("定位失败");
    assert_eq!(demuxer.state(), DemuxState::Streaming, "低于基准速率按正常播放");
    assert_eq!(read_all(&mut demuxer, &mut io).len(), 70);
}

#[test]
fn test_定位_倒放() {
    let (mut demuxer, mut io) = open_direct(av_file());
    demuxer
        .seek(&mut io, &SeekRequest::seconds(0.9).with_rate(-1.0))
        .expect("定位失败");
    let segment = demuxer.take_pending_segment().expect("应有新时间段");
    assert_eq!(segment.rate, -1.0);
    assert_eq!(segment.start, 0.0);
    let stop = segment.stop.expect("倒放时间段有终点");
    assert!((stop - 2500.0 / 3000.0).abs() < 1e-9);

    let packets = read_all(&mut demuxer, &mut io);
    let dts: Vec<i64> = packets.iter().map(|p| p.dts).collect();
    assert_eq!(dts, vec![2500, 2000, 1500, 1000, 500, 0]);
    assert!(packets.iter().all(|p| p.stream_index == 0 && p.is_keyframe));
}

#[test]
fn test_定位_倒放后恢复正常速率() {
    let (mut demuxer, mut io) = open_direct(av_file());
    demuxer
        .seek(&mut io, &SeekRequest::seconds(0.5).with_rate(-2.0))
        .expect("定位失败");
    let _ = read_all(&mut demuxer, &mut io);

    demuxer
        .seek(&mut io, &SeekRequest::seconds(0.0))
        .expect("定位失败");
    assert_eq!(demuxer.state(), DemuxState::Streaming);
    assert_eq!(read_all(&mut demuxer, &mut io).len(), 70);
}

#[test]
fn test_定位_字节位置() {
    let (mut demuxer, mut io) = open_direct(av_file());
    let all = read_all(&mut demuxer, &mut io);
    let tenth = of_stream(&all, 0)[10].pos as u64;

    let outcome = demuxer
        .seek(&mut io, &SeekRequest::byte(tenth))
        .expect("定位失败");
    assert_eq!(outcome.status, SeekStatus::Done);
    let packets = read_all(&mut demuxer, &mut io);
    assert_eq!(of_stream(&packets, 0)[0].dts, 1000);
}

#[test]
fn test_定位_非法参数() {
    let (mut demuxer, mut io) = open_direct(av_file());
    assert!(matches!(
        demuxer.seek(&mut io, &SeekRequest::seconds(0.0).with_rate(0.0)),
        Err(IsoError::InvalidArgument(_))
    ));
    assert!(matches!(
        demuxer.seek(&mut io, &SeekRequest::stream_time(5, 0)),
        Err(IsoError::InvalidArgument(_))
    ));
    // 非法参数不终止会话
    assert_eq!(read_all(&mut demuxer, &mut io).len(), 70);

    demuxer.stop();
    assert!(matches!(
        demuxer.seek(&mut io, &SeekRequest::seconds(0.0)),
        Err(IsoError::Stopped)
    ));
}

#[test]
fn test_定位_推模式给出续传偏移() {
    let file = av_file();
    let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
    let (mut outputs, collected) = CollectingOutput::manager();
    demuxer.push_chunk(&file, &mut outputs).expect("推入失败");
    let before = collected.packets().len();
    assert_eq!(before, 70);

    let mut no_io = IoContext::from_memory(Vec::new());
    let outcome = demuxer
        .seek(&mut no_io, &SeekRequest::stream_time(0, 1200))
        .expect("定位失败");
    assert_eq!(outcome.status, SeekStatus::Done);
    let offset = outcome.byte_offset.expect("推模式应给出续传偏移") as usize;
    assert!(offset < file.len());

    demuxer.push_chunk(&file[offset..], &mut outputs).expect("推入失败");
    demuxer.push_eos(&mut outputs).expect("结束失败");

    let after = collected.packets().split_off(before);
    let video = of_stream(&after, 0);
    let audio = of_stream(&after, 1);
    assert_eq!(video[0].dts, 1000);
    assert_eq!(video.len(), 20);
    // 1000/3000 秒 = 16000 个音频刻度
    assert_eq!(audio[0].dts, 15 * 1024);
    assert_eq!(audio.len(), 25);
}

#[test]
fn test_定位_推模式限制() {
    let file = av_file();
    let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
    let (mut outputs, _) = CollectingOutput::manager();
    demuxer.push_chunk(&file, &mut outputs).expect("推入失败");

    let mut no_io = IoContext::from_memory(Vec::new());
    assert!(matches!(
        demuxer.seek(&mut no_io, &SeekRequest::seconds(0.5).with_rate(-1.0)),
        Err(IsoError::Unsupported(_))
    ));
    assert!(matches!(
        demuxer.seek(&mut no_io, &SeekRequest::byte(100)),
        Err(IsoError::Unsupported(_))
    ));
    assert_ne!(demuxer.state(), DemuxState::Stopped);
}

#[test]
fn test_定位_推模式头部之前的定位延迟生效() {
    let file = av_file();
    let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
    let (mut outputs, collected) = CollectingOutput::manager();

    let mut no_io = IoContext::from_memory(Vec::new());
    let outcome = demuxer
        .seek(&mut no_io, &SeekRequest::stream_time(0, 2100))
        .expect("定位失败");
    assert_eq!(outcome.status, SeekStatus::Deferred);

    demuxer.push_chunk(&file, &mut outputs).expect("推入失败");
    demuxer.push_eos(&mut outputs).expect("结束失败");
    let video = collected.packets_of(0);
    assert_eq!(video[0].dts, 2000);
    assert_eq!(video.len(), 10);
}
