//! 拉模式渐进式 MP4 解封装集成测试.
//!
//! 用合成的 ftyp + moov + mdat 文件验证流发现、采样索引、
//! 数据读取与跨轨道交错的完整流程.

use isodemux::codec::{CodecId, Packet};
use isodemux::core::{IsoError, MediaType};
use isodemux::format::test_support::{
    CollectingOutput, Layout, TrackSpec, build_progressive, sample_payload,
};
use isodemux::format::{DemuxConfig, Demuxer, FlowResult, IoContext, Mp4Demuxer};

fn open(file: Vec<u8>) -> (Box<dyn Demuxer>, IoContext) {
    let registry = isodemux::default_format_registry();
    let mut io = IoContext::from_memory(file);
    let demuxer = registry
        .open_input(&mut io, Some("synthetic.mp4"))
        .expect("打开合成文件失败");
    (demuxer, io)
}

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

fn av_tracks() -> Vec<TrackSpec> {
    vec![
        TrackSpec::video(1, 30).with_sync_every(10),
        TrackSpec::audio(2, 40),
    ]
}

#[test]
fn test_拉模式_打开并发现流() {
    let (demuxer, _io) = open(build_progressive(&av_tracks(), Layout::MoovFirst));

    assert_eq!(demuxer.name(), "mp4");
    assert!(demuxer.is_seekable());
    let streams = demuxer.streams();
    assert_eq!(streams.len(), 2);

    assert_eq!(streams[0].media_type, MediaType::Video);
    assert_eq!(streams[0].codec_id, CodecId::H264);
    assert_eq!(streams[0].track_id, 1);
    assert_eq!(streams[0].nb_frames, 30);
    assert!(!streams[0].extra_data.is_empty(), "avcC 应该作为私有数据");
    let video = streams[0].video().expect("应为视频参数");
    assert_eq!((video.width, video.height), (320, 240));

    assert_eq!(streams[1].media_type, MediaType::Audio);
    assert_eq!(streams[1].codec_id, CodecId::Aac);
    let audio = streams[1].audio().expect("应为音频参数");
    assert_eq!(audio.sample_rate, 48000);
    assert_eq!(audio.channels, 2);

    // 30 帧 * 100 / 3000 = 1 秒
    let duration = demuxer.duration().expect("时长应已知");
    assert!((duration - 1.0).abs() < 1e-3, "时长 {duration}");
    let video_duration = streams[0].duration_seconds().expect("视频时长");
    assert!((video_duration - 1.0).abs() < 1e-6);
}

#[test]
fn test_拉模式_数据包内容与关键帧() {
    let (mut demuxer, mut io) = open(build_progressive(&av_tracks(), Layout::MoovFirst));
    let packets = read_all(demuxer.as_mut(), &mut io);

    let video: Vec<&Packet> = packets.iter().filter(|p| p.stream_index == 0).collect();
    let audio: Vec<&Packet> = packets.iter().filter(|p| p.stream_index == 1).collect();
    assert_eq!(video.len(), 30);
    assert_eq!(audio.len(), 40);

    for (i, p) in video.iter().enumerate() {
        assert_eq!(p.data.as_ref(), sample_payload(1, i, 300).as_slice(), "视频采样 {i}");
        assert_eq!(p.dts, i as i64 * 100);
        assert_eq!(p.duration, 100);
        assert_eq!(p.is_keyframe, i % 10 == 0, "视频采样 {i} 的关键帧标记");
        assert_eq!(p.time_base.den, 3000);
    }
    for (i, p) in audio.iter().enumerate() {
        assert_eq!(p.data.as_ref(), sample_payload(2, i, 200).as_slice(), "音频采样 {i}");
        assert!(p.is_keyframe, "没有 stss 时所有采样都是同步采样");
    }
}

#[test]
fn test_拉模式_跨轨道按解码时间交错() {
    let (mut demuxer, mut io) = open(build_progressive(&av_tracks(), Layout::MoovFirst));
    let packets = read_all(demuxer.as_mut(), &mut io);

    let seconds: Vec<f64> = packets
        .iter()
        .map(|p| p.time_base.ticks_to_secs(p.dts).expect("时间基有效"))
        .collect();
    assert!(
        seconds.windows(2).all(|w| w[0] <= w[1] + 1e-9),
        "解码时间应当单调不减"
    );
    for stream in 0..2 {
        let dts: Vec<i64> = packets
            .iter()
            .filter(|p| p.stream_index == stream)
            .map(|p| p.dts)
            .collect();
        assert!(dts.windows(2).all(|w| w[0] < w[1]), "流 {stream} 的 dts 应当递增");
    }
}

#[test]
fn test_拉模式_moov位置不影响结果() {
    let (mut a, mut io_a) = open(build_progressive(&av_tracks(), Layout::MoovFirst));
    let (mut b, mut io_b) = open(build_progressive(&av_tracks(), Layout::MdatFirst));
    assert_eq!(a.streams().len(), b.streams().len());

    let pa = read_all(a.as_mut(), &mut io_a);
    let pb = read_all(b.as_mut(), &mut io_b);
    assert_eq!(pa.len(), pb.len());
    for (x, y) in pa.iter().zip(&pb) {
        assert_eq!((x.stream_index, x.dts, x.pts), (y.stream_index, y.dts, y.pts));
        assert_eq!(x.data, y.data);
    }
}

#[test]
fn test_拉模式_重复解析结果一致() {
    let file = build_progressive(&av_tracks(), Layout::MoovFirst);
    let (mut a, mut io_a) = open(file.clone());
    let (mut b, mut io_b) = open(file);
    assert_eq!(a.streams(), b.streams());
    let pa = read_all(a.as_mut(), &mut io_a);
    let pb = read_all(b.as_mut(), &mut io_b);
    assert_eq!(pa, pb);
}

#[test]
fn test_拉模式_编辑列表提前显示() {
    let tracks = [TrackSpec::video(1, 6).with_edit(200)];
    let (mut demuxer, mut io) = open(build_progressive(&tracks, Layout::MoovFirst));
    assert_eq!(demuxer.streams()[0].start_time, -200);

    let packets = read_all(demuxer.as_mut(), &mut io);
    assert_eq!(packets.len(), 6);
    assert_eq!(packets[0].pts, -200);
    assert_eq!(packets[2].pts, 0);
}

#[test]
fn test_拉模式_显示时间偏移() {
    let tracks = [TrackSpec::video(1, 4).with_cts_pattern(&[200, 0, 100, 100])];
    let (mut demuxer, mut io) = open(build_progressive(&tracks, Layout::MoovFirst));
    let packets = read_all(demuxer.as_mut(), &mut io);
    let pts: Vec<i64> = packets.iter().map(|p| p.pts).collect();
    let dts: Vec<i64> = packets.iter().map(|p| p.dts).collect();
    assert_eq!(dts, vec![0, 100, 200, 300]);
    assert_eq!(pts, vec![200, 100, 300, 400]);
}

#[test]
fn test_拉模式_零采样轨道立即结束() {
    let tracks = [TrackSpec::video(1, 5), TrackSpec::audio(2, 0)];
    let file = build_progressive(&tracks, Layout::MoovFirst);
    let mut io = IoContext::from_memory(file);
    let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
    let (mut outputs, collected) = CollectingOutput::manager();

    let flow = demuxer.run(&mut io, &mut outputs).expect("解封装失败");
    assert_eq!(flow, FlowResult::Eos);
    assert_eq!(collected.formats().len(), 2);
    assert_eq!(collected.packets_of(0).len(), 5);
    assert!(collected.packets_of(1).is_empty());
    let eos = collected.eos_streams();
    assert!(eos.contains(&0) && eos.contains(&1));
}

#[test]
fn test_拉模式_零采样轨道可以不输出() {
    let tracks = [TrackSpec::video(1, 5), TrackSpec::audio(2, 0)];
    let config = DemuxConfig {
        announce_empty_tracks: false,
        ..DemuxConfig::default()
    };
    let registry = isodemux::format_registry_with(config);
    let mut io = IoContext::from_memory(build_progressive(&tracks, Layout::MoovFirst));
    let demuxer = registry.open_input(&mut io, None).expect("打开失败");
    assert_eq!(demuxer.streams().len(), 1);
    assert_eq!(demuxer.streams()[0].track_id, 1);
}

#[test]
fn test_拉模式_轨道数上限() {
    let tracks = [
        TrackSpec::video(1, 3),
        TrackSpec::audio(2, 3),
        TrackSpec::audio(3, 3),
    ];
    let config = DemuxConfig {
        max_tracks: 2,
        ..DemuxConfig::default()
    };
    let registry = isodemux::format_registry_with(config);
    let mut io = IoContext::from_memory(build_progressive(&tracks, Layout::MoovFirst));
    let mut demuxer = registry.open_input(&mut io, None).expect("打开失败");
    assert_eq!(demuxer.streams().len(), 2);
    let packets = read_all(demuxer.as_mut(), &mut io);
    assert!(packets.iter().all(|p| p.track_id != 3));
}

#[test]
fn test_拉模式_文件后端() {
    let file = build_progressive(&av_tracks(), Layout::MoovFirst);
    let mut tmp = tempfile::NamedTempFile::new().expect("创建临时文件失败");
    std::io::Write::write_all(&mut tmp, &file).expect("写入临时文件失败");
    let path = tmp.path().to_string_lossy().to_string();

    let registry = isodemux::default_format_registry();
    let mut io = IoContext::open_read(&path).expect("打开临时文件失败");
    let mut demuxer = registry.open_input(&mut io, Some(&path)).expect("解析失败");
    let packets = read_all(demuxer.as_mut(), &mut io);
    assert_eq!(packets.len(), 70);
}

#[test]
fn test_拉模式_输出通道收到完整事件序列() {
    let file = build_progressive(&av_tracks(), Layout::MoovFirst);
    let mut io = IoContext::from_memory(file);
    let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
    let (mut outputs, collected) = CollectingOutput::manager();
    demuxer.run(&mut io, &mut outputs).expect("解封装失败");

    use isodemux::format::test_support::OutputEvent;
    for stream in 0..2 {
        let events: Vec<OutputEvent> = collected
            .events()
            .into_iter()
            .filter(|e| match e {
                OutputEvent::Format(s) => s.index == stream,
                OutputEvent::Segment { stream_index, .. } | OutputEvent::Eos { stream_index } => {
                    *stream_index == stream
                }
                OutputEvent::Packet(p) => p.stream_index == stream,
            })
            .collect();
        assert!(matches!(events.first(), Some(OutputEvent::Format(_))));
        assert!(matches!(events.get(1), Some(OutputEvent::Segment { .. })));
        assert!(matches!(events.last(), Some(OutputEvent::Eos { .. })));
        let eos_count = events
            .iter()
            .filter(|e| matches!(e, OutputEvent::Eos { .. }))
            .count();
        assert_eq!(eos_count, 1);
    }
}
