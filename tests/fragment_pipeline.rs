//! 分片 MP4 (fMP4) 集成测试.
//!
//! 覆盖 init 段 + moof/mdat 序列在拉模式与推模式下的读取、
//! 三种数据起点寻址方式、tfdt 处理以及 CENC 加密信息透传.

use isodemux::codec::{CodecId, Packet};
use isodemux::core::IsoError;
use isodemux::format::test_support::{
    BaseMode, CollectingOutput, FragmentSpec, TEST_KID, TrackSpec, build_fragmented,
    build_init_segment, sample_iv, sample_payload,
};
use isodemux::format::{
    DemuxConfig, Demuxer, IoContext, Mp4Demuxer, SeekRequest, SeekStatus,
};

fn open(file: Vec<u8>) -> (Box<dyn Demuxer>, IoContext) {
    let _ = env_logger::builder().is_test(true).try_init();
    let registry = isodemux::default_format_registry();
    let mut io = IoContext::from_memory(file);
    let demuxer = registry
        .open_input(&mut io, Some("fragmented.mp4"))
        .expect("打开分片文件失败");
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

fn push_all(file: &[u8], chunk: usize) -> (Mp4Demuxer, Vec<Packet>) {
    let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
    let (mut outputs, collected) = CollectingOutput::manager();
    for piece in file.chunks(chunk) {
        demuxer.push_chunk(piece, &mut outputs).expect("推入失败");
    }
    demuxer.push_eos(&mut outputs).expect("结束失败");
    (demuxer, collected.packets())
}

/// 每个采样 1000 字节, 时长 1 个刻度, 全部为同步采样
fn unit_track() -> TrackSpec {
    let mut spec = TrackSpec::video(1, 0).with_size(1000);
    spec.sample_duration = 1;
    spec
}

#[test]
fn test_分片_单轨道定位到采样() {
    let file = build_fragmented(&[unit_track()], &[FragmentSpec::new(1, &[(1, 10)])]);
    let (mut demuxer, mut io) = open(file);
    assert_eq!(demuxer.streams().len(), 1);

    let outcome = demuxer
        .seek(&mut io, &SeekRequest::stream_time(0, 5))
        .expect("定位失败");
    assert_eq!(outcome.status, SeekStatus::Done);

    let packets = read_all(demuxer.as_mut(), &mut io);
    assert_eq!(packets.len(), 5);
    assert_eq!(packets[0].dts, 5);
    assert!(packets[0].discont, "定位后的第一个数据包带不连续标记");
    assert_eq!(packets[0].data.as_ref(), sample_payload(1, 5, 1000).as_slice());
}

#[test]
fn test_分片_只有初始化段() {
    let file = build_init_segment(&[TrackSpec::video(1, 0), TrackSpec::audio(2, 0)], 0);
    let (mut demuxer, mut io) = open(file);
    assert_eq!(demuxer.streams().len(), 2, "分片轨道即使暂时没有采样也要通告");
    assert!(matches!(demuxer.read_packet(&mut io), Err(IsoError::Eof)));
}

#[test]
fn test_分片_跨分片接续() {
    let init = [TrackSpec::video(1, 0).with_sync_every(4), TrackSpec::audio(2, 0)];
    let file = build_fragmented(
        &init,
        &[
            FragmentSpec::new(1, &[(1, 4), (2, 6)]),
            FragmentSpec::new(2, &[(1, 4), (2, 6)]),
            FragmentSpec::new(3, &[(1, 4)]),
        ],
    );
    let (mut demuxer, mut io) = open(file);
    let duration = demuxer.duration().expect("mehd 给出时长");
    // 12 帧 * 100 / 3000 = 0.4 秒
    assert!((duration - 0.4).abs() < 1e-3, "时长 {duration}");

    let packets = read_all(demuxer.as_mut(), &mut io);
    let video: Vec<&Packet> = packets.iter().filter(|p| p.stream_index == 0).collect();
    let audio: Vec<&Packet> = packets.iter().filter(|p| p.stream_index == 1).collect();
    assert_eq!(video.len(), 12);
    assert_eq!(audio.len(), 12);
    for (i, p) in video.iter().enumerate() {
        assert_eq!(p.dts, i as i64 * 100);
        assert_eq!(p.is_keyframe, i % 4 == 0);
        assert_eq!(p.data.as_ref(), sample_payload(1, i, 300).as_slice());
    }
    for (i, p) in audio.iter().enumerate() {
        assert_eq!(p.dts, i as i64 * 1024);
        assert_eq!(p.data.as_ref(), sample_payload(2, i, 200).as_slice());
    }
}

#[test]
fn test_分片_三种数据起点() {
    let init = [TrackSpec::video(1, 0), TrackSpec::audio(2, 0)];
    let file = build_fragmented(
        &init,
        &[
            FragmentSpec::new(1, &[(1, 3), (2, 3)]).base(BaseMode::MoofRelative),
            FragmentSpec::new(2, &[(1, 3), (2, 3)]).base(BaseMode::Explicit),
            FragmentSpec::new(3, &[(1, 3), (2, 3)]).base(BaseMode::Implicit),
        ],
    );
    let (mut demuxer, mut io) = open(file.clone());
    let pulled = read_all(demuxer.as_mut(), &mut io);
    assert_eq!(pulled.len(), 18);
    for p in &pulled {
        let index = if p.stream_index == 0 {
            (p.dts / 100) as usize
        } else {
            (p.dts / 1024) as usize
        };
        let size = if p.stream_index == 0 { 300 } else { 200 };
        assert_eq!(
            p.data.as_ref(),
            sample_payload(p.track_id, index, size).as_slice(),
            "轨道 {} 采样 {}",
            p.track_id,
            index
        );
    }

    let (_, pushed) = push_all(&file, 33);
    let mut a: Vec<_> = pulled.iter().map(|p| (p.track_id, p.dts, p.data.clone())).collect();
    let mut b: Vec<_> = pushed.iter().map(|p| (p.track_id, p.dts, p.data.clone())).collect();
    a.sort();
    b.sort();
    assert_eq!(a, b);
}

#[test]
fn test_分片_数据先于moof_拉模式() {
    let init = [TrackSpec::video(1, 0)];
    let file = build_fragmented(
        &init,
        &[
            FragmentSpec::new(1, &[(1, 5)]).data_first(),
            FragmentSpec::new(2, &[(1, 5)]).data_first(),
        ],
    );
    let (mut demuxer, mut io) = open(file);
    let packets = read_all(demuxer.as_mut(), &mut io);
    assert_eq!(packets.len(), 10);
    for (i, p) in packets.iter().enumerate() {
        assert_eq!(p.dts, i as i64 * 100);
        assert_eq!(p.data.as_ref(), sample_payload(1, i, 300).as_slice());
    }
}

#[test]
fn test_分片_数据先于moof_推模式隐式起点() {
    let init = [TrackSpec::video(1, 0)];
    let file = build_fragmented(
        &init,
        &[
            FragmentSpec::new(1, &[(1, 5)]).data_first().base(BaseMode::Implicit),
            FragmentSpec::new(2, &[(1, 5)]).data_first().base(BaseMode::Implicit),
        ],
    );
    for chunk in [1, 17, file.len()] {
        let (_, packets) = push_all(&file, chunk);
        assert_eq!(packets.len(), 10, "块大小 {chunk}");
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.data.as_ref(), sample_payload(1, i, 300).as_slice());
        }
    }
}

#[test]
fn test_分片_数据先于moof_拉模式隐式起点() {
    let init = [TrackSpec::video(1, 0)];
    let file = build_fragmented(
        &init,
        &[
            FragmentSpec::new(1, &[(1, 5)]).data_first().base(BaseMode::Implicit),
            FragmentSpec::new(2, &[(1, 5)]).data_first().base(BaseMode::Implicit),
        ],
    );
    let (mut demuxer, mut io) = open(file);
    let packets = read_all(demuxer.as_mut(), &mut io);
    assert_eq!(packets.len(), 10);
    for (i, p) in packets.iter().enumerate() {
        assert_eq!(p.dts, i as i64 * 100);
        assert_eq!(
            p.data.as_ref(),
            sample_payload(1, i, 300).as_slice(),
            "采样 {i} 应来自与其 moof 配对的 mdat"
        );
    }
}

#[test]
fn test_分片_隐式起点_前后排列混合() {
    // moof1 mdat1 | mdat2 moof2 | moof3 mdat3: 每个 mdat 只被配对一次
    let init = [TrackSpec::video(1, 0)];
    let file = build_fragmented(
        &init,
        &[
            FragmentSpec::new(1, &[(1, 3)]).base(BaseMode::Implicit),
            FragmentSpec::new(2, &[(1, 3)]).data_first().base(BaseMode::Implicit),
            FragmentSpec::new(3, &[(1, 3)]).base(BaseMode::Implicit),
        ],
    );
    let (mut demuxer, mut io) = open(file.clone());
    let pulled = read_all(demuxer.as_mut(), &mut io);
    assert_eq!(pulled.len(), 9);
    for (i, p) in pulled.iter().enumerate() {
        assert_eq!(p.data.as_ref(), sample_payload(1, i, 300).as_slice(), "采样 {i}");
    }

    let (_, pushed) = push_all(&file, 41);
    assert_eq!(
        pushed.iter().map(|p| p.data.clone()).collect::<Vec<_>>(),
        pulled.iter().map(|p| p.data.clone()).collect::<Vec<_>>()
    );
}

#[test]
fn test_分片_基准偏移越界时跳过该分片() {
    let init = [TrackSpec::video(1, 0)];
    let file = build_fragmented(
        &init,
        &[
            FragmentSpec::new(1, &[(1, 5)]),
            FragmentSpec::new(2, &[(1, 5)]).with_base_data_offset(u64::MAX - 4),
            FragmentSpec::new(3, &[(1, 5)]),
        ],
    );
    let (mut demuxer, mut io) = open(file.clone());
    let packets = read_all(demuxer.as_mut(), &mut io);
    let dts: Vec<i64> = packets.iter().map(|p| p.dts).collect();
    assert_eq!(dts, vec![0, 100, 200, 300, 400, 1000, 1100, 1200, 1300, 1400]);
    assert_eq!(packets[5].data.as_ref(), sample_payload(1, 10, 300).as_slice());

    let (_, pushed) = push_all(&file, 64);
    assert_eq!(pushed.len(), 10);
}

#[test]
fn test_分片_senc条目数损坏时不带加密信息() {
    let init = [TrackSpec::video(1, 0).protected()];
    let file = build_fragmented(
        &init,
        &[
            FragmentSpec::new(1, &[(1, 4)]),
            FragmentSpec::new(2, &[(1, 4)]).with_aux_count(u32::MAX),
            FragmentSpec::new(3, &[(1, 4)]),
        ],
    );
    let (mut demuxer, mut io) = open(file);
    let packets = read_all(demuxer.as_mut(), &mut io);
    assert_eq!(packets.len(), 12, "采样本身照常输出");
    for (i, p) in packets.iter().enumerate() {
        if (4..8).contains(&i) {
            assert!(p.protection.is_none(), "采样 {i}");
        } else {
            let prot = p.protection.as_ref().expect("其他分片的加密信息不受影响");
            assert_eq!(prot.iv.as_ref(), sample_iv(1, i).as_slice());
        }
    }
}

#[test]
fn test_分片_saiz采样数损坏时忽略附加信息() {
    let init = [TrackSpec::video(1, 0).protected()];
    let file = build_fragmented(
        &init,
        &[
            FragmentSpec::new(1, &[(1, 3)]).aux_via_saio(),
            FragmentSpec::new(2, &[(1, 3)]).aux_via_saio().with_aux_count(u32::MAX),
        ],
    );
    let (mut demuxer, mut io) = open(file);
    let packets = read_all(demuxer.as_mut(), &mut io);
    assert_eq!(packets.len(), 6);
    assert!(packets[..3].iter().all(|p| p.protection.is_some()));
    assert!(packets[3..].iter().all(|p| p.protection.is_none()));
}

#[test]
fn test_分片_没有tfdt时按时长累加() {
    let init = [TrackSpec::video(1, 0)];
    let file = build_fragmented(
        &init,
        &[
            FragmentSpec::new(1, &[(1, 3)]).without_tfdt(),
            FragmentSpec::new(2, &[(1, 3)]).without_tfdt(),
        ],
    );
    let (mut demuxer, mut io) = open(file);
    let dts: Vec<i64> = read_all(demuxer.as_mut(), &mut io)
        .iter()
        .map(|p| p.dts)
        .collect();
    assert_eq!(dts, vec![0, 100, 200, 300, 400, 500]);
}

#[test]
fn test_分片_tfdt跳跃与倒退() {
    let init = [TrackSpec::video(1, 0)];
    // 第二个分片向后跳 1000, 第三个分片的 tfdt 早于已有的解码时间
    let file = build_fragmented(
        &init,
        &[
            FragmentSpec::new(1, &[(1, 3)]),
            FragmentSpec::new(2, &[(1, 3)]).with_tfdt_shift(1000),
            FragmentSpec::new(3, &[(1, 3)]).with_tfdt_shift(-250),
        ],
    );
    let (mut demuxer, mut io) = open(file);
    let dts: Vec<i64> = read_all(demuxer.as_mut(), &mut io)
        .iter()
        .map(|p| p.dts)
        .collect();
    assert_eq!(dts, vec![0, 100, 200, 1300, 1400, 1500], "倒退的分片被丢弃");
    assert!(dts.windows(2).all(|w| w[0] < w[1]));
}

#[test]
fn test_分片_显示时间偏移() {
    let init = [TrackSpec::video(1, 0).with_cts_pattern(&[100, 0])];
    let file = build_fragmented(&init, &[FragmentSpec::new(1, &[(1, 4)])]);
    let (mut demuxer, mut io) = open(file);
    let packets = read_all(demuxer.as_mut(), &mut io);
    let pts: Vec<i64> = packets.iter().map(|p| p.pts).collect();
    assert_eq!(pts, vec![100, 100, 300, 300]);
}

#[test]
fn test_分片_senc加密信息透传() {
    let init = [TrackSpec::video(1, 0).protected()];
    let file = build_fragmented(
        &init,
        &[FragmentSpec::new(1, &[(1, 4)]), FragmentSpec::new(2, &[(1, 4)])],
    );
    let (mut demuxer, mut io) = open(file);

    let stream = &demuxer.streams()[0];
    assert_eq!(stream.codec_id, CodecId::H264, "按 frma 的原始格式识别编码");
    let scheme = stream.protection.as_ref().expect("流应带加密方案");
    assert_eq!(scheme.scheme_type, "cenc");
    assert_eq!(scheme.original_format, "avc1");

    let systems = demuxer.protection_systems();
    assert_eq!(systems.len(), 1);
    assert_eq!(systems[0].key_ids, vec![TEST_KID]);
    assert_eq!(systems[0].data.as_ref(), b"test");

    let packets = read_all(demuxer.as_mut(), &mut io);
    assert_eq!(packets.len(), 8);
    for (i, p) in packets.iter().enumerate() {
        let prot = p.protection.as_ref().expect("每个采样都有加密信息");
        assert_eq!(&prot.scheme_type, b"cenc");
        assert_eq!(prot.key_id, TEST_KID);
        assert_eq!(prot.iv.as_ref(), sample_iv(1, i).as_slice(), "采样 {i} 的 IV");
        assert!(prot.subsamples.is_empty());
    }
}

#[test]
fn test_分片_saio加密信息透传() {
    let init = [TrackSpec::video(1, 0).protected()];
    let file = build_fragmented(
        &init,
        &[
            FragmentSpec::new(1, &[(1, 3)]).aux_via_saio(),
            FragmentSpec::new(2, &[(1, 3)]).aux_via_saio(),
        ],
    );
    let (mut demuxer, mut io) = open(file.clone());
    let pulled = read_all(demuxer.as_mut(), &mut io);
    assert_eq!(pulled.len(), 6);
    for (i, p) in pulled.iter().enumerate() {
        let prot = p.protection.as_ref().expect("saio 指向的信息应被读取");
        assert_eq!(prot.iv.as_ref(), sample_iv(1, i).as_slice());
    }

    // 推模式下附加信息位于 moof 内部, 同样可以读取
    let (demuxer, pushed) = push_all(&file, 29);
    assert_eq!(demuxer.protection_systems().len(), 1);
    let ivs: Vec<_> = pushed
        .iter()
        .map(|p| p.protection.as_ref().map(|x| x.iv.clone()))
        .collect();
    let expected: Vec<_> = pulled
        .iter()
        .map(|p| p.protection.as_ref().map(|x| x.iv.clone()))
        .collect();
    assert_eq!(ivs, expected);
}

#[test]
fn test_分片_推模式定位等待后续分片() {
    let file = build_fragmented(
        &[unit_track()],
        &[
            FragmentSpec::new(1, &[(1, 10)]),
            FragmentSpec::new(2, &[(1, 10)]),
            FragmentSpec::new(3, &[(1, 10)]),
        ],
    );
    let init_len = build_init_segment(&[unit_track()], 30).len();
    let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
    let (mut outputs, collected) = CollectingOutput::manager();
    demuxer.push_chunk(&file[..init_len], &mut outputs).expect("推入失败");

    let mut no_io = IoContext::from_memory(Vec::new());
    let outcome = demuxer
        .seek(&mut no_io, &SeekRequest::stream_time(0, 25))
        .expect("定位失败");
    assert_eq!(outcome.status, SeekStatus::Deferred);

    demuxer.push_chunk(&file[init_len..], &mut outputs).expect("推入失败");
    demuxer.push_eos(&mut outputs).expect("结束失败");

    let dts: Vec<i64> = collected.packets().iter().map(|p| p.dts).collect();
    assert_eq!(dts, (25..30).collect::<Vec<i64>>(), "目标之前的采样被丢弃");
    let segments = collected.segments_of(0);
    let last = segments.last().expect("定位后重新通告时间段");
    assert!((last.start - 25.0 / 3000.0).abs() < 1e-9);
}
