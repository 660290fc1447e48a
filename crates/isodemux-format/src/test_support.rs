//! 合成 MP4/fMP4 构造工具.
//!
//! 单元测试、集成测试和基准测试共用. 生成的文件结构完整
//! (ftyp/moov/mdat 或 init + moof/mdat 分片), 采样内容由
//! [`sample_payload`] 决定, 方便校验输出的数据包.

use std::sync::{Arc, Mutex};

use byteorder::{BigEndian, WriteBytesExt};
use isodemux_codec::Packet;
use isodemux_core::MediaType;

use crate::output::{FlowResult, OutputManager, Segment, TrackOutput};
use crate::stream::Stream;

/// 构造普通 box
pub fn make_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + payload.len());
    out.write_u32::<BigEndian>((8 + payload.len()) as u32).unwrap_or_default();
    out.extend_from_slice(fourcc);
    out.extend_from_slice(payload);
    out
}

/// 构造 full box (version + flags)
pub fn make_full_box(fourcc: &[u8; 4], version: u8, flags: u32, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::with_capacity(4 + payload.len());
    body.push(version);
    body.write_u24::<BigEndian>(flags & 0x00FF_FFFF).unwrap_or_default();
    body.extend_from_slice(payload);
    make_box(fourcc, &body)
}

/// 第 `index` 个采样的内容: 前两字节是轨道号与序号, 其余为填充
pub fn sample_payload(track_id: u32, index: usize, size: u32) -> Vec<u8> {
    let mut data = vec![(index % 251) as u8; size as usize];
    if let Some(first) = data.first_mut() {
        *first = track_id as u8;
    }
    if let Some(second) = data.get_mut(1) {
        *second = (index / 251) as u8;
    }
    data
}

/// 加密轨道的默认 KID
pub const TEST_KID: [u8; 16] = [
    0x10, 0x20, 0x30, 0x40, 0x50, 0x60, 0x70, 0x80, 0x90, 0xA0, 0xB0, 0xC0, 0xD0, 0xE0, 0xF0, 0x00,
];

/// 第 `index` 个加密采样的 IV (8 字节)
pub fn sample_iv(track_id: u32, index: usize) -> [u8; 8] {
    let mut iv = [0u8; 8];
    iv[0] = track_id as u8;
    iv[4..].copy_from_slice(&(index as u32).to_be_bytes());
    iv
}

/// 轨道描述
#[derive(Debug, Clone)]
pub struct TrackSpec {
    pub track_id: u32,
    pub media_type: MediaType,
    pub timescale: u32,
    pub sample_duration: u32,
    pub sample_size: u32,
    pub sample_count: usize,
    /// 每 n 个采样一个同步采样, None 表示不写 stss (全部同步)
    pub sync_every: Option<usize>,
    pub samples_per_chunk: usize,
    /// 编辑列表的 media_time
    pub edit_media_time: Option<i64>,
    /// 每个采样的显示时间偏移 (ctts), 按采样序号循环
    pub cts_pattern: Vec<i32>,
    pub protected: bool,
}

impl TrackSpec {
    /// 30 帧/秒视频, 每采样 300 字节
    pub fn video(track_id: u32, sample_count: usize) -> Self {
        Self {
            track_id,
            media_type: MediaType::Video,
            timescale: 3000,
            sample_duration: 100,
            sample_size: 300,
            sample_count,
            sync_every: None,
            samples_per_chunk: 5,
            edit_media_time: None,
            cts_pattern: Vec::new(),
            protected: false,
        }
    }

    /// 48kHz AAC 音频, 每采样 1024 个样点 200 字节
    pub fn audio(track_id: u32, sample_count: usize) -> Self {
        Self {
            track_id,
            media_type: MediaType::Audio,
            timescale: 48000,
            sample_duration: 1024,
            sample_size: 200,
            sample_count,
            sync_every: None,
            samples_per_chunk: 10,
            edit_media_time: None,
            cts_pattern: Vec::new(),
            protected: false,
        }
    }

    pub fn with_sync_every(mut self, n: usize) -> Self {
        self.sync_every = Some(n.max(1));
        self
    }

    pub fn with_size(mut self, size: u32) -> Self {
        self.sample_size = size;
        self
    }

    pub fn with_samples_per_chunk(mut self, n: usize) -> Self {
        self.samples_per_chunk = n.max(1);
        self
    }

    pub fn with_edit(mut self, media_time: i64) -> Self {
        self.edit_media_time = Some(media_time);
        self
    }

    pub fn with_cts_pattern(mut self, pattern: &[i32]) -> Self {
        self.cts_pattern = pattern.to_vec();
        self
    }

    pub fn protected(mut self) -> Self {
        self.protected = true;
        self
    }

    /// 第 `index` 个采样是否为同步采样
    pub fn is_sync(&self, index: usize) -> bool {
        self.sync_every.is_none_or(|n| index % n == 0)
    }

    fn cts(&self, index: usize) -> i32 {
        if self.cts_pattern.is_empty() {
            0
        } else {
            self.cts_pattern[index % self.cts_pattern.len()]
        }
    }

    fn duration_ticks(&self) -> u64 {
        self.sample_count as u64 * u64::from(self.sample_duration)
    }

    fn chunk_count(&self) -> usize {
        self.sample_count.div_ceil(self.samples_per_chunk)
    }

    fn chunk_len(&self, chunk: usize) -> usize {
        let start = chunk * self.samples_per_chunk;
        self.samples_per_chunk.min(self.sample_count - start)
    }
}

/// 渐进式文件的顶层布局
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// ftyp, moov, mdat
    MoovFirst,
    /// ftyp, mdat, moov
    MdatFirst,
}

/// 影片时间刻度
const MOVIE_TIMESCALE: u32 = 1000;

fn ftyp(major: &[u8; 4], compatible: &[&[u8; 4]]) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(major);
    p.extend_from_slice(&0x200u32.to_be_bytes());
    for brand in compatible {
        p.extend_from_slice(*brand);
    }
    make_box(b"ftyp", &p)
}

fn mvhd(duration: u64, next_track_id: u32) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&[0u8; 8]); // creation + modification
    p.extend_from_slice(&MOVIE_TIMESCALE.to_be_bytes());
    p.extend_from_slice(&(duration as u32).to_be_bytes());
    p.extend_from_slice(&0x0001_0000u32.to_be_bytes()); // rate
    p.extend_from_slice(&0x0100u16.to_be_bytes()); // volume
    p.extend_from_slice(&[0u8; 10]);
    p.extend_from_slice(&identity_matrix());
    p.extend_from_slice(&[0u8; 24]);
    p.extend_from_slice(&next_track_id.to_be_bytes());
    make_full_box(b"mvhd", 0, 0, &p)
}

fn identity_matrix() -> [u8; 36] {
    let mut m = [0u8; 36];
    m[0..4].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[16..20].copy_from_slice(&0x0001_0000u32.to_be_bytes());
    m[32..36].copy_from_slice(&0x4000_0000u32.to_be_bytes());
    m
}

fn movie_duration(spec: &TrackSpec) -> u64 {
    spec.duration_ticks() * u64::from(MOVIE_TIMESCALE) / u64::from(spec.timescale)
}

fn tkhd(spec: &TrackSpec) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&[0u8; 8]);
    p.extend_from_slice(&spec.track_id.to_be_bytes());
    p.extend_from_slice(&[0u8; 4]);
    p.extend_from_slice(&(movie_duration(spec) as u32).to_be_bytes());
    p.extend_from_slice(&[0u8; 8]);
    p.extend_from_slice(&[0u8; 4]); // layer + alternate_group
    let volume: u16 = if spec.media_type == MediaType::Audio { 0x0100 } else { 0 };
    p.extend_from_slice(&volume.to_be_bytes());
    p.extend_from_slice(&[0u8; 2]);
    p.extend_from_slice(&identity_matrix());
    let (w, h) = if spec.media_type == MediaType::Video { (320u32, 240u32) } else { (0, 0) };
    p.extend_from_slice(&(w << 16).to_be_bytes());
    p.extend_from_slice(&(h << 16).to_be_bytes());
    make_full_box(b"tkhd", 0, 3, &p)
}

fn edts(spec: &TrackSpec) -> Vec<u8> {
    let Some(media_time) = spec.edit_media_time else {
        return Vec::new();
    };
    let mut p = Vec::new();
    p.extend_from_slice(&1u32.to_be_bytes());
    p.extend_from_slice(&(movie_duration(spec) as u32).to_be_bytes());
    p.extend_from_slice(&(media_time as i32).to_be_bytes());
    p.extend_from_slice(&1i16.to_be_bytes());
    p.extend_from_slice(&0i16.to_be_bytes());
    make_box(b"edts", &make_full_box(b"elst", 0, 0, &p))
}

fn mdhd(spec: &TrackSpec, duration: u64) -> Vec<u8> {
    let mut p = Vec::new();
    p.extend_from_slice(&[0u8; 8]);
    p.extend_from_slice(&spec.timescale.to_be_bytes());
    p.extend_from_slice(&(duration as u32).to_be_bytes());
    p.extend_from_slice(&0x55C4u16.to_be_bytes()); // "und"
    p.extend_from_slice(&[0u8; 2]);
    make_full_box(b"mdhd", 0, 0, &p)
}

fn hdlr(media_type: MediaType) -> Vec<u8> {
    let (handler, name): (&[u8; 4], &[u8]) = match media_type {
        MediaType::Audio => (b"soun", b"SoundHandler\0"),
        _ => (b"vide", b"VideoHandler\0"),
    };
    let mut p = Vec::new();
    p.extend_from_slice(&[0u8; 4]);
    p.extend_from_slice(handler);
    p.extend_from_slice(&[0u8; 12]);
    p.extend_from_slice(name);
    make_full_box(b"hdlr", 0, 0, &p)
}

fn sinf(original: &[u8; 4]) -> Vec<u8> {
    let frma = make_box(b"frma", original);
    let mut schm = Vec::new();
    schm.extend_from_slice(b"cenc");
    schm.extend_from_slice(&0x0001_0000u32.to_be_bytes());
    let schm = make_full_box(b"schm", 0, 0, &schm);
    let mut tenc = vec![0u8, 0u8, 1u8, 8u8];
    tenc.extend_from_slice(&TEST_KID);
    let schi = make_box(b"schi", &make_full_box(b"tenc", 0, 0, &tenc));
    make_box(b"sinf", &[frma, schm, schi].concat())
}

fn sample_entry(spec: &TrackSpec) -> Vec<u8> {
    let mut body = vec![0u8; 6];
    body.extend_from_slice(&1u16.to_be_bytes());
    match spec.media_type {
        MediaType::Audio => {
            body.extend_from_slice(&[0u8; 8]); // version + revision + vendor
            body.extend_from_slice(&2u16.to_be_bytes());
            body.extend_from_slice(&16u16.to_be_bytes());
            body.extend_from_slice(&[0u8; 4]);
            body.extend_from_slice(&(spec.timescale << 16).to_be_bytes());
            if spec.protected {
                body.extend(sinf(b"mp4a"));
                make_box(b"enca", &body)
            } else {
                make_box(b"mp4a", &body)
            }
        }
        _ => {
            body.extend_from_slice(&[0u8; 16]);
            body.extend_from_slice(&320u16.to_be_bytes());
            body.extend_from_slice(&240u16.to_be_bytes());
            body.extend_from_slice(&0x0048_0000u32.to_be_bytes());
            body.extend_from_slice(&0x0048_0000u32.to_be_bytes());
            body.extend_from_slice(&[0u8; 4]);
            body.extend_from_slice(&1u16.to_be_bytes());
            body.extend_from_slice(&[0u8; 32]);
            body.extend_from_slice(&0x0018u16.to_be_bytes());
            body.extend_from_slice(&(-1i16).to_be_bytes());
            body.extend(make_box(b"avcC", &[1, 0x64, 0, 0x1F, 0xFF, 0xE0, 0]));
            if spec.protected {
                body.extend(sinf(b"avc1"));
                make_box(b"encv", &body)
            } else {
                make_box(b"avc1", &body)
            }
        }
    }
}

/// 采样表; `chunk_offsets` 为 None 时写空表 (分片 init)
fn stbl(spec: &TrackSpec, chunk_offsets: Option<&[u64]>) -> Vec<u8> {
    let mut stsd = 1u32.to_be_bytes().to_vec();
    stsd.extend(sample_entry(spec));
    let mut out = make_full_box(b"stsd", 0, 0, &stsd);

    let count = if chunk_offsets.is_some() { spec.sample_count } else { 0 };

    let mut stts = Vec::new();
    if count > 0 {
        stts.extend_from_slice(&1u32.to_be_bytes());
        stts.extend_from_slice(&(count as u32).to_be_bytes());
        stts.extend_from_slice(&spec.sample_duration.to_be_bytes());
    } else {
        stts.extend_from_slice(&0u32.to_be_bytes());
    }
    out.extend(make_full_box(b"stts", 0, 0, &stts));

    if count > 0 && !spec.cts_pattern.is_empty() {
        let mut ctts = (count as u32).to_be_bytes().to_vec();
        for i in 0..count {
            ctts.extend_from_slice(&1u32.to_be_bytes());
            ctts.extend_from_slice(&spec.cts(i).to_be_bytes());
        }
        out.extend(make_full_box(b"ctts", 1, 0, &ctts));
    }

    if count > 0 {
        if let Some(n) = spec.sync_every {
            let syncs: Vec<u32> = (0..count).step_by(n).map(|i| i as u32 + 1).collect();
            let mut stss = (syncs.len() as u32).to_be_bytes().to_vec();
            for s in syncs {
                stss.extend_from_slice(&s.to_be_bytes());
            }
            out.extend(make_full_box(b"stss", 0, 0, &stss));
        }
    }

    let mut stsc = Vec::new();
    if count > 0 {
        let full_chunks = count / spec.samples_per_chunk;
        let rest = count % spec.samples_per_chunk;
        let mut entries: Vec<(u32, u32)> = Vec::new();
        if full_chunks > 0 {
            entries.push((1, spec.samples_per_chunk as u32));
        }
        if rest > 0 {
            entries.push((full_chunks as u32 + 1, rest as u32));
        }
        stsc.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for (first_chunk, per_chunk) in entries {
            stsc.extend_from_slice(&first_chunk.to_be_bytes());
            stsc.extend_from_slice(&per_chunk.to_be_bytes());
            stsc.extend_from_slice(&1u32.to_be_bytes());
        }
    } else {
        stsc.extend_from_slice(&0u32.to_be_bytes());
    }
    out.extend(make_full_box(b"stsc", 0, 0, &stsc));

    let mut stsz = Vec::new();
    stsz.extend_from_slice(&(if count > 0 { spec.sample_size } else { 0 }).to_be_bytes());
    stsz.extend_from_slice(&(count as u32).to_be_bytes());
    out.extend(make_full_box(b"stsz", 0, 0, &stsz));

    let offsets = chunk_offsets.unwrap_or(&[]);
    let mut stco = (offsets.len() as u32).to_be_bytes().to_vec();
    for &o in offsets {
        stco.extend_from_slice(&(o as u32).to_be_bytes());
    }
    out.extend(make_full_box(b"stco", 0, 0, &stco));

    make_box(b"stbl", &out)
}

fn trak(spec: &TrackSpec, chunk_offsets: Option<&[u64]>) -> Vec<u8> {
    let media_header = match spec.media_type {
        MediaType::Audio => make_full_box(b"smhd", 0, 0, &[0u8; 4]),
        _ => make_full_box(b"vmhd", 0, 1, &[0u8; 8]),
    };
    let duration = if chunk_offsets.is_some() { spec.duration_ticks() } else { 0 };
    let minf = make_box(b"minf", &[media_header, stbl(spec, chunk_offsets)].concat());
    let mdia = make_box(
        b"mdia",
        &[mdhd(spec, duration), hdlr(spec.media_type), minf].concat(),
    );
    make_box(b"trak", &[tkhd(spec), edts(spec), mdia].concat())
}

/// 按块交错的 mdat 内容, 返回 (内容, 每条轨道每个块相对内容起点的偏移)
fn interleave(tracks: &[TrackSpec]) -> (Vec<u8>, Vec<Vec<u64>>) {
    let mut payload = Vec::new();
    let mut offsets = vec![Vec::new(); tracks.len()];
    let max_chunks = tracks.iter().map(TrackSpec::chunk_count).max().unwrap_or(0);
    for chunk in 0..max_chunks {
        for (t, spec) in tracks.iter().enumerate() {
            if chunk >= spec.chunk_count() {
                continue;
            }
            offsets[t].push(payload.len() as u64);
            let first = chunk * spec.samples_per_chunk;
            for i in first..first + spec.chunk_len(chunk) {
                payload.extend(sample_payload(spec.track_id, i, spec.sample_size));
            }
        }
    }
    (payload, offsets)
}

fn moov(tracks: &[TrackSpec], chunk_offsets: &[Vec<u64>], base: u64) -> Vec<u8> {
    let duration = tracks.iter().map(movie_duration).max().unwrap_or(0);
    let next_id = tracks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1;
    let mut body = mvhd(duration, next_id);
    for (spec, offsets) in tracks.iter().zip(chunk_offsets) {
        let absolute: Vec<u64> = offsets.iter().map(|o| o + base).collect();
        body.extend(trak(spec, Some(&absolute)));
    }
    make_box(b"moov", &body)
}

/// 构造渐进式 (非分片) 文件
pub fn build_progressive(tracks: &[TrackSpec], layout: Layout) -> Vec<u8> {
    let ftyp = ftyp(b"isom", &[b"isom", b"iso2", b"avc1", b"mp41"]);
    let (payload, chunk_offsets) = interleave(tracks);
    let mdat = make_box(b"mdat", &payload);

    match layout {
        Layout::MoovFirst => {
            let moov_len = moov(tracks, &chunk_offsets, 0).len() as u64;
            let base = ftyp.len() as u64 + moov_len + 8;
            [ftyp, moov(tracks, &chunk_offsets, base), mdat].concat()
        }
        Layout::MdatFirst => {
            let base = ftyp.len() as u64 + 8;
            [ftyp, mdat, moov(tracks, &chunk_offsets, base)].concat()
        }
    }
}

/// 分片 trun 的数据起点写法
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BaseMode {
    /// 没有 base_data_offset 也没有 data_offset, 起点是数据 box 内容起点
    Implicit,
    /// default-base-is-moof + trun data_offset
    MoofRelative,
    /// tfhd base_data_offset 写绝对偏移
    Explicit,
}

/// 一个分片 (moof + mdat)
#[derive(Debug, Clone)]
pub struct FragmentSpec {
    pub sequence: u32,
    /// (轨道号, 本分片的采样数)
    pub tracks: Vec<(u32, usize)>,
    pub base_mode: BaseMode,
    /// mdat 先于 moof
    pub data_first: bool,
    /// 写 tfdt
    pub with_tfdt: bool,
    /// 加密轨道用 saiz/saio 代替 senc (saio 偏移相对 moof 起点, 不与 Explicit 搭配)
    pub aux_via_saio: bool,
    /// tfdt 额外偏移 (制造时间倒退)
    pub tfdt_shift: i64,
    /// Explicit 时写入的 base_data_offset, 代替真实偏移
    pub base_override: Option<u64>,
    /// senc/saiz 声明的条目数, 代替真实采样数
    pub aux_count_override: Option<u32>,
}

impl FragmentSpec {
    pub fn new(sequence: u32, tracks: &[(u32, usize)]) -> Self {
        Self {
            sequence,
            tracks: tracks.to_vec(),
            base_mode: BaseMode::MoofRelative,
            data_first: false,
            with_tfdt: true,
            aux_via_saio: false,
            tfdt_shift: 0,
            base_override: None,
            aux_count_override: None,
        }
    }

    pub fn base(mut self, mode: BaseMode) -> Self {
        self.base_mode = mode;
        self
    }

    pub fn data_first(mut self) -> Self {
        self.data_first = true;
        self
    }

    pub fn without_tfdt(mut self) -> Self {
        self.with_tfdt = false;
        self
    }

    pub fn aux_via_saio(mut self) -> Self {
        self.aux_via_saio = true;
        self
    }

    pub fn with_tfdt_shift(mut self, shift: i64) -> Self {
        self.tfdt_shift = shift;
        self
    }

    /// 写入指定的 base_data_offset (制造越界偏移)
    pub fn with_base_data_offset(mut self, base: u64) -> Self {
        self.base_mode = BaseMode::Explicit;
        self.base_override = Some(base);
        self
    }

    /// senc/saiz 声明指定的条目数 (制造损坏的加密信息)
    pub fn with_aux_count(mut self, count: u32) -> Self {
        self.aux_count_override = Some(count);
        self
    }
}

fn mvex(tracks: &[TrackSpec], fragment_duration: u64) -> Vec<u8> {
    let mut body = make_full_box(b"mehd", 0, 0, &(fragment_duration as u32).to_be_bytes());
    for spec in tracks {
        let mut trex = Vec::new();
        trex.extend_from_slice(&spec.track_id.to_be_bytes());
        trex.extend_from_slice(&1u32.to_be_bytes());
        trex.extend_from_slice(&spec.sample_duration.to_be_bytes());
        trex.extend_from_slice(&spec.sample_size.to_be_bytes());
        trex.extend_from_slice(&0u32.to_be_bytes());
        body.extend(make_full_box(b"trex", 0, 0, &trex));
    }
    make_box(b"mvex", &body)
}

/// 分片初始化段 (ftyp + moov, 轨道没有采样)
pub fn build_init_segment(tracks: &[TrackSpec], fragment_duration: u64) -> Vec<u8> {
    let next_id = tracks.iter().map(|t| t.track_id).max().unwrap_or(0) + 1;
    let mut body = mvhd(0, next_id);
    for spec in tracks {
        body.extend(trak(spec, None));
    }
    body.extend(mvex(tracks, fragment_duration));
    if tracks.iter().any(|t| t.protected) {
        body.extend(pssh_box());
    }
    [ftyp(b"iso6", &[b"iso6", b"dash", b"cmfc"]), make_box(b"moov", &body)].concat()
}

/// Widevine 系统 ID 的测试 pssh
pub fn pssh_box() -> Vec<u8> {
    let mut p = vec![
        0xED, 0xEF, 0x8B, 0xA9, 0x79, 0xD6, 0x4A, 0xCE, 0xA3, 0xC8, 0x27, 0xDC, 0xD5, 0x1D, 0x21, 0xED,
    ];
    p.extend_from_slice(&1u32.to_be_bytes());
    p.extend_from_slice(&TEST_KID);
    p.extend_from_slice(&4u32.to_be_bytes());
    p.extend_from_slice(b"test");
    make_full_box(b"pssh", 1, 0, &p)
}

/// 各轨道的构造进度
struct FragmentCursor {
    next_sample: Vec<usize>,
    decode_time: Vec<u64>,
}

struct TrafPlan<'a> {
    spec: &'a TrackSpec,
    first: usize,
    count: usize,
    /// 相对 mdat 内容起点
    data_offset: u64,
}

fn traf(
    plan: &TrafPlan<'_>,
    fragment: &FragmentSpec,
    decode_time: u64,
    moof_offset: u64,
    payload_start: u64,
    aux_offset: Option<u64>,
) -> Vec<u8> {
    let spec = plan.spec;
    let mut tfhd = spec.track_id.to_be_bytes().to_vec();
    let tfhd_flags = match fragment.base_mode {
        BaseMode::Implicit => 0,
        BaseMode::MoofRelative => 0x0002_0000,
        BaseMode::Explicit => {
            let base = fragment
                .base_override
                .unwrap_or(payload_start + plan.data_offset);
            tfhd.extend_from_slice(&base.to_be_bytes());
            0x0000_0001
        }
    };
    let mut body = make_full_box(b"tfhd", 0, tfhd_flags, &tfhd);

    if fragment.with_tfdt {
        let time = (decode_time as i64 + fragment.tfdt_shift).max(0) as u64;
        body.extend(make_full_box(b"tfdt", 1, 0, &time.to_be_bytes()));
    }

    let mut trun_flags = 0x0100 | 0x0200 | 0x0400;
    let mut trun = (plan.count as u32).to_be_bytes().to_vec();
    if fragment.base_mode == BaseMode::MoofRelative {
        trun_flags |= 0x0001;
        let rel = payload_start as i64 + plan.data_offset as i64 - moof_offset as i64;
        trun.extend_from_slice(&(rel as i32).to_be_bytes());
    }
    if !spec.cts_pattern.is_empty() {
        trun_flags |= 0x0800;
    }
    for i in plan.first..plan.first + plan.count {
        trun.extend_from_slice(&spec.sample_duration.to_be_bytes());
        trun.extend_from_slice(&spec.sample_size.to_be_bytes());
        let flags: u32 = if spec.is_sync(i) { 0x0200_0000 } else { 0x0101_0000 };
        trun.extend_from_slice(&flags.to_be_bytes());
        if !spec.cts_pattern.is_empty() {
            trun.extend_from_slice(&spec.cts(i).to_be_bytes());
        }
    }
    body.extend(make_full_box(b"trun", 0, trun_flags, &trun));

    if spec.protected {
        let mut ivs = Vec::new();
        for i in plan.first..plan.first + plan.count {
            ivs.extend_from_slice(&sample_iv(spec.track_id, i));
        }
        let aux_count = fragment.aux_count_override.unwrap_or(plan.count as u32);
        if fragment.aux_via_saio {
            let mut saiz = vec![8u8];
            saiz.extend_from_slice(&aux_count.to_be_bytes());
            body.extend(make_full_box(b"saiz", 0, 0, &saiz));
            let mut saio = 1u32.to_be_bytes().to_vec();
            saio.extend_from_slice(&(aux_offset.unwrap_or(0) as u32).to_be_bytes());
            body.extend(make_full_box(b"saio", 0, 0, &saio));
            // 附加信息放在 moof 内的一个 free box 中
            body.extend(make_box(b"free", &ivs));
        } else {
            let mut senc = aux_count.to_be_bytes().to_vec();
            senc.extend_from_slice(&ivs);
            body.extend(make_full_box(b"senc", 0, 0, &senc));
        }
    }
    make_box(b"traf", &body)
}

fn moof(
    plans: &[TrafPlan<'_>],
    fragment: &FragmentSpec,
    decode_times: &[u64],
    moof_offset: u64,
    payload_start: u64,
    aux_offsets: &[Option<u64>],
) -> Vec<u8> {
    let mut body = make_full_box(b"mfhd", 0, 0, &fragment.sequence.to_be_bytes());
    for (i, plan) in plans.iter().enumerate() {
        body.extend(traf(
            plan,
            fragment,
            decode_times[i],
            moof_offset,
            payload_start,
            aux_offsets[i],
        ));
    }
    make_box(b"moof", &body)
}

/// saio 写的偏移 (相对 moof 起点): 每个 traf 末尾 free box 的内容
fn aux_offsets(plans: &[TrafPlan<'_>], fragment: &FragmentSpec, decode_times: &[u64]) -> Vec<Option<u64>> {
    let mut offsets = Vec::with_capacity(plans.len());
    // moof 头部 + mfhd
    let mut pos = 8u64 + 16;
    for (i, plan) in plans.iter().enumerate() {
        let traf_len = traf(plan, fragment, decode_times[i], 0, 0, Some(0)).len() as u64;
        if plan.spec.protected && fragment.aux_via_saio {
            let ivs_len = plan.count as u64 * 8;
            offsets.push(Some(pos + traf_len - ivs_len));
        } else {
            offsets.push(None);
        }
        pos += traf_len;
    }
    offsets
}

/// 构造分片文件: init 段 + 若干 moof/mdat
///
/// 每个分片内的采样接续该轨道上一个分片.
pub fn build_fragmented(init_tracks: &[TrackSpec], fragments: &[FragmentSpec]) -> Vec<u8> {
    let mut durations = vec![0u64; init_tracks.len()];
    for fragment in fragments {
        for &(id, n) in &fragment.tracks {
            if let Some(t) = init_tracks.iter().position(|s| s.track_id == id) {
                durations[t] += n as u64 * u64::from(init_tracks[t].sample_duration);
            }
        }
    }
    let fragment_duration = init_tracks
        .iter()
        .zip(&durations)
        .map(|(spec, &d)| d * u64::from(MOVIE_TIMESCALE) / u64::from(spec.timescale))
        .max()
        .unwrap_or(0);

    let mut out = build_init_segment(init_tracks, fragment_duration);
    let mut cursor = FragmentCursor {
        next_sample: vec![0; init_tracks.len()],
        decode_time: vec![0; init_tracks.len()],
    };

    for fragment in fragments {
        out.extend(build_fragment(init_tracks, fragment, &mut cursor, out.len() as u64));
    }
    out
}

fn build_fragment(
    init_tracks: &[TrackSpec],
    fragment: &FragmentSpec,
    cursor: &mut FragmentCursor,
    offset: u64,
) -> Vec<u8> {
    let mut plans = Vec::new();
    let mut decode_times = Vec::new();
    let mut payload = Vec::new();
    let mut indices = Vec::new();
    for &(id, count) in &fragment.tracks {
        let Some(t) = init_tracks.iter().position(|s| s.track_id == id) else {
            continue;
        };
        let spec = &init_tracks[t];
        let first = cursor.next_sample[t];
        plans.push(TrafPlan {
            spec,
            first,
            count,
            data_offset: payload.len() as u64,
        });
        for i in first..first + count {
            payload.extend(sample_payload(spec.track_id, i, spec.sample_size));
        }
        decode_times.push(cursor.decode_time[t]);
        indices.push(t);
    }

    let aux = aux_offsets(&plans, fragment, &decode_times);
    let moof_len = moof(&plans, fragment, &decode_times, 0, 0, &aux).len() as u64;
    let mdat = make_box(b"mdat", &payload);
    let bytes = if fragment.data_first {
        let payload_start = offset + 8;
        let moof_offset = offset + mdat.len() as u64;
        let moof = moof(&plans, fragment, &decode_times, moof_offset, payload_start, &aux);
        [mdat, moof].concat()
    } else {
        let moof_offset = offset;
        let payload_start = offset + moof_len + 8;
        let moof = moof(&plans, fragment, &decode_times, moof_offset, payload_start, &aux);
        [moof, mdat].concat()
    };

    for (plan, t) in plans.iter().zip(indices) {
        cursor.next_sample[t] += plan.count;
        cursor.decode_time[t] += plan.count as u64 * u64::from(plan.spec.sample_duration);
    }
    bytes
}

/// 输出通道记录的事件
#[derive(Debug, Clone)]
pub enum OutputEvent {
    Format(Stream),
    Segment { stream_index: usize, segment: Segment },
    Packet(Packet),
    Eos { stream_index: usize },
}

/// 多个通道共享的事件记录
#[derive(Debug, Clone, Default)]
pub struct Collected(Arc<Mutex<Vec<OutputEvent>>>);

impl Collected {
    fn push(&self, event: OutputEvent) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }

    /// 所有事件 (按发生顺序)
    pub fn events(&self) -> Vec<OutputEvent> {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// 所有数据包
    pub fn packets(&self) -> Vec<Packet> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Packet(p) => Some(p),
                _ => None,
            })
            .collect()
    }

    /// 某条流的数据包
    pub fn packets_of(&self, stream_index: usize) -> Vec<Packet> {
        self.packets()
            .into_iter()
            .filter(|p| p.stream_index == stream_index)
            .collect()
    }

    /// 某条流收到的时间段通告
    pub fn segments_of(&self, stream_index: usize) -> Vec<Segment> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Segment {
                    stream_index: i,
                    segment,
                } if i == stream_index => Some(segment),
                _ => None,
            })
            .collect()
    }

    /// 收到结束信号的流
    pub fn eos_streams(&self) -> Vec<usize> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Eos { stream_index } => Some(stream_index),
                _ => None,
            })
            .collect()
    }

    /// 收到格式通告的流
    pub fn formats(&self) -> Vec<Stream> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Format(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

/// 记录所有事件的输出通道
pub struct CollectingOutput {
    stream_index: usize,
    sink: Collected,
    /// 对数据包返回的结果
    pub packet_result: FlowResult,
}

impl CollectingOutput {
    pub fn new(stream_index: usize, sink: Collected) -> Self {
        Self {
            stream_index,
            sink,
            packet_result: FlowResult::Ok,
        }
    }

    /// 按需为每条流建立记录通道的输出管理器
    pub fn manager() -> (OutputManager, Collected) {
        let sink = Collected::default();
        let shared = sink.clone();
        let manager = OutputManager::with_factory(move |stream: &Stream| {
            Box::new(CollectingOutput::new(stream.index, shared.clone())) as Box<dyn TrackOutput>
        });
        (manager, sink)
    }
}

impl TrackOutput for CollectingOutput {
    fn on_format(&mut self, stream: &Stream) -> FlowResult {
        self.sink.push(OutputEvent::Format(stream.clone()));
        FlowResult::Ok
    }

    fn on_segment(&mut self, segment: &Segment) -> FlowResult {
        self.sink.push(OutputEvent::Segment {
            stream_index: self.stream_index,
            segment: *segment,
        });
        FlowResult::Ok
    }

    fn on_packet(&mut self, packet: Packet) -> FlowResult {
        self.sink.push(OutputEvent::Packet(packet));
        self.packet_result
    }

    fn on_eos(&mut self) -> FlowResult {
        self.sink.push(OutputEvent::Eos {
            stream_index: self.stream_index,
        });
        FlowResult::Ok
    }
}
