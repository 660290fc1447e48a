//! 轨道记录.
//!
//! 一个 [`Track`] 对应 moov 中的一个 trak: 头部信息 (tkhd/mdhd/hdlr/elst),
//! 采样描述, 采样索引, 以及读取游标. 分片、加密、快进、HDR 等可选能力
//! 以扩展的形式挂在轨道上, 按 [`FeatureTag`] 索引, 没有的能力不占空间.

use std::collections::BTreeMap;

use bytes::Bytes;
use isodemux_codec::Packet;
use isodemux_core::timestamp::cmp_ticks;
use isodemux_core::{ByteReader, IsoError, IsoResult, MediaType, Rational};
use log::{debug, warn};

use super::box_tree::{BoxTree, NodeId};
use super::boxes::BoxType;
use super::fragment::FragmentState;
use super::protection::{SampleAuxInfo, TrackProtection};
use super::sample_entry::{EntryParams, SampleDescription, parse_stsd};
use super::sample_table::{IndexEntry, SampleIndex, SampleTableBoxes, build_index};
use crate::stream::{
    AudioStreamParams, HdrMetadata, Stream, StreamParams, SubtitleStreamParams,
    VideoStreamParams,
};

/// 影片头部 (mvhd)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MovieHeader {
    /// 影片时间刻度
    pub timescale: u32,
    /// 影片时长 (影片时间刻度)
    pub duration: u64,
    /// 创建时间 (1904 纪元秒)
    pub creation_time: u64,
    pub next_track_id: u32,
}

impl Default for MovieHeader {
    fn default() -> Self {
        Self {
            timescale: 1000,
            duration: 0,
            creation_time: 0,
            next_track_id: 0,
        }
    }
}

/// 解析 mvhd
pub fn parse_mvhd(payload: &[u8]) -> IsoResult<MovieHeader> {
    let mut r = ByteReader::new(payload);
    let (version, _) = r.read_full_box_header()?;
    let wide = version == 1;
    let creation_time = r.read_u32_or_u64(wide)?;
    let _modification_time = r.read_u32_or_u64(wide)?;
    let timescale = r.read_u32()?;
    let duration = r.read_u32_or_u64(wide)?;
    // rate + volume + reserved + matrix + pre_defined
    r.skip(4 + 2 + 10 + 36 + 24)?;
    let next_track_id = r.read_u32()?;
    Ok(MovieHeader {
        timescale: if timescale == 0 { 1000 } else { timescale },
        duration: normalize_duration(duration, wide),
        creation_time,
        next_track_id,
    })
}

/// 全 1 的时长表示未知
fn normalize_duration(duration: u64, wide: bool) -> u64 {
    if (!wide && duration == u64::from(u32::MAX)) || duration == u64::MAX {
        0
    } else {
        duration
    }
}

/// 轨道头部 (tkhd)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackHeader {
    pub track_id: u32,
    pub enabled: bool,
    /// 时长 (影片时间刻度)
    pub duration: u64,
    /// 显示宽高 (16.16 定点数的整数部分)
    pub width: u32,
    pub height: u32,
}

/// 解析 tkhd
pub fn parse_tkhd(payload: &[u8]) -> IsoResult<TrackHeader> {
    let mut r = ByteReader::new(payload);
    let (version, flags) = r.read_full_box_header()?;
    let wide = version == 1;
    r.read_u32_or_u64(wide)?; // creation_time
    r.read_u32_or_u64(wide)?; // modification_time
    let track_id = r.read_u32()?;
    r.skip(4)?; // reserved
    let duration = r.read_u32_or_u64(wide)?;
    // reserved + layer + alternate_group + volume + reserved + matrix
    r.skip(8 + 2 + 2 + 2 + 2 + 36)?;
    let width = r.read_fixed16_16()?;
    let height = r.read_fixed16_16()?;
    Ok(TrackHeader {
        track_id,
        enabled: flags & 1 != 0,
        duration: normalize_duration(duration, wide),
        width,
        height,
    })
}

/// 媒体头部 (mdhd)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaHeader {
    pub timescale: u32,
    pub duration: u64,
    /// ISO 639-2/T 语言代码
    pub language: String,
}

/// 解析 mdhd
pub fn parse_mdhd(payload: &[u8]) -> IsoResult<MediaHeader> {
    let mut r = ByteReader::new(payload);
    let (version, _) = r.read_full_box_header()?;
    let wide = version == 1;
    r.read_u32_or_u64(wide)?;
    r.read_u32_or_u64(wide)?;
    let timescale = r.read_u32()?;
    let duration = r.read_u32_or_u64(wide)?;
    let lang = r.read_u16()?;
    Ok(MediaHeader {
        timescale,
        duration: normalize_duration(duration, wide),
        language: decode_language(lang),
    })
}

/// 解码 mdhd 的打包语言代码 (3 × 5 bit, 每个字符 + 0x60)
fn decode_language(packed: u16) -> String {
    if packed == 0 || packed == 0x7FFF {
        return "und".into();
    }
    (0..3)
        .rev()
        .map(|i| char::from((((packed >> (i * 5)) & 0x1F) as u8) + 0x60))
        .collect()
}

/// 处理器信息 (hdlr)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerInfo {
    pub handler_type: [u8; 4],
    pub name: String,
}

/// 解析 hdlr
pub fn parse_hdlr(payload: &[u8]) -> IsoResult<HandlerInfo> {
    let mut r = ByteReader::new(payload);
    r.read_full_box_header()?;
    r.skip(4)?; // pre_defined (QuickTime: component type)
    let handler_type = r.read_fourcc()?;
    r.skip(12)?; // reserved
    let mut name = r.read_cstring()?;
    // QuickTime 使用 Pascal 字符串
    if let Some(first) = name.chars().next() {
        if (first as usize) + 1 == name.len() {
            name.remove(0);
        }
    }
    Ok(HandlerInfo { handler_type, name })
}

/// 编辑列表条目
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EditEntry {
    /// 段时长 (影片时间刻度)
    pub segment_duration: u64,
    /// 媒体起点 (媒体时间刻度), -1 表示空编辑
    pub media_time: i64,
    /// 播放速率 (16.16 整数部分)
    pub media_rate: i16,
}

/// 编辑列表 (elst)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EditList {
    pub entries: Vec<EditEntry>,
}

impl EditList {
    /// 解析 elst
    pub fn parse(payload: &[u8]) -> IsoResult<Self> {
        let mut r = ByteReader::new(payload);
        let (version, _) = r.read_full_box_header()?;
        let wide = version == 1;
        let count = r.read_u32()? as usize;
        let entry_size = if wide { 20 } else { 12 };
        if count.saturating_mul(entry_size) > r.remaining() {
            return Err(IsoError::Truncated {
                needed: count.saturating_mul(entry_size),
                available: r.remaining(),
            });
        }
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            let segment_duration = r.read_u32_or_u64(wide)?;
            let media_time = if wide {
                r.read_i64()?
            } else {
                i64::from(r.read_i32()?)
            };
            let media_rate = r.read_i16()?;
            r.skip(2)?;
            entries.push(EditEntry {
                segment_duration,
                media_time,
                media_rate,
            });
        }
        Ok(Self { entries })
    }

    /// 显示时间偏移 (媒体时间刻度)
    ///
    /// 开头的空编辑推迟显示, 第一个非空编辑的 media_time 提前显示:
    /// `pts_显示 = pts_媒体 + offset`.
    pub fn presentation_offset(&self, movie_timescale: u32, media_timescale: u32) -> i64 {
        let mut empty = 0i64;
        for entry in &self.entries {
            if entry.media_time == -1 {
                empty += isodemux_core::timestamp::rescale_ticks(
                    entry.segment_duration as i64,
                    movie_timescale,
                    media_timescale,
                );
            } else {
                return empty - entry.media_time;
            }
        }
        empty
    }
}

/// 轨道能力标签
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FeatureTag {
    /// 分片文件 (trex 默认值, 分片序号)
    Fragmented,
    /// 通用加密
    Protection,
    /// 快进/倒放
    TrickPlay,
    /// HDR 静态元数据
    Hdr,
}

/// 加密扩展: 轨道级参数与逐采样附加信息表
#[derive(Debug, Clone, Default)]
pub struct ProtectionState {
    pub track: TrackProtection,
    /// 由 [`IndexEntry::aux`] 引用
    pub samples: Vec<SampleAuxInfo>,
}

/// 快进/倒放扩展
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrickState {
    /// 播放速率
    pub rate: f64,
    /// 同步采样步长
    pub stride: usize,
    /// 下一个输出的同步采样在同步采样表中的位置
    pub sync_cursor: usize,
    /// 倒放方向已走到开头
    pub exhausted: bool,
}

impl TrickState {
    pub fn reverse(&self) -> bool {
        self.rate < 0.0
    }
}

/// 轨道扩展
#[derive(Debug, Clone)]
pub enum TrackExtension {
    Fragmented(FragmentState),
    Protection(ProtectionState),
    TrickPlay(TrickState),
    Hdr(HdrMetadata),
}

impl TrackExtension {
    pub fn tag(&self) -> FeatureTag {
        match self {
            Self::Fragmented(_) => FeatureTag::Fragmented,
            Self::Protection(_) => FeatureTag::Protection,
            Self::TrickPlay(_) => FeatureTag::TrickPlay,
            Self::Hdr(_) => FeatureTag::Hdr,
        }
    }
}

/// 按能力标签索引的扩展集合
#[derive(Debug, Clone, Default)]
pub struct TrackExtensions {
    map: BTreeMap<FeatureTag, TrackExtension>,
}

impl TrackExtensions {
    /// 插入或替换扩展
    pub fn insert(&mut self, ext: TrackExtension) {
        self.map.insert(ext.tag(), ext);
    }

    pub fn remove(&mut self, tag: FeatureTag) -> Option<TrackExtension> {
        self.map.remove(&tag)
    }

    pub fn has(&self, tag: FeatureTag) -> bool {
        self.map.contains_key(&tag)
    }

    pub fn tags(&self) -> impl Iterator<Item = FeatureTag> + '_ {
        self.map.keys().copied()
    }

    pub fn fragment(&self) -> Option<&FragmentState> {
        match self.map.get(&FeatureTag::Fragmented) {
            Some(TrackExtension::Fragmented(s)) => Some(s),
            _ => None,
        }
    }

    pub fn fragment_mut(&mut self) -> Option<&mut FragmentState> {
        match self.map.get_mut(&FeatureTag::Fragmented) {
            Some(TrackExtension::Fragmented(s)) => Some(s),
            _ => None,
        }
    }

    pub fn protection(&self) -> Option<&ProtectionState> {
        match self.map.get(&FeatureTag::Protection) {
            Some(TrackExtension::Protection(s)) => Some(s),
            _ => None,
        }
    }

    pub fn protection_mut(&mut self) -> Option<&mut ProtectionState> {
        match self.map.get_mut(&FeatureTag::Protection) {
            Some(TrackExtension::Protection(s)) => Some(s),
            _ => None,
        }
    }

    pub fn trick(&self) -> Option<&TrickState> {
        match self.map.get(&FeatureTag::TrickPlay) {
            Some(TrackExtension::TrickPlay(s)) => Some(s),
            _ => None,
        }
    }

    pub fn trick_mut(&mut self) -> Option<&mut TrickState> {
        match self.map.get_mut(&FeatureTag::TrickPlay) {
            Some(TrackExtension::TrickPlay(s)) => Some(s),
            _ => None,
        }
    }

    pub fn hdr(&self) -> Option<&HdrMetadata> {
        match self.map.get(&FeatureTag::Hdr) {
            Some(TrackExtension::Hdr(h)) => Some(h),
            _ => None,
        }
    }
}

/// 轨道
#[derive(Debug, Clone)]
pub struct Track {
    pub track_id: u32,
    /// 对外的流索引
    pub stream_index: usize,
    pub media_type: MediaType,
    pub handler: HandlerInfo,
    pub header: TrackHeader,
    pub language: String,
    /// 媒体时间刻度
    pub timescale: u32,
    /// 媒体时长 (媒体时间刻度, 0 表示未知)
    pub duration: u64,
    pub descriptions: Vec<SampleDescription>,
    pub index: SampleIndex,
    pub edit: EditList,
    /// 显示时间偏移 (媒体时间刻度)
    pub presentation_offset: i64,
    /// 下一个输出的采样位置 (正常播放)
    pub cursor: usize,
    /// 已追加采样的解码时间终点, 新分片不能早于此值
    pub decode_cursor: u64,
    /// 已结束或在快进中静音
    pub eos: bool,
    /// 下一个输出的数据包需要标记不连续
    pub discont: bool,
    pub extensions: TrackExtensions,
}

impl Track {
    /// 从 trak 节点构建轨道
    ///
    /// 任何结构错误都返回 Err, 调用方跳过该轨道.
    pub fn from_trak(tree: &BoxTree, trak: NodeId, movie: &MovieHeader) -> IsoResult<Self> {
        let offset = tree.node(trak).offset;
        if tree.subtree_has_defect(trak) {
            return Err(IsoError::structural(offset, BoxType::Trak, None, "trak 子树结构损坏"));
        }
        let require = |path: &[BoxType], name: &str| {
            tree.find_path(trak, path)
                .ok_or_else(|| IsoError::structural(offset, BoxType::Trak, None, format!("缺少 {name}")))
        };

        let header = parse_tkhd(tree.payload(require(&[BoxType::Tkhd], "tkhd")?))?;
        let track_id = header.track_id;
        let with_id = |e: IsoError| match e {
            IsoError::Structural {
                offset,
                box_type,
                reason,
                ..
            } => IsoError::Structural {
                offset,
                box_type,
                track_id: Some(track_id),
                reason,
            },
            other => other,
        };

        let mdhd = parse_mdhd(tree.payload(require(&[BoxType::Mdia, BoxType::Mdhd], "mdhd").map_err(with_id)?))?;
        if mdhd.timescale == 0 {
            return Err(IsoError::structural(offset, BoxType::Mdhd, Some(track_id), "timescale 为 0"));
        }
        let handler = parse_hdlr(tree.payload(require(&[BoxType::Mdia, BoxType::Hdlr], "hdlr").map_err(with_id)?))?;
        let media_type = MediaType::from_handler(&handler.handler_type);

        let stbl = require(&[BoxType::Mdia, BoxType::Minf, BoxType::Stbl], "stbl").map_err(with_id)?;
        let stsd = tree
            .child(stbl, BoxType::Stsd)
            .ok_or_else(|| IsoError::structural(offset, BoxType::Stbl, Some(track_id), "缺少 stsd"))?;
        let descriptions = parse_stsd(tree.payload(stsd), media_type)?;
        if descriptions.is_empty() {
            return Err(IsoError::structural(
                tree.node(stsd).offset,
                BoxType::Stsd,
                Some(track_id),
                "没有可用的采样描述",
            ));
        }

        let tables = SampleTableBoxes::from_tree(tree, stbl).map_err(with_id)?;
        let index = build_index(&tables, track_id).map_err(|e| match e {
            IsoError::Structural {
                box_type,
                track_id,
                reason,
                ..
            } => IsoError::Structural {
                offset: tree.node(stbl).offset,
                box_type,
                track_id,
                reason,
            },
            other => other,
        })?;

        let edit = match tree.find_path(trak, &[BoxType::Edts, BoxType::Elst]) {
            Some(elst) => EditList::parse(tree.payload(elst)).unwrap_or_else(|e| {
                warn!("轨道 {}: elst 解析失败, 忽略编辑列表: {}", track_id, e);
                EditList::default()
            }),
            None => EditList::default(),
        };
        let presentation_offset = edit.presentation_offset(movie.timescale, mdhd.timescale);

        let mut extensions = TrackExtensions::default();
        if let Some(prot) = descriptions[0].protection.clone() {
            extensions.insert(TrackExtension::Protection(ProtectionState {
                track: prot,
                samples: Vec::new(),
            }));
        }
        if let EntryParams::Visual(v) = &descriptions[0].params {
            if let Some(hdr) = v.hdr {
                extensions.insert(TrackExtension::Hdr(hdr));
            }
        }

        let decode_cursor = index.end_dts();
        debug!(
            "轨道 {}: {} {} timescale={} 采样数={} 编辑偏移={}",
            track_id,
            media_type,
            descriptions[0].codec_id,
            mdhd.timescale,
            index.len(),
            presentation_offset
        );

        Ok(Self {
            track_id,
            stream_index: 0,
            media_type,
            handler,
            header,
            language: mdhd.language,
            timescale: mdhd.timescale,
            duration: mdhd.duration,
            descriptions,
            index,
            edit,
            presentation_offset,
            cursor: 0,
            decode_cursor,
            eos: false,
            discont: false,
            extensions,
        })
    }

    /// 主采样描述
    pub fn description(&self) -> &SampleDescription {
        &self.descriptions[0]
    }

    /// 是否为分片轨道
    pub fn is_fragmented(&self) -> bool {
        self.extensions.has(FeatureTag::Fragmented)
    }

    /// 已知时长 (媒体时间刻度): mdhd 声明值与索引终点中较大者
    pub fn known_duration(&self) -> u64 {
        self.duration.max(self.index.end_dts())
    }

    /// 下一个待输出的采样位置
    ///
    /// 返回 None 表示当前索引已经输出完 (分片文件可能还会追加).
    pub fn next_position(&self) -> Option<usize> {
        if self.eos {
            return None;
        }
        match self.extensions.trick() {
            Some(t) if t.exhausted => None,
            Some(t) => self.index.sync_positions().get(t.sync_cursor).copied(),
            None => (self.cursor < self.index.len()).then_some(self.cursor),
        }
    }

    /// 下一个待输出的采样条目
    pub fn next_entry(&self) -> Option<(usize, IndexEntry)> {
        let pos = self.next_position()?;
        self.index.get(pos).map(|e| (pos, *e))
    }

    /// 输出 (或跳过) 当前采样后前进
    pub fn advance(&mut self) {
        match self.extensions.trick_mut() {
            Some(t) if t.reverse() => {
                if t.sync_cursor >= t.stride {
                    t.sync_cursor -= t.stride;
                } else {
                    t.exhausted = true;
                }
            }
            Some(t) => t.sync_cursor += t.stride,
            None => self.cursor += 1,
        }
    }

    /// 比较两条轨道下一个采样的解码时间 (跨时间刻度)
    pub fn cmp_next_dts(&self, a: &IndexEntry, other: &Track, b: &IndexEntry) -> std::cmp::Ordering {
        cmp_ticks(
            a.dts as i64 + self.presentation_offset,
            self.timescale,
            b.dts as i64 + other.presentation_offset,
            other.timescale,
        )
    }

    /// 用采样数据构造数据包
    pub fn make_packet(&mut self, entry: &IndexEntry, data: Bytes) -> Packet {
        let protection = match (entry.aux, self.extensions.protection()) {
            (Some(aux), Some(state)) => state
                .samples
                .get(aux as usize)
                .map(|info| state.track.sample_protection(info)),
            _ => None,
        };
        let discont = std::mem::take(&mut self.discont);
        Packet {
            data,
            pts: entry.pts() + self.presentation_offset,
            dts: entry.dts as i64 + self.presentation_offset,
            duration: i64::from(entry.duration),
            time_base: Rational::from_timescale(self.timescale),
            stream_index: self.stream_index,
            track_id: self.track_id,
            is_keyframe: entry.sync,
            pos: entry.offset as i64,
            discont,
            protection,
        }
    }

    /// 生成对外的流描述
    pub fn to_stream(&self) -> Stream {
        let desc = self.description();
        let nb_frames = self.index.len() as u64;
        let duration = self.known_duration();
        let params = match &desc.params {
            EntryParams::Visual(v) => {
                let frame_rate = if duration > 0 && nb_frames > 0 {
                    let fps = nb_frames as f64 * f64::from(self.timescale) / duration as f64;
                    Rational::new((fps * 1000.0).round() as i32, 1000).reduce()
                } else {
                    Rational::UNDEFINED
                };
                StreamParams::Video(VideoStreamParams {
                    width: u32::from(v.width),
                    height: u32::from(v.height),
                    frame_rate,
                    sample_aspect_ratio: v.pixel_aspect,
                    color: v.color,
                    hdr: self.extensions.hdr().copied(),
                    dolby_vision: desc.dolby_vision,
                })
            }
            EntryParams::Audio(a) => StreamParams::Audio(AudioStreamParams {
                sample_rate: if a.sample_rate == 0 { self.timescale } else { a.sample_rate },
                channels: a.channels,
                bits_per_sample: a.sample_size,
                frame_size: a.samples_per_packet,
            }),
            EntryParams::Subtitle(s) => StreamParams::Subtitle(SubtitleStreamParams {
                namespace: s.namespace.clone(),
            }),
            EntryParams::Other => StreamParams::Other,
        };

        let start_time = self
            .index
            .get(0)
            .map_or(0, |e| e.pts() + self.presentation_offset);

        let mut metadata = vec![("language".to_string(), self.language.clone())];
        if !self.handler.name.is_empty() {
            metadata.push(("handler_name".to_string(), self.handler.name.clone()));
        }

        Stream {
            index: self.stream_index,
            track_id: self.track_id,
            media_type: self.media_type,
            codec_id: desc.codec_id,
            codec_tag: desc.codec_tag_str(),
            time_base: Rational::from_timescale(self.timescale),
            duration: if duration > 0 { duration as i64 } else { -1 },
            start_time,
            nb_frames,
            extra_data: desc.extra_data.clone(),
            params,
            protection: self.extensions.protection().map(|p| p.track.to_scheme()),
            metadata,
        }
    }
}
