//! 分片 MP4 (fMP4) 解析.
//!
//! 初始化段的 mvex 给出每条轨道的默认值 (trex) 与总时长 (mehd).
//! 每个 moof 由若干 traf 组成, 每个 traf 描述一条轨道的一段采样:
//! - tfhd: 基准偏移与默认值
//! - tfdt: 基准解码时间
//! - trun: 一段连续存放的采样 (大小/时长/标志/合成偏移)
//! - senc/saiz/saio: 加密附加信息
//!
//! trun 的数据起点有三种来源:
//! 1. tfhd 给出 base-data-offset: 绝对偏移
//! 2. default-base-is-moof 或 trun 带 data-offset: 相对 moof 起点
//! 3. 都没有: 第一段从数据 box (mdat) 的内容起点开始, 之后紧跟上一段
//!
//! 第 3 种情况在推模式下要等数据 box 到达 (或与之前保留的数据配对)
//! 才能确定绝对偏移, 所以解析结果先用 [`RunStart::DataRelative`] 表示.

use bitflags::bitflags;
use bytes::Bytes;
use isodemux_core::{ByteReader, IsoError, IsoResult};
use log::{debug, warn};

use super::box_tree::{BoxTree, NodeId};
use super::boxes::{BoxType, UuidKind};
use super::protection::{
    ProtectionSystem, SaizBox, SampleAuxInfo, parse_pssh, parse_saio, parse_saiz, parse_senc,
};
use super::sample_table::IndexEntry;
use super::track::Track;

bitflags! {
    /// tfhd 标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TfhdFlags: u32 {
        const BASE_DATA_OFFSET         = 0x0000_0001;
        const SAMPLE_DESCRIPTION_INDEX = 0x0000_0002;
        const DEFAULT_SAMPLE_DURATION  = 0x0000_0008;
        const DEFAULT_SAMPLE_SIZE      = 0x0000_0010;
        const DEFAULT_SAMPLE_FLAGS     = 0x0000_0020;
        const DURATION_IS_EMPTY        = 0x0001_0000;
        const DEFAULT_BASE_IS_MOOF     = 0x0002_0000;
    }
}

bitflags! {
    /// trun 标志
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrunFlags: u32 {
        const DATA_OFFSET        = 0x0000_0001;
        const FIRST_SAMPLE_FLAGS = 0x0000_0004;
        const SAMPLE_DURATION    = 0x0000_0100;
        const SAMPLE_SIZE        = 0x0000_0200;
        const SAMPLE_FLAGS       = 0x0000_0400;
        const SAMPLE_CTS_OFFSET  = 0x0000_0800;
    }
}

/// 采样标志中的 "非同步采样" 位
pub const SAMPLE_IS_NON_SYNC: u32 = 0x0001_0000;

/// 轨道默认值 (trex)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TrexDefaults {
    pub track_id: u32,
    pub default_sample_description_index: u32,
    pub default_sample_duration: u32,
    pub default_sample_size: u32,
    pub default_sample_flags: u32,
}

/// 解析 trex
pub fn parse_trex(payload: &[u8]) -> IsoResult<TrexDefaults> {
    let mut r = ByteReader::new(payload);
    r.read_full_box_header()?;
    Ok(TrexDefaults {
        track_id: r.read_u32()?,
        default_sample_description_index: r.read_u32()?,
        default_sample_duration: r.read_u32()?,
        default_sample_size: r.read_u32()?,
        default_sample_flags: r.read_u32()?,
    })
}

/// 影片扩展 (mvex)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MovieExtends {
    /// 分片总时长 (mehd, 影片时间刻度)
    pub fragment_duration: Option<u64>,
    pub trex: Vec<TrexDefaults>,
}

impl MovieExtends {
    /// 从 mvex 节点解析
    pub fn parse(tree: &BoxTree, mvex: NodeId) -> IsoResult<Self> {
        let mut ext = Self::default();
        for &child in tree.children(mvex) {
            let payload = tree.payload(child);
            match tree.node(child).box_type {
                BoxType::Trex => ext.trex.push(parse_trex(payload)?),
                BoxType::Mehd => {
                    let mut r = ByteReader::new(payload);
                    let (version, _) = r.read_full_box_header()?;
                    ext.fragment_duration = Some(r.read_u32_or_u64(version == 1)?);
                }
                _ => {}
            }
        }
        Ok(ext)
    }

    /// 查找轨道默认值
    pub fn trex_for(&self, track_id: u32) -> Option<&TrexDefaults> {
        self.trex.iter().find(|t| t.track_id == track_id)
    }
}

/// 一个已追加分片在轨道索引中的范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentSpan {
    pub moof_offset: u64,
    pub sequence: u32,
    pub first_sample: usize,
    pub sample_count: usize,
}

/// 分片扩展状态
#[derive(Debug, Clone, Default)]
pub struct FragmentState {
    pub trex: TrexDefaults,
    pub last_sequence: Option<u32>,
    /// 已追加的分片, 按追加顺序
    pub spans: Vec<FragmentSpan>,
}

impl FragmentState {
    pub fn new(trex: TrexDefaults) -> Self {
        Self {
            trex,
            last_sequence: None,
            spans: Vec::new(),
        }
    }

    /// 是否已经追加过该 moof
    pub fn contains_moof(&self, moof_offset: u64) -> bool {
        self.spans.iter().rev().any(|s| s.moof_offset == moof_offset)
    }

    /// 包含采样位置 `position` 的分片
    pub fn span_for(&self, position: usize) -> Option<&FragmentSpan> {
        let idx = self.spans.partition_point(|s| s.first_sample <= position);
        let span = self.spans.get(idx.checked_sub(1)?)?;
        (position < span.first_sample + span.sample_count).then_some(span)
    }
}

/// tfhd (Track Fragment Header)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TfhdBox {
    pub track_id: u32,
    pub flags: TfhdFlags,
    pub base_data_offset: Option<u64>,
    pub sample_description_index: Option<u32>,
    pub default_sample_duration: Option<u32>,
    pub default_sample_size: Option<u32>,
    pub default_sample_flags: Option<u32>,
}

/// 解析 tfhd
pub fn parse_tfhd(payload: &[u8]) -> IsoResult<TfhdBox> {
    let mut r = ByteReader::new(payload);
    let (_, raw_flags) = r.read_full_box_header()?;
    let flags = TfhdFlags::from_bits_truncate(raw_flags);
    let track_id = r.read_u32()?;
    let base_data_offset = if flags.contains(TfhdFlags::BASE_DATA_OFFSET) {
        Some(r.read_u64()?)
    } else {
        None
    };
    let mut opt = |flag: TfhdFlags| -> IsoResult<Option<u32>> {
        if flags.contains(flag) {
            r.read_u32().map(Some)
        } else {
            Ok(None)
        }
    };
    let sample_description_index = opt(TfhdFlags::SAMPLE_DESCRIPTION_INDEX)?;
    let default_sample_duration = opt(TfhdFlags::DEFAULT_SAMPLE_DURATION)?;
    let default_sample_size = opt(TfhdFlags::DEFAULT_SAMPLE_SIZE)?;
    let default_sample_flags = opt(TfhdFlags::DEFAULT_SAMPLE_FLAGS)?;

    Ok(TfhdBox {
        track_id,
        flags,
        base_data_offset,
        sample_description_index,
        default_sample_duration,
        default_sample_size,
        default_sample_flags,
    })
}

/// trun 中的一个采样 (已应用默认值)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrunSample {
    pub duration: u32,
    pub size: u32,
    pub flags: u32,
    pub cts_offset: i32,
}

impl TrunSample {
    pub fn is_sync(&self) -> bool {
        self.flags & SAMPLE_IS_NON_SYNC == 0
    }
}

/// 一段采样的数据起点
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStart {
    /// 绝对偏移
    Absolute(u64),
    /// 相对数据 box 内容起点的偏移
    DataRelative(u64),
}

impl RunStart {
    fn advance(self, len: u64) -> Option<Self> {
        Some(match self {
            Self::Absolute(x) => Self::Absolute(x.checked_add(len)?),
            Self::DataRelative(x) => Self::DataRelative(x.checked_add(len)?),
        })
    }

    /// 给定数据 box 内容起点时的绝对偏移, 溢出时返回 None
    pub fn resolve(self, data_base: u64) -> Option<u64> {
        match self {
            Self::Absolute(x) => Some(x),
            Self::DataRelative(x) => data_base.checked_add(x),
        }
    }
}

/// 一段 trun
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackRun {
    /// trun 自带的 data-offset
    pub data_offset: Option<i32>,
    pub start: RunStart,
    pub samples: Vec<TrunSample>,
}

impl TrackRun {
    /// 数据总字节数
    pub fn byte_len(&self) -> u64 {
        self.samples.iter().map(|s| u64::from(s.size)).sum()
    }
}

/// 一个 traf
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackFragment {
    pub tfhd: TfhdBox,
    pub base_decode_time: Option<u64>,
    pub runs: Vec<TrackRun>,
    /// senc 内容与是否为 PIFF 变体
    pub senc: Option<(Bytes, bool)>,
    pub saiz: Option<SaizBox>,
    pub saio: Vec<u64>,
}

impl TrackFragment {
    /// 采样总数
    pub fn sample_count(&self) -> usize {
        self.runs.iter().map(|r| r.samples.len()).sum()
    }

    /// saio 偏移的基准: 与数据偏移相同
    pub fn aux_base(&self, moof_offset: u64) -> u64 {
        self.tfhd.base_data_offset.unwrap_or(moof_offset)
    }
}

/// 单个 trun 的采样数上限
const MAX_RUN_SAMPLES: usize = 1 << 20;

fn parse_trun(payload: &[u8], tfhd: &TfhdBox, trex: &TrexDefaults) -> IsoResult<(Option<i32>, Vec<TrunSample>)> {
    let mut r = ByteReader::new(payload);
    let (_, raw_flags) = r.read_full_box_header()?;
    let flags = TrunFlags::from_bits_truncate(raw_flags);
    let count = r.read_u32()? as usize;
    if count > MAX_RUN_SAMPLES {
        return Err(IsoError::InvalidData(format!(
            "trun 采样数 {} 超过上限 {}",
            count, MAX_RUN_SAMPLES
        )));
    }

    let data_offset = if flags.contains(TrunFlags::DATA_OFFSET) {
        Some(r.read_i32()?)
    } else {
        None
    };
    let first_sample_flags = if flags.contains(TrunFlags::FIRST_SAMPLE_FLAGS) {
        Some(r.read_u32()?)
    } else {
        None
    };

    let per_sample = [
        TrunFlags::SAMPLE_DURATION,
        TrunFlags::SAMPLE_SIZE,
        TrunFlags::SAMPLE_FLAGS,
        TrunFlags::SAMPLE_CTS_OFFSET,
    ]
    .iter()
    .filter(|&&f| flags.contains(f))
    .count()
        * 4;
    if count.saturating_mul(per_sample) > r.remaining() {
        return Err(IsoError::Truncated {
            needed: count.saturating_mul(per_sample),
            available: r.remaining(),
        });
    }

    let default_duration = tfhd
        .default_sample_duration
        .unwrap_or(trex.default_sample_duration);
    let default_size = tfhd.default_sample_size.unwrap_or(trex.default_sample_size);
    let default_flags = tfhd.default_sample_flags.unwrap_or(trex.default_sample_flags);

    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        let duration = if flags.contains(TrunFlags::SAMPLE_DURATION) {
            r.read_u32()?
        } else {
            default_duration
        };
        let size = if flags.contains(TrunFlags::SAMPLE_SIZE) {
            r.read_u32()?
        } else {
            default_size
        };
        let mut sample_flags = if flags.contains(TrunFlags::SAMPLE_FLAGS) {
            r.read_u32()?
        } else {
            default_flags
        };
        if i == 0 {
            if let Some(f) = first_sample_flags {
                sample_flags = f;
            }
        }
        // version 0 按规范无符号, 与 ctts 一样按有符号读取
        let cts_offset = if flags.contains(TrunFlags::SAMPLE_CTS_OFFSET) {
            r.read_i32()?
        } else {
            0
        };
        samples.push(TrunSample {
            duration,
            size,
            flags: sample_flags,
            cts_offset,
        });
    }
    Ok((data_offset, samples))
}

/// 一个 moof
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MovieFragment {
    /// moof 起点的绝对偏移
    pub offset: u64,
    /// moof 大小
    pub size: u64,
    /// mfhd 序号
    pub sequence: u32,
    pub trafs: Vec<TrackFragment>,
    /// moof 内的 pssh
    pub protection_systems: Vec<ProtectionSystem>,
}

impl MovieFragment {
    /// 解析一个完整的 moof
    ///
    /// 子树损坏的 traf 被跳过, 其他 traf 照常使用.
    pub fn parse(data: Bytes, offset: u64, mvex: Option<&MovieExtends>) -> IsoResult<Self> {
        let size = data.len() as u64;
        let tree = BoxTree::parse(data, offset);
        let root = tree
            .root()
            .filter(|&r| tree.node(r).box_type == BoxType::Moof)
            .ok_or_else(|| IsoError::structural(offset, BoxType::Moof, None, "不是 moof"))?;

        let mut moof = Self {
            offset,
            size,
            sequence: 0,
            trafs: Vec::new(),
            protection_systems: Vec::new(),
        };

        for &child in tree.children(root) {
            let node = tree.node(child);
            match node.box_type {
                BoxType::Mfhd => {
                    let mut r = ByteReader::new(tree.payload(child));
                    r.read_full_box_header()?;
                    moof.sequence = r.read_u32()?;
                }
                BoxType::Traf => {
                    if tree.subtree_has_defect(child) {
                        warn!("分片 {}: traf (偏移 {}) 结构损坏, 跳过", offset, node.offset);
                        continue;
                    }
                    match parse_traf(&tree, child, mvex) {
                        Ok(traf) => moof.trafs.push(traf),
                        Err(e) => warn!("分片 {}: traf 解析失败, 跳过: {}", offset, e),
                    }
                }
                BoxType::Pssh => moof
                    .protection_systems
                    .push(parse_pssh(tree.payload(child), false)?),
                BoxType::Uuid if node.user_type.as_ref().map(UuidKind::from_uuid) == Some(UuidKind::PiffPssh) => {
                    moof.protection_systems
                        .push(parse_pssh(tree.payload(child), true)?);
                }
                _ => {}
            }
        }

        moof.resolve_run_starts();
        debug!(
            "分片: 偏移={} 序号={} traf 数={}",
            offset,
            moof.sequence,
            moof.trafs.len()
        );
        Ok(moof)
    }

    /// 按 moof 内出现顺序确定每段 trun 的数据起点
    ///
    /// 偏移越界 (负数或超出 u64) 的 traf 整个丢弃.
    fn resolve_run_starts(&mut self) {
        let moof_offset = self.offset;
        let mut prev_end: Option<RunStart> = None;
        self.trafs.retain_mut(|traf| {
            match resolve_traf_runs(traf, moof_offset, &mut prev_end) {
                Ok(()) => true,
                Err(e) => {
                    warn!("分片 {}: 丢弃 traf: {}", moof_offset, e);
                    false
                }
            }
        });
    }

    /// 是否有需要数据 box 才能定位的 trun
    pub fn has_implicit_runs(&self) -> bool {
        self.trafs
            .iter()
            .flat_map(|t| &t.runs)
            .any(|r| matches!(r.start, RunStart::DataRelative(_)))
    }

    /// 所有 trun 数据的绝对字节范围
    pub fn byte_ranges(&self, data_base: u64) -> Vec<(u64, u64)> {
        self.trafs
            .iter()
            .flat_map(|t| &t.runs)
            .filter(|r| !r.samples.is_empty())
            .filter_map(|r| {
                let start = r.start.resolve(data_base)?;
                Some((start, start.checked_add(r.byte_len())?))
            })
            .collect()
    }
}

/// 确定一个 traf 内每段 trun 的起点, `prev_end` 是上一段的终点
fn resolve_traf_runs(
    traf: &mut TrackFragment,
    moof_offset: u64,
    prev_end: &mut Option<RunStart>,
) -> IsoResult<()> {
    let track_id = traf.tfhd.track_id;
    let explicit_base = match traf.tfhd.base_data_offset {
        Some(base) => Some(base),
        None if traf.tfhd.flags.contains(TfhdFlags::DEFAULT_BASE_IS_MOOF) => Some(moof_offset),
        None => None,
    };
    let mut cursor = *prev_end;
    for (i, run) in traf.runs.iter_mut().enumerate() {
        let start = match (run.data_offset, explicit_base) {
            (Some(d), base) => base
                .unwrap_or(moof_offset)
                .checked_add_signed(i64::from(d))
                .map(RunStart::Absolute),
            (None, Some(base)) if i == 0 => Some(RunStart::Absolute(base)),
            (None, _) => Some(cursor.unwrap_or(RunStart::DataRelative(0))),
        };
        let (Some(start), Some(end)) = (start, start.and_then(|s| s.advance(run.byte_len()))) else {
            return Err(IsoError::structural(
                moof_offset,
                BoxType::Trun,
                Some(track_id),
                "trun 数据范围超出可寻址偏移",
            ));
        };
        run.start = start;
        cursor = Some(end);
    }
    *prev_end = cursor;
    Ok(())
}

fn parse_traf(tree: &BoxTree, traf: NodeId, mvex: Option<&MovieExtends>) -> IsoResult<TrackFragment> {
    let tfhd_id = tree
        .child(traf, BoxType::Tfhd)
        .ok_or_else(|| IsoError::structural(tree.node(traf).offset, BoxType::Traf, None, "缺少 tfhd"))?;
    let tfhd = parse_tfhd(tree.payload(tfhd_id))?;
    let trex = match mvex.and_then(|m| m.trex_for(tfhd.track_id)) {
        Some(t) => *t,
        None => {
            debug!("轨道 {}: 没有 trex, 使用零默认值", tfhd.track_id);
            TrexDefaults {
                track_id: tfhd.track_id,
                ..Default::default()
            }
        }
    };

    let mut frag = TrackFragment {
        tfhd,
        ..Default::default()
    };
    for &child in tree.children(traf) {
        let node = tree.node(child);
        let payload = tree.payload(child);
        match node.box_type {
            BoxType::Tfdt => {
                let mut r = ByteReader::new(payload);
                let (version, _) = r.read_full_box_header()?;
                frag.base_decode_time = Some(r.read_u32_or_u64(version == 1)?);
            }
            BoxType::Trun => {
                let (data_offset, samples) = parse_trun(payload, &tfhd, &trex)?;
                frag.runs.push(TrackRun {
                    data_offset,
                    start: RunStart::DataRelative(0),
                    samples,
                });
            }
            BoxType::Senc => frag.senc = Some((tree.payload_bytes(child), false)),
            BoxType::Uuid => {
                if node.user_type.as_ref().map(UuidKind::from_uuid) == Some(UuidKind::PiffSampleEncryption) {
                    frag.senc = Some((tree.payload_bytes(child), true));
                }
            }
            BoxType::Saiz => frag.saiz = Some(parse_saiz(payload)?),
            BoxType::Saio => frag.saio = parse_saio(payload)?,
            _ => {}
        }
    }
    Ok(frag)
}

/// 由 senc 得到本 traf 的逐采样加密信息
pub fn senc_aux(track: &Track, traf: &TrackFragment) -> IsoResult<Option<Vec<SampleAuxInfo>>> {
    let (Some(state), Some((data, piff))) = (track.extensions.protection(), traf.senc.as_ref()) else {
        return Ok(None);
    };
    parse_senc(data, state.track.default_iv_size, *piff, traf.sample_count()).map(Some)
}

/// 追加结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    /// 已追加若干采样
    Appended(usize),
    /// 该 moof 已经追加过
    Duplicate,
    /// 早于解码游标, 丢弃
    Dropped,
}

/// 把一个 traf 的采样追加到轨道索引
///
/// # 参数
/// - `data_base`: 数据 box 内容起点, 用于解析相对起点的 trun
/// - `aux`: 逐采样加密信息 (来自 senc 或 saiz/saio)
pub fn append_track_fragment(
    track: &mut Track,
    moof: &MovieFragment,
    traf: &TrackFragment,
    data_base: u64,
    aux: Option<Vec<SampleAuxInfo>>,
) -> AppendOutcome {
    if let Some(state) = track.extensions.fragment() {
        if state.contains_moof(moof.offset) {
            return AppendOutcome::Duplicate;
        }
    }

    let base_dts = traf.base_decode_time.unwrap_or(track.decode_cursor);
    if base_dts < track.decode_cursor {
        warn!(
            "轨道 {}: 分片 {} 的起始解码时间 {} 早于游标 {}, 丢弃",
            track.track_id, moof.sequence, base_dts, track.decode_cursor
        );
        return AppendOutcome::Dropped;
    }

    // 先确认所有偏移与时间都能表示, 再修改索引
    let run_starts: Option<Vec<u64>> = traf
        .runs
        .iter()
        .map(|run| {
            let start = run.start.resolve(data_base)?;
            start.checked_add(run.byte_len()).map(|_| start)
        })
        .collect();
    let end_dts = traf
        .runs
        .iter()
        .flat_map(|r| &r.samples)
        .try_fold(base_dts, |dts, s| dts.checked_add(u64::from(s.duration)));
    let (Some(run_starts), Some(_)) = (run_starts, end_dts) else {
        warn!(
            "{}",
            IsoError::structural(
                moof.offset,
                BoxType::Traf,
                Some(track.track_id),
                "采样偏移或解码时间溢出, 丢弃该 traf",
            )
        );
        return AppendOutcome::Dropped;
    };

    let aux_base = match (aux, track.extensions.protection_mut()) {
        (Some(aux), Some(state)) => {
            let base = state.samples.len();
            let n = aux.len();
            state.samples.extend(aux);
            Some((base, n))
        }
        _ => None,
    };

    let first_sample = track.index.len();
    let mut dts = base_dts;
    let mut k = 0usize;
    for (run, start) in traf.runs.iter().zip(run_starts) {
        let mut offset = start;
        for s in &run.samples {
            let aux = aux_base.and_then(|(base, n)| (k < n).then(|| (base + k) as u32));
            track.index.push(IndexEntry {
                offset,
                size: s.size,
                dts,
                cts_offset: s.cts_offset,
                duration: s.duration,
                sync: s.is_sync(),
                aux,
            });
            offset += u64::from(s.size);
            dts += u64::from(s.duration);
            k += 1;
        }
    }
    track.decode_cursor = dts;

    if let Some(state) = track.extensions.fragment_mut() {
        if let Some(last) = state.last_sequence {
            if moof.sequence <= last {
                warn!(
                    "轨道 {}: 分片序号 {} 未大于上一个 {}",
                    track.track_id, moof.sequence, last
                );
            }
        }
        state.last_sequence = Some(moof.sequence);
        state.spans.push(FragmentSpan {
            moof_offset: moof.offset,
            sequence: moof.sequence,
            first_sample,
            sample_count: k,
        });
    }

    debug!(
        "轨道 {}: 追加分片 {} 共 {} 个采样, 解码游标 {}",
        track.track_id, moof.sequence, k, dts
    );
    AppendOutcome::Appended(k)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DemuxConfig;
    use crate::demuxer::Demuxer;
    use crate::demuxers::mp4::Mp4Demuxer;
    use crate::io::IoContext;
    use crate::test_support::{TrackSpec, build_init_segment, make_box, make_full_box};

    fn tfhd_payload(flags: u32, track_id: u32, extra: &[u32]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&track_id.to_be_bytes());
        for v in extra {
            p.extend_from_slice(&v.to_be_bytes());
        }
        make_full_box(b"tfhd", 0, flags, &p)
    }

    fn trun_box(flags: u32, data_offset: Option<i32>, samples: &[(u32, u32)]) -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&(samples.len() as u32).to_be_bytes());
        if let Some(d) = data_offset {
            p.extend_from_slice(&d.to_be_bytes());
        }
        for &(duration, size) in samples {
            p.extend_from_slice(&duration.to_be_bytes());
            p.extend_from_slice(&size.to_be_bytes());
        }
        make_full_box(b"trun", 0, flags, &p)
    }

    #[test]
    fn test_解析_tfhd_默认值() {
        let payload = tfhd_payload(0x0002_0018, 3, &[1000, 512]);
        let tfhd = parse_tfhd(&payload[8..]).unwrap();
        assert_eq!(tfhd.track_id, 3);
        assert!(tfhd.flags.contains(TfhdFlags::DEFAULT_BASE_IS_MOOF));
        assert_eq!(tfhd.default_sample_duration, Some(1000));
        assert_eq!(tfhd.default_sample_size, Some(512));
        assert_eq!(tfhd.base_data_offset, None);
    }

    #[test]
    fn test_解析_moof_隐式起点() {
        // 两个 traf 都没有基准偏移: 第二个紧跟第一个
        let mut traf1 = tfhd_payload(0, 1, &[]);
        traf1.extend_from_slice(&make_full_box(b"tfdt", 0, 0, &0u32.to_be_bytes()));
        traf1.extend_from_slice(&trun_box(0x300, None, &[(100, 10), (100, 20)]));
        let mut traf2 = tfhd_payload(0, 2, &[]);
        traf2.extend_from_slice(&trun_box(0x300, None, &[(50, 5)]));
        let mut body = make_full_box(b"mfhd", 0, 0, &7u32.to_be_bytes());
        body.extend_from_slice(&make_box(b"traf", &traf1));
        body.extend_from_slice(&make_box(b"traf", &traf2));
        let moof_bytes = make_box(b"moof", &body);

        let moof = MovieFragment::parse(Bytes::from(moof_bytes), 1000, None).unwrap();
        assert_eq!(moof.sequence, 7);
        assert_eq!(moof.trafs.len(), 2);
        assert!(moof.has_implicit_runs());
        assert_eq!(moof.trafs[0].runs[0].start, RunStart::DataRelative(0));
        assert_eq!(moof.trafs[1].runs[0].start, RunStart::DataRelative(30));
        assert_eq!(moof.byte_ranges(5000), vec![(5000, 5030), (5030, 5035)]);
    }

    #[test]
    fn test_解析_moof_相对_moof_起点() {
        let mut traf = tfhd_payload(0x0002_0000, 1, &[]);
        traf.extend_from_slice(&trun_box(0x301, Some(200), &[(100, 10), (100, 20)]));
        traf.extend_from_slice(&trun_box(0x300, None, &[(100, 30)]));
        let moof_bytes = make_box(b"moof", &make_box(b"traf", &traf));

        let moof = MovieFragment::parse(Bytes::from(moof_bytes), 4096, None).unwrap();
        assert!(!moof.has_implicit_runs());
        assert_eq!(moof.trafs[0].runs[0].start, RunStart::Absolute(4296));
        assert_eq!(moof.trafs[0].runs[1].start, RunStart::Absolute(4326));
    }

    #[test]
    fn test_解析_moof_基准偏移溢出丢弃traf() {
        // base-data-offset 接近 u64::MAX, 两个采样的终点越界
        let base = u64::MAX - 4;
        let mut bad = tfhd_payload(0x1, 1, &[(base >> 32) as u32, base as u32]);
        bad.extend_from_slice(&trun_box(0x300, None, &[(100, 10), (100, 10)]));
        let mut good = tfhd_payload(0x0002_0000, 2, &[]);
        good.extend_from_slice(&trun_box(0x301, Some(64), &[(100, 8)]));
        let mut body = make_full_box(b"mfhd", 0, 0, &1u32.to_be_bytes());
        body.extend_from_slice(&make_box(b"traf", &bad));
        body.extend_from_slice(&make_box(b"traf", &good));

        let moof = MovieFragment::parse(Bytes::from(make_box(b"moof", &body)), 0, None).unwrap();
        assert_eq!(moof.trafs.len(), 1);
        assert_eq!(moof.trafs[0].tfhd.track_id, 2);
        assert_eq!(moof.byte_ranges(0), vec![(64, 72)]);
    }

    #[test]
    fn test_解析_moof_负数据偏移丢弃traf() {
        let mut traf = tfhd_payload(0x0002_0000, 1, &[]);
        traf.extend_from_slice(&trun_box(0x301, Some(-200), &[(100, 10)]));
        let moof_bytes = make_box(b"moof", &make_box(b"traf", &traf));

        let moof = MovieFragment::parse(Bytes::from(moof_bytes), 100, None).unwrap();
        assert!(moof.trafs.is_empty());
    }

    #[test]
    fn test_解析_trun_采样数超过上限() {
        // 没有逐采样字段时, 采样数不受剩余字节约束
        let mut p = Vec::new();
        p.extend_from_slice(&u32::MAX.to_be_bytes());
        let trun = make_full_box(b"trun", 0, 0, &p);
        let err = parse_trun(&trun[8..], &TfhdBox::default(), &TrexDefaults::default()).unwrap_err();
        assert!(matches!(err, IsoError::InvalidData(_)));
    }

    #[test]
    fn test_追加_相对起点溢出时丢弃() {
        let mut traf = tfhd_payload(0, 1, &[]);
        traf.extend_from_slice(&trun_box(0x300, None, &[(100, 10), (100, 10)]));
        let moof_bytes = make_box(b"moof", &make_box(b"traf", &traf));
        let moof = MovieFragment::parse(Bytes::from(moof_bytes), 0, None).unwrap();

        let init = build_init_segment(&[TrackSpec::video(1, 0)], 0);
        let mut io = IoContext::from_memory(init);
        let mut demuxer = Mp4Demuxer::new(DemuxConfig::default());
        demuxer.open(&mut io).unwrap();
        let track = &mut demuxer.tracks[0];
        let outcome = append_track_fragment(track, &moof, &moof.trafs[0], u64::MAX - 4, None);
        assert_eq!(outcome, AppendOutcome::Dropped);
        assert!(track.index.is_empty());
        assert_eq!(track.decode_cursor, 0);
    }

    #[test]
    fn test_分片范围查找() {
        let mut state = FragmentState::default();
        state.spans.push(FragmentSpan {
            moof_offset: 100,
            sequence: 1,
            first_sample: 0,
            sample_count: 10,
        });
        state.spans.push(FragmentSpan {
            moof_offset: 900,
            sequence: 2,
            first_sample: 10,
            sample_count: 5,
        });
        assert_eq!(state.span_for(3).unwrap().moof_offset, 100);
        assert_eq!(state.span_for(10).unwrap().moof_offset, 900);
        assert!(state.span_for(15).is_none());
        assert!(state.contains_moof(900));
    }
}
