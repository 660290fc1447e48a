//! ISO BMFF 解封装器.
//!
//! 支持 MP4 (MPEG-4 Part 14)、QuickTime MOV、3GP/3G2、Motion JPEG 2000
//! 以及分片 MP4 (DASH/CMAF). 基于 ISO 14496-12 标准.
//!
//! # Box 树结构
//! ```text
//! ftyp                  文件类型
//! moov                  影片元数据
//! ├── mvhd              影片头部 (时长, 时间刻度)
//! ├── mvex              分片默认值 (trex/mehd)
//! ├── pssh              保护系统头
//! └── trak              轨道 (每个音/视频/字幕流一个)
//!     ├── tkhd          轨道头部
//!     ├── edts/elst     编辑列表
//!     └── mdia
//!         ├── mdhd      媒体头部 (时间刻度, 时长, 语言)
//!         ├── hdlr      处理器引用 (vide/soun/subt/text)
//!         └── minf/stbl 采样表
//! moof                  分片头部
//! └── traf              轨道分片 (tfhd/tfdt/trun/senc/saiz/saio)
//! mdat                  媒体数据
//! ```
//!
//! # 两种输入方式
//! - 拉模式: 输入可随机访问. 先扫描顶层 box, 读取 moov 建立索引,
//!   之后按解码时间从各轨道取采样, 分片在索引用完时逐个加载.
//! - 推模式: 输入按块顺序到达, 由 [`push`] 中的增量解析器驱动,
//!   采样按数据到达顺序输出.

pub mod box_tree;
pub mod boxes;
pub mod fragment;
pub mod protection;
mod push;
pub mod sample_entry;
pub mod sample_table;
pub mod seek;
pub mod track;

use std::cmp::Ordering;
use std::collections::VecDeque;

use bytes::Bytes;
use isodemux_codec::Packet;
use isodemux_core::timestamp::{rescale_ticks, ticks_to_seconds};
use isodemux_core::{ByteReader, IsoError, IsoResult, MediaType};
use log::{debug, error, info, warn};

use self::box_tree::BoxTree;
use self::boxes::{BoxType, FtypBox, UuidKind, iter_boxes, read_box_header_at};
use self::fragment::{
    AppendOutcome, FragmentState, MovieExtends, MovieFragment, TrackFragment, TrexDefaults,
    append_track_fragment, senc_aux,
};
use self::protection::{ProtectionSystem, SampleAuxInfo, parse_aux_data, parse_pssh};
use self::push::PushState;
use self::sample_table::IndexEntry;
use self::track::{FeatureTag, MovieHeader, Track, TrackExtension, TrickState, parse_mvhd};
use crate::config::DemuxConfig;
use crate::demuxer::{Demuxer, SeekOutcome, SeekRequest, SeekStatus, SeekTarget};
use crate::format_id::FormatId;
use crate::io::IoContext;
use crate::output::{FlowResult, OutputManager, Segment};
use crate::probe::{FormatProbe, ProbeScore, SCORE_EXTENSION, SCORE_MAX, SCORE_BOX_TYPE};
use crate::stream::Stream;

/// 解封装状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxState {
    /// 等待 moov
    AcquiringHeader,
    /// 轨道与索引已建立, 尚未输出
    Ready,
    /// 按时间顺序输出
    Streaming,
    /// 定位中 (瞬态)
    Seeking,
    /// 快进/倒放, 只输出同步采样
    TrickPlay,
    /// 已停止 (显式停止或致命错误)
    Stopped,
}

/// 输入方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputMode {
    /// 随机访问
    Pull,
    /// 顺序到达的数据块
    Push,
}

/// 顶层数据 box (mdat) 的位置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DataBox {
    offset: u64,
    /// 内容起点
    payload_start: u64,
    /// 结束偏移 (不含), u64::MAX 表示延伸到输入末尾
    end: u64,
    /// 已经与某个 moof 配对
    claimed: bool,
}

/// ISO BMFF 解封装器
pub struct Mp4Demuxer {
    config: DemuxConfig,
    state: DemuxState,
    mode: InputMode,
    format_id: FormatId,
    ftyp: Option<FtypBox>,
    movie: MovieHeader,
    mvex: Option<MovieExtends>,
    tracks: Vec<Track>,
    streams: Vec<Stream>,
    metadata: Vec<(String, String)>,
    protection_systems: Vec<ProtectionSystem>,
    /// 拉模式: 输入总大小
    file_size: Option<u64>,
    /// 拉模式: 扫描到的 moof 偏移
    fragment_offsets: Vec<u64>,
    /// 拉模式: 下一个待加载的 moof
    next_fragment: usize,
    /// 已知的 mdat
    data_boxes: Vec<DataBox>,
    push: PushState,
    /// 已经准备好但尚未交出的数据包 (推模式)
    queue: VecDeque<Packet>,
    /// 等待索引覆盖目标的定位请求 (推模式)
    pending_seek: Option<SeekRequest>,
    /// 尚未通告给输出的时间段
    pending_segment: Option<Segment>,
    /// 上次定位 (或开始) 以来输出的采样数
    emitted_since_seek: u64,
    fatal_reported: bool,
}

impl Mp4Demuxer {
    /// 创建解封装器
    pub fn new(config: DemuxConfig) -> Self {
        Self {
            config,
            state: DemuxState::AcquiringHeader,
            mode: InputMode::Pull,
            format_id: FormatId::Mp4,
            ftyp: None,
            movie: MovieHeader::default(),
            mvex: None,
            tracks: Vec::new(),
            streams: Vec::new(),
            metadata: Vec::new(),
            protection_systems: Vec::new(),
            file_size: None,
            fragment_offsets: Vec::new(),
            next_fragment: 0,
            data_boxes: Vec::new(),
            push: PushState::default(),
            queue: VecDeque::new(),
            pending_seek: None,
            pending_segment: None,
            emitted_since_seek: 0,
            fatal_reported: false,
        }
    }

    /// 工厂函数 (注册表使用)
    pub fn create(config: DemuxConfig) -> IsoResult<Box<dyn Demuxer>> {
        Ok(Box::new(Self::new(config)))
    }

    /// 当前状态
    pub fn state(&self) -> DemuxState {
        self.state
    }

    /// 输入方式
    pub fn mode(&self) -> InputMode {
        self.mode
    }

    /// 所有轨道
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// ftyp 信息
    pub fn ftyp(&self) -> Option<&FtypBox> {
        self.ftyp.as_ref()
    }

    /// 是否为分片文件
    pub fn is_fragmented(&self) -> bool {
        self.mvex.is_some()
    }

    /// 取出尚未通告的时间段 (直接使用 `read_packet` 时由调用方转发)
    pub fn take_pending_segment(&mut self) -> Option<Segment> {
        self.pending_segment.take()
    }

    /// 停止会话, 之后的读取都返回 `Eof`
    pub fn stop(&mut self) {
        if self.state != DemuxState::Stopped {
            info!("MP4: 会话停止");
        }
        self.state = DemuxState::Stopped;
        self.queue.clear();
    }

    /// 丢弃未完成的缓冲与排队的数据包, 保留轨道与读取游标
    ///
    /// 推模式下累积器被清空, 下一个数据块视为从当前解析位置开始.
    pub fn flush(&mut self) {
        self.queue.clear();
        self.flush_push_buffers();
        debug!("MP4: 已刷新缓冲");
    }

    /// 回到初始状态 (轨道与游标全部清除), 配置不变
    pub fn reset(&mut self) {
        *self = Self::new(self.config.clone());
        debug!("MP4: 已重置");
    }

    /// 驱动到输入结束, 通过输出管理器发送所有数据
    ///
    /// 返回最后的合并流结果. 下游全部结束时提前返回.
    /// 下游正在刷新时暂停并返回 `Flushing`, 读取位置保持不变;
    /// 刷新结束后再次调用即从暂停处继续.
    pub fn run(&mut self, io: &mut IoContext, outputs: &mut OutputManager) -> IsoResult<FlowResult> {
        if self.state == DemuxState::AcquiringHeader {
            self.open(io)?;
        }
        outputs.clear_flushing();
        loop {
            match self.prepare_outputs(outputs)? {
                FlowResult::Eos => break,
                FlowResult::Flushing => {
                    info!("MP4: 下游正在刷新, 暂停输出");
                    return Ok(FlowResult::Flushing);
                }
                _ => {}
            }
            match self.read_packet(io) {
                Ok(packet) => match self.deliver(packet, outputs)? {
                    FlowResult::Eos => {
                        info!("MP4: 下游全部结束, 提前停止");
                        break;
                    }
                    FlowResult::Flushing => {
                        info!("MP4: 下游正在刷新, 暂停输出");
                        return Ok(FlowResult::Flushing);
                    }
                    _ => {}
                },
                Err(IsoError::Eof) => break,
                Err(e) => return Err(e),
            }
        }
        self.finish_outputs(outputs)
    }

    // ========================
    // 致命错误与输出
    // ========================

    /// 记录致命错误并停止会话, 每个会话只报告一次
    fn fail(&mut self, err: IsoError) -> IsoError {
        if err.is_fatal() {
            if !self.fatal_reported {
                error!("MP4: 解封装失败: {}", err);
                self.fatal_reported = true;
            }
            self.state = DemuxState::Stopped;
            self.queue.clear();
        }
        err
    }

    fn check_flow(&mut self, track_id: u32, flow: FlowResult) -> IsoResult<()> {
        if flow.is_fatal() {
            return Err(self.fail(IsoError::Downstream {
                track_id,
                flow: flow.to_string(),
            }));
        }
        Ok(())
    }

    /// 补建通道, 发送待发的时间段与格式通告, 零采样轨道立即结束
    fn prepare_outputs(&mut self, outputs: &mut OutputManager) -> IsoResult<FlowResult> {
        if self.state == DemuxState::AcquiringHeader {
            return Ok(outputs.combined());
        }
        outputs.sync_streams(&self.streams);
        if let Some(segment) = self.pending_segment.take() {
            outputs.new_segment(segment);
        }
        let mut flow = outputs.announce();
        self.check_flow(0, flow)?;

        let empty: Vec<(u32, usize)> = self
            .tracks
            .iter()
            .filter(|t| t.index.is_empty() && !t.is_fragmented())
            .map(|t| (t.track_id, t.stream_index))
            .collect();
        for (track_id, stream_index) in empty {
            if !outputs.is_eos(stream_index) {
                debug!("轨道 {}: 没有采样, 立即结束", track_id);
                flow = outputs.send_eos(stream_index);
                self.check_flow(track_id, flow)?;
            }
        }
        Ok(flow)
    }

    fn deliver(&mut self, packet: Packet, outputs: &mut OutputManager) -> IsoResult<FlowResult> {
        let track_id = packet.track_id;
        let flow = outputs.push_packet(packet);
        self.check_flow(track_id, flow)?;
        Ok(flow)
    }

    fn finish_outputs(&mut self, outputs: &mut OutputManager) -> IsoResult<FlowResult> {
        self.prepare_outputs(outputs)?;
        let flow = outputs.send_eos_all();
        self.check_flow(0, flow)?;
        info!("MP4: 输出结束 ({})", flow);
        Ok(flow)
    }

    // ========================
    // 头部解析
    // ========================

    fn open_pull(&mut self, io: &mut IoContext) -> IsoResult<()> {
        self.file_size = io.size();
        let end = self.file_size.unwrap_or(u64::MAX);
        let mut pos = 0u64;
        let mut moov: Option<(u64, Bytes)> = None;

        while pos < end {
            let Some(header) = read_box_header_at(io, pos, self.config.max_box_size)? else {
                debug!("MP4: 偏移 {} 之后不足一个 box 头部, 停止扫描", pos);
                break;
            };
            let mut size = header.resolved_size(end - pos);
            if size > end - pos {
                if header.box_type == BoxType::Moov {
                    return Err(IsoError::structural(pos, header.box_type, None, "moov 被截断"));
                }
                warn!(
                    "MP4: {} (偏移 {}) 声明 {} 字节, 超出输入末尾",
                    header.box_type, pos, size
                );
                size = end - pos;
            }

            match header.box_type {
                BoxType::Ftyp => {
                    let payload =
                        io.read_at(pos + header.header_size, (size - header.header_size) as usize)?;
                    self.set_ftyp(&payload);
                }
                BoxType::Moov if moov.is_some() => {
                    warn!("MP4: 忽略偏移 {} 处重复的 moov", pos);
                }
                BoxType::Moov => {
                    self.check_header_size(pos, header.box_type, size)?;
                    moov = Some((pos, Bytes::from(io.read_at(pos, size as usize)?)));
                }
                BoxType::Moof => self.fragment_offsets.push(pos),
                BoxType::Mdat => self.data_boxes.push(DataBox {
                    offset: pos,
                    payload_start: pos + header.header_size,
                    end: pos + size,
                    claimed: false,
                }),
                other => debug!("MP4: 跳过顶层 box {} (偏移 {}, {} 字节)", other, pos, size),
            }

            if header.extends_to_end() {
                break;
            }
            pos += size;
        }

        let Some((offset, data)) = moov else {
            return Err(IsoError::structural(0, BoxType::Moov, None, "输入中没有 moov"));
        };
        self.parse_moov(data, offset)?;
        self.claim_indexed_data();
        self.on_header_acquired();
        if !self.fragment_offsets.is_empty() {
            debug!("MP4: 共 {} 个分片", self.fragment_offsets.len());
        }
        Ok(())
    }

    /// moov 采样表引用的 mdat 不参与分片配对
    fn claim_indexed_data(&mut self) {
        for track in &self.tracks {
            for entry in track.index.entries() {
                let i = self.data_boxes.partition_point(|d| d.offset <= entry.offset);
                if let Some(d) = i.checked_sub(1).and_then(|i| self.data_boxes.get_mut(i)) {
                    if entry.offset < d.end {
                        d.claimed = true;
                    }
                }
            }
        }
    }

    fn check_header_size(&self, offset: u64, box_type: BoxType, size: u64) -> IsoResult<()> {
        if size > self.config.max_header_size {
            return Err(IsoError::SizeCeiling {
                offset,
                box_type: box_type.to_string(),
                size,
                limit: self.config.max_header_size,
            });
        }
        Ok(())
    }

    fn set_ftyp(&mut self, payload: &[u8]) {
        if self.ftyp.is_some() {
            return;
        }
        match FtypBox::parse(payload) {
            Ok(ftyp) => {
                self.format_id = FormatId::from_brand(&ftyp.major_brand);
                debug!(
                    "MP4: ftyp major_brand={} 兼容品牌={} 格式={}",
                    ftyp.major_brand_str(),
                    ftyp.compatible_brands_str(),
                    self.format_id
                );
                self.metadata
                    .push(("major_brand".into(), ftyp.major_brand_str()));
                self.metadata
                    .push(("minor_version".into(), ftyp.minor_version.to_string()));
                self.metadata
                    .push(("compatible_brands".into(), ftyp.compatible_brands_str()));
                self.ftyp = Some(ftyp);
            }
            Err(e) => warn!("MP4: ftyp 解析失败: {}", e),
        }
    }

    /// 解析完整的 moov, 建立轨道
    ///
    /// 单条轨道的结构错误只跳过该轨道; 没有任何可用轨道时返回错误.
    fn parse_moov(&mut self, data: Bytes, offset: u64) -> IsoResult<()> {
        let tree = BoxTree::parse(data, offset);
        let moov = tree
            .root()
            .filter(|&r| tree.node(r).box_type == BoxType::Moov)
            .ok_or_else(|| IsoError::structural(offset, BoxType::Moov, None, "不是 moov"))?;
        for defect in tree.defects() {
            warn!("MP4: moov 内偏移 {} 处结构损坏: {}", defect.offset, defect.reason);
        }

        let mvhd = tree
            .child(moov, BoxType::Mvhd)
            .ok_or_else(|| IsoError::structural(offset, BoxType::Moov, None, "缺少 mvhd"))?;
        self.movie = parse_mvhd(tree.payload(mvhd))?;

        if let Some(mvex) = tree.child(moov, BoxType::Mvex) {
            match MovieExtends::parse(&tree, mvex) {
                Ok(m) => self.mvex = Some(m),
                Err(e) => warn!("MP4: mvex 解析失败, 按非分片文件处理: {}", e),
            }
        }

        let mut tracks: Vec<Track> = Vec::new();
        for trak in tree.children_of_type(moov, BoxType::Trak) {
            if tracks.len() >= self.config.max_tracks {
                warn!("MP4: 轨道数达到上限 {}, 跳过其余 trak", self.config.max_tracks);
                break;
            }
            let mut track = match Track::from_trak(&tree, trak, &self.movie) {
                Ok(t) => t,
                Err(e) => {
                    error!("MP4: 跳过轨道: {}", e);
                    continue;
                }
            };
            if tracks.iter().any(|t| t.track_id == track.track_id) {
                warn!("MP4: 轨道 ID {} 重复, 跳过", track.track_id);
                continue;
            }
            if let Some(mvex) = &self.mvex {
                let trex = mvex.trex_for(track.track_id).copied().unwrap_or(TrexDefaults {
                    track_id: track.track_id,
                    ..Default::default()
                });
                track
                    .extensions
                    .insert(TrackExtension::Fragmented(FragmentState::new(trex)));
                if let Some(fragment_duration) = mvex.fragment_duration {
                    if track.duration == 0 {
                        let ticks = rescale_ticks(
                            fragment_duration as i64,
                            self.movie.timescale,
                            track.timescale,
                        );
                        track.duration = ticks.max(0) as u64;
                    }
                }
            }
            tracks.push(track);
        }

        for &child in tree.children(moov) {
            let node = tree.node(child);
            match node.box_type {
                BoxType::Pssh => self.add_protection_system(parse_pssh(tree.payload(child), false)),
                BoxType::Uuid
                    if node.user_type.as_ref().map(UuidKind::from_uuid) == Some(UuidKind::PiffPssh) =>
                {
                    self.add_protection_system(parse_pssh(tree.payload(child), true));
                }
                BoxType::Udta => {
                    let tags = parse_user_data(tree.payload(child));
                    self.metadata.extend(tags);
                }
                _ => {}
            }
        }

        if !self.config.announce_empty_tracks {
            tracks.retain(|t| {
                let keep = !t.index.is_empty() || t.is_fragmented();
                if !keep {
                    info!("MP4: 轨道 {} 没有采样, 不输出", t.track_id);
                }
                keep
            });
        }
        if tracks.is_empty() {
            return Err(IsoError::structural(offset, BoxType::Moov, None, "没有可用的轨道"));
        }
        for (i, track) in tracks.iter_mut().enumerate() {
            track.stream_index = i;
        }
        self.streams = tracks.iter().map(Track::to_stream).collect();
        self.tracks = tracks;
        Ok(())
    }

    fn add_protection_system(&mut self, parsed: IsoResult<ProtectionSystem>) {
        match parsed {
            Ok(system) => {
                if !self.protection_systems.contains(&system) {
                    debug!("MP4: 保护系统 {}", system.system_id_hex());
                    self.protection_systems.push(system);
                }
            }
            Err(e) => warn!("MP4: pssh 解析失败: {}", e),
        }
    }

    fn on_header_acquired(&mut self) {
        self.state = DemuxState::Ready;
        for stream in &self.streams {
            debug!(
                "MP4: 流 #{} 轨道 {} {} {} ({}) time_base={} 采样数={}",
                stream.index,
                stream.track_id,
                stream.media_type,
                stream.codec_id,
                stream.codec_tag,
                stream.time_base,
                stream.nb_frames
            );
        }
    }

    // ========================
    // 分片
    // ========================

    /// 拉模式: 是否需要加载下一个分片
    fn needs_fragment(&self) -> bool {
        self.next_fragment < self.fragment_offsets.len() && self.tracks.iter().any(is_dry)
    }

    fn load_next_fragment(&mut self, io: &mut IoContext) -> IsoResult<()> {
        let Some(&offset) = self.fragment_offsets.get(self.next_fragment) else {
            return Ok(());
        };
        self.next_fragment += 1;

        let Some(header) = read_box_header_at(io, offset, self.config.max_box_size)? else {
            return Ok(());
        };
        let size = header.resolved_size(self.file_size.map_or(u64::MAX, |s| s.saturating_sub(offset)));
        self.check_header_size(offset, BoxType::Moof, size)?;
        let data = io.read_at_most(offset, size as usize)?;
        if (data.len() as u64) < size {
            warn!("分片 {}: moof 被截断, 跳过", offset);
            return Ok(());
        }
        let data = Bytes::from(data);
        let moof = match MovieFragment::parse(data.clone(), offset, self.mvex.as_ref()) {
            Ok(m) => m,
            Err(e) => {
                warn!("分片 {}: 解析失败, 跳过: {}", offset, e);
                return Ok(());
            }
        };
        let data_base = self.pair_data_box(&moof);
        self.apply_fragment(&moof, &data, data_base, Some(io));
        Ok(())
    }

    /// 为 moof 选定数据 box, 返回隐式 trun 使用的内容起点
    ///
    /// 隐式起点配对规则与推模式一致: 优先取上一个 moof 与本 moof 之间
    /// 尚未配对的 mdat (数据先于头部), 否则取本 moof 之后第一个未配对的.
    /// 显式定位的 moof 只标记它覆盖的 mdat.
    fn pair_data_box(&mut self, moof: &MovieFragment) -> u64 {
        let moof_end = moof.offset.saturating_add(moof.size);
        if !moof.has_implicit_runs() {
            let ranges = moof.byte_ranges(0);
            for d in &mut self.data_boxes {
                if ranges.iter().any(|&(s, e)| s < d.end && d.payload_start < e) {
                    d.claimed = true;
                }
            }
            return moof_end.saturating_add(8);
        }

        let lower = self
            .fragment_offsets
            .iter()
            .copied()
            .filter(|&o| o < moof.offset)
            .max()
            .unwrap_or(0);
        let chosen = self
            .data_boxes
            .iter()
            .position(|d| !d.claimed && lower <= d.offset && d.end <= moof.offset)
            .or_else(|| {
                self.data_boxes
                    .iter()
                    .position(|d| !d.claimed && d.offset >= moof_end)
            });
        match chosen {
            Some(i) => {
                let d = &mut self.data_boxes[i];
                d.claimed = true;
                debug!("分片 {}: 与偏移 {} 处的数据 box 配对", moof.sequence, d.offset);
                d.payload_start
            }
            None => {
                warn!("分片 {}: 找不到未配对的数据 box, 假定紧跟在 moof 之后", moof.sequence);
                moof_end.saturating_add(8)
            }
        }
    }

    /// 把一个 moof 的所有 traf 追加到对应轨道, 返回追加的采样数
    fn apply_fragment(
        &mut self,
        moof: &MovieFragment,
        moof_data: &[u8],
        data_base: u64,
        mut io: Option<&mut IoContext>,
    ) -> usize {
        for system in &moof.protection_systems {
            if !self.protection_systems.contains(system) {
                self.protection_systems.push(system.clone());
            }
        }
        let mut appended = 0;
        for traf in &moof.trafs {
            let Some(ti) = self
                .tracks
                .iter()
                .position(|t| t.track_id == traf.tfhd.track_id)
            else {
                warn!(
                    "分片 {}: 轨道 {} 不在 moov 中, 跳过",
                    moof.sequence, traf.tfhd.track_id
                );
                continue;
            };
            let aux = self.fragment_aux(ti, moof, moof_data, traf, io.as_deref_mut());
            match append_track_fragment(&mut self.tracks[ti], moof, traf, data_base, aux) {
                AppendOutcome::Appended(n) => appended += n,
                AppendOutcome::Duplicate => {
                    debug!("分片 {}: 轨道 {} 已追加过", moof.sequence, traf.tfhd.track_id);
                }
                AppendOutcome::Dropped => {}
            }
        }
        appended
    }

    /// 分片的逐采样加密信息: 优先 senc, 其次 saiz/saio 指向的数据
    fn fragment_aux(
        &self,
        ti: usize,
        moof: &MovieFragment,
        moof_data: &[u8],
        traf: &TrackFragment,
        io: Option<&mut IoContext>,
    ) -> Option<Vec<SampleAuxInfo>> {
        let track = &self.tracks[ti];
        let iv_size = track.extensions.protection()?.track.default_iv_size;
        match senc_aux(track, traf) {
            Ok(Some(aux)) => return Some(aux),
            Ok(None) => {}
            Err(e) => {
                warn!("轨道 {}: senc 解析失败: {}", track.track_id, e);
                return None;
            }
        }

        let saiz = traf.saiz.as_ref()?;
        if saiz.sample_count as usize > traf.sample_count() {
            warn!(
                "轨道 {}: saiz 采样数 {} 多于 traf 的 {} 个采样, 忽略附加信息",
                track.track_id,
                saiz.sample_count,
                traf.sample_count()
            );
            return None;
        }
        let len = saiz.total_size();
        let range = traf
            .aux_base(moof.offset)
            .checked_add(*traf.saio.first()?)
            .and_then(|start| Some((start, start.checked_add(len)?)));
        let Some((start, end)) = range.filter(|&(_, end)| {
            len <= self.config.max_header_size && self.file_size.is_none_or(|size| end <= size)
        }) else {
            warn!(
                "{}",
                IsoError::structural(
                    moof.offset,
                    BoxType::Saio,
                    Some(track.track_id),
                    format!("附加信息范围越界 (大小 {} 字节), 忽略", len),
                )
            );
            return None;
        };
        let moof_end = moof.offset + moof_data.len() as u64;
        let data = if start >= moof.offset && end <= moof_end {
            let rel = (start - moof.offset) as usize;
            moof_data[rel..rel + len as usize].to_vec()
        } else if let Some(io) = io {
            match io.read_at(start, len as usize) {
                Ok(d) => d,
                Err(e) => {
                    warn!("轨道 {}: 读取附加信息 (偏移 {}) 失败: {}", track.track_id, start, e);
                    return None;
                }
            }
        } else {
            warn!(
                "轨道 {}: 附加信息 (偏移 {}) 不在 moof 内, 推模式下无法读取",
                track.track_id, start
            );
            return None;
        };

        match parse_aux_data(&data, saiz, iv_size) {
            Ok(aux) => Some(aux),
            Err(e) => {
                warn!("轨道 {}: 附加信息解析失败: {}", track.track_id, e);
                None
            }
        }
    }

    // ========================
    // 读取
    // ========================

    fn read_packet_pull(&mut self, io: &mut IoContext) -> IsoResult<Packet> {
        loop {
            while self.needs_fragment() {
                self.load_next_fragment(io)?;
            }
            let Some((ti, entry)) = self.select_next() else {
                return Err(IsoError::Eof);
            };
            self.tracks[ti].advance();

            let data = io.read_at_most(entry.offset, entry.size as usize)?;
            if data.len() < entry.size as usize {
                warn!(
                    "轨道 {}: 采样数据不完整 (偏移 {}, 需要 {} 字节, 只有 {} 字节), 跳过",
                    self.tracks[ti].track_id,
                    entry.offset,
                    entry.size,
                    data.len()
                );
                continue;
            }
            return Ok(self.emit(ti, &entry, Bytes::from(data)));
        }
    }

    /// 拉模式: 解码时间最早的下一个采样 (倒放时取最晚的)
    fn select_next(&self) -> Option<(usize, IndexEntry)> {
        let mut best: Option<(usize, IndexEntry)> = None;
        for (i, track) in self.tracks.iter().enumerate() {
            let Some((_, entry)) = track.next_entry() else {
                continue;
            };
            let better = match &best {
                None => true,
                Some((bi, be)) => {
                    let ord = track.cmp_next_dts(&entry, &self.tracks[*bi], be);
                    let reverse = track.extensions.trick().is_some_and(|t| t.reverse());
                    if reverse {
                        ord == Ordering::Greater
                    } else {
                        ord == Ordering::Less
                    }
                }
            };
            if better {
                best = Some((i, entry));
            }
        }
        best
    }

    fn emit(&mut self, ti: usize, entry: &IndexEntry, data: Bytes) -> Packet {
        self.emitted_since_seek += 1;
        if self.state == DemuxState::Ready {
            self.state = DemuxState::Streaming;
        }
        self.tracks[ti].make_packet(entry, data)
    }

    // ========================
    // 定位
    // ========================

    /// 参考轨道: 指定的流, 否则第一条视频轨道, 否则第一条轨道
    fn reference_track(&self, stream_index: Option<usize>) -> usize {
        stream_index.unwrap_or_else(|| {
            self.tracks
                .iter()
                .position(|t| t.media_type == MediaType::Video)
                .unwrap_or(0)
        })
    }

    /// 目标时间换算到参考轨道的时间刻度
    fn target_ticks(&self, reference: usize, stream_index: Option<usize>, timestamp: i64) -> i64 {
        match stream_index {
            Some(_) => timestamp,
            None => rescale_ticks(timestamp, 1_000_000, self.tracks[reference].timescale),
        }
    }

    /// 已加载的分片是否覆盖目标时间 (非分片轨道总是覆盖)
    fn covers(&self, reference: usize, target: i64) -> bool {
        let ref_scale = self.tracks[reference].timescale;
        self.tracks.iter().all(|t| {
            if !t.is_fragmented() {
                return true;
            }
            let t_target = rescale_ticks(target, ref_scale, t.timescale);
            !t.index.is_empty() && t.index.end_dts() as i64 + t.presentation_offset > t_target
        })
    }

    fn seek_pull(&mut self, io: &mut IoContext, request: &SeekRequest) -> IsoResult<SeekOutcome> {
        self.state = DemuxState::Seeking;
        let (reference, target) = match request.target {
            SeekTarget::Time {
                stream_index,
                timestamp,
            } => {
                let reference = self.reference_track(stream_index);
                let target = self.target_ticks(reference, stream_index, timestamp);
                while self.next_fragment < self.fragment_offsets.len()
                    && !self.covers(reference, target)
                {
                    self.load_next_fragment(io)?;
                }
                (reference, target)
            }
            SeekTarget::Byte(byte) => {
                let reference = self.reference_track(None);
                while self.next_fragment < self.fragment_offsets.len()
                    && seek::plan_byte(&self.tracks[reference].index, byte).is_none()
                {
                    self.load_next_fragment(io)?;
                }
                let track = &self.tracks[reference];
                let target = match seek::plan_byte(&track.index, byte) {
                    Some(p) => track.index.entries()[p].pts() + track.presentation_offset,
                    None => track.index.end_dts() as i64 + track.presentation_offset,
                };
                (reference, target)
            }
        };
        Ok(self.apply_seek(reference, target, request))
    }

    /// 按参考轨道的目标时间设置所有轨道的游标
    ///
    /// 参考轨道落在目标之前最近的同步采样, 其他轨道对齐到该采样的显示时间.
    fn apply_seek(&mut self, reference: usize, target: i64, request: &SeekRequest) -> SeekOutcome {
        let base_rate = self.config.trick_base_rate;
        let trick = seek::is_trick_rate(request.rate, base_rate);
        let reverse = request.rate < 0.0;
        let any = request.flags.any;

        let ref_scale = self.tracks[reference].timescale;
        let ref_plan = {
            let t = &self.tracks[reference];
            seek::plan_time(&t.index, target, t.presentation_offset, any)
        };
        let (anchor, status) = match ref_plan {
            Some(plan) => {
                let t = &self.tracks[reference];
                let pts = t.index.entries()[plan.position].pts() + t.presentation_offset;
                let status = if plan.clamped {
                    SeekStatus::Clamped
                } else {
                    SeekStatus::Done
                };
                (pts, status)
            }
            None => (target, SeekStatus::Done),
        };

        for (i, track) in self.tracks.iter_mut().enumerate() {
            let t_target = if i == reference {
                target
            } else {
                rescale_ticks(anchor, ref_scale, track.timescale)
            };
            let position = seek::plan_time(&track.index, t_target, track.presentation_offset, any)
                .map_or(track.index.len(), |p| p.position);
            track.cursor = position;
            track.eos = false;
            track.discont = true;
            track.extensions.remove(FeatureTag::TrickPlay);

            if !trick {
                continue;
            }
            if i != reference && track.media_type != MediaType::Video {
                // 快进/倒放时只输出视频 (或参考轨道) 的同步采样
                track.eos = true;
                continue;
            }
            let syncs = track.index.sync_positions();
            let stride = seek::effective_stride(syncs.len(), seek::trick_stride(request.rate, base_rate));
            let start = if reverse {
                seek::previous_sync(&track.index, position + 1)
            } else {
                seek::next_sync(&track.index, position)
            };
            let (sync_cursor, exhausted) = match start {
                Some(p) => (syncs.partition_point(|&s| s < p), false),
                None => (syncs.len(), reverse),
            };
            track.extensions.insert(TrackExtension::TrickPlay(TrickState {
                rate: request.rate,
                stride,
                sync_cursor,
                exhausted,
            }));
        }

        let seconds = ticks_to_seconds(anchor, ref_scale);
        self.pending_segment = Some(if reverse {
            Segment {
                rate: request.rate,
                start: 0.0,
                stop: Some(seconds),
                discont: true,
            }
        } else {
            Segment {
                rate: request.rate,
                start: seconds,
                stop: None,
                discont: true,
            }
        });
        self.queue.clear();
        self.emitted_since_seek = 0;
        self.state = if trick {
            DemuxState::TrickPlay
        } else {
            DemuxState::Streaming
        };
        info!(
            "MP4: 定位到 {:.3} 秒 (速率 {}, {:?})",
            seconds, request.rate, status
        );
        SeekOutcome {
            status,
            byte_offset: None,
            position: ref_plan.map(|_| seconds),
        }
    }
}

/// 分片轨道的当前索引已经输出完, 需要更多分片
fn is_dry(track: &Track) -> bool {
    track.is_fragmented()
        && !track.eos
        && track.next_position().is_none()
        && !track.extensions.trick().is_some_and(|t| t.reverse())
}

impl Demuxer for Mp4Demuxer {
    fn format_id(&self) -> FormatId {
        self.format_id
    }

    fn name(&self) -> &str {
        self.format_id.name()
    }

    fn open(&mut self, io: &mut IoContext) -> IsoResult<()> {
        if self.state != DemuxState::AcquiringHeader {
            return Err(IsoError::InvalidArgument("解封装器已经打开".into()));
        }
        let result = if io.is_seekable() {
            self.mode = InputMode::Pull;
            self.open_pull(io)
        } else {
            self.mode = InputMode::Push;
            self.open_push(io)
        };
        result.map_err(|e| self.fail(e))?;

        info!(
            "MP4: 打开完成, 格式 {}, {} 条轨道, 时长 {:?} 秒, {}",
            self.format_id,
            self.tracks.len(),
            self.duration(),
            if self.mode == InputMode::Pull {
                "拉模式"
            } else {
                "推模式"
            }
        );
        Ok(())
    }

    fn streams(&self) -> &[Stream] {
        &self.streams
    }

    fn read_packet(&mut self, io: &mut IoContext) -> IsoResult<Packet> {
        match self.state {
            DemuxState::Stopped => return Err(IsoError::Eof),
            DemuxState::AcquiringHeader if self.mode == InputMode::Pull => {
                return Err(IsoError::InvalidArgument("解封装器尚未打开".into()));
            }
            _ => {}
        }
        let result = match self.mode {
            InputMode::Pull => self.read_packet_pull(io),
            InputMode::Push => self.read_packet_push(io),
        };
        result.map_err(|e| self.fail(e))
    }

    fn seek(&mut self, io: &mut IoContext, request: &SeekRequest) -> IsoResult<SeekOutcome> {
        if self.state == DemuxState::Stopped {
            return Err(IsoError::Stopped);
        }
        if !request.rate.is_finite() || request.rate == 0.0 {
            return Err(IsoError::InvalidArgument(format!(
                "播放速率必须是非零有限值: {}",
                request.rate
            )));
        }
        if let SeekTarget::Time {
            stream_index: Some(index),
            ..
        } = request.target
        {
            if index >= self.tracks.len() && self.state != DemuxState::AcquiringHeader {
                return Err(IsoError::InvalidArgument(format!("流索引 {} 不存在", index)));
            }
        }

        let pull = self.mode == InputMode::Pull && self.state != DemuxState::AcquiringHeader;
        if pull {
            return self.seek_pull(io, request).map_err(|e| self.fail(e));
        }
        if request.rate < 0.0 {
            return Err(IsoError::Unsupported("推模式不支持倒放".into()));
        }
        if matches!(request.target, SeekTarget::Byte(_)) {
            return Err(IsoError::Unsupported("推模式不支持字节定位".into()));
        }
        self.seek_push(request).map_err(|e| self.fail(e))
    }

    fn duration(&self) -> Option<f64> {
        let movie_scale = self.movie.timescale;
        if let Some(fragment_duration) = self.mvex.as_ref().and_then(|m| m.fragment_duration) {
            if fragment_duration > 0 && movie_scale > 0 {
                return Some(ticks_to_seconds(fragment_duration as i64, movie_scale));
            }
        }
        if self.movie.duration > 0 && movie_scale > 0 {
            return Some(ticks_to_seconds(self.movie.duration as i64, movie_scale));
        }
        self.tracks
            .iter()
            .filter(|t| t.timescale > 0)
            .map(|t| ticks_to_seconds(t.known_duration() as i64, t.timescale))
            .filter(|&d| d > 0.0)
            .reduce(f64::max)
    }

    fn is_seekable(&self) -> bool {
        self.mode == InputMode::Pull
    }

    fn metadata(&self) -> &[(String, String)] {
        &self.metadata
    }

    /// moov 与 moof 中出现过的保护系统头 (按出现顺序去重)
    fn protection_systems(&self) -> &[ProtectionSystem] {
        &self.protection_systems
    }
}

/// udta 中的文本标签: QuickTime 风格的 ©xxx 与 iTunes 风格的 meta/ilst
fn parse_user_data(payload: &[u8]) -> Vec<(String, String)> {
    let mut tags = Vec::new();
    for (header, body) in iter_boxes(payload) {
        let fourcc = header.box_type.fourcc();
        if fourcc == *b"meta" {
            // MP4 的 meta 是 full box, QuickTime 的不是
            let inner = if body.get(4..8) == Some(b"hdlr".as_slice()) {
                body
            } else {
                body.get(4..).unwrap_or(&[])
            };
            for (list_header, list) in iter_boxes(inner) {
                if list_header.box_type.fourcc() != *b"ilst" {
                    continue;
                }
                for (item, item_body) in iter_boxes(list) {
                    let Some(key) = tag_key(&item.box_type.fourcc()) else {
                        continue;
                    };
                    for (data_header, data) in iter_boxes(item_body) {
                        // 类型 1 = UTF-8 文本
                        if data_header.box_type.fourcc() == *b"data"
                            && data.len() >= 8
                            && data[..4] == [0, 0, 0, 1]
                        {
                            tags.push((key.to_string(), String::from_utf8_lossy(&data[8..]).into_owned()));
                        }
                    }
                }
            }
        } else if fourcc[0] == 0xA9 {
            let Some(key) = tag_key(&fourcc) else {
                continue;
            };
            let mut r = ByteReader::new(body);
            let Ok(len) = r.read_u16() else {
                continue;
            };
            if r.skip(2).is_err() {
                continue;
            }
            if let Ok(text) = r.read_bytes(usize::from(len)) {
                tags.push((key.to_string(), String::from_utf8_lossy(text).into_owned()));
            }
        }
    }
    tags
}

fn tag_key(fourcc: &[u8; 4]) -> Option<&'static str> {
    let key = match *fourcc {
        [0xA9, b'n', b'a', b'm'] => "title",
        [0xA9, b'A', b'R', b'T'] => "artist",
        [0xA9, b'a', b'l', b'b'] => "album",
        [0xA9, b'd', b'a', b'y'] => "date",
        [0xA9, b'c', b'm', b't'] => "comment",
        [0xA9, b'g', b'e', b'n'] => "genre",
        [0xA9, b't', b'o', b'o'] => "encoder",
        [0xA9, b'w', b'r', b't'] => "composer",
        [0xA9, b'c', b'p', b'y'] | [b'c', b'p', b'r', b't'] => "copyright",
        [b'd', b'e', b's', b'c'] => "description",
        _ => return None,
    };
    Some(key)
}

/// ISO BMFF 格式探测器
pub struct Mp4Probe;

/// 没有 ftyp 时也能识别的顶层 box
const TOP_LEVEL_BOXES: &[BoxType] = &[
    BoxType::Styp,
    BoxType::Moov,
    BoxType::Moof,
    BoxType::Mdat,
    BoxType::Free,
    BoxType::Skip,
    BoxType::Wide,
    BoxType::Sidx,
];

impl FormatProbe for Mp4Probe {
    fn probe(&self, data: &[u8], filename: Option<&str>) -> Option<(FormatId, ProbeScore)> {
        let by_name = filename.and_then(FormatId::from_filename);

        if data.len() >= 8 {
            let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
            let fourcc = [data[4], data[5], data[6], data[7]];
            let box_type = BoxType::from_fourcc(&fourcc);
            let plausible_size = size == 0 || size == 1 || size >= 8;

            if plausible_size && box_type == BoxType::Ftyp && data.len() >= 12 {
                let brand = [data[8], data[9], data[10], data[11]];
                return Some((FormatId::from_brand(&brand), SCORE_MAX));
            }
            if plausible_size && TOP_LEVEL_BOXES.contains(&box_type) {
                return Some((by_name.unwrap_or(FormatId::Mp4), SCORE_BOX_TYPE));
            }
        }

        by_name.map(|id| (id, SCORE_EXTENSION))
    }
}
