//! 推模式增量解析.
//!
//! 数据块按任意大小顺序到达. 解析器只保存一个绝对偏移 `parse_pos`
//! 和 [`ChunkAdapter`] 中尚未消费的字节, 因此每次调用结束时都处于
//! 可恢复状态, box 头部被切断在两个块之间也没有影响.
//!
//! 数据 box (mdat) 的内容有两种处理方式:
//! - 索引驱动: 轨道索引已经知道这里的采样, 字节到达后直接按索引输出;
//! - 保留: 还不知道属于谁 (moov 之前的数据, 或先于 moof 到达的分片数据),
//!   复制到保留区域, 等头部到达后再回放. 保留总量受配置预算限制.

use std::collections::VecDeque;

use bytes::{Bytes, BytesMut};
use isodemux_codec::Packet;
use isodemux_core::{IsoError, IsoResult};
use log::{debug, info, warn};

use super::boxes::{BoxHeader, BoxType, HeaderParse, parse_box_header};
use super::fragment::MovieFragment;
use super::sample_table::IndexEntry;
use super::track::FeatureTag;
use super::{DataBox, DemuxState, InputMode, Mp4Demuxer};
use crate::adapter::ChunkAdapter;
use crate::demuxer::{SeekOutcome, SeekRequest, SeekTarget};
use crate::io::IoContext;
use crate::output::{FlowResult, OutputManager};

/// 当前正在消费的数据 box 内容范围
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) struct DataRegion {
    pub(super) start: u64,
    /// u64::MAX 表示延伸到输入末尾
    pub(super) end: u64,
    /// 是否复制到保留区域
    pub(super) retain: bool,
}

/// 保留区域的来源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum RetainKind {
    /// moov 之前到达的数据
    BeforeHeader,
    /// 先于 moof 到达的分片数据
    Fragment,
}

/// 一段保留下来的数据 box 内容
#[derive(Debug)]
pub(super) struct RetainedRegion {
    pub(super) start: u64,
    pub(super) data: BytesMut,
    /// 数据 box 已经完整到达
    pub(super) complete: bool,
    /// 已有头部引用这段数据
    pub(super) claimed: bool,
    pub(super) kind: RetainKind,
}

impl RetainedRegion {
    fn new(start: u64, kind: RetainKind) -> Self {
        Self {
            start,
            data: BytesMut::new(),
            complete: false,
            claimed: false,
            kind,
        }
    }

    pub(super) fn end(&self) -> u64 {
        self.start + self.data.len() as u64
    }

    pub(super) fn contains(&self, offset: u64, len: u64) -> bool {
        offset >= self.start && offset + len <= self.end()
    }
}

/// 等待数据 box 的 moof (trun 起点相对于数据 box)
#[derive(Debug)]
pub(super) struct PendingFragment {
    moof: MovieFragment,
    data: Bytes,
}

/// 推模式解析状态
#[derive(Debug, Default)]
pub(super) struct PushState {
    pub(super) adapter: ChunkAdapter,
    /// 下一个待解析字节的绝对偏移
    pub(super) parse_pos: u64,
    pub(super) region: Option<DataRegion>,
    pub(super) retained: VecDeque<RetainedRegion>,
    pub(super) pending: VecDeque<PendingFragment>,
    /// 输入已经结束
    pub(super) eos: bool,
    /// 由 `open`/`read_packet` 从 IoContext 读取数据块
    pub(super) io_driven: bool,
    /// moov 之前因超出预算而丢弃的最早偏移
    pub(super) dropped_before_header: Option<u64>,
    /// 等待上游从该偏移重新推送
    pub(super) restart_request: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Step {
    Progress,
    NeedMore,
}

impl Mp4Demuxer {
    /// 推入一个数据块, 把已经可以输出的采样发送给输出管理器
    ///
    /// 块可以在任意位置切断 (包括 box 头部中间). 返回合并后的流结果.
    pub fn push_chunk(&mut self, chunk: &[u8], outputs: &mut OutputManager) -> IsoResult<FlowResult> {
        match self.state {
            DemuxState::Stopped => return Err(IsoError::Eof),
            DemuxState::AcquiringHeader => self.mode = InputMode::Push,
            _ if self.mode == InputMode::Pull => {
                return Err(IsoError::InvalidArgument("拉模式会话不接受推入的数据".into()));
            }
            _ => {}
        }
        self.feed(chunk).map_err(|e| self.fail(e))?;
        self.drain_to(outputs)
    }

    /// moov 之前的数据超出保留预算被丢弃后, 上游需要重新推送的起点
    ///
    /// 返回 Some 时解封装器已经回到该偏移, 此前推入的剩余字节都被忽略,
    /// 下一个推入的字节视为位于该偏移.
    pub fn take_restart_offset(&mut self) -> Option<u64> {
        self.push.restart_request.take()
    }

    /// 推模式输入结束: 输出剩余采样并向所有轨道发送结束信号
    pub fn push_eos(&mut self, outputs: &mut OutputManager) -> IsoResult<FlowResult> {
        if self.state == DemuxState::Stopped {
            return Err(IsoError::Eof);
        }
        self.mode = InputMode::Push;
        self.finish_push().map_err(|e| self.fail(e))?;
        if self.drain_to(outputs)? == FlowResult::Flushing {
            return Ok(FlowResult::Flushing);
        }
        self.finish_outputs(outputs)
    }

    /// 从不可随机访问的输入读取数据块, 直到获得 moov
    pub(super) fn open_push(&mut self, io: &mut IoContext) -> IsoResult<()> {
        self.push.io_driven = true;
        while self.state == DemuxState::AcquiringHeader {
            let chunk = io.read_chunk(self.config.read_chunk_size)?;
            if chunk.is_empty() {
                self.finish_push()?;
                break;
            }
            self.feed(&chunk)?;
        }
        Ok(())
    }

    pub(super) fn read_packet_push(&mut self, io: &mut IoContext) -> IsoResult<Packet> {
        loop {
            if let Some(packet) = self.queue.pop_front() {
                return Ok(packet);
            }
            if self.push.eos {
                return Err(IsoError::Eof);
            }
            if !self.push.io_driven {
                return Err(IsoError::NeedMoreData);
            }
            let chunk = io.read_chunk(self.config.read_chunk_size)?;
            if chunk.is_empty() {
                self.finish_push()?;
            } else {
                self.feed(&chunk)?;
            }
        }
    }

    pub(super) fn flush_push_buffers(&mut self) {
        let pos = self.push.parse_pos;
        self.push.adapter.reset_to(pos);
        self.push.retained.clear();
        self.push.pending.clear();
        if let Some(region) = self.push.region.as_mut() {
            region.retain = false;
        }
    }

    /// 交出排队的数据包; 下游刷新中时其余数据包留在队列里等下一次调用
    fn drain_to(&mut self, outputs: &mut OutputManager) -> IsoResult<FlowResult> {
        outputs.clear_flushing();
        let mut flow = self.prepare_outputs(outputs)?;
        while flow != FlowResult::Flushing {
            let Some(packet) = self.queue.pop_front() else {
                break;
            };
            flow = self.deliver(packet, outputs)?;
            if flow == FlowResult::Eos {
                info!("推模式: 下游全部结束");
                break;
            }
        }
        if flow == FlowResult::Flushing {
            debug!("推模式: 下游正在刷新, {} 个数据包留在队列中", self.queue.len());
        }
        Ok(flow)
    }

    fn feed(&mut self, chunk: &[u8]) -> IsoResult<()> {
        if self.push.eos {
            warn!("推模式: 输入结束后又收到 {} 字节, 忽略", chunk.len());
            return Ok(());
        }
        self.push.adapter.push(chunk);
        self.process_push()
    }

    fn process_push(&mut self) -> IsoResult<()> {
        loop {
            self.emit_ready();
            let step = if self.push.region.is_some() {
                self.advance_region()?
            } else {
                self.parse_next_box()?
            };
            if step == Step::NeedMore {
                break;
            }
        }
        self.emit_ready();
        self.release_retained();
        self.trim_adapter();
        Ok(())
    }

    /// 丢弃已经解析过且不再被任何采样引用的字节
    fn trim_adapter(&mut self) {
        let adapter_start = self.push.adapter.offset();
        let target = self
            .tracks
            .iter()
            .filter_map(|t| t.next_entry())
            .map(|(_, e)| e.offset)
            .filter(|&o| o >= adapter_start)
            .fold(self.push.parse_pos, u64::min);
        self.push.adapter.advance_to(target);
    }

    /// 偏移最小的下一个采样
    fn lowest_pending(&self) -> Option<(usize, IndexEntry)> {
        self.tracks
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.next_entry().map(|(_, e)| (i, e)))
            .min_by_key(|(_, e)| e.offset)
    }

    /// 按数据到达顺序输出所有数据已就绪的采样
    fn emit_ready(&mut self) {
        if matches!(
            self.state,
            DemuxState::AcquiringHeader | DemuxState::Seeking | DemuxState::Stopped
        ) {
            return;
        }
        while let Some((ti, entry)) = self.lowest_pending() {
            let size = u64::from(entry.size);
            let adapter = &self.push.adapter;

            let data = if let Some(region) = self
                .push
                .retained
                .iter()
                .find(|r| r.contains(entry.offset, size))
            {
                let rel = (entry.offset - region.start) as usize;
                Bytes::copy_from_slice(&region.data[rel..rel + entry.size as usize])
            } else if entry.offset >= adapter.offset() && entry.offset + size <= adapter.end_offset() {
                let rel = (entry.offset - adapter.offset()) as usize;
                Bytes::copy_from_slice(&adapter.peek_all()[rel..rel + entry.size as usize])
            } else if entry.offset >= adapter.offset()
                || self
                    .push
                    .retained
                    .iter()
                    .any(|r| !r.complete && entry.offset >= r.start)
            {
                // 数据尚未到达
                break;
            } else {
                warn!(
                    "轨道 {}: 采样数据 (偏移 {}, {} 字节) 已不在缓冲区中, 跳过",
                    self.tracks[ti].track_id, entry.offset, entry.size
                );
                self.tracks[ti].advance();
                continue;
            };

            self.tracks[ti].advance();
            let packet = self.emit(ti, &entry, data);
            self.queue.push_back(packet);
        }
    }

    /// 消费当前数据 box 中已经到达的字节
    fn advance_region(&mut self) -> IsoResult<Step> {
        let Some(region) = self.push.region else {
            return Ok(Step::Progress);
        };
        let pos = self.push.parse_pos;
        if pos >= region.end {
            self.close_region();
            return Ok(Step::Progress);
        }
        let available_end = self.push.adapter.end_offset();
        if available_end <= pos {
            if self.push.eos {
                if region.end != u64::MAX {
                    warn!(
                        "推模式: 数据 box 被截断 (期望到 {}, 实际到 {})",
                        region.end, available_end
                    );
                }
                self.close_region();
            }
            return Ok(Step::NeedMore);
        }

        let upto = region.end.min(available_end);
        if region.retain {
            let adapter_start = self.push.adapter.offset();
            if pos < adapter_start {
                return Err(IsoError::Internal(format!(
                    "解析位置 {} 早于缓冲区起点 {}",
                    pos, adapter_start
                )));
            }
            let rel_start = (pos - adapter_start) as usize;
            let rel_end = (upto - adapter_start) as usize;
            let bytes = &self.push.adapter.peek_all()[rel_start..rel_end];
            if let Some(back) = self.push.retained.back_mut() {
                back.data.extend_from_slice(bytes);
                let kind = back.kind;
                self.enforce_budget(kind)?;
            }
        }
        self.push.parse_pos = upto;
        if upto >= region.end {
            self.close_region();
        }
        Ok(Step::Progress)
    }

    fn close_region(&mut self) {
        if let Some(region) = self.push.region.take() {
            if region.retain {
                if let Some(back) = self.push.retained.back_mut() {
                    back.complete = true;
                    debug!(
                        "推模式: 保留区域 [{}, {}) 已完整",
                        back.start,
                        back.end()
                    );
                }
            }
        }
    }

    /// 保留数据超出预算时丢弃最早的区域
    ///
    /// moov 之前的数据直接丢弃并记下偏移, 等 moov 到达后请求上游重新推送.
    /// 分片数据在自开始 (或上次定位) 以来还没有输出任何采样时无法丢弃, 返回错误.
    fn enforce_budget(&mut self, kind: RetainKind) -> IsoResult<()> {
        let limit = match kind {
            RetainKind::BeforeHeader => self.config.retained_data_budget,
            RetainKind::Fragment => self.config.fragment_buffer_budget,
        };
        loop {
            let total: u64 = self
                .push
                .retained
                .iter()
                .filter(|r| r.kind == kind)
                .map(|r| r.data.len() as u64)
                .sum();
            if total <= limit {
                return Ok(());
            }
            let before_header =
                kind == RetainKind::BeforeHeader && self.state == DemuxState::AcquiringHeader;
            if self.emitted_since_seek == 0 && !before_header {
                let offset = self
                    .push
                    .retained
                    .iter()
                    .find(|r| r.kind == kind)
                    .map_or(self.push.parse_pos, |r| r.start);
                return Err(IsoError::structural(
                    offset,
                    BoxType::Mdat,
                    None,
                    format!("缓冲的数据 {} 字节超出预算 {} 字节", total, limit),
                ));
            }

            let victim = self
                .push
                .retained
                .iter()
                .position(|r| r.kind == kind && !r.claimed && !before_header)
                .or_else(|| self.push.retained.iter().position(|r| r.kind == kind));
            let Some(idx) = victim else {
                return Ok(());
            };
            if let Some(dropped) = self.push.retained.remove(idx) {
                warn!(
                    "推模式: 缓冲超出预算 {} 字节, 丢弃区域 [{}, {})",
                    limit,
                    dropped.start,
                    dropped.end()
                );
                if before_header {
                    let earliest = self
                        .push
                        .dropped_before_header
                        .map_or(dropped.start, |s| s.min(dropped.start));
                    self.push.dropped_before_header = Some(earliest);
                }
                if !dropped.complete {
                    if let Some(region) = self.push.region.as_mut() {
                        region.retain = false;
                    }
                }
            }
        }
    }

    /// 释放已经完整且不再需要的保留区域
    fn release_retained(&mut self) {
        let header_acquired = self.state != DemuxState::AcquiringHeader;
        let tracks = &self.tracks;
        self.push.retained.retain(|r| {
            if !r.complete {
                return true;
            }
            let awaiting_header = match r.kind {
                RetainKind::BeforeHeader => !header_acquired,
                RetainKind::Fragment => !r.claimed,
            };
            if awaiting_header {
                return true;
            }
            let needed = tracks.iter().any(|t| {
                let Some((_, next)) = t.next_entry() else {
                    return false;
                };
                let last_end = t.index.entries().last().map_or(0, IndexEntry::end_offset);
                next.offset < r.end() && last_end > r.start
            });
            if !needed {
                debug!("推模式: 释放保留区域 [{}, {})", r.start, r.end());
            }
            needed
        });
    }

    fn parse_next_box(&mut self) -> IsoResult<Step> {
        let pos = self.push.parse_pos;
        let adapter_start = self.push.adapter.offset();
        let adapter_end = self.push.adapter.end_offset();
        if pos < adapter_start {
            return Err(IsoError::Internal(format!(
                "解析位置 {} 早于缓冲区起点 {}",
                pos, adapter_start
            )));
        }
        if pos >= adapter_end {
            return Ok(Step::NeedMore);
        }

        let rel = (pos - adapter_start) as usize;
        let header = {
            let data = &self.push.adapter.peek_all()[rel..];
            match parse_box_header(data, pos, self.config.max_box_size)? {
                HeaderParse::Complete(h) => h,
                HeaderParse::NeedMore(n) => {
                    debug!(
                        "推模式: 偏移 {} 处的 box 头部不完整 (需要 {} 字节, 已有 {} 字节)",
                        pos,
                        n,
                        data.len()
                    );
                    return Ok(Step::NeedMore);
                }
            }
        };
        let to_end = header.extends_to_end();

        match header.box_type {
            BoxType::Mdat => {
                let start = pos + header.header_size;
                let end = if to_end { u64::MAX } else { pos + header.size };
                self.push.parse_pos = start;
                self.open_region(pos, start, end);
            }
            BoxType::Moov | BoxType::Moof | BoxType::Ftyp | BoxType::Styp => {
                let size = if to_end {
                    if !self.push.eos {
                        return Ok(Step::NeedMore);
                    }
                    adapter_end - pos
                } else {
                    header.size
                };
                if matches!(header.box_type, BoxType::Moov | BoxType::Moof) {
                    self.check_header_size(pos, header.box_type, size)?;
                }
                if adapter_end - pos < size {
                    return Ok(Step::NeedMore);
                }
                let data =
                    Bytes::copy_from_slice(&self.push.adapter.peek_all()[rel..rel + size as usize]);
                self.push.parse_pos = pos + size;
                self.handle_header_box(&header, pos, data)?;
            }
            other => {
                debug!("推模式: 跳过 {} (偏移 {}, {} 字节)", other, pos, header.size);
                self.push.parse_pos = if to_end { u64::MAX } else { pos + header.size };
            }
        }
        Ok(Step::Progress)
    }

    /// 进入一个数据 box, 决定按索引输出还是保留
    fn open_region(&mut self, box_offset: u64, start: u64, end: u64) {
        if !self.data_boxes.iter().any(|d| d.offset == box_offset) {
            self.data_boxes.push(DataBox {
                offset: box_offset,
                payload_start: start,
                end,
                claimed: false,
            });
        }

        let retain = if self.state == DemuxState::AcquiringHeader {
            debug!("推模式: moov 之前的数据 box (偏移 {}), 保留", box_offset);
            self.push
                .retained
                .push_back(RetainedRegion::new(start, RetainKind::BeforeHeader));
            true
        } else if !self.is_fragmented() {
            false
        } else if let Some(pending) = self.push.pending.pop_front() {
            debug!(
                "分片 {}: 数据 box 到达 (偏移 {})",
                pending.moof.sequence, box_offset
            );
            self.apply_fragment(&pending.moof, &pending.data, start, None);
            self.after_append();
            false
        } else if self.tracks_need_range(start, end) {
            false
        } else {
            debug!("推模式: 数据 box (偏移 {}) 先于分片头部到达, 保留", box_offset);
            self.push
                .retained
                .push_back(RetainedRegion::new(start, RetainKind::Fragment));
            true
        };
        self.push.region = Some(DataRegion { start, end, retain });
    }

    fn tracks_need_range(&self, start: u64, end: u64) -> bool {
        self.tracks.iter().any(|t| {
            let Some((_, next)) = t.next_entry() else {
                return false;
            };
            let last_end = t.index.entries().last().map_or(0, IndexEntry::end_offset);
            next.offset < end && last_end > start
        })
    }

    fn handle_header_box(&mut self, header: &BoxHeader, offset: u64, data: Bytes) -> IsoResult<()> {
        match header.box_type {
            BoxType::Ftyp => {
                let payload = data.get(header.header_size as usize..).unwrap_or(&[]);
                self.set_ftyp(payload);
            }
            BoxType::Styp => debug!("推模式: 分段类型 box (偏移 {})", offset),
            BoxType::Moov => {
                if self.state != DemuxState::AcquiringHeader {
                    debug!("推模式: 忽略偏移 {} 处重复的 moov", offset);
                    return Ok(());
                }
                self.parse_moov(data, offset)?;
                self.on_header_acquired();
                self.on_push_header(offset)?;
            }
            BoxType::Moof => self.handle_moof(offset, data),
            _ => {}
        }
        Ok(())
    }

    fn on_push_header(&mut self, moov_offset: u64) -> IsoResult<()> {
        let fragmented = self.is_fragmented();
        for region in &mut self.push.retained {
            if region.kind == RetainKind::BeforeHeader {
                if fragmented {
                    region.kind = RetainKind::Fragment;
                } else {
                    region.claimed = true;
                }
            }
        }
        info!(
            "推模式: 已获得 moov, {} 段先到的数据待回放",
            self.push.retained.len()
        );
        self.after_append();

        let Some(dropped) = self.push.dropped_before_header.take() else {
            return Ok(());
        };
        let affected = self
            .tracks
            .iter()
            .flat_map(|t| t.index.entries())
            .any(|e| e.end_offset() > dropped && e.offset < moov_offset);
        if !affected {
            return Ok(());
        }
        if self.push.io_driven {
            return Err(IsoError::structural(
                dropped,
                BoxType::Mdat,
                None,
                "moov 之前的数据超出保留预算, 输入不可定位, 无法回放",
            ));
        }
        let offset = self.resume_offset();
        self.restart_push_at(offset);
        self.push.restart_request = Some(offset);
        warn!(
            "推模式: moov 之前的数据已部分丢弃 (自偏移 {}), 请求上游从偏移 {} 重新推送",
            dropped, offset
        );
        Ok(())
    }

    fn handle_moof(&mut self, offset: u64, data: Bytes) {
        if self.state == DemuxState::AcquiringHeader {
            warn!("推模式: moov 之前出现 moof (偏移 {}), 跳过", offset);
            return;
        }
        let moof = match MovieFragment::parse(data.clone(), offset, self.mvex.as_ref()) {
            Ok(m) => m,
            Err(e) => {
                warn!("分片 (偏移 {}): 解析失败, 跳过: {}", offset, e);
                return;
            }
        };
        if self.is_duplicate_fragment(&moof) {
            debug!("分片 {}: 已经索引过 (偏移 {})", moof.sequence, offset);
            return;
        }

        if moof.has_implicit_runs() {
            let paired = self.push.retained.iter_mut().find(|r| {
                r.kind == RetainKind::Fragment && !r.claimed && r.complete && r.start < offset
            });
            if let Some(region) = paired {
                region.claimed = true;
                let data_base = region.start;
                debug!(
                    "分片 {}: 与偏移 {} 处先到的数据配对",
                    moof.sequence, data_base
                );
                self.apply_fragment(&moof, &data, data_base, None);
                self.after_append();
            } else {
                if self.push.pending.len() >= self.config.max_pending_fragments {
                    if let Some(dropped) = self.push.pending.pop_front() {
                        warn!(
                            "分片 {}: 等待数据的分片超过 {} 个, 丢弃",
                            dropped.moof.sequence, self.config.max_pending_fragments
                        );
                    }
                }
                debug!("分片 {}: 等待数据 box", moof.sequence);
                self.push.pending.push_back(PendingFragment { moof, data });
            }
            return;
        }

        let ranges = moof.byte_ranges(0);
        for region in &mut self.push.retained {
            if region.kind == RetainKind::Fragment
                && ranges
                    .iter()
                    .any(|&(s, e)| s < region.end() && region.start < e)
            {
                region.claimed = true;
            }
        }
        let data_base = self.pair_data_box(&moof);
        self.apply_fragment(&moof, &data, data_base, None);
        self.after_append();
    }

    fn is_duplicate_fragment(&self, moof: &MovieFragment) -> bool {
        let mut known = moof
            .trafs
            .iter()
            .filter_map(|traf| self.tracks.iter().find(|t| t.track_id == traf.tfhd.track_id))
            .peekable();
        known.peek().is_some()
            && known.all(|t| {
                t.extensions
                    .fragment()
                    .is_some_and(|f| f.contains_moof(moof.offset))
            })
    }

    // ========================
    // 定位
    // ========================

    /// 新采样追加之后: 尝试应用延迟的定位, 否则跳过目标之前的采样
    fn after_append(&mut self) {
        let Some(request) = self.pending_seek else {
            return;
        };
        if let SeekTarget::Time {
            stream_index: Some(index),
            ..
        } = request.target
        {
            if index >= self.tracks.len() {
                warn!("推模式: 延迟定位的流索引 {} 不存在, 取消", index);
                self.pending_seek = None;
                self.state = DemuxState::Streaming;
                return;
            }
        }
        match self.push_seek_target(&request) {
            Some((reference, target)) => {
                self.pending_seek = None;
                let outcome = self.apply_seek(reference, target, &request);
                info!("推模式: 延迟的定位已生效 ({:?})", outcome.status);
            }
            None => self.discard_pending_samples(),
        }
    }

    /// 参考轨道与目标时间, 索引尚未覆盖目标时返回 None
    fn push_seek_target(&self, request: &SeekRequest) -> Option<(usize, i64)> {
        if self.state == DemuxState::AcquiringHeader || self.tracks.is_empty() {
            return None;
        }
        let SeekTarget::Time {
            stream_index,
            timestamp,
        } = request.target
        else {
            return None;
        };
        let reference = self.reference_track(stream_index);
        let target = self.target_ticks(reference, stream_index, timestamp);
        self.covers(reference, target).then_some((reference, target))
    }

    fn discard_pending_samples(&mut self) {
        for track in &mut self.tracks {
            track.cursor = track.index.len();
            track.extensions.remove(FeatureTag::TrickPlay);
        }
    }

    pub(super) fn seek_push(&mut self, request: &SeekRequest) -> IsoResult<SeekOutcome> {
        if let Some((reference, target)) = self.push_seek_target(request) {
            let mut outcome = self.apply_seek(reference, target, request);
            let offset = self.resume_offset();
            if !self.push.io_driven {
                self.restart_push_at(offset);
            }
            outcome.byte_offset = Some(offset);
            return Ok(outcome);
        }

        self.pending_seek = Some(*request);
        self.queue.clear();
        if self.state != DemuxState::AcquiringHeader {
            self.discard_pending_samples();
            self.state = DemuxState::Seeking;
        }
        self.emitted_since_seek = 0;
        info!("推模式: 索引尚未覆盖定位目标, 等待后续数据");
        Ok(SeekOutcome::deferred())
    }

    /// 定位之后上游应当从哪个字节重新推送
    fn resume_offset(&self) -> u64 {
        self.tracks
            .iter()
            .filter_map(|t| {
                let (pos, entry) = t.next_entry()?;
                let moof = t
                    .extensions
                    .fragment()
                    .and_then(|f| f.span_for(pos))
                    .map(|s| s.moof_offset);
                Some(moof.map_or(entry.offset, |m| m.min(entry.offset)))
            })
            .min()
            .unwrap_or(self.push.parse_pos)
    }

    /// 丢弃所有缓冲, 下一个推入的字节视为位于 `offset`
    fn restart_push_at(&mut self, offset: u64) {
        self.push.adapter.reset_to(offset);
        self.push.parse_pos = offset;
        self.push.retained.clear();
        self.push.pending.clear();
        self.push.eos = false;

        let containing = self
            .data_boxes
            .iter()
            .find(|d| d.payload_start <= offset && offset < d.end)
            .map(|d| d.end);
        self.push.region = match containing {
            Some(end) => Some(DataRegion {
                start: offset,
                end,
                retain: false,
            }),
            None if !self.is_fragmented() => Some(DataRegion {
                start: offset,
                end: u64::MAX,
                retain: false,
            }),
            None => None,
        };
        debug!("推模式: 从偏移 {} 重新开始接收", offset);
    }

    /// 输入结束: 处理剩余数据并报告缺失的部分
    fn finish_push(&mut self) -> IsoResult<()> {
        if self.push.eos {
            return Ok(());
        }
        self.push.eos = true;
        self.process_push()?;

        if self.state == DemuxState::AcquiringHeader {
            return Err(IsoError::structural(
                self.push.parse_pos,
                BoxType::Moov,
                None,
                "输入结束时仍未收到 moov",
            ));
        }
        if self.push.region.is_none() && self.push.parse_pos < self.push.adapter.end_offset() {
            warn!(
                "推模式: 输入末尾有 {} 字节不完整的 box",
                self.push.adapter.end_offset() - self.push.parse_pos
            );
        }
        if self.pending_seek.take().is_some() {
            warn!("推模式: 输入结束时定位仍未生效");
            if self.state == DemuxState::Seeking {
                self.state = DemuxState::Streaming;
            }
        }
        for track in &mut self.tracks {
            if let Some(pos) = track.next_position() {
                warn!(
                    "轨道 {}: 输入结束, 还有 {} 个采样的数据没有到达",
                    track.track_id,
                    track.index.len().saturating_sub(pos)
                );
                track.eos = true;
            }
        }
        if !self.push.pending.is_empty() {
            warn!(
                "推模式: {} 个分片头部没有等到数据 box",
                self.push.pending.len()
            );
            self.push.pending.clear();
        }
        info!("推模式: 输入结束");
        Ok(())
    }
}
