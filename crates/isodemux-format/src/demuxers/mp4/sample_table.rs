//! MP4 采样表 (Sample Table) 解析与采样索引构建.
//!
//! 采样表 (stbl) 包含了从采样编号到文件偏移的完整映射.
//! 由多个子 box 共同组成:
//! - stts: 解码时间→采样编号映射 (delta 编码)
//! - stsc: 采样→块映射 (压缩的 Run-Length 编码)
//! - stsz/stz2: 每个采样的字节大小
//! - stco/co64: 每个块的文件偏移
//! - stss: 同步采样 (关键帧) 索引列表
//! - ctts: 合成时间偏移 (B帧重排序)
//!
//! 解析后的表会一次性展开成 [`SampleIndex`], 之后的读取与定位
//! 只访问展开结果. 分片文件的 trun 也追加到同一个索引中.

use isodemux_core::{ByteReader, IsoError, IsoResult};
use log::{debug, warn};

use super::box_tree::{BoxTree, NodeId};
use super::boxes::BoxType;

/// 时间→采样条目 (stts)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SttsEntry {
    /// 采样计数
    pub count: u32,
    /// 每采样的时间增量
    pub delta: u32,
}

/// 采样→块条目 (stsc)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StscEntry {
    /// 起始块号 (1-based)
    pub first_chunk: u32,
    /// 每块的采样数
    pub samples_per_chunk: u32,
    /// 采样描述索引 (1-based)
    pub sample_description_index: u32,
}

/// 合成时间偏移条目 (ctts)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CttsEntry {
    /// 采样计数
    pub count: u32,
    /// 偏移量
    pub offset: i32,
}

/// 采样大小表 (stsz/stz2)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SampleSizes {
    /// 所有采样同样大小
    Uniform { size: u32, count: u32 },
    /// 逐采样大小
    PerSample(Vec<u32>),
}

impl SampleSizes {
    /// 采样总数
    pub fn count(&self) -> u32 {
        match self {
            Self::Uniform { count, .. } => *count,
            Self::PerSample(sizes) => sizes.len() as u32,
        }
    }

    /// 第 `idx` 个采样的大小
    pub fn get(&self, idx: usize) -> u32 {
        match self {
            Self::Uniform { size, .. } => *size,
            Self::PerSample(sizes) => sizes.get(idx).copied().unwrap_or(0),
        }
    }
}

/// 检查声明的条目数是否能被剩余数据容纳, 避免按损坏的计数分配内存
fn check_entry_count(r: &ByteReader<'_>, count: u32, entry_size: usize) -> IsoResult<usize> {
    let needed = (count as usize).saturating_mul(entry_size);
    if needed > r.remaining() {
        return Err(IsoError::Truncated {
            needed,
            available: r.remaining(),
        });
    }
    Ok(count as usize)
}

/// 解析 stts (Time-to-Sample Box)
pub fn parse_stts(payload: &[u8]) -> IsoResult<Vec<SttsEntry>> {
    let mut r = ByteReader::new(payload);
    r.read_full_box_header()?;
    let entry_count = r.read_u32()?;
    let n = check_entry_count(&r, entry_count, 8)?;

    let mut entries = Vec::with_capacity(n);
    for _ in 0..n {
        let count = r.read_u32()?;
        let delta = r.read_u32()?;
        entries.push(SttsEntry { count, delta });
    }
    Ok(entries)
}

/// 解析 ctts (Composition Time to Sample Box)
///
/// version 0 按规范是无符号偏移, 但实际文件中常见负值写法,
/// 因此两个版本都按有符号读取.
pub fn parse_ctts(payload: &[u8]) -> IsoResult<Vec<CttsEntry>> {
    let mut r = ByteReader::new(payload);
    r.read_full_box_header()?;
    let entry_count = r.read_u32()?;
    let n = check_entry_count(&r, entry_count, 8)?;

    let mut entries = Vec::with_capacity(n);
    for _ in 0..n {
        let count = r.read_u32()?;
        let offset = r.read_i32()?;
        entries.push(CttsEntry { count, offset });
    }
    Ok(entries)
}

/// 解析 stsc (Sample-to-Chunk Box)
pub fn parse_stsc(payload: &[u8]) -> IsoResult<Vec<StscEntry>> {
    let mut r = ByteReader::new(payload);
    r.read_full_box_header()?;
    let entry_count = r.read_u32()?;
    let n = check_entry_count(&r, entry_count, 12)?;

    let mut entries = Vec::with_capacity(n);
    for _ in 0..n {
        let first_chunk = r.read_u32()?;
        let samples_per_chunk = r.read_u32()?;
        let sample_description_index = r.read_u32()?;
        entries.push(StscEntry {
            first_chunk,
            samples_per_chunk,
            sample_description_index,
        });
    }
    Ok(entries)
}

/// 解析 stsz (Sample Size Box)
pub fn parse_stsz(payload: &[u8]) -> IsoResult<SampleSizes> {
    let mut r = ByteReader::new(payload);
    r.read_full_box_header()?;
    let sample_size = r.read_u32()?;
    let sample_count = r.read_u32()?;

    if sample_size != 0 {
        return Ok(SampleSizes::Uniform {
            size: sample_size,
            count: sample_count,
        });
    }

    let n = check_entry_count(&r, sample_count, 4)?;
    let mut sizes = Vec::with_capacity(n);
    for _ in 0..n {
        sizes.push(r.read_u32()?);
    }
    Ok(SampleSizes::PerSample(sizes))
}

/// 解析 stz2 (Compact Sample Size Box), 字段宽度 4/8/16 位
pub fn parse_stz2(payload: &[u8]) -> IsoResult<SampleSizes> {
    let mut r = ByteReader::new(payload);
    r.read_full_box_header()?;
    r.skip(3)?; // reserved
    let field_size = r.read_u8()?;
    let sample_count = r.read_u32()?;

    let n = sample_count as usize;
    let needed = match field_size {
        4 => n.div_ceil(2),
        8 => n,
        16 => n.saturating_mul(2),
        other => {
            return Err(IsoError::InvalidData(format!(
                "stz2 字段宽度 {other} 无效"
            )));
        }
    };
    if needed > r.remaining() {
        return Err(IsoError::Truncated {
            needed,
            available: r.remaining(),
        });
    }

    let mut sizes = Vec::with_capacity(n);
    match field_size {
        4 => {
            for i in 0..n {
                if i % 2 == 0 {
                    let byte = r.read_u8()?;
                    sizes.push(u32::from(byte >> 4));
                    if i + 1 < n {
                        sizes.push(u32::from(byte & 0x0F));
                    }
                }
            }
        }
        8 => {
            for _ in 0..n {
                sizes.push(u32::from(r.read_u8()?));
            }
        }
        _ => {
            for _ in 0..n {
                sizes.push(u32::from(r.read_u16()?));
            }
        }
    }
    Ok(SampleSizes::PerSample(sizes))
}

/// 解析 stco (32-bit) 或 co64 (64-bit) 块偏移表
pub fn parse_chunk_offsets(payload: &[u8], wide: bool) -> IsoResult<Vec<u64>> {
    let mut r = ByteReader::new(payload);
    r.read_full_box_header()?;
    let entry_count = r.read_u32()?;
    let n = check_entry_count(&r, entry_count, if wide { 8 } else { 4 })?;

    let mut offsets = Vec::with_capacity(n);
    for _ in 0..n {
        offsets.push(r.read_u32_or_u64(wide)?);
    }
    Ok(offsets)
}

/// 解析 stss (Sync Sample Box), 返回 1-based 采样编号
pub fn parse_stss(payload: &[u8]) -> IsoResult<Vec<u32>> {
    let mut r = ByteReader::new(payload);
    r.read_full_box_header()?;
    let entry_count = r.read_u32()?;
    let n = check_entry_count(&r, entry_count, 4)?;

    let mut samples = Vec::with_capacity(n);
    for _ in 0..n {
        samples.push(r.read_u32()?);
    }
    Ok(samples)
}

/// stbl 中解析出的原始表
#[derive(Debug, Clone, Default)]
pub struct SampleTableBoxes {
    pub stts: Vec<SttsEntry>,
    pub ctts: Vec<CttsEntry>,
    pub stsc: Vec<StscEntry>,
    pub sizes: Option<SampleSizes>,
    pub chunk_offsets: Vec<u64>,
    /// None 表示没有 stss, 所有采样都是同步采样
    pub sync_samples: Option<Vec<u32>>,
}

impl SampleTableBoxes {
    /// 从 stbl 节点收集所有子表
    pub fn from_tree(tree: &BoxTree, stbl: NodeId) -> IsoResult<Self> {
        let mut tables = Self::default();
        for &child in tree.children(stbl) {
            let payload = tree.payload(child);
            match tree.node(child).box_type {
                BoxType::Stts => tables.stts = parse_stts(payload)?,
                BoxType::Ctts => tables.ctts = parse_ctts(payload)?,
                BoxType::Stsc => tables.stsc = parse_stsc(payload)?,
                BoxType::Stsz => tables.sizes = Some(parse_stsz(payload)?),
                BoxType::Stz2 => tables.sizes = Some(parse_stz2(payload)?),
                BoxType::Stco => tables.chunk_offsets = parse_chunk_offsets(payload, false)?,
                BoxType::Co64 => tables.chunk_offsets = parse_chunk_offsets(payload, true)?,
                BoxType::Stss => tables.sync_samples = Some(parse_stss(payload)?),
                _ => {}
            }
        }
        Ok(tables)
    }
}

/// 采样索引条目
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// 文件绝对偏移
    pub offset: u64,
    /// 字节大小
    pub size: u32,
    /// 解码时间 (轨道 timescale)
    pub dts: u64,
    /// 显示时间相对解码时间的偏移
    pub cts_offset: i32,
    /// 时长
    pub duration: u32,
    /// 是否为同步采样 (关键帧)
    pub sync: bool,
    /// 附加信息下标 (如加密参数), 指向轨道扩展中的表
    pub aux: Option<u32>,
}

impl IndexEntry {
    /// 显示时间 (未应用编辑列表)
    pub fn pts(&self) -> i64 {
        self.dts as i64 + i64::from(self.cts_offset)
    }

    /// 数据末尾的绝对偏移
    pub fn end_offset(&self) -> u64 {
        self.offset + u64::from(self.size)
    }
}

/// 轨道采样索引
///
/// 条目按解码时间非递减排列. 同步采样位置单独记录, 供定位使用.
#[derive(Debug, Clone, Default)]
pub struct SampleIndex {
    entries: Vec<IndexEntry>,
    sync_positions: Vec<usize>,
}

impl SampleIndex {
    /// 创建空索引
    pub fn new() -> Self {
        Self::default()
    }

    /// 采样数
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// 是否为空
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 获取条目
    pub fn get(&self, idx: usize) -> Option<&IndexEntry> {
        self.entries.get(idx)
    }

    /// 所有条目
    pub fn entries(&self) -> &[IndexEntry] {
        &self.entries
    }

    /// 同步采样位置 (升序)
    pub fn sync_positions(&self) -> &[usize] {
        &self.sync_positions
    }

    /// 追加一个条目
    pub fn push(&mut self, entry: IndexEntry) {
        if entry.sync {
            self.sync_positions.push(self.entries.len());
        }
        self.entries.push(entry);
    }

    /// 最后一个采样结束时的解码时间, 即下一个采样的解码时间
    pub fn end_dts(&self) -> u64 {
        self.entries
            .last()
            .map_or(0, |e| e.dts + u64::from(e.duration))
    }

    /// 第一个解码时间不早于 `dts` 的条目位置
    pub fn position_at_or_after_dts(&self, dts: u64) -> usize {
        self.entries.partition_point(|e| e.dts < dts)
    }
}

/// 把 stbl 的原始表展开成采样索引
///
/// 采样数不一致或 stsc 描述的块不足都会返回错误, 调用方据此跳过该轨道.
pub fn build_index(tables: &SampleTableBoxes, track_id: u32) -> IsoResult<SampleIndex> {
    let fail = |reason: String| IsoError::structural(0, BoxType::Stbl, Some(track_id), reason);

    let Some(sizes) = tables.sizes.as_ref() else {
        if tables.stts.iter().all(|e| e.count == 0) {
            return Ok(SampleIndex::new());
        }
        return Err(fail("缺少 stsz/stz2".into()));
    };

    let total = sizes.count() as usize;
    let stts_total: u64 = tables.stts.iter().map(|e| u64::from(e.count)).sum();
    if stts_total != total as u64 {
        return Err(fail(format!(
            "stsz 采样数 {} 与 stts 采样数 {} 不一致",
            total, stts_total
        )));
    }
    if total == 0 {
        debug!("轨道 {}: 零采样", track_id);
        return Ok(SampleIndex::new());
    }
    if tables.stsc.is_empty() {
        return Err(fail("缺少 stsc".into()));
    }

    // stsc × 块偏移 → 逐采样偏移
    let mut offsets = Vec::with_capacity(total);
    let chunk_count = tables.chunk_offsets.len() as u64;
    'outer: for (i, entry) in tables.stsc.iter().enumerate() {
        if entry.first_chunk == 0 {
            return Err(fail("stsc first_chunk 为 0".into()));
        }
        if entry.samples_per_chunk == 0 {
            return Err(fail("stsc samples_per_chunk 为 0".into()));
        }
        let last_chunk = match tables.stsc.get(i + 1) {
            Some(next) if next.first_chunk > entry.first_chunk => u64::from(next.first_chunk),
            Some(_) => return Err(fail("stsc first_chunk 未递增".into())),
            None => chunk_count + 1,
        };
        for chunk in u64::from(entry.first_chunk)..last_chunk {
            let Some(&chunk_offset) = tables.chunk_offsets.get((chunk - 1) as usize) else {
                return Err(fail(format!("stsc 引用的块 {chunk} 超出块偏移表")));
            };
            let mut pos = chunk_offset;
            for _ in 0..entry.samples_per_chunk {
                if offsets.len() == total {
                    break 'outer;
                }
                offsets.push(pos);
                pos += u64::from(sizes.get(offsets.len() - 1));
            }
        }
    }
    if offsets.len() < total {
        return Err(fail(format!(
            "stsc 只描述了 {} 个采样, 需要 {}",
            offsets.len(),
            total
        )));
    }

    // stts → dts/时长
    let mut durations = tables
        .stts
        .iter()
        .flat_map(|e| std::iter::repeat_n(e.delta, e.count as usize));
    // ctts → 显示偏移, 条目不足时其余为 0
    let mut cts_offsets = tables
        .ctts
        .iter()
        .flat_map(|e| std::iter::repeat_n(e.offset, e.count as usize));

    let mut sync_marks = vec![tables.sync_samples.is_none(); total];
    if let Some(sync) = &tables.sync_samples {
        for &number in sync {
            match (number as usize).checked_sub(1).and_then(|i| sync_marks.get_mut(i)) {
                Some(mark) => *mark = true,
                None => warn!("轨道 {}: stss 引用了不存在的采样 {}", track_id, number),
            }
        }
    }

    let mut index = SampleIndex::new();
    index.entries.reserve(total);
    let mut dts = 0u64;
    for (i, &offset) in offsets.iter().enumerate() {
        let duration = durations.next().unwrap_or(0);
        index.push(IndexEntry {
            offset,
            size: sizes.get(i),
            dts,
            cts_offset: cts_offsets.next().unwrap_or(0),
            duration,
            sync: sync_marks[i],
            aux: None,
        });
        dts += u64::from(duration);
    }

    debug!(
        "轨道 {}: 采样索引 {} 项, 同步采样 {} 个, 总时长 {}",
        track_id,
        index.len(),
        index.sync_positions.len(),
        dts
    );
    Ok(index)
}
