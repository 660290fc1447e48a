//! 解封装器 (Demuxer) trait 定义.
//!
//! 对标 FFmpeg 的 `AVInputFormat`, 定义了从容器格式中读取数据包的接口.

use isodemux_codec::Packet;
use isodemux_core::IsoResult;

use crate::demuxers::mp4::protection::ProtectionSystem;
use crate::format_id::FormatId;
use crate::io::IoContext;
use crate::stream::Stream;

/// 解封装器 trait
///
/// 使用流程:
/// 1. 调用 `open()` 打开容器并解析头部
/// 2. 调用 `streams()` 获取流信息
/// 3. 循环调用 `read_packet()` 读取数据包
/// 4. 可选: 调用 `seek()` 进行定位
pub trait Demuxer: Send {
    /// 获取格式标识
    fn format_id(&self) -> FormatId;

    /// 获取格式名称
    fn name(&self) -> &str;

    /// 打开容器并解析头部信息
    fn open(&mut self, io: &mut IoContext) -> IsoResult<()>;

    /// 获取所有流信息
    fn streams(&self) -> &[Stream];

    /// 读取下一个数据包
    ///
    /// # 返回
    /// - `Ok(packet)`: 成功读取一个数据包
    /// - `Err(IsoError::Eof)`: 已到达文件末尾
    fn read_packet(&mut self, io: &mut IoContext) -> IsoResult<Packet>;

    /// 定位到指定时间点或字节位置
    fn seek(&mut self, io: &mut IoContext, request: &SeekRequest) -> IsoResult<SeekOutcome>;

    /// 获取容器时长 (秒), None 表示未知
    fn duration(&self) -> Option<f64>;

    /// 输入是否支持定位
    fn is_seekable(&self) -> bool {
        false
    }

    /// 获取容器元数据
    fn metadata(&self) -> &[(String, String)] {
        &[]
    }

    /// 获取文件级保护系统信息 (pssh)
    fn protection_systems(&self) -> &[ProtectionSystem] {
        &[]
    }
}

/// 定位目标
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SeekTarget {
    /// 时间定位
    ///
    /// `stream_index` 为 Some 时 `timestamp` 以该流的 time_base 为单位,
    /// 为 None 时以微秒为单位.
    Time {
        stream_index: Option<usize>,
        timestamp: i64,
    },
    /// 字节定位 (仅拉模式)
    Byte(u64),
}

/// Seek 标志
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekFlags {
    /// 向后 seek (寻找目标之前最近的关键帧)
    pub backward: bool,
    /// 寻找任意帧 (不仅是关键帧)
    pub any: bool,
}

impl Default for SeekFlags {
    fn default() -> Self {
        Self {
            backward: true,
            any: false,
        }
    }
}

/// 定位请求
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekRequest {
    /// 目标
    pub target: SeekTarget,
    /// 播放速率, 负值表示倒放
    pub rate: f64,
    /// 标志
    pub flags: SeekFlags,
}

impl SeekRequest {
    /// 以秒为单位的时间定位, 正常速率
    pub fn seconds(seconds: f64) -> Self {
        Self {
            target: SeekTarget::Time {
                stream_index: None,
                timestamp: (seconds * 1_000_000.0).round() as i64,
            },
            rate: 1.0,
            flags: SeekFlags::default(),
        }
    }

    /// 以指定流时间基为单位的时间定位
    pub fn stream_time(stream_index: usize, timestamp: i64) -> Self {
        Self {
            target: SeekTarget::Time {
                stream_index: Some(stream_index),
                timestamp,
            },
            rate: 1.0,
            flags: SeekFlags::default(),
        }
    }

    /// 字节定位
    pub fn byte(offset: u64) -> Self {
        Self {
            target: SeekTarget::Byte(offset),
            rate: 1.0,
            flags: SeekFlags::default(),
        }
    }

    /// 设置播放速率
    pub fn with_rate(mut self, rate: f64) -> Self {
        self.rate = rate;
        self
    }
}

/// 定位结果状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekStatus {
    /// 已定位
    Done,
    /// 索引尚不可用, 待下一个分片到达后生效
    Deferred,
    /// 目标超出已知时长, 已定位到最后一个已知采样
    Clamped,
}

/// 定位结果
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SeekOutcome {
    /// 状态
    pub status: SeekStatus,
    /// 推模式下上游需要从此字节偏移重新送数据
    pub byte_offset: Option<u64>,
    /// 实际落点 (秒, 参考轨道的显示时间)
    pub position: Option<f64>,
}

impl SeekOutcome {
    /// 延迟生效的定位结果
    pub fn deferred() -> Self {
        Self {
            status: SeekStatus::Deferred,
            byte_offset: None,
            position: None,
        }
    }
}
