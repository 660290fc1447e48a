//! 定时数据单元 (Packet).
//!
//! 对标 FFmpeg 的 `AVPacket`, 表示从容器中切出的一个采样.

use bytes::Bytes;
use isodemux_core::Rational;
use isodemux_core::timestamp::NOPTS_VALUE;

use crate::protection::SampleProtection;

/// 压缩数据包
///
/// 一个 Packet 对应轨道采样索引中的一个条目.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    /// 采样数据
    pub data: Bytes,
    /// 显示时间戳 (PTS), 已应用编辑列表偏移
    pub pts: i64,
    /// 解码时间戳 (DTS), 已应用编辑列表偏移
    pub dts: i64,
    /// 数据包时长 (以 time_base 为单位)
    pub duration: i64,
    /// 时间基 (1/timescale)
    pub time_base: Rational,
    /// 所属流的索引
    pub stream_index: usize,
    /// 所属轨道 ID (tkhd/tfhd 中的 track_ID)
    pub track_id: u32,
    /// 是否为同步采样 (关键帧)
    pub is_keyframe: bool,
    /// 在容器中的字节偏移量 (-1 表示未知)
    pub pos: i64,
    /// 定位或丢弃之后的第一个数据包
    pub discont: bool,
    /// 加密参数 (仅受保护轨道)
    pub protection: Option<SampleProtection>,
}

impl Packet {
    /// 创建空数据包
    pub fn empty() -> Self {
        Self {
            data: Bytes::new(),
            pts: NOPTS_VALUE,
            dts: NOPTS_VALUE,
            duration: 0,
            time_base: Rational::UNDEFINED,
            stream_index: 0,
            track_id: 0,
            is_keyframe: false,
            pos: -1,
            discont: false,
            protection: None,
        }
    }

    /// 从数据创建数据包
    pub fn from_data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::empty()
        }
    }

    /// 数据大小 (字节)
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// 是否为空包
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// 显示时间 (秒), 未知时为 NaN
    pub fn pts_seconds(&self) -> f64 {
        if self.pts == NOPTS_VALUE {
            return f64::NAN;
        }
        self.time_base.ticks_to_secs(self.pts).unwrap_or(f64::NAN)
    }
}
