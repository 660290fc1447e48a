//! 统一错误类型定义.
//!
//! 所有 isodemux crate 共用的错误类型, 支持跨模块传播.
//!
//! 错误分为四类:
//! - 数据不足 (`NeedMoreData`): 不是错误, 推模式下表示挂起等待输入
//! - 可恢复跳过: 只在日志中出现, 不会通过 `Result` 向上传播
//! - 致命结构错误 (`Structural`, `SizeCeiling`, `InvalidData` 等)
//! - 致命下游错误 (`Downstream`)

use std::fmt;

use thiserror::Error;

/// 统一错误类型
#[derive(Debug, Error)]
pub enum IsoError {
    /// 无效参数
    #[error("无效参数: {0}")]
    InvalidArgument(String),

    /// 不支持的操作
    #[error("不支持的操作: {0}")]
    Unsupported(String),

    /// 容器格式错误
    #[error("格式错误: {0}")]
    Format(String),

    /// I/O 错误
    #[error("I/O 错误: {0}")]
    Io(#[from] std::io::Error),

    /// 数据不足, 需要更多输入
    #[error("数据不足, 需要更多输入")]
    NeedMoreData,

    /// 已到达流末尾
    #[error("已到达流末尾")]
    Eof,

    /// 未找到指定的容器格式
    #[error("未找到容器格式: {0}")]
    FormatNotFound(String),

    /// 未找到指定的轨道
    #[error("未找到轨道: track_id={0}")]
    TrackNotFound(u32),

    /// 无效数据 (损坏的码流等)
    #[error("无效数据: {0}")]
    InvalidData(String),

    /// 字段读取越界
    #[error("数据截断: 需要 {needed} 字节, 剩余 {available} 字节")]
    Truncated { needed: usize, available: usize },

    /// 结构性错误, 携带定位信息
    #[error("结构错误: {reason} (box={box_type}, 偏移={offset}, 轨道={track_id:?})")]
    Structural {
        offset: u64,
        box_type: String,
        track_id: Option<u32>,
        reason: String,
    },

    /// box 声明的大小超过安全上限
    #[error("box 大小超出上限: {box_type} 声明 {size} 字节, 上限 {limit} 字节 (偏移={offset})")]
    SizeCeiling {
        offset: u64,
        box_type: String,
        size: u64,
        limit: u64,
    },

    /// 下游输出返回不可恢复的结果
    #[error("下游输出失败: 轨道 {track_id}, 结果 {flow}")]
    Downstream { track_id: u32, flow: String },

    /// 会话已停止
    #[error("解封装会话已停止")]
    Stopped,

    /// 内部错误 (不应发生)
    #[error("内部错误: {0}")]
    Internal(String),
}

impl IsoError {
    /// 构造带定位信息的结构错误
    pub fn structural(
        offset: u64,
        box_type: impl fmt::Display,
        track_id: Option<u32>,
        reason: impl Into<String>,
    ) -> Self {
        Self::Structural {
            offset,
            box_type: box_type.to_string(),
            track_id,
            reason: reason.into(),
        }
    }

    /// 是否为致命错误 (需要终止会话)
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::NeedMoreData | Self::Eof)
    }
}

/// 统一 Result 类型
pub type IsoResult<T> = Result<T, IsoError>;
