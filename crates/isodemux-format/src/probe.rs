//! 格式探测.
//!
//! 通过分析文件头部数据和文件扩展名, 自动识别容器格式.

use crate::format_id::FormatId;

/// 探测置信度
///
/// 数值越高, 表示对格式判断越有信心.
pub type ProbeScore = u32;

/// 最低探测分数 (仅根据扩展名)
pub const SCORE_EXTENSION: ProbeScore = 50;

/// 中等探测分数 (顶层 box 类型可识别, 但没有 ftyp)
pub const SCORE_BOX_TYPE: ProbeScore = 75;

/// 最高探测分数 (ftyp 完全匹配)
pub const SCORE_MAX: ProbeScore = 100;

/// 探测时读取的头部字节数
pub const PROBE_BUFFER_SIZE: usize = 8192;

/// 探测结果
#[derive(Debug, Clone)]
pub struct ProbeResult {
    /// 识别出的格式
    pub format_id: FormatId,
    /// 置信度分数
    pub score: ProbeScore,
}

/// 格式探测器 trait
pub trait FormatProbe {
    /// 根据文件头部数据探测格式
    ///
    /// # 返回
    /// - `Some((format, score))`: 探测成功
    /// - `None`: 不是此格式
    fn probe(&self, data: &[u8], filename: Option<&str>) -> Option<(FormatId, ProbeScore)>;
}
