//! 解封装器配置.
//!
//! 所有字段都有默认值, 可以从 JSON 配置文件中只覆盖部分字段.

use serde::{Deserialize, Serialize};

/// 解封装器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemuxConfig {
    /// 单个 box 声明大小的安全上限 (字节), 超过视为损坏
    pub max_box_size: u64,
    /// 需要完整驻留内存的元数据 box (moov/moof) 的上限 (字节)
    pub max_header_size: u64,
    /// moov 之前到达的 mdat 数据最多保留多少字节
    pub retained_data_budget: u64,
    /// 分片数据与分片头部相互等待时最多保留多少字节
    pub fragment_buffer_budget: u64,
    /// 最多挂起多少个等待数据的分片头部
    pub max_pending_fragments: usize,
    /// 最大轨道数, 多余的 trak 会被跳过
    pub max_tracks: usize,
    /// 非随机访问输入每次读取的块大小 (字节)
    pub read_chunk_size: usize,
    /// 快进/倒放的基准速率, 步长 = floor(|rate| / trick_base_rate)
    pub trick_base_rate: f64,
    /// 是否为零采样轨道发送格式通告与立即结束信号
    pub announce_empty_tracks: bool,
}

impl Default for DemuxConfig {
    fn default() -> Self {
        Self {
            max_box_size: 1 << 40,
            max_header_size: 256 * 1024 * 1024,
            retained_data_budget: 64 * 1024 * 1024,
            fragment_buffer_budget: 32 * 1024 * 1024,
            max_pending_fragments: 16,
            max_tracks: 32,
            read_chunk_size: 64 * 1024,
            trick_base_rate: 2.0,
            announce_empty_tracks: true,
        }
    }
}

impl DemuxConfig {
    /// 从 JSON 字符串解析配置, 未出现的字段取默认值
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_配置_部分字段覆盖() {
        let cfg = DemuxConfig::from_json(r#"{"max_tracks": 4, "trick_base_rate": 4.0}"#).unwrap();
        assert_eq!(cfg.max_tracks, 4);
        assert!((cfg.trick_base_rate - 4.0).abs() < f64::EPSILON);
        assert_eq!(cfg.read_chunk_size, DemuxConfig::default().read_chunk_size);
    }

    #[test]
    fn test_配置_默认值() {
        let cfg = DemuxConfig::default();
        assert_eq!(cfg.max_tracks, 32);
        assert!(cfg.announce_empty_tracks);
        assert!(cfg.max_header_size < cfg.max_box_size);
    }
}
