//! 流信息定义.
//!
//! 对标 FFmpeg 的 `AVStream`, 描述容器中的一条轨道, 也是输出通道
//! 收到的一次性格式通告内容.

use isodemux_codec::CodecId;
use isodemux_core::{MediaType, Rational};

/// 流信息
#[derive(Debug, Clone, PartialEq)]
pub struct Stream {
    /// 流索引 (在容器中的位置, 从 0 开始)
    pub index: usize,
    /// 容器内的轨道 ID
    pub track_id: u32,
    /// 媒体类型
    pub media_type: MediaType,
    /// 编解码器标识
    pub codec_id: CodecId,
    /// 采样描述中的 FourCC (受保护轨道为原始格式)
    pub codec_tag: String,
    /// 时间基 (1/timescale)
    pub time_base: Rational,
    /// 流时长 (以 time_base 为单位, -1 表示未知)
    pub duration: i64,
    /// 起始时间 (以 time_base 为单位, 已应用编辑列表)
    pub start_time: i64,
    /// 总帧数 (分片文件为已知部分)
    pub nb_frames: u64,
    /// 编解码器私有数据 (avcC/hvcC/esds 等)
    pub extra_data: Vec<u8>,
    /// 流特定参数
    pub params: StreamParams,
    /// 保护方案 (仅受保护轨道)
    pub protection: Option<ProtectionScheme>,
    /// 元数据 (语言, 处理器名称等)
    pub metadata: Vec<(String, String)>,
}

/// 流特定参数
#[derive(Debug, Clone, PartialEq)]
pub enum StreamParams {
    /// 视频流参数
    Video(VideoStreamParams),
    /// 音频流参数
    Audio(AudioStreamParams),
    /// 字幕流参数
    Subtitle(SubtitleStreamParams),
    /// 其他
    Other,
}

/// 视频流参数
#[derive(Debug, Clone, PartialEq)]
pub struct VideoStreamParams {
    /// 宽度 (像素)
    pub width: u32,
    /// 高度 (像素)
    pub height: u32,
    /// 平均帧率 (由采样数与时长估算)
    pub frame_rate: Rational,
    /// 采样宽高比 (pasp)
    pub sample_aspect_ratio: Rational,
    /// 色彩信息 (colr)
    pub color: Option<ColorInfo>,
    /// HDR 静态元数据 (mdcv/clli)
    pub hdr: Option<HdrMetadata>,
    /// Dolby Vision 配置 (dvcC/dvvC)
    pub dolby_vision: Option<DolbyVisionConfig>,
}

/// 音频流参数
#[derive(Debug, Clone, PartialEq)]
pub struct AudioStreamParams {
    /// 采样率 (Hz)
    pub sample_rate: u32,
    /// 声道数
    pub channels: u32,
    /// 每采样位数
    pub bits_per_sample: u32,
    /// 每个数据包的固定采样数 (QuickTime 声音描述 v1/v2, 0 表示未知)
    pub frame_size: u32,
}

/// 字幕流参数
#[derive(Debug, Clone, PartialEq)]
pub struct SubtitleStreamParams {
    /// 命名空间或 MIME (stpp/wvtt)
    pub namespace: Option<String>,
}

/// 色彩信息 (colr nclx/nclc)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColorInfo {
    pub primaries: u16,
    pub transfer: u16,
    pub matrix: u16,
    pub full_range: bool,
}

/// HDR 静态元数据
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HdrMetadata {
    /// 主显示器三原色 (x, y), 单位 0.00002
    pub display_primaries: Option<[(u16, u16); 3]>,
    /// 白点 (x, y)
    pub white_point: Option<(u16, u16)>,
    /// 最大/最小亮度, 单位 0.0001 cd/m2
    pub max_luminance: Option<u32>,
    pub min_luminance: Option<u32>,
    /// 最大内容亮度 (MaxCLL)
    pub max_content_light_level: Option<u16>,
    /// 最大帧平均亮度 (MaxFALL)
    pub max_frame_average_light_level: Option<u16>,
}

/// Dolby Vision 解码配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DolbyVisionConfig {
    pub version_major: u8,
    pub version_minor: u8,
    pub profile: u8,
    pub level: u8,
    pub rpu_present: bool,
    pub el_present: bool,
    pub bl_present: bool,
    pub bl_signal_compatibility_id: u8,
}

/// 轨道保护方案 (sinf)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionScheme {
    /// 方案类型 (cenc/cbcs/cens/cbc1/piff)
    pub scheme_type: String,
    /// 方案版本
    pub scheme_version: u32,
    /// 加密前的原始采样描述 FourCC (frma)
    pub original_format: String,
    /// 默认密钥 ID (十六进制)
    pub default_kid: String,
}

impl Stream {
    /// 视频参数 (如果是视频流)
    pub fn video(&self) -> Option<&VideoStreamParams> {
        match &self.params {
            StreamParams::Video(v) => Some(v),
            _ => None,
        }
    }

    /// 音频参数 (如果是音频流)
    pub fn audio(&self) -> Option<&AudioStreamParams> {
        match &self.params {
            StreamParams::Audio(a) => Some(a),
            _ => None,
        }
    }

    /// 时长 (秒)
    pub fn duration_seconds(&self) -> Option<f64> {
        if self.duration < 0 {
            return None;
        }
        self.time_base.ticks_to_secs(self.duration)
    }
}
