//! 媒体类型定义.
//!
//! 由轨道的 handler 类型 (hdlr) 决定.

use std::fmt;

/// 媒体流类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
    /// 视频流
    Video,
    /// 音频流
    Audio,
    /// 字幕流 (含隐藏字幕与定时文本)
    Subtitle,
    /// 数据流 (如时间码、元数据、hint 轨道)
    Data,
}

impl MediaType {
    /// 根据 hdlr box 的 handler_type 判断媒体类型
    pub fn from_handler(handler: &[u8; 4]) -> Self {
        match handler {
            b"vide" | b"auxv" | b"pict" => Self::Video,
            b"soun" => Self::Audio,
            b"subt" | b"text" | b"sbtl" | b"clcp" => Self::Subtitle,
            _ => Self::Data,
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Video => "视频",
            Self::Audio => "音频",
            Self::Subtitle => "字幕",
            Self::Data => "数据",
        };
        write!(f, "{name}")
    }
}
