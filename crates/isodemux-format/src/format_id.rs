//! 容器格式标识符.
//!
//! ISO BMFF 家族的各个变体共用同一个解封装器, 区别只在 ftyp 品牌.

use std::fmt;

/// 容器格式标识符
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FormatId {
    /// MPEG-4 Part 14 (MP4/M4A/M4V)
    Mp4,
    /// Apple QuickTime (MOV)
    QuickTime,
    /// 3GPP
    ThreeGp,
    /// 3GPP2
    ThreeG2,
    /// Motion JPEG 2000
    Mj2,
    /// 分片 MP4 (DASH/CMAF 分段)
    FragmentedMp4,
}

impl FormatId {
    /// 所有已知格式标识的列表
    pub const ALL: &[FormatId] = &[
        Self::Mp4,
        Self::QuickTime,
        Self::ThreeGp,
        Self::ThreeG2,
        Self::Mj2,
        Self::FragmentedMp4,
    ];

    /// 获取格式的人类可读名称
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::QuickTime => "mov",
            Self::ThreeGp => "3gp",
            Self::ThreeG2 => "3g2",
            Self::Mj2 => "mj2",
            Self::FragmentedMp4 => "fmp4",
        }
    }

    /// 获取格式常用的文件扩展名
    pub const fn extensions(&self) -> &'static [&'static str] {
        match self {
            Self::Mp4 => &["mp4", "m4a", "m4v", "m4b", "f4v"],
            Self::QuickTime => &["mov", "qt"],
            Self::ThreeGp => &["3gp"],
            Self::ThreeG2 => &["3g2"],
            Self::Mj2 => &["mj2", "mjp2"],
            Self::FragmentedMp4 => &["m4s", "cmfv", "cmfa", "ismv", "isma"],
        }
    }

    /// 根据文件扩展名猜测格式
    pub fn from_extension(ext: &str) -> Option<FormatId> {
        let ext_lower = ext.to_lowercase();
        Self::ALL
            .iter()
            .find(|id| id.extensions().contains(&ext_lower.as_str()))
            .copied()
    }

    /// 从文件路径猜测格式
    pub fn from_filename(filename: &str) -> Option<FormatId> {
        let ext = filename.rsplit('.').next()?;
        Self::from_extension(ext)
    }

    /// 根据 ftyp 主品牌识别格式
    pub fn from_brand(brand: &[u8; 4]) -> FormatId {
        match brand {
            b"qt  " => Self::QuickTime,
            b"mjp2" | b"mj2s" => Self::Mj2,
            b"dash" | b"msdh" | b"msix" | b"iso5" | b"iso6" | b"cmfc" | b"cmf2" => {
                Self::FragmentedMp4
            }
            [b'3', b'g', b'2', _] => Self::ThreeG2,
            [b'3', b'g', b'p' | b'g' | b'r' | b's' | b'e', _] => Self::ThreeGp,
            _ => Self::Mp4,
        }
    }
}

impl fmt::Display for FormatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
