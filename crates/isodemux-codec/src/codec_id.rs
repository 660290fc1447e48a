//! 编解码器标识符.
//!
//! 覆盖 ISO BMFF / QuickTime / 3GP 采样描述中常见的编码格式.

use std::fmt;

use isodemux_core::MediaType;

/// 编解码器标识符
///
/// 唯一标识一种编码格式, 与容器格式无关.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CodecId {
    /// 未知编解码器
    None,

    // ========================
    // 视频编解码器
    // ========================
    /// H.264 / AVC
    H264,
    /// H.265 / HEVC
    H265,
    /// H.266 / VVC
    H266,
    /// VP8
    Vp8,
    /// VP9
    Vp9,
    /// AV1
    Av1,
    /// MPEG-1 Video
    Mpeg1Video,
    /// MPEG-2 Video
    Mpeg2Video,
    /// MPEG-4 Part 2
    Mpeg4,
    /// H.263 (3GP)
    H263,
    /// Motion JPEG
    Mjpeg,
    /// Apple ProRes
    ProRes,
    /// Raw 视频 (未压缩)
    RawVideo,

    // ========================
    // 音频编解码器
    // ========================
    /// AAC
    Aac,
    /// MP3
    Mp3,
    /// MP2
    Mp2,
    /// Opus
    Opus,
    /// Vorbis
    Vorbis,
    /// FLAC
    Flac,
    /// Apple Lossless (ALAC)
    Alac,
    /// AC-3
    Ac3,
    /// E-AC-3
    Eac3,
    /// AC-4
    Ac4,
    /// DTS
    Dts,
    /// AMR 窄带
    AmrNb,
    /// AMR 宽带
    AmrWb,
    /// PCM 有符号 16 位大端
    PcmS16be,
    /// PCM 有符号 16 位小端
    PcmS16le,
    /// PCM 有符号 24 位大端
    PcmS24be,
    /// PCM 有符号 32 位大端
    PcmS32be,
    /// PCM 32 位浮点大端
    PcmF32be,
    /// PCM 64 位浮点大端
    PcmF64be,
    /// PCM 无符号 8 位
    PcmU8,
    /// G.711 A-law
    PcmAlaw,
    /// G.711 mu-law
    PcmMulaw,

    // ========================
    // 字幕编解码器
    // ========================
    /// 3GPP Timed Text (tx3g)
    MovText,
    /// WebVTT
    Webvtt,
    /// TTML (stpp)
    Ttml,
    /// CEA-608 闭路字幕
    Eia608,
}

impl CodecId {
    /// 获取编解码器对应的媒体类型
    pub const fn media_type(&self) -> MediaType {
        match self {
            Self::None => MediaType::Data,

            Self::H264
            | Self::H265
            | Self::H266
            | Self::Vp8
            | Self::Vp9
            | Self::Av1
            | Self::Mpeg1Video
            | Self::Mpeg2Video
            | Self::Mpeg4
            | Self::H263
            | Self::Mjpeg
            | Self::ProRes
            | Self::RawVideo => MediaType::Video,

            Self::Aac
            | Self::Mp3
            | Self::Mp2
            | Self::Opus
            | Self::Vorbis
            | Self::Flac
            | Self::Alac
            | Self::Ac3
            | Self::Eac3
            | Self::Ac4
            | Self::Dts
            | Self::AmrNb
            | Self::AmrWb
            | Self::PcmS16be
            | Self::PcmS16le
            | Self::PcmS24be
            | Self::PcmS32be
            | Self::PcmF32be
            | Self::PcmF64be
            | Self::PcmU8
            | Self::PcmAlaw
            | Self::PcmMulaw => MediaType::Audio,

            Self::MovText | Self::Webvtt | Self::Ttml | Self::Eia608 => MediaType::Subtitle,
        }
    }

    /// 获取编解码器的人类可读名称
    pub const fn name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::H264 => "h264",
            Self::H265 => "hevc",
            Self::H266 => "vvc",
            Self::Vp8 => "vp8",
            Self::Vp9 => "vp9",
            Self::Av1 => "av1",
            Self::Mpeg1Video => "mpeg1video",
            Self::Mpeg2Video => "mpeg2video",
            Self::Mpeg4 => "mpeg4",
            Self::H263 => "h263",
            Self::Mjpeg => "mjpeg",
            Self::ProRes => "prores",
            Self::RawVideo => "rawvideo",
            Self::Aac => "aac",
            Self::Mp3 => "mp3",
            Self::Mp2 => "mp2",
            Self::Opus => "opus",
            Self::Vorbis => "vorbis",
            Self::Flac => "flac",
            Self::Alac => "alac",
            Self::Ac3 => "ac3",
            Self::Eac3 => "eac3",
            Self::Ac4 => "ac4",
            Self::Dts => "dts",
            Self::AmrNb => "amr_nb",
            Self::AmrWb => "amr_wb",
            Self::PcmS16be => "pcm_s16be",
            Self::PcmS16le => "pcm_s16le",
            Self::PcmS24be => "pcm_s24be",
            Self::PcmS32be => "pcm_s32be",
            Self::PcmF32be => "pcm_f32be",
            Self::PcmF64be => "pcm_f64be",
            Self::PcmU8 => "pcm_u8",
            Self::PcmAlaw => "pcm_alaw",
            Self::PcmMulaw => "pcm_mulaw",
            Self::MovText => "mov_text",
            Self::Webvtt => "webvtt",
            Self::Ttml => "ttml",
            Self::Eia608 => "eia_608",
        }
    }

    /// 由采样描述的 FourCC 映射编解码器
    ///
    /// `mp4a`/`mp4v` 只能给出大类, 具体编码需要再查 esds 的
    /// objectTypeIndication (见 [`CodecId::from_object_type`]).
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Self {
        match fourcc {
            // 视频
            b"avc1" | b"avc2" | b"avc3" | b"avc4" | b"h264" => Self::H264,
            b"hvc1" | b"hev1" | b"dvh1" | b"dvhe" => Self::H265,
            b"vvc1" | b"vvi1" => Self::H266,
            b"dvav" | b"dva1" => Self::H264,
            b"vp08" => Self::Vp8,
            b"vp09" => Self::Vp9,
            b"av01" | b"dav1" => Self::Av1,
            b"mp4v" => Self::Mpeg4,
            b"s263" | b"h263" => Self::H263,
            b"mjpa" | b"mjpb" | b"jpeg" => Self::Mjpeg,
            b"apcn" | b"apch" | b"apcs" | b"apco" | b"ap4h" | b"ap4x" => Self::ProRes,
            b"raw " => Self::RawVideo,
            b"m2v1" | b"hdv2" | b"xdvc" => Self::Mpeg2Video,
            // 音频
            b"mp4a" => Self::Aac,
            b".mp3" | b"ms\0\x55" => Self::Mp3,
            b"Opus" => Self::Opus,
            b"fLaC" => Self::Flac,
            b"alac" => Self::Alac,
            b"ac-3" | b"sac3" => Self::Ac3,
            b"ec-3" => Self::Eac3,
            b"ac-4" => Self::Ac4,
            b"dtsc" | b"dtsh" | b"dtsl" | b"dtse" => Self::Dts,
            b"samr" => Self::AmrNb,
            b"sawb" => Self::AmrWb,
            b"twos" => Self::PcmS16be,
            b"sowt" => Self::PcmS16le,
            b"in24" => Self::PcmS24be,
            b"in32" => Self::PcmS32be,
            b"fl32" => Self::PcmF32be,
            b"fl64" => Self::PcmF64be,
            b"lpcm" => Self::PcmS16be,
            b"raw\0" => Self::PcmU8,
            b"alaw" => Self::PcmAlaw,
            b"ulaw" => Self::PcmMulaw,
            // 字幕
            b"tx3g" | b"text" => Self::MovText,
            b"wvtt" => Self::Webvtt,
            b"stpp" => Self::Ttml,
            b"c608" => Self::Eia608,
            _ => Self::None,
        }
    }

    /// 由 MPEG-4 系统层 objectTypeIndication 映射编解码器 (esds)
    pub fn from_object_type(oti: u8) -> Option<Self> {
        match oti {
            0x20 => Some(Self::Mpeg4),
            0x21 => Some(Self::H264),
            0x23 => Some(Self::H265),
            0x40 | 0x66..=0x68 => Some(Self::Aac),
            0x60..=0x65 => Some(Self::Mpeg2Video),
            0x69 | 0x6B => Some(Self::Mp3),
            0x6A => Some(Self::Mpeg1Video),
            0x6C => Some(Self::Mjpeg),
            0xA5 => Some(Self::Ac3),
            0xA6 => Some(Self::Eac3),
            0xA9 => Some(Self::Dts),
            0xAD => Some(Self::Opus),
            0xDD => Some(Self::Vorbis),
            _ => None,
        }
    }
}

impl fmt::Display for CodecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
