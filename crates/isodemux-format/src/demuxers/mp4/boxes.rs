//! MP4 Box (Atom) 头部解析.
//!
//! ISO 14496-12 定义的 Box 结构:
//! ```text
//! Size:       4 bytes (big-endian, 含头部本身)
//! Type:       4 bytes (FourCC)
//! [ExtSize]:  8 bytes (仅当 Size==1 时存在, 64-bit 大小)
//! [UserType]: 16 bytes (仅当 Type=="uuid" 时存在)
//! ```
//!
//! 特殊大小值:
//! - 0: Box 延伸到所在容器 (顶层即文件) 末尾
//! - 1: 使用 64-bit 扩展大小
//!
//! 头部解析是无状态的: 输入一段字节, 要么得到完整头部, 要么得到
//! 还需要多少字节. 拉模式与推模式共用同一套逻辑.

use std::fmt;

use isodemux_core::{ByteReader, IsoError, IsoResult};

use crate::io::IoContext;

/// Box 类型枚举 (解封装器关心的 FourCC)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoxType {
    Ftyp,
    Styp,
    Moov,
    Mvhd,
    Trak,
    Tkhd,
    Edts,
    Elst,
    Mdia,
    Mdhd,
    Hdlr,
    Minf,
    Dinf,
    Stbl,
    Stsd,
    Stts,
    Ctts,
    Stsc,
    Stsz,
    Stz2,
    Stco,
    Co64,
    Stss,
    Mvex,
    Mehd,
    Trex,
    Moof,
    Mfhd,
    Traf,
    Tfhd,
    Tfdt,
    Trun,
    Senc,
    Saiz,
    Saio,
    Sinf,
    Frma,
    Schm,
    Schi,
    Tenc,
    Pssh,
    Mdat,
    Free,
    Skip,
    Wide,
    Udta,
    Meta,
    Sidx,
    Mfra,
    Uuid,
    /// 未知 box 类型
    Unknown([u8; 4]),
}

const KNOWN_BOXES: &[([u8; 4], BoxType)] = &[
    (*b"ftyp", BoxType::Ftyp),
    (*b"styp", BoxType::Styp),
    (*b"moov", BoxType::Moov),
    (*b"mvhd", BoxType::Mvhd),
    (*b"trak", BoxType::Trak),
    (*b"tkhd", BoxType::Tkhd),
    (*b"edts", BoxType::Edts),
    (*b"elst", BoxType::Elst),
    (*b"mdia", BoxType::Mdia),
    (*b"mdhd", BoxType::Mdhd),
    (*b"hdlr", BoxType::Hdlr),
    (*b"minf", BoxType::Minf),
    (*b"dinf", BoxType::Dinf),
    (*b"stbl", BoxType::Stbl),
    (*b"stsd", BoxType::Stsd),
    (*b"stts", BoxType::Stts),
    (*b"ctts", BoxType::Ctts),
    (*b"stsc", BoxType::Stsc),
    (*b"stsz", BoxType::Stsz),
    (*b"stz2", BoxType::Stz2),
    (*b"stco", BoxType::Stco),
    (*b"co64", BoxType::Co64),
    (*b"stss", BoxType::Stss),
    (*b"mvex", BoxType::Mvex),
    (*b"mehd", BoxType::Mehd),
    (*b"trex", BoxType::Trex),
    (*b"moof", BoxType::Moof),
    (*b"mfhd", BoxType::Mfhd),
    (*b"traf", BoxType::Traf),
    (*b"tfhd", BoxType::Tfhd),
    (*b"tfdt", BoxType::Tfdt),
    (*b"trun", BoxType::Trun),
    (*b"senc", BoxType::Senc),
    (*b"saiz", BoxType::Saiz),
    (*b"saio", BoxType::Saio),
    (*b"sinf", BoxType::Sinf),
    (*b"frma", BoxType::Frma),
    (*b"schm", BoxType::Schm),
    (*b"schi", BoxType::Schi),
    (*b"tenc", BoxType::Tenc),
    (*b"pssh", BoxType::Pssh),
    (*b"mdat", BoxType::Mdat),
    (*b"free", BoxType::Free),
    (*b"skip", BoxType::Skip),
    (*b"wide", BoxType::Wide),
    (*b"udta", BoxType::Udta),
    (*b"meta", BoxType::Meta),
    (*b"sidx", BoxType::Sidx),
    (*b"mfra", BoxType::Mfra),
    (*b"uuid", BoxType::Uuid),
];

impl BoxType {
    /// 从 4 字节 FourCC 创建
    pub fn from_fourcc(fourcc: &[u8; 4]) -> Self {
        KNOWN_BOXES
            .iter()
            .find(|(cc, _)| cc == fourcc)
            .map_or(Self::Unknown(*fourcc), |&(_, t)| t)
    }

    /// 对应的 FourCC
    pub fn fourcc(&self) -> [u8; 4] {
        match self {
            Self::Unknown(cc) => *cc,
            known => KNOWN_BOXES
                .iter()
                .find(|(_, t)| t == known)
                .map_or(*b"????", |&(cc, _)| cc),
        }
    }

    /// 是否为只包含子 box 的容器 (解析 box 树时向下展开)
    pub fn is_container(&self) -> bool {
        matches!(
            self,
            Self::Moov
                | Self::Trak
                | Self::Edts
                | Self::Mdia
                | Self::Minf
                | Self::Dinf
                | Self::Stbl
                | Self::Mvex
                | Self::Moof
                | Self::Traf
                | Self::Sinf
                | Self::Schi
        )
    }
}

impl fmt::Display for BoxType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.fourcc()))
    }
}

/// 已知的扩展类型 (uuid box)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UuidKind {
    /// PIFF 采样加密 (等价于 senc)
    PiffSampleEncryption,
    /// PIFF 轨道加密 (等价于 tenc)
    PiffTrackEncryption,
    /// PIFF 保护系统头 (等价于 pssh)
    PiffPssh,
    /// XMP 元数据
    Xmp,
    /// 其他厂商扩展
    Other,
}

const PIFF_SAMPLE_ENCRYPTION: [u8; 16] = [
    0xA2, 0x39, 0x4F, 0x52, 0x5A, 0x9B, 0x4F, 0x14, 0xA2, 0x44, 0x6C, 0x42, 0x7C, 0x64, 0x8D, 0xF4,
];
const PIFF_TRACK_ENCRYPTION: [u8; 16] = [
    0x89, 0x74, 0xDB, 0xCE, 0x7B, 0xE7, 0x4C, 0x51, 0x84, 0xF9, 0x71, 0x48, 0xF9, 0x88, 0x25, 0x54,
];
const PIFF_PSSH: [u8; 16] = [
    0xD0, 0x8A, 0x4F, 0x18, 0x10, 0xF3, 0x4A, 0x82, 0xB6, 0xC8, 0x32, 0xD8, 0xAB, 0xA1, 0x83, 0x3D,
];
const XMP_UUID: [u8; 16] = [
    0xBE, 0x7A, 0xCF, 0xCB, 0x97, 0xA9, 0x42, 0xE8, 0x9C, 0x71, 0x99, 0x94, 0x91, 0xE3, 0xAF, 0xAC,
];

impl UuidKind {
    /// 识别扩展类型
    pub fn from_uuid(uuid: &[u8; 16]) -> Self {
        match *uuid {
            PIFF_SAMPLE_ENCRYPTION => Self::PiffSampleEncryption,
            PIFF_TRACK_ENCRYPTION => Self::PiffTrackEncryption,
            PIFF_PSSH => Self::PiffPssh,
            XMP_UUID => Self::Xmp,
            _ => Self::Other,
        }
    }

    /// 对应的 16 字节 UUID (Other 没有固定值)
    pub fn uuid(&self) -> Option<[u8; 16]> {
        match self {
            Self::PiffSampleEncryption => Some(PIFF_SAMPLE_ENCRYPTION),
            Self::PiffTrackEncryption => Some(PIFF_TRACK_ENCRYPTION),
            Self::PiffPssh => Some(PIFF_PSSH),
            Self::Xmp => Some(XMP_UUID),
            Self::Other => None,
        }
    }
}

/// 已解析的 Box 头部
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxHeader {
    /// Box 类型
    pub box_type: BoxType,
    /// Box 总大小 (含头部, 0 表示延伸到容器末尾)
    pub size: u64,
    /// 头部大小 (8, 16, 或加上 uuid 的 24/32 字节)
    pub header_size: u64,
    /// 扩展类型 (仅 uuid box)
    pub user_type: Option<[u8; 16]>,
}

impl BoxHeader {
    /// 是否延伸到容器末尾
    pub fn extends_to_end(&self) -> bool {
        self.size == 0
    }

    /// 内容区域大小 (不含头部)
    pub fn content_size(&self) -> u64 {
        if self.size == 0 {
            u64::MAX // 延伸到容器末尾
        } else {
            self.size - self.header_size
        }
    }

    /// 给定容器剩余字节数时的实际总大小
    pub fn resolved_size(&self, available: u64) -> u64 {
        if self.size == 0 {
            available
        } else {
            self.size
        }
    }

    /// uuid box 的扩展类型
    pub fn uuid_kind(&self) -> Option<UuidKind> {
        self.user_type.as_ref().map(UuidKind::from_uuid)
    }
}

/// 头部解析结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderParse {
    /// 头部完整
    Complete(BoxHeader),
    /// 至少需要这么多字节才能解析头部
    NeedMore(usize),
}

/// 从字节切片解析一个 Box 头部
///
/// # 参数
/// - `data`: 从 box 起点开始的字节
/// - `offset`: box 在输入中的绝对偏移 (用于错误定位)
/// - `max_size`: 声明大小的安全上限, 0 表示不检查
pub fn parse_box_header(data: &[u8], offset: u64, max_size: u64) -> IsoResult<HeaderParse> {
    if data.len() < 8 {
        return Ok(HeaderParse::NeedMore(8));
    }
    let mut r = ByteReader::new(data);
    let size32 = r.read_u32()?;
    let fourcc = r.read_fourcc()?;
    let box_type = BoxType::from_fourcc(&fourcc);

    let (size, mut header_size) = if size32 == 1 {
        if data.len() < 16 {
            return Ok(HeaderParse::NeedMore(16));
        }
        (r.read_u64()?, 16u64)
    } else {
        (u64::from(size32), 8u64)
    };

    let user_type = if box_type == BoxType::Uuid {
        let needed = header_size as usize + 16;
        if data.len() < needed {
            return Ok(HeaderParse::NeedMore(needed));
        }
        header_size += 16;
        Some(r.read_uuid()?)
    } else {
        None
    };

    if size != 0 && size < header_size {
        return Err(IsoError::structural(
            offset,
            box_type,
            None,
            format!("声明大小 {size} 小于头部大小 {header_size}"),
        ));
    }
    if max_size > 0 && size > max_size {
        return Err(IsoError::SizeCeiling {
            offset,
            box_type: box_type.to_string(),
            size,
            limit: max_size,
        });
    }

    Ok(HeaderParse::Complete(BoxHeader {
        box_type,
        size,
        header_size,
        user_type,
    }))
}

/// 在随机访问输入的指定位置读取 Box 头部
///
/// 剩余字节不足以构成头部时返回 `Ok(None)` (文件尾部的残留数据).
pub fn read_box_header_at(
    io: &mut IoContext,
    pos: u64,
    max_size: u64,
) -> IsoResult<Option<BoxHeader>> {
    let probe = io.read_at_most(pos, 32)?;
    match parse_box_header(&probe, pos, max_size)? {
        HeaderParse::Complete(header) => Ok(Some(header)),
        HeaderParse::NeedMore(_) => Ok(None),
    }
}

/// 顺序遍历一段字节中的子 box, 不向下展开
///
/// 用于采样条目这类 "固定字段 + 子 box" 的结构. 遇到损坏的头部或
/// 越界的大小时停止.
pub struct BoxIter<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Iterator for BoxIter<'a> {
    type Item = (BoxHeader, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.pos..)?;
        let HeaderParse::Complete(header) = parse_box_header(rest, self.pos as u64, 0).ok()? else {
            return None;
        };
        let size = header.resolved_size(rest.len() as u64);
        if size > rest.len() as u64 {
            return None;
        }
        let payload = &rest[header.header_size as usize..size as usize];
        self.pos += size as usize;
        Some((header, payload))
    }
}

/// 遍历 `data` 中紧密排列的 box
pub fn iter_boxes(data: &[u8]) -> BoxIter<'_> {
    BoxIter { data, pos: 0 }
}

/// ftyp/styp Box 数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FtypBox {
    /// 主品牌
    pub major_brand: [u8; 4],
    /// 次版本号
    pub minor_version: u32,
    /// 兼容品牌列表
    pub compatible_brands: Vec<[u8; 4]>,
}

impl FtypBox {
    /// 解析 ftyp box 内容
    pub fn parse(payload: &[u8]) -> IsoResult<Self> {
        let mut r = ByteReader::new(payload);
        let major_brand = r.read_fourcc()?;
        let minor_version = r.read_u32()?;

        let mut compatible_brands = Vec::with_capacity(r.remaining() / 4);
        while r.remaining() >= 4 {
            compatible_brands.push(r.read_fourcc()?);
        }

        Ok(Self {
            major_brand,
            minor_version,
            compatible_brands,
        })
    }

    /// 获取主品牌字符串
    pub fn major_brand_str(&self) -> String {
        String::from_utf8_lossy(&self.major_brand).to_string()
    }

    /// 是否声明了某个品牌 (主品牌或兼容品牌)
    pub fn has_brand(&self, brand: &[u8; 4]) -> bool {
        &self.major_brand == brand || self.compatible_brands.iter().any(|b| b == brand)
    }

    /// 兼容品牌列表字符串, 逗号分隔
    pub fn compatible_brands_str(&self) -> String {
        self.compatible_brands
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}
