//! 通用加密 (Common Encryption) 元数据解析.
//!
//! 解封装器不做任何解密, 只负责把下列 box 中的参数整理出来:
//! - sinf/frma/schm/schi/tenc: 轨道级保护方案与默认参数
//! - pssh: 文件级 DRM 系统信息
//! - senc (及 PIFF uuid 变体): 逐采样 IV 与子采样区间
//! - saiz/saio: 逐采样附加信息的大小与位置 (没有 senc 时使用)

use bytes::Bytes;
use isodemux_codec::{SampleProtection, Subsample};
use isodemux_core::{ByteReader, IsoError, IsoResult};
use log::{debug, warn};

use super::boxes::{BoxType, UuidKind, iter_boxes};
use crate::stream::ProtectionScheme;

/// 轨道级保护参数
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackProtection {
    /// 方案类型 (cenc/cbcs/cens/cbc1, PIFF 文件为 piff)
    pub scheme_type: [u8; 4],
    /// 方案版本
    pub scheme_version: u32,
    /// 原始采样描述 FourCC (frma)
    pub original_format: [u8; 4],
    /// 默认是否加密
    pub default_is_protected: bool,
    /// 默认密钥 ID
    pub default_kid: [u8; 16],
    /// 逐采样 IV 大小 (0 表示使用常量 IV)
    pub default_iv_size: u8,
    /// 常量 IV (cbcs 常见)
    pub constant_iv: Option<Bytes>,
    /// 模式加密: 加密块数
    pub crypt_byte_block: u8,
    /// 模式加密: 跳过块数
    pub skip_byte_block: u8,
}

impl Default for TrackProtection {
    fn default() -> Self {
        Self {
            scheme_type: *b"cenc",
            scheme_version: 0x0001_0000,
            original_format: [0; 4],
            default_is_protected: true,
            default_kid: [0; 16],
            default_iv_size: 8,
            constant_iv: None,
            crypt_byte_block: 0,
            skip_byte_block: 0,
        }
    }
}

impl TrackProtection {
    /// 转换为流级保护方案描述
    pub fn to_scheme(&self) -> ProtectionScheme {
        ProtectionScheme {
            scheme_type: String::from_utf8_lossy(&self.scheme_type).into_owned(),
            scheme_version: self.scheme_version,
            original_format: String::from_utf8_lossy(&self.original_format).into_owned(),
            default_kid: to_hex(&self.default_kid),
        }
    }

    /// 结合逐采样信息生成数据包附带的加密参数
    pub fn sample_protection(&self, aux: &SampleAuxInfo) -> SampleProtection {
        let iv = if aux.iv.is_empty() {
            self.constant_iv.clone().unwrap_or_default()
        } else {
            aux.iv.clone()
        };
        SampleProtection {
            scheme_type: self.scheme_type,
            key_id: self.default_kid,
            iv,
            subsamples: aux.subsamples.clone(),
            crypt_byte_block: self.crypt_byte_block,
            skip_byte_block: self.skip_byte_block,
        }
    }
}

/// 单个采样的附加加密信息 (senc 或 saiz/saio 指向的数据)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SampleAuxInfo {
    /// 初始化向量
    pub iv: Bytes,
    /// 子采样区间
    pub subsamples: Vec<Subsample>,
}

/// 文件级保护系统信息 (pssh)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectionSystem {
    /// DRM 系统 ID
    pub system_id: [u8; 16],
    /// 密钥 ID 列表 (pssh v1)
    pub key_ids: Vec<[u8; 16]>,
    /// 系统私有数据
    pub data: Bytes,
}

impl ProtectionSystem {
    /// 系统 ID 的十六进制表示
    pub fn system_id_hex(&self) -> String {
        to_hex(&self.system_id)
    }
}

/// 字节转小写十六进制字符串
pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// 解析 sinf (Protection Scheme Information Box) 的内容
pub fn parse_sinf(payload: &[u8]) -> IsoResult<TrackProtection> {
    let mut prot = TrackProtection::default();
    for (header, body) in iter_boxes(payload) {
        match header.box_type {
            BoxType::Frma => {
                prot.original_format = ByteReader::new(body).read_fourcc()?;
            }
            BoxType::Schm => {
                let mut r = ByteReader::new(body);
                r.read_full_box_header()?;
                prot.scheme_type = r.read_fourcc()?;
                prot.scheme_version = r.read_u32()?;
            }
            BoxType::Schi => parse_schi(body, &mut prot)?,
            _ => debug!("sinf: 跳过 {}", header.box_type),
        }
    }
    Ok(prot)
}

fn parse_schi(payload: &[u8], prot: &mut TrackProtection) -> IsoResult<()> {
    for (header, body) in iter_boxes(payload) {
        match (header.box_type, header.uuid_kind()) {
            (BoxType::Tenc, _) => parse_tenc(body, prot)?,
            (BoxType::Uuid, Some(UuidKind::PiffTrackEncryption)) => {
                parse_piff_tenc(body, prot)?;
                if prot.scheme_type == *b"cenc" {
                    prot.scheme_type = *b"piff";
                }
            }
            _ => debug!("schi: 跳过 {}", header.box_type),
        }
    }
    Ok(())
}

/// 解析 tenc (Track Encryption Box)
pub fn parse_tenc(payload: &[u8], prot: &mut TrackProtection) -> IsoResult<()> {
    let mut r = ByteReader::new(payload);
    let (version, _flags) = r.read_full_box_header()?;
    r.skip(1)?; // reserved
    let pattern = r.read_u8()?;
    if version > 0 {
        prot.crypt_byte_block = pattern >> 4;
        prot.skip_byte_block = pattern & 0x0F;
    }
    prot.default_is_protected = r.read_u8()? != 0;
    prot.default_iv_size = r.read_u8()?;
    prot.default_kid = r.read_uuid()?;
    if prot.default_is_protected && prot.default_iv_size == 0 {
        let len = r.read_u8()? as usize;
        prot.constant_iv = Some(Bytes::copy_from_slice(r.read_bytes(len)?));
    }
    Ok(())
}

/// 解析 PIFF 轨道加密 uuid box
fn parse_piff_tenc(payload: &[u8], prot: &mut TrackProtection) -> IsoResult<()> {
    let mut r = ByteReader::new(payload);
    r.read_full_box_header()?;
    let algorithm = r.read_u24()?;
    prot.default_is_protected = algorithm != 0;
    prot.default_iv_size = r.read_u8()?;
    prot.default_kid = r.read_uuid()?;
    Ok(())
}

/// 解析 pssh (Protection System Specific Header Box)
///
/// `piff` 为 true 时按 PIFF uuid 变体解析 (没有 KID 列表).
pub fn parse_pssh(payload: &[u8], piff: bool) -> IsoResult<ProtectionSystem> {
    let mut r = ByteReader::new(payload);
    let (version, _flags) = r.read_full_box_header()?;
    let system_id = r.read_uuid()?;

    let mut key_ids = Vec::new();
    if version > 0 && !piff {
        let count = r.read_u32()? as usize;
        if count.saturating_mul(16) > r.remaining() {
            return Err(IsoError::Truncated {
                needed: count.saturating_mul(16),
                available: r.remaining(),
            });
        }
        for _ in 0..count {
            key_ids.push(r.read_uuid()?);
        }
    }
    let data_size = r.read_u32()? as usize;
    let data = Bytes::copy_from_slice(r.read_bytes(data_size)?);

    Ok(ProtectionSystem {
        system_id,
        key_ids,
        data,
    })
}

/// 读取一个采样的附加信息 (IV + 可选子采样表)
fn read_aux_entry(r: &mut ByteReader<'_>, iv_size: u8, with_subsamples: bool) -> IsoResult<SampleAuxInfo> {
    let iv = Bytes::copy_from_slice(r.read_bytes(iv_size as usize)?);
    let mut subsamples = Vec::new();
    if with_subsamples {
        let count = r.read_u16()? as usize;
        if count * 6 > r.remaining() {
            return Err(IsoError::Truncated {
                needed: count * 6,
                available: r.remaining(),
            });
        }
        subsamples.reserve(count);
        for _ in 0..count {
            let clear_bytes = r.read_u16()?;
            let encrypted_bytes = r.read_u32()?;
            subsamples.push(Subsample {
                clear_bytes,
                encrypted_bytes,
            });
        }
    }
    Ok(SampleAuxInfo { iv, subsamples })
}

/// 解析 senc (Sample Encryption Box) 或 PIFF 采样加密 uuid box
///
/// # 参数
/// - `iv_size`: 轨道 tenc 声明的逐采样 IV 大小
/// - `piff`: 是否为 PIFF 变体 (flags & 0x1 时内嵌覆盖参数)
/// - `max_samples`: traf 的采样数, 条目数不能超过它
pub fn parse_senc(
    payload: &[u8],
    iv_size: u8,
    piff: bool,
    max_samples: usize,
) -> IsoResult<Vec<SampleAuxInfo>> {
    let mut r = ByteReader::new(payload);
    let (_version, flags) = r.read_full_box_header()?;
    let mut iv_size = iv_size;
    if piff && flags & 0x1 != 0 {
        r.skip(3)?; // AlgorithmID
        iv_size = r.read_u8()?;
        r.skip(16)?; // KID
    }
    let with_subsamples = flags & 0x2 != 0;
    let count = r.read_u32()? as usize;
    if count > max_samples {
        return Err(IsoError::InvalidData(format!(
            "senc 条目数 {} 超过采样数 {}",
            count, max_samples
        )));
    }
    // 每项至少包含 IV 与子采样计数
    let min_entry = iv_size as usize + if with_subsamples { 2 } else { 0 };
    if count.saturating_mul(min_entry) > r.remaining() {
        return Err(IsoError::Truncated {
            needed: count.saturating_mul(min_entry),
            available: r.remaining(),
        });
    }

    let mut samples = Vec::with_capacity(count.min(r.remaining()));
    for _ in 0..count {
        samples.push(read_aux_entry(&mut r, iv_size, with_subsamples)?);
    }
    Ok(samples)
}

/// saiz (Sample Auxiliary Information Sizes Box)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SaizBox {
    /// 附加信息类型 (flags & 1 时存在)
    pub aux_info_type: Option<[u8; 4]>,
    /// 默认大小, 0 表示逐采样大小
    pub default_size: u8,
    /// 逐采样大小
    pub sizes: Vec<u8>,
    /// 采样数
    pub sample_count: u32,
}

impl SaizBox {
    /// 第 `idx` 个采样的附加信息大小
    pub fn size_of(&self, idx: usize) -> u8 {
        if self.default_size != 0 {
            self.default_size
        } else {
            self.sizes.get(idx).copied().unwrap_or(0)
        }
    }

    /// 所有附加信息的总字节数
    pub fn total_size(&self) -> u64 {
        if self.default_size != 0 {
            u64::from(self.default_size) * u64::from(self.sample_count)
        } else {
            self.sizes.iter().map(|&s| u64::from(s)).sum()
        }
    }
}

/// 解析 saiz
pub fn parse_saiz(payload: &[u8]) -> IsoResult<SaizBox> {
    let mut r = ByteReader::new(payload);
    let (_version, flags) = r.read_full_box_header()?;
    let aux_info_type = if flags & 1 != 0 {
        let t = r.read_fourcc()?;
        r.skip(4)?; // aux_info_type_parameter
        Some(t)
    } else {
        None
    };
    let default_size = r.read_u8()?;
    let sample_count = r.read_u32()?;
    let sizes = if default_size == 0 {
        r.read_bytes(sample_count as usize)?.to_vec()
    } else {
        Vec::new()
    };
    Ok(SaizBox {
        aux_info_type,
        default_size,
        sizes,
        sample_count,
    })
}

/// 解析 saio, 返回偏移列表
pub fn parse_saio(payload: &[u8]) -> IsoResult<Vec<u64>> {
    let mut r = ByteReader::new(payload);
    let (version, flags) = r.read_full_box_header()?;
    if flags & 1 != 0 {
        r.skip(8)?; // aux_info_type + parameter
    }
    let count = r.read_u32()? as usize;
    let width = if version == 0 { 4 } else { 8 };
    if count.saturating_mul(width) > r.remaining() {
        return Err(IsoError::Truncated {
            needed: count.saturating_mul(width),
            available: r.remaining(),
        });
    }
    let mut offsets = Vec::with_capacity(count);
    for _ in 0..count {
        offsets.push(r.read_u32_or_u64(version != 0)?);
    }
    Ok(offsets)
}

/// 按 saiz 描述的大小解析连续存放的附加信息
///
/// 大小超过 IV 时, IV 之后是子采样表.
pub fn parse_aux_data(data: &[u8], saiz: &SaizBox, iv_size: u8) -> IsoResult<Vec<SampleAuxInfo>> {
    let count = saiz.sample_count as usize;
    if saiz.default_size == 0 && count > saiz.sizes.len() {
        return Err(IsoError::InvalidData(format!(
            "saiz 采样数 {} 多于大小表 {} 项",
            count,
            saiz.sizes.len()
        )));
    }
    if saiz.total_size() > data.len() as u64 {
        return Err(IsoError::Truncated {
            needed: usize::try_from(saiz.total_size()).unwrap_or(usize::MAX),
            available: data.len(),
        });
    }

    let mut r = ByteReader::new(data);
    let mut samples = Vec::with_capacity(count.min(data.len()));
    for i in 0..count {
        let size = saiz.size_of(i) as usize;
        let start = r.position();
        let entry = read_aux_entry(&mut r, iv_size, size > iv_size as usize)?;
        if r.position() - start != size {
            warn!(
                "采样附加信息: 第 {} 项声明 {} 字节, 实际解析 {} 字节",
                i,
                size,
                r.position() - start
            );
            r.seek(start + size)?;
        }
        samples.push(entry);
    }
    Ok(samples)
}
