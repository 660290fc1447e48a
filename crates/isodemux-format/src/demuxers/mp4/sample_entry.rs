//! 采样描述 (stsd) 解析.
//!
//! 每个采样条目由固定字段加若干子 box 组成:
//! - 视觉条目: 宽高/深度/压缩器名称, 子 box 有 avcC/hvcC/av1C/vpcC,
//!   pasp (像素宽高比), colr (色彩), mdcv/clli (HDR), dvcC/dvvC (Dolby Vision)
//! - 音频条目: 声道/位深/采样率, QuickTime 声音描述 v1/v2 带扩展字段,
//!   子 box 有 esds/dOps/dfLa/alac/dac3/dec3/dac4, 以及 QuickTime 的 wave
//! - 字幕条目: tx3g/wvtt/stpp/c608
//! - 加密条目: encv/enca, 真实格式记录在 sinf/frma 中

use isodemux_codec::CodecId;
use isodemux_core::{ByteReader, IsoResult, MediaType, Rational};
use log::{debug, warn};

use super::boxes::iter_boxes;
use super::protection::{TrackProtection, parse_sinf};
use crate::stream::{ColorInfo, DolbyVisionConfig, HdrMetadata};

/// 视觉采样条目参数
#[derive(Debug, Clone, PartialEq)]
pub struct VisualEntry {
    pub width: u16,
    pub height: u16,
    pub depth: u16,
    /// 压缩器名称
    pub compressor: String,
    /// 像素宽高比 (pasp), 未声明时为 1:1
    pub pixel_aspect: Rational,
    pub color: Option<ColorInfo>,
    pub hdr: Option<HdrMetadata>,
}

/// 音频采样条目参数
#[derive(Debug, Clone, PartialEq)]
pub struct AudioEntry {
    /// 声音描述版本 (QuickTime v0/v1/v2)
    pub version: u16,
    pub channels: u32,
    pub sample_size: u32,
    pub sample_rate: u32,
    /// 每个数据包的采样数 (v1/v2, 其余为 0)
    pub samples_per_packet: u32,
    /// 每帧字节数 (v1/v2, 其余为 0)
    pub bytes_per_frame: u32,
}

/// 字幕采样条目参数
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SubtitleEntry {
    /// stpp 的命名空间或 wvtt 的 MIME
    pub namespace: Option<String>,
}

/// 条目类型相关参数
#[derive(Debug, Clone, PartialEq)]
pub enum EntryParams {
    Visual(VisualEntry),
    Audio(AudioEntry),
    Subtitle(SubtitleEntry),
    Other,
}

/// 一个采样描述
#[derive(Debug, Clone, PartialEq)]
pub struct SampleDescription {
    /// stsd 中出现的 FourCC (受保护轨道为 encv/enca)
    pub fourcc: [u8; 4],
    /// 真实格式 FourCC (frma 或与 fourcc 相同)
    pub codec_tag: [u8; 4],
    /// 编解码器
    pub codec_id: CodecId,
    /// 媒体类型
    pub media_type: MediaType,
    /// 数据引用索引
    pub data_reference_index: u16,
    /// 编解码器私有数据
    pub extra_data: Vec<u8>,
    /// 类型相关参数
    pub params: EntryParams,
    /// 保护参数 (仅受保护条目)
    pub protection: Option<TrackProtection>,
    /// Dolby Vision 配置
    pub dolby_vision: Option<DolbyVisionConfig>,
}

impl SampleDescription {
    /// FourCC 字符串 (真实格式)
    pub fn codec_tag_str(&self) -> String {
        String::from_utf8_lossy(&self.codec_tag).into_owned()
    }
}

/// 解析 stsd (Sample Description Box) 内容
///
/// 损坏的单个条目会被跳过, 返回剩余可用条目.
pub fn parse_stsd(payload: &[u8], handler: MediaType) -> IsoResult<Vec<SampleDescription>> {
    let mut r = ByteReader::new(payload);
    r.read_full_box_header()?;
    let entry_count = r.read_u32()?;

    let mut descriptions = Vec::new();
    for (header, body) in iter_boxes(r.rest()).take(entry_count as usize) {
        let fourcc = header.box_type.fourcc();
        match parse_sample_entry(fourcc, body, handler) {
            Ok(desc) => descriptions.push(desc),
            Err(e) => warn!(
                "stsd: 条目 {} 解析失败, 跳过: {}",
                String::from_utf8_lossy(&fourcc),
                e
            ),
        }
    }
    Ok(descriptions)
}

/// 由 FourCC 与 handler 决定条目结构
fn entry_media_type(fourcc: &[u8; 4], handler: MediaType) -> MediaType {
    match fourcc {
        b"encv" => MediaType::Video,
        b"enca" => MediaType::Audio,
        _ => match CodecId::from_fourcc(fourcc) {
            CodecId::None => handler,
            codec => codec.media_type(),
        },
    }
}

fn parse_sample_entry(
    fourcc: [u8; 4],
    body: &[u8],
    handler: MediaType,
) -> IsoResult<SampleDescription> {
    let mut r = ByteReader::new(body);
    r.skip(6)?; // reserved
    let data_reference_index = r.read_u16()?;

    let mut desc = SampleDescription {
        fourcc,
        codec_tag: fourcc,
        codec_id: CodecId::from_fourcc(&fourcc),
        media_type: entry_media_type(&fourcc, handler),
        data_reference_index,
        extra_data: Vec::new(),
        params: EntryParams::Other,
        protection: None,
        dolby_vision: None,
    };

    match desc.media_type {
        MediaType::Video => {
            let mut visual = parse_visual_fields(&mut r)?;
            parse_children(r.rest(), &mut desc, Some(&mut visual))?;
            desc.params = EntryParams::Visual(visual);
        }
        MediaType::Audio => {
            let audio = parse_audio_fields(&mut r)?;
            parse_children(r.rest(), &mut desc, None)?;
            desc.params = EntryParams::Audio(audio);
        }
        MediaType::Subtitle => {
            let subtitle = parse_subtitle_fields(&fourcc, &mut r, &mut desc)?;
            desc.params = EntryParams::Subtitle(subtitle);
        }
        MediaType::Data => {
            debug!("stsd: 数据条目 {}", String::from_utf8_lossy(&fourcc));
        }
    }

    if let Some(prot) = &desc.protection {
        desc.codec_tag = prot.original_format;
        desc.codec_id = CodecId::from_fourcc(&prot.original_format);
    }
    Ok(desc)
}

fn parse_visual_fields(r: &mut ByteReader<'_>) -> IsoResult<VisualEntry> {
    r.skip(16)?; // pre_defined + reserved + pre_defined[3]
    let width = r.read_u16()?;
    let height = r.read_u16()?;
    r.skip(12)?; // 水平/垂直分辨率 + reserved
    let _frame_count = r.read_u16()?;
    let name = r.read_bytes(32)?;
    let name_len = (name[0] as usize).min(31);
    let compressor = String::from_utf8_lossy(&name[1..1 + name_len]).into_owned();
    let depth = r.read_u16()?;
    let _pre_defined = r.read_i16()?;

    Ok(VisualEntry {
        width,
        height,
        depth,
        compressor,
        pixel_aspect: Rational::new(1, 1),
        color: None,
        hdr: None,
    })
}

fn parse_audio_fields(r: &mut ByteReader<'_>) -> IsoResult<AudioEntry> {
    let version = r.read_u16()?;
    r.skip(6)?; // revision + vendor
    let mut audio = AudioEntry {
        version,
        channels: u32::from(r.read_u16()?),
        sample_size: u32::from(r.read_u16()?),
        sample_rate: 0,
        samples_per_packet: 0,
        bytes_per_frame: 0,
    };
    r.skip(4)?; // compression_id + packet_size
    audio.sample_rate = r.read_fixed16_16()?;

    match version {
        1 => {
            audio.samples_per_packet = r.read_u32()?;
            let _bytes_per_packet = r.read_u32()?;
            audio.bytes_per_frame = r.read_u32()?;
            let _bytes_per_sample = r.read_u32()?;
        }
        2 => {
            let _struct_size = r.read_u32()?;
            audio.sample_rate = f64::from_bits(r.read_u64()?).round() as u32;
            audio.channels = r.read_u32()?;
            r.skip(4)?; // always 0x7F000000
            audio.sample_size = r.read_u32()?;
            let _format_flags = r.read_u32()?;
            audio.bytes_per_frame = r.read_u32()?;
            audio.samples_per_packet = r.read_u32()?;
        }
        _ => {}
    }
    Ok(audio)
}

fn parse_subtitle_fields(
    fourcc: &[u8; 4],
    r: &mut ByteReader<'_>,
    desc: &mut SampleDescription,
) -> IsoResult<SubtitleEntry> {
    let mut entry = SubtitleEntry::default();
    match fourcc {
        b"stpp" => {
            entry.namespace = Some(r.read_cstring()?);
        }
        b"wvtt" => {
            entry.namespace = Some("text/vtt".into());
            for (header, body) in iter_boxes(r.rest()) {
                if &header.box_type.fourcc() == b"vttC" {
                    desc.extra_data = body.to_vec();
                }
            }
        }
        b"tx3g" => {
            // 显示标志/对齐/背景色/文本框/样式记录, 整体作为私有数据
            desc.extra_data = r.rest().to_vec();
        }
        _ => {}
    }
    Ok(entry)
}

/// 解析采样条目内的子 box
fn parse_children(
    data: &[u8],
    desc: &mut SampleDescription,
    mut visual: Option<&mut VisualEntry>,
) -> IsoResult<()> {
    for (header, body) in iter_boxes(data) {
        match &header.box_type.fourcc() {
            b"sinf" => desc.protection = Some(parse_sinf(body)?),
            b"avcC" | b"hvcC" | b"vvcC" | b"av1C" | b"vpcC" | b"dOps" | b"dfLa" | b"alac"
            | b"dac3" | b"dec3" | b"dac4" | b"glbl" => {
                desc.extra_data = body.to_vec();
            }
            b"esds" => parse_esds(body, desc)?,
            b"wave" => parse_children(body, desc, None)?,
            b"dvcC" | b"dvvC" | b"dvwC" => {
                desc.dolby_vision = Some(parse_dolby_vision(body)?);
            }
            b"pasp" => {
                if let Some(v) = visual.as_deref_mut() {
                    let mut r = ByteReader::new(body);
                    let h = r.read_u32()? as i32;
                    let vs = r.read_u32()? as i32;
                    if h > 0 && vs > 0 {
                        v.pixel_aspect = Rational::new(h, vs).reduce();
                    }
                }
            }
            b"colr" => {
                if let Some(v) = visual.as_deref_mut() {
                    v.color = parse_colr(body)?.or(v.color);
                }
            }
            b"mdcv" => {
                if let Some(v) = visual.as_deref_mut() {
                    let hdr = v.hdr.get_or_insert_with(HdrMetadata::default);
                    parse_mdcv(body, hdr)?;
                }
            }
            b"clli" => {
                if let Some(v) = visual.as_deref_mut() {
                    let hdr = v.hdr.get_or_insert_with(HdrMetadata::default);
                    let mut r = ByteReader::new(body);
                    hdr.max_content_light_level = Some(r.read_u16()?);
                    hdr.max_frame_average_light_level = Some(r.read_u16()?);
                }
            }
            _ => debug!("采样条目: 跳过子 box {}", header.box_type),
        }
    }
    Ok(())
}

/// 解析 colr, 只识别 nclx/nclc, ICC 配置文件忽略
fn parse_colr(body: &[u8]) -> IsoResult<Option<ColorInfo>> {
    let mut r = ByteReader::new(body);
    let colour_type = r.read_fourcc()?;
    match &colour_type {
        b"nclx" | b"nclc" => {
            let primaries = r.read_u16()?;
            let transfer = r.read_u16()?;
            let matrix = r.read_u16()?;
            let full_range = if &colour_type == b"nclx" {
                r.read_u8()? & 0x80 != 0
            } else {
                false
            };
            Ok(Some(ColorInfo {
                primaries,
                transfer,
                matrix,
                full_range,
            }))
        }
        _ => Ok(None),
    }
}

fn parse_mdcv(body: &[u8], hdr: &mut HdrMetadata) -> IsoResult<()> {
    let mut r = ByteReader::new(body);
    let mut primaries = [(0u16, 0u16); 3];
    for p in &mut primaries {
        *p = (r.read_u16()?, r.read_u16()?);
    }
    hdr.display_primaries = Some(primaries);
    hdr.white_point = Some((r.read_u16()?, r.read_u16()?));
    hdr.max_luminance = Some(r.read_u32()?);
    hdr.min_luminance = Some(r.read_u32()?);
    Ok(())
}

fn parse_dolby_vision(body: &[u8]) -> IsoResult<DolbyVisionConfig> {
    let mut r = ByteReader::new(body);
    let version_major = r.read_u8()?;
    let version_minor = r.read_u8()?;
    let bits = r.read_u16()?;
    let compat = r.read_u8()?;
    Ok(DolbyVisionConfig {
        version_major,
        version_minor,
        profile: (bits >> 9) as u8,
        level: ((bits >> 3) & 0x3F) as u8,
        rpu_present: bits & 0x4 != 0,
        el_present: bits & 0x2 != 0,
        bl_present: bits & 0x1 != 0,
        bl_signal_compatibility_id: compat >> 4,
    })
}

/// 读取 MPEG-4 描述符长度 (每字节 7 位, 最多 4 字节)
fn read_descriptor_len(r: &mut ByteReader<'_>) -> IsoResult<usize> {
    let mut len = 0usize;
    for _ in 0..4 {
        let b = r.read_u8()?;
        len = (len << 7) | usize::from(b & 0x7F);
        if b & 0x80 == 0 {
            break;
        }
    }
    Ok(len)
}

/// 解析 esds: 用 objectTypeIndication 细化编解码器, 取出
/// DecoderSpecificInfo 作为私有数据
fn parse_esds(body: &[u8], desc: &mut SampleDescription) -> IsoResult<()> {
    let mut r = ByteReader::new(body);
    r.read_full_box_header()?;

    while r.remaining() >= 2 {
        let tag = r.read_u8()?;
        let len = read_descriptor_len(&mut r)?;
        match tag {
            // ES_Descriptor: 只跳过头部字段, 子描述符继续顺序解析
            0x03 => {
                r.skip(2)?; // ES_ID
                let flags = r.read_u8()?;
                if flags & 0x80 != 0 {
                    r.skip(2)?;
                }
                if flags & 0x40 != 0 {
                    let url_len = r.read_u8()? as usize;
                    r.skip(url_len)?;
                }
                if flags & 0x20 != 0 {
                    r.skip(2)?;
                }
            }
            // DecoderConfigDescriptor
            0x04 => {
                let oti = r.read_u8()?;
                r.skip(12)?; // streamType + bufferSize + maxBitrate + avgBitrate
                match CodecId::from_object_type(oti) {
                    Some(codec) => desc.codec_id = codec,
                    None => debug!("esds: 未知 objectTypeIndication 0x{:02x}", oti),
                }
            }
            // DecoderSpecificInfo
            0x05 => {
                desc.extra_data = r.read_bytes(len)?.to_vec();
                break;
            }
            _ => r.skip(len.min(r.remaining()))?,
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_box(fourcc: &[u8; 4], payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(8 + payload.len() as u32).to_be_bytes());
        out.extend_from_slice(fourcc);
        out.extend_from_slice(payload);
        out
    }

    fn stsd(entries: &[Vec<u8>]) -> Vec<u8> {
        let mut p = vec![0, 0, 0, 0];
        p.extend_from_slice(&(entries.len() as u32).to_be_bytes());
        for e in entries {
            p.extend_from_slice(e);
        }
        p
    }

    fn visual_entry(fourcc: &[u8; 4], children: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; 6];
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&[0u8; 16]);
        body.extend_from_slice(&1920u16.to_be_bytes());
        body.extend_from_slice(&1080u16.to_be_bytes());
        body.extend_from_slice(&[0u8; 12]);
        body.extend_from_slice(&1u16.to_be_bytes());
        let mut name = [0u8; 32];
        name[0] = 4;
        name[1..5].copy_from_slice(b"test");
        body.extend_from_slice(&name);
        body.extend_from_slice(&24u16.to_be_bytes());
        body.extend_from_slice(&(-1i16).to_be_bytes());
        body.extend_from_slice(children);
        make_box(fourcc, &body)
    }

    fn audio_entry(fourcc: &[u8; 4], version: u16, children: &[u8]) -> Vec<u8> {
        let mut body = vec![0u8; 6];
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(&version.to_be_bytes());
        body.extend_from_slice(&[0u8; 6]);
        body.extend_from_slice(&2u16.to_be_bytes());
        body.extend_from_slice(&16u16.to_be_bytes());
        body.extend_from_slice(&[0u8; 4]);
        body.extend_from_slice(&(48000u32 << 16).to_be_bytes());
        if version == 1 {
            body.extend_from_slice(&1024u32.to_be_bytes());
            body.extend_from_slice(&0u32.to_be_bytes());
            body.extend_from_slice(&4u32.to_be_bytes());
            body.extend_from_slice(&2u32.to_be_bytes());
        }
        body.extend_from_slice(children);
        make_box(fourcc, &body)
    }

    #[test]
    fn test_解析_视频条目() {
        let mut children = make_box(b"avcC", &[1, 0x64, 0, 0x28]);
        children.extend_from_slice(&make_box(b"pasp", &[0, 0, 0, 4, 0, 0, 0, 2]));
        children.extend_from_slice(&make_box(b"colr", b"nclx\0\x09\0\x10\0\x09\x80"));
        children.extend_from_slice(&make_box(b"clli", &[0x03, 0xE8, 0x01, 0x90]));
        let descs = parse_stsd(&stsd(&[visual_entry(b"avc1", &children)]), MediaType::Video).unwrap();
        assert_eq!(descs.len(), 1);
        let d = &descs[0];
        assert_eq!(d.codec_id, CodecId::H264);
        assert_eq!(d.extra_data, vec![1, 0x64, 0, 0x28]);
        let EntryParams::Visual(v) = &d.params else {
            panic!("应为视频条目");
        };
        assert_eq!((v.width, v.height, v.depth), (1920, 1080, 24));
        assert_eq!(v.compressor, "test");
        assert_eq!(v.pixel_aspect, Rational::new(2, 1));
        let color = v.color.unwrap();
        assert_eq!((color.primaries, color.transfer), (9, 16));
        assert!(color.full_range);
        assert_eq!(v.hdr.unwrap().max_content_light_level, Some(1000));
    }

    #[test]
    fn test_解析_esds_细化编解码器() {
        // ES_Descriptor(DecoderConfig(oti=0x6B), DecSpecificInfo)
        let mut esds = vec![0, 0, 0, 0];
        esds.extend_from_slice(&[0x03, 22, 0, 1, 0]);
        esds.extend_from_slice(&[0x04, 15, 0x6B, 0x15]);
        esds.extend_from_slice(&[0u8; 11]);
        esds.extend_from_slice(&[0x05, 2, 0x12, 0x10]);
        let entry = audio_entry(b"mp4a", 0, &make_box(b"esds", &esds));
        let descs = parse_stsd(&stsd(&[entry]), MediaType::Audio).unwrap();
        assert_eq!(descs[0].codec_id, CodecId::Mp3);
        assert_eq!(descs[0].extra_data, vec![0x12, 0x10]);
        let EntryParams::Audio(a) = &descs[0].params else {
            panic!("应为音频条目");
        };
        assert_eq!((a.channels, a.sample_rate, a.sample_size), (2, 48000, 16));
    }

    #[test]
    fn test_解析_quicktime_声音描述_v1() {
        let entry = audio_entry(b"twos", 1, &[]);
        let descs = parse_stsd(&stsd(&[entry]), MediaType::Audio).unwrap();
        let EntryParams::Audio(a) = &descs[0].params else {
            panic!("应为音频条目");
        };
        assert_eq!(a.samples_per_packet, 1024);
        assert_eq!(a.bytes_per_frame, 4);
        assert_eq!(descs[0].codec_id, CodecId::PcmS16be);
    }

    #[test]
    fn test_解析_加密条目_还原真实格式() {
        let mut sinf = make_box(b"frma", b"hvc1");
        let mut schm = vec![0, 0, 0, 0];
        schm.extend_from_slice(b"cbcs");
        schm.extend_from_slice(&0x0001_0000u32.to_be_bytes());
        sinf.extend_from_slice(&make_box(b"schm", &schm));
        let mut children = make_box(b"hvcC", &[1, 2, 3]);
        children.extend_from_slice(&make_box(b"sinf", &sinf));
        children.extend_from_slice(&make_box(b"dvvC", &[1, 0, 0x10, 0x35, 0x60]));

        let descs = parse_stsd(&stsd(&[visual_entry(b"encv", &children)]), MediaType::Video).unwrap();
        let d = &descs[0];
        assert_eq!(&d.fourcc, b"encv");
        assert_eq!(d.codec_tag_str(), "hvc1");
        assert_eq!(d.codec_id, CodecId::H265);
        assert_eq!(&d.protection.as_ref().unwrap().scheme_type, b"cbcs");
        let dv = d.dolby_vision.unwrap();
        assert_eq!(dv.profile, 8);
        assert_eq!(dv.level, 6);
        assert!(dv.rpu_present && !dv.el_present && dv.bl_present);
        assert_eq!(dv.bl_signal_compatibility_id, 6);
    }

    #[test]
    fn test_解析_字幕条目() {
        let mut body = vec![0u8; 6];
        body.extend_from_slice(&1u16.to_be_bytes());
        body.extend_from_slice(b"http://www.w3.org/ns/ttml\0\0\0");
        let descs = parse_stsd(&stsd(&[make_box(b"stpp", &body)]), MediaType::Subtitle).unwrap();
        assert_eq!(descs[0].codec_id, CodecId::Ttml);
        let EntryParams::Subtitle(s) = &descs[0].params else {
            panic!("应为字幕条目");
        };
        assert_eq!(s.namespace.as_deref(), Some("http://www.w3.org/ns/ttml"));
    }
}
