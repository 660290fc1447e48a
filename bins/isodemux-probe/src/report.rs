//! 探测结果的结构与输出.

use serde::Serialize;

use isodemux_codec::Packet;
use isodemux_core::MediaType;
use isodemux_format::demuxers::mp4::protection::ProtectionSystem;
use isodemux_format::stream::{AudioStreamParams, StreamParams, VideoStreamParams};
use isodemux_format::{SeekOutcome, SeekStatus, Stream};

/// 完整探测结果
#[derive(Debug, Default, Serialize)]
pub struct ProbeOutput {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<FormatInfo>,
    pub streams: Vec<StreamInfo>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub protection_systems: Vec<ProtectionInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seek: Option<SeekInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packets: Option<Vec<PacketInfo>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<Vec<TrackSummary>>,
}

/// 格式信息
#[derive(Debug, Serialize)]
pub struct FormatInfo {
    pub filename: String,
    pub format_name: String,
    /// 输入方式 (pull/push)
    pub input_mode: String,
    pub nb_streams: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub seekable: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<(String, String)>,
}

/// 流信息
#[derive(Debug, Serialize)]
pub struct StreamInfo {
    pub index: usize,
    pub track_id: u32,
    pub codec_type: String,
    pub codec_name: String,
    pub codec_tag: String,
    pub time_base: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    pub nb_frames: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame_rate: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_aspect_ratio: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channels: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<(String, String)>,
}

/// 保护系统信息
#[derive(Debug, Serialize)]
pub struct ProtectionInfo {
    pub system_id: String,
    pub key_ids: Vec<String>,
    pub data_size: usize,
}

/// 定位结果
#[derive(Debug, Serialize)]
pub struct SeekInfo {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_offset: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<f64>,
}

/// 单个数据包
#[derive(Debug, Clone, Serialize)]
pub struct PacketInfo {
    pub stream_index: usize,
    pub pts: i64,
    pub dts: i64,
    pub duration: i64,
    pub size: usize,
    pub pos: i64,
    pub keyframe: bool,
    pub discont: bool,
    pub encrypted: bool,
}

/// 单条轨道的数据包统计
#[derive(Debug, Clone, Default, Serialize)]
pub struct TrackSummary {
    pub stream_index: usize,
    pub packets: u64,
    pub keyframes: u64,
    pub bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_dts: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_dts: Option<i64>,
}

impl PacketInfo {
    pub fn from_packet(packet: &Packet) -> Self {
        Self {
            stream_index: packet.stream_index,
            pts: packet.pts,
            dts: packet.dts,
            duration: packet.duration,
            size: packet.size(),
            pos: packet.pos,
            keyframe: packet.is_keyframe,
            discont: packet.discont,
            encrypted: packet.protection.is_some(),
        }
    }
}

/// 按流统计数据包
pub fn summarize(packets: &[PacketInfo], nb_streams: usize) -> Vec<TrackSummary> {
    let mut summary: Vec<TrackSummary> = (0..nb_streams)
        .map(|stream_index| TrackSummary {
            stream_index,
            ..TrackSummary::default()
        })
        .collect();
    for p in packets {
        let Some(s) = summary.get_mut(p.stream_index) else {
            continue;
        };
        s.packets += 1;
        s.bytes += p.size as u64;
        if p.keyframe {
            s.keyframes += 1;
        }
        s.first_dts.get_or_insert(p.dts);
        s.last_dts = Some(p.dts);
    }
    summary
}

pub fn build_seek_info(outcome: &SeekOutcome) -> SeekInfo {
    let status = match outcome.status {
        SeekStatus::Done => "done",
        SeekStatus::Deferred => "deferred",
        SeekStatus::Clamped => "clamped",
    };
    SeekInfo {
        status: status.to_string(),
        byte_offset: outcome.byte_offset,
        position: outcome.position,
    }
}

pub fn build_protection_info(system: &ProtectionSystem) -> ProtectionInfo {
    ProtectionInfo {
        system_id: system.system_id_hex(),
        key_ids: system
            .key_ids
            .iter()
            .map(|k| isodemux_format::demuxers::mp4::protection::to_hex(k))
            .collect(),
        data_size: system.data.len(),
    }
}

/// 从 Stream 构建 StreamInfo
pub fn build_stream_info(stream: &Stream) -> StreamInfo {
    let codec_type = match stream.media_type {
        MediaType::Video => "video",
        MediaType::Audio => "audio",
        MediaType::Subtitle => "subtitle",
        MediaType::Data => "data",
    }
    .to_string();

    let mut info = StreamInfo {
        index: stream.index,
        track_id: stream.track_id,
        codec_type,
        codec_name: stream.codec_id.to_string(),
        codec_tag: stream.codec_tag.clone(),
        time_base: format!("{}/{}", stream.time_base.num, stream.time_base.den),
        duration: stream.duration_seconds(),
        nb_frames: stream.nb_frames,
        width: None,
        height: None,
        frame_rate: None,
        sample_aspect_ratio: None,
        sample_rate: None,
        channels: None,
        encryption: stream
            .protection
            .as_ref()
            .map(|p| format!("{} (原始格式 {}, KID {})", p.scheme_type, p.original_format, p.default_kid)),
        tags: stream.metadata.clone(),
    };

    match &stream.params {
        StreamParams::Video(VideoStreamParams {
            width,
            height,
            frame_rate,
            sample_aspect_ratio,
            ..
        }) => {
            info.width = Some(*width);
            info.height = Some(*height);
            if frame_rate.is_valid() && frame_rate.num > 0 {
                info.frame_rate = Some(format!("{}/{}", frame_rate.num, frame_rate.den));
            }
            if sample_aspect_ratio.is_valid() && sample_aspect_ratio.num > 0 {
                info.sample_aspect_ratio = Some(format!(
                    "{}/{}",
                    sample_aspect_ratio.num, sample_aspect_ratio.den
                ));
            }
        }
        StreamParams::Audio(AudioStreamParams {
            sample_rate,
            channels,
            ..
        }) => {
            info.sample_rate = Some(*sample_rate);
            info.channels = Some(*channels);
        }
        _ => {}
    }

    info
}

/// 文本输出
pub fn print_text(output: &ProbeOutput) {
    if let Some(info) = &output.format {
        print_format_text(info);
    }
    print_streams_text(&output.streams);
    if !output.protection_systems.is_empty() {
        println!("[PROTECTION]");
        for system in &output.protection_systems {
            println!("  系统 ID      : {}", system.system_id);
            for kid in &system.key_ids {
                println!("    KID        : {kid}");
            }
            println!("    数据大小   : {} 字节", system.data_size);
        }
        println!("[/PROTECTION]");
        println!();
    }
    if let Some(seek) = &output.seek {
        println!("[SEEK]");
        println!("  状态         : {}", seek.status);
        if let Some(offset) = seek.byte_offset {
            println!("  续传偏移     : {offset}");
        }
        if let Some(position) = seek.position {
            println!("  落点         : {position:.3} 秒");
        }
        println!("[/SEEK]");
        println!();
    }
    if let Some(packets) = &output.packets {
        println!("[PACKETS]");
        for p in packets {
            println!(
                "  #{} dts={} pts={} dur={} size={} pos={}{}{}{}",
                p.stream_index,
                p.dts,
                p.pts,
                p.duration,
                p.size,
                p.pos,
                if p.keyframe { " K" } else { "" },
                if p.discont { " D" } else { "" },
                if p.encrypted { " E" } else { "" },
            );
        }
        println!("[/PACKETS]");
        println!();
    }
    if let Some(summary) = &output.summary {
        print_summary_text(summary);
    }
}

fn print_format_text(info: &FormatInfo) {
    println!("[FORMAT]");
    println!("  文件名       : {}", info.filename);
    println!("  格式名称     : {}", info.format_name);
    println!("  输入方式     : {}", info.input_mode);
    println!("  流数量       : {}", info.nb_streams);
    if let Some(dur) = info.duration {
        println!("  时长         : {dur:.3} 秒");
    }
    println!("  可定位       : {}", if info.seekable { "是" } else { "否" });
    for (key, value) in &info.tags {
        println!("  {key:<13}: {value}");
    }
    println!("[/FORMAT]");
    println!();
}

fn print_streams_text(streams: &[StreamInfo]) {
    for stream in streams {
        println!("[STREAM #{}]", stream.index);
        println!("  轨道 ID      : {}", stream.track_id);
        println!("  类型         : {}", stream.codec_type);
        println!("  编解码器     : {} ({})", stream.codec_name, stream.codec_tag);
        println!("  时间基       : {}", stream.time_base);
        if let Some(dur) = stream.duration {
            println!("  时长         : {dur:.3} 秒");
        }
        if let (Some(w), Some(h)) = (stream.width, stream.height) {
            println!("  分辨率       : {w}x{h}");
        }
        if let Some(fr) = &stream.frame_rate {
            println!("  帧率         : {fr}");
        }
        if let Some(sar) = &stream.sample_aspect_ratio {
            println!("  SAR          : {sar}");
        }
        if let Some(sr) = stream.sample_rate {
            println!("  采样率       : {sr} Hz");
        }
        if let Some(ch) = stream.channels {
            println!("  声道数       : {ch}");
        }
        if let Some(enc) = &stream.encryption {
            println!("  加密         : {enc}");
        }
        if stream.nb_frames > 0 {
            println!("  帧数         : {}", stream.nb_frames);
        }
        for (key, value) in &stream.tags {
            println!("  {key:<13}: {value}");
        }
        println!("[/STREAM]");
        println!();
    }
}

fn print_summary_text(summary: &[TrackSummary]) {
    println!("[SUMMARY]");
    for s in summary {
        println!(
            "  #{}: {} 个数据包 ({} 个关键帧), {} 字节 ({:.2} KB)",
            s.stream_index,
            s.packets,
            s.keyframes,
            s.bytes,
            s.bytes as f64 / 1024.0
        );
        if let (Some(first), Some(last)) = (s.first_dts, s.last_dts) {
            println!("      dts 范围 {first} .. {last}");
        }
    }
    println!("[/SUMMARY]");
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(stream_index: usize, dts: i64, size: usize, keyframe: bool) -> PacketInfo {
        PacketInfo {
            stream_index,
            pts: dts,
            dts,
            duration: 1,
            size,
            pos: 0,
            keyframe,
            discont: false,
            encrypted: false,
        }
    }

    #[test]
    fn test_报告_按流统计() {
        let packets = [
            packet(0, 0, 10, true),
            packet(1, 0, 5, true),
            packet(0, 1, 20, false),
        ];
        let summary = summarize(&packets, 3);
        assert_eq!(summary.len(), 3);
        assert_eq!(summary[0].packets, 2);
        assert_eq!(summary[0].keyframes, 1);
        assert_eq!(summary[0].bytes, 30);
        assert_eq!((summary[0].first_dts, summary[0].last_dts), (Some(0), Some(1)));
        assert_eq!(summary[2].packets, 0);
        assert!(summary[2].first_dts.is_none());
    }

    #[test]
    fn test_报告_json省略空字段() {
        let output = ProbeOutput::default();
        let json = serde_json::to_string(&output).unwrap();
        assert_eq!(json, r#"{"streams":[]}"#);
    }
}
