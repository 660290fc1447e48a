//! isodemux-probe - ISO BMFF 容器信息探测工具
//!
//! 对标 ffprobe, 输出容器格式、流信息与保护系统,
//! 可选择读取全部数据包、以推模式分块送入, 或先定位再读取.

mod report;

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result, bail};
use clap::Parser;
use log::{debug, info, warn};

use isodemux::AppConfig;
use isodemux::logging::{self, LoggingConfig};
use isodemux_codec::Packet;
use isodemux_core::IsoError;
use isodemux_format::{
    DemuxConfig, DemuxState, Demuxer, FlowResult, IoContext, Mp4Demuxer, OutputManager,
    SeekOutcome, SeekRequest, SeekStatus, Segment, Stream, TrackOutput,
};

use report::{FormatInfo, PacketInfo, ProbeOutput};

/// ISO BMFF 容器信息探测工具
#[derive(Parser, Debug)]
#[command(name = "isodemux-probe", version, about = "纯 Rust ISO BMFF 容器探测工具")]
struct Cli {
    /// 输入文件路径
    input: String,

    /// 输出 JSON 格式
    #[arg(long)]
    json: bool,

    /// 读取全部数据包并逐个列出
    #[arg(long)]
    show_packets: bool,

    /// 以推模式分块送入数据
    #[arg(long)]
    push: bool,

    /// 推模式每块字节数
    #[arg(long, default_value_t = 64 * 1024)]
    chunk_size: usize,

    /// 读取前定位到该时间 (秒)
    #[arg(long)]
    seek: Option<f64>,

    /// 播放速率, 负值表示倒放 (仅拉模式)
    #[arg(long, allow_hyphen_values = true)]
    rate: Option<f64>,

    /// 配置文件 (JSON)
    #[arg(long)]
    config: Option<String>,

    /// 控制台日志详细程度 (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl Cli {
    fn reads_packets(&self) -> bool {
        self.show_packets || self.seek.is_some() || self.rate.is_some()
    }

    fn seek_request(&self) -> Option<SeekRequest> {
        if self.seek.is_none() && self.rate.is_none() {
            return None;
        }
        let request = SeekRequest::seconds(self.seek.unwrap_or(0.0));
        Some(request.with_rate(self.rate.unwrap_or(1.0)))
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(&cli) {
        eprintln!("错误: {e:#}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig {
            logging: LoggingConfig::console("warn"),
            ..AppConfig::default()
        },
    };
    init_logging(&config.logging, cli.verbose)?;
    info!("isodemux-probe {}: {}", isodemux::version(), cli.input);

    let output = if cli.push {
        probe_push(cli, config.demux)?
    } else {
        probe_pull(cli, config.demux)?
    };

    if cli.json {
        println!(
            "{}",
            serde_json::to_string_pretty(&output).context("序列化探测结果失败")?
        );
    } else {
        report::print_text(&output);
    }
    Ok(())
}

fn init_logging(config: &LoggingConfig, verbose: u8) -> Result<()> {
    let mut config = config.clone();
    let console_level = match verbose {
        0 => None,
        1 => Some("info"),
        2 => Some("debug"),
        _ => Some("trace"),
    };
    if let Some(level) = console_level {
        config.console_level = level.to_string();
    }
    logging::init(config)
}

/// 拉模式: 随机访问文件
fn probe_pull(cli: &Cli, demux: DemuxConfig) -> Result<ProbeOutput> {
    let registry = isodemux::format_registry_with(demux);
    let mut io = IoContext::open_read(&cli.input)
        .with_context(|| format!("无法打开文件 '{}'", cli.input))?;
    let mut demuxer = registry
        .open_input(&mut io, Some(&cli.input))
        .context("无法解析文件头部")?;

    let mut output = describe(demuxer.as_ref(), &cli.input, "pull");

    if let Some(request) = cli.seek_request() {
        let outcome = demuxer.seek(&mut io, &request).context("定位失败")?;
        debug!("定位结果: {:?}", outcome);
        output.seek = Some(report::build_seek_info(&outcome));
    }

    if cli.reads_packets() {
        let mut packets = Vec::new();
        loop {
            match demuxer.read_packet(&mut io) {
                Ok(packet) => packets.push(PacketInfo::from_packet(&packet)),
                Err(IsoError::Eof) => break,
                Err(e) => {
                    warn!("读取数据包时出错: {e}");
                    break;
                }
            }
        }
        finish_packets(cli, &mut output, packets);
    }
    Ok(output)
}

/// 推模式下把数据包记录到共享列表的输出通道
struct RecordingOutput {
    packets: Arc<Mutex<Vec<PacketInfo>>>,
}

impl TrackOutput for RecordingOutput {
    fn on_format(&mut self, stream: &Stream) -> FlowResult {
        debug!("流 #{} 格式通告: {}", stream.index, stream.codec_id);
        FlowResult::Ok
    }

    fn on_segment(&mut self, segment: &Segment) -> FlowResult {
        debug!("时间段: 起点 {:.3} 秒, 速率 {}", segment.start, segment.rate);
        FlowResult::Ok
    }

    fn on_packet(&mut self, packet: Packet) -> FlowResult {
        self.packets
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(PacketInfo::from_packet(&packet));
        FlowResult::Ok
    }

    fn on_eos(&mut self) -> FlowResult {
        FlowResult::Ok
    }
}

/// 推模式: 按块送入, 需要时按定位结果的字节偏移续传
fn probe_push(cli: &Cli, demux: DemuxConfig) -> Result<ProbeOutput> {
    if cli.chunk_size == 0 {
        bail!("--chunk-size 必须大于 0");
    }
    if cli.rate.is_some_and(|r| r < 0.0) {
        bail!("推模式不支持倒放");
    }

    let mut file =
        File::open(&cli.input).with_context(|| format!("无法打开文件 '{}'", cli.input))?;
    let mut demuxer = Mp4Demuxer::new(demux);
    let packets = Arc::new(Mutex::new(Vec::new()));
    let shared = Arc::clone(&packets);
    let mut outputs = OutputManager::with_factory(move |_stream: &Stream| {
        Box::new(RecordingOutput {
            packets: Arc::clone(&shared),
        }) as Box<dyn TrackOutput>
    });

    let mut pending_seek = cli.seek_request();
    let mut outcome: Option<SeekOutcome> = None;
    let mut buf = vec![0u8; cli.chunk_size];
    loop {
        let read = file.read(&mut buf).context("读取输入失败")?;
        if read == 0 {
            break;
        }
        let flow = demuxer.push_chunk(&buf[..read], &mut outputs)?;
        if flow == FlowResult::Eos {
            break;
        }
        if let Some(offset) = demuxer.take_restart_offset() {
            debug!("推模式: 从偏移 {} 重新推送", offset);
            file.seek(SeekFrom::Start(offset))
                .with_context(|| format!("无法跳转到偏移 {offset}"))?;
        }

        if demuxer.state() == DemuxState::AcquiringHeader {
            continue;
        }
        if let Some(request) = pending_seek.take() {
            let mut no_io = IoContext::from_memory(Vec::new());
            let result = demuxer.seek(&mut no_io, &request).context("定位失败")?;
            debug!("推模式定位结果: {:?}", result);
            if result.status != SeekStatus::Deferred {
                if let Some(offset) = result.byte_offset {
                    file.seek(SeekFrom::Start(offset))
                        .with_context(|| format!("无法跳转到偏移 {offset}"))?;
                }
            }
            outcome = Some(result);
        }
    }
    demuxer.push_eos(&mut outputs)?;

    let mut output = describe(&demuxer, &cli.input, "push");
    if let Some(outcome) = outcome {
        output.seek = Some(report::build_seek_info(&outcome));
    }
    if cli.reads_packets() {
        let collected = packets.lock().unwrap_or_else(|e| e.into_inner()).clone();
        finish_packets(cli, &mut output, collected);
    }
    Ok(output)
}

/// 格式与流信息
fn describe(demuxer: &dyn Demuxer, filename: &str, input_mode: &str) -> ProbeOutput {
    let streams = demuxer.streams();
    ProbeOutput {
        format: Some(FormatInfo {
            filename: filename.to_string(),
            format_name: demuxer.name().to_string(),
            input_mode: input_mode.to_string(),
            nb_streams: streams.len(),
            duration: demuxer.duration(),
            seekable: demuxer.is_seekable(),
            tags: demuxer.metadata().to_vec(),
        }),
        streams: streams.iter().map(report::build_stream_info).collect(),
        protection_systems: demuxer
            .protection_systems()
            .iter()
            .map(report::build_protection_info)
            .collect(),
        ..ProbeOutput::default()
    }
}

fn finish_packets(cli: &Cli, output: &mut ProbeOutput, packets: Vec<PacketInfo>) {
    output.summary = Some(report::summarize(&packets, output.streams.len()));
    if cli.show_packets {
        output.packets = Some(packets);
    }
}
