//! # isodemux
//!
//! 纯 Rust 实现的 ISO BMFF 容器解封装框架.
//!
//! 支持 MP4 / MOV / 3GP / 分片 MP4 (fMP4, CMAF) 两种输入方式:
//! - **拉模式**: 可随机访问的输入 ([`format::IoContext`]), 支持定位、倒放与快进
//! - **推模式**: 只追加的数据块 ([`format::Mp4Demuxer::push_chunk`]), 适合直播与渐进下载
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use isodemux::format::{Demuxer, IoContext};
//!
//! let registry = isodemux::default_format_registry();
//! let mut io = IoContext::open_read("movie.mp4").unwrap();
//! let mut demuxer = registry.open_input(&mut io, Some("movie.mp4")).unwrap();
//! for stream in demuxer.streams() {
//!     println!("#{} {} {}", stream.index, stream.media_type, stream.codec_id);
//! }
//! while let Ok(packet) = demuxer.read_packet(&mut io) {
//!     println!("{} dts={}", packet.stream_index, packet.dts);
//! }
//! ```
//!
//! # Crate 结构
//!
//! | Crate | 功能 |
//! |-------|------|
//! | `isodemux-core` | 错误类型, 媒体类型, 时间基, 字节读取 |
//! | `isodemux-codec` | 编解码器标识, 数据包, 加密附加信息 |
//! | `isodemux-format` | I/O, 解封装器框架, ISO BMFF 解封装器 |

/// 核心类型与工具
pub use isodemux_core as core;

/// 编解码器标识与数据包
pub use isodemux_codec as codec;

/// 容器格式框架与 ISO BMFF 解封装器
pub use isodemux_format as format;

pub mod config;
pub mod logging;

pub use config::AppConfig;

/// 获取版本号
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// 创建已注册所有内置容器格式的注册表
pub fn default_format_registry() -> isodemux_format::FormatRegistry {
    format_registry_with(isodemux_format::DemuxConfig::default())
}

/// 使用指定解封装配置创建注册表
pub fn format_registry_with(config: isodemux_format::DemuxConfig) -> isodemux_format::FormatRegistry {
    let mut registry = isodemux_format::FormatRegistry::with_config(config);
    isodemux_format::register_all(&mut registry);
    registry
}
