//! # isodemux-format
//!
//! ISO BMFF 容器解封装库.
//!
//! 负责输入抽象 (随机访问与顺序推入)、格式探测与注册、轨道输出通道,
//! 以及 MP4/MOV/3GP/fMP4 解封装器本身.

pub mod adapter;
pub mod config;
pub mod demuxer;
pub mod demuxers;
pub mod format_id;
pub mod io;
pub mod output;
pub mod probe;
pub mod registry;
pub mod stream;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

// 重导出常用类型
pub use config::DemuxConfig;
pub use demuxer::{Demuxer, SeekFlags, SeekOutcome, SeekRequest, SeekStatus, SeekTarget};
pub use demuxers::mp4::{DemuxState, InputMode, Mp4Demuxer, Mp4Probe};
pub use format_id::FormatId;
pub use io::IoContext;
pub use output::{FlowCombiner, FlowResult, OutputManager, Segment, TrackOutput};
pub use probe::ProbeResult;
pub use registry::FormatRegistry;
pub use stream::Stream;

/// 注册所有内置容器格式
pub fn register_all(registry: &mut FormatRegistry) {
    demuxers::register_all_demuxers(registry);
}
