//! 解封装器实现模块.

pub mod mp4;

use crate::format_id::FormatId;
use crate::registry::FormatRegistry;

/// 注册所有内置解封装器
///
/// ISO BMFF 家族的所有变体都由同一个解封装器处理.
pub fn register_all_demuxers(registry: &mut FormatRegistry) {
    for &format_id in FormatId::ALL {
        registry.register_demuxer(format_id, format_id.name(), mp4::Mp4Demuxer::create);
    }
    registry.register_probe(Box::new(mp4::Mp4Probe));
}
