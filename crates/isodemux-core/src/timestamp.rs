//! 时间戳 tick 换算.
//!
//! 每条轨道有独立的 timescale, 跨轨道比较时间必须先换算.
//! 所有换算通过 i128 交叉乘法完成, 避免浮点误差和溢出.

use std::cmp::Ordering;

/// 表示"未定义"的时间戳值, 例如尚未确定解码时间的数据包
pub const NOPTS_VALUE: i64 = i64::MIN;

/// 在两个 timescale 之间换算 tick 值 (向负无穷取整)
///
/// timescale 为 0 时原样返回.
pub fn rescale_ticks(value: i64, from: u32, to: u32) -> i64 {
    if from == 0 || to == 0 || from == to {
        return value;
    }
    let scaled = i128::from(value) * i128::from(to);
    scaled.div_euclid(i128::from(from)) as i64
}

/// tick 转秒
pub fn ticks_to_seconds(ticks: i64, timescale: u32) -> f64 {
    if timescale == 0 {
        return f64::NAN;
    }
    ticks as f64 / f64::from(timescale)
}

/// 比较两个不同 timescale 下的时间点
pub fn cmp_ticks(a: i64, a_scale: u32, b: i64, b_scale: u32) -> Ordering {
    let lhs = i128::from(a) * i128::from(b_scale.max(1));
    let rhs = i128::from(b) * i128::from(a_scale.max(1));
    lhs.cmp(&rhs)
}
