//! 定位规划.
//!
//! 只依赖采样索引的纯函数: 给定目标时间或字节位置, 计算每条轨道
//! 应该从哪个采样开始输出. 状态修改由解封装器完成.

use super::sample_table::SampleIndex;

/// 时间定位规划结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SeekPlan {
    /// 起始采样位置
    pub position: usize,
    /// 目标超出已知范围, 已定位到最后一个已知采样
    pub clamped: bool,
}

/// 规划时间定位
///
/// 返回显示时间不晚于 `target` 的最后一个同步采样. 没有同步采样表的
/// 轨道每个采样都是同步采样, 直接落在目标采样上.
///
/// # 参数
/// - `target`: 目标显示时间 (媒体时间刻度, 已包含编辑偏移)
/// - `offset`: 轨道显示时间偏移
/// - `any`: 允许落在非同步采样上
pub fn plan_time(index: &SampleIndex, target: i64, offset: i64, any: bool) -> Option<SeekPlan> {
    if index.is_empty() {
        return None;
    }
    let entries = index.entries();
    let end = index.end_dts() as i64 + offset;
    let clamped = target >= end;

    let syncs = index.sync_positions();
    if any || syncs.is_empty() {
        let position = if clamped {
            entries.len() - 1
        } else {
            // 显示时间可能因 B 帧乱序, 按解码时间定位后回退到不晚于目标的采样
            let n = entries.partition_point(|e| e.dts as i64 + offset <= target);
            n.saturating_sub(1)
        };
        return Some(SeekPlan { position, clamped });
    }

    let n = syncs.partition_point(|&p| entries[p].pts() + offset <= target);
    let position = syncs[n.saturating_sub(1)];
    Some(SeekPlan { position, clamped })
}

/// 规划字节定位: 偏移不小于 `byte` 的第一个同步采样
pub fn plan_byte(index: &SampleIndex, byte: u64) -> Option<usize> {
    let entries = index.entries();
    index
        .sync_positions()
        .iter()
        .copied()
        .find(|&p| entries[p].offset >= byte)
}

/// `from` 之前 (不含) 的最后一个同步采样
pub fn previous_sync(index: &SampleIndex, from: usize) -> Option<usize> {
    let syncs = index.sync_positions();
    let n = syncs.partition_point(|&p| p < from);
    n.checked_sub(1).map(|i| syncs[i])
}

/// `from` 及之后的第一个同步采样
pub fn next_sync(index: &SampleIndex, from: usize) -> Option<usize> {
    let syncs = index.sync_positions();
    syncs.get(syncs.partition_point(|&p| p < from)).copied()
}

/// 是否进入快进/倒放模式
pub fn is_trick_rate(rate: f64, base_rate: f64) -> bool {
    rate < 0.0 || rate.abs() >= base_rate
}

/// 快进/倒放的同步采样步长: max(1, floor(|rate| / base_rate))
pub fn trick_stride(rate: f64, base_rate: f64) -> usize {
    if base_rate <= 0.0 {
        return 1;
    }
    ((rate.abs() / base_rate).floor() as usize).max(1)
}

/// 轨道实际使用的步长
///
/// 同步采样数少于步长时退化为逐个输出所有同步采样.
pub fn effective_stride(sync_count: usize, stride: usize) -> usize {
    if sync_count < stride { 1 } else { stride }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demuxers::mp4::sample_table::IndexEntry;

    /// 30 个采样, 每 10 个一个同步采样, 时长 100
    fn gop_index() -> SampleIndex {
        let mut index = SampleIndex::new();
        for i in 0..30u64 {
            index.push(IndexEntry {
                offset: 1000 + i * 50,
                size: 50,
                dts: i * 100,
                cts_offset: 0,
                duration: 100,
                sync: i % 10 == 0,
                aux: None,
            });
        }
        index
    }

    #[test]
    fn test_时间定位_落在前一个同步采样() {
        let index = gop_index();
        let plan = plan_time(&index, 1550, 0, false).unwrap();
        assert_eq!(plan.position, 10);
        assert!(!plan.clamped);
        // 正好在同步采样上
        assert_eq!(plan_time(&index, 2000, 0, false).unwrap().position, 20);
        // 早于第一个采样
        assert_eq!(plan_time(&index, -500, 0, false).unwrap().position, 0);
    }

    #[test]
    fn test_时间定位_任意帧与编辑偏移() {
        let index = gop_index();
        assert_eq!(plan_time(&index, 1550, 0, true).unwrap().position, 15);
        // 偏移 -200: 显示时间 1550 对应解码时间 1750
        assert_eq!(plan_time(&index, 1550, -200, true).unwrap().position, 17);
    }

    #[test]
    fn test_时间定位_超出时长截断() {
        let index = gop_index();
        let plan = plan_time(&index, 10_000, 0, false).unwrap();
        assert!(plan.clamped);
        assert_eq!(plan.position, 20);
        assert!(plan_time(&SampleIndex::new(), 0, 0, false).is_none());
    }

    #[test]
    fn test_字节定位与同步采样查找() {
        let index = gop_index();
        assert_eq!(plan_byte(&index, 1001), Some(10));
        assert_eq!(plan_byte(&index, 0), Some(0));
        assert_eq!(plan_byte(&index, 999_999), None);
        assert_eq!(previous_sync(&index, 20), Some(10));
        assert_eq!(previous_sync(&index, 0), None);
        assert_eq!(next_sync(&index, 11), Some(20));
        assert_eq!(next_sync(&index, 21), None);
    }

    #[test]
    fn test_快进步长() {
        assert_eq!(trick_stride(2.0, 2.0), 1);
        assert_eq!(trick_stride(8.0, 2.0), 4);
        assert_eq!(trick_stride(-5.0, 2.0), 2);
        assert_eq!(trick_stride(1.0, 2.0), 1);
        assert!(is_trick_rate(-1.0, 2.0));
        assert!(is_trick_rate(4.0, 2.0));
        assert!(!is_trick_rate(1.5, 2.0));
        assert_eq!(effective_stride(3, 4), 1);
        assert_eq!(effective_stride(10, 4), 4);
    }
}
