//! 轨道输出通道与流结果合并.
//!
//! 每条轨道对应一个 [`TrackOutput`]. [`OutputManager`] 负责按顺序发送
//! 格式通告、时间段通告、数据包和结束信号, 并用 [`FlowCombiner`]
//! 把各通道的返回值合并成一个会话级结果: 单个通道未连接不会阻塞
//! 其他通道, 任一通道的致命结果都会让整个会话失败.

use std::fmt;

use isodemux_codec::Packet;
use log::{debug, warn};

use crate::stream::Stream;

/// 下游返回的流结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowResult {
    /// 正常
    Ok,
    /// 输出未连接 (数据被丢弃, 非致命)
    NotLinked,
    /// 下游正在刷新 (seek 进行中)
    Flushing,
    /// 下游不再需要数据
    Eos,
    /// 格式协商失败 (致命)
    NotNegotiated,
    /// 下游错误 (致命)
    Error,
}

impl FlowResult {
    /// 是否为致命结果
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Error | Self::NotNegotiated)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::NotLinked => "not-linked",
            Self::Flushing => "flushing",
            Self::Eos => "eos",
            Self::NotNegotiated => "not-negotiated",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for FlowResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 时间段通告
///
/// 告诉下游接下来数据的时间范围与播放速率, seek 之后会重新发送.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    /// 播放速率, 负值表示倒放
    pub rate: f64,
    /// 起始时间 (秒)
    pub start: f64,
    /// 结束时间 (秒), None 表示直到流结束
    pub stop: Option<f64>,
    /// 是否紧随一次定位 (不连续)
    pub discont: bool,
}

impl Default for Segment {
    fn default() -> Self {
        Self {
            rate: 1.0,
            start: 0.0,
            stop: None,
            discont: false,
        }
    }
}

/// 单条轨道的输出通道
pub trait TrackOutput: Send {
    /// 一次性格式通告, 早于任何数据包
    fn on_format(&mut self, stream: &Stream) -> FlowResult;
    /// 时间段通告
    fn on_segment(&mut self, segment: &Segment) -> FlowResult;
    /// 数据包
    fn on_packet(&mut self, packet: Packet) -> FlowResult;
    /// 轨道结束
    fn on_eos(&mut self) -> FlowResult;
}

/// 多通道流结果合并器
///
/// 规则:
/// - 任一通道返回 `Error`/`NotNegotiated` 时立即返回该值
/// - 任一通道返回 `Flushing` 时返回 `Flushing`
/// - 所有通道都是 `NotLinked` 时返回 `NotLinked`
/// - 所有通道都是 `Eos` 时返回 `Eos`
/// - 其余情况返回 `Ok`
#[derive(Debug, Default)]
pub struct FlowCombiner {
    last: Vec<FlowResult>,
}

impl FlowCombiner {
    /// 创建合并器, 初始状态全部为 `Ok`
    pub fn new(channels: usize) -> Self {
        Self {
            last: vec![FlowResult::Ok; channels],
        }
    }

    /// 增加一个通道
    pub fn add_channel(&mut self) -> usize {
        self.last.push(FlowResult::Ok);
        self.last.len() - 1
    }

    /// 记录某通道的最新结果并返回合并结果
    pub fn update(&mut self, channel: usize, result: FlowResult) -> FlowResult {
        if let Some(slot) = self.last.get_mut(channel) {
            *slot = result;
        }
        if result.is_fatal() || result == FlowResult::Flushing {
            return result;
        }
        self.combined()
    }

    /// 当前合并结果
    pub fn combined(&self) -> FlowResult {
        if self.last.is_empty() {
            return FlowResult::NotLinked;
        }
        let mut all_not_linked = true;
        let mut all_eos = true;
        for &result in &self.last {
            if result.is_fatal() || result == FlowResult::Flushing {
                return result;
            }
            if result != FlowResult::NotLinked {
                all_not_linked = false;
            }
            if result != FlowResult::Eos {
                all_eos = false;
            }
        }
        if all_not_linked {
            FlowResult::NotLinked
        } else if all_eos {
            FlowResult::Eos
        } else {
            FlowResult::Ok
        }
    }

    /// 重置所有通道为 `Ok` (seek/flush 之后)
    pub fn reset(&mut self) {
        self.last.iter_mut().for_each(|r| *r = FlowResult::Ok);
    }

    /// 下游刷新结束: 刷新中的通道恢复为 `Ok`
    pub fn clear_flushing(&mut self) {
        for r in &mut self.last {
            if *r == FlowResult::Flushing {
                *r = FlowResult::Ok;
            }
        }
    }
}

/// 按流创建输出通道的工厂
pub type OutputFactory = Box<dyn FnMut(&Stream) -> Box<dyn TrackOutput> + Send>;

/// 单个通道的发送状态
struct Channel {
    stream: Stream,
    output: Box<dyn TrackOutput>,
    format_sent: bool,
    segment: Option<Segment>,
    eos_sent: bool,
}

/// 输出管理器
///
/// 保证每个通道的事件顺序: 格式 → 时间段 → 数据包 ... → 结束.
pub struct OutputManager {
    channels: Vec<Channel>,
    combiner: FlowCombiner,
    /// 推模式下头部到达后才知道有哪些流, 由工厂补建通道
    factory: Option<OutputFactory>,
}

impl OutputManager {
    /// 创建空的输出管理器
    pub fn new() -> Self {
        Self {
            channels: Vec::new(),
            combiner: FlowCombiner::default(),
            factory: None,
        }
    }

    /// 创建延迟建立通道的管理器
    ///
    /// 通道在 [`sync_streams`](Self::sync_streams) 时按需创建.
    pub fn with_factory<F>(factory: F) -> Self
    where
        F: FnMut(&Stream) -> Box<dyn TrackOutput> + Send + 'static,
    {
        Self {
            factory: Some(Box::new(factory)),
            ..Self::new()
        }
    }

    /// 为每条流创建输出通道
    pub fn with_streams<F>(streams: &[Stream], mut factory: F) -> Self
    where
        F: FnMut(&Stream) -> Box<dyn TrackOutput>,
    {
        let mut manager = Self::new();
        for stream in streams {
            manager.add_output(stream.clone(), factory(stream));
        }
        manager
    }

    /// 注册一个通道 (按流索引顺序)
    pub fn add_output(&mut self, stream: Stream, output: Box<dyn TrackOutput>) {
        self.combiner.add_channel();
        self.channels.push(Channel {
            stream,
            output,
            format_sent: false,
            segment: Some(Segment::default()),
            eos_sent: false,
        });
    }

    /// 为尚无通道的流补建通道 (需要工厂)
    pub fn sync_streams(&mut self, streams: &[Stream]) {
        let Some(mut factory) = self.factory.take() else {
            return;
        };
        for stream in streams {
            if self.channel_index(stream.index).is_none() {
                let output = factory(stream);
                self.add_output(stream.clone(), output);
            }
        }
        self.factory = Some(factory);
    }

    /// 通道数量
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// 是否没有通道
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn channel_index(&self, stream_index: usize) -> Option<usize> {
        self.channels
            .iter()
            .position(|c| c.stream.index == stream_index)
    }

    /// 确保格式与时间段已发送
    fn prepare(&mut self, ch: usize) -> FlowResult {
        let channel = &mut self.channels[ch];
        if !channel.format_sent {
            channel.format_sent = true;
            debug!(
                "输出: 轨道 {} 格式通告 ({})",
                channel.stream.track_id, channel.stream.codec_id
            );
            let result = channel.output.on_format(&channel.stream);
            if result != FlowResult::Ok {
                return result;
            }
        }
        if let Some(segment) = channel.segment.take() {
            let result = channel.output.on_segment(&segment);
            if result != FlowResult::Ok {
                return result;
            }
        }
        FlowResult::Ok
    }

    /// 向所有通道发送格式与待发的时间段通告
    ///
    /// 已经通告过且没有新时间段的通道不再参与, 可以重复调用.
    pub fn announce(&mut self) -> FlowResult {
        let mut combined = self.combiner.combined();
        for ch in 0..self.channels.len() {
            let channel = &self.channels[ch];
            if channel.eos_sent || (channel.format_sent && channel.segment.is_none()) {
                continue;
            }
            let result = self.prepare(ch);
            combined = self.combiner.update(ch, result);
            if combined.is_fatal() {
                return combined;
            }
        }
        combined
    }

    /// 发送一个数据包
    pub fn push_packet(&mut self, packet: Packet) -> FlowResult {
        let Some(ch) = self.channel_index(packet.stream_index) else {
            warn!("输出: 流 {} 没有对应的通道, 丢弃数据包", packet.stream_index);
            return self.combiner.combined();
        };
        if self.channels[ch].eos_sent {
            return self.combiner.combined();
        }
        let mut result = self.prepare(ch);
        if result == FlowResult::Ok {
            result = self.channels[ch].output.on_packet(packet);
        }
        self.combiner.update(ch, result)
    }

    /// 向某条流发送结束信号 (每条流只发送一次)
    pub fn send_eos(&mut self, stream_index: usize) -> FlowResult {
        let Some(ch) = self.channel_index(stream_index) else {
            return self.combiner.combined();
        };
        if self.channels[ch].eos_sent {
            return self.combiner.combined();
        }
        let mut result = self.prepare(ch);
        self.channels[ch].eos_sent = true;
        if result == FlowResult::Ok || result == FlowResult::NotLinked {
            result = self.channels[ch].output.on_eos();
        }
        // 已结束的通道按 EOS 参与合并
        let result = if result == FlowResult::Ok {
            FlowResult::Eos
        } else {
            result
        };
        self.combiner.update(ch, result)
    }

    /// 向所有尚未结束的流发送结束信号
    pub fn send_eos_all(&mut self) -> FlowResult {
        let indices: Vec<usize> = self.channels.iter().map(|c| c.stream.index).collect();
        let mut combined = self.combiner.combined();
        for index in indices {
            combined = self.send_eos(index);
            if combined.is_fatal() {
                break;
            }
        }
        combined
    }

    /// seek 之后为所有通道安排新的时间段通告
    ///
    /// 已结束的通道会重新打开.
    pub fn new_segment(&mut self, segment: Segment) {
        for channel in &mut self.channels {
            channel.segment = Some(segment);
            channel.eos_sent = false;
        }
        self.combiner.reset();
    }

    /// 某条流是否已发送结束信号
    pub fn is_eos(&self, stream_index: usize) -> bool {
        self.channel_index(stream_index)
            .is_some_and(|ch| self.channels[ch].eos_sent)
    }

    /// 当前合并结果
    pub fn combined(&self) -> FlowResult {
        self.combiner.combined()
    }

    /// 下游刷新结束后恢复输出
    pub fn clear_flushing(&mut self) {
        self.combiner.clear_flushing();
    }
}

impl Default for OutputManager {
    fn default() -> Self {
        Self::new()
    }
}
