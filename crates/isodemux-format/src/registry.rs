//! 容器格式注册表.
//!
//! 管理所有已注册的解封装器, 支持按格式标识查找和自动探测.

use std::collections::HashMap;

use isodemux_core::{IsoError, IsoResult};

use crate::config::DemuxConfig;
use crate::demuxer::Demuxer;
use crate::format_id::FormatId;
use crate::io::IoContext;
use crate::probe::{FormatProbe, PROBE_BUFFER_SIZE, ProbeResult};

/// 解封装器工厂函数类型
pub type DemuxerFactory = fn(DemuxConfig) -> IsoResult<Box<dyn Demuxer>>;

/// 容器格式注册表
pub struct FormatRegistry {
    /// 解封装器工厂映射
    demuxers: HashMap<FormatId, DemuxerEntry>,
    /// 格式探测器列表
    probes: Vec<Box<dyn FormatProbe + Send>>,
    /// 创建解封装器时使用的配置
    config: DemuxConfig,
}

/// 解封装器注册条目
struct DemuxerEntry {
    /// 格式名称
    name: String,
    /// 工厂函数
    factory: DemuxerFactory,
}

impl FormatRegistry {
    /// 创建空的注册表
    pub fn new() -> Self {
        Self::with_config(DemuxConfig::default())
    }

    /// 使用指定配置创建空的注册表
    pub fn with_config(config: DemuxConfig) -> Self {
        Self {
            demuxers: HashMap::new(),
            probes: Vec::new(),
            config,
        }
    }

    /// 注册一个解封装器
    pub fn register_demuxer(
        &mut self,
        format_id: FormatId,
        name: impl Into<String>,
        factory: DemuxerFactory,
    ) {
        self.demuxers.insert(
            format_id,
            DemuxerEntry {
                name: name.into(),
                factory,
            },
        );
    }

    /// 注册一个格式探测器
    pub fn register_probe(&mut self, probe: Box<dyn FormatProbe + Send>) {
        self.probes.push(probe);
    }

    /// 创建指定格式的解封装器实例
    pub fn create_demuxer(&self, format_id: FormatId) -> IsoResult<Box<dyn Demuxer>> {
        let entry = self.demuxers.get(&format_id).ok_or_else(|| {
            IsoError::FormatNotFound(format!("未找到 {} 的解封装器", format_id))
        })?;
        (entry.factory)(self.config.clone())
    }

    /// 探测数据的容器格式
    ///
    /// 遍历所有已注册的探测器, 返回置信度最高的结果.
    pub fn probe(&self, data: &[u8], filename: Option<&str>) -> Option<ProbeResult> {
        let mut best: Option<ProbeResult> = None;
        for probe in &self.probes {
            if let Some((format_id, score)) = probe.probe(data, filename) {
                let is_better = best.as_ref().is_none_or(|b| score > b.score);
                if is_better {
                    best = Some(ProbeResult { format_id, score });
                }
            }
        }
        best
    }

    /// 获取所有已注册的解封装器名称
    pub fn list_demuxers(&self) -> Vec<(FormatId, &str)> {
        self.demuxers
            .iter()
            .map(|(id, entry)| (*id, entry.name.as_str()))
            .collect()
    }

    /// 根据输入自动探测格式并创建解封装器
    ///
    /// 可随机访问的输入会读取头部探测, 然后 seek 回起始位置.
    /// 顺序输入无法回退, 只能依据文件名探测, 失败时按 MP4 处理.
    pub fn open_input(
        &self,
        io: &mut IoContext,
        filename: Option<&str>,
    ) -> IsoResult<Box<dyn Demuxer>> {
        let result = if io.is_seekable() {
            let probe_size = io
                .size()
                .unwrap_or(PROBE_BUFFER_SIZE as u64)
                .min(PROBE_BUFFER_SIZE as u64) as usize;
            let probe_buf = io.read_at_most(0, probe_size)?;
            io.seek(std::io::SeekFrom::Start(0))?;
            self.probe(&probe_buf, filename).ok_or_else(|| {
                IsoError::FormatNotFound("无法识别输入文件格式".to_string())
            })?
        } else {
            self.probe(&[], filename).unwrap_or(ProbeResult {
                format_id: FormatId::Mp4,
                score: 0,
            })
        };

        let mut demuxer = self.create_demuxer(result.format_id)?;
        demuxer.open(io)?;
        Ok(demuxer)
    }
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::new()
    }
}
