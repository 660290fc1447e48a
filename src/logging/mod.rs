//! 日志子系统.
//!
//! 库 crate 通过 `log` 门面输出, 这里安装 `tracing` 订阅器统一收集:
//! - 控制台: 彩色, 带模块路径
//! - 文件: 按日期命名 (`<prefix>.YYYY-MM-DD.log`), 非阻塞写入
//!
//! 文件日志的保留清理、历史压缩与跨日翻滚由后台任务负责,
//! 需要在 tokio 运行时内调用 [`init`].

use anyhow::{Context, Result};
use chrono::{Datelike, Local, NaiveDate, Timelike};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing_subscriber::{
    EnvFilter, Registry,
    fmt::{self, FormatEvent, FormatFields, format::Writer},
    layer::{Layer, SubscriberExt},
    registry::LookupSpan,
    util::SubscriberInitExt,
};

mod task;

pub use task::{CleanupReport, cleanup_logs};

/// 日志配置
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// 文件日志级别 (EnvFilter 语法, 如 `info,isodemux_format=debug`)
    pub level: String,
    /// 控制台日志级别, 为空时不输出到控制台
    pub console_level: String,
    /// 日志目录, 为空时不写文件
    pub directory: String,
    pub file_prefix: String,
    pub retention_days: i64,
    /// 压缩历史日志 (.log.gz)
    pub compress_history: bool,
    pub cleanup_interval_seconds: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            console_level: "warn".to_string(),
            directory: String::new(),
            file_prefix: "isodemux".to_string(),
            retention_days: 30,
            compress_history: true,
            cleanup_interval_seconds: 3600,
        }
    }
}

impl LoggingConfig {
    /// 仅控制台输出
    pub fn console(level: &str) -> Self {
        Self {
            console_level: level.to_string(),
            ..Self::default()
        }
    }

    /// 是否写文件日志
    pub fn has_file_output(&self) -> bool {
        !self.directory.is_empty()
    }
}

static LOG_GUARD: OnceLock<tracing_appender::non_blocking::WorkerGuard> = OnceLock::new();

/// 安装全局日志订阅器
///
/// 重复调用返回错误 (全局订阅器只能设置一次).
pub fn init(config: LoggingConfig) -> Result<()> {
    let console_layer = if config.console_level.is_empty() {
        None
    } else {
        Some(
            fmt::Layer::default()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .event_format(ConsoleFormatter)
                .with_filter(EnvFilter::new(&config.console_level)),
        )
    };

    let mut rotate_requested = None;
    let file_layer = if config.has_file_output() {
        std::fs::create_dir_all(&config.directory)
            .with_context(|| format!("创建日志目录失败, path={}", config.directory))?;
        let flag = Arc::new(AtomicBool::new(false));
        let file_appender = CurrentFileWriter::new(
            Path::new(&config.directory),
            &config.file_prefix,
            Arc::clone(&flag),
        )?;
        rotate_requested = Some(flag);

        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        LOG_GUARD.set(guard).ok();
        Some(
            fmt::Layer::default()
                .with_writer(non_blocking)
                .with_ansi(false)
                .event_format(FileFormatter)
                .with_filter(EnvFilter::new(&config.level)),
        )
    } else {
        None
    };

    Registry::default()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("安装日志订阅器失败")?;

    if let Some(flag) = rotate_requested {
        if tokio::runtime::Handle::try_current().is_ok() {
            task::spawn_log_maintenance_task(config, flag);
        } else {
            tracing::warn!("不在 tokio 运行时内, 日志清理与翻滚任务未启动");
        }
    }

    Ok(())
}

/// 写入当天日志文件, 收到翻滚信号后重新打开
struct CurrentFileWriter {
    directory: PathBuf,
    prefix: String,
    rotate_requested: Arc<AtomicBool>,
    file: File,
}

impl CurrentFileWriter {
    fn new(directory: &Path, prefix: &str, rotate_requested: Arc<AtomicBool>) -> Result<Self> {
        let today = Local::now().date_naive();
        let file = open_append_file(&build_current_log_path(directory, prefix, today))?;
        Ok(Self {
            directory: directory.to_path_buf(),
            prefix: prefix.to_string(),
            rotate_requested,
            file,
        })
    }

    fn reopen_current_file(&mut self) -> std::io::Result<()> {
        let today = Local::now().date_naive();
        let path = build_current_log_path(&self.directory, &self.prefix, today);
        self.file = open_append_file(&path).map_err(std::io::Error::other)?;
        Ok(())
    }
}

impl Write for CurrentFileWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.rotate_requested.swap(false, Ordering::AcqRel) {
            self.reopen_current_file()?;
        }
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.file.flush()
    }
}

fn open_append_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("打开日志文件失败, path={}", path.display()))
}

pub(crate) fn build_current_log_path(directory: &Path, prefix: &str, date: NaiveDate) -> PathBuf {
    directory.join(format!("{}.{}.log", prefix, date.format("%Y-%m-%d")))
}

fn write_timestamp(writer: &mut Writer<'_>) -> std::fmt::Result {
    let now = Local::now();
    write!(
        writer,
        "[{:02}-{:02} {:02}:{:02}:{:02}.{:03}] ",
        now.month(),
        now.day(),
        now.hour(),
        now.minute(),
        now.second(),
        now.timestamp_subsec_millis()
    )
}

/// 控制台格式: `[MM-DD hh:mm:ss.mmm] LEVEL target > 消息`
struct ConsoleFormatter;

impl<S, N> FormatEvent<S, N> for ConsoleFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        write_timestamp(&mut writer)?;
        let color = match *meta.level() {
            tracing::Level::ERROR => "\x1b[31m",
            tracing::Level::WARN => "\x1b[33m",
            tracing::Level::INFO => "\x1b[32m",
            _ => "\x1b[34m",
        };
        write!(
            writer,
            "{}{:5}\x1b[0m {} > ",
            color,
            meta.level().to_string(),
            meta.target()
        )?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

/// 文件格式: 无颜色, 其余同控制台
struct FileFormatter;

impl<S, N> FormatEvent<S, N> for FileFormatter
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &fmt::FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> std::fmt::Result {
        let meta = event.metadata();
        write_timestamp(&mut writer)?;
        write!(writer, "{:5} {} > ", meta.level().to_string(), meta.target())?;
        ctx.format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_日志_当前文件路径() {
        let date = NaiveDate::from_ymd_opt(2026, 2, 6);
        match date {
            Some(date) => {
                let path = build_current_log_path(Path::new("logs"), "isodemux", date);
                assert_eq!(path, PathBuf::from("logs/isodemux.2026-02-06.log"));
            }
            None => panic!("测试日期初始化失败"),
        }
    }

    #[test]
    fn test_日志_配置缺省字段() {
        let config: LoggingConfig = serde_json::from_str(r#"{"directory": "logs"}"#)
            .unwrap_or_else(|e| panic!("解析日志配置失败: {}", e));
        assert_eq!(config.level, "info");
        assert_eq!(config.file_prefix, "isodemux");
        assert!(config.has_file_output());
        assert!(!LoggingConfig::default().has_file_output());
        assert_eq!(LoggingConfig::console("debug").console_level, "debug");
    }
}
