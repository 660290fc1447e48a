//! 文件日志后台维护: 过期删除, 历史压缩, 跨日翻滚.

use super::{LoggingConfig, build_current_log_path};
use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, TimeZone, Utc};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime};
use tracing::{debug, error};

/// 一次清理的结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// 删除的过期文件数
    pub removed: usize,
    /// 新压缩的历史文件数
    pub compressed: usize,
}

pub(super) fn spawn_log_maintenance_task(config: LoggingConfig, rotate_requested: Arc<AtomicBool>) {
    tokio::spawn(async move {
        let mut cleanup_interval =
            tokio::time::interval(Duration::from_secs(config.cleanup_interval_seconds.max(1)));

        if let Err(err) = ensure_current_log_file(&config, Local::now().date_naive()) {
            error!("初始化当前日志文件失败: {}", err);
        }

        let mut next_rollover_at = next_rollover_or_soon(Local::now());

        loop {
            tokio::select! {
                _ = cleanup_interval.tick() => {
                    run_cleanup(&config, "定时");
                }
                _ = tokio::time::sleep_until(next_rollover_at) => {
                    match ensure_current_log_file(&config, Local::now().date_naive()) {
                        Ok(()) => rotate_requested.store(true, Ordering::Release),
                        Err(err) => error!("日志翻滚失败: {}", err),
                    }
                    run_cleanup(&config, "翻滚后");
                    next_rollover_at = next_rollover_or_soon(Local::now());
                }
            }
        }
    });
}

fn run_cleanup(config: &LoggingConfig, when: &str) {
    match cleanup_logs(config, Local::now().date_naive()) {
        Ok(report) if report != CleanupReport::default() => {
            debug!(
                "{}清理日志: 删除 {} 个, 压缩 {} 个",
                when, report.removed, report.compressed
            );
        }
        Ok(_) => {}
        Err(err) => error!("{}清理日志失败: {}", when, err),
    }
}

fn next_rollover_or_soon(now: DateTime<Local>) -> tokio::time::Instant {
    match compute_next_rollover(now) {
        Ok(at) => at,
        Err(err) => {
            error!("计算下一次翻滚时间失败: {}", err);
            tokio::time::Instant::now() + Duration::from_secs(1)
        }
    }
}

/// 确保 `today` 对应的日志文件存在
fn ensure_current_log_file(config: &LoggingConfig, today: NaiveDate) -> Result<()> {
    let directory = Path::new(&config.directory);
    fs::create_dir_all(directory)?;
    let current_path = build_current_log_path(directory, &config.file_prefix, today);
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(&current_path)
        .with_context(|| format!("创建当前日志文件失败, path={}", current_path.display()))?;
    Ok(())
}

/// 清理日志目录
///
/// 早于 `today - retention_days` 的文件删除; 其余非当天的 `.log`
/// 在 `compress_history` 开启时压缩为 `.log.gz`.
pub fn cleanup_logs(config: &LoggingConfig, today: NaiveDate) -> Result<CleanupReport> {
    let mut report = CleanupReport::default();
    let directory = Path::new(&config.directory);
    if !directory.exists() {
        return Ok(report);
    }

    let cutoff = today - ChronoDuration::days(config.retention_days);

    for entry in fs::read_dir(directory)? {
        let entry = entry?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        let file_path = entry.path();

        let Some((date, compressed)) = parse_rotated_log_name(&file_name, &config.file_prefix) else {
            continue;
        };

        if date < cutoff {
            if fs::remove_file(&file_path).is_ok() {
                report.removed += 1;
            }
            continue;
        }

        if config.compress_history && !compressed && date < today && compress_to_gz(&file_path)? {
            report.compressed += 1;
        }
    }

    Ok(report)
}

/// 压缩为同名 `.gz` 并删除原文件; 目标已存在时跳过并返回 false
fn compress_to_gz(path: &Path) -> Result<bool> {
    let gz_path = PathBuf::from(format!("{}.gz", path.display()));
    if gz_path.exists() {
        return Ok(false);
    }

    let mut input =
        File::open(path).with_context(|| format!("打开待压缩日志失败, path={}", path.display()))?;
    let output = File::create(&gz_path)
        .with_context(|| format!("创建压缩日志失败, path={}", gz_path.display()))?;
    let mut encoder = GzEncoder::new(output, Compression::default());

    let mut buf = [0u8; 8 * 1024];
    loop {
        let read = input.read(&mut buf)?;
        if read == 0 {
            break;
        }
        encoder.write_all(&buf[..read])?;
    }

    encoder.finish()?;
    fs::remove_file(path)
        .with_context(|| format!("删除已压缩日志失败, path={}", path.display()))?;
    Ok(true)
}

/// 解析 `<prefix>.YYYY-MM-DD.log[.gz]`, 返回 (日期, 是否已压缩)
fn parse_rotated_log_name(file_name: &str, prefix: &str) -> Option<(NaiveDate, bool)> {
    let rest = file_name.strip_prefix(prefix)?.strip_prefix('.')?;

    if let Some(date_part) = rest.strip_suffix(".log") {
        return Some((parse_date(date_part)?, false));
    }
    if let Some(date_part) = rest.strip_suffix(".log.gz") {
        return Some((parse_date(date_part)?, true));
    }
    None
}

fn parse_date(value: &str) -> Option<NaiveDate> {
    if value.len() != 10 {
        return None;
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d").ok()
}

fn compute_next_rollover(now: DateTime<Local>) -> Result<tokio::time::Instant> {
    let next_date = now.date_naive() + ChronoDuration::days(1);
    let next_midnight = next_date
        .and_hms_opt(0, 0, 0)
        .context("计算下一次日志翻滚时间失败")?;
    let next_local = Local
        .from_local_datetime(&next_midnight)
        .earliest()
        .context("转换本地时间失败")?;
    let system_time = SystemTime::from(next_local.with_timezone(&Utc));
    let duration = system_time
        .duration_since(SystemTime::now())
        .unwrap_or(Duration::from_secs(0));
    Ok(tokio::time::Instant::now() + duration)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn temp_config() -> (TempDir, LoggingConfig) {
        let temp_dir = match TempDir::new() {
            Ok(temp_dir) => temp_dir,
            Err(err) => panic!("创建临时目录失败: {}", err),
        };
        let config = LoggingConfig {
            directory: temp_dir.path().to_string_lossy().to_string(),
            file_prefix: "demux".to_string(),
            retention_days: 7,
            ..LoggingConfig::default()
        };
        (temp_dir, config)
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap_or_else(|| panic!("无效日期"))
    }

    #[test]
    fn test_日志_解析历史文件名() {
        let prefix = "demux";
        assert_eq!(
            parse_rotated_log_name("demux.2026-02-06.log", prefix),
            Some((date(2026, 2, 6), false))
        );
        assert_eq!(
            parse_rotated_log_name("demux.2026-02-06.log.gz", prefix),
            Some((date(2026, 2, 6), true))
        );
        assert!(parse_rotated_log_name("demux.log", prefix).is_none());
        assert!(parse_rotated_log_name("other.2026-02-06.log", prefix).is_none());
    }

    #[test]
    fn test_日志_清理删除过期并压缩历史() {
        let (_dir, config) = temp_config();
        let today = date(2026, 3, 20);
        ensure_current_log_file(&config, today).unwrap();
        ensure_current_log_file(&config, date(2026, 3, 18)).unwrap();
        ensure_current_log_file(&config, date(2026, 3, 1)).unwrap();

        let report = cleanup_logs(&config, today).unwrap();
        assert_eq!(report, CleanupReport { removed: 1, compressed: 1 });

        let dir = Path::new(&config.directory);
        assert!(dir.join("demux.2026-03-20.log").exists());
        assert!(dir.join("demux.2026-03-18.log.gz").exists());
        assert!(!dir.join("demux.2026-03-18.log").exists());
        assert!(!dir.join("demux.2026-03-01.log").exists());

        // 第二次清理无事可做
        assert_eq!(cleanup_logs(&config, today).unwrap(), CleanupReport::default());
    }

    #[test]
    fn test_日志_关闭压缩时保留原文件() {
        let (_dir, mut config) = temp_config();
        config.compress_history = false;
        let today = date(2026, 3, 20);
        ensure_current_log_file(&config, date(2026, 3, 19)).unwrap();

        let report = cleanup_logs(&config, today).unwrap();
        assert_eq!(report, CleanupReport::default());
        assert!(Path::new(&config.directory).join("demux.2026-03-19.log").exists());
    }
}
