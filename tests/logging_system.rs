use chrono::NaiveDate;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};
use isodemux::logging::{CleanupReport, LoggingConfig, cleanup_logs, init};

// 注意: 全局订阅器只能初始化一次,
// 涉及 init() 的测试必须单独运行或使用 #[ignore] 标记

fn file_config(dir: &Path, prefix: &str, level: &str) -> LoggingConfig {
    LoggingConfig {
        level: level.to_string(),
        console_level: String::new(),
        directory: dir.to_string_lossy().to_string(),
        file_prefix: prefix.to_string(),
        retention_days: 7,
        compress_history: false,
        ..LoggingConfig::default()
    }
}

/// 获取当前日期的日志文件路径
fn today_log_path(dir: &Path, prefix: &str) -> PathBuf {
    let today = chrono::Local::now().date_naive();
    dir.join(format!("{}.{}.log", prefix, today.format("%Y-%m-%d")))
}

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_else(|| panic!("非法日期 {y}-{m}-{d}"))
}

#[tokio::test]
#[ignore] // 需要单独运行: cargo test --test logging_system test_日志_初始化创建目录 -- --ignored
async fn test_日志_初始化创建目录() {
    let tmp = tempfile::tempdir().expect("创建临时目录失败");
    let log_dir = tmp.path().join("nested").join("logs");
    assert!(!log_dir.exists(), "测试前日志目录不应该存在");

    init(file_config(&log_dir, "dir-test", "info")).expect("日志初始化失败");
    assert!(log_dir.exists(), "嵌套日志目录应该被创建");
    assert!(today_log_path(&log_dir, "dir-test").exists());
}

#[tokio::test]
#[ignore] // 需要单独运行: cargo test --test logging_system test_日志_库日志写入文件 -- --ignored
async fn test_日志_库日志写入文件() {
    let tmp = tempfile::tempdir().expect("创建临时目录失败");
    init(file_config(tmp.path(), "content-test", "info")).expect("日志初始化失败");

    // 库 crate 使用 log 门面, 需要经过桥接写入同一个文件
    log::error!("错误日志_ERROR_MSG");
    log::warn!("文件打开失败: 路径={}", "/测试/路径.mp4");
    tracing::info!("信息日志_INFO_MSG");
    tracing::debug!("调试日志_DEBUG_MSG");

    std::thread::sleep(std::time::Duration::from_millis(200));

    let log_file = today_log_path(tmp.path(), "content-test");
    let content = fs::read_to_string(&log_file)
        .unwrap_or_else(|e| panic!("读取日志文件失败: {:?}, 错误: {}", log_file, e));

    assert!(content.contains("错误日志_ERROR_MSG"), "应该包含 log 门面的错误日志");
    assert!(content.contains("/测试/路径.mp4"), "中文内容应该原样写入");
    assert!(content.contains("信息日志_INFO_MSG"), "应该包含信息日志");
    assert!(content.contains("INFO"), "日志应该包含级别标记");
    assert!(!content.contains("调试日志_DEBUG_MSG"), "debug 日志应该被过滤掉");
}

#[tokio::test]
#[ignore] // 需要单独运行: cargo test --test logging_system test_日志_解封装过程日志 -- --ignored
async fn test_日志_解封装过程日志() {
    use isodemux::format::IoContext;
    use isodemux::format::test_support::{Layout, TrackSpec, build_progressive};

    let tmp = tempfile::tempdir().expect("创建临时目录失败");
    init(file_config(tmp.path(), "demux-test", "debug")).expect("日志初始化失败");

    let file = build_progressive(&[TrackSpec::video(1, 3)], Layout::MoovFirst);
    let mut io = IoContext::from_memory(file);
    let registry = isodemux::default_format_registry();
    registry.open_input(&mut io, None).expect("打开失败");

    std::thread::sleep(std::time::Duration::from_millis(200));
    let content =
        fs::read_to_string(today_log_path(tmp.path(), "demux-test")).expect("读取日志文件失败");
    assert!(content.contains("isodemux_format"), "日志应该带模块路径");
}

#[test]
fn test_日志_清理过期文件() {
    let tmp = tempfile::tempdir().expect("创建临时目录失败");
    let config = file_config(tmp.path(), "isodemux", "info");
    let today = date(2026, 3, 20);

    for name in [
        "isodemux.2026-03-01.log",
        "isodemux.2026-03-05.log.gz",
        "isodemux.2026-03-18.log",
        "isodemux.2026-03-20.log",
        "other.2026-03-01.log",
        "notes.txt",
    ] {
        fs::write(tmp.path().join(name), b"x").expect("写入测试文件失败");
    }

    let report = cleanup_logs(&config, today).expect("清理失败");
    assert_eq!(
        report,
        CleanupReport {
            removed: 2,
            compressed: 0,
        }
    );
    assert!(!tmp.path().join("isodemux.2026-03-01.log").exists());
    assert!(!tmp.path().join("isodemux.2026-03-05.log.gz").exists());
    assert!(tmp.path().join("isodemux.2026-03-18.log").exists());
    assert!(tmp.path().join("isodemux.2026-03-20.log").exists());
    assert!(tmp.path().join("other.2026-03-01.log").exists(), "其他前缀不受影响");
    assert!(tmp.path().join("notes.txt").exists());
}

#[test]
fn test_日志_压缩历史文件() {
    let tmp = tempfile::tempdir().expect("创建临时目录失败");
    let config = LoggingConfig {
        compress_history: true,
        ..file_config(tmp.path(), "isodemux", "info")
    };
    let today = date(2026, 3, 20);
    let history = tmp.path().join("isodemux.2026-03-19.log");
    fs::write(&history, "昨天的日志\n").expect("写入测试文件失败");
    fs::write(tmp.path().join("isodemux.2026-03-20.log"), "今天").expect("写入测试文件失败");

    let report = cleanup_logs(&config, today).expect("清理失败");
    assert_eq!(report.compressed, 1);
    assert!(!history.exists(), "压缩后原文件被删除");
    assert!(tmp.path().join("isodemux.2026-03-20.log").exists(), "当天文件不压缩");

    let gz = fs::File::open(tmp.path().join("isodemux.2026-03-19.log.gz")).expect("压缩文件应存在");
    let mut text = String::new();
    flate2::read::GzDecoder::new(gz)
        .read_to_string(&mut text)
        .expect("解压失败");
    assert_eq!(text, "昨天的日志\n");

    // 再次清理没有新工作
    assert_eq!(cleanup_logs(&config, today).expect("清理失败"), CleanupReport::default());
}

#[test]
fn test_日志_目录不存在时清理为空操作() {
    let tmp = tempfile::tempdir().expect("创建临时目录失败");
    let config = file_config(&tmp.path().join("missing"), "isodemux", "info");
    let report = cleanup_logs(&config, date(2026, 1, 1)).expect("清理失败");
    assert_eq!(report, CleanupReport::default());
}

#[test]
fn test_日志_配置默认值() {
    let config = LoggingConfig::default();
    assert_eq!(config.retention_days, 30, "默认保留天数应该是 30");
    assert!(config.compress_history, "默认应该开启压缩");
    assert_eq!(config.cleanup_interval_seconds, 3600, "默认清理间隔应该是 3600 秒");
    assert_eq!(config.file_prefix, "isodemux");
    assert!(!config.has_file_output(), "默认只输出到控制台");
}
