//! 应用配置文件.
//!
//! JSON 格式, 所有字段可省略:
//!
//! ```json
//! {
//!   "logging": { "level": "debug", "directory": "logs" },
//!   "demux": { "max_tracks": 8, "trick_base_rate": 4.0 }
//! }
//! ```

use std::path::Path;

use anyhow::{Context, Result};
use isodemux_format::DemuxConfig;
use serde::{Deserialize, Serialize};

use crate::logging::LoggingConfig;

/// 应用配置
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub demux: DemuxConfig,
}

impl AppConfig {
    /// 从 JSON 文本解析
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("解析配置失败")
    }

    /// 从文件加载
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败, path={}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("配置文件格式错误, path={}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_应用配置_部分覆盖() {
        let config = AppConfig::from_json(
            r#"{"logging": {"level": "debug"}, "demux": {"max_tracks": 4}}"#,
        )
        .unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.file_prefix, "isodemux");
        assert_eq!(config.demux.max_tracks, 4);
        assert_eq!(config.demux.read_chunk_size, DemuxConfig::default().read_chunk_size);
    }

    #[test]
    fn test_应用配置_空对象取默认值() {
        assert_eq!(AppConfig::from_json("{}").unwrap(), AppConfig::default());
    }

    #[test]
    fn test_应用配置_从文件加载() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"demux": {{"announce_empty_tracks": false}}}}"#).unwrap();
        let config = AppConfig::load(file.path()).unwrap();
        assert!(!config.demux.announce_empty_tracks);

        let err = AppConfig::load(file.path().with_extension("missing")).unwrap_err();
        assert!(err.to_string().contains("读取配置文件失败"));
    }

    #[test]
    fn test_应用配置_格式错误() {
        assert!(AppConfig::from_json("{ not json").is_err());
    }
}
