//! ログ初期化
//!
//! コンソール（テキストまたはJSON）と、任意のローテーション付きファイル出力を
//! `tracing-subscriber` のレイヤーとして組み立てる。

use crate::error::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::{non_blocking, rolling};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

const LOG_FILE_NAME: &str = "dblock.log";

/// ログ設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// ログレベル（EnvFilter 形式、例: "info,dblock_rs=debug"）
    pub level: String,
    /// JSON形式で出力
    pub json: bool,
    /// コンソール出力有効（stderr）
    pub console_enabled: bool,
    /// ファイル出力有効
    pub file_enabled: bool,
    pub log_dir: PathBuf,
    pub rotation: LogRotation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogRotation {
    /// 日次ローテーション
    Daily,
    /// 時間毎ローテーション
    Hourly,
    /// ローテーションなし
    Never,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            console_enabled: true,
            file_enabled: false,
            log_dir: PathBuf::from("logs"),
            rotation: LogRotation::Daily,
        }
    }
}

impl LogConfig {
    pub fn with_level(mut self, level: impl Into<String>) -> Self {
        self.level = level.into();
        self
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }

    /// カスタムログディレクトリを設定（ファイル出力も有効になる）
    pub fn with_log_dir<P: Into<PathBuf>>(mut self, dir: P) -> Self {
        self.log_dir = dir.into();
        self.file_enabled = true;
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_console(mut self, enabled: bool) -> Self {
        self.console_enabled = enabled;
        self
    }

    pub fn with_file(mut self, enabled: bool) -> Self {
        self.file_enabled = enabled;
        self
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        build_filter(&self.level).map(|_| ())
    }
}

fn build_filter(level: &str) -> Result<EnvFilter, EngineError> {
    EnvFilter::try_new(level)
        .map_err(|e| EngineError::configuration(format!("invalid log level '{}': {}", level, e)))
}

/// ログディレクトリを確保
fn ensure_log_dir(dir: &Path) -> Result<(), EngineError> {
    if !dir.exists() {
        fs::create_dir_all(dir).map_err(|e| {
            EngineError::configuration(format!("cannot create log directory {}: {}", dir.display(), e))
        })?;
    }
    Ok(())
}

/// ログシステムを初期化
///
/// ファイル出力時は返される `WorkerGuard` を保持し続けること（drop でフラッシュ）
pub fn init_logging(config: &LogConfig) -> Result<Option<WorkerGuard>, EngineError> {
    let filter = build_filter(&config.level)?;
    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();

    if config.console_enabled {
        let layer = fmt::layer().with_writer(std::io::stderr).with_target(true);
        layers.push(if config.json {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
    }

    let guard = if config.file_enabled {
        ensure_log_dir(&config.log_dir)?;
        let appender = match config.rotation {
            LogRotation::Daily => rolling::daily(&config.log_dir, LOG_FILE_NAME),
            LogRotation::Hourly => rolling::hourly(&config.log_dir, LOG_FILE_NAME),
            LogRotation::Never => rolling::never(&config.log_dir, LOG_FILE_NAME),
        };
        let (writer, guard) = non_blocking(appender);
        let layer = fmt::layer()
            .with_writer(writer)
            .with_ansi(false)
            .with_thread_ids(true)
            .with_file(true)
            .with_line_number(true);
        layers.push(if config.json {
            layer.json().boxed()
        } else {
            layer.boxed()
        });
        Some(guard)
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(layers)
        .with(filter)
        .try_init()
        .map_err(|e| EngineError::Internal(format!("failed to install log subscriber: {}", e)))?;

    tracing::debug!(
        "Logging initialized (level: {}, json: {}, file: {})",
        config.level,
        config.json,
        if config.file_enabled {
            config.log_dir.display().to_string()
        } else {
            "disabled".to_string()
        }
    );

    Ok(guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_log_config_default() {
        let config = LogConfig::default();
        assert_eq!(config.level, "info");
        assert!(config.console_enabled);
        assert!(!config.file_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_level_rejected() {
        let config = LogConfig::default().with_level("dblock_rs=loud");
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn test_ensure_log_dir() {
        let temp_dir = tempdir().unwrap();
        let log_dir = temp_dir.path().join("nested").join("logs");

        assert!(ensure_log_dir(&log_dir).is_ok());
        assert!(log_dir.exists());
    }

    #[test]
    fn test_rotation_deserializes_lowercase() {
        let config: LogConfig =
            serde_json::from_str(r#"{"rotation": "hourly", "json": true}"#).unwrap();
        assert_eq!(config.rotation, LogRotation::Hourly);
        assert!(config.json);
        assert_eq!(config.level, "info");
    }
}
