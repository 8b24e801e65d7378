//! エンジン設定
//!
//! デフォルト値 → 設定ファイル（TOML） → 環境変数（`DBLOCK__`）の順で上書きする

use crate::error::EngineError;
use crate::lock_analysis::advisor::AdvisorConfig;
use crate::lock_analysis::contention::ContentionConfig;
use crate::lock_analysis::engine::OrchestratorConfig;
use crate::lock_analysis::health::HealthConfig;
use crate::lock_analysis::wait_chain::WaitChainConfig;
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// 環境変数プレフィックス（例: DBLOCK__ENGINE__CACHE_TTL_SECS=60）
pub const ENV_PREFIX: &str = "DBLOCK";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub wait_chain: WaitChainConfig,
    pub contention: ContentionConfig,
    pub health: HealthConfig,
    pub advisor: AdvisorConfig,
    pub engine: OrchestratorConfig,
    pub logging: LogConfig,
}

impl EngineConfig {
    /// 設定を読み込んで検証
    pub fn load(path: Option<&Path>) -> Result<Self, EngineError> {
        let load_error = |e: config::ConfigError| EngineError::configuration(e.to_string());

        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&EngineConfig::default()).map_err(load_error)?);

        if let Some(path) = path {
            if !path.exists() {
                return Err(EngineError::configuration(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            info!("Loading configuration from {}", path.display());
            settings = settings.add_source(config::File::from(path));
        }

        settings = settings.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: EngineConfig = settings
            .build()
            .map_err(load_error)?
            .try_deserialize()
            .map_err(load_error)?;

        config.validate()?;
        Ok(config)
    }

    /// 全セクションを検証（不正値は黙って補正しない）
    pub fn validate(&self) -> Result<(), EngineError> {
        self.wait_chain.validate().map_err(EngineError::Configuration)?;
        self.contention.validate().map_err(EngineError::Configuration)?;
        self.health.validate().map_err(EngineError::Configuration)?;
        self.advisor.validate()?;
        self.engine.validate()?;
        self.logging.validate()
    }

    /// サンプル設定ファイルの内容を生成
    pub fn sample_toml() -> Result<String, EngineError> {
        let body = toml::to_string_pretty(&EngineConfig::default())
            .map_err(|e| EngineError::Internal(format!("failed to render sample config: {}", e)))?;

        Ok(format!(
            "# dblock-analyze configuration\n\
             #\n\
             # Every key can be overridden with an environment variable, e.g.\n\
             #   {prefix}__ENGINE__CACHE_TTL_SECS=60\n\
             #   {prefix}__HEALTH__WEIGHTS__WAIT_TIME=0.4\n\n{body}",
            prefix = ENV_PREFIX,
            body = body
        ))
    }
}
