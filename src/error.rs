//! Error types for the lock analysis engine.
//!
//! ロック分析エンジン全体で使用するエラー型

use std::time::Duration;
use thiserror::Error;

/// Result type alias for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// エンジン呼び出し側に返るエラー
///
/// 一つの実行結果を複数の待機者で共有するため `Clone` を実装する
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    /// スナップショット収集に失敗（リトライ上限到達を含む）
    #[error("Collection failed for '{database_id}' after {attempts} attempt(s): {reason}")]
    CollectionFailure {
        database_id: String,
        attempts: u32,
        reason: String,
    },

    /// 呼び出し側のタイムアウト予算を超過
    #[error("Collection for '{database_id}' exceeded timeout budget of {budget:?}")]
    Timeout {
        database_id: String,
        budget: Duration,
    },

    /// 重み・閾値などの設定エラー
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// キャンセルトークンによる中断
    #[error("Analysis cancelled: {0}")]
    Cancelled(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// 設定エラーを作成
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// 呼び出し側に部分結果ではなく失敗を返すべきエラーか
    pub fn is_collection_error(&self) -> bool {
        matches!(self, Self::CollectionFailure { .. } | Self::Timeout { .. })
    }
}

/// コレクター境界のエラー
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CollectionError {
    /// 接続不可・一時的な障害
    #[error("Data source unavailable: {0}")]
    Unavailable(String),

    /// コレクター内部のタイムアウト
    #[error("Collector timed out: {0}")]
    Timeout(String),

    /// 対象データベースが存在しない
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// 取得データの形式不正
    #[error("Malformed collector output: {0}")]
    Malformed(String),
}

impl CollectionError {
    /// エラーがリトライ可能かどうかを判定
    pub fn is_retryable(&self) -> bool {
        match self {
            // ネットワーク関連・一時的な障害はリトライ可能
            CollectionError::Unavailable(_) => true,
            CollectionError::Timeout(_) => true,

            // 対象や応答形式の問題はリトライしない
            CollectionError::InvalidTarget(_) => false,
            CollectionError::Malformed(_) => false,
        }
    }
}

/// 個別アナライザーの失敗
///
/// 呼び出し側へは伝播せず、結果の `degradations` に記録される
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AnalysisError {
    #[error("Malformed snapshot: {0}")]
    MalformedSnapshot(String),

    #[error("Invalid stage transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Analyzer aborted: {0}")]
    Aborted(String),
}
