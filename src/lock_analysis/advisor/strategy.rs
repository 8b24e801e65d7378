//! Advice Strategy Trait

use crate::lock_analysis::types::{
    ContentionMetric, DatabaseEngineKind, HealthScore, LockStatistics, ObjectMetadata,
    OptimizationAdvice, SchemaMetadata, WaitChain,
};
use thiserror::Error;

/// アドバイス戦略のエラー
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AdviceError {
    #[error("Invalid analysis input: {0}")]
    InvalidInput(String),

    #[error("Strategy failed: {0}")]
    Failed(String),
}

/// 戦略に渡す分析結果のビュー（読み取り専用）
#[derive(Debug, Clone, Copy)]
pub struct AdvisorContext<'a> {
    pub database_id: &'a str,
    pub engine: DatabaseEngineKind,
    pub statistics: &'a LockStatistics,
    pub chains: &'a [WaitChain],
    pub has_cycle: bool,
    pub contentions: &'a [ContentionMetric],
    pub health: &'a HealthScore,
    pub metadata: Option<&'a SchemaMetadata>,
    pub p99_wait_time_ms: f64,
}

impl<'a> AdvisorContext<'a> {
    pub fn object_metadata(&self, object_id: &str) -> Option<&'a ObjectMetadata> {
        self.metadata.and_then(|m| m.object(object_id))
    }

    pub fn total_contention_wait_ms(&self) -> f64 {
        self.contentions.iter().map(|m| m.total_wait_time_ms).sum()
    }

    pub fn total_chain_wait_ms(&self) -> f64 {
        self.chains.iter().map(|c| c.total_wait_time_ms).sum()
    }
}

/// アドバイス戦略トレイト
///
/// 戦略は分析結果を変更せず、他の戦略とは独立に実行される
pub trait AdviceStrategy: Send + Sync {
    /// 戦略名
    fn name(&self) -> &'static str;

    /// この分析結果に適用可能か
    fn is_applicable(&self, context: &AdvisorContext<'_>) -> bool;

    /// アドバイスを生成
    fn generate(&self, context: &AdvisorContext<'_>) -> Result<Vec<OptimizationAdvice>, AdviceError>;
}

fn is_identifier_part(part: &str) -> bool {
    let mut chars = part.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
        }
        _ => false,
    }
}

/// スクリプトに埋め込める識別子か（schema.table 形式を許容）
pub fn is_safe_identifier(value: &str) -> bool {
    let parts: Vec<&str> = value.split('.').collect();
    !parts.is_empty() && parts.len() <= 2 && parts.iter().all(|p| is_identifier_part(p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_identifier() {
        assert!(is_safe_identifier("orders"));
        assert!(is_safe_identifier("public.orders"));
        assert!(is_safe_identifier("customer_id"));
        assert!(!is_safe_identifier("relation 16384"));
        assert!(!is_safe_identifier("a.b.c"));
        assert!(!is_safe_identifier("orders; DROP TABLE x"));
        assert!(!is_safe_identifier(""));
    }
}
