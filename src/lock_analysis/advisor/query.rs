//! Query Rewrite Strategy
//!
//! 待機チェーンのルートで実行中のクエリを既知の長時間ロックパターンと照合する。
//! スクリプトは生成せず、書き換え方針のみを提示する。

use super::strategy::{AdviceError, AdviceStrategy, AdvisorContext};
use crate::error::EngineError;
use crate::lock_analysis::types::{AdviceKind, ChainSeverity, OptimizationAdvice, WaitChain};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// 設定から追加するクエリパターン
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryPatternConfig {
    pub name: String,
    /// マッチ条件（正規表現）
    pub pattern: String,
    /// これにマッチした場合は対象外（正規表現）
    #[serde(default)]
    pub exclude: Option<String>,
    pub guidance: String,
}

#[derive(Debug, Clone)]
struct QueryPattern {
    name: String,
    matcher: Regex,
    exclude: Option<Regex>,
    guidance: String,
}

impl QueryPattern {
    fn compile(
        name: &str,
        pattern: &str,
        exclude: Option<&str>,
        guidance: &str,
    ) -> Result<Self, EngineError> {
        let matcher = Regex::new(pattern).map_err(|e| {
            EngineError::configuration(format!("invalid query pattern '{}': {}", name, e))
        })?;
        let exclude = exclude
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                EngineError::configuration(format!("invalid exclude pattern '{}': {}", name, e))
            })?;

        Ok(Self {
            name: name.to_string(),
            matcher,
            exclude,
            guidance: guidance.to_string(),
        })
    }

    fn matches(&self, query: &str) -> bool {
        self.matcher.is_match(query) && !self.exclude.as_ref().is_some_and(|e| e.is_match(query))
    }
}

/// 組み込みパターン（先にマッチしたものを採用）
const BUILTIN_PATTERNS: &[(&str, &str, Option<&str>, &str)] = &[
    (
        "ddl",
        r"(?i)^\s*(alter\s+table|drop\s+(table|index)|truncate|create\s+(unique\s+)?index)\b",
        Some(r"(?i)\bconcurrently\b"),
        "DDL takes an ACCESS EXCLUSIVE lock for its whole duration. Run it in a maintenance \
         window, set a short lock_timeout before it, or use the CONCURRENTLY / online variant.",
    ),
    (
        "explicit_table_lock",
        r"(?i)^\s*lock\s+(tables?\s+)?\w",
        None,
        "An explicit table lock serializes every writer. Replace it with row-level locking \
         (SELECT ... FOR UPDATE on the rows actually touched) or an advisory lock.",
    ),
    (
        "unbounded_write",
        r"(?is)^\s*(update\s+\S+.*\bset\b|delete\s+from\s+\S+)",
        Some(r"(?i)\bwhere\b"),
        "UPDATE/DELETE without a WHERE clause locks every row of the table. Add a predicate \
         and process the rows in small batches, committing between batches.",
    ),
    (
        "select_for_update_unbounded",
        r"(?is)\bselect\b.*\bfor\s+(update|no\s+key\s+update|share)\b",
        Some(r"(?i)\b(skip\s+locked|nowait|limit)\b"),
        "SELECT ... FOR UPDATE without SKIP LOCKED, NOWAIT or LIMIT queues every competing \
         worker behind one transaction. Bound the row set and add SKIP LOCKED for queue-style \
         access.",
    ),
    (
        "full_scan_select",
        r"(?is)^\s*select\b.*\bfrom\b",
        Some(r"(?i)\b(where|limit)\b"),
        "A SELECT without WHERE keeps its snapshot and locks open for a full scan. Add a \
         predicate backed by an index, or move the scan out of the write path.",
    ),
];

fn severity_base(severity: ChainSeverity) -> f64 {
    match severity {
        ChainSeverity::Critical => 75.0,
        ChainSeverity::High => 60.0,
        ChainSeverity::Medium => 45.0,
        ChainSeverity::Low => 25.0,
    }
}

/// 空白を正規化（重複判定用）
fn normalize(query: &str) -> String {
    query.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[derive(Debug, Clone)]
pub struct QueryRewriteStrategy {
    patterns: Vec<QueryPattern>,
}

impl QueryRewriteStrategy {
    /// 組み込みパターンに追加パターンを加えて構築
    pub fn new(extra: &[QueryPatternConfig]) -> Result<Self, EngineError> {
        let mut patterns = BUILTIN_PATTERNS
            .iter()
            .map(|(name, pattern, exclude, guidance)| {
                QueryPattern::compile(name, pattern, *exclude, guidance)
            })
            .collect::<Result<Vec<_>, _>>()?;

        for config in extra {
            if config.name.trim().is_empty() {
                return Err(EngineError::configuration("query pattern name must not be empty"));
            }
            patterns.push(QueryPattern::compile(
                &config.name,
                &config.pattern,
                config.exclude.as_deref(),
                &config.guidance,
            )?);
        }

        Ok(Self { patterns })
    }

    pub fn pattern_names(&self) -> Vec<&str> {
        self.patterns.iter().map(|p| p.name.as_str()).collect()
    }

    fn match_pattern(&self, query: &str) -> Option<&QueryPattern> {
        self.patterns.iter().find(|p| p.matches(query))
    }

    fn matched_chains<'c>(&self, chains: &'c [WaitChain]) -> Vec<(&'c WaitChain, &QueryPattern, String)> {
        let mut seen = HashSet::new();
        let mut matched = Vec::new();

        for chain in chains {
            let Some(query) = chain.blocking_query.as_deref() else {
                continue;
            };
            let normalized = normalize(query);
            if normalized.is_empty() || !seen.insert(normalized.clone()) {
                continue;
            }
            if let Some(pattern) = self.match_pattern(&normalized) {
                matched.push((chain, pattern, normalized));
            }
        }

        matched
    }
}

impl AdviceStrategy for QueryRewriteStrategy {
    fn name(&self) -> &'static str {
        "query_rewrite"
    }

    fn is_applicable(&self, context: &AdvisorContext<'_>) -> bool {
        !self.matched_chains(context.chains).is_empty()
    }

    fn generate(&self, context: &AdvisorContext<'_>) -> Result<Vec<OptimizationAdvice>, AdviceError> {
        let total_wait = context.total_chain_wait_ms();

        let advice = self
            .matched_chains(context.chains)
            .into_iter()
            .map(|(chain, pattern, query)| {
                let share = if total_wait > 0.0 {
                    chain.total_wait_time_ms / total_wait
                } else {
                    0.0
                };
                let object_id = chain.objects.first().cloned().unwrap_or_default();
                let root = chain
                    .sessions
                    .last()
                    .map(|s| s.to_string())
                    .unwrap_or_default();

                OptimizationAdvice::new(
                    self.name(),
                    AdviceKind::QueryRewrite,
                    object_id,
                    format!("Rewrite blocking query ({})", pattern.name),
                    format!(
                        "Session {} blocks a chain of {} session(s) ({:.0} ms total wait) while running: {}\n{}",
                        root, chain.length, chain.total_wait_time_ms, query, pattern.guidance
                    ),
                    severity_base(chain.severity) + 20.0 * share,
                )
            })
            .collect();

        Ok(advice)
    }
}
