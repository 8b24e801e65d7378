//! Optimization Advisor Implementation

use super::configuration::ConfigurationStrategy;
use super::index::IndexStrategy;
use super::isolation::IsolationLevelStrategy;
use super::query::{QueryPatternConfig, QueryRewriteStrategy};
use super::strategy::{AdviceStrategy, AdvisorContext};
use crate::error::EngineError;
use crate::lock_analysis::types::OptimizationAdvice;
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use tracing::{debug, warn};

/// アドバイザー設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvisorConfig {
    pub enable_index: bool,
    pub enable_query_rewrite: bool,
    pub enable_isolation: bool,
    pub enable_configuration: bool,
    /// 返すアドバイスの最大件数
    pub max_advice: usize,
    /// PostgreSQL lock_timeout の推奨値（ms）
    pub recommended_lock_timeout_ms: u64,
    /// MySQL innodb_lock_wait_timeout の推奨値（秒）
    pub mysql_lock_wait_timeout_secs: u64,
    pub extra_query_patterns: Vec<QueryPatternConfig>,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            enable_index: true,
            enable_query_rewrite: true,
            enable_isolation: true,
            enable_configuration: true,
            max_advice: 20,
            recommended_lock_timeout_ms: 5_000,
            mysql_lock_wait_timeout_secs: 10,
            extra_query_patterns: Vec::new(),
        }
    }
}

impl AdvisorConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_advice == 0 {
            return Err(EngineError::configuration("advisor.max_advice must be greater than 0"));
        }
        if self.recommended_lock_timeout_ms == 0 {
            return Err(EngineError::configuration(
                "advisor.recommended_lock_timeout_ms must be greater than 0",
            ));
        }
        if self.mysql_lock_wait_timeout_secs == 0 {
            return Err(EngineError::configuration(
                "advisor.mysql_lock_wait_timeout_secs must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// 失敗した戦略の記録
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyFailure {
    pub strategy: &'static str,
    pub reason: String,
}

/// アドバイス生成結果
#[derive(Debug, Clone, Default)]
pub struct AdviceOutcome {
    pub advice: Vec<OptimizationAdvice>,
    pub failures: Vec<StrategyFailure>,
}

/// 最適化アドバイザー
///
/// 戦略は構築時に明示的に組み合わせる。一つの戦略の失敗（パニックを含む）は
/// 他の戦略の出力に影響しない。
pub struct OptimizationAdvisor {
    strategies: Vec<Box<dyn AdviceStrategy>>,
    max_advice: usize,
}

impl OptimizationAdvisor {
    /// 戦略なしのアドバイザーを作成
    pub fn new(max_advice: usize) -> Self {
        Self {
            strategies: Vec::new(),
            max_advice,
        }
    }

    /// 設定に従って標準の戦略を組み込む
    pub fn with_default_strategies(config: &AdvisorConfig) -> Result<Self, EngineError> {
        config.validate()?;

        let mut advisor = Self::new(config.max_advice);
        if config.enable_index {
            advisor = advisor.register(IndexStrategy::new());
        }
        if config.enable_query_rewrite {
            advisor = advisor.register(QueryRewriteStrategy::new(&config.extra_query_patterns)?);
        }
        if config.enable_isolation {
            advisor = advisor.register(IsolationLevelStrategy::new());
        }
        if config.enable_configuration {
            advisor = advisor.register(ConfigurationStrategy::new(
                config.recommended_lock_timeout_ms,
                config.mysql_lock_wait_timeout_secs,
            ));
        }

        Ok(advisor)
    }

    /// 戦略を追加
    pub fn register<S: AdviceStrategy + 'static>(mut self, strategy: S) -> Self {
        self.strategies.push(Box::new(strategy));
        self
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// 全戦略を実行し、影響度順にアドバイスを返す
    pub fn advise(&self, context: &AdvisorContext<'_>) -> AdviceOutcome {
        let mut outcome = AdviceOutcome::default();

        for strategy in &self.strategies {
            let name = strategy.name();
            let result = catch_unwind(AssertUnwindSafe(|| {
                if strategy.is_applicable(context) {
                    strategy.generate(context).map(Some)
                } else {
                    Ok(None)
                }
            }));

            match result {
                Ok(Ok(Some(advice))) => {
                    debug!("Strategy {} produced {} advice", name, advice.len());
                    outcome.advice.extend(advice);
                }
                Ok(Ok(None)) => {}
                Ok(Err(e)) => {
                    warn!("Strategy {} failed: {}", name, e);
                    outcome.failures.push(StrategyFailure {
                        strategy: name,
                        reason: e.to_string(),
                    });
                }
                Err(panic) => {
                    let reason = panic_message(panic.as_ref());
                    warn!("Strategy {} panicked: {}", name, reason);
                    outcome.failures.push(StrategyFailure {
                        strategy: name,
                        reason: format!("panicked: {}", reason),
                    });
                }
            }
        }

        sort_advice(&mut outcome.advice);
        outcome.advice.truncate(self.max_advice);
        outcome
    }
}

/// 影響度降順、同値はオブジェクトID・種類・タイトルで安定化
pub fn sort_advice(advice: &mut [OptimizationAdvice]) {
    advice.sort_by(|a, b| {
        b.impact_score()
            .total_cmp(&a.impact_score())
            .then_with(|| a.object_id.cmp(&b.object_id))
            .then_with(|| a.kind.cmp(&b.kind))
            .then_with(|| a.title.cmp(&b.title))
    });
}

pub(crate) fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_analysis::advisor::strategy::AdviceError;
    use crate::lock_analysis::types::{
        AdviceKind, DatabaseEngineKind, HealthScore, HealthStatus, LockStatistics,
    };

    struct Fixed(&'static str, f64);

    impl AdviceStrategy for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }
        fn is_applicable(&self, _: &AdvisorContext<'_>) -> bool {
            true
        }
        fn generate(&self, _: &AdvisorContext<'_>) -> Result<Vec<OptimizationAdvice>, AdviceError> {
            Ok(vec![OptimizationAdvice::new(
                self.0,
                AdviceKind::Configuration,
                "db",
                self.0,
                "fixed",
                self.1,
            )])
        }
    }

    struct Failing;

    impl AdviceStrategy for Failing {
        fn name(&self) -> &'static str {
            "failing"
        }
        fn is_applicable(&self, _: &AdvisorContext<'_>) -> bool {
            true
        }
        fn generate(&self, _: &AdvisorContext<'_>) -> Result<Vec<OptimizationAdvice>, AdviceError> {
            Err(AdviceError::Failed("boom".into()))
        }
    }

    struct Panicking;

    impl AdviceStrategy for Panicking {
        fn name(&self) -> &'static str {
            "panicking"
        }
        fn is_applicable(&self, _: &AdvisorContext<'_>) -> bool {
            true
        }
        fn generate(&self, _: &AdvisorContext<'_>) -> Result<Vec<OptimizationAdvice>, AdviceError> {
            panic!("strategy bug")
        }
    }

    fn with_context<R>(f: impl FnOnce(&AdvisorContext<'_>) -> R) -> R {
        let stats = LockStatistics::default();
        let health = HealthScore {
            value: 100.0,
            wait_time: 100.0,
            contention: 100.0,
            deadlock: 100.0,
            chain_length: 100.0,
            timeout: 100.0,
            status: HealthStatus::Healthy,
        };
        let context = AdvisorContext {
            database_id: "db",
            engine: DatabaseEngineKind::PostgreSQL,
            statistics: &stats,
            chains: &[],
            has_cycle: false,
            contentions: &[],
            health: &health,
            metadata: None,
            p99_wait_time_ms: 0.0,
        };
        f(&context)
    }

    #[test]
    fn test_failures_are_isolated() {
        let advisor = OptimizationAdvisor::new(10)
            .register(Fixed("low", 20.0))
            .register(Failing)
            .register(Panicking)
            .register(Fixed("high", 90.0));

        let outcome = with_context(|ctx| advisor.advise(ctx));
        let titles: Vec<_> = outcome.advice.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["high", "low"]);
        assert_eq!(outcome.failures.len(), 2);
        assert_eq!(outcome.failures[0].strategy, "failing");
        assert!(outcome.failures[1].reason.contains("strategy bug"));
    }

    #[test]
    fn test_max_advice_truncates_lowest_impact() {
        let advisor = OptimizationAdvisor::new(2)
            .register(Fixed("a", 10.0))
            .register(Fixed("b", 50.0))
            .register(Fixed("c", 30.0));
        let outcome = with_context(|ctx| advisor.advise(ctx));
        let titles: Vec<_> = outcome.advice.iter().map(|a| a.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "c"]);
    }

    #[test]
    fn test_default_strategies_follow_config() {
        let config = AdvisorConfig {
            enable_isolation: false,
            ..Default::default()
        };
        let advisor = OptimizationAdvisor::with_default_strategies(&config).unwrap();
        assert_eq!(
            advisor.strategy_names(),
            vec!["index_optimization", "query_rewrite", "lock_configuration"]
        );

        let invalid = AdvisorConfig {
            max_advice: 0,
            ..Default::default()
        };
        assert!(OptimizationAdvisor::with_default_strategies(&invalid).is_err());
    }

    #[test]
    fn test_sort_advice_breaks_ties_by_object_then_kind() {
        let advice = |kind, object: &str, impact| {
            OptimizationAdvice::new("s", kind, object, "t", "d", impact)
        };
        let mut ranked = vec![
            advice(AdviceKind::Configuration, "public.orders", 60.0),
            advice(AdviceKind::Index, "public.orders", 60.0),
            advice(AdviceKind::Index, "public.accounts", 60.0),
            advice(AdviceKind::QueryRewrite, "public.zones", 80.0),
        ];
        let mut reversed: Vec<_> = ranked.iter().rev().cloned().collect();
        sort_advice(&mut ranked);
        sort_advice(&mut reversed);

        let order: Vec<_> = ranked.iter().map(|a| (a.object_id.as_str(), a.kind)).collect();
        assert_eq!(
            order,
            vec![
                ("public.zones", AdviceKind::QueryRewrite),
                ("public.accounts", AdviceKind::Index),
                ("public.orders", AdviceKind::Index),
                ("public.orders", AdviceKind::Configuration),
            ]
        );
        assert_eq!(ranked, reversed);
    }
}
