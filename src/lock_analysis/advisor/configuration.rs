//! Lock Configuration Strategy

use super::strategy::{AdviceError, AdviceStrategy, AdvisorContext};
use crate::lock_analysis::types::{AdviceKind, DatabaseEngineKind, OptimizationAdvice};

/// このサブスコア未満でタイムアウト多発とみなす
const TIMEOUT_SCORE_THRESHOLD: f64 = 80.0;
/// このP99待機時間（ms）を超えると長時間待機とみなす
const LONG_WAIT_P99_MS: f64 = 5_000.0;
/// InnoDBのデフォルト値（秒）
const MYSQL_DEFAULT_LOCK_WAIT_TIMEOUT_SECS: u64 = 50;

/// ロックタイムアウト関連の設定アドバイス
#[derive(Debug, Clone)]
pub struct ConfigurationStrategy {
    recommended_lock_timeout_ms: u64,
    mysql_lock_wait_timeout_secs: u64,
}

impl ConfigurationStrategy {
    pub fn new(recommended_lock_timeout_ms: u64, mysql_lock_wait_timeout_secs: u64) -> Self {
        Self {
            recommended_lock_timeout_ms,
            mysql_lock_wait_timeout_secs,
        }
    }

    fn long_waits(context: &AdvisorContext<'_>) -> bool {
        context.p99_wait_time_ms > LONG_WAIT_P99_MS
    }

    fn frequent_timeouts(context: &AdvisorContext<'_>) -> bool {
        context.health.timeout < TIMEOUT_SCORE_THRESHOLD
    }

    fn scripts(&self, engine: DatabaseEngineKind, long_waits: bool) -> Option<(String, String)> {
        match (engine, long_waits) {
            (DatabaseEngineKind::PostgreSQL, true) => Some((
                format!(
                    "ALTER SYSTEM SET lock_timeout = '{}ms';\nSELECT pg_reload_conf();",
                    self.recommended_lock_timeout_ms
                ),
                "ALTER SYSTEM RESET lock_timeout;\nSELECT pg_reload_conf();".to_string(),
            )),
            (DatabaseEngineKind::PostgreSQL, false) => Some((
                "ALTER SYSTEM SET log_lock_waits = on;\nSELECT pg_reload_conf();".to_string(),
                "ALTER SYSTEM RESET log_lock_waits;\nSELECT pg_reload_conf();".to_string(),
            )),
            (DatabaseEngineKind::MySQL, true) => Some((
                format!(
                    "SET GLOBAL innodb_lock_wait_timeout = {};",
                    self.mysql_lock_wait_timeout_secs
                ),
                format!(
                    "SET GLOBAL innodb_lock_wait_timeout = {};",
                    MYSQL_DEFAULT_LOCK_WAIT_TIMEOUT_SECS
                ),
            )),
            _ => None,
        }
    }
}

impl AdviceStrategy for ConfigurationStrategy {
    fn name(&self) -> &'static str {
        "lock_configuration"
    }

    fn is_applicable(&self, context: &AdvisorContext<'_>) -> bool {
        Self::frequent_timeouts(context) || Self::long_waits(context)
    }

    fn generate(&self, context: &AdvisorContext<'_>) -> Result<Vec<OptimizationAdvice>, AdviceError> {
        let long_waits = Self::long_waits(context);
        let impact = (100.0 - context.health.timeout.min(context.health.wait_time)) * 0.6;

        let (title, description) = if long_waits {
            (
                "Bound lock waits with a lock timeout".to_string(),
                format!(
                    "P99 lock wait on {} is {:.0} ms. A lock timeout of {} ms makes blocked \
                     statements fail fast instead of piling up behind the holder. Callers must \
                     retry on the lock timeout error.",
                    context.database_id, context.p99_wait_time_ms, self.recommended_lock_timeout_ms
                ),
            )
        } else {
            (
                "Investigate frequent lock timeouts".to_string(),
                format!(
                    "{} lock timeout(s) out of {} request(s) on {}. Log lock waits to identify \
                     the holders, then shorten the transactions that hold them.",
                    context.statistics.timeout_count,
                    context.statistics.total_lock_requests,
                    context.database_id
                ),
            )
        };

        let advice = OptimizationAdvice::new(
            self.name(),
            AdviceKind::Configuration,
            context.database_id,
            title,
            description,
            impact,
        );
        let advice = match self.scripts(context.engine, long_waits) {
            Some((script, rollback)) => advice.with_scripts(script, rollback),
            None => advice,
        };

        Ok(vec![advice])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_analysis::types::{HealthScore, HealthStatus, LockStatistics};

    fn health(wait_time: f64, timeout: f64) -> HealthScore {
        HealthScore {
            value: 70.0,
            wait_time,
            contention: 100.0,
            deadlock: 100.0,
            chain_length: 100.0,
            timeout,
            status: HealthStatus::Warning,
        }
    }

    #[test]
    fn test_long_waits_emit_lock_timeout() {
        let stats = LockStatistics::default();
        let health = health(20.0, 100.0);
        let context = AdvisorContext {
            database_id: "orders-db",
            engine: DatabaseEngineKind::PostgreSQL,
            statistics: &stats,
            chains: &[],
            has_cycle: false,
            contentions: &[],
            health: &health,
            metadata: None,
            p99_wait_time_ms: 12_000.0,
        };

        let strategy = ConfigurationStrategy::new(5_000, 10);
        assert!(strategy.is_applicable(&context));
        let advice = strategy.generate(&context).unwrap();
        assert_eq!(advice[0].impact_score(), 48.0);
        assert!(advice[0].script.as_deref().unwrap().contains("lock_timeout = '5000ms'"));
        assert!(advice[0]
            .rollback_script
            .as_deref()
            .unwrap()
            .contains("RESET lock_timeout"));
    }

    #[test]
    fn test_mysql_timeout_without_long_waits_has_no_script() {
        let stats = LockStatistics {
            timeout_count: 40,
            total_lock_requests: 400,
            ..Default::default()
        };
        let health = health(95.0, 50.0);
        let context = AdvisorContext {
            database_id: "shop",
            engine: DatabaseEngineKind::MySQL,
            statistics: &stats,
            chains: &[],
            has_cycle: false,
            contentions: &[],
            health: &health,
            metadata: None,
            p99_wait_time_ms: 200.0,
        };

        let advice = ConfigurationStrategy::new(5_000, 10).generate(&context).unwrap();
        assert_eq!(advice[0].impact_score(), 30.0);
        assert!(advice[0].script.is_none());
    }

    #[test]
    fn test_healthy_is_not_applicable() {
        let stats = LockStatistics::default();
        let health = health(100.0, 100.0);
        let context = AdvisorContext {
            database_id: "db",
            engine: DatabaseEngineKind::PostgreSQL,
            statistics: &stats,
            chains: &[],
            has_cycle: false,
            contentions: &[],
            health: &health,
            metadata: None,
            p99_wait_time_ms: 50.0,
        };
        assert!(!ConfigurationStrategy::new(5_000, 10).is_applicable(&context));
    }
}
