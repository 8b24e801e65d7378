//! Index Optimization Strategy
//!
//! hot_spot / frequent に分類されたオブジェクトで、カバリングインデックスの
//! 存在が確認できないものにインデックス作成を提案する

use super::strategy::{is_safe_identifier, AdviceError, AdviceStrategy, AdvisorContext};
use crate::lock_analysis::types::{
    AdviceKind, ContentionMetric, ContentionPattern, DatabaseEngineKind, OptimizationAdvice,
};

/// PostgreSQLの識別子長上限
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, Default)]
pub struct IndexStrategy;

impl IndexStrategy {
    pub fn new() -> Self {
        Self
    }

    fn is_candidate(&self, context: &AdvisorContext<'_>, metric: &ContentionMetric) -> bool {
        let pattern_matches = matches!(
            metric.pattern,
            ContentionPattern::HotSpot | ContentionPattern::Frequent
        );
        let covered = context
            .object_metadata(&metric.object_id)
            .map(|m| m.has_covering_index)
            .unwrap_or(false);
        pattern_matches && !covered
    }

    /// インデックス名（例: idx_orders_customer_id_status）
    fn index_name(table: &str, columns: &[String]) -> String {
        let mut name = format!("idx_{}_{}", table, columns.join("_")).to_ascii_lowercase();
        name.truncate(MAX_IDENTIFIER_LEN);
        name
    }

    fn scripts(
        engine: DatabaseEngineKind,
        object_id: &str,
        columns: &[String],
    ) -> Option<(String, String)> {
        if columns.is_empty()
            || !is_safe_identifier(object_id)
            || !columns.iter().all(|c| is_safe_identifier(c) && !c.contains('.'))
        {
            return None;
        }

        let (schema, table) = match object_id.split_once('.') {
            Some((schema, table)) => (Some(schema), table),
            None => (None, object_id),
        };
        let name = Self::index_name(table, columns);
        let column_list = columns.join(", ");

        let pair = match engine {
            DatabaseEngineKind::PostgreSQL => {
                let qualified = match schema {
                    Some(schema) => format!("{}.{}", schema, name),
                    None => name.clone(),
                };
                (
                    format!(
                        "CREATE INDEX CONCURRENTLY IF NOT EXISTS {} ON {} ({});",
                        name, object_id, column_list
                    ),
                    format!("DROP INDEX CONCURRENTLY IF EXISTS {};", qualified),
                )
            }
            DatabaseEngineKind::MySQL => (
                format!(
                    "ALTER TABLE {} ADD INDEX {} ({}), ALGORITHM=INPLACE, LOCK=NONE;",
                    object_id, name, column_list
                ),
                format!("ALTER TABLE {} DROP INDEX {};", object_id, name),
            ),
            DatabaseEngineKind::Other => (
                format!("CREATE INDEX {} ON {} ({});", name, object_id, column_list),
                format!("DROP INDEX {};", name),
            ),
        };
        Some(pair)
    }
}

impl AdviceStrategy for IndexStrategy {
    fn name(&self) -> &'static str {
        "index_optimization"
    }

    fn is_applicable(&self, context: &AdvisorContext<'_>) -> bool {
        context
            .contentions
            .iter()
            .any(|m| self.is_candidate(context, m))
    }

    fn generate(&self, context: &AdvisorContext<'_>) -> Result<Vec<OptimizationAdvice>, AdviceError> {
        let total_wait = context.total_contention_wait_ms();
        if !total_wait.is_finite() {
            return Err(AdviceError::InvalidInput(
                "total contention wait time is not finite".to_string(),
            ));
        }

        let advice = context
            .contentions
            .iter()
            .filter(|m| self.is_candidate(context, m))
            .map(|metric| {
                let share = if total_wait > 0.0 {
                    metric.total_wait_time_ms / total_wait
                } else {
                    0.0
                };
                let columns = context
                    .object_metadata(&metric.object_id)
                    .map(|m| m.candidate_columns.clone())
                    .unwrap_or_default();

                let mut description = format!(
                    "{} is a {:?} contention point: {} blocked attempt(s) from {} session(s), \
                     avg wait {:.0} ms, {:.1}% of total lock wait time.",
                    metric.object_id,
                    metric.pattern,
                    metric.contention_count,
                    metric.affected_sessions,
                    metric.avg_wait_time_ms,
                    share * 100.0
                );
                if columns.is_empty() {
                    description.push_str(
                        " Identify the predicate columns used by the blocking statements and index them \
                         so row locks are taken on fewer rows.",
                    );
                } else {
                    description.push_str(&format!(
                        " An index on ({}) narrows the rows each statement scans and locks.",
                        columns.join(", ")
                    ));
                }

                let advice = OptimizationAdvice::new(
                    self.name(),
                    AdviceKind::Index,
                    metric.object_id.clone(),
                    format!("Add index to reduce lock contention on {}", metric.object_id),
                    description,
                    share * 100.0,
                );
                match Self::scripts(context.engine, &metric.object_id, &columns) {
                    Some((script, rollback)) => advice.with_scripts(script, rollback),
                    None => advice,
                }
            })
            .collect();

        Ok(advice)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_analysis::types::{
        HealthScore, HealthStatus, LockStatistics, ObjectMetadata, SchemaMetadata,
    };

    fn metric(object: &str, pattern: ContentionPattern, total: f64) -> ContentionMetric {
        ContentionMetric {
            object_id: object.into(),
            contention_count: 12,
            total_wait_time_ms: total,
            avg_wait_time_ms: total / 12.0,
            max_wait_time_ms: total,
            affected_sessions: 6,
            timeout_count: 0,
            pattern,
        }
    }

    fn health() -> HealthScore {
        HealthScore {
            value: 70.0,
            wait_time: 70.0,
            contention: 70.0,
            deadlock: 70.0,
            chain_length: 70.0,
            timeout: 70.0,
            status: HealthStatus::Warning,
        }
    }

    #[test]
    fn test_generates_scripts_with_rollback() {
        let contentions = vec![
            metric("public.orders", ContentionPattern::HotSpot, 7_500.0),
            metric("public.items", ContentionPattern::Normal, 2_500.0),
        ];
        let metadata = SchemaMetadata::default().with_object(
            "public.orders",
            ObjectMetadata {
                candidate_columns: vec!["customer_id".into(), "status".into()],
                ..Default::default()
            },
        );
        let stats = LockStatistics::default();
        let health = health();
        let context = AdvisorContext {
            database_id: "db",
            engine: DatabaseEngineKind::PostgreSQL,
            statistics: &stats,
            chains: &[],
            has_cycle: false,
            contentions: &contentions,
            health: &health,
            metadata: Some(&metadata),
            p99_wait_time_ms: 0.0,
        };

        let strategy = IndexStrategy::new();
        assert!(strategy.is_applicable(&context));
        let advice = strategy.generate(&context).unwrap();
        assert_eq!(advice.len(), 1);
        assert_eq!(advice[0].impact_score(), 75.0);
        assert_eq!(
            advice[0].script.as_deref(),
            Some("CREATE INDEX CONCURRENTLY IF NOT EXISTS idx_orders_customer_id_status ON public.orders (customer_id, status);")
        );
        assert_eq!(
            advice[0].rollback_script.as_deref(),
            Some("DROP INDEX CONCURRENTLY IF EXISTS public.idx_orders_customer_id_status;")
        );
    }

    #[test]
    fn test_covering_index_suppresses_advice() {
        let contentions = vec![metric("public.orders", ContentionPattern::Frequent, 100.0)];
        let metadata = SchemaMetadata::default().with_object(
            "public.orders",
            ObjectMetadata {
                has_covering_index: true,
                ..Default::default()
            },
        );
        let stats = LockStatistics::default();
        let health = health();
        let context = AdvisorContext {
            database_id: "db",
            engine: DatabaseEngineKind::PostgreSQL,
            statistics: &stats,
            chains: &[],
            has_cycle: false,
            contentions: &contentions,
            health: &health,
            metadata: Some(&metadata),
            p99_wait_time_ms: 0.0,
        };
        assert!(!IndexStrategy::new().is_applicable(&context));
    }

    #[test]
    fn test_mysql_script_and_unsafe_identifiers() {
        let cols = vec!["sku".to_string()];
        let (script, rollback) =
            IndexStrategy::scripts(DatabaseEngineKind::MySQL, "inventory.items", &cols).unwrap();
        assert!(script.starts_with("ALTER TABLE inventory.items ADD INDEX idx_items_sku (sku)"));
        assert_eq!(rollback, "ALTER TABLE inventory.items DROP INDEX idx_items_sku;");

        assert!(IndexStrategy::scripts(DatabaseEngineKind::MySQL, "relation 1663", &cols).is_none());
        assert!(IndexStrategy::scripts(
            DatabaseEngineKind::PostgreSQL,
            "orders",
            &["id); DROP TABLE orders; --".to_string()]
        )
        .is_none());
    }

    #[test]
    fn test_equal_impact_ranks_by_object_id() {
        let contentions = vec![
            metric("public.shipments", ContentionPattern::HotSpot, 4_000.0),
            metric("public.accounts", ContentionPattern::HotSpot, 4_000.0),
        ];
        let stats = LockStatistics::default();
        let health = health();
        let context = AdvisorContext {
            database_id: "db",
            engine: DatabaseEngineKind::PostgreSQL,
            statistics: &stats,
            chains: &[],
            has_cycle: false,
            contentions: &contentions,
            health: &health,
            metadata: None,
            p99_wait_time_ms: 0.0,
        };

        let advisor = crate::lock_analysis::advisor::OptimizationAdvisor::new(10).register(IndexStrategy::new());
        let outcome = advisor.advise(&context);
        let objects: Vec<_> = outcome.advice.iter().map(|a| a.object_id.as_str()).collect();
        assert_eq!(objects, vec!["public.accounts", "public.shipments"]);
        assert!(outcome.advice.iter().all(|a| a.impact_score() == 50.0));
    }
}
