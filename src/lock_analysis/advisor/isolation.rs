//! Isolation Level Strategy

use super::strategy::{AdviceError, AdviceStrategy, AdvisorContext};
use crate::lock_analysis::types::{AdviceKind, DatabaseEngineKind, OptimizationAdvice};
use std::collections::BTreeSet;

/// デッドロック（統計上または検出した循環）に対する分離レベル・ロック順序のアドバイス
#[derive(Debug, Clone, Default)]
pub struct IsolationLevelStrategy;

impl IsolationLevelStrategy {
    pub fn new() -> Self {
        Self
    }

    fn deadlocks(context: &AdvisorContext<'_>) -> u64 {
        let cycles = context.chains.iter().filter(|c| c.is_cycle).count() as u64;
        context.statistics.deadlock_count.max(cycles)
    }
}

impl AdviceStrategy for IsolationLevelStrategy {
    fn name(&self) -> &'static str {
        "isolation_level"
    }

    fn is_applicable(&self, context: &AdvisorContext<'_>) -> bool {
        context.has_cycle || Self::deadlocks(context) > 0
    }

    fn generate(&self, context: &AdvisorContext<'_>) -> Result<Vec<OptimizationAdvice>, AdviceError> {
        let deadlocks = Self::deadlocks(context);
        let objects: BTreeSet<&str> = context
            .chains
            .iter()
            .filter(|c| c.is_cycle)
            .flat_map(|c| c.objects.iter().map(String::as_str))
            .collect();

        let object_id = objects
            .iter()
            .next()
            .map(|o| o.to_string())
            .unwrap_or_else(|| context.database_id.to_string());

        let mut description = format!(
            "{} deadlock(s) observed on {}.",
            deadlocks, context.database_id
        );
        if !objects.is_empty() {
            description.push_str(&format!(
                " Objects in the detected cycle(s): {}.",
                objects.iter().copied().collect::<Vec<_>>().join(", ")
            ));
        }
        description.push_str(
            " Acquire locks in a consistent order across transactions (for example by primary key), \
             keep transactions short, and use SELECT ... FOR UPDATE SKIP LOCKED for work-queue access.",
        );

        let impact = (50.0 + 10.0 * deadlocks as f64).min(95.0);
        let advice = match context.engine {
            DatabaseEngineKind::MySQL => {
                description.push_str(
                    " REPEATABLE READ takes gap locks on range scans. READ COMMITTED avoids most of them.",
                );
                OptimizationAdvice::new(
                    self.name(),
                    AdviceKind::IsolationLevel,
                    object_id,
                    "Reduce deadlocks with READ COMMITTED and consistent lock ordering",
                    description,
                    impact,
                )
                .with_scripts(
                    "SET GLOBAL TRANSACTION ISOLATION LEVEL READ COMMITTED;",
                    "SET GLOBAL TRANSACTION ISOLATION LEVEL REPEATABLE READ;",
                )
            }
            _ => OptimizationAdvice::new(
                self.name(),
                AdviceKind::IsolationLevel,
                object_id,
                "Reduce deadlocks with consistent lock ordering",
                description,
                impact,
            ),
        };

        Ok(vec![advice])
    }
}
