//! Lock Analysis Engine
//!
//! 収集 → 分析 → 集約 のパイプラインを管理するオーケストレーター。
//! 指定されていないアナライザーは標準実装で補完される。

use super::advisor::{panic_message, AdvisorContext, OptimizationAdvisor};
use super::cache::AnalysisCache;
use super::collector::SnapshotCollector;
use super::contention::{ContentionAnalysis, ContentionAnalyzer, ContentionHistoryStore};
use super::health::{percentile, HealthInput, HealthScorer};
use super::retry::RetryStrategy;
use super::single_flight::SingleFlight;
use super::types::{
    AnalysisComponent, AnalysisResult, CollectionWindow, ContentionMetric, Degradation,
    LockSnapshot, LockStatistics,
};
use super::wait_chain::{WaitChainAnalysis, WaitChainBuilder, WaitChainReport};
use crate::config::EngineConfig;
use crate::error::{AnalysisError, CollectionError, EngineError};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// オーケストレーター設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// キャッシュTTL（秒、0でキャッシュ無効）
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
    /// コレクター1回あたりのタイムアウト（ms）
    pub collect_timeout_ms: u64,
    /// 収集全体（リトライ含む）のデフォルト予算（ms）
    pub analysis_timeout_ms: u64,
    pub retry: RetryStrategy,
    /// 同時に実行する分析パスの上限
    pub max_concurrent_analyses: usize,
    pub default_window_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 30,
            cache_max_entries: 256,
            collect_timeout_ms: 5_000,
            analysis_timeout_ms: 30_000,
            retry: RetryStrategy::default(),
            max_concurrent_analyses: 4,
            default_window_secs: 300,
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.collect_timeout_ms == 0 {
            return Err(EngineError::configuration("engine.collect_timeout_ms must be greater than 0"));
        }
        if self.analysis_timeout_ms == 0 {
            return Err(EngineError::configuration("engine.analysis_timeout_ms must be greater than 0"));
        }
        if self.max_concurrent_analyses == 0 {
            return Err(EngineError::configuration(
                "engine.max_concurrent_analyses must be greater than 0",
            ));
        }
        if self.default_window_secs == 0 {
            return Err(EngineError::configuration("engine.default_window_secs must be greater than 0"));
        }
        self.retry.validate().map_err(EngineError::Configuration)
    }
}

/// 分析ステージ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnalysisStage {
    Idle,
    Collecting,
    Analyzing,
    Aggregating,
    Done,
    Failed,
}

impl AnalysisStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AnalysisStage::Done | AnalysisStage::Failed)
    }

    pub fn can_transition_to(&self, next: AnalysisStage) -> bool {
        use AnalysisStage::*;
        match (self, next) {
            (Idle, Collecting) | (Collecting, Analyzing) | (Analyzing, Aggregating) | (Aggregating, Done) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AnalysisStage::Idle => "idle",
            AnalysisStage::Collecting => "collecting",
            AnalysisStage::Analyzing => "analyzing",
            AnalysisStage::Aggregating => "aggregating",
            AnalysisStage::Done => "done",
            AnalysisStage::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

/// 1回の分析の状態機械
#[derive(Debug)]
pub struct StageMachine {
    stage: AnalysisStage,
}

impl Default for StageMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StageMachine {
    pub fn new() -> Self {
        Self {
            stage: AnalysisStage::Idle,
        }
    }

    pub fn stage(&self) -> AnalysisStage {
        self.stage
    }

    pub fn advance(&mut self, next: AnalysisStage) -> Result<(), AnalysisError> {
        if !self.stage.can_transition_to(next) {
            return Err(AnalysisError::InvalidTransition {
                from: self.stage.to_string(),
                to: next.to_string(),
            });
        }
        debug!("Stage {} -> {}", self.stage, next);
        self.stage = next;
        Ok(())
    }

    fn fail(&mut self) {
        if !self.stage.is_terminal() {
            self.stage = AnalysisStage::Failed;
        }
    }
}

/// 分析オプション
#[derive(Debug, Clone, Default)]
pub struct AnalysisOptions {
    /// キャッシュを無視して再収集
    pub force_refresh: bool,
    /// 収集ウィンドウ（未指定時は設定値）
    pub time_range: Option<CollectionWindow>,
    /// 収集の時間予算（未指定時は設定値）
    pub timeout: Option<Duration>,
    /// 呼び出し元の待機を打ち切るトークン
    pub cancellation: Option<CancellationToken>,
}

impl AnalysisOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn force_refresh(mut self) -> Self {
        self.force_refresh = true;
        self
    }

    pub fn with_time_range(mut self, window: CollectionWindow) -> Self {
        self.time_range = Some(window);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

/// エンジンビルダー
pub struct LockAnalysisEngineBuilder {
    collector: Arc<dyn SnapshotCollector>,
    config: EngineConfig,
    wait_chain: Option<Arc<dyn WaitChainAnalysis>>,
    contention: Option<Arc<dyn ContentionAnalysis>>,
    advisor: Option<OptimizationAdvisor>,
}

impl LockAnalysisEngineBuilder {
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_wait_chain_analyzer<A: WaitChainAnalysis + 'static>(mut self, analyzer: A) -> Self {
        self.wait_chain = Some(Arc::new(analyzer));
        self
    }

    pub fn with_contention_analyzer<A: ContentionAnalysis + 'static>(mut self, analyzer: A) -> Self {
        self.contention = Some(Arc::new(analyzer));
        self
    }

    pub fn with_advisor(mut self, advisor: OptimizationAdvisor) -> Self {
        self.advisor = Some(advisor);
        self
    }

    /// 設定を検証してエンジンを構築
    pub fn build(self) -> Result<LockAnalysisEngine, EngineError> {
        let config = self.config;
        config.validate()?;

        let scorer = HealthScorer::new(config.health.clone())?;
        let advisor = match self.advisor {
            Some(advisor) => advisor,
            None => OptimizationAdvisor::with_default_strategies(&config.advisor)?,
        };
        let wait_chain = self
            .wait_chain
            .unwrap_or_else(|| Arc::new(WaitChainBuilder::new(config.wait_chain.clone())));
        let contention = self
            .contention
            .unwrap_or_else(|| Arc::new(ContentionAnalyzer::new(config.contention.clone())));

        let orchestrator = config.engine.clone();
        info!(
            "Lock analysis engine ready (cache ttl {}s, max concurrent analyses {})",
            orchestrator.cache_ttl_secs, orchestrator.max_concurrent_analyses
        );

        Ok(LockAnalysisEngine {
            inner: Arc::new(EngineInner {
                collector: self.collector,
                wait_chain,
                contention,
                scorer,
                advisor,
                cache: AnalysisCache::new(
                    Duration::from_secs(orchestrator.cache_ttl_secs),
                    orchestrator.cache_max_entries,
                ),
                history: ContentionHistoryStore::new(
                    config.contention.history_window,
                    config.contention.max_tracked_databases,
                ),
                flights: Arc::new(SingleFlight::new()),
                permits: Arc::new(Semaphore::new(orchestrator.max_concurrent_analyses)),
                shutdown: CancellationToken::new(),
                config: orchestrator,
            }),
        })
    }
}

struct EngineInner {
    collector: Arc<dyn SnapshotCollector>,
    wait_chain: Arc<dyn WaitChainAnalysis>,
    contention: Arc<dyn ContentionAnalysis>,
    scorer: HealthScorer,
    advisor: OptimizationAdvisor,
    config: OrchestratorConfig,
    cache: AnalysisCache,
    history: ContentionHistoryStore,
    flights: Arc<SingleFlight<Arc<AnalysisResult>>>,
    permits: Arc<Semaphore>,
    shutdown: CancellationToken,
}

/// ロック分析エンジン
///
/// `Clone` は内部状態（キャッシュ・実行中タスク・履歴）を共有する
#[derive(Clone)]
pub struct LockAnalysisEngine {
    inner: Arc<EngineInner>,
}

impl LockAnalysisEngine {
    pub fn builder(collector: Arc<dyn SnapshotCollector>) -> LockAnalysisEngineBuilder {
        LockAnalysisEngineBuilder {
            collector,
            config: EngineConfig::default(),
            wait_chain: None,
            contention: None,
            advisor: None,
        }
    }

    /// 標準構成でエンジンを作成
    pub fn new(collector: Arc<dyn SnapshotCollector>, config: EngineConfig) -> Result<Self, EngineError> {
        Self::builder(collector).with_config(config).build()
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.inner.config
    }

    /// データベースのロック状態を分析
    pub async fn analyze(
        &self,
        database_id: &str,
        options: AnalysisOptions,
    ) -> Result<Arc<AnalysisResult>, EngineError> {
        if database_id.trim().is_empty() {
            return Err(EngineError::configuration("database id must not be empty"));
        }
        if self.inner.shutdown.is_cancelled() {
            return Err(EngineError::Cancelled("engine is shut down".to_string()));
        }

        let window = options
            .time_range
            .unwrap_or_else(|| CollectionWindow::last_secs(self.inner.config.default_window_secs));

        if !options.force_refresh {
            if let Some(cached) = self.inner.cache.get(database_id, window).await {
                info!("Serving cached lock analysis for '{}'", database_id);
                return Ok(cached);
            }
        }

        let budget = options
            .timeout
            .unwrap_or_else(|| Duration::from_millis(self.inner.config.analysis_timeout_ms));
        let inner = Arc::clone(&self.inner);
        let owned_id = database_id.to_string();
        let run = self.inner.flights.run(database_id, window, move || {
            let inner = inner;
            async move { inner.execute(owned_id, window, budget).await }
        });

        // 実行中の分析に合流した場合も呼び出し元自身の予算で待機を打ち切る
        let bounded = tokio::time::timeout(budget, run);
        let caller_cancelled = wait_cancelled(options.cancellation);
        tokio::select! {
            result = bounded => match result {
                Ok(result) => result,
                Err(_) => {
                    warn!("Caller budget of {:?} elapsed waiting for '{}'", budget, database_id);
                    Err(EngineError::Timeout {
                        database_id: database_id.to_string(),
                        budget,
                    })
                }
            },
            _ = caller_cancelled => {
                info!("Caller stopped waiting for analysis of '{}'", database_id);
                Err(EngineError::Cancelled(format!("analysis of '{}' cancelled by caller", database_id)))
            }
            _ = self.inner.shutdown.cancelled() => {
                Err(EngineError::Cancelled("engine is shutting down".to_string()))
            }
        }
    }

    /// キャッシュを破棄
    pub async fn invalidate(&self, database_id: &str) {
        self.inner.cache.invalidate(database_id).await;
    }

    /// 実行中の分析を中断し、以降の呼び出しを拒否する
    pub async fn shutdown(&self) {
        info!("Shutting down lock analysis engine");
        self.inner.shutdown.cancel();
        self.inner.permits.close();
        self.inner.flights.abort_all().await;
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }
}

async fn wait_cancelled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

/// spawn_blocking の結果を平坦化（パニック・中断は `Aborted` として理由文字列に変換）
fn flatten_join<T>(result: Result<Result<T, AnalysisError>, JoinError>) -> Result<T, String> {
    result
        .unwrap_or_else(|e| Err(join_failure(e)))
        .map_err(|e| e.to_string())
}

fn join_failure(e: JoinError) -> AnalysisError {
    if e.is_panic() {
        AnalysisError::Aborted(format!("panicked: {}", panic_message(e.into_panic().as_ref())))
    } else {
        AnalysisError::Aborted(format!("task failed: {}", e))
    }
}

impl EngineInner {
    async fn execute(
        self: Arc<Self>,
        database_id: String,
        window: CollectionWindow,
        budget: Duration,
    ) -> Result<Arc<AnalysisResult>, EngineError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("lock_analysis", database_id = %database_id, run_id = %run_id);

        async move {
            let mut stage = StageMachine::new();
            let result = self.run_stages(&mut stage, run_id, &database_id, window, budget).await;
            match &result {
                Ok(result) => info!(
                    "Lock analysis complete: health {:.1} ({:?}), {} chain(s), {} advice, degraded: {}",
                    result.health.value,
                    result.health.status,
                    result.chains.len(),
                    result.advice.len(),
                    result.degraded
                ),
                Err(e) => {
                    stage.fail();
                    error!("Lock analysis failed at stage {}: {}", stage.stage(), e);
                }
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn run_stages(
        &self,
        stage: &mut StageMachine,
        run_id: Uuid,
        database_id: &str,
        window: CollectionWindow,
        budget: Duration,
    ) -> Result<Arc<AnalysisResult>, EngineError> {
        let transition = |e: AnalysisError| EngineError::Internal(e.to_string());

        stage.advance(AnalysisStage::Collecting).map_err(transition)?;
        let snapshot = Arc::new(self.collect(database_id, window, budget).await?);
        debug!(
            "Collected snapshot with {} entries captured at {}",
            snapshot.entries.len(),
            snapshot.captured_at
        );

        stage.advance(AnalysisStage::Analyzing).map_err(transition)?;
        let _permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| EngineError::Cancelled("engine is shutting down".to_string()))?;

        let mut degradations = Vec::new();
        let history = self.history.snapshot(database_id).await;

        let wait_chain_task = {
            let analyzer = Arc::clone(&self.wait_chain);
            let snapshot = Arc::clone(&snapshot);
            tokio::task::spawn_blocking(move || analyzer.build(&snapshot))
        };
        let contention_task = {
            let analyzer = Arc::clone(&self.contention);
            let snapshot = Arc::clone(&snapshot);
            tokio::task::spawn_blocking(move || analyzer.analyze(&snapshot, history.as_ref()))
        };
        let (wait_chain_result, contention_result) = tokio::join!(wait_chain_task, contention_task);

        let report: Option<WaitChainReport> = match flatten_join(wait_chain_result) {
            Ok(report) => Some(report),
            Err(reason) => {
                warn!("Wait-chain analysis degraded: {}", reason);
                degradations.push(Degradation {
                    component: AnalysisComponent::WaitChain,
                    reason,
                });
                None
            }
        };
        let contentions: Option<Vec<ContentionMetric>> = match flatten_join(contention_result) {
            Ok(metrics) => {
                self.history.record(database_id, &metrics).await;
                Some(metrics)
            }
            Err(reason) => {
                warn!("Contention analysis degraded: {}", reason);
                degradations.push(Degradation {
                    component: AnalysisComponent::Contention,
                    reason,
                });
                None
            }
        };

        let statistics = match &snapshot.statistics {
            Some(statistics) => statistics.clone(),
            None => {
                warn!("Snapshot has no lock statistics; using detected cycles as deadlock count");
                degradations.push(Degradation {
                    component: AnalysisComponent::Statistics,
                    reason: "collector returned no lock statistics".to_string(),
                });
                LockStatistics {
                    deadlock_count: report.as_ref().map(|r| r.cycle_count() as u64).unwrap_or(0),
                    ..Default::default()
                }
            }
        };

        let observed_wait_times = snapshot.wait_times_ms();
        let chains = report.as_ref().map(|r| r.chains.as_slice());
        let health = self.scorer.score(&HealthInput {
            statistics: &statistics,
            chains,
            contentions: contentions.as_deref(),
            observed_wait_times_ms: &observed_wait_times,
        });

        let p99_wait_time_ms = statistics
            .p99_wait_time_ms
            .filter(|v| v.is_finite())
            .unwrap_or_else(|| percentile(&observed_wait_times, 0.99));
        let has_cycle = report.as_ref().is_some_and(|r| r.has_cycle);
        let outcome = self.advisor.advise(&AdvisorContext {
            database_id,
            engine: snapshot.engine,
            statistics: &statistics,
            chains: chains.unwrap_or(&[]),
            has_cycle,
            contentions: contentions.as_deref().unwrap_or(&[]),
            health: &health,
            metadata: snapshot.metadata.as_ref(),
            p99_wait_time_ms,
        });
        for failure in outcome.failures {
            degradations.push(Degradation {
                component: AnalysisComponent::Advisor,
                reason: format!("strategy {} failed: {}", failure.strategy, failure.reason),
            });
        }

        stage.advance(AnalysisStage::Aggregating).map_err(transition)?;
        let (chains, dropped_edges, chains_truncated) = match report {
            Some(report) => (report.chains, report.dropped_edges, report.truncated),
            None => (Vec::new(), 0, false),
        };
        let result = Arc::new(AnalysisResult {
            run_id,
            database_id: database_id.to_string(),
            window,
            snapshot_captured_at: snapshot.captured_at,
            statistics: snapshot.statistics.clone(),
            chains,
            has_cycle,
            dropped_edges,
            chains_truncated,
            contentions: contentions.unwrap_or_default(),
            health,
            advice: outcome.advice,
            degraded: !degradations.is_empty(),
            degradations,
            analyzed_at: Utc::now(),
        });

        // 一時的な失敗による縮退結果はキャッシュしない
        if result.degraded {
            debug!("Skipping cache for degraded analysis of '{}'", database_id);
        } else {
            self.cache.insert(Arc::clone(&result)).await;
        }
        stage.advance(AnalysisStage::Done).map_err(transition)?;
        Ok(result)
    }

    /// リトライとタイムアウトを適用してスナップショットを収集
    async fn collect(
        &self,
        database_id: &str,
        window: CollectionWindow,
        budget: Duration,
    ) -> Result<LockSnapshot, EngineError> {
        let attempt_timeout = Duration::from_millis(self.config.collect_timeout_ms);
        let collector = &self.collector;

        let attempts = self.config.retry.execute(|| {
            let collector = Arc::clone(collector);
            let database_id = database_id.to_string();
            async move {
                match tokio::time::timeout(attempt_timeout, collector.collect(&database_id, window)).await {
                    Ok(result) => result,
                    Err(_) => Err(CollectionError::Timeout(format!(
                        "no response within {:?}",
                        attempt_timeout
                    ))),
                }
            }
        });

        let (snapshot, attempts) = match tokio::time::timeout(budget, attempts).await {
            Err(_) => {
                warn!("Collection exceeded budget of {:?}", budget);
                return Err(EngineError::Timeout {
                    database_id: database_id.to_string(),
                    budget,
                });
            }
            Ok(Err(failure)) => {
                return Err(EngineError::CollectionFailure {
                    database_id: database_id.to_string(),
                    attempts: failure.attempts,
                    reason: failure.last_error.to_string(),
                });
            }
            Ok(Ok(collected)) => collected,
        };

        if snapshot.database_id != database_id {
            return Err(EngineError::CollectionFailure {
                database_id: database_id.to_string(),
                attempts,
                reason: CollectionError::Malformed(format!(
                    "snapshot belongs to '{}'",
                    snapshot.database_id
                ))
                .to_string(),
            });
        }

        debug!("Snapshot collected after {} attempt(s)", attempts);
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_transitions() {
        let mut machine = StageMachine::new();
        assert!(machine.advance(AnalysisStage::Analyzing).is_err());
        machine.advance(AnalysisStage::Collecting).unwrap();
        machine.advance(AnalysisStage::Analyzing).unwrap();
        machine.advance(AnalysisStage::Aggregating).unwrap();
        machine.advance(AnalysisStage::Done).unwrap();
        assert_eq!(machine.stage(), AnalysisStage::Done);

        let err = machine.advance(AnalysisStage::Failed).unwrap_err();
        assert_eq!(
            err,
            AnalysisError::InvalidTransition {
                from: "done".into(),
                to: "failed".into()
            }
        );
    }

    #[test]
    fn test_failed_reachable_from_any_active_stage() {
        for stage in [
            AnalysisStage::Idle,
            AnalysisStage::Collecting,
            AnalysisStage::Analyzing,
            AnalysisStage::Aggregating,
        ] {
            assert!(stage.can_transition_to(AnalysisStage::Failed), "{}", stage);
        }
        assert!(!AnalysisStage::Failed.can_transition_to(AnalysisStage::Collecting));
    }

    #[test]
    fn test_orchestrator_config_validation() {
        assert!(OrchestratorConfig::default().validate().is_ok());
        let config = OrchestratorConfig {
            max_concurrent_analyses: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_analyzer_panic_becomes_aborted() {
        let joined = tokio::task::spawn_blocking(|| -> Result<u32, AnalysisError> {
            panic!("adjacency list corrupted")
        })
        .await;

        let reason = flatten_join(joined).unwrap_err();
        assert!(reason.starts_with("Analyzer aborted: panicked:"), "{}", reason);
        assert!(reason.contains("adjacency list corrupted"));

        let ok = flatten_join::<u32>(Ok(Ok(3)));
        assert_eq!(ok, Ok(3));
    }
}
