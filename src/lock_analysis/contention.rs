//! Contention Analyzer
//!
//! 競合オブジェクト単位の集計とパターン分類

use super::types::{ContentionMetric, ContentionPattern, LockSnapshot, SessionId};
use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tokio::sync::RwLock;
use tracing::debug;

/// 競合分析設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentionConfig {
    /// hot_spot 判定: contention_count がこの値を超える
    pub hot_spot_min_count: u64,
    /// hot_spot 判定: 平均待機時間がこの値を超える（ミリ秒）
    pub hot_spot_min_avg_wait_ms: f64,
    /// burst 判定: 直近平均に対する倍率
    pub burst_factor: f64,
    /// 保持する過去サイクル数（0で履歴無効）
    pub history_window: usize,
    /// timeout_prone 判定: タイムアウト比率
    pub timeout_ratio_threshold: f64,
    /// frequent 判定: contention_count がこの値を超える
    pub frequent_min_count: u64,
    /// 履歴を保持するデータベース数の上限（超過時は最も古く記録されたものから破棄）
    pub max_tracked_databases: usize,
}

impl Default for ContentionConfig {
    fn default() -> Self {
        Self {
            hot_spot_min_count: 10,
            hot_spot_min_avg_wait_ms: 1_000.0,
            burst_factor: 2.0,
            history_window: 6,
            timeout_ratio_threshold: 0.1,
            frequent_min_count: 3,
            max_tracked_databases: 256,
        }
    }
}

impl ContentionConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !self.hot_spot_min_avg_wait_ms.is_finite() || self.hot_spot_min_avg_wait_ms < 0.0 {
            return Err("contention.hot_spot_min_avg_wait_ms must be a non-negative number".into());
        }
        if !self.burst_factor.is_finite() || self.burst_factor <= 1.0 {
            return Err(format!(
                "contention.burst_factor must be greater than 1.0, got {}",
                self.burst_factor
            ));
        }
        if !(0.0..=1.0).contains(&self.timeout_ratio_threshold) {
            return Err("contention.timeout_ratio_threshold must be within [0, 1]".into());
        }
        if self.max_tracked_databases == 0 {
            return Err("contention.max_tracked_databases must be at least 1".into());
        }
        Ok(())
    }
}

/// 過去サイクルの競合回数（オブジェクト単位）のリングバッファ
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContentionHistory {
    window: usize,
    cycles: VecDeque<BTreeMap<String, u64>>,
}

impl ContentionHistory {
    pub fn new(window: usize) -> Self {
        Self {
            window,
            cycles: VecDeque::with_capacity(window),
        }
    }

    pub fn len(&self) -> usize {
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }

    /// 1サイクル分の集計を追加（古いものから破棄）
    pub fn record(&mut self, metrics: &[ContentionMetric]) {
        if self.window == 0 {
            return;
        }
        let counts = metrics
            .iter()
            .map(|m| (m.object_id.clone(), m.contention_count))
            .collect();
        if self.cycles.len() >= self.window {
            self.cycles.pop_front();
        }
        self.cycles.push_back(counts);
    }

    /// 直近平均（履歴がなければ None、出現しないサイクルは0として扱う）
    pub fn trailing_average(&self, object_id: &str) -> Option<f64> {
        if self.cycles.is_empty() {
            return None;
        }
        let total: u64 = self
            .cycles
            .iter()
            .map(|c| c.get(object_id).copied().unwrap_or(0))
            .sum();
        Some(total as f64 / self.cycles.len() as f64)
    }
}

#[derive(Debug)]
struct TrackedHistory {
    history: ContentionHistory,
    last_recorded: u64,
}

#[derive(Debug, Default)]
struct HistoryState {
    next_sequence: u64,
    histories: HashMap<String, TrackedHistory>,
}

/// データベース単位の履歴ストア
///
/// 保持数は `max_databases` で上限を持ち、超過時は最後の記録が最も古いものを破棄する
#[derive(Debug, Default)]
pub struct ContentionHistoryStore {
    window: usize,
    max_databases: usize,
    state: RwLock<HistoryState>,
}

impl ContentionHistoryStore {
    pub fn new(window: usize, max_databases: usize) -> Self {
        Self {
            window,
            max_databases,
            state: RwLock::new(HistoryState::default()),
        }
    }

    /// 分析開始時点の履歴のコピーを取得
    pub async fn snapshot(&self, database_id: &str) -> Option<ContentionHistory> {
        if self.window == 0 {
            return None;
        }
        let state = self.state.read().await;
        state
            .histories
            .get(database_id)
            .map(|tracked| &tracked.history)
            .filter(|h| !h.is_empty())
            .cloned()
    }

    pub async fn record(&self, database_id: &str, metrics: &[ContentionMetric]) {
        if self.window == 0 || self.max_databases == 0 {
            return;
        }
        let mut state = self.state.write().await;
        state.next_sequence += 1;
        let sequence = state.next_sequence;

        if !state.histories.contains_key(database_id) && state.histories.len() >= self.max_databases {
            let oldest = state
                .histories
                .iter()
                .min_by_key(|(_, tracked)| tracked.last_recorded)
                .map(|(key, _)| key.clone());
            if let Some(key) = oldest {
                debug!("Evicting contention history for '{}'", key);
                state.histories.remove(&key);
            }
        }

        let tracked = state
            .histories
            .entry(database_id.to_string())
            .or_insert_with(|| TrackedHistory {
                history: ContentionHistory::new(self.window),
                last_recorded: sequence,
            });
        tracked.history.record(metrics);
        tracked.last_recorded = sequence;
    }

    /// 履歴を保持しているデータベース数
    pub async fn tracked_databases(&self) -> usize {
        self.state.read().await.histories.len()
    }
}

/// 競合分析トレイト
pub trait ContentionAnalysis: Send + Sync {
    fn analyze(
        &self,
        snapshot: &LockSnapshot,
        history: Option<&ContentionHistory>,
    ) -> Result<Vec<ContentionMetric>, AnalysisError>;
}

#[derive(Default)]
struct ObjectAccumulator {
    attempts: BTreeMap<(SessionId, String), f64>,
    sessions: BTreeSet<SessionId>,
}

/// 競合アナライザー
#[derive(Debug, Clone, Default)]
pub struct ContentionAnalyzer {
    config: ContentionConfig,
}

impl ContentionAnalyzer {
    pub fn new(config: ContentionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ContentionConfig {
        &self.config
    }

    /// パターン分類（最初に一致したものを採用）
    pub fn classify(&self, metric: &ContentionMetric, trailing_average: Option<f64>) -> ContentionPattern {
        let config = &self.config;

        if metric.contention_count > config.hot_spot_min_count
            && metric.avg_wait_time_ms > config.hot_spot_min_avg_wait_ms
        {
            return ContentionPattern::HotSpot;
        }

        if let Some(average) = trailing_average {
            // 基準値は1サイクル1回を下限とする
            let baseline = average.max(1.0);
            if metric.contention_count >= 2 && metric.contention_count as f64 >= config.burst_factor * baseline {
                return ContentionPattern::Burst;
            }
        }

        if metric.timeout_ratio() > config.timeout_ratio_threshold {
            return ContentionPattern::TimeoutProne;
        }

        if metric.contention_count > config.frequent_min_count {
            return ContentionPattern::Frequent;
        }

        ContentionPattern::Normal
    }
}

impl ContentionAnalysis for ContentionAnalyzer {
    fn analyze(
        &self,
        snapshot: &LockSnapshot,
        history: Option<&ContentionHistory>,
    ) -> Result<Vec<ContentionMetric>, AnalysisError> {
        let mut objects: BTreeMap<&str, ObjectAccumulator> = BTreeMap::new();

        for entry in snapshot.waiting_entries() {
            if entry.session_id.is_empty() || entry.object_id.trim().is_empty() {
                continue;
            }
            let wait = entry.wait_time_ms(snapshot.captured_at);
            let acc = objects.entry(entry.object_id.as_str()).or_default();
            let attempt = acc
                .attempts
                .entry((entry.session_id.clone(), entry.mode.to_string()))
                .or_insert(0.0);
            *attempt = attempt.max(wait);
            acc.sessions.insert(entry.session_id.clone());
        }

        let timeouts = snapshot.statistics.as_ref().map(|s| &s.timeouts_by_object);

        let mut metrics: Vec<ContentionMetric> = objects
            .into_iter()
            .map(|(object_id, acc)| {
                let contention_count = acc.attempts.len() as u64;
                let total_wait_time_ms: f64 = acc.attempts.values().sum();
                let max_wait_time_ms = acc.attempts.values().copied().fold(0.0_f64, f64::max);
                let avg_wait_time_ms = if contention_count > 0 {
                    total_wait_time_ms / contention_count as f64
                } else {
                    0.0
                };
                let timeout_count = timeouts
                    .and_then(|t| t.get(object_id).copied())
                    .unwrap_or(0);

                let mut metric = ContentionMetric {
                    object_id: object_id.to_string(),
                    contention_count,
                    total_wait_time_ms,
                    avg_wait_time_ms,
                    max_wait_time_ms,
                    affected_sessions: acc.sessions.len() as u64,
                    timeout_count,
                    pattern: ContentionPattern::Normal,
                };
                let average = history.and_then(|h| h.trailing_average(object_id));
                metric.pattern = self.classify(&metric, average);
                metric
            })
            .collect();

        metrics.sort_by(|a, b| {
            b.total_wait_time_ms
                .total_cmp(&a.total_wait_time_ms)
                .then_with(|| a.object_id.cmp(&b.object_id))
        });

        debug!(
            "Analyzed contention on {} object(s) for '{}' (history cycles: {})",
            metrics.len(),
            snapshot.database_id,
            history.map(|h| h.len()).unwrap_or(0)
        );

        Ok(metrics)
    }
}
