//! Health Scorer
//!
//! 待機時間・競合・デッドロック・チェーン長・タイムアウトの5軸のサブスコアを
//! 固定の重みで合成し、0-100 のヘルススコアを算出する。入力が同じなら
//! 常に同じ結果を返す純粋関数として実装する。

use super::types::{
    ChainSeverity, ContentionMetric, ContentionPattern, HealthScore, HealthStatus, LockStatistics,
    WaitChain,
};
use crate::error::EngineError;
use serde::{Deserialize, Serialize};

/// サブスコアの重み
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthWeights {
    pub wait_time: f64,
    pub contention: f64,
    pub deadlock: f64,
    pub chain_length: f64,
    pub timeout: f64,
}

impl Default for HealthWeights {
    fn default() -> Self {
        Self {
            wait_time: 0.30,
            contention: 0.25,
            deadlock: 0.20,
            chain_length: 0.15,
            timeout: 0.10,
        }
    }
}

impl HealthWeights {
    fn as_array(&self) -> [(&'static str, f64); 5] {
        [
            ("wait_time", self.wait_time),
            ("contention", self.contention),
            ("deadlock", self.deadlock),
            ("chain_length", self.chain_length),
            ("timeout", self.timeout),
        ]
    }

    /// 各重みが [0,1] に収まり、合計が1であることを検証
    pub fn validate(&self) -> Result<(), String> {
        for (name, weight) in self.as_array() {
            if !weight.is_finite() || !(0.0..=1.0).contains(&weight) {
                return Err(format!("health.weights.{} must be within [0, 1], got {}", name, weight));
            }
        }
        let sum: f64 = self.as_array().iter().map(|(_, w)| w).sum();
        if (sum - 1.0).abs() > 1e-6 {
            return Err(format!("health.weights must sum to 1.0, got {:.6}", sum));
        }
        Ok(())
    }
}

/// ヘルススコア設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub weights: HealthWeights,
    /// 上流アナライザーが縮退したときに使う中立スコア
    pub neutral_sub_score: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            weights: HealthWeights::default(),
            neutral_sub_score: 100.0,
        }
    }
}

impl HealthConfig {
    pub fn validate(&self) -> Result<(), String> {
        self.weights.validate()?;
        if !(0.0..=100.0).contains(&self.neutral_sub_score) {
            return Err(format!(
                "health.neutral_sub_score must be within [0, 100], got {}",
                self.neutral_sub_score
            ));
        }
        Ok(())
    }
}

/// スコア算出の入力
///
/// `chains` / `contentions` が `None` の場合は該当アナライザーが縮退しており、
/// 対応するサブスコアは中立値になる。
#[derive(Debug, Clone, Copy)]
pub struct HealthInput<'a> {
    pub statistics: &'a LockStatistics,
    pub chains: Option<&'a [WaitChain]>,
    pub contentions: Option<&'a [ContentionMetric]>,
    /// 統計にP99がない場合にスナップショットから算出した待機時間
    pub observed_wait_times_ms: &'a [f64],
}

/// ヘルススコア算出器
#[derive(Debug, Clone)]
pub struct HealthScorer {
    config: HealthConfig,
}

impl HealthScorer {
    /// 重みを検証して作成（不正な設定は即座にエラー）
    pub fn new(config: HealthConfig) -> Result<Self, EngineError> {
        config.validate().map_err(EngineError::Configuration)?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    pub fn score(&self, input: &HealthInput<'_>) -> HealthScore {
        let neutral = self.config.neutral_sub_score;
        let p99 = input
            .statistics
            .p99_wait_time_ms
            .filter(|v| v.is_finite())
            .unwrap_or_else(|| percentile(input.observed_wait_times_ms, 0.99));

        let wait_time = wait_time_score(p99);
        let contention = input.contentions.map(contention_score).unwrap_or(neutral);
        let deadlock = deadlock_score(input.statistics.deadlock_count);
        let chain_length = input.chains.map(chain_length_score).unwrap_or(neutral);
        let timeout = timeout_score(input.statistics);

        let w = &self.config.weights;
        let value = (wait_time * w.wait_time
            + contention * w.contention
            + deadlock * w.deadlock
            + chain_length * w.chain_length
            + timeout * w.timeout)
            .clamp(0.0, 100.0);

        HealthScore {
            value,
            wait_time,
            contention,
            deadlock,
            chain_length,
            timeout,
            status: HealthStatus::from_score(value),
        }
    }
}

/// nearest-rank 方式のパーセンタイル
pub fn percentile(values: &[f64], quantile: f64) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = (quantile.clamp(0.0, 1.0) * sorted.len() as f64).ceil() as usize;
    sorted[rank.clamp(1, sorted.len()) - 1]
}

fn lerp(x: f64, x0: f64, x1: f64, y0: f64, y1: f64) -> f64 {
    y0 + (x - x0) / (x1 - x0) * (y1 - y0)
}

/// P99待機時間（ミリ秒）に対する帯状の逆カーブ
pub fn wait_time_score(p99_ms: f64) -> f64 {
    let p = p99_ms.max(0.0);
    let score = if p < 100.0 {
        lerp(p, 0.0, 100.0, 100.0, 95.0)
    } else if p < 500.0 {
        lerp(p, 100.0, 500.0, 90.0, 70.0)
    } else if p < 2_000.0 {
        lerp(p, 500.0, 2_000.0, 70.0, 50.0)
    } else if p < 5_000.0 {
        lerp(p, 2_000.0, 5_000.0, 50.0, 30.0)
    } else {
        lerp(p, 5_000.0, 30_000.0, 30.0, 0.0)
    };
    score.clamp(0.0, 100.0)
}

pub fn contention_score(metrics: &[ContentionMetric]) -> f64 {
    let hot_spots = metrics
        .iter()
        .filter(|m| m.pattern == ContentionPattern::HotSpot)
        .count() as f64;
    let bursts = metrics
        .iter()
        .filter(|m| m.pattern == ContentionPattern::Burst)
        .count() as f64;
    let affected: u64 = metrics.iter().map(|m| m.affected_sessions).sum();
    let session_penalty = (affected as f64 * 2.0).min(30.0);

    (100.0 - 15.0 * hot_spots - 10.0 * bursts - session_penalty).clamp(0.0, 100.0)
}

/// デッドロックが1件でもあれば 60 以下
pub fn deadlock_score(deadlock_count: u64) -> f64 {
    match deadlock_count {
        0 => 100.0,
        1 => 60.0,
        2 => 40.0,
        3 => 25.0,
        n => (25.0 - 5.0 * (n - 3) as f64).max(0.0),
    }
}

pub fn chain_length_score(chains: &[WaitChain]) -> f64 {
    let longest = chains.iter().map(|c| c.length).max().unwrap_or(0);
    let critical = chains
        .iter()
        .filter(|c| c.severity == ChainSeverity::Critical)
        .count() as f64;
    let length_penalty = longest.saturating_sub(1) as f64 * 15.0;

    (100.0 - length_penalty - 10.0 * critical).clamp(0.0, 100.0)
}

pub fn timeout_score(statistics: &LockStatistics) -> f64 {
    let denominator = statistics.total_lock_requests.max(statistics.timeout_count);
    if denominator == 0 {
        return 100.0;
    }
    let rate = statistics.timeout_count as f64 / denominator as f64;
    (100.0 - 500.0 * rate).clamp(0.0, 100.0)
}
