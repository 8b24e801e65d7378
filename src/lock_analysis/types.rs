//! Lock Analysis Types and Common Structures
//!
//! ロック分析で使用される共通の型定義

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// セッションID（pid / connection id）
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// データベースエンジン種別
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseEngineKind {
    #[default]
    PostgreSQL,
    MySQL,
    Other,
}

impl fmt::Display for DatabaseEngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DatabaseEngineKind::PostgreSQL => write!(f, "postgresql"),
            DatabaseEngineKind::MySQL => write!(f, "mysql"),
            DatabaseEngineKind::Other => write!(f, "other"),
        }
    }
}

/// ロックモード
///
/// PostgreSQLのテーブルレベルロック8種。InnoDBの IS/IX/S/X は
/// RowShare/RowExclusive/Share/Exclusive に対応付ける（互換関係が一致する）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum LockMode {
    AccessShare,
    RowShare,
    RowExclusive,
    ShareUpdateExclusive,
    Share,
    ShareRowExclusive,
    Exclusive,
    AccessExclusive,
}

impl LockMode {
    pub const ALL: [LockMode; 8] = [
        LockMode::AccessShare,
        LockMode::RowShare,
        LockMode::RowExclusive,
        LockMode::ShareUpdateExclusive,
        LockMode::Share,
        LockMode::ShareRowExclusive,
        LockMode::Exclusive,
        LockMode::AccessExclusive,
    ];

    /// 2つのモードが競合するかどうか
    pub fn conflicts_with(self, other: LockMode) -> bool {
        use LockMode::*;
        let conflicts: &[LockMode] = match self {
            AccessShare => &[AccessExclusive],
            RowShare => &[Exclusive, AccessExclusive],
            RowExclusive => &[Share, ShareRowExclusive, Exclusive, AccessExclusive],
            ShareUpdateExclusive => &[
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            Share => &[
                RowExclusive,
                ShareUpdateExclusive,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            ShareRowExclusive => &[
                RowExclusive,
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            Exclusive => &[
                RowShare,
                RowExclusive,
                ShareUpdateExclusive,
                Share,
                ShareRowExclusive,
                Exclusive,
                AccessExclusive,
            ],
            AccessExclusive => &LockMode::ALL,
        };
        conflicts.contains(&other)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LockMode::AccessShare => "AccessShareLock",
            LockMode::RowShare => "RowShareLock",
            LockMode::RowExclusive => "RowExclusiveLock",
            LockMode::ShareUpdateExclusive => "ShareUpdateExclusiveLock",
            LockMode::Share => "ShareLock",
            LockMode::ShareRowExclusive => "ShareRowExclusiveLock",
            LockMode::Exclusive => "ExclusiveLock",
            LockMode::AccessExclusive => "AccessExclusiveLock",
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LockMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        let normalized = normalized.strip_suffix("lock").unwrap_or(&normalized);

        match normalized {
            "accessshare" => Ok(LockMode::AccessShare),
            "rowshare" | "is" | "intentionshared" => Ok(LockMode::RowShare),
            "rowexclusive" | "ix" | "intentionexclusive" => Ok(LockMode::RowExclusive),
            "shareupdateexclusive" => Ok(LockMode::ShareUpdateExclusive),
            "share" | "s" | "shared" => Ok(LockMode::Share),
            "sharerowexclusive" | "six" => Ok(LockMode::ShareRowExclusive),
            "exclusive" | "x" => Ok(LockMode::Exclusive),
            "accessexclusive" => Ok(LockMode::AccessExclusive),
            _ => Err(format!("unknown lock mode: {}", s)),
        }
    }
}

impl TryFrom<String> for LockMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<LockMode> for String {
    fn from(value: LockMode) -> Self {
        value.as_str().to_string()
    }
}

/// ロックエントリ（pg_locks / data_locks の1行に相当）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockEntry {
    pub session_id: SessionId,
    pub object_id: String,
    pub mode: LockMode,
    pub granted: bool,
    #[serde(default)]
    pub wait_started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub query_text: Option<String>,
    /// コレクターが解決済みのブロッカー（空なら競合行列から導出）
    #[serde(default)]
    pub blocked_by: Vec<SessionId>,
}

impl LockEntry {
    pub fn new(
        session_id: impl Into<SessionId>,
        object_id: impl Into<String>,
        mode: LockMode,
        granted: bool,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            object_id: object_id.into(),
            mode,
            granted,
            wait_started_at: None,
            query_text: None,
            blocked_by: Vec::new(),
        }
    }

    /// 保持中のロック
    pub fn held(session_id: impl Into<SessionId>, object_id: impl Into<String>, mode: LockMode) -> Self {
        Self::new(session_id, object_id, mode, true)
    }

    /// 待機中のロック要求
    pub fn waiting(
        session_id: impl Into<SessionId>,
        object_id: impl Into<String>,
        mode: LockMode,
        wait_started_at: DateTime<Utc>,
    ) -> Self {
        let mut entry = Self::new(session_id, object_id, mode, false);
        entry.wait_started_at = Some(wait_started_at);
        entry
    }

    pub fn with_query(mut self, query: impl Into<String>) -> Self {
        self.query_text = Some(query.into());
        self
    }

    pub fn with_blocked_by<I, S>(mut self, blockers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<SessionId>,
    {
        self.blocked_by = blockers.into_iter().map(Into::into).collect();
        self
    }

    /// スナップショット時刻基準の待機時間（ミリ秒）
    pub fn wait_time_ms(&self, captured_at: DateTime<Utc>) -> f64 {
        if self.granted {
            return 0.0;
        }
        self.wait_started_at
            .map(|started| (captured_at - started).num_milliseconds().max(0) as f64)
            .unwrap_or(0.0)
    }
}

/// ロック統計（集計ウィンドウ単位）
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockStatistics {
    pub deadlock_count: u64,
    pub timeout_count: u64,
    pub total_lock_requests: u64,
    pub total_waits: u64,
    pub total_wait_time_ms: f64,
    #[serde(default)]
    pub p99_wait_time_ms: Option<f64>,
    #[serde(default)]
    pub timeouts_by_object: BTreeMap<String, u64>,
}

/// オブジェクト単位のスキーマメタデータ
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObjectMetadata {
    /// 競合箇所をカバーするインデックスが既に存在するか
    #[serde(default)]
    pub has_covering_index: bool,
    /// インデックス候補カラム（WHERE句で頻出するカラム等）
    #[serde(default)]
    pub candidate_columns: Vec<String>,
    #[serde(default)]
    pub row_estimate: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SchemaMetadata {
    #[serde(default)]
    pub objects: BTreeMap<String, ObjectMetadata>,
}

impl SchemaMetadata {
    pub fn object(&self, object_id: &str) -> Option<&ObjectMetadata> {
        self.objects.get(object_id)
    }

    pub fn with_object(mut self, object_id: impl Into<String>, metadata: ObjectMetadata) -> Self {
        self.objects.insert(object_id.into(), metadata);
        self
    }
}

/// ロックスナップショット
///
/// 1回の収集サイクルで取得された不変の値。統計とメタデータは部分取得を
/// 許容するため `Option` で表現する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockSnapshot {
    pub database_id: String,
    #[serde(default)]
    pub engine: DatabaseEngineKind,
    pub captured_at: DateTime<Utc>,
    #[serde(default)]
    pub entries: Vec<LockEntry>,
    #[serde(default)]
    pub statistics: Option<LockStatistics>,
    #[serde(default)]
    pub metadata: Option<SchemaMetadata>,
}

impl LockSnapshot {
    pub fn new(
        database_id: impl Into<String>,
        engine: DatabaseEngineKind,
        captured_at: DateTime<Utc>,
        entries: Vec<LockEntry>,
    ) -> Self {
        Self {
            database_id: database_id.into(),
            engine,
            captured_at,
            entries,
            statistics: None,
            metadata: None,
        }
    }

    pub fn with_statistics(mut self, statistics: LockStatistics) -> Self {
        self.statistics = Some(statistics);
        self
    }

    pub fn with_metadata(mut self, metadata: SchemaMetadata) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn session_ids(&self) -> BTreeSet<&SessionId> {
        self.entries.iter().map(|e| &e.session_id).collect()
    }

    pub fn object_ids(&self) -> BTreeSet<&str> {
        self.entries.iter().map(|e| e.object_id.as_str()).collect()
    }

    pub fn waiting_entries(&self) -> impl Iterator<Item = &LockEntry> {
        self.entries.iter().filter(|e| !e.granted)
    }

    /// 待機中エントリの待機時間一覧（ミリ秒）
    pub fn wait_times_ms(&self) -> Vec<f64> {
        self.waiting_entries()
            .map(|e| e.wait_time_ms(self.captured_at))
            .collect()
    }
}

/// 待機チェーンの深刻度
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChainSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// 待機チェーン
///
/// `sessions` は待機側が先頭、最終要素がルートの保持者。`is_cycle` の場合は
/// 最終要素が先頭要素を待っている（デッドロック）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitChain {
    pub sessions: Vec<SessionId>,
    pub length: usize,
    pub total_wait_time_ms: f64,
    pub severity: ChainSeverity,
    pub is_cycle: bool,
    pub truncated: bool,
    pub objects: Vec<String>,
    pub blocking_query: Option<String>,
}

/// 競合パターン
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentionPattern {
    HotSpot,
    Burst,
    Frequent,
    TimeoutProne,
    Normal,
}

/// オブジェクト単位の競合メトリクス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentionMetric {
    pub object_id: String,
    pub contention_count: u64,
    pub total_wait_time_ms: f64,
    pub avg_wait_time_ms: f64,
    pub max_wait_time_ms: f64,
    pub affected_sessions: u64,
    pub timeout_count: u64,
    pub pattern: ContentionPattern,
}

impl ContentionMetric {
    /// タイムアウト比率（ブロックされた試行に占めるタイムアウトの割合）
    pub fn timeout_ratio(&self) -> f64 {
        let attempts = self.contention_count + self.timeout_count;
        if attempts == 0 {
            0.0
        } else {
            self.timeout_count as f64 / attempts as f64
        }
    }
}

/// ヘルス状態
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        if score >= 80.0 {
            HealthStatus::Healthy
        } else if score >= 50.0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Critical
        }
    }
}

/// ヘルススコア（0-100）と5つのサブスコア
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    pub value: f64,
    pub wait_time: f64,
    pub contention: f64,
    pub deadlock: f64,
    pub chain_length: f64,
    pub timeout: f64,
    pub status: HealthStatus,
}

/// 最適化アドバイスの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdviceKind {
    Index,
    QueryRewrite,
    IsolationLevel,
    Configuration,
}

/// 優先度（impact_score の帯から導出）
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdvicePriority {
    Low,
    Medium,
    High,
}

impl AdvicePriority {
    pub fn from_impact(impact_score: f64) -> Self {
        if impact_score >= 70.0 {
            AdvicePriority::High
        } else if impact_score >= 40.0 {
            AdvicePriority::Medium
        } else {
            AdvicePriority::Low
        }
    }
}

/// 最適化アドバイス
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationAdvice {
    pub object_id: String,
    pub kind: AdviceKind,
    pub title: String,
    pub description: String,
    impact_score: f64,
    priority: AdvicePriority,
    pub script: Option<String>,
    pub rollback_script: Option<String>,
    pub strategy: String,
}

impl OptimizationAdvice {
    /// 新しいアドバイスを作成（優先度は impact_score から算出）
    pub fn new(
        strategy: impl Into<String>,
        kind: AdviceKind,
        object_id: impl Into<String>,
        title: impl Into<String>,
        description: impl Into<String>,
        impact_score: f64,
    ) -> Self {
        let impact_score = if impact_score.is_finite() {
            impact_score.clamp(0.0, 100.0)
        } else {
            0.0
        };

        Self {
            object_id: object_id.into(),
            kind,
            title: title.into(),
            description: description.into(),
            impact_score,
            priority: AdvicePriority::from_impact(impact_score),
            script: None,
            rollback_script: None,
            strategy: strategy.into(),
        }
    }

    /// 実行スクリプトとロールバックスクリプトを設定
    pub fn with_scripts(mut self, script: impl Into<String>, rollback: impl Into<String>) -> Self {
        self.script = Some(script.into());
        self.rollback_script = Some(rollback.into());
        self
    }

    pub fn impact_score(&self) -> f64 {
        self.impact_score
    }

    pub fn priority(&self) -> AdvicePriority {
        self.priority
    }
}

/// 分析コンポーネント
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnalysisComponent {
    WaitChain,
    Contention,
    Statistics,
    Advisor,
}

impl fmt::Display for AnalysisComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnalysisComponent::WaitChain => write!(f, "wait_chain"),
            AnalysisComponent::Contention => write!(f, "contention"),
            AnalysisComponent::Statistics => write!(f, "statistics"),
            AnalysisComponent::Advisor => write!(f, "advisor"),
        }
    }
}

/// 縮退（部分結果）の記録
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Degradation {
    pub component: AnalysisComponent,
    pub reason: String,
}

/// 収集ウィンドウ
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CollectionWindow {
    pub lookback_secs: u64,
}

impl CollectionWindow {
    pub fn last_secs(lookback_secs: u64) -> Self {
        Self { lookback_secs }
    }
}

impl Default for CollectionWindow {
    fn default() -> Self {
        Self { lookback_secs: 300 }
    }
}

/// 分析結果（ルート集約）
///
/// 振る舞いを持たない値オブジェクト。全フィールドは同一スナップショットから導出される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub run_id: Uuid,
    pub database_id: String,
    pub window: CollectionWindow,
    pub snapshot_captured_at: DateTime<Utc>,
    pub statistics: Option<LockStatistics>,
    pub chains: Vec<WaitChain>,
    pub has_cycle: bool,
    pub dropped_edges: usize,
    /// チェーン列挙が上限で打ち切られた
    #[serde(default)]
    pub chains_truncated: bool,
    pub contentions: Vec<ContentionMetric>,
    pub health: HealthScore,
    pub advice: Vec<OptimizationAdvice>,
    pub degraded: bool,
    pub degradations: Vec<Degradation>,
    pub analyzed_at: DateTime<Utc>,
}
