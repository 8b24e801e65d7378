//! Snapshot Collector Abstraction
//!
//! ロック情報の収集元に対する統一インターフェース。接続プール等の資源は
//! 実装側に注入され、エンジン自身は保持しない。

use super::types::{CollectionWindow, LockSnapshot};
use crate::error::CollectionError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// スナップショットコレクター抽象化トレイト
///
/// 呼び出し側のタイムアウト予算内で返ること。統計のみ欠落する等の部分取得は
/// `LockSnapshot` の `Option` フィールドで明示する。
#[async_trait]
pub trait SnapshotCollector: Send + Sync {
    /// 指定ウィンドウのスナップショットを収集
    async fn collect(
        &self,
        database_id: &str,
        window: CollectionWindow,
    ) -> Result<LockSnapshot, CollectionError>;
}

/// 記録済みスナップショットを再生するコレクター
///
/// CLIからのオフライン分析や統合テストで使用する
#[derive(Default)]
pub struct ReplayCollector {
    snapshots: RwLock<HashMap<String, LockSnapshot>>,
    collect_count: AtomicU64,
}

impl ReplayCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// スナップショットを登録（同一データベースIDは上書き）
    pub async fn insert(&self, snapshot: LockSnapshot) {
        let mut snapshots = self.snapshots.write().await;
        snapshots.insert(snapshot.database_id.clone(), snapshot);
    }

    /// JSONファイルから読み込み
    pub async fn load_file(&self, path: impl AsRef<Path>) -> Result<String, CollectionError> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            CollectionError::Unavailable(format!("failed to read {}: {}", path.display(), e))
        })?;
        let snapshot: LockSnapshot = serde_json::from_str(&raw).map_err(|e| {
            CollectionError::Malformed(format!("invalid snapshot {}: {}", path.display(), e))
        })?;
        let database_id = snapshot.database_id.clone();
        debug!(
            "Loaded snapshot for '{}' with {} entries from {}",
            database_id,
            snapshot.entries.len(),
            path.display()
        );
        self.insert(snapshot).await;
        Ok(database_id)
    }

    /// collect が呼ばれた回数
    pub fn collect_count(&self) -> u64 {
        self.collect_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SnapshotCollector for ReplayCollector {
    async fn collect(
        &self,
        database_id: &str,
        _window: CollectionWindow,
    ) -> Result<LockSnapshot, CollectionError> {
        self.collect_count.fetch_add(1, Ordering::SeqCst);
        let snapshots = self.snapshots.read().await;
        snapshots
            .get(database_id)
            .cloned()
            .ok_or_else(|| CollectionError::InvalidTarget(database_id.to_string()))
    }
}
