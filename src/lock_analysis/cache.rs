//! Analysis Result Cache
//!
//! データベースIDをキーにした TTL 付きキャッシュ。同一キーへの書き込みは後勝ち。

use super::types::{AnalysisResult, CollectionWindow};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry {
    result: Arc<AnalysisResult>,
    window: CollectionWindow,
    stored_at: Instant,
}

/// 分析結果キャッシュ
#[derive(Debug)]
pub struct AnalysisCache {
    ttl: Duration,
    max_entries: usize,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl AnalysisCache {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            ttl,
            max_entries,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// 鮮度内かつウィンドウが一致する結果を取得
    pub async fn get(&self, database_id: &str, window: CollectionWindow) -> Option<Arc<AnalysisResult>> {
        if self.ttl.is_zero() {
            return None;
        }
        let entries = self.entries.read().await;
        let entry = entries.get(database_id)?;
        let age = entry.stored_at.elapsed();
        if age < self.ttl && entry.window == window {
            debug!("Cache hit for '{}' (age {:?})", database_id, age);
            Some(Arc::clone(&entry.result))
        } else {
            debug!("Cache stale for '{}' (age {:?})", database_id, age);
            None
        }
    }

    /// 結果を保存（上限超過時は最も古いエントリを削除）
    pub async fn insert(&self, result: Arc<AnalysisResult>) {
        if self.ttl.is_zero() || self.max_entries == 0 {
            return;
        }
        let mut entries = self.entries.write().await;
        let now = Instant::now();
        entries.retain(|_, e| now.duration_since(e.stored_at) < self.ttl);

        let database_id = result.database_id.clone();
        if !entries.contains_key(&database_id) && entries.len() >= self.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, e)| e.stored_at)
                .map(|(k, _)| k.clone());
            if let Some(key) = oldest {
                debug!("Evicting cached analysis for '{}'", key);
                entries.remove(&key);
            }
        }

        entries.insert(
            database_id,
            CacheEntry {
                window: result.window,
                result,
                stored_at: now,
            },
        );
    }

    pub async fn invalidate(&self, database_id: &str) {
        self.entries.write().await.remove(database_id);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_analysis::types::{HealthScore, HealthStatus};
    use chrono::Utc;
    use uuid::Uuid;

    fn result(database_id: &str, window: CollectionWindow) -> Arc<AnalysisResult> {
        Arc::new(AnalysisResult {
            run_id: Uuid::new_v4(),
            database_id: database_id.to_string(),
            window,
            snapshot_captured_at: Utc::now(),
            statistics: None,
            chains: Vec::new(),
            has_cycle: false,
            dropped_edges: 0,
            chains_truncated: false,
            contentions: Vec::new(),
            health: HealthScore {
                value: 100.0,
                wait_time: 100.0,
                contention: 100.0,
                deadlock: 100.0,
                chain_length: 100.0,
                timeout: 100.0,
                status: HealthStatus::Healthy,
            },
            advice: Vec::new(),
            degraded: false,
            degradations: Vec::new(),
            analyzed_at: Utc::now(),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_expires_after_ttl() {
        let cache = AnalysisCache::new(Duration::from_secs(30), 8);
        let window = CollectionWindow::default();
        cache.insert(result("db", window)).await;

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(cache.get("db", window).await.is_some());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(cache.get("db", window).await.is_none());
    }

    #[tokio::test]
    async fn test_window_mismatch_is_a_miss() {
        let cache = AnalysisCache::new(Duration::from_secs(30), 8);
        cache.insert(result("db", CollectionWindow::last_secs(60))).await;
        assert!(cache.get("db", CollectionWindow::last_secs(60)).await.is_some());
        assert!(cache.get("db", CollectionWindow::last_secs(300)).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_oldest_entry_evicted() {
        let cache = AnalysisCache::new(Duration::from_secs(30), 2);
        let window = CollectionWindow::default();
        cache.insert(result("a", window)).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.insert(result("b", window)).await;
        tokio::time::advance(Duration::from_millis(10)).await;
        cache.insert(result("c", window)).await;

        assert_eq!(cache.len().await, 2);
        assert!(cache.get("a", window).await.is_none());
        assert!(cache.get("c", window).await.is_some());
    }

    #[tokio::test]
    async fn test_last_writer_wins() {
        let cache = AnalysisCache::new(Duration::from_secs(30), 8);
        let window = CollectionWindow::default();
        let first = result("db", window);
        let second = result("db", window);
        cache.insert(first).await;
        cache.insert(Arc::clone(&second)).await;
        let cached = cache.get("db", window).await.unwrap();
        assert_eq!(cached.run_id, second.run_id);
    }
}
