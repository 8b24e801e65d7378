//! Wait-Chain Builder
//!
//! スナップショットから waiter→holder の依存グラフを構築し、待機チェーンと
//! デッドロック（循環）を抽出する。
//!
//! グラフはセッションIDをソート順に振ったインデックスで表現し、探索は
//! 明示スタックによる反復DFSで行う。アクティブなパス上のノードに再到達した
//! 時点で循環とみなす。

use super::types::{ChainSeverity, LockEntry, LockSnapshot, SessionId, WaitChain};
use crate::error::AnalysisError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tracing::{debug, warn};

/// 待機チェーン構築設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitChainConfig {
    /// 探索する最大深さ（セッション数）
    pub max_depth: usize,
    /// この合計待機時間以上のチェーンは critical
    pub critical_wait_threshold_ms: f64,
    /// 出力するチェーン数の上限
    pub max_chains: usize,
}

impl Default for WaitChainConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            critical_wait_threshold_ms: 30_000.0,
            max_chains: 1_000,
        }
    }
}

impl WaitChainConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.max_depth < 2 {
            return Err(format!("wait_chain.max_depth must be >= 2, got {}", self.max_depth));
        }
        if !self.critical_wait_threshold_ms.is_finite() || self.critical_wait_threshold_ms <= 0.0 {
            return Err("wait_chain.critical_wait_threshold_ms must be a positive number".to_string());
        }
        if self.max_chains == 0 {
            return Err("wait_chain.max_chains must be >= 1".to_string());
        }
        Ok(())
    }
}

/// 待機チェーン構築結果
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WaitChainReport {
    pub chains: Vec<WaitChain>,
    pub has_cycle: bool,
    /// 未知のセッションを参照していたため破棄したエッジ数
    pub dropped_edges: usize,
    /// 探索予算または `max_chains` により列挙を打ち切った（循環は常に全件）
    pub truncated: bool,
}

impl WaitChainReport {
    pub fn cycle_count(&self) -> usize {
        self.chains.iter().filter(|c| c.is_cycle).count()
    }
}

/// 待機チェーン分析トレイト
pub trait WaitChainAnalysis: Send + Sync {
    fn build(&self, snapshot: &LockSnapshot) -> Result<WaitChainReport, AnalysisError>;
}

/// waiter→holder グラフ
struct WaitGraph {
    sessions: Vec<SessionId>,
    /// waiter index → holder indices（ソート・重複除去済み）
    waits_on: Vec<Vec<usize>>,
    waited_by: Vec<usize>,
    wait_ms: Vec<f64>,
    queries: Vec<Option<String>>,
    edge_objects: BTreeMap<(usize, usize), BTreeSet<String>>,
    dropped_edges: usize,
}

impl WaitGraph {
    fn from_snapshot(snapshot: &LockSnapshot) -> Self {
        let mut dropped_edges = 0;
        let valid: Vec<&LockEntry> = snapshot
            .entries
            .iter()
            .filter(|entry| {
                let ok = !entry.session_id.is_empty() && !entry.object_id.trim().is_empty();
                if !ok {
                    dropped_edges += 1;
                }
                ok
            })
            .collect();

        let sessions: Vec<SessionId> = valid
            .iter()
            .map(|e| e.session_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let index: HashMap<&SessionId, usize> =
            sessions.iter().enumerate().map(|(i, s)| (s, i)).collect();

        let n = sessions.len();
        let mut waits_on: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
        let mut wait_ms = vec![0.0_f64; n];
        let mut queries: Vec<Option<String>> = vec![None; n];
        let mut edge_objects: BTreeMap<(usize, usize), BTreeSet<String>> = BTreeMap::new();

        let mut holders_by_object: BTreeMap<&str, Vec<&LockEntry>> = BTreeMap::new();
        for &entry in valid.iter().filter(|e| e.granted) {
            holders_by_object
                .entry(entry.object_id.as_str())
                .or_default()
                .push(entry);
        }

        for entry in &valid {
            let Some(&waiter) = index.get(&entry.session_id) else {
                continue;
            };
            if queries[waiter].is_none() {
                queries[waiter] = entry.query_text.clone();
            }
            if entry.granted {
                continue;
            }
            wait_ms[waiter] = wait_ms[waiter].max(entry.wait_time_ms(snapshot.captured_at));

            let mut add_edge = |holder: usize| {
                waits_on[waiter].insert(holder);
                edge_objects
                    .entry((waiter, holder))
                    .or_default()
                    .insert(entry.object_id.clone());
            };

            if !entry.blocked_by.is_empty() {
                for blocker in &entry.blocked_by {
                    match index.get(blocker) {
                        Some(&holder) if holder != waiter => add_edge(holder),
                        _ => dropped_edges += 1,
                    }
                }
            } else if let Some(holders) = holders_by_object.get(entry.object_id.as_str()) {
                for held in holders {
                    if held.session_id == entry.session_id || !held.mode.conflicts_with(entry.mode) {
                        continue;
                    }
                    if let Some(&holder) = index.get(&held.session_id) {
                        add_edge(holder);
                    }
                }
            }
        }

        let waits_on: Vec<Vec<usize>> = waits_on.into_iter().map(|s| s.into_iter().collect()).collect();
        let mut waited_by = vec![0usize; n];
        for holders in &waits_on {
            for &h in holders {
                waited_by[h] += 1;
            }
        }

        Self {
            sessions,
            waits_on,
            waited_by,
            wait_ms,
            queries,
            edge_objects,
            dropped_edges,
        }
    }

    fn is_waiting(&self, node: usize) -> bool {
        !self.waits_on[node].is_empty()
    }
}

/// 探索中のチェーン候補
struct RawChain {
    path: Vec<usize>,
    is_cycle: bool,
    truncated: bool,
}

/// 探索状態（1回の build 内でのみ使用）
struct Traversal<'g> {
    graph: &'g WaitGraph,
    max_depth: usize,
    max_chains: usize,
    step_budget: usize,
    on_stack: Vec<bool>,
    seen_cycles: BTreeSet<Vec<usize>>,
    seen_paths: BTreeSet<Vec<usize>>,
    found: Vec<RawChain>,
    exhausted: bool,
    incomplete: bool,
}

impl<'g> Traversal<'g> {
    fn new(graph: &'g WaitGraph, config: &WaitChainConfig) -> Self {
        let n = graph.sessions.len();
        Self {
            graph,
            max_depth: config.max_depth,
            max_chains: config.max_chains,
            step_budget: config.max_chains.saturating_mul(config.max_depth).saturating_mul(8),
            on_stack: vec![false; n],
            seen_cycles: BTreeSet::new(),
            seen_paths: BTreeSet::new(),
            found: Vec::new(),
            exhausted: false,
            incomplete: false,
        }
    }

    /// (チェーン候補, 打ち切りの有無)
    fn run(mut self) -> (Vec<RawChain>, bool) {
        let n = self.graph.sessions.len();

        // 誰からも待たれていない待機セッションを起点にチェーンを列挙
        for start in 0..n {
            if self.graph.is_waiting(start) && self.graph.waited_by[start] == 0 {
                self.explore(start);
            }
        }
        // 深さ制限なしで全ノードの循環を検出（外部から流入のない循環を含む）
        self.detect_cycles();
        (self.found, self.incomplete)
    }

    fn detect_cycles(&mut self) {
        const WHITE: u8 = 0;
        const GRAY: u8 = 1;
        const BLACK: u8 = 2;

        let graph = self.graph;
        let n = graph.sessions.len();
        let mut color = vec![WHITE; n];

        for start in 0..n {
            if color[start] != WHITE || !graph.is_waiting(start) {
                continue;
            }
            let mut path: Vec<usize> = vec![start];
            let mut cursor: Vec<usize> = vec![0];
            color[start] = GRAY;

            while let Some(&node) = path.last() {
                let position = cursor.len() - 1;
                let holders = &graph.waits_on[node];
                if cursor[position] >= holders.len() {
                    color[node] = BLACK;
                    path.pop();
                    cursor.pop();
                    continue;
                }
                let next = holders[cursor[position]];
                cursor[position] += 1;

                match color[next] {
                    GRAY => {
                        if let Some(pos) = path.iter().position(|&p| p == next) {
                            let members = path[pos..].to_vec();
                            self.emit_cycle(&members);
                        }
                    }
                    WHITE => {
                        color[next] = GRAY;
                        path.push(next);
                        cursor.push(0);
                    }
                    _ => {}
                }
            }
        }
    }

    fn full(&self) -> bool {
        self.exhausted || self.found.len() >= self.max_chains
    }

    fn emit_path(&mut self, path: &[usize], truncated: bool) {
        if path.len() < 2 || !self.seen_paths.insert(path.to_vec()) {
            return;
        }
        self.found.push(RawChain {
            path: path.to_vec(),
            is_cycle: false,
            truncated,
        });
    }

    fn emit_cycle(&mut self, members: &[usize]) {
        // 最小インデックスが先頭になるよう回転して正規化
        let Some((min_pos, _)) = members.iter().enumerate().min_by_key(|&(_, &node)| node) else {
            return;
        };
        let mut canonical = members[min_pos..].to_vec();
        canonical.extend_from_slice(&members[..min_pos]);
        if !self.seen_cycles.insert(canonical.clone()) {
            return;
        }
        self.found.push(RawChain {
            path: canonical,
            is_cycle: true,
            truncated: false,
        });
    }

    /// アクティブパス上のノードへ戻るエッジを処理
    fn on_back_edge(&mut self, path: &[usize], target: usize) {
        if let Some(pos) = path.iter().position(|&node| node == target) {
            self.emit_cycle(&path[pos..]);
            if pos > 0 {
                // 循環へ流れ込む支流のチェーン
                self.emit_path(path, false);
            }
        }
    }

    fn explore(&mut self, start: usize) {
        if self.full() {
            self.incomplete = true;
            return;
        }

        let graph = self.graph;
        let mut path: Vec<usize> = vec![start];
        let mut cursor: Vec<usize> = vec![0];
        self.on_stack[start] = true;
        let mut steps = 0usize;

        while let Some(&node) = path.last() {
            steps += 1;
            if steps > self.step_budget {
                warn!("Wait-chain traversal budget exhausted at {} steps", steps);
                self.exhausted = true;
            }
            if self.full() {
                self.incomplete = true;
                break;
            }

            let holders = &graph.waits_on[node];
            let position = cursor.len() - 1;

            if holders.is_empty() {
                // ルートの保持者に到達
                let snapshot_path = path.clone();
                self.emit_path(&snapshot_path, false);
                self.pop(&mut path, &mut cursor);
                continue;
            }

            if cursor[position] == 0 && path.len() >= self.max_depth {
                let snapshot_path = path.clone();
                let mut extends = false;
                for &holder in holders {
                    if self.on_stack[holder] {
                        self.on_back_edge(&snapshot_path, holder);
                    } else {
                        extends = true;
                    }
                }
                if extends {
                    self.emit_path(&snapshot_path, true);
                }
                self.pop(&mut path, &mut cursor);
                continue;
            }

            if cursor[position] >= holders.len() {
                self.pop(&mut path, &mut cursor);
                continue;
            }

            let next = holders[cursor[position]];
            cursor[position] += 1;

            if self.on_stack[next] {
                let snapshot_path = path.clone();
                self.on_back_edge(&snapshot_path, next);
                continue;
            }

            path.push(next);
            cursor.push(0);
            self.on_stack[next] = true;
        }

        for node in path {
            self.on_stack[node] = false;
        }
    }

    fn pop(&mut self, path: &mut Vec<usize>, cursor: &mut Vec<usize>) {
        if let Some(node) = path.pop() {
            self.on_stack[node] = false;
        }
        cursor.pop();
    }
}

/// 待機チェーンビルダー
#[derive(Debug, Clone, Default)]
pub struct WaitChainBuilder {
    config: WaitChainConfig,
}

impl WaitChainBuilder {
    pub fn new(config: WaitChainConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &WaitChainConfig {
        &self.config
    }

    /// 長さと合計待機時間から深刻度を決定
    pub fn severity_for(&self, length: usize, total_wait_time_ms: f64) -> ChainSeverity {
        if length >= 5 || total_wait_time_ms >= self.config.critical_wait_threshold_ms {
            ChainSeverity::Critical
        } else if length >= 3 {
            ChainSeverity::High
        } else if length >= 2 {
            ChainSeverity::Medium
        } else {
            ChainSeverity::Low
        }
    }

    fn materialize(&self, graph: &WaitGraph, raw: RawChain) -> WaitChain {
        let path = &raw.path;
        let sessions: Vec<SessionId> = path.iter().map(|&i| graph.sessions[i].clone()).collect();

        let total_wait_time_ms: f64 = path
            .iter()
            .filter(|&&i| graph.is_waiting(i))
            .map(|&i| graph.wait_ms[i])
            .sum();

        let mut edges: Vec<(usize, usize)> = path.windows(2).map(|w| (w[0], w[1])).collect();
        if raw.is_cycle {
            if let (Some(&last), Some(&first)) = (path.last(), path.first()) {
                edges.push((last, first));
            }
        }
        let objects: Vec<String> = edges
            .iter()
            .filter_map(|edge| graph.edge_objects.get(edge))
            .flatten()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let blocking_query = path
            .iter()
            .rev()
            .find_map(|&i| graph.queries[i].clone());

        let severity = if raw.is_cycle || raw.truncated {
            ChainSeverity::Critical
        } else {
            self.severity_for(path.len(), total_wait_time_ms)
        };

        WaitChain {
            length: sessions.len(),
            sessions,
            total_wait_time_ms,
            severity,
            is_cycle: raw.is_cycle,
            truncated: raw.truncated,
            objects,
            blocking_query,
        }
    }
}

impl WaitChainAnalysis for WaitChainBuilder {
    fn build(&self, snapshot: &LockSnapshot) -> Result<WaitChainReport, AnalysisError> {
        let graph = WaitGraph::from_snapshot(snapshot);
        if graph.dropped_edges > 0 {
            warn!(
                "Dropped {} lock edge(s) with unknown or empty references in snapshot of '{}'",
                graph.dropped_edges, snapshot.database_id
            );
        }

        let (raw_chains, truncated) = Traversal::new(&graph, &self.config).run();
        if truncated {
            warn!(
                "Wait-chain enumeration for '{}' stopped early; chain list is incomplete",
                snapshot.database_id
            );
        }
        let mut chains: Vec<WaitChain> = raw_chains
            .into_iter()
            .map(|raw| self.materialize(&graph, raw))
            .collect();

        // デッドロック中のセッションを含むチェーンは critical
        let deadlocked: BTreeSet<SessionId> = chains
            .iter()
            .filter(|c| c.is_cycle)
            .flat_map(|c| c.sessions.iter().cloned())
            .collect();
        for chain in chains.iter_mut().filter(|c| !c.is_cycle) {
            if chain.sessions.iter().any(|s| deadlocked.contains(s)) {
                chain.severity = ChainSeverity::Critical;
            }
        }

        chains.sort_by(|a, b| {
            b.severity
                .cmp(&a.severity)
                .then(b.total_wait_time_ms.total_cmp(&a.total_wait_time_ms))
                .then_with(|| a.sessions.cmp(&b.sessions))
        });

        let has_cycle = !deadlocked.is_empty();
        debug!(
            "Built {} wait chain(s) for '{}' (cycle: {})",
            chains.len(),
            snapshot.database_id,
            has_cycle
        );

        Ok(WaitChainReport {
            chains,
            has_cycle,
            dropped_edges: graph.dropped_edges,
            truncated,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock_analysis::types::{DatabaseEngineKind, LockMode};
    use chrono::{DateTime, Duration, Utc};

    fn base_time() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn snapshot(entries: Vec<LockEntry>) -> LockSnapshot {
        LockSnapshot::new("test-db", DatabaseEngineKind::PostgreSQL, base_time(), entries)
    }

    fn waiting(session: &str, object: &str, ms: i64) -> LockEntry {
        LockEntry::waiting(
            session,
            object,
            LockMode::Exclusive,
            base_time() - Duration::milliseconds(ms),
        )
    }

    fn held(session: &str, object: &str) -> LockEntry {
        LockEntry::held(session, object, LockMode::Exclusive)
    }

    fn ids(chain: &WaitChain) -> Vec<&str> {
        chain.sessions.iter().map(|s| s.as_str()).collect()
    }

    #[test]
    fn test_no_blocked_locks() {
        let builder = WaitChainBuilder::default();
        let report = builder
            .build(&snapshot(vec![held("1", "a"), held("2", "b")]))
            .unwrap();
        assert!(report.chains.is_empty());
        assert!(!report.has_cycle);
        assert_eq!(report.dropped_edges, 0);
    }

    #[test]
    fn test_simple_chain_waiter_first() {
        let builder = WaitChainBuilder::default();
        let report = builder
            .build(&snapshot(vec![
                held("10", "orders"),
                waiting("20", "orders", 400),
            ]))
            .unwrap();

        assert_eq!(report.chains.len(), 1);
        let chain = &report.chains[0];
        assert_eq!(ids(chain), vec!["20", "10"]);
        assert_eq!(chain.length, 2);
        assert_eq!(chain.severity, ChainSeverity::Medium);
        assert_eq!(chain.total_wait_time_ms, 400.0);
        assert_eq!(chain.objects, vec!["orders".to_string()]);
        assert!(!report.has_cycle);
    }

    #[test]
    fn test_compatible_modes_do_not_block() {
        let builder = WaitChainBuilder::default();
        let report = builder
            .build(&snapshot(vec![
                LockEntry::held("1", "t", LockMode::AccessShare),
                LockEntry::waiting("2", "t", LockMode::RowExclusive, base_time()),
            ]))
            .unwrap();
        assert!(report.chains.is_empty());
    }

    #[test]
    fn test_simple_deadlock() {
        let builder = WaitChainBuilder::default();
        let report = builder
            .build(&snapshot(vec![
                held("S1", "a"),
                held("S2", "b"),
                waiting("S1", "b", 100),
                waiting("S2", "a", 200),
            ]))
            .unwrap();

        assert!(report.has_cycle);
        assert_eq!(report.chains.len(), 1);
        let chain = &report.chains[0];
        assert!(chain.is_cycle);
        assert_eq!(chain.length, 2);
        assert_eq!(chain.severity, ChainSeverity::Critical);
        assert_eq!(chain.objects, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_three_way_cycle_with_explicit_blockers() {
        let builder = WaitChainBuilder::default();
        let report = builder
            .build(&snapshot(vec![
                waiting("A", "x", 10).with_blocked_by(["B"]),
                waiting("B", "y", 10).with_blocked_by(["C"]),
                waiting("C", "z", 10).with_blocked_by(["A"]),
            ]))
            .unwrap();

        assert!(report.has_cycle);
        let cycles: Vec<_> = report.chains.iter().filter(|c| c.is_cycle).collect();
        assert_eq!(cycles.len(), 1);
        assert_eq!(ids(cycles[0]), vec!["A", "B", "C"]);
        assert_eq!(cycles[0].severity, ChainSeverity::Critical);
    }

    #[test]
    fn test_tributary_into_deadlock_is_critical() {
        let builder = WaitChainBuilder::default();
        let report = builder
            .build(&snapshot(vec![
                waiting("1", "a", 10).with_blocked_by(["2"]),
                waiting("2", "b", 10).with_blocked_by(["1"]),
                waiting("3", "a", 10).with_blocked_by(["1"]),
            ]))
            .unwrap();

        assert!(report.has_cycle);
        assert_eq!(report.cycle_count(), 1);
        let tributary = report
            .chains
            .iter()
            .find(|c| !c.is_cycle)
            .expect("tributary chain");
        assert_eq!(ids(tributary), vec!["3", "1", "2"]);
        assert_eq!(tributary.severity, ChainSeverity::Critical);
    }

    #[test]
    fn test_dangling_blockers_are_dropped() {
        let builder = WaitChainBuilder::default();
        let report = builder
            .build(&snapshot(vec![
                held("1", "a"),
                waiting("2", "a", 10).with_blocked_by(["1", "ghost"]),
                LockEntry::held("", "a", LockMode::Share),
            ]))
            .unwrap();

        assert_eq!(report.dropped_edges, 2);
        assert_eq!(report.chains.len(), 1);
        assert_eq!(ids(&report.chains[0]), vec!["2", "1"]);
    }

    #[test]
    fn test_severity_banding() {
        let builder = WaitChainBuilder::default();
        assert_eq!(builder.severity_for(1, 0.0), ChainSeverity::Low);
        assert_eq!(builder.severity_for(2, 0.0), ChainSeverity::Medium);
        assert_eq!(builder.severity_for(3, 0.0), ChainSeverity::High);
        assert_eq!(builder.severity_for(5, 0.0), ChainSeverity::Critical);
        assert_eq!(builder.severity_for(2, 30_000.0), ChainSeverity::Critical);
    }

    #[test]
    fn test_depth_cap_truncates() {
        let builder = WaitChainBuilder::new(WaitChainConfig {
            max_depth: 3,
            ..Default::default()
        });
        // 1 -> 2 -> 3 -> 4 -> 5
        let entries = (1..=4)
            .map(|i| waiting(&i.to_string(), "t", 10).with_blocked_by([(i + 1).to_string()]))
            .chain(std::iter::once(held("5", "other")))
            .collect();
        let report = builder.build(&snapshot(entries)).unwrap();

        assert_eq!(report.chains.len(), 1);
        let chain = &report.chains[0];
        assert!(chain.truncated);
        assert_eq!(chain.length, 3);
        assert_eq!(chain.severity, ChainSeverity::Critical);
        // 深さ制限はチェーン単位の打ち切りで、列挙自体は完了している
        assert!(!report.truncated);
    }

    #[test]
    fn test_max_chains_caps_paths_but_keeps_cycles() {
        let builder = WaitChainBuilder::new(WaitChainConfig {
            max_chains: 2,
            ..Default::default()
        });
        let mut entries = vec![held("1", "t")];
        entries.extend((2..=6).map(|i| waiting(&i.to_string(), "t", 100 * i)));
        entries.push(waiting("7", "x", 10).with_blocked_by(["8"]));
        entries.push(waiting("8", "y", 10).with_blocked_by(["7"]));
        let report = builder.build(&snapshot(entries)).unwrap();

        assert!(report.truncated);
        assert!(report.has_cycle);
        assert_eq!(report.cycle_count(), 1);
        let paths: Vec<_> = report.chains.iter().filter(|c| !c.is_cycle).collect();
        assert_eq!(paths.len(), 2);
        assert!(paths.iter().all(|c| !c.truncated));
    }

    #[test]
    fn test_fan_in_produces_chain_per_waiter() {
        let builder = WaitChainBuilder::default();
        let report = builder
            .build(&snapshot(vec![
                held("1", "t"),
                waiting("2", "t", 800),
                waiting("3", "t", 200),
            ]))
            .unwrap();

        assert_eq!(report.chains.len(), 2);
        // 合計待機時間の降順
        assert_eq!(ids(&report.chains[0]), vec!["2", "1"]);
        assert_eq!(ids(&report.chains[1]), vec!["3", "1"]);
        assert_eq!(report.chains[0].blocking_query, None);
        assert!(!report.truncated);
    }

    #[test]
    fn test_blocking_query_comes_from_holder() {
        let builder = WaitChainBuilder::default();
        let report = builder
            .build(&snapshot(vec![
                held("1", "t").with_query("UPDATE t SET x = 1"),
                waiting("2", "t", 10).with_query("SELECT * FROM t FOR UPDATE"),
            ]))
            .unwrap();
        assert_eq!(
            report.chains[0].blocking_query.as_deref(),
            Some("UPDATE t SET x = 1")
        );
    }

    #[test]
    fn test_deterministic_output() {
        let builder = WaitChainBuilder::default();
        let snap = snapshot(vec![
            held("1", "a"),
            waiting("2", "a", 10),
            waiting("3", "a", 10),
            held("3", "b"),
            waiting("4", "b", 50),
            waiting("5", "c", 5).with_blocked_by(["6"]),
            waiting("6", "d", 5).with_blocked_by(["5"]),
        ]);
        let first = builder.build(&snap).unwrap();
        for _ in 0..5 {
            assert_eq!(builder.build(&snap).unwrap(), first);
        }
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&builder.build(&snap).unwrap()).unwrap()
        );
    }

    #[test]
    fn test_chain_sessions_belong_to_snapshot() {
        let builder = WaitChainBuilder::default();
        let snap = snapshot(vec![
            held("1", "a"),
            waiting("2", "a", 10).with_blocked_by(["1", "99"]),
            waiting("3", "b", 10).with_blocked_by(["2"]),
        ]);
        let report = builder.build(&snap).unwrap();
        let sessions = snap.session_ids();
        for chain in &report.chains {
            assert!(chain.sessions.iter().all(|s| sessions.contains(s)));
        }
    }
}
