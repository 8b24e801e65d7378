//! Lock Analysis Module
//!
//! ロックスナップショットから待機チェーン・競合・ヘルススコア・最適化アドバイスを
//! 導出する分析エンジン

pub mod advisor;
pub mod cache;
pub mod collector;
pub mod contention;
pub mod engine;
pub mod health;
pub mod retry;
pub mod single_flight;
pub mod types;
pub mod wait_chain;

pub use advisor::{AdviceStrategy, AdvisorConfig, AdvisorContext, OptimizationAdvisor};
pub use collector::{ReplayCollector, SnapshotCollector};
pub use contention::{ContentionAnalysis, ContentionAnalyzer, ContentionConfig, ContentionHistory};
pub use engine::{AnalysisOptions, AnalysisStage, LockAnalysisEngine, OrchestratorConfig};
pub use health::{HealthConfig, HealthInput, HealthScorer, HealthWeights};
pub use retry::RetryStrategy;
pub use types::*;
pub use wait_chain::{WaitChainAnalysis, WaitChainBuilder, WaitChainConfig, WaitChainReport};
