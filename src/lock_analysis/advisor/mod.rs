//! Optimization Advisor Module
//!
//! 分析結果からロック最適化アドバイスを生成する

mod configuration;
mod core;
mod index;
mod isolation;
mod query;
pub mod strategy;

pub use configuration::ConfigurationStrategy;
pub use self::core::{sort_advice, AdviceOutcome, AdvisorConfig, OptimizationAdvisor, StrategyFailure};
pub use index::IndexStrategy;
pub use isolation::IsolationLevelStrategy;
pub use query::{QueryPatternConfig, QueryRewriteStrategy};
pub use strategy::{is_safe_identifier, AdviceError, AdviceStrategy, AdvisorContext};

pub(crate) use self::core::panic_message;
