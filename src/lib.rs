//! # dblock-rs
//!
//! Lock analysis engine for relational databases.
//!
//! Reconstructs wait-for chains and deadlocks from a lock snapshot, classifies
//! per-object contention, computes a 0-100 lock health score and produces ranked
//! optimization advice with executable and rollback scripts.

pub mod config;
pub mod error;
pub mod lock_analysis;
pub mod logging;

pub use config::EngineConfig;
pub use error::{AnalysisError, CollectionError, EngineError, Result};
pub use lock_analysis::{AnalysisOptions, AnalysisResult, LockAnalysisEngine, SnapshotCollector};
