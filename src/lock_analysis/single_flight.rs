//! Single-Flight Coordination
//!
//! データベースIDごとに実行中の分析を高々1つに制限する。同じウィンドウの
//! 呼び出し元は実行中の結果を共有し、異なるウィンドウの呼び出し元は
//! 完了を待ってから自分の実行を開始する。

use super::types::CollectionWindow;
use crate::error::EngineError;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::debug;

type SharedRun<T> = Shared<BoxFuture<'static, Result<T, EngineError>>>;

struct InFlight<T: Clone> {
    generation: u64,
    window: CollectionWindow,
    run: SharedRun<T>,
    abort: AbortHandle,
}

struct State<T: Clone> {
    next_generation: u64,
    flights: HashMap<String, InFlight<T>>,
}

/// 実行中タスクの共有レジストリ
pub struct SingleFlight<T: Clone> {
    state: Mutex<State<T>>,
}

impl<T> Default for SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SingleFlight<T>
where
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                next_generation: 0,
                flights: HashMap::new(),
            }),
        }
    }

    /// 実行中の分析に合流するか、新しく開始する
    ///
    /// 開始した分析は独立したタスクとして実行され、呼び出し元が待機を
    /// やめても完了まで進む。
    pub async fn run<F, Fut>(
        self: &Arc<Self>,
        key: &str,
        window: CollectionWindow,
        start: F,
    ) -> Result<T, EngineError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, EngineError>> + Send + 'static,
    {
        let run = loop {
            let mut state = self.state.lock().await;

            if let Some(flight) = state.flights.get(key) {
                let run = flight.run.clone();
                let same_window = flight.window == window;
                drop(state);

                if same_window {
                    debug!("Joining in-flight analysis for '{}'", key);
                    return run.await;
                }
                debug!("Waiting for in-flight analysis of '{}' with a different window", key);
                let _ = run.await;
                continue;
            }

            state.next_generation += 1;
            let generation = state.next_generation;
            let registry = Arc::clone(self);
            let owned_key = key.to_string();
            let work = start();

            let handle = tokio::spawn(async move {
                let result = work.await;
                registry.finish(&owned_key, generation).await;
                result
            });
            let abort = handle.abort_handle();
            let run = async move {
                match handle.await {
                    Ok(result) => result,
                    Err(e) if e.is_cancelled() => {
                        Err(EngineError::Cancelled("analysis task aborted".to_string()))
                    }
                    Err(e) => Err(EngineError::Internal(format!("analysis task failed: {}", e))),
                }
            }
            .boxed()
            .shared();

            state.flights.insert(
                key.to_string(),
                InFlight {
                    generation,
                    window,
                    run: run.clone(),
                    abort,
                },
            );
            break run;
        };

        run.await
    }

    async fn finish(&self, key: &str, generation: u64) {
        let mut state = self.state.lock().await;
        if state
            .flights
            .get(key)
            .is_some_and(|f| f.generation == generation)
        {
            state.flights.remove(key);
        }
    }

    /// 実行中の全タスクを中断
    pub async fn abort_all(&self) {
        let mut state = self.state.lock().await;
        for (key, flight) in state.flights.drain() {
            debug!("Aborting in-flight analysis for '{}'", key);
            flight.abort.abort();
        }
    }

    pub async fn in_flight(&self) -> usize {
        self.state.lock().await.flights.len()
    }
}
