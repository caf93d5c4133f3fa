//! Scenario and function executors.
//!
//! One [`scenario::run_scenario`] task drives each scenario instance: it
//! launches a [`function::run_function`] task for every function attempt
//! whose wait conditions have cleared, applies failure policies and decides
//! when the instance has ended.

pub mod function;
pub mod scenario;

use std::time::Duration;

use tokio::sync::watch;

/// Sleep for `duration`, or less if `signal` flips to `true`.
pub(crate) async fn pause(signal: &mut watch::Receiver<bool>, duration: Duration) {
    let raised = async { signal.wait_for(|raised| *raised).await.is_ok() };
    tokio::select! {
        _ = tokio::time::sleep(duration) => {}
        alive = raised => {
            if !alive {
                tokio::time::sleep(duration).await;
            }
        }
    }
}
