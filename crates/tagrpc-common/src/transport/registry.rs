//! Process-wide watchdog over open connections.
//!
//! Connections register themselves when they open. A ticker task wakes every
//! [`CHECK_PERIOD_MS`] and runs [`Connection::timed_check`] on each of them.
//! The ticker starts with the first registration and is cancelled once the
//! last connection unregisters.
//!
//! The ticker runs on a small runtime owned by the registry, so it outlives
//! the runtime of whichever caller opened the connections.

use std::collections::HashMap;
use std::sync::{Arc, LazyLock, Mutex, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Runtime;
use tokio_util::sync::CancellationToken;

use super::connection::{clock_ms, Connection};
use super::frame::CHECK_PERIOD_MS;

#[derive(Default)]
struct Registry {
    connections: HashMap<u64, Weak<Connection>>,
    ticker: Option<CancellationToken>,
}

static REGISTRY: LazyLock<Mutex<Registry>> = LazyLock::new(|| Mutex::new(Registry::default()));

static WATCHDOG_RUNTIME: LazyLock<Option<Runtime>> = LazyLock::new(|| {
    match tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .thread_name("connection-watchdog")
        .enable_time()
        .build()
    {
        Ok(runtime) => Some(runtime),
        Err(e) => {
            tracing::error!(error = %e, "failed to build connection watchdog runtime");
            None
        }
    }
});

fn registry() -> std::sync::MutexGuard<'static, Registry> {
    REGISTRY.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Adds a connection to the watchdog, starting the ticker if needed.
pub fn register(connection: &Arc<Connection>) {
    let mut reg = registry();
    reg.connections
        .insert(connection.id(), Arc::downgrade(connection));
    if reg.ticker.is_some() {
        return;
    }
    let Some(runtime) = WATCHDOG_RUNTIME.as_ref() else {
        return;
    };
    let shutdown = CancellationToken::new();
    runtime.spawn(run_ticker(shutdown.clone()));
    reg.ticker = Some(shutdown);
}

/// Removes a connection from the watchdog. The ticker stops with the last
/// one.
pub fn unregister(id: u64) {
    let mut reg = registry();
    reg.connections.remove(&id);
    if reg.connections.is_empty() {
        if let Some(shutdown) = reg.ticker.take() {
            shutdown.cancel();
        }
    }
}

/// Number of connections currently watched.
pub fn registered() -> usize {
    registry().connections.len()
}

/// Whether a ticker is currently running.
pub fn is_ticking() -> bool {
    registry().ticker.is_some()
}

/// Runs one watchdog pass at `now_ms`. Returns false once nothing is left
/// to watch.
pub fn tick(now_ms: u64) -> bool {
    let live: Vec<Arc<Connection>> = {
        let mut reg = registry();
        reg.connections.retain(|_, weak| weak.strong_count() > 0);
        reg.connections.values().filter_map(Weak::upgrade).collect()
    };
    for connection in &live {
        connection.timed_check(now_ms);
        if connection.is_closed() {
            unregister(connection.id());
        }
    }
    !live.is_empty()
}

async fn run_ticker(shutdown: CancellationToken) {
    tracing::debug!("connection watchdog started");
    let mut interval = tokio::time::interval(Duration::from_millis(CHECK_PERIOD_MS));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                if !tick(clock_ms()) {
                    stop_if_idle(&shutdown);
                }
            }
        }
    }
    tracing::debug!("connection watchdog stopped");
}

/// Cancels this ticker when only dropped connections were left behind.
fn stop_if_idle(shutdown: &CancellationToken) {
    let mut reg = registry();
    // a live token is always the registered one
    if shutdown.is_cancelled() || !reg.connections.is_empty() {
        return;
    }
    reg.ticker = None;
    shutdown.cancel();
}
