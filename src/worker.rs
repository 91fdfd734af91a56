//! Worker loops.
//!
//! Every variant shares the same dispatch iteration and differs only in how
//! it waits when there is nothing to do: the busy worker sleeps a bounded
//! interval, the blocking worker parks on the notification channel, and the
//! threaded worker runs several logical busy workers plus one transitions
//! task in a single process. All cross-worker coordination happens in the
//! database; notifications only cut latency.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::EngineConfig;
use crate::dispatcher::{new_worker_id, promote_due_goals, DispatchResult, Dispatcher};
use crate::guard;
use crate::notify::{GoalsListener, GOALS_CHANNEL};
use crate::registry::HandlerRegistry;
use crate::retention;
use crate::store::{Store, TrackingStore};

const IDLE_SLEEP: StdDuration = StdDuration::from_secs(1);
const NOTIFICATION_WAIT: StdDuration = StdDuration::from_secs(60);
const RETENTION_SWEEP_INTERVAL: StdDuration = StdDuration::from_secs(300);

#[derive(Debug, Clone, Default)]
pub struct WorkerOptions {
    /// Exit after this many attempts, to bound the damage of slow leaks.
    pub max_progress_count: Option<u64>,
    /// Only pick goals with a deadline within this horizon.
    pub deadline_horizon: Option<Duration>,
    /// Exit when a full turn finds nothing to do.
    pub once: bool,
}

/// Cancel the returned token on SIGINT/SIGTERM.
pub fn stop_on_signals() -> anyhow::Result<CancellationToken> {
    let stop = CancellationToken::new();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut interrupt = signal(SignalKind::interrupt())?;
        let mut terminate = signal(SignalKind::terminate())?;
        let token = stop.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = interrupt.recv() => info!("Received SIGINT, stopping"),
                _ = terminate.recv() => info!("Received SIGTERM, stopping"),
            }
            token.cancel();
        });
    }
    #[cfg(not(unix))]
    {
        let token = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received interrupt, stopping");
            }
            token.cancel();
        });
    }
    Ok(stop)
}

/// Busy-wait worker: promote due goals, dispatch until idle, sweep
/// retention, sleep when nothing could be done.
pub async fn run_busy_worker(
    store: Store,
    tracking: TrackingStore,
    registry: Arc<HandlerRegistry>,
    config: Arc<EngineConfig>,
    opts: WorkerOptions,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    guard::run_killer_guard(&tracking, config.max_pickups, Utc::now()).await?;

    let dispatcher = Dispatcher::new(
        store.clone(),
        tracking,
        registry,
        config.clone(),
        new_worker_id("busy"),
        opts.deadline_horizon,
    );

    info!(worker_id = dispatcher.worker_id(), "Busy-wait worker started");
    let mut progressed_total = 0u64;
    let mut last_sweep: Option<Instant> = None;

    while !stop.is_cancelled() {
        if let Some(max) = opts.max_progress_count {
            if progressed_total >= max {
                info!("Max progress count reached, exiting");
                break;
            }
        }

        let remaining = opts.max_progress_count.map(|max| max - progressed_total);
        let did_work = match busy_turn(&store, &dispatcher, &config, remaining, &mut last_sweep)
            .await
        {
            Ok((did_work, progressed)) => {
                progressed_total += progressed;
                did_work
            }
            Err(e) => {
                error!("Worker turn failed: {:#}", e);
                false
            }
        };

        if !did_work {
            if opts.once {
                info!("Nothing to do, exiting because of `once` flag");
                break;
            }
            debug!("Nothing to do, sleeping for a bit");
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
            }
        }
    }

    info!("Busy-wait worker exiting");
    Ok(())
}

async fn busy_turn(
    store: &Store,
    dispatcher: &Dispatcher,
    config: &EngineConfig,
    remaining: Option<u64>,
    last_sweep: &mut Option<Instant>,
) -> anyhow::Result<(bool, u64)> {
    let now = Utc::now();
    let mut did_work = false;

    did_work |= promote_due_goals(store, now).await? > 0;

    let progressed = dispatcher.dispatch_until_idle(remaining).await?;
    did_work |= progressed > 0;

    if sweep_due(last_sweep) {
        did_work |= retention::remove_old_goals(store.pool(), config.retention(), now).await? > 0;
    }

    Ok((did_work, progressed))
}

fn sweep_due(last_sweep: &mut Option<Instant>) -> bool {
    let due = match last_sweep {
        None => true,
        Some(at) => at.elapsed() >= RETENTION_SWEEP_INTERVAL,
    };
    if due {
        *last_sweep = Some(Instant::now());
    }
    due
}

/// Blocking worker: dispatch until idle, then park on the notification
/// channel until a publish or the wait timeout wakes it.
pub async fn run_blocking_worker(
    store: Store,
    tracking: TrackingStore,
    registry: Arc<HandlerRegistry>,
    config: Arc<EngineConfig>,
    opts: WorkerOptions,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    guard::run_killer_guard(&tracking, config.max_pickups, Utc::now()).await?;

    let mut listener = GoalsListener::connect(&config.database_url).await?;
    let dispatcher = Dispatcher::new(
        store.clone(),
        tracking,
        registry,
        config,
        new_worker_id("blocking"),
        opts.deadline_horizon,
    );

    info!(
        worker_id = dispatcher.worker_id(),
        channel = GOALS_CHANNEL,
        "Blocking worker started, listener registered"
    );

    let mut progressed_total = 0u64;

    // Work that was ready before we were listening.
    progressed_total += drain(&store, &dispatcher, opts.max_progress_count).await;

    loop {
        if stop.is_cancelled() {
            break;
        }
        if let Some(max) = opts.max_progress_count {
            if progressed_total >= max {
                info!("Max progress count reached, exiting");
                break;
            }
        }

        tokio::select! {
            _ = stop.cancelled() => break,
            woke = listener.wait_for(NOTIFICATION_WAIT) => {
                if let Err(e) = woke {
                    error!("Notification wait failed: {:#}", e);
                    tokio::time::sleep(IDLE_SLEEP).await;
                }
            }
        }

        // We might pick a different goal than the one that was notified.
        // That is fine: there are at least as many notifications as there
        // are ready goals.
        let remaining = opts.max_progress_count.map(|max| max - progressed_total);
        progressed_total += drain(&store, &dispatcher, remaining).await;
    }

    info!("Blocking worker exiting");
    Ok(())
}

async fn drain(store: &Store, dispatcher: &Dispatcher, remaining: Option<u64>) -> u64 {
    if let Err(e) = promote_due_goals(store, Utc::now()).await {
        error!("Date promotion failed: {:#}", e);
    }
    match dispatcher.dispatch_until_idle(remaining).await {
        Ok(progressed) => progressed,
        Err(e) => {
            error!("Dispatch failed: {:#}", e);
            0
        }
    }
}

/// One `--threads` entry: N logical workers sharing a deadline horizon.
/// Horizon tiers let urgent goals preempt bulk workloads by dedicating
/// workers to short horizons.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSpec {
    pub count: usize,
    pub horizon: Option<Duration>,
}

/// Parse `"3"` or `"2:30m"` into a [`ThreadSpec`].
pub fn parse_thread_spec(spec: &str) -> anyhow::Result<ThreadSpec> {
    let (count_str, horizon) = match spec.split_once(':') {
        Some((count, horizon)) => (count, parse_duration(horizon)?),
        None => (spec, None),
    };
    let count: usize = count_str
        .trim()
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid thread count '{}': {}", count_str, e))?;
    if count == 0 {
        anyhow::bail!("thread count must be a positive integer");
    }
    Ok(ThreadSpec { count, horizon })
}

/// Parse durations like `30m`, `2h`, `1d`. `none` and the empty string mean
/// no horizon.
pub fn parse_duration(input: &str) -> anyhow::Result<Option<Duration>> {
    let input = input.trim();
    if input.is_empty() || input.eq_ignore_ascii_case("none") {
        return Ok(None);
    }

    let re = Regex::new(r"^(\d+)([smhdw])$")?;
    let lowered = input.to_lowercase();
    let caps = re.captures(&lowered).ok_or_else(|| {
        anyhow::anyhow!(
            "invalid duration '{}': use a format like '30m', '2h' or '1d'",
            input
        )
    })?;

    let value: i64 = caps[1].parse()?;
    let seconds = match &caps[2] {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3_600,
        "d" => value * 86_400,
        "w" => value * 604_800,
        _ => unreachable!(),
    };
    Ok(Some(Duration::seconds(seconds)))
}

/// Threaded worker: N logical dispatch workers (optionally tiered by
/// deadline horizon) plus one transitions task handling date promotion and
/// retention.
pub async fn run_threaded_worker(
    store: Store,
    registry: Arc<HandlerRegistry>,
    config: Arc<EngineConfig>,
    specs: Vec<ThreadSpec>,
    once: bool,
    stop: CancellationToken,
) -> anyhow::Result<()> {
    let tracking = TrackingStore::connect(&config.database_url).await?;
    guard::run_killer_guard(&tracking, config.max_pickups, Utc::now()).await?;

    let worker_total: usize = specs.iter().map(|spec| spec.count).sum();
    let state = Arc::new(WorkersState::new(worker_total + 1));

    let mut handles = Vec::new();
    handles.push(tokio::spawn(transitions_loop(
        store.clone(),
        config.clone(),
        once,
        stop.clone(),
        state.clone(),
        worker_total,
    )));

    let mut worker_index = 0;
    for spec in &specs {
        for _ in 0..spec.count {
            handles.push(tokio::spawn(dispatch_loop(
                store.clone(),
                registry.clone(),
                config.clone(),
                spec.horizon,
                once,
                stop.clone(),
                state.clone(),
                worker_index,
            )));
            worker_index += 1;
        }
    }

    for handle in handles {
        let _ = handle.await;
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_loop(
    store: Store,
    registry: Arc<HandlerRegistry>,
    config: Arc<EngineConfig>,
    horizon: Option<Duration>,
    once: bool,
    stop: CancellationToken,
    state: Arc<WorkersState>,
    index: usize,
) {
    let tracking = match TrackingStore::connect(&config.database_url).await {
        Ok(tracking) => tracking,
        Err(e) => {
            error!("Tracking connection failed: {:#}", e);
            return;
        }
    };
    let dispatcher = Dispatcher::new(
        store,
        tracking,
        registry,
        config,
        new_worker_id(&format!("threaded-{}", index)),
        horizon,
    );

    info!(
        worker_id = dispatcher.worker_id(),
        horizon = ?horizon,
        "Dispatch worker started"
    );

    while !stop.is_cancelled() {
        let did_work = match dispatcher.dispatch_one(Utc::now()).await {
            Ok(DispatchResult::Progressed) => true,
            Ok(DispatchResult::Idle) => false,
            Err(e) => {
                error!("Dispatch failed: {:#}", e);
                false
            }
        };
        state.report(index, did_work);

        if once && state.all_idle() {
            info!("All workers are idle, exiting because of `once` flag");
            break;
        }
        if !did_work {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
            }
        }
    }

    info!("Dispatch worker exiting");
}

async fn transitions_loop(
    store: Store,
    config: Arc<EngineConfig>,
    once: bool,
    stop: CancellationToken,
    state: Arc<WorkersState>,
    index: usize,
) {
    info!("Transitions worker started");
    let mut last_sweep: Option<Instant> = None;

    while !stop.is_cancelled() {
        let now = Utc::now();
        let mut did_work = false;

        match promote_due_goals(&store, now).await {
            Ok(promoted) => did_work |= promoted > 0,
            Err(e) => error!("Date promotion failed: {:#}", e),
        }
        if sweep_due(&mut last_sweep) {
            match retention::remove_old_goals(store.pool(), config.retention(), now).await {
                Ok(deleted) => did_work |= deleted > 0,
                Err(e) => error!("Retention sweep failed: {:#}", e),
            }
        }

        state.report(index, did_work);
        if once && state.all_idle() {
            info!("All workers are idle, exiting because of `once` flag");
            break;
        }
        if !did_work {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = tokio::time::sleep(IDLE_SLEEP) => {}
            }
        }
    }

    info!("Transitions worker exiting");
}

/// Tracks which logical workers have run out of work, for `--once`. Any
/// progress resets everyone: the work just done may have unblocked goals
/// other workers already gave up looking for.
struct WorkersState {
    total: usize,
    idle: Mutex<HashSet<usize>>,
}

impl WorkersState {
    fn new(total: usize) -> Self {
        Self {
            total,
            idle: Mutex::new(HashSet::new()),
        }
    }

    fn report(&self, index: usize, did_work: bool) {
        let mut idle = self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if did_work {
            idle.clear();
        } else {
            idle.insert(index);
        }
    }

    fn all_idle(&self) -> bool {
        let idle = self.idle.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        idle.len() == self.total
    }
}
