//! Command-line surface for embedding applications.
//!
//! Applications register their handlers and hand control over:
//!
//! ```no_run
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut registry = goald::HandlerRegistry::new();
//!     // registry.register("app.my_handler", MyHandler);
//!     goald::cli::run(registry).await
//! }
//! ```

use std::sync::Arc;

use tracing::warn;

use crate::admin;
use crate::config::EngineConfig;
use crate::limits;
use crate::registry::HandlerRegistry;
use crate::store::{Store, TrackingStore};
use crate::worker::{self, WorkerOptions};

const USAGE: &str = "\
Usage: goald <COMMAND> [OPTIONS]

Commands:
  busy-worker       Run a polling worker (also sweeps retention)
      --max-progress-count N    Exit after N attempts
      --deadline-horizon D      Only pick goals due within D (e.g. 30m, 2h, none)
      --memory-limit MIB        Cap the worker's address space
      --once                    Exit when there is nothing to do
  blocking-worker   Run a worker that parks on the notification channel
      --max-progress-count N
      --memory-limit MIB
  threaded-worker   Run N logical workers in one process
      --threads SPEC            N or N:HORIZON, repeatable (default: 1)
      --memory-limit MIB
      --once
  retry             Release all given-up goals for another attempt
      --limit N                 Stop after N goals
  fsck              Re-derive goal states and repair drift
  migrate           Create or update the goal tables
  help              Show this message

Configuration comes from the environment (GOALS_DATABASE_URL,
GOALS_MAX_PROGRESS_COUNT, GOALS_RETENTION_SECONDS, ...). Worker commands
dispatch only handlers registered by the embedding application.";

/// Parse `std::env::args` and run the selected command with the given
/// handler registry.
pub async fn run(registry: HandlerRegistry) -> anyhow::Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    run_with_args(registry, &args).await
}

pub async fn run_with_args(registry: HandlerRegistry, args: &[String]) -> anyhow::Result<()> {
    let command = args.first().map(String::as_str);
    match command {
        Some("busy-worker") => busy_worker(registry, &args[1..]).await,
        Some("blocking-worker") => blocking_worker(registry, &args[1..]).await,
        Some("threaded-worker") => threaded_worker(registry, &args[1..]).await,
        Some("retry") => retry(&args[1..]).await,
        Some("fsck") => fsck().await,
        Some("migrate") => migrate().await,
        Some("help") | Some("--help") | Some("-h") | None => {
            println!("goald {}", env!("CARGO_PKG_VERSION"));
            println!("{}", USAGE);
            Ok(())
        }
        Some("--version") | Some("-V") => {
            println!("goald {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(other) => {
            anyhow::bail!("unknown command '{}'; try 'goald help'", other);
        }
    }
}

struct Flags {
    max_progress_count: Option<u64>,
    deadline_horizon: Option<chrono::Duration>,
    memory_limit_mib: Option<u64>,
    once: bool,
    threads: Vec<String>,
    limit: Option<u64>,
}

fn parse_flags(args: &[String]) -> anyhow::Result<Flags> {
    let mut flags = Flags {
        max_progress_count: None,
        deadline_horizon: None,
        memory_limit_mib: None,
        once: false,
        threads: Vec::new(),
        limit: None,
    };

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--max-progress-count" => {
                flags.max_progress_count = Some(flag_value(args, &mut i)?.parse()?);
            }
            "--deadline-horizon" => {
                flags.deadline_horizon = worker::parse_duration(&flag_value(args, &mut i)?)?;
            }
            "--memory-limit" => {
                flags.memory_limit_mib = Some(flag_value(args, &mut i)?.parse()?);
            }
            "--threads" => {
                let value = flag_value(args, &mut i)?;
                flags.threads.push(value);
            }
            "--limit" => {
                flags.limit = Some(flag_value(args, &mut i)?.parse()?);
            }
            "--once" => {
                flags.once = true;
                i += 1;
            }
            other => anyhow::bail!("unknown option '{}'", other),
        }
    }
    Ok(flags)
}

fn flag_value(args: &[String], i: &mut usize) -> anyhow::Result<String> {
    let flag = &args[*i];
    let value = args
        .get(*i + 1)
        .ok_or_else(|| anyhow::anyhow!("{} requires a value", flag))?;
    *i += 2;
    Ok(value.clone())
}

async fn setup(flags: &Flags) -> anyhow::Result<(Store, Arc<EngineConfig>)> {
    let mut config = EngineConfig::from_env()?;
    if flags.memory_limit_mib.is_some() {
        config.memory_limit_mib = flags.memory_limit_mib;
    }
    limits::apply_memory_limit(config.memory_limit_mib)?;

    let store = Store::connect(&config.database_url).await?;
    Ok((store, Arc::new(config)))
}

fn warn_if_empty(registry: &HandlerRegistry) {
    if registry.is_empty() {
        warn!(
            "No handlers registered; every dispatched goal will be marked corrupted. \
             Embed goald as a library and register handlers before starting workers."
        );
    }
}

async fn busy_worker(registry: HandlerRegistry, args: &[String]) -> anyhow::Result<()> {
    let flags = parse_flags(args)?;
    let (store, config) = setup(&flags).await?;
    let tracking = TrackingStore::connect(&config.database_url).await?;
    warn_if_empty(&registry);
    let stop = worker::stop_on_signals()?;
    worker::run_busy_worker(
        store,
        tracking,
        Arc::new(registry),
        config,
        WorkerOptions {
            max_progress_count: flags.max_progress_count,
            deadline_horizon: flags.deadline_horizon,
            once: flags.once,
        },
        stop,
    )
    .await
}

async fn blocking_worker(registry: HandlerRegistry, args: &[String]) -> anyhow::Result<()> {
    let flags = parse_flags(args)?;
    let (store, config) = setup(&flags).await?;
    let tracking = TrackingStore::connect(&config.database_url).await?;
    warn_if_empty(&registry);
    let stop = worker::stop_on_signals()?;
    worker::run_blocking_worker(
        store,
        tracking,
        Arc::new(registry),
        config,
        WorkerOptions {
            max_progress_count: flags.max_progress_count,
            deadline_horizon: None,
            once: false,
        },
        stop,
    )
    .await
}

async fn threaded_worker(registry: HandlerRegistry, args: &[String]) -> anyhow::Result<()> {
    let flags = parse_flags(args)?;
    let (store, config) = setup(&flags).await?;
    warn_if_empty(&registry);

    let specs = if flags.threads.is_empty() {
        vec![worker::ThreadSpec {
            count: 1,
            horizon: None,
        }]
    } else {
        flags
            .threads
            .iter()
            .map(|spec| worker::parse_thread_spec(spec))
            .collect::<anyhow::Result<Vec<_>>>()?
    };

    let stop = worker::stop_on_signals()?;
    worker::run_threaded_worker(
        store,
        Arc::new(registry),
        config,
        specs,
        flags.once,
        stop,
    )
    .await
}

async fn retry(args: &[String]) -> anyhow::Result<()> {
    let flags = parse_flags(args)?;
    let config = EngineConfig::from_env()?;
    let store = Store::connect(&config.database_url).await?;
    let count = admin::retry_all_given_up(store.pool(), flags.limit).await?;
    println!("Retried {} goals", count);
    Ok(())
}

async fn fsck() -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;
    let store = Store::connect(&config.database_url).await?;
    let fixed = admin::check_fix_all(store.pool()).await?;
    println!("Fixed {} goals", fixed);
    Ok(())
}

async fn migrate() -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;
    Store::connect(&config.database_url).await?;
    println!("Schema is up to date");
    Ok(())
}
