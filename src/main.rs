#[cfg(any(target_os = "linux", target_os = "macos"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // The stock binary runs with an empty registry, which covers the
    // administrative commands. Worker deployments embed the library and call
    // `goald::cli::run` with their handlers registered.
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(goald::cli::run(goald::HandlerRegistry::new()))
}
