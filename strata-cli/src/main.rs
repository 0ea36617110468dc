//! Demo runner: builds a small service graph with a shared dependency,
//! holds it open, and tears it down cleanly on Ctrl-C.
//!
//! The graph is the classic diamond:
//!
//! ```text
//!        config
//!        /    \
//!     pool    cache
//!        \    /
//!         app
//! ```
//!
//! Watch the logs: `config` is constructed once and released once, after
//! both of its dependents are gone.

use clap::Parser;
use std::time::Duration;
use strata::{Cause, Ctx, Env, Layer, Managed};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "strata", version, about = "Scoped-resource graph demo")]
struct Cli {
    /// Simulated startup cost per service, in milliseconds.
    #[arg(long, default_value_t = 200)]
    startup_ms: u64,

    /// Exit after this many seconds instead of waiting for Ctrl-C.
    #[arg(long)]
    run_for: Option<u64>,

    /// Fail the cache service on startup to demonstrate rollback.
    #[arg(long)]
    fail_cache: bool,
}

#[derive(Debug, Clone)]
struct Config {
    database_url: String,
}

#[derive(Debug)]
struct ConnectionPool {
    url: String,
}

#[derive(Debug)]
struct TileCache;

type DemoError = String;

fn config_layer() -> Layer<DemoError> {
    Layer::from_resource(Managed::acquire_release(
        |_ctx| async {
            info!("loading configuration");
            Ok(Env::new().with(Config {
                database_url: "db://localhost/demo".to_string(),
            }))
        },
        |_env, _outcome| async {
            info!("configuration discarded");
            Ok(())
        },
    ))
}

fn pool_layer(startup: Duration) -> Layer<DemoError> {
    Layer::from_resource(Managed::acquire_release(
        move |ctx| {
            let config = ctx.env().get::<Config>();
            async move {
                let config = config.ok_or_else(|| Cause::fail("config missing".to_string()))?;
                info!(url = %config.database_url, "opening connection pool");
                tokio::time::sleep(startup).await;
                Ok(Env::new().with(ConnectionPool {
                    url: config.database_url.clone(),
                }))
            }
        },
        |env, _outcome| async move {
            if let Some(pool) = env.get::<ConnectionPool>() {
                info!(url = %pool.url, "closing connection pool");
            }
            Ok(())
        },
    ))
}

fn cache_layer(startup: Duration, fail: bool) -> Layer<DemoError> {
    Layer::from_resource(Managed::acquire_release(
        move |_ctx| async move {
            info!("warming tile cache");
            tokio::time::sleep(startup).await;
            if fail {
                return Err(Cause::fail("cache disk unavailable".to_string()));
            }
            Ok(Env::new().with(TileCache))
        },
        |_env, _outcome| async {
            info!("flushing tile cache");
            Ok(())
        },
    ))
}

async fn run(cli: Cli) -> Result<(), Cause<DemoError>> {
    let startup = Duration::from_millis(cli.startup_ms);

    let config = config_layer();
    let pool = config.then(&pool_layer(startup));
    let cache = config.then(&cache_layer(startup, cli.fail_cache));
    let app = pool.merge_par(&cache);

    let ctx = Ctx::new(Env::new());
    let interrupter = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, shutting down");
            interrupter.interrupt();
        }
    });

    let run_for = cli.run_for;
    app.build()
        .use_with(ctx.clone(), move |env| {
            let ctx = ctx.clone();
            async move {
                let pool = env
                    .get::<ConnectionPool>()
                    .ok_or_else(|| Cause::fail("pool missing".to_string()))?;
                info!(url = %pool.url, services = env.len(), "all services up");

                match run_for {
                    Some(seconds) => {
                        tokio::time::sleep(Duration::from_secs(seconds)).await;
                        info!("run window elapsed");
                    }
                    None => {
                        info!("running until Ctrl-C");
                        ctx.token().cancelled().await;
                    }
                }
                Ok(())
            }
        })
        .await
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => info!("shut down cleanly"),
        Err(cause) if cause.is_interrupted_only() => info!("shut down after interrupt"),
        Err(cause) => {
            error!(%cause, "startup failed");
            std::process::exit(1);
        }
    }
}
