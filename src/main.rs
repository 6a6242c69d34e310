use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use follow_tracker::{
    queries, Config, Direction, FollowApi, Store, SyncEngine, SyncOptions, TwitchClient, View,
};

/// Tracks followers / following churn for one account.
#[derive(Parser, Debug)]
#[command(name = "follow-tracker", version)]
#[command(about = "Snapshot follower/following lists and record who left", long_about = None)]
struct Args {
    /// Path to .env file (optional).
    #[arg(long, env = "DOTENV_PATH", default_value = ".env")]
    dotenv: String,

    /// Store file (overrides TRACKER_DB_PATH).
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one pass now and exit
    Sync {
        #[arg(long, value_enum, default_value_t = DirectionArg::Both)]
        direction: DirectionArg,
    },
    /// Run passes for both directions on the update interval until Ctrl-C
    Watch,
    /// Print a listing as JSON
    List {
        #[arg(value_enum)]
        view: ViewArg,
    },
    /// Print one cached profile as JSON
    User { id: String },
    /// Look up the numeric id for a login
    Resolve { login: String },
    /// Show recent passes
    History {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DirectionArg {
    Followers,
    Following,
    Both,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ViewArg {
    Followers,
    Following,
    Unfollowers,
    Unfollowing,
    Refollowers,
    Refollowing,
    FollowerIds,
    FollowingIds,
    NotFollowingBack,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if std::path::Path::new(&args.dotenv).exists() {
        dotenvy::from_path(&args.dotenv)?;
        eprintln!("Loaded environment from {}", args.dotenv);
    }

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let mut config = Config::from_env()?;
    if let Some(db) = args.db {
        config.db_path = db;
    }

    // One handle for the whole process
    let store = Arc::new(Store::open(&config.db_path)?);

    let outcome = run(args.command, &config, store.clone()).await;

    match Arc::try_unwrap(store) {
        Ok(store) => store.close()?,
        Err(_) => tracing::warn!("store still shared at shutdown, leaving close to drop"),
    }

    outcome
}

async fn run(command: Command, config: &Config, store: Arc<Store>) -> Result<()> {
    match command {
        Command::Sync { direction } => {
            let config = config.clone();
            tokio::task::spawn_blocking(move || {
                let tracked = build_engine(&config, store)?;
                sync_once(&tracked, direction)
            })
            .await?
        }
        Command::Watch => {
            let blocking_config = config.clone();
            let tracked =
                tokio::task::spawn_blocking(move || build_engine(&blocking_config, store)).await??;
            watch(Arc::new(tracked), config.update_interval).await
        }
        Command::List { view } => list(&store, view),
        Command::User { id } => match queries::user(&store, &id)? {
            Some(record) => print_json(&record),
            None => Err(anyhow!("no cached profile for {id}")),
        },
        Command::Resolve { login } => {
            let client = TwitchClient::from_config(config)?;
            let fetched = tokio::task::spawn_blocking(move || client.resolve_account_id(&login)).await??;
            println!("{}", fetched.value);
            Ok(())
        }
        Command::History { limit } => {
            let passes = store.read(|txn| txn.passes().recent(limit))?;
            print_json(&passes)
        }
    }
}

struct Tracked {
    engine: SyncEngine<TwitchClient>,
    account_id: String,
}

fn build_engine(config: &Config, store: Arc<Store>) -> Result<Tracked> {
    let client = TwitchClient::from_config(config)?;

    let account_id = match (&config.user_id, &config.username) {
        (Some(id), _) => id.clone(),
        (None, Some(login)) => {
            let fetched = client
                .resolve_account_id(login)
                .with_context(|| format!("Failed to resolve account id for {login}"))?;
            tracing::info!(login = %login, account_id = %fetched.value, "account resolved");
            fetched.value
        }
        (None, None) => return Err(anyhow!("set TRACKER_USER_ID or TRACKER_USERNAME")),
    };

    Ok(Tracked {
        engine: SyncEngine::new(client, store, SyncOptions::from_config(config)),
        account_id,
    })
}

fn sync_once(tracked: &Tracked, direction: DirectionArg) -> Result<()> {
    let results = match direction {
        DirectionArg::Followers => vec![(
            Direction::Followers,
            tracked.engine.run_pass(&tracked.account_id, Direction::Followers),
        )],
        DirectionArg::Following => vec![(
            Direction::Following,
            tracked.engine.run_pass(&tracked.account_id, Direction::Following),
        )],
        DirectionArg::Both => tracked.engine.run_all(&tracked.account_id),
    };

    let mut failed = 0;
    for (direction, result) in results {
        match result {
            Ok(report) => println!(
                "✓ {}: {} current, +{} / -{} ({} rejoined)",
                direction,
                report.current,
                report.added.len(),
                report.removed.len(),
                report.rejoined.len()
            ),
            Err(e) => {
                failed += 1;
                eprintln!("✗ {direction}: {e}");
                if let Some(at) = e.retry_after() {
                    eprintln!("  retry after {}", at.to_rfc3339());
                }
            }
        }
    }

    if failed > 0 {
        return Err(anyhow!("{failed} pass(es) failed"));
    }
    Ok(())
}

async fn watch(tracked: Arc<Tracked>, every: std::time::Duration) -> Result<()> {
    tracing::info!(account_id = %tracked.account_id, interval_secs = every.as_secs(), "watching");

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    let stop = run_until_shutdown(every, shutdown, || {
        let tracked = tracked.clone();
        // Failed passes are logged by the engine and retried next tick
        tokio::task::spawn_blocking(move || {
            for (direction, result) in tracked.engine.run_all(&tracked.account_id) {
                if let Ok(report) = result {
                    if !report.is_noop() {
                        tracing::info!(
                            %direction,
                            added = report.added.len(),
                            removed = report.removed.len(),
                            "follow changes recorded"
                        );
                    }
                }
            }
        })
    })
    .await;

    match stop {
        Stop::Idle => tracing::info!("shutting down"),
        Stop::InFlight => tracing::info!("shutting down, in-flight pass left to finish its commit"),
    }
    Ok(())
}

#[derive(Debug, PartialEq, Eq)]
enum Stop {
    Idle,
    InFlight,
}

/// Start `pass` on every tick until `shutdown` resolves.
/// One shutdown future lives for the whole loop, so a signal that lands
/// while a pass is running still stops it.
async fn run_until_shutdown<F>(
    every: std::time::Duration,
    shutdown: impl std::future::Future<Output = ()>,
    mut pass: F,
) -> Stop
where
    F: FnMut() -> tokio::task::JoinHandle<()>,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => return Stop::Idle,
            _ = ticker.tick() => {
                let handle = pass();
                tokio::select! {
                    joined = handle => {
                        if let Err(e) = joined {
                            tracing::error!(error = %e, "sync worker failed");
                        }
                    }
                    _ = &mut shutdown => return Stop::InFlight,
                }
            }
        }
    }
}

fn list(store: &Store, view: ViewArg) -> Result<()> {
    let view = match view {
        ViewArg::FollowerIds => return print_json(&queries::edge_ids(store, Direction::Followers)?),
        ViewArg::FollowingIds => return print_json(&queries::edge_ids(store, Direction::Following)?),
        ViewArg::Followers => View::Followers,
        ViewArg::Following => View::Following,
        ViewArg::Unfollowers => View::Unfollowers,
        ViewArg::Unfollowing => View::Unfollowing,
        ViewArg::Refollowers => View::Refollowers,
        ViewArg::Refollowing => View::Refollowing,
        ViewArg::NotFollowingBack => View::NotFollowingBack,
    };

    print_json(&view.load(store)?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_shutdown_during_pass_is_not_lost() {
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let mut tx = Some(tx);
        let finished = Arc::new(AtomicBool::new(false));
        let passes = Arc::new(AtomicU32::new(0));

        let shutdown = async {
            let _ = rx.await;
        };

        let stop = run_until_shutdown(Duration::from_millis(10), shutdown, || {
            let signal = tx.take();
            let finished = finished.clone();
            passes.fetch_add(1, Ordering::SeqCst);
            tokio::task::spawn_blocking(move || {
                // Signal arrives while the pass is still running
                if let Some(signal) = signal {
                    let _ = signal.send(());
                }
                std::thread::sleep(Duration::from_millis(300));
                finished.store(true, Ordering::SeqCst);
            })
        })
        .await;

        assert_eq!(stop, Stop::InFlight);
        assert_eq!(passes.load(Ordering::SeqCst), 1);
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_shutdown_between_passes() {
        let passes = Arc::new(AtomicU32::new(0));
        let counted = passes.clone();

        let stop = run_until_shutdown(
            Duration::from_millis(10),
            tokio::time::sleep(Duration::from_millis(100)),
            move || {
                counted.fetch_add(1, Ordering::SeqCst);
                tokio::task::spawn_blocking(|| {})
            },
        )
        .await;

        assert_eq!(stop, Stop::Idle);
        assert!(passes.load(Ordering::SeqCst) >= 2);
    }
}
