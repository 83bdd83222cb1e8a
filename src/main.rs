mod clock;
mod config;
mod db;
mod intercept;
mod logging;
mod net;
mod store;
mod sync;

use chrono::Duration;
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use clock::{Clock, SystemClock};
use config::Config;
use intercept::{CachePartitions, Interceptor, ResponseStore, Router, SqliteResponseStore};
use net::{HttpNetwork, Request};
use store::{open_or_memory, Mutation, MutationKind, OfflineQueue};
use sync::{BackgroundSync, DrainOutcome, LocalSyncPlatform, Replayer, SyncPlatform, SyncTag};

const QUEUE_DB: &str = "queue.db";
const RESPONSES_DB: &str = "responses.db";

#[derive(Parser, Debug)]
#[command(name = "hearthkeep")]
#[command(about = "Offline queue, response cache and background sync for the household app")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/hearthkeep/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Queue a mutation, e.g. '{"kind":"task","title":"Replace HVAC filter"}'
  Enqueue {
    json: String,
    /// Drain the mutation's kind right away
    #[arg(long)]
    now: bool,
  },
  /// List pending mutations
  Pending {
    kind: Option<MutationKind>,
    /// Show dead letters instead
    #[arg(long)]
    dead: bool,
  },
  /// Drop pending mutations without submitting them
  Clear { kind: MutationKind },
  /// Submit pending mutations to the server
  Sync { kind: Option<MutationKind> },
  /// Deliver a background sync wake, e.g. 'sync-tasks'
  Wake { tag: String },
  /// Fetch a path through the interceptor
  Fetch {
    path: String,
    /// Treat as a page navigation
    #[arg(long)]
    navigate: bool,
  },
  /// Read a cached value
  CacheGet { key: String },
  /// Cache a JSON value
  CachePut {
    key: String,
    json: String,
    #[arg(long)]
    ttl_secs: Option<i64>,
  },
  /// Delete expired cache entries
  Sweep,
  /// Pre-cache static assets and delete outdated response partitions
  Activate,
  /// Replay queued mutations whenever the server is reachable
  Watch,
}

/// Services shared by every subcommand.
struct Services {
  config: Config,
  queue: Arc<OfflineQueue>,
  interceptor: Interceptor,
  network: Arc<HttpNetwork>,
  replayer: Arc<Replayer>,
}

impl Services {
  fn build(config: Config, data_dir: &Path) -> Result<Self> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let default_ttl = ttl_from_secs(config.cache.default_ttl_secs)
      .map_err(|e| eyre!("Invalid cache.default_ttl_secs: {}", e))?;
    let queue = open_or_memory("queue", &data_dir.join(QUEUE_DB), |location| {
      OfflineQueue::initialize(location, clock.clone())
    })?
    .with_default_ttl(default_ttl);
    let queue = Arc::new(queue);

    let responses: Arc<dyn ResponseStore> = Arc::new(open_or_memory(
      "response cache",
      &data_dir.join(RESPONSES_DB),
      SqliteResponseStore::open,
    )?);

    let network = Arc::new(
      HttpNetwork::new(&config.server, Config::get_api_token())
        .map_err(|e| eyre!("Invalid server configuration: {}", e))?,
    );

    let interceptor = Interceptor::new(
      network.clone(),
      responses,
      CachePartitions::for_version(&config.cache.version),
      Router::new(&config.intercept, &config.cache),
      clock,
    );

    let replayer = Arc::new(
      Replayer::new(queue.clone(), network.clone()).with_max_attempts(config.sync.max_attempts),
    );

    Ok(Self {
      config,
      queue,
      interceptor,
      network,
      replayer,
    })
  }
}

fn ttl_from_secs(secs: i64) -> Result<Duration> {
  Duration::try_seconds(secs).ok_or_else(|| eyre!("{} seconds is out of range", secs))
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  let config = Config::load(args.config.as_deref())?;
  let data_dir = config.data_dir()?;

  let log_dir = data_dir.join("logs");
  let log_dir = std::fs::create_dir_all(&log_dir).ok().map(|_| log_dir);
  let _log_guard = logging::init_tracing(log_dir.as_deref());
  info!(data_dir = %data_dir.display(), "hearthkeep starting");

  let services = Services::build(config, &data_dir)?;

  match args.command {
    Command::Enqueue { json, now } => enqueue(&services, &json, now).await,
    Command::Pending { kind, dead } => pending(&services, kind, dead),
    Command::Clear { kind } => {
      let removed = services.queue.clear(kind)?;
      println!("Removed {} pending {} mutation(s)", removed, kind);
      Ok(())
    }
    Command::Sync { kind } => sync_now(&services, kind).await,
    Command::Wake { tag } => match services.replayer.handle_wake(&tag).await {
      Some(outcome) => print_outcome(&tag, outcome?),
      None => Err(eyre!("Unknown sync tag: {}", tag)),
    },
    Command::Fetch { path, navigate } => fetch(&services, &path, navigate).await,
    Command::CacheGet { key } => {
      match services.queue.cache_get::<serde_json::Value>(&key)? {
        Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        None => println!("(not cached)"),
      }
      Ok(())
    }
    Command::CachePut { key, json, ttl_secs } => {
      let value: serde_json::Value =
        serde_json::from_str(&json).map_err(|e| eyre!("Invalid JSON value: {}", e))?;
      let ttl = ttl_secs.map(ttl_from_secs).transpose()?;
      services.queue.cache_put(&key, &value, ttl)?;
      Ok(())
    }
    Command::Sweep => {
      let removed = services.queue.cache_sweep()?;
      println!("Removed {} expired cache entries", removed);
      Ok(())
    }
    Command::Activate => {
      let stored = services.interceptor.install().await;
      let deleted = services.interceptor.activate()?;
      println!("Pre-cached {} static asset(s)", stored);
      for name in deleted {
        println!("Deleted partition {}", name);
      }
      Ok(())
    }
    Command::Watch => watch(services).await,
  }
}

async fn enqueue(services: &Services, json: &str, now: bool) -> Result<()> {
  let mutation: Mutation =
    serde_json::from_str(json).map_err(|e| eyre!("Invalid mutation: {}", e))?;
  let queued = services.queue.enqueue(mutation)?;
  println!("Queued {} {}", queued.kind(), queued.id);

  // One-shot processes have no platform to register with; `watch` picks the
  // record up on its next probe.
  BackgroundSync::default().request_sync(SyncTag::for_kind(queued.kind()));

  if now {
    sync_now(services, Some(queued.kind())).await?;
  }
  Ok(())
}

fn pending(services: &Services, kind: Option<MutationKind>, dead: bool) -> Result<()> {
  let kinds = match kind {
    Some(kind) => vec![kind],
    None => MutationKind::ALL.to_vec(),
  };

  for kind in kinds {
    if dead {
      for letter in services.queue.list_dead_letters(kind)? {
        println!(
          "{}\t{}\t{}\t{}",
          kind, letter.mutation.id, letter.dead_lettered_at, letter.reason
        );
      }
    } else {
      for queued in services.queue.list_pending(kind)? {
        println!(
          "{}\t{}\t{}\tattempts={}\t{}",
          kind,
          queued.id,
          queued.enqueued_at,
          queued.attempts,
          serde_json::to_string(&queued.payload)?
        );
      }
    }
  }
  Ok(())
}

async fn sync_now(services: &Services, kind: Option<MutationKind>) -> Result<()> {
  let results = match kind {
    Some(kind) => vec![(kind, services.replayer.drain(kind).await)],
    None => services.replayer.drain_all().await,
  };

  for (kind, result) in results {
    print_outcome(kind, result?)?;
  }
  Ok(())
}

fn print_outcome(label: impl std::fmt::Display, outcome: DrainOutcome) -> Result<()> {
  match outcome {
    DrainOutcome::Completed(report) => println!(
      "{}: submitted {}, retained {}, dead-lettered {}, superseded {}",
      label, report.submitted, report.retained, report.dead_lettered, report.superseded
    ),
    DrainOutcome::AlreadyRunning => println!("{}: already syncing", label),
  }
  Ok(())
}

async fn fetch(services: &Services, path: &str, navigate: bool) -> Result<()> {
  let mut request = Request::get(path);
  if navigate {
    request = request.navigation();
  }

  let interception = services.interceptor.handle(request).await?;
  let response = &interception.response;
  eprintln!(
    "{} {} ({:?})",
    response.status,
    response.header("content-type").unwrap_or("-"),
    interception.source
  );
  match response.body_json() {
    Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
    Err(_) => println!("{}", String::from_utf8_lossy(&response.body)),
  }

  // Let a background refresh land before the process exits
  if let Some(refresh) = interception.revalidation {
    let _ = refresh.await;
  }
  Ok(())
}

async fn watch(services: Services) -> Result<()> {
  let (platform, wakes) = LocalSyncPlatform::new();
  let platform = Arc::new(platform);
  let background = BackgroundSync::new(Some(platform.clone() as Arc<dyn SyncPlatform>));

  let replay = tokio::spawn(services.replayer.clone().run(wakes));

  let interval = std::time::Duration::from_secs(services.config.sync.probe_interval_secs.max(1));
  let probe = tokio::spawn(sync::watch_connectivity(
    services.network.clone(),
    services.config.server.probe_path.clone(),
    platform.clone(),
    interval,
  ));

  // Other processes enqueue into the same database; register their kinds
  let queue = services.queue.clone();
  let registrar = tokio::spawn(async move {
    let mut ticker = tokio::time::interval(interval);
    loop {
      ticker.tick().await;
      for kind in MutationKind::ALL {
        match queue.list_pending(kind) {
          Ok(pending) if !pending.is_empty() => background.request_sync(SyncTag::for_kind(kind)),
          Ok(_) => {}
          Err(e) => warn!(%kind, error = %e, "Failed to read pending mutations"),
        }
      }
    }
  });

  info!("Watching for connectivity");
  platform.wake_all();

  tokio::signal::ctrl_c().await?;
  info!(unsent = ?platform.registered(), "Shutting down");

  probe.abort();
  registrar.abort();
  let _ = probe.await;
  let _ = registrar.await;
  drop(platform);
  // The replayer exits once every sender is gone and running drains finish
  let _ = replay.await;
  Ok(())
}
