use casesync::api::{ApiClient, ApiError, ReqwestTransport};
use casesync::cache::{CacheLayer, SqliteCacheStore};
use casesync::config::Config;
use casesync::db::Database;
use casesync::logging;
use casesync::session::{AuthEvent, Session, SqliteTokenStore};
use casesync::sync::{
  Connectivity, ConnectivityProbe, MutationOutcome, NewOperation, OfflineSync, SqliteQueueStore,
  SyncPass,
};
use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(name = "casesync")]
#[command(about = "Resilient API client and offline sync queue for the case-management backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/casesync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Start in offline mode (mutations are queued, reads served from cache)
  #[arg(long)]
  offline: bool,

  /// Debug-level logging
  #[arg(short, long)]
  verbose: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Sign in and store the session token (password from CASESYNC_PASSWORD)
  Login { username: String },
  /// Clear the stored session token
  Logout,
  /// GET an endpoint, falling back to the cache when offline
  Get {
    endpoint: String,
    /// Cache key (defaults to one derived from the endpoint)
    #[arg(long)]
    key: Option<String>,
    #[arg(long, default_value = "general")]
    category: String,
  },
  /// Create, update or delete a resource; queued if the backend is unreachable
  Mutate {
    /// case, transaction, evidence or note
    resource: String,
    /// create, update or delete
    operation: String,
    /// JSON payload; update and delete need an "id"
    #[arg(default_value = "{}")]
    payload: String,
  },
  /// Upload a file as multipart/form-data
  Upload {
    endpoint: String,
    file: PathBuf,
    /// Extra form fields as name=value
    #[arg(long = "field")]
    fields: Vec<String>,
  },
  /// Replay queued operations now
  Sync,
  /// Show queue status
  Status,
  /// Remove cache entries older than the retention window
  Prune,
  /// Probe connectivity and replay automatically until interrupted
  Watch,
}

struct Context {
  config: Config,
  client: ApiClient,
  sync: Arc<OfflineSync>,
}

impl Context {
  fn new(config: Config, online: bool) -> Result<Self> {
    let db = Arc::new(Database::open(&config.database_path()?)?);

    let session = Session::new(Arc::new(SqliteTokenStore::new(db.clone())));
    let client = ApiClient::new(
      &config.api.base_url,
      Arc::new(ReqwestTransport::default()),
      session,
    )
    .with_retry_policy(config.retry_policy())
    .with_default_timeout(config.timeout());

    let cache = CacheLayer::new(Arc::new(SqliteCacheStore::new(db.clone())))
      .with_retention(config.cache_retention());
    let sync = OfflineSync::new(
      client.clone(),
      Arc::new(SqliteQueueStore::new(db)),
      cache,
      Connectivity::new(online),
    )
    .with_max_attempts(config.sync.max_attempts);

    Ok(Self {
      config,
      client,
      sync: Arc::new(sync),
    })
  }

  fn probe(&self) -> ConnectivityProbe {
    ConnectivityProbe::new(
      self.client.clone(),
      self.sync.connectivity().clone(),
      self.config.sync.health_endpoint.clone(),
    )
    .with_interval(self.config.probe_interval())
  }
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.log_dir()?, args.verbose)?;

  let ctx = Context::new(config, !args.offline)?;
  run(ctx, args.command).await
}

async fn run(ctx: Context, command: Command) -> Result<()> {
  match command {
    Command::Login { username } => {
      let password = Config::get_password()?;
      ctx
        .client
        .login(&username, &password)
        .await
        .map_err(user_error)?;
      println!("Logged in as {username}");
    }
    Command::Logout => {
      ctx.client.logout().map_err(user_error)?;
      println!("Logged out");
    }
    Command::Get {
      endpoint,
      key,
      category,
    } => {
      let value: Value = ctx
        .sync
        .query_endpoint(&endpoint, key.as_deref(), &category)
        .await
        .map_err(user_error)?;
      print_json(&value)?;
    }
    Command::Mutate {
      resource,
      operation,
      payload,
    } => {
      let payload: Value =
        serde_json::from_str(&payload).map_err(|e| eyre!("Payload is not valid JSON: {}", e))?;
      let op = NewOperation::new(resource.parse()?, operation.parse()?, payload);

      match ctx.sync.mutate(op).await? {
        MutationOutcome::Completed(body) => {
          print_json(&json!({"status": "completed", "body": body}))?
        }
        MutationOutcome::Queued(pending) => {
          print_json(&json!({"status": "queued", "id": pending.id}))?;
          eprintln!("Backend unreachable; {} will sync when back online.", pending.describe());
        }
      }
    }
    Command::Upload {
      endpoint,
      file,
      fields,
    } => {
      let bytes = tokio::fs::read(&file)
        .await
        .map_err(|e| eyre!("Failed to read {}: {}", file.display(), e))?;
      let file_name = file
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| eyre!("Not a file: {}", file.display()))?;

      let fields = fields
        .iter()
        .map(|f| {
          f.split_once('=')
            .ok_or_else(|| eyre!("Field must be name=value: {}", f))
        })
        .collect::<Result<Vec<_>>>()?;

      let body: Value = ctx
        .client
        .upload(&endpoint, &file_name, bytes, &fields)
        .await
        .map_err(user_error)?;
      print_json(&body)?;
    }
    Command::Sync => {
      if ctx.sync.connectivity().is_online() {
        ctx.probe().check().await;
      }
      report_pass(ctx.sync.process_sync_queue().await?)?;
    }
    Command::Status => {
      print_json(&ctx.sync.sync_status()?)?;
    }
    Command::Prune => {
      let removed = ctx.sync.prune_cache()?;
      println!("Removed {removed} cache entries");
    }
    Command::Watch => watch(ctx).await?,
  }

  Ok(())
}

async fn watch(ctx: Context) -> Result<()> {
  let (shutdown_tx, _) = broadcast::channel(1);

  let mut auth_events = ctx.client.session().subscribe();
  tokio::spawn(async move {
    while let Ok(event) = auth_events.recv().await {
      if event == AuthEvent::Logout {
        eprintln!("Session expired ({}). Run `casesync login` to continue.", event.name());
      }
    }
  });

  let sync_task = ctx.sync.spawn_auto_sync();
  let probe = ctx.probe();
  let probe_task = tokio::spawn(probe.run(shutdown_tx.subscribe()));

  // Catch up on anything queued while this process was not running.
  tokio::time::sleep(Duration::from_millis(100)).await;
  report_pass(ctx.sync.process_sync_queue().await?)?;

  eprintln!("Watching connectivity; press Ctrl-C to stop.");
  tokio::signal::ctrl_c()
    .await
    .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;

  let _ = shutdown_tx.send(());
  let _ = probe_task.await;
  sync_task.abort();

  print_json(&ctx.sync.sync_status()?)
}

fn report_pass(pass: SyncPass) -> Result<()> {
  match pass {
    SyncPass::Skipped(reason) => {
      println!("Sync skipped: {reason:?}");
      Ok(())
    }
    SyncPass::Completed(report) => {
      if report.halted {
        eprintln!("Session rejected; run `casesync login` and sync again.");
      }
      print_json(&report)
    }
  }
}

fn user_error(e: ApiError) -> color_eyre::Report {
  eyre!("{}", e.user_message())
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}
