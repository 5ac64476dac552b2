use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use reqwest::header::ACCEPT;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use lantern::cache::{CacheStorage, SqliteStorage};
use lantern::config::Config;
use lantern::http::{Fetcher, HttpFetcher, Request};
use lantern::service::{ControlMessage, Outcome, Reply, ServiceEvent, ServiceWorker};
use lantern::store::PersistentStore;
use lantern::sync::SYNC_CRITICAL;

#[derive(Parser, Debug)]
#[command(name = "lantern")]
#[command(about = "Offline-first response cache and request pipeline")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/lantern/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create the current namespaces and precache the static manifest
  Install,
  /// Delete namespaces left over from previous versions
  Activate,
  /// Route one request through the caching strategies
  Fetch {
    /// Absolute URL, or a path resolved against the configured origin
    url: String,
    /// Accept header to send (e.g. text/html for navigations)
    #[arg(long)]
    accept: Option<String>,
  },
  /// Refresh the critical endpoints into the runtime namespace
  Warm,
  /// Expire old persistent records and purge stale namespaces
  Maintain,
  /// Flush the runtime namespace
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = lantern::logging::init(config.log_dir.as_deref());

  let data_dir = config.data_dir()?;
  let storage: Arc<dyn CacheStorage> = Arc::new(
    SqliteStorage::open(&data_dir.join("cache.db"))
      .map_err(|e| eyre!("Failed to open cache at {}: {}", data_dir.display(), e))?,
  );
  let transport: Arc<dyn Fetcher> = Arc::new(HttpFetcher::new(&config.origin_url()?)?);
  let worker = ServiceWorker::new(&config, storage, transport)?;

  let result = run(&worker, &config, args.command).await;
  worker.shutdown();
  result
}

async fn run(worker: &ServiceWorker, config: &Config, command: Command) -> Result<()> {
  match command {
    Command::Install => {
      if let Outcome::Installed(report) = worker.dispatch(ServiceEvent::Install).await {
        println!("cached {} asset(s)", report.cached.len());
        for (path, reason) in &report.failed {
          println!("  failed {}: {}", path, reason);
        }
      }
    }
    Command::Activate => match worker.dispatch(ServiceEvent::Activate).await {
      Outcome::Activated(report) => {
        println!("deleted {} stale namespace(s)", report.deleted.len());
        for name in &report.deleted {
          println!("  {}", name);
        }
      }
      Outcome::Failed(e) => return Err(eyre!("Activation failed: {}", e)),
      _ => {}
    },
    Command::Fetch { url, accept } => {
      let url = config
        .origin_url()?
        .join(&url)
        .map_err(|e| eyre!("Invalid URL {}: {}", url, e))?;
      let mut request = Request::new(reqwest::Method::GET, url);
      if let Some(accept) = accept {
        request = request.with_header(ACCEPT, &accept);
      }

      match worker.dispatch(ServiceEvent::Fetch(request)).await {
        Outcome::Response(response) => {
          eprintln!("{} ({:?})", response.status, response.kind);
          std::io::stdout().write_all(&response.body)?;
        }
        Outcome::Passthrough => eprintln!("not intercepted"),
        _ => {}
      }
      // let a stale-while-revalidate refresh land before exiting
      worker.wait_idle().await;
    }
    Command::Warm => {
      if let Outcome::Synced(report) = worker.dispatch(ServiceEvent::Sync(SYNC_CRITICAL.to_string())).await {
        println!(
          "purged {}, refreshed {}, failed {}",
          report.purged.len(),
          report.refreshed.len(),
          report.failed.len()
        );
        for (path, reason) in &report.failed {
          println!("  failed {}: {}", path, reason);
        }
      }
    }
    Command::Maintain => {
      let store = PersistentStore::open(&config.data_dir()?.join("store.db"), config.retention())
        .map_err(|e| eyre!("Failed to open store: {}", e))?;
      let expired = store.delete_old_all();
      let purged = worker.lifecycle().purge_stale()?;
      println!("expired {} record(s), purged {} namespace(s)", expired, purged.len());
    }
    Command::Clear => match worker.dispatch(ServiceEvent::Message(ControlMessage::ClearCache)).await {
      Outcome::Reply(Reply::Failed(e)) => return Err(eyre!("Clear failed: {}", e)),
      _ => println!("runtime namespace cleared"),
    },
  }
  Ok(())
}
