mod cache;
mod config;
mod http;
mod manifest;
#[cfg(test)]
mod testing;
mod worker;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use futures::future::join_all;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use url::Url;

use cache::{CacheResult, CacheSource, CacheStorage, SqliteStorage};
use config::{Config, WorkerConfig};
use http::{Network, ReqwestNetwork, Request, Response};
use worker::{Activation, FetchOutcome, MessageOutcome, ServiceWorker};

type Worker = ServiceWorker<SqliteStorage, ReqwestNetwork>;

#[derive(Parser, Debug)]
#[command(name = "shellcache")]
#[command(about = "Versioned offline cache for web application bundles")]
#[command(version)]
struct Args {
  /// Path to config file (default: ./shellcache.yaml or $XDG_CONFIG_HOME/shellcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Use a throwaway in-memory cache store
  #[arg(long)]
  in_memory: bool,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Install the configured version; activates it unless it has to wait
  Install,
  /// Activate the version left waiting by install
  Activate,
  /// Send GET requests through the worker (paths resolve against the origin)
  Fetch {
    #[arg(required = true)]
    urls: Vec<String>,
  },
  /// Post a control message to the worker (skipWaiting, downloadOffline)
  Message { data: String },
  /// Show cache stores and how the activated manifest differs from the current one
  Status,
}

/// Initialize the tracing subscriber; the guard must live until exit so
/// buffered file output is flushed.
fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
  // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

  let (file_layer, guard) = match log_file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
      let name = path
        .file_name()
        .ok_or_else(|| eyre!("Invalid log file path: {}", path.display()))?;
      std::fs::create_dir_all(dir)
        .map_err(|e| eyre!("Failed to create log directory {}: {}", dir.display(), e))?;

      let (writer, guard) = tracing_appender::non_blocking(tracing_appender::rolling::never(dir, name));
      (
        Some(fmt::layer().with_ansi(false).with_writer(writer)),
        Some(guard),
      )
    }
    None => (None, None),
  };

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(std::io::stderr))
    .with(file_layer)
    .init();

  Ok(guard)
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _guard = init_tracing(config.log_path().as_deref())?;

  let worker_config = Arc::new(config.worker_config()?);
  let network = Arc::new(ReqwestNetwork::new(config.network.timeout())?);
  let storage = if args.in_memory {
    SqliteStorage::open_in_memory()?
  } else {
    SqliteStorage::open(config.database_path().as_deref())?
  };
  let storage = Arc::new(storage);

  info!(origin = %worker_config.origin, resources = worker_config.manifest.len(), "shellcache starting");

  match args.command {
    Command::Install => {
      let worker = ServiceWorker::new(worker_config, storage, network);
      match worker.update().await? {
        Some(activation) => print_activation(&worker, &activation),
        None => println!("Installed; waiting to activate (send skipWaiting or run activate)"),
      }
    }
    Command::Activate => {
      let worker = ServiceWorker::resume(worker_config, storage, network)?;
      print_activation(&worker, &worker.activate()?);
    }
    Command::Fetch { urls } => {
      let worker = ServiceWorker::resume(worker_config, storage, network)?;
      fetch_all(&worker, &urls).await?;
    }
    Command::Message { data } => {
      let worker = ServiceWorker::resume(worker_config, storage, network)?;
      match worker.handle_message(&data).await? {
        MessageOutcome::Ignored => println!("Ignored unknown message '{}'", data),
        MessageOutcome::SkipWaiting(Some(activation)) => print_activation(&worker, &activation),
        MessageOutcome::SkipWaiting(None) => println!("No version waiting; skip-waiting recorded"),
        MessageOutcome::Downloaded(keys) => {
          println!("Downloaded {} resources for offline use", keys.len());
          for key in keys {
            println!("  {}", key);
          }
        }
      }
    }
    Command::Status => {
      let worker = ServiceWorker::resume(worker_config, storage, network)?;
      print_status(&worker)?;
    }
  }

  Ok(())
}

/// Deliver requests concurrently, the way a page issues them. Requests the
/// worker declines go straight to the network.
async fn fetch_all(worker: &Worker, urls: &[String]) -> Result<()> {
  let origin = &worker.config().origin;
  let requests = urls
    .iter()
    .map(|u| {
      Url::parse(u)
        .or_else(|_| origin.join(u))
        .map(Request::get)
        .map_err(|e| eyre!("Invalid URL '{}': {}", u, e))
    })
    .collect::<Result<Vec<_>>>()?;

  let outcomes = join_all(requests.iter().map(|request| serve(worker, request))).await;

  for (request, outcome) in requests.iter().zip(outcomes) {
    match outcome {
      Ok(Served::Worker(result)) => {
        print_response(&request.url, &result.response, &result.source.to_string());
        if let (CacheSource::Offline, Some(at)) = (result.source, result.cached_at) {
          println!("  offline; serving copy cached at {}", at.to_rfc3339());
        }
      }
      Ok(Served::Passthrough(response)) => print_response(&request.url, &response, "passthrough"),
      Err(e) => println!("{}  error: {:#}", request.url, e),
    }
  }

  Ok(())
}

enum Served {
  Worker(CacheResult),
  Passthrough(Response),
}

async fn serve(worker: &Worker, request: &Request) -> Result<Served> {
  match worker.handle_fetch(request).await? {
    FetchOutcome::Respond(result) => Ok(Served::Worker(result)),
    FetchOutcome::Passthrough => Ok(Served::Passthrough(worker.network().fetch(request).await?)),
  }
}

fn print_response(url: &Url, response: &Response, source: &str) {
  println!(
    "{}  {}  {}  {} bytes  {}",
    url,
    response.status,
    source,
    response.body.len(),
    response.header("content-type").unwrap_or("-")
  );
}

fn print_activation(worker: &Worker, activation: &Activation) {
  match activation {
    Activation::FirstInstall { staged } => {
      println!("Activated first install with {} shell resources", staged.len());
    }
    Activation::Upgrade {
      retained,
      evicted,
      staged,
    } => {
      println!(
        "Activated upgrade: {} retained, {} evicted, {} staged",
        retained.len(),
        evicted.len(),
        staged.len()
      );
      for key in evicted {
        println!("  - {}", key);
      }
      for key in staged {
        println!("  + {}", key);
      }
    }
    Activation::Reset { error } => {
      println!("Upgrade failed, all caches cleared: {}", error);
    }
  }
  if worker.clients_claimed() {
    println!("Worker {} and controlling open pages", worker.state());
  }
}

fn print_status(worker: &Worker) -> Result<()> {
  let config: &WorkerConfig = worker.config();
  let storage = worker.storage();

  println!("Worker: {}", worker.state());
  println!("Origin: {}", config.origin);
  println!(
    "Manifest: {} resources, {} in shell",
    config.manifest.len(),
    config.shell.len()
  );

  println!("Caches:");
  let names = storage.cache_names()?;
  if names.is_empty() {
    println!("  (none)");
  }
  for name in names {
    println!("  {}: {} entries", name, storage.keys(&name)?.len());
  }

  match worker.snapshot()? {
    None => println!("No activated manifest; next activation is a first install"),
    Some(previous) => {
      let diff = config.manifest.diff(&previous);
      println!(
        "Since last activation: {} added, {} changed, {} removed, {} unchanged",
        diff.added.len(),
        diff.changed.len(),
        diff.removed.len(),
        diff.unchanged.len()
      );
      for key in &diff.changed {
        println!("  ~ {}", key);
      }
      for key in &diff.removed {
        println!("  - {}", key);
      }
    }
  }

  Ok(())
}
