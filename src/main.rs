use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;

use rostersync::config::{Config, TOKEN_ENV};
use rostersync::{
  logging, AuthInterceptor, MemorySession, MutateOptions, Navigator, QueryClient, ReqwestTransport,
  Session, SubscribeOptions,
};

#[derive(Parser, Debug)]
#[command(name = "rostersync")]
#[command(about = "Cached, deduplicated access to an HR REST API")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/rostersync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// List registered endpoints
  Endpoints,

  /// Run a query once and print the result
  Get {
    endpoint: String,
    /// Arguments as JSON
    #[arg(short, long)]
    args: Option<String>,
  },

  /// Subscribe to a query and print every change until Ctrl-C
  Watch {
    endpoint: String,
    #[arg(short, long)]
    args: Option<String>,
    /// Poll interval in milliseconds
    #[arg(long)]
    poll_ms: Option<u64>,
  },

  /// Run a mutation and print the result and invalidated entries
  Mutate {
    endpoint: String,
    #[arg(short, long)]
    args: Option<String>,
  },
}

/// Prints the sign-in prompt; the CLI has no sign-in view to navigate to.
struct CliNavigator;

impl Navigator for CliNavigator {
  fn redirect_to_sign_in(&self) {
    eprintln!("Session rejected by the server. Sign in again and update {}.", TOKEN_ENV);
  }
}

fn parse_args(raw: Option<&str>) -> Result<Value> {
  match raw {
    Some(raw) => serde_json::from_str(raw).map_err(|e| eyre!("--args is not valid JSON: {}", e)),
    None => Ok(Value::Null),
  }
}

fn print_json(value: &Value) -> Result<()> {
  println!("{}", serde_json::to_string_pretty(value)?);
  Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let registry = config.registry()?;
  if let Command::Endpoints = args.command {
    for endpoint in registry.iter() {
      println!("{:<9} {}", endpoint.kind().to_string(), endpoint.id());
    }
    return Ok(());
  }

  let session = match Config::get_token() {
    Some(token) => Session::authenticated(token),
    None => Session::anonymous(),
  };
  let transport = ReqwestTransport::new(&config.api.base_url, config.request_timeout())?;
  let interceptor = AuthInterceptor::new(
    Arc::new(transport),
    Arc::new(MemorySession::new(session)),
    Arc::new(CliNavigator),
  );
  let client = QueryClient::new(registry, interceptor, config.query_config());

  match args.command {
    Command::Endpoints => {}
    Command::Get { endpoint, args } => {
      let value = client.query(&endpoint, parse_args(args.as_deref())?).await?;
      print_json(&value)?;
    }
    Command::Watch {
      endpoint,
      args,
      poll_ms,
    } => {
      let options = SubscribeOptions {
        poll_interval: poll_ms.map(Duration::from_millis),
      };
      let mut sub = client.subscribe(&endpoint, parse_args(args.as_deref())?, options)?;
      loop {
        tokio::select! {
          _ = tokio::signal::ctrl_c() => break,
          state = sub.changed() => {
            let Some(state) = state else { break };
            match (&state.value, &state.error) {
              _ if state.is_loading() => eprintln!("[{}] loading...", state.key),
              (_, Some(error)) if state.is_error() => eprintln!("[{}] {}", state.key, error),
              (Some(value), _) => print_json(value)?,
              _ => {}
            }
          }
        }
      }
      sub.dispose();
    }
    Command::Mutate { endpoint, args } => {
      let outcome = client
        .mutate(&endpoint, parse_args(args.as_deref())?, MutateOptions::new())
        .await?;
      print_json(&outcome.data)?;
      for key in &outcome.invalidation.refetched {
        eprintln!("refetched {}", key);
      }
      for key in &outcome.invalidation.staled {
        eprintln!("marked stale {}", key);
      }
    }
  }

  Ok(())
}
