//! `ddp`: call methods and dump subscriptions on a DDP server.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ddp_client::{
    ConnectionHooks, ConnectionOptions, DdpClient, MemoryStore, SubscriptionCallbacks,
};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "ddp", version, about = "DDP command-line client")]
struct Cli {
    /// Server address (`http://`, `https://`, `ws://` or `wss://`).
    #[arg(long, env = "DDP_URL", default_value = "ws://localhost:3000")]
    url: String,

    /// Connection options file. Defaults to the platform config directory.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Call a method and print its result.
    Call {
        method: String,
        /// JSON array of arguments.
        #[arg(default_value = "[]")]
        args: String,
    },
    /// Subscribe and print the documents of one collection once ready.
    Subscribe {
        name: String,
        /// Collection to print.
        #[arg(long)]
        collection: String,
        /// JSON array of publication parameters.
        #[arg(long, default_value = "[]")]
        params: String,
        /// Give up if the subscription is not ready within this many seconds.
        #[arg(long, default_value_t = 30)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("ddp_client=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = load_options(cli.config.as_deref())?;
    let client = DdpClient::connect(&cli.url, options, ConnectionHooks::default()).await?;

    let outcome = match cli.command {
        Command::Call { method, args } => {
            let args = parse_array(&args).context("decoding method arguments")?;
            let result = client.call(&method, args).await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Command::Subscribe {
            name,
            collection,
            params,
            timeout,
        } => {
            let params = parse_array(&params).context("decoding publication parameters")?;
            let store = MemoryStore::shared();
            client
                .register_store(&collection, Box::new(store.clone()))
                .await?;
            let mut sub = client
                .subscribe(&name, params, SubscriptionCallbacks::new())
                .await?;
            let ready = tokio::time::timeout(Duration::from_secs(timeout), sub.wait_ready())
                .await
                .with_context(|| format!("subscription {name} not ready after {timeout}s"))?;
            if !ready {
                anyhow::bail!("subscription {name} stopped before it became ready");
            }
            for doc in store.lock().find_all() {
                println!("{}", Value::Object(doc));
            }
            sub.stop().await?;
            Ok(())
        }
    };

    client.close().await?;
    outcome
}

fn load_options(path: Option<&std::path::Path>) -> Result<ConnectionOptions> {
    if let Some(path) = path {
        return Ok(ConnectionOptions::load(path)?);
    }
    match ConnectionOptions::default_path() {
        Some(path) if path.exists() => {
            tracing::debug!(path = %path.display(), "loading config");
            Ok(ConnectionOptions::load(&path)?)
        }
        _ => Ok(ConnectionOptions::default()),
    }
}

fn parse_array(raw: &str) -> Result<Vec<Value>> {
    match serde_json::from_str(raw)? {
        Value::Array(items) => Ok(items),
        other => anyhow::bail!("expected a JSON array, got {other}"),
    }
}
