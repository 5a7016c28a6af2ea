//! miniredis server binary

use clap::Parser;
use miniredis::common::MasterAddr;
use miniredis::{Config, Server};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "miniredis")]
#[command(about = "In-memory Redis-compatible server", long_about = None)]
struct Cli {
    /// TCP port to listen on
    #[arg(long, default_value_t = 6379)]
    port: u16,

    /// Directory containing the snapshot file
    #[arg(long)]
    dir: Option<String>,

    /// Snapshot file name inside --dir
    #[arg(long)]
    dbfilename: Option<String>,

    /// Replicate from a master, given as "<host> <port>"
    #[arg(long)]
    replicaof: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let replicaof = cli
        .replicaof
        .as_deref()
        .map(MasterAddr::parse)
        .transpose()?;
    let config = Config {
        port: cli.port,
        replicaof,
        dir: cli.dir,
        dbfilename: cli.dbfilename,
    };

    tracing::info!("miniredis {} starting", miniredis::VERSION);
    let server = Server::new(config);

    tokio::select! {
        result = server.serve() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal, exiting");
        }
    }
    Ok(())
}
