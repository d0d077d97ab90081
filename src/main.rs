//! Esperanza node
//!
//! Opens (or reindexes) the chain and serves `getcommits` to peers.

use clap::Parser;
use esperanza::net::serve;
use esperanza::sync::build_locator;
use esperanza::{
    Chain, ChainEvent, ChainParams, FinalizationParams, GetCommits, PublicKey, SnapshotParams, SyncClient,
};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "esperanza", version, about = "Esperanza finality node")]
struct Args {
    /// Data directory
    #[arg(short, long, default_value = "./data")]
    data_dir: PathBuf,

    /// Listen port for commits sync
    #[arg(short, long, default_value = "19444")]
    port: u16,

    /// Blocks per epoch
    #[arg(long)]
    epoch_length: Option<u64>,

    /// Short deposit and withdrawal timings
    #[arg(long)]
    regtest: bool,

    /// Rebuild all derived state from stored blocks
    #[arg(long)]
    reindex: bool,

    /// Blocks between UTXO snapshots
    #[arg(long, default_value = "150")]
    snapshot_interval: u64,

    /// Snapshots retained
    #[arg(long, default_value = "5")]
    max_snapshots: usize,

    /// Fetch commits from this peer once at startup
    #[arg(long)]
    sync_from: Option<SocketAddr>,

    /// Hex public key that signs slash transactions and collects their bounty
    #[arg(long, value_parser = parse_key)]
    slash_reporter: Option<PublicKey>,
}

fn parse_key(s: &str) -> Result<PublicKey, hex::FromHexError> {
    hex::decode(s)
}

impl Args {
    fn chain_params(&self) -> ChainParams {
        let mut finalization = if self.regtest {
            FinalizationParams::regtest(self.epoch_length.unwrap_or(5))
        } else {
            FinalizationParams::default()
        };
        if let Some(epoch_length) = self.epoch_length {
            finalization.epoch_length = epoch_length;
        }
        ChainParams {
            finalization,
            snapshot: SnapshotParams {
                interval: self.snapshot_interval,
                max_snapshots: self.max_snapshots,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

async fn sync_once(peer: SocketAddr, chain: Arc<RwLock<Chain>>) {
    let locator = match build_locator(&*chain.read().await) {
        Ok(locator) => locator,
        Err(e) => {
            warn!("Cannot build locator: {}", e);
            return;
        }
    };

    let mut client = match SyncClient::connect(peer).await {
        Ok(client) => client,
        Err(e) => {
            warn!("Connect to {} failed: {}", peer, e);
            return;
        }
    };
    if let Err(e) = client.ping(rand::random()).await {
        warn!("Peer {} did not answer ping: {}", peer, e);
        return;
    }

    match client.get_commits(GetCommits { locator, stop: None }).await {
        Ok(response) => info!(
            "Peer {} sent {} commit records ({:?})",
            peer,
            response.data.len(),
            response.status
        ),
        Err(e) => warn!("getcommits to {} failed: {}", peer, e),
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("esperanza=info")),
        )
        .init();

    let args = Args::parse();
    let params = args.chain_params();

    let opened = if args.reindex {
        Chain::reindex(&args.data_dir, params)
    } else {
        Chain::open(&args.data_dir, params)
    };
    let mut chain = match opened {
        Ok(chain) => chain,
        Err(e) => {
            error!("Failed to open chain in {}: {}", args.data_dir.display(), e);
            return;
        }
    };

    if let Some(reporter) = args.slash_reporter.clone() {
        chain.set_slash_reporter(reporter);
    }

    let status = chain.status();
    info!(
        "Chain at height {}: epoch {}, dynasty {}, justified {}, finalized {}, {} validators",
        chain.tip().height,
        status.current_epoch,
        status.current_dynasty,
        status.last_justified_epoch,
        status.last_finalized_epoch,
        status.active_validators
    );

    let mut events = chain.subscribe();
    let chain = Arc::new(RwLock::new(chain));

    let listener = match TcpListener::bind(("0.0.0.0", args.port)).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind port {}: {}", args.port, e);
            return;
        }
    };

    if let Some(peer) = args.sync_from {
        tokio::spawn(sync_once(peer, Arc::clone(&chain)));
    }

    info!("Press Ctrl+C to stop.");

    tokio::select! {
        result = serve(listener, Arc::clone(&chain)) => {
            if let Err(e) = result {
                error!("Server stopped: {}", e);
            }
        }
        _ = async {
            loop {
                match events.recv().await {
                    Ok(ChainEvent::Finalized { epoch, .. }) => info!("Epoch {} finalized", epoch),
                    Ok(ChainEvent::SlashDetected { validator, txid }) => {
                        warn!("Slash {} queued for {}", hex::encode(txid), hex::encode(validator))
                    }
                    Ok(other) => debug!("{:?}", other),
                    Err(RecvError::Lagged(missed)) => debug!("Event log skipped {} events", missed),
                    Err(RecvError::Closed) => break,
                }
            }
        } => {}
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    if let Err(e) = chain.write().await.wait_for_snapshots() {
        warn!("Snapshot writer: {}", e);
    }
    info!("Shutting down...");
}
