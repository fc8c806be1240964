// # Keyplane Server
//
// Runs one shard group node: file-backed event storage with redundant
// backup, a writer with its event cache, a reader with its refresh loop,
// and the TCP node server in front of them. Shard membership is decided by
// the cluster's shard configuration; this process serves whatever range is
// routed to its endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use keyplane::common::{process_trip_switch, CancelToken, Fnv1aKeyHasher};
use keyplane::network::NodeServer;
use keyplane::node::LocalShardNode;
use keyplane::sharding::{FileInstanceManager, InstanceManager, ShardNodeClient};
use keyplane::storage::RedundantEventPersister;
use keyplane::{NodeConfig, Result, VERSION};
use tracing::{error, info};

/// Name of this node's storage instance within its data directory.
const PRIMARY_INSTANCE: &str = "primary";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    let config = load_config()?;
    info!("keyplane node starting, version {}", VERSION);
    info!("listening on {}, data in '{}'", config.listen_addr, config.data_dir);

    let trip = process_trip_switch();
    let hasher = Arc::new(Fnv1aKeyHasher);

    let instance_manager = FileInstanceManager::new(PathBuf::from(&config.data_dir))?;
    let primary = instance_manager.create_instance(PRIMARY_INSTANCE)?;
    let storage = Arc::new(RedundantEventPersister::new(
        primary,
        PathBuf::from(&config.data_dir).join("backup.log"),
        trip.clone(),
    )?);

    let node = LocalShardNode::new(&config, storage, hasher, trip)?;
    node.writer().start();
    node.reader().start();

    let cancel = CancelToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown requested");
            shutdown_cancel.cancel();
        }
    });

    let server = NodeServer::new(node.clone() as Arc<dyn ShardNodeClient>, config.errors);
    if let Err(e) = server.run(&config.listen_addr, cancel).await {
        error!("node server failed: {}", e);
    }

    // complete pending flushes before the process exits
    node.reader().stop().await;
    node.writer().stop().await;
    info!("keyplane node stopped");
    Ok(())
}

fn load_config() -> Result<NodeConfig> {
    match std::env::args().nth(1) {
        Some(path) => NodeConfig::load(path),
        None => {
            let default_path = PathBuf::from("keyplane.json");
            if default_path.exists() {
                NodeConfig::load(default_path)
            } else {
                Ok(NodeConfig::default())
            }
        }
    }
}
