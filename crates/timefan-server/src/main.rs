//! timefan broker/follower node.

use clap::Parser;
use std::sync::Arc;
use timefan_metrics::Registry;
use timefan_proto::v1::replica_service_server::ReplicaServiceServer;
use timefan_proto::v1::write_service_server::WriteServiceServer;
use timefan_replica::rpc::GrpcReplicaFactory;
use timefan_replica::ChannelManager;
use timefan_server::{
    FollowerManager, ReplicaServiceImpl, ServerConfig, ShutdownHandle, WriteServiceImpl,
};
use tracing::info;

#[derive(Debug, Parser)]
#[command(name = "timefan-broker", about = "timefan write-path node")]
struct Args {
    /// Path to the JSON config file; defaults apply when omitted
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Override the listen address from the config
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => ServerConfig::load(path)?,
        None => ServerConfig::default(),
    };
    if let Some(listen) = args.listen {
        config.listen = listen;
    }

    let registry = Registry::new();
    let factory = Arc::new(GrpcReplicaFactory::new(config.broker.replication.clone()));
    let manager = ChannelManager::new(config.broker.clone(), factory);
    let follower = Arc::new(FollowerManager::new(
        config.replica_dir.clone(),
        config.broker.queue.clone(),
        &registry,
    ));

    // static topology stands in for coordinator pushes
    for (database, shards) in &config.topology.databases {
        for shard in shards {
            manager
                .sync_shard_state(database, shard.clone(), config.topology.nodes.clone())
                .await?;
        }
    }

    let shutdown = ShutdownHandle::new();
    shutdown.listen_for_signals();

    let addr = config.listen.parse()?;
    info!(%addr, "timefan node listening");

    let serve_shutdown = shutdown.clone();
    tonic::transport::Server::builder()
        .add_service(ReplicaServiceServer::new(ReplicaServiceImpl::new(follower)))
        .add_service(WriteServiceServer::new(WriteServiceImpl::new(
            manager.clone(),
            &registry,
        )))
        .serve_with_shutdown(addr, async move { serve_shutdown.wait().await })
        .await?;

    info!("draining write pipeline");
    manager.stop().await;
    info!("shutdown complete");
    Ok(())
}
