// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! taskq worker: consumes one preset destination until interrupted.

use clap::Parser;
use std::{sync::Arc, time::Duration};
use taskq::{
    amqp::LapinConnector,
    channel::ConnectionManager,
    configs::Configs,
    errors::AmqpError,
    presets::Preset,
    worker::{SimulatedWork, Worker},
};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Consumes tasks with fair dispatch and manual acknowledgment
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Destination to consume from
    #[arg(short, long, value_enum, default_value_t = Preset::Queue, env = "TASKQ_PRESET")]
    preset: Preset,

    /// Simulated processing time, overrides WORKER_PROCESSING_DELAY_MS
    #[arg(long)]
    delay_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let mut cfg = Configs::from_env()?;
    if let Some(delay) = args.delay_ms {
        cfg.worker.processing_delay = Duration::from_millis(delay);
    }

    let connector = Arc::new(LapinConnector::new(cfg.rabbitmq.publisher_confirms));
    let manager = ConnectionManager::new(&cfg, connector);

    let mut worker = Worker::start(&manager, args.preset.topology(), &cfg.worker).await?;
    info!(preset = %args.preset, "worker ready, press ctrl-c to stop");

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!(error = err.to_string(), "failure to listen for ctrl-c");
            }
            shutdown.cancel();
        }
    });

    let processor = SimulatedWork::from(&cfg.worker);
    let result = worker.run(&processor, shutdown).await;

    worker.close().await;
    manager.close().await;

    result
}
