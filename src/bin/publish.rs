// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! taskq publisher: sends a single task to a preset destination.

use clap::Parser;
use serde_json::Value;
use std::sync::Arc;
use taskq::{
    amqp::LapinConnector,
    channel::ConnectionManager,
    configs::Configs,
    errors::AmqpError,
    message::TaskPayload,
    presets::Preset,
    publisher::{Publisher, TaskPublisher},
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Publishes one task and waits for the broker to confirm it
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Destination to publish to
    #[arg(short, long, value_enum, default_value_t = Preset::Queue, env = "TASKQ_PRESET")]
    preset: Preset,

    /// Task action
    #[arg(short, long)]
    action: String,

    /// Task data as a JSON object
    #[arg(short, long, default_value = "{}")]
    data: String,
}

#[tokio::main]
async fn main() -> Result<(), AmqpError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let data = match serde_json::from_str::<Value>(&args.data) {
        Ok(Value::Object(data)) => data,
        Ok(_) => return Err(AmqpError::ConfigError("--data must be a JSON object".to_owned())),
        Err(err) => return Err(AmqpError::ConfigError(format!("--data: {err}"))),
    };

    let cfg = Configs::from_env()?;
    let connector = Arc::new(LapinConnector::new(cfg.rabbitmq.publisher_confirms));
    let manager = Arc::new(ConnectionManager::new(&cfg, connector));
    let publisher = TaskPublisher::from_configs(manager, &cfg);

    let task = TaskPayload::new(&args.action, data);
    let result = publisher.publish(&args.preset.topology(), &task).await;
    publisher.close().await;

    result?;
    info!(id = %task.id, preset = %args.preset, "task queued");
    Ok(())
}
