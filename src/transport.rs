// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Transport Seam
//!
//! The connection manager, topology declarator, publisher and worker only talk
//! to the broker through the traits in this module. `crate::amqp` implements
//! them over lapin; `crate::memory` implements them in process.

use crate::{
    errors::AmqpError,
    exchange::ExchangeDefinition,
    message::MessageHeaders,
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

#[cfg(test)]
use mockall::automock;

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a channel handle.
///
/// AMQP channel numbers are reused across connections, so handles are told
/// apart by this id instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelId(u64);

impl ChannelId {
    pub fn next() -> ChannelId {
        ChannelId(NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ch-{}", self.0)
    }
}

/// Callback fired once a connection or channel reports an error or an
/// unexpected close.
pub type ErrorHook = Box<dyn Fn(AmqpError) + Send + Sync + 'static>;

/// Stream of deliveries for one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, AmqpError>>;

/// Opens broker connections.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait AmqpConnector: Send + Sync {
    /// Opens a new connection to `url`, naming it `connection_name`.
    async fn connect(
        &self,
        url: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError>;
}

/// An open broker connection.
#[async_trait]
pub trait AmqpConnection: Send + Sync {
    fn is_open(&self) -> bool;

    /// Registers a hook fired when the connection fails or closes unexpectedly.
    fn on_error(&self, hook: ErrorHook);

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// A message as handed to `basic_publish`.
#[derive(Debug, Clone)]
pub struct OutboundMessage<'m> {
    pub exchange: &'m str,
    pub routing_key: &'m str,
    pub body: &'m [u8],
    pub message_id: &'m str,
    pub kind: &'m str,
    pub headers: MessageHeaders,
    pub persistent: bool,
}

/// A channel multiplexed on a connection.
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    fn id(&self) -> ChannelId;

    fn is_open(&self) -> bool;

    /// Registers a hook fired when the channel fails or closes unexpectedly.
    fn on_error(&self, hook: ErrorHook);

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError>;

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError>;

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError>;

    /// Limits unacknowledged deliveries per consumer on this channel.
    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError>;

    /// Sends a message. Resolves once the broker confirmed it when confirms
    /// are enabled; a broker nack is reported as `PublishNackedError`.
    async fn basic_publish(&self, msg: OutboundMessage<'_>) -> Result<(), AmqpError>;

    /// Starts a manual-ack consumer.
    async fn basic_consume(
        &self,
        queue: &str,
        consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError>;

    async fn close(&self) -> Result<(), AmqpError>;
}

/// Settles one delivery with the broker.
#[async_trait]
pub trait DeliveryAcker: Send + Sync {
    async fn ack(&self) -> Result<(), AmqpError>;

    /// Negative acknowledgment; `requeue = false` discards the message.
    async fn nack(&self, requeue: bool) -> Result<(), AmqpError>;
}

/// A message received by a consumer.
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub headers: MessageHeaders,
    pub data: Vec<u8>,
    pub acker: Arc<dyn DeliveryAcker>,
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("headers", &self.headers)
            .field("len", &self.data.len())
            .finish()
    }
}
