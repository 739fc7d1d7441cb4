// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! This module owns the broker connection and the cached channel shared by
//! every publish call of a process. Both are created lazily on first use and
//! dropped as soon as the transport reports an error or an unexpected close,
//! so the next acquisition rebuilds them.
//!
//! Only one connection attempt runs at a time: concurrent callers park on an
//! async gate and pick up the channel the winner created.

use crate::{
    configs::Configs,
    errors::AmqpError,
    transport::{AmqpChannel, AmqpConnection, AmqpConnector, ChannelId},
};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tracing::{debug, error, warn};

/// Lifecycle of the shared connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connecting,
    Connected,
    Closed,
}

struct Slots {
    state: ConnectionState,
    connection: Option<(u64, Arc<dyn AmqpConnection>)>,
    channel: Option<Arc<dyn AmqpChannel>>,
    generation: u64,
}

impl Slots {
    fn invalidate_connection(&mut self, generation: u64) -> bool {
        match &self.connection {
            Some((current, _)) if *current == generation => {
                self.connection = None;
                self.channel = None;
                self.state = ConnectionState::Uninitialized;
                true
            }
            _ => false,
        }
    }

    fn invalidate_channel(&mut self, id: ChannelId) -> bool {
        match &self.channel {
            Some(current) if current.id() == id => {
                self.channel = None;
                true
            }
            _ => false,
        }
    }
}

/// Shared connection and channel of a process.
///
/// Construct one per service and hand it to publishers and workers as an
/// `Arc<ConnectionManager>`.
pub struct ConnectionManager {
    url: String,
    connection_name: String,
    connector: Arc<dyn AmqpConnector>,
    slots: Arc<Mutex<Slots>>,
    gate: tokio::sync::Mutex<()>,
}

impl ConnectionManager {
    /// Creates a manager; no connection is opened until the first acquisition.
    ///
    /// # Parameters
    /// * `cfg` - Configuration containing the broker url and the connection name
    /// * `connector` - Transport used to open connections
    pub fn new(cfg: &Configs, connector: Arc<dyn AmqpConnector>) -> ConnectionManager {
        ConnectionManager {
            url: cfg.rabbitmq.url.clone(),
            connection_name: cfg.app.name.clone(),
            connector,
            slots: Arc::new(Mutex::new(Slots {
                state: ConnectionState::Uninitialized,
                connection: None,
                channel: None,
                generation: 0,
            })),
            gate: tokio::sync::Mutex::new(()),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.slots().state
    }

    /// Returns a healthy channel, connecting first when needed.
    ///
    /// The same channel is returned to every caller until it is invalidated.
    pub async fn acquire_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        if let Some(channel) = self.cached_channel() {
            return Ok(channel);
        }

        let _gate = self.gate.lock().await;
        if let Some(channel) = self.cached_channel() {
            return Ok(channel);
        }

        let connection = self.acquire_connection().await?;
        let channel = connection.create_channel().await.map_err(|err| {
            error!(error = err.to_string(), "error to create the channel");
            err
        })?;

        let id = channel.id();
        let slots = Arc::downgrade(&self.slots);
        channel.on_error(Box::new(move |err| {
            if invalidate(&slots, |s| s.invalidate_channel(id)) {
                warn!(error = err.to_string(), channel = id.to_string(), "channel invalidated");
            }
        }));

        self.slots().channel = Some(channel.clone());
        debug!(channel = id.to_string(), "channel cached");

        Ok(channel)
    }

    /// Creates a channel on the shared connection that is not cached.
    ///
    /// Consumers use their own channel so prefetch settings and consumer
    /// lifetime are not shared with publishers.
    pub async fn open_dedicated_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let connection = {
            let _gate = self.gate.lock().await;
            self.acquire_connection().await?
        };

        connection.create_channel().await
    }

    /// Drops `stale` from the cache if it is still the cached channel and closes it.
    pub async fn recycle(&self, stale: &Arc<dyn AmqpChannel>) {
        let id = stale.id();
        if self.slots().invalidate_channel(id) {
            debug!(channel = id.to_string(), "channel recycled");
        }

        if stale.is_open() {
            if let Err(err) = stale.close().await {
                debug!(error = err.to_string(), "ignoring channel close failure");
            }
        }
    }

    /// Closes the cached channel and the connection.
    ///
    /// Failures are logged; a later acquisition reconnects.
    pub async fn close(&self) {
        let _gate = self.gate.lock().await;
        let (connection, channel) = {
            let mut slots = self.slots();
            slots.state = ConnectionState::Closed;
            (slots.connection.take(), slots.channel.take())
        };

        if let Some(channel) = channel {
            if let Err(err) = channel.close().await {
                error!(error = err.to_string(), "error closing channel");
            }
        }

        if let Some((_, connection)) = connection {
            if let Err(err) = connection.close().await {
                error!(error = err.to_string(), "error closing connection");
            }
        }

        debug!("amqp connection closed");
    }

    fn slots(&self) -> MutexGuard<'_, Slots> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn cached_channel(&self) -> Option<Arc<dyn AmqpChannel>> {
        let mut slots = self.slots();
        match &slots.channel {
            Some(channel) if channel.is_open() => Some(channel.clone()),
            Some(_) => {
                slots.channel = None;
                None
            }
            None => None,
        }
    }

    /// Must be called with the gate held.
    async fn acquire_connection(&self) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let generation = {
            let mut slots = self.slots();
            match &slots.connection {
                Some((_, connection)) if connection.is_open() => return Ok(connection.clone()),
                _ => {
                    slots.connection = None;
                    slots.channel = None;
                    slots.state = ConnectionState::Connecting;
                    slots.generation += 1;
                    slots.generation
                }
            }
        };

        let mut pending = PendingConnect {
            slots: &self.slots,
            generation,
            armed: true,
        };
        let connection = match self.connector.connect(&self.url, &self.connection_name).await {
            Ok(connection) => connection,
            Err(err) => {
                error!(error = err.to_string(), "failure to connect");
                return Err(err);
            }
        };

        let slots = Arc::downgrade(&self.slots);
        connection.on_error(Box::new(move |err| {
            if invalidate(&slots, |s| s.invalidate_connection(generation)) {
                warn!(error = err.to_string(), "connection invalidated");
            }
        }));

        let mut slots = self.slots();
        slots.connection = Some((generation, connection.clone()));
        slots.state = ConnectionState::Connected;
        pending.armed = false;
        debug!(generation, "amqp connected");

        Ok(connection)
    }
}

/// Puts the manager back to `Uninitialized` when a connect attempt fails or
/// its future is dropped before the connection is stored.
struct PendingConnect<'a> {
    slots: &'a Mutex<Slots>,
    generation: u64,
    armed: bool,
}

impl Drop for PendingConnect<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if slots.generation == self.generation && slots.state == ConnectionState::Connecting {
            slots.state = ConnectionState::Uninitialized;
        }
    }
}

fn invalidate<F>(slots: &Weak<Mutex<Slots>>, f: F) -> bool
where
    F: FnOnce(&mut Slots) -> bool,
{
    match slots.upgrade() {
        Some(slots) => {
            let mut guard = slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut guard)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::InMemoryBroker, transport::MockAmqpConnector};
    use async_trait::async_trait;
    use std::time::Duration;

    struct StalledConnector;

    #[async_trait]
    impl AmqpConnector for StalledConnector {
        async fn connect(
            &self,
            _url: &str,
            _connection_name: &str,
        ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
            std::future::pending().await
        }
    }

    fn manager(broker: &InMemoryBroker) -> ConnectionManager {
        ConnectionManager::new(&Configs::default(), Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn reuses_the_cached_channel() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        assert_eq!(manager.state(), ConnectionState::Uninitialized);

        let first = manager.acquire_channel().await.unwrap();
        let second = manager.acquire_channel().await.unwrap();

        assert_eq!(first.id(), second.id());
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn concurrent_acquisitions_share_one_connection_attempt() {
        let broker = InMemoryBroker::new();
        let manager = Arc::new(manager(&broker));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move { manager.acquire_channel().await.unwrap().id() })
            })
            .collect();

        let mut ids = vec![];
        for handle in handles {
            ids.push(handle.await.unwrap());
        }

        ids.dedup();
        assert_eq!(ids.len(), 1);
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn channel_error_forces_a_new_channel() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        let before = manager.acquire_channel().await.unwrap();

        broker.break_channels();

        let after = manager.acquire_channel().await.unwrap();
        assert_ne!(before.id(), after.id());
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn stalled_publish_channel_is_not_reused_after_a_fault() {
        let broker = InMemoryBroker::new();
        let manager = Arc::new(manager(&broker));
        let stale = manager.acquire_channel().await.unwrap();
        stale
            .queue_declare(&crate::queue::QueueDefinition::new("jobs"))
            .await
            .unwrap();

        broker.hold_publishes();
        let stalled = tokio::spawn({
            let stale = stale.clone();
            async move {
                stale
                    .basic_publish(crate::transport::OutboundMessage {
                        exchange: "",
                        routing_key: "jobs",
                        body: b"{}",
                        message_id: "1",
                        kind: "noop",
                        headers: Default::default(),
                        persistent: true,
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        broker.break_channels();
        broker.release_publishes();

        assert!(matches!(stalled.await.unwrap(), Err(AmqpError::ChannelError(_))));
        let fresh = manager.acquire_channel().await.unwrap();
        assert_ne!(fresh.id(), stale.id());
    }

    #[tokio::test]
    async fn connection_loss_resets_both_references() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        let before = manager.acquire_channel().await.unwrap();

        broker.drop_connections();
        assert_eq!(manager.state(), ConnectionState::Uninitialized);

        let after = manager.acquire_channel().await.unwrap();
        assert_ne!(before.id(), after.id());
        assert_eq!(broker.connect_attempts(), 2);
    }

    #[tokio::test]
    async fn failed_connect_propagates_and_leaves_no_state() {
        let mut connector = MockAmqpConnector::new();
        connector
            .expect_connect()
            .times(2)
            .returning(|_, _| Err(AmqpError::ConnectionError("connection refused".to_owned())));

        let manager = ConnectionManager::new(&Configs::default(), Arc::new(connector));

        for _ in 0..2 {
            let err = manager.acquire_channel().await.err();
            assert_eq!(
                err,
                Some(AmqpError::ConnectionError("connection refused".to_owned()))
            );
            assert_eq!(manager.state(), ConnectionState::Uninitialized);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn abandoned_connect_leaves_no_state() {
        let manager = ConnectionManager::new(&Configs::default(), Arc::new(StalledConnector));

        let acquired =
            tokio::time::timeout(Duration::from_millis(100), manager.acquire_channel()).await;

        assert!(acquired.is_err());
        assert_eq!(manager.state(), ConnectionState::Uninitialized);
    }

    #[tokio::test]
    async fn recycle_only_drops_the_matching_channel() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        let first = manager.acquire_channel().await.unwrap();
        manager.recycle(&first).await;

        let second = manager.acquire_channel().await.unwrap();
        assert_ne!(first.id(), second.id());

        manager.recycle(&first).await;
        let third = manager.acquire_channel().await.unwrap();
        assert_eq!(second.id(), third.id());
    }

    #[tokio::test]
    async fn dedicated_channels_are_not_cached() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);

        let shared = manager.acquire_channel().await.unwrap();
        let dedicated = manager.open_dedicated_channel().await.unwrap();

        assert_ne!(shared.id(), dedicated.id());
        assert_eq!(manager.acquire_channel().await.unwrap().id(), shared.id());
        assert_eq!(broker.connect_attempts(), 1);
    }

    #[tokio::test]
    async fn close_tears_down_and_allows_reconnect() {
        let broker = InMemoryBroker::new();
        let manager = manager(&broker);
        manager.acquire_channel().await.unwrap();

        manager.close().await;
        assert_eq!(manager.state(), ConnectionState::Closed);
        assert_eq!(broker.open_channels(), 0);

        manager.acquire_channel().await.unwrap();
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(broker.connect_attempts(), 2);
    }
}
