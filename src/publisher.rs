// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Publisher
//!
//! This module sends tasks to a destination. Every attempt acquires the
//! shared channel, declares the destination topology and publishes the whole
//! message once. A failed attempt recycles the channel so the next one starts
//! on a fresh channel; attempts are bounded by a [`RetryPolicy`].
//!
//! Delivery is at-least-once: an attempt whose confirmation got lost may be
//! followed by a successful duplicate.

use crate::{
    channel::ConnectionManager,
    configs::Configs,
    errors::AmqpError,
    message::{MessageHeaders, TaskPayload},
    otel,
    retry::{retry, RetryError, RetryPolicy},
    topology::{ensure_topology, ExchangeTopology},
    transport::{AmqpChannel, OutboundMessage},
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, error};

/// Sends tasks to destinations.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publishes `payload` to `destination`, retrying transient failures.
    async fn publish(
        &self,
        destination: &ExchangeTopology,
        payload: &TaskPayload,
    ) -> Result<(), AmqpError>;
}

/// Publisher backed by the process-wide connection manager.
pub struct TaskPublisher {
    manager: Arc<ConnectionManager>,
    policy: RetryPolicy,
    attempt_timeout: Option<Duration>,
}

impl TaskPublisher {
    /// # Parameters
    /// * `manager` - Connection manager shared with the rest of the process
    /// * `policy` - How many attempts to make and how long to wait between them
    pub fn new(manager: Arc<ConnectionManager>, policy: RetryPolicy) -> TaskPublisher {
        TaskPublisher {
            manager,
            policy,
            attempt_timeout: None,
        }
    }

    pub fn from_configs(manager: Arc<ConnectionManager>, cfg: &Configs) -> TaskPublisher {
        TaskPublisher {
            manager,
            policy: RetryPolicy::from(&cfg.publisher),
            attempt_timeout: cfg.publisher.attempt_timeout,
        }
    }

    /// Bounds every broker step of an attempt; a step that runs longer fails
    /// the attempt with `TimeoutError`.
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = Some(timeout);
        self
    }

    /// Closes the underlying channel and connection.
    pub async fn close(&self) {
        self.manager.close().await;
    }

    async fn attempt(
        &self,
        destination: &ExchangeTopology,
        payload: &TaskPayload,
        body: &[u8],
        headers: &MessageHeaders,
        attempt: u32,
    ) -> Result<(), AmqpError> {
        let channel = self.bounded(self.manager.acquire_channel()).await?;

        let outcome = self
            .bounded(self.send(&channel, destination, payload, body, headers))
            .await;

        if let Err(err) = &outcome {
            error!(
                error = err.to_string(),
                attempt,
                channel = channel.id().to_string(),
                "error publishing message"
            );
            self.manager.recycle(&channel).await;
        }

        outcome
    }

    async fn send(
        &self,
        channel: &Arc<dyn AmqpChannel>,
        destination: &ExchangeTopology,
        payload: &TaskPayload,
        body: &[u8],
        headers: &MessageHeaders,
    ) -> Result<(), AmqpError> {
        ensure_topology(channel, destination).await?;

        channel
            .basic_publish(OutboundMessage {
                exchange: destination.exchange_name(),
                routing_key: destination.publish_key(),
                body,
                message_id: &payload.id,
                kind: &payload.action,
                headers: headers.clone(),
                persistent: true,
            })
            .await
    }

    async fn bounded<T, F>(&self, fut: F) -> Result<T, AmqpError>
    where
        F: Future<Output = Result<T, AmqpError>>,
    {
        match self.attempt_timeout {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .unwrap_or(Err(AmqpError::TimeoutError)),
            None => fut.await,
        }
    }
}

#[async_trait]
impl Publisher for TaskPublisher {
    async fn publish(
        &self,
        destination: &ExchangeTopology,
        payload: &TaskPayload,
    ) -> Result<(), AmqpError> {
        destination.validate()?;
        let body = payload.to_bytes()?;

        let mut headers = destination.message_headers();
        otel::inject_context(&Context::current(), &mut headers);

        let result = retry(&self.policy, |attempt| {
            self.attempt(destination, payload, &body, &headers, attempt)
        })
        .await;

        match result {
            Ok(()) => {
                debug!(
                    id = %payload.id,
                    action = %payload.action,
                    exchange = destination.exchange_name(),
                    queue = destination.queue_name(),
                    "task published"
                );
                Ok(())
            }
            Err(RetryError::Fatal { error, .. }) => Err(error),
            Err(RetryError::Exhausted { attempts, last }) => {
                error!(
                    error = last.to_string(),
                    attempts,
                    id = %payload.id,
                    "giving up publishing task"
                );
                Err(AmqpError::PublishError {
                    attempts,
                    source: Box::new(last),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        channel::ConnectionState,
        memory::InMemoryBroker,
        presets::Preset,
        queue::HeadersMatch,
        transport::{AmqpConnection, AmqpConnector, MockAmqpConnector},
    };
    use serde_json::{json, Map, Value};
    use tokio::time::Instant;

    fn task() -> TaskPayload {
        let Value::Object(data) = json!({ "message": "disk full", "host": "db-1" }) else {
            unreachable!()
        };
        TaskPayload::new("process_log", data)
    }

    fn publisher(broker: &InMemoryBroker) -> TaskPublisher {
        let manager = ConnectionManager::new(&Configs::default(), Arc::new(broker.clone()));
        TaskPublisher::new(Arc::new(manager), RetryPolicy::default())
    }

    #[tokio::test]
    async fn publishes_a_persistent_json_message() {
        let broker = InMemoryBroker::new();
        let task = task();

        publisher(&broker)
            .publish(
                &ExchangeTopology::direct("direct_logs", "queue_log_error", "error"),
                &task,
            )
            .await
            .unwrap();

        let msgs = broker.ready_messages("queue_log_error");
        assert_eq!(msgs.len(), 1);
        assert!(msgs[0].persistent);
        assert_eq!(msgs[0].routing_key, "error");
        assert_eq!(msgs[0].message_id, task.id);
        assert_eq!(msgs[0].kind, "process_log");
        assert_eq!(TaskPayload::from_bytes(&msgs[0].body).unwrap(), task);
    }

    #[tokio::test]
    async fn plain_queue_goes_through_the_default_exchange() {
        let broker = InMemoryBroker::new();

        publisher(&broker)
            .publish(&ExchangeTopology::queue("test_queue"), &task())
            .await
            .unwrap();

        let msgs = broker.ready_messages("test_queue");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].exchange, "");
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_three_spaced_attempts() {
        let broker = InMemoryBroker::new();
        broker.fail_publishes(u32::MAX);
        let started = Instant::now();

        let err = publisher(&broker)
            .publish(&ExchangeTopology::queue("test_queue"), &task())
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            AmqpError::PublishError { attempts: 3, source } if matches!(**source, AmqpError::ChannelError(_))
        ));
        assert_eq!(broker.publish_attempts(), 3);
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(broker.queue_depth("test_queue"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn broker_nacks_are_retried() {
        let broker = InMemoryBroker::new();
        broker.nack_publishes(2);

        publisher(&broker)
            .publish(&ExchangeTopology::queue("test_queue"), &task())
            .await
            .unwrap();

        assert_eq!(broker.publish_attempts(), 3);
        assert_eq!(broker.queue_depth("test_queue"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_attempt_recycles_the_channel() {
        let broker = InMemoryBroker::new();
        broker.fail_publishes(1);
        let publisher = publisher(&broker);

        let before = publisher.manager.acquire_channel().await.unwrap().id();
        publisher
            .publish(&ExchangeTopology::queue("test_queue"), &task())
            .await
            .unwrap();
        let after = publisher.manager.acquire_channel().await.unwrap().id();

        assert_ne!(before, after);
        assert_eq!(broker.open_channels(), 1);
        assert_eq!(broker.queue_depth("test_queue"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_after_refused_connections() {
        let broker = InMemoryBroker::new();
        broker.refuse_connections(2);

        publisher(&broker)
            .publish(&ExchangeTopology::queue("test_queue"), &task())
            .await
            .unwrap();

        assert_eq!(broker.connect_attempts(), 3);
        assert_eq!(broker.queue_depth("test_queue"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn topology_conflicts_are_not_retried() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        publisher
            .publish(&ExchangeTopology::fanout("logs", "queue_a"), &task())
            .await
            .unwrap();

        let err = publisher
            .publish(&ExchangeTopology::direct("logs", "queue_b", "error"), &task())
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::TopologyConflictError(_)));
        assert_eq!(broker.publish_attempts(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_attempts_time_out_and_retry() {
        let broker = InMemoryBroker::new();
        broker.hold_publishes();
        let publisher = publisher(&broker).attempt_timeout(Duration::from_millis(500));

        let err = publisher
            .publish(&ExchangeTopology::queue("test_queue"), &task())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AmqpError::PublishError { attempts: 3, source } if *source == AmqpError::TimeoutError
        ));
    }

    struct UnreachableBroker;

    #[async_trait]
    impl AmqpConnector for UnreachableBroker {
        async fn connect(
            &self,
            _url: &str,
            _connection_name: &str,
        ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timed_out_connect_resets_the_manager() {
        let manager = Arc::new(ConnectionManager::new(
            &Configs::default(),
            Arc::new(UnreachableBroker),
        ));
        let publisher = TaskPublisher::new(manager.clone(), RetryPolicy::no_retry())
            .attempt_timeout(Duration::from_millis(100));

        let err = publisher
            .publish(&ExchangeTopology::queue("test_queue"), &task())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            AmqpError::PublishError { attempts: 1, source } if *source == AmqpError::TimeoutError
        ));
        assert_eq!(manager.state(), ConnectionState::Uninitialized);
    }

    #[tokio::test]
    async fn missing_queue_name_fails_before_connecting() {
        let mut connector = MockAmqpConnector::new();
        connector.expect_connect().never();
        let manager = ConnectionManager::new(&Configs::default(), Arc::new(connector));
        let publisher = TaskPublisher::new(Arc::new(manager), RetryPolicy::default());

        let err = publisher
            .publish(
                &ExchangeTopology::fanout("notifikasi_massal", ""),
                &TaskPayload::new("noop", Map::new()),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AmqpError::ConfigError(_)));
    }

    #[tokio::test]
    async fn works_behind_the_publisher_trait() {
        let broker = InMemoryBroker::new();
        let publisher: Arc<dyn Publisher> = Arc::new(publisher(&broker));

        publisher
            .publish(&ExchangeTopology::queue("test_queue"), &task())
            .await
            .unwrap();

        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.queue_depth("test_queue"), 1);
    }

    async fn declare(publisher: &TaskPublisher, topology: &ExchangeTopology) {
        let channel = publisher.manager.acquire_channel().await.unwrap();
        ensure_topology(&channel, topology).await.unwrap();
    }

    #[tokio::test]
    async fn fanout_reaches_every_bound_queue() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        declare(&publisher, &ExchangeTopology::fanout("notifikasi_massal", "queue.audit")).await;

        publisher.publish(&Preset::Fanout.topology(), &task()).await.unwrap();

        assert_eq!(broker.queue_depth("queue.log.info"), 1);
        assert_eq!(broker.queue_depth("queue.audit"), 1);
    }

    #[tokio::test]
    async fn topic_pattern_filters_by_region() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        declare(
            &publisher,
            &ExchangeTopology::topic("berita_topic", "queue_berita_eropa", "europe.france.paris")
                .binding_pattern("europe.#"),
        )
        .await;

        publisher.publish(&Preset::Topic.topology(), &task()).await.unwrap();

        let msgs = broker.ready_messages("queue_berita_indo");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].routing_key, "asia.indonesia.jakarta");
        assert_eq!(broker.queue_depth("queue_berita_eropa"), 0);
    }

    #[tokio::test]
    async fn headers_reach_only_matching_bindings() {
        let broker = InMemoryBroker::new();
        let publisher = publisher(&broker);
        let docx = MessageHeaders::from([("format".to_owned(), "docx".to_owned())]);
        declare(
            &publisher,
            &ExchangeTopology::headers("dokumen_headers", "queue_dokumen_docx", docx, HeadersMatch::All),
        )
        .await;

        publisher.publish(&Preset::Headers.topology(), &task()).await.unwrap();

        let msgs = broker.ready_messages("queue_dokumen_rahasia");
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].headers.get("format").map(String::as_str), Some("pdf"));
        assert_eq!(msgs[0].headers.get("x-secret").map(String::as_str), Some("true"));
        assert_eq!(broker.queue_depth("queue_dokumen_docx"), 0);
    }
}
