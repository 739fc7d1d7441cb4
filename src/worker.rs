// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Task Worker
//!
//! A worker declares the same topology its publisher uses, limits itself to
//! `prefetch` unacknowledged deliveries and consumes with manual
//! acknowledgment. Tasks are pulled one at a time with [`Worker::next_task`];
//! each comes back as an [`InFlightTask`] that must be settled explicitly.
//!
//! [`Worker::run`] drives the pull loop with a [`TaskProcessor`]: a task is
//! acked once processing finishes, rejected when the processor fails and
//! requeued when processing times out. Malformed payloads are discarded
//! without being redelivered.

use crate::{
    channel::ConnectionManager,
    configs::WorkerConfigs,
    errors::AmqpError,
    message::{MessageHeaders, TaskPayload},
    otel,
    topology::{ensure_topology, ExchangeTopology},
    transport::{AmqpChannel, Delivery, DeliveryAcker, DeliveryStream},
};
use async_trait::async_trait;
use futures_util::StreamExt;
use opentelemetry::{
    global::{self, BoxedTracer},
    trace::{Span, Status},
};
#[cfg(test)]
use mockall::automock;
use std::{
    borrow::Cow,
    sync::{Arc, Mutex},
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Lifecycle of a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Declaring,
    Listening,
    Processing,
    Acking,
    Faulted,
}

#[derive(Clone)]
struct StateCell(Arc<Mutex<WorkerState>>);

impl StateCell {
    fn new(state: WorkerState) -> StateCell {
        StateCell(Arc::new(Mutex::new(state)))
    }

    fn get(&self) -> WorkerState {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set(&self, state: WorkerState) {
        *self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }
}

/// Work done for every task a worker receives.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait TaskProcessor: Send + Sync {
    async fn process(&self, task: &TaskPayload) -> Result<(), AmqpError>;
}

/// Pretends to work on a task by waiting a fixed delay.
#[derive(Debug, Clone)]
pub struct SimulatedWork {
    delay: Duration,
}

impl SimulatedWork {
    pub fn new(delay: Duration) -> SimulatedWork {
        SimulatedWork { delay }
    }
}

impl From<&WorkerConfigs> for SimulatedWork {
    fn from(cfg: &WorkerConfigs) -> Self {
        SimulatedWork::new(cfg.processing_delay)
    }
}

#[async_trait]
impl TaskProcessor for SimulatedWork {
    async fn process(&self, task: &TaskPayload) -> Result<(), AmqpError> {
        info!(
            id = %task.id,
            action = %task.action,
            delay_ms = self.delay.as_millis() as u64,
            "processing task"
        );
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// A received task waiting to be settled.
///
/// Dropping it without settling leaves the delivery unacknowledged; the
/// broker redelivers it once the worker's channel closes.
pub struct InFlightTask {
    payload: TaskPayload,
    delivery_tag: u64,
    redelivered: bool,
    headers: MessageHeaders,
    acker: Arc<dyn DeliveryAcker>,
    state: StateCell,
}

impl InFlightTask {
    pub fn payload(&self) -> &TaskPayload {
        &self.payload
    }

    pub fn headers(&self) -> &MessageHeaders {
        &self.headers
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    /// Whether the broker delivered this task before.
    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    /// Marks the task as handled; the broker forgets it.
    pub async fn ack(self) -> Result<(), AmqpError> {
        self.state.set(WorkerState::Acking);
        let result = self.acker.ack().await;
        self.settled(result, "ack")
    }

    /// Gives the task back to the broker, or drops it when `requeue` is false.
    pub async fn nack(self, requeue: bool) -> Result<(), AmqpError> {
        self.state.set(WorkerState::Acking);
        let result = self.acker.nack(requeue).await;
        self.settled(result, "nack")
    }

    /// Drops the task without redelivery.
    pub async fn reject(self) -> Result<(), AmqpError> {
        self.nack(false).await
    }

    fn settled(&self, result: Result<(), AmqpError>, op: &str) -> Result<(), AmqpError> {
        match result {
            Ok(()) => {
                self.state.set(WorkerState::Listening);
                debug!(id = %self.payload.id, delivery_tag = self.delivery_tag, op, "task settled");
                Ok(())
            }
            Err(err) => {
                self.state.set(WorkerState::Faulted);
                error!(
                    error = err.to_string(),
                    delivery_tag = self.delivery_tag,
                    op,
                    "error settling task"
                );
                Err(err)
            }
        }
    }
}

/// Consumer of a single destination queue.
pub struct Worker {
    channel: Arc<dyn AmqpChannel>,
    deliveries: DeliveryStream,
    topology: ExchangeTopology,
    consumer_tag: String,
    processing_timeout: Option<Duration>,
    state: StateCell,
}

impl Worker {
    /// Declares `topology`, sets the prefetch limit and starts consuming.
    ///
    /// The worker gets its own channel from `manager`; the shared publishing
    /// channel is left untouched.
    pub async fn start(
        manager: &ConnectionManager,
        topology: ExchangeTopology,
        cfg: &WorkerConfigs,
    ) -> Result<Worker, AmqpError> {
        let state = StateCell::new(WorkerState::Declaring);

        let channel = manager.open_dedicated_channel().await?;

        if let Err(err) = Worker::subscribe_setup(&channel, &topology, cfg.prefetch).await {
            error!(error = err.to_string(), queue = topology.queue_name(), "worker setup failed");
            Worker::discard(&channel).await;
            return Err(err);
        }

        let consumer_tag = format!("taskq-{}", Uuid::new_v4());
        let deliveries = match channel
            .basic_consume(topology.queue_name(), &consumer_tag)
            .await
        {
            Ok(deliveries) => deliveries,
            Err(err) => {
                error!(error = err.to_string(), "error to create the consumer");
                Worker::discard(&channel).await;
                return Err(err);
            }
        };

        state.set(WorkerState::Listening);
        info!(
            queue = topology.queue_name(),
            exchange = topology.exchange_name(),
            consumer = consumer_tag,
            "waiting for tasks"
        );

        Ok(Worker {
            channel,
            deliveries,
            topology,
            consumer_tag,
            processing_timeout: cfg.processing_timeout,
            state,
        })
    }

    async fn subscribe_setup(
        channel: &Arc<dyn AmqpChannel>,
        topology: &ExchangeTopology,
        prefetch: u16,
    ) -> Result<(), AmqpError> {
        ensure_topology(channel, topology).await?;
        channel.basic_qos(prefetch.max(1)).await
    }

    async fn discard(channel: &Arc<dyn AmqpChannel>) {
        if let Err(err) = channel.close().await {
            debug!(error = err.to_string(), "ignoring worker channel close failure");
        }
    }

    pub fn state(&self) -> WorkerState {
        self.state.get()
    }

    pub fn topology(&self) -> &ExchangeTopology {
        &self.topology
    }

    /// Waits for the next well-formed task.
    ///
    /// Malformed deliveries are rejected and skipped. `None` means the broker
    /// stopped the subscription; `Some(Err(_))` a channel or connection fault.
    /// Both leave the worker `Faulted`.
    pub async fn next_task(&mut self) -> Option<Result<InFlightTask, AmqpError>> {
        loop {
            let delivery = match self.next_delivery().await? {
                Ok(delivery) => delivery,
                Err(err) => return Some(Err(err)),
            };

            match self.accept(delivery).await {
                Ok(Some(task)) => return Some(Ok(task)),
                Ok(None) => continue,
                Err(err) => return Some(Err(err)),
            }
        }
    }

    async fn next_delivery(&mut self) -> Option<Result<Delivery, AmqpError>> {
        match self.deliveries.next().await {
            Some(Ok(delivery)) => Some(Ok(delivery)),
            Some(Err(err)) => {
                self.state.set(WorkerState::Faulted);
                error!(error = err.to_string(), consumer = self.consumer_tag, "consumer failure");
                Some(Err(err))
            }
            None => {
                self.state.set(WorkerState::Faulted);
                warn!(consumer = self.consumer_tag, "delivery stream ended");
                None
            }
        }
    }

    /// Turns a delivery into a task, or settles it for good when the body is
    /// not a task.
    async fn accept(&mut self, delivery: Delivery) -> Result<Option<InFlightTask>, AmqpError> {
        let payload = match TaskPayload::from_bytes(&delivery.data) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(
                    error = err.to_string(),
                    delivery_tag = delivery.delivery_tag,
                    "discarding malformed message"
                );
                if let Err(err) = delivery.acker.nack(false).await {
                    self.state.set(WorkerState::Faulted);
                    return Err(err);
                }
                return Ok(None);
            }
        };

        self.state.set(WorkerState::Processing);
        debug!(
            id = %payload.id,
            action = %payload.action,
            routing_key = delivery.routing_key,
            redelivered = delivery.redelivered,
            "task received"
        );

        Ok(Some(InFlightTask {
            payload,
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            headers: delivery.headers,
            acker: delivery.acker,
            state: self.state.clone(),
        }))
    }

    /// Processes tasks until `shutdown` fires or the subscription fails.
    ///
    /// A task already being processed when `shutdown` fires is finished and
    /// settled first.
    pub async fn run(
        &mut self,
        processor: &dyn TaskProcessor,
        shutdown: CancellationToken,
    ) -> Result<(), AmqpError> {
        let tracer = global::tracer("taskq worker");

        loop {
            let next = tokio::select! {
                () = shutdown.cancelled() => break,
                next = self.next_delivery() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(err)) => return Err(err),
                None => {
                    return Err(AmqpError::ConsumerError(format!(
                        "subscription to `{}` ended",
                        self.topology.queue_name()
                    )))
                }
            };

            let Some(task) = self.accept(delivery).await? else {
                continue;
            };

            Worker::handle(self.processing_timeout, processor, task, &tracer).await?;

            if shutdown.is_cancelled() {
                break;
            }
        }

        self.state.set(WorkerState::Idle);
        info!(consumer = self.consumer_tag, "worker stopped");
        Ok(())
    }

    async fn handle(
        processing_timeout: Option<Duration>,
        processor: &dyn TaskProcessor,
        task: InFlightTask,
        tracer: &BoxedTracer,
    ) -> Result<(), AmqpError> {
        let (_ctx, mut span) = otel::new_span(task.headers(), tracer, &task.payload().action);

        let outcome = match processing_timeout {
            Some(limit) => tokio::time::timeout(limit, processor.process(task.payload())).await,
            None => Ok(processor.process(task.payload()).await),
        };

        match outcome {
            Ok(Ok(())) => {
                span.set_status(Status::Ok);
                task.ack().await
            }
            Err(_elapsed) => {
                warn!(id = %task.payload().id, "processing timed out, requeuing task");
                span.set_status(Status::Error {
                    description: Cow::from("processing timed out"),
                });
                task.nack(true).await
            }
            Ok(Err(err)) => {
                error!(error = err.to_string(), id = %task.payload().id, "error processing task, rejecting");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
                task.reject().await
            }
        }
    }

    /// Closes the worker channel; unsettled deliveries return to the queue.
    pub async fn close(&self) {
        if let Err(err) = self.channel.close().await {
            error!(error = err.to_string(), "error closing worker channel");
        }
        self.state.set(WorkerState::Idle);
    }
}
