// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! A process-local implementation of the transport seam. It routes through
//! direct, fanout, topic and headers exchanges the way RabbitMQ does, tracks
//! unacknowledged deliveries per channel to enforce prefetch, requeues them
//! when a channel dies, and lets callers inject connection, channel and
//! publish faults.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeDefinition, ExchangeKind},
    message::MessageHeaders,
    queue::{HeadersMatch, QueueBinding, QueueDefinition, AMQP_HEADERS_X_MATCH},
    transport::{
        AmqpChannel, AmqpConnection, AmqpConnector, ChannelId, Delivery, DeliveryAcker,
        DeliveryStream, ErrorHook, OutboundMessage,
    },
};
use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};
use tokio::sync::watch;
use tracing::debug;

type SharedHook = Arc<dyn Fn(AmqpError) + Send + Sync>;

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredMessage {
    pub exchange: String,
    pub routing_key: String,
    pub message_id: String,
    pub kind: String,
    pub headers: MessageHeaders,
    pub body: Vec<u8>,
    pub persistent: bool,
    pub redelivered: bool,
}

struct QueueState {
    def: QueueDefinition,
    ready: VecDeque<StoredMessage>,
}

struct ConnectionState {
    open: bool,
    hooks: Vec<SharedHook>,
}

struct ChannelState {
    connection: u64,
    open: bool,
    close_reason: Option<AmqpError>,
    prefetch: u16,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    hooks: Vec<SharedHook>,
}

#[derive(Default)]
struct Faults {
    refuse_connections: u32,
    fail_publishes: u32,
    nack_publishes: u32,
    refuse_consumers: u32,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeDefinition>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<QueueBinding>,
    connections: HashMap<u64, ConnectionState>,
    channels: HashMap<ChannelId, ChannelState>,
    next_connection_id: u64,
    next_delivery_tag: u64,
    connect_attempts: u32,
    publish_attempts: u32,
    faults: Faults,
}

struct Shared {
    state: Mutex<BrokerState>,
    changes: watch::Sender<u64>,
    held: watch::Sender<bool>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn notify(&self) {
        self.changes.send_modify(|v| *v = v.wrapping_add(1));
    }

    /// Closes a channel, requeueing its unacked deliveries. Hooks fire only
    /// for error closes, after the lock is released.
    fn close_channel(&self, id: ChannelId, reason: Option<AmqpError>) {
        let hooks = {
            let mut state = self.lock();
            close_channel_locked(&mut state, id, reason.clone())
        };
        self.notify();
        fire(hooks, reason);
    }

    fn ensure_open(&self, id: ChannelId) -> Result<(), AmqpError> {
        match self.lock().channels.get(&id) {
            Some(ch) if ch.open => Ok(()),
            _ => Err(AmqpError::ChannelError(format!("{id} is closed"))),
        }
    }
}

fn close_channel_locked(
    state: &mut BrokerState,
    id: ChannelId,
    reason: Option<AmqpError>,
) -> Vec<SharedHook> {
    let Some(channel) = state.channels.get_mut(&id) else {
        return vec![];
    };
    if !channel.open {
        return vec![];
    }

    channel.open = false;
    channel.close_reason = reason.clone();
    let unacked = std::mem::take(&mut channel.unacked);
    let hooks = if reason.is_some() {
        std::mem::take(&mut channel.hooks)
    } else {
        vec![]
    };

    for (_, (queue, mut msg)) in unacked.into_iter().rev() {
        if let Some(q) = state.queues.get_mut(&queue) {
            msg.redelivered = true;
            q.ready.push_front(msg);
        }
    }

    hooks
}

fn fire(hooks: Vec<SharedHook>, reason: Option<AmqpError>) {
    if let Some(reason) = reason {
        for hook in hooks {
            hook(reason.clone());
        }
    }
}

/// Process-local broker. Cloning yields another handle on the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> InMemoryBroker {
        let (changes, _) = watch::channel(0);
        let (held, _) = watch::channel(false);

        InMemoryBroker {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                changes,
                held,
            }),
        }
    }

    /// Fails the next `n` connection attempts.
    pub fn refuse_connections(&self, n: u32) {
        self.shared.lock().faults.refuse_connections = n;
    }

    /// Fails the next `n` publishes with a channel fault that closes the channel.
    pub fn fail_publishes(&self, n: u32) {
        self.shared.lock().faults.fail_publishes = n;
    }

    /// Negatively confirms the next `n` publishes; the channel stays open.
    pub fn nack_publishes(&self, n: u32) {
        self.shared.lock().faults.nack_publishes = n;
    }

    /// Fails the next `n` consumer registrations; the channel stays open.
    pub fn refuse_consumers(&self, n: u32) {
        self.shared.lock().faults.refuse_consumers = n;
    }

    /// Stalls publishes until `release_publishes` is called.
    pub fn hold_publishes(&self) {
        self.shared.held.send_replace(true);
    }

    pub fn release_publishes(&self) {
        self.shared.held.send_replace(false);
    }

    /// Closes every open channel with a channel error.
    pub fn break_channels(&self) {
        let ids: Vec<ChannelId> = {
            let state = self.shared.lock();
            state
                .channels
                .iter()
                .filter(|(_, ch)| ch.open)
                .map(|(id, _)| *id)
                .collect()
        };

        for id in ids {
            self.shared.close_channel(
                id,
                Some(AmqpError::ChannelError("channel reset by broker".to_owned())),
            );
        }
    }

    /// Drops every open connection, closing its channels with an error.
    pub fn drop_connections(&self) {
        let reason = AmqpError::ConnectionError("connection reset by broker".to_owned());
        let mut hooks = vec![];
        let mut channel_hooks = vec![];
        {
            let mut state = self.shared.lock();
            let open: Vec<u64> = state
                .connections
                .iter()
                .filter(|(_, c)| c.open)
                .map(|(id, _)| *id)
                .collect();

            for conn_id in open {
                if let Some(conn) = state.connections.get_mut(&conn_id) {
                    conn.open = false;
                    hooks.append(&mut conn.hooks);
                }

                let channels: Vec<ChannelId> = state
                    .channels
                    .iter()
                    .filter(|(_, ch)| ch.connection == conn_id)
                    .map(|(id, _)| *id)
                    .collect();
                for id in channels {
                    channel_hooks.append(&mut close_channel_locked(
                        &mut state,
                        id,
                        Some(reason.clone()),
                    ));
                }
            }
        }

        self.shared.notify();
        fire(hooks, Some(reason.clone()));
        fire(channel_hooks, Some(reason));
    }

    /// Places a raw message straight into a queue, bypassing exchanges.
    pub fn inject(&self, queue: &str, body: &[u8]) {
        {
            let mut state = self.shared.lock();
            if let Some(q) = state.queues.get_mut(queue) {
                q.ready.push_back(StoredMessage {
                    exchange: String::new(),
                    routing_key: queue.to_owned(),
                    message_id: String::new(),
                    kind: String::new(),
                    headers: MessageHeaders::new(),
                    body: body.to_vec(),
                    persistent: false,
                    redelivered: false,
                });
            }
        }
        self.shared.notify();
    }

    pub fn exchange(&self, name: &str) -> Option<ExchangeDefinition> {
        self.shared.lock().exchanges.get(name).cloned()
    }

    pub fn queue(&self, name: &str) -> Option<QueueDefinition> {
        self.shared.lock().queues.get(name).map(|q| q.def.clone())
    }

    pub fn bindings(&self) -> Vec<QueueBinding> {
        self.shared.lock().bindings.clone()
    }

    /// Messages ready for delivery in `queue`, oldest first.
    pub fn ready_messages(&self, queue: &str) -> Vec<StoredMessage> {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or_default()
    }

    /// Deliveries from `queue` handed to consumers and not yet settled.
    pub fn unacked(&self, queue: &str) -> usize {
        self.shared
            .lock()
            .channels
            .values()
            .flat_map(|ch| ch.unacked.values())
            .filter(|(q, _)| q == queue)
            .count()
    }

    pub fn connect_attempts(&self) -> u32 {
        self.shared.lock().connect_attempts
    }

    pub fn publish_attempts(&self) -> u32 {
        self.shared.lock().publish_attempts
    }

    pub fn open_channels(&self) -> usize {
        self.shared
            .lock()
            .channels
            .values()
            .filter(|ch| ch.open)
            .count()
    }

    fn route(
        state: &BrokerState,
        exchange: &str,
        routing_key: &str,
        headers: &MessageHeaders,
    ) -> Result<Vec<String>, AmqpError> {
        if exchange.is_empty() {
            return Ok(state
                .queues
                .contains_key(routing_key)
                .then(|| vec![routing_key.to_owned()])
                .unwrap_or_default());
        }

        let Some(def) = state.exchanges.get(exchange) else {
            return Err(AmqpError::ChannelError(format!(
                "no exchange `{exchange}`"
            )));
        };

        let mut targets: Vec<String> = vec![];
        for binding in state.bindings.iter().filter(|b| b.exchange_name == exchange) {
            let matched = match def.kind {
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
                ExchangeKind::Headers => headers_match(&binding.arguments(), headers),
            };

            if matched && !targets.contains(&binding.queue_name) {
                targets.push(binding.queue_name.clone());
            }
        }

        Ok(targets)
    }
}

#[async_trait]
impl AmqpConnector for InMemoryBroker {
    async fn connect(
        &self,
        _url: &str,
        connection_name: &str,
    ) -> Result<Arc<dyn AmqpConnection>, AmqpError> {
        let mut state = self.shared.lock();
        state.connect_attempts += 1;

        if state.faults.refuse_connections > 0 {
            state.faults.refuse_connections -= 1;
            return Err(AmqpError::ConnectionError("connection refused".to_owned()));
        }

        state.next_connection_id += 1;
        let id = state.next_connection_id;
        state.connections.insert(
            id,
            ConnectionState {
                open: true,
                hooks: vec![],
            },
        );
        debug!(connection = connection_name, id, "memory connection opened");

        Ok(Arc::new(MemoryConnection {
            shared: self.shared.clone(),
            id,
        }))
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    id: u64,
}

#[async_trait]
impl AmqpConnection for MemoryConnection {
    fn is_open(&self) -> bool {
        self.shared
            .lock()
            .connections
            .get(&self.id)
            .is_some_and(|c| c.open)
    }

    fn on_error(&self, hook: ErrorHook) {
        if let Some(conn) = self.shared.lock().connections.get_mut(&self.id) {
            conn.hooks.push(Arc::from(hook));
        }
    }

    async fn create_channel(&self) -> Result<Arc<dyn AmqpChannel>, AmqpError> {
        let mut state = self.shared.lock();
        if !state.connections.get(&self.id).is_some_and(|c| c.open) {
            return Err(AmqpError::ChannelError("connection is closed".to_owned()));
        }

        let id = ChannelId::next();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                open: true,
                close_reason: None,
                prefetch: 0,
                unacked: BTreeMap::new(),
                hooks: vec![],
            },
        );

        Ok(Arc::new(MemoryChannel {
            shared: self.shared.clone(),
            id,
        }))
    }

    async fn close(&self) -> Result<(), AmqpError> {
        let channels: Vec<ChannelId> = {
            let mut state = self.shared.lock();
            if let Some(conn) = state.connections.get_mut(&self.id) {
                conn.open = false;
            }
            state
                .channels
                .iter()
                .filter(|(_, ch)| ch.connection == self.id)
                .map(|(id, _)| *id)
                .collect()
        };

        for id in channels {
            self.shared.close_channel(id, None);
        }
        Ok(())
    }
}

struct MemoryChannel {
    shared: Arc<Shared>,
    id: ChannelId,
}

impl MemoryChannel {
    /// Broker-side failures close the channel, as AMQP does.
    fn fail(&self, err: AmqpError) -> AmqpError {
        self.shared.close_channel(self.id, Some(err.clone()));
        err
    }
}

#[async_trait]
impl AmqpChannel for MemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        self.shared.ensure_open(self.id).is_ok()
    }

    fn on_error(&self, hook: ErrorHook) {
        if let Some(ch) = self.shared.lock().channels.get_mut(&self.id) {
            ch.hooks.push(Arc::from(hook));
        }
    }

    async fn exchange_declare(&self, def: &ExchangeDefinition) -> Result<(), AmqpError> {
        self.shared.ensure_open(self.id)?;

        let outcome = {
            let mut state = self.shared.lock();
            match state.exchanges.get(&def.name) {
                Some(existing)
                    if existing.kind != def.kind
                        || existing.durable != def.durable
                        || existing.delete != def.delete
                        || existing.internal != def.internal =>
                {
                    if def.passive {
                        Ok(())
                    } else {
                        Err(AmqpError::TopologyConflictError(format!(
                            "exchange `{}` exists as {} durable={}",
                            def.name, existing.kind, existing.durable
                        )))
                    }
                }
                Some(_) => Ok(()),
                None if def.passive => Err(AmqpError::ChannelError(format!(
                    "no exchange `{}`",
                    def.name
                ))),
                None => {
                    state.exchanges.insert(def.name.clone(), def.clone());
                    Ok(())
                }
            }
        };

        outcome.map_err(|err| self.fail(err))
    }

    async fn queue_declare(&self, def: &QueueDefinition) -> Result<(), AmqpError> {
        self.shared.ensure_open(self.id)?;

        let outcome = {
            let mut state = self.shared.lock();
            match state.queues.get(&def.name) {
                Some(existing)
                    if !def.passive
                        && (existing.def.durable != def.durable
                            || existing.def.exclusive != def.exclusive
                            || existing.def.delete != def.delete) =>
                {
                    Err(AmqpError::TopologyConflictError(format!(
                        "queue `{}` exists with durable={}",
                        def.name, existing.def.durable
                    )))
                }
                Some(_) => Ok(()),
                None if def.passive => {
                    Err(AmqpError::ChannelError(format!("no queue `{}`", def.name)))
                }
                None => {
                    state.queues.insert(
                        def.name.clone(),
                        QueueState {
                            def: def.clone(),
                            ready: VecDeque::new(),
                        },
                    );
                    Ok(())
                }
            }
        };

        outcome.map_err(|err| self.fail(err))
    }

    async fn queue_bind(&self, binding: &QueueBinding) -> Result<(), AmqpError> {
        self.shared.ensure_open(self.id)?;

        let outcome = {
            let mut state = self.shared.lock();
            if !state.exchanges.contains_key(&binding.exchange_name) {
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            } else if !state.queues.contains_key(&binding.queue_name) {
                Err(AmqpError::BindingExchangeToQueueError(
                    binding.exchange_name.clone(),
                    binding.queue_name.clone(),
                ))
            } else {
                if !state.bindings.contains(binding) {
                    state.bindings.push(binding.clone());
                }
                Ok(())
            }
        };

        outcome.map_err(|err| self.fail(err))
    }

    async fn basic_qos(&self, prefetch_count: u16) -> Result<(), AmqpError> {
        let mut state = self.shared.lock();
        match state.channels.get_mut(&self.id) {
            Some(ch) if ch.open => {
                ch.prefetch = prefetch_count;
                Ok(())
            }
            _ => Err(AmqpError::QoSDeclarationError(format!("{} is closed", self.id))),
        }
    }

    async fn basic_publish(&self, msg: OutboundMessage<'_>) -> Result<(), AmqpError> {
        self.shared.ensure_open(self.id)?;

        let mut held = self.shared.held.subscribe();
        if held.wait_for(|held| !*held).await.is_err() {
            return Err(AmqpError::InternalError);
        }

        let outcome = {
            let mut state = self.shared.lock();
            state.publish_attempts += 1;

            if !state.channels.get(&self.id).is_some_and(|ch| ch.open) {
                return Err(AmqpError::ChannelError(format!("{} is closed", self.id)));
            }

            if state.faults.fail_publishes > 0 {
                state.faults.fail_publishes -= 1;
                Err(AmqpError::ChannelError("channel fault during publish".to_owned()))
            } else if state.faults.nack_publishes > 0 {
                state.faults.nack_publishes -= 1;
                return Err(AmqpError::PublishNackedError);
            } else {
                let targets = InMemoryBroker::route(
                    &state,
                    msg.exchange,
                    msg.routing_key,
                    &msg.headers,
                );

                targets.map(|targets| {
                    let stored = StoredMessage {
                        exchange: msg.exchange.to_owned(),
                        routing_key: msg.routing_key.to_owned(),
                        message_id: msg.message_id.to_owned(),
                        kind: msg.kind.to_owned(),
                        headers: msg.headers.clone(),
                        body: msg.body.to_vec(),
                        persistent: msg.persistent,
                        redelivered: false,
                    };
                    for queue in targets {
                        if let Some(q) = state.queues.get_mut(&queue) {
                            q.ready.push_back(stored.clone());
                        }
                    }
                })
            }
        };

        match outcome {
            Ok(()) => {
                self.shared.notify();
                Ok(())
            }
            Err(err) => Err(self.fail(err)),
        }
    }

    async fn basic_consume(
        &self,
        queue: &str,
        _consumer_tag: &str,
    ) -> Result<DeliveryStream, AmqpError> {
        self.shared.ensure_open(self.id)?;
        {
            let mut state = self.shared.lock();
            if state.faults.refuse_consumers > 0 {
                state.faults.refuse_consumers -= 1;
                return Err(AmqpError::ConsumerError(format!("consumer on `{queue}` refused")));
            }
        }
        if !self.shared.lock().queues.contains_key(queue) {
            return Err(self.fail(AmqpError::ConsumerDeclarationError(queue.to_owned())));
        }

        let cursor = Cursor {
            shared: self.shared.clone(),
            channel: self.id,
            queue: queue.to_owned(),
            changes: self.shared.changes.subscribe(),
            finished: false,
        };

        Ok(stream::unfold(cursor, |mut cursor| async move {
            loop {
                if cursor.finished {
                    return None;
                }

                cursor.changes.borrow_and_update();
                match cursor.poll_delivery() {
                    Next::Ready(item) => return Some((item, cursor)),
                    Next::Closed(Some(reason)) => {
                        cursor.finished = true;
                        return Some((Err(reason), cursor));
                    }
                    Next::Closed(None) => return None,
                    Next::Wait => {
                        if cursor.changes.changed().await.is_err() {
                            return None;
                        }
                    }
                }
            }
        })
        .boxed())
    }

    async fn close(&self) -> Result<(), AmqpError> {
        self.shared.close_channel(self.id, None);
        Ok(())
    }
}

enum Next {
    Ready(Result<Delivery, AmqpError>),
    Wait,
    Closed(Option<AmqpError>),
}

struct Cursor {
    shared: Arc<Shared>,
    channel: ChannelId,
    queue: String,
    changes: watch::Receiver<u64>,
    finished: bool,
}

impl Cursor {
    fn poll_delivery(&self) -> Next {
        let mut guard = self.shared.lock();
        let state = &mut *guard;

        let Some(channel) = state.channels.get_mut(&self.channel) else {
            return Next::Closed(None);
        };
        if !channel.open {
            return Next::Closed(channel.close_reason.clone());
        }
        if channel.prefetch > 0 && channel.unacked.len() >= channel.prefetch as usize {
            return Next::Wait;
        }

        let Some(msg) = state
            .queues
            .get_mut(&self.queue)
            .and_then(|q| q.ready.pop_front())
        else {
            return Next::Wait;
        };

        state.next_delivery_tag += 1;
        let tag = state.next_delivery_tag;
        channel.unacked.insert(tag, (self.queue.clone(), msg.clone()));

        Next::Ready(Ok(Delivery {
            delivery_tag: tag,
            exchange: msg.exchange,
            routing_key: msg.routing_key,
            redelivered: msg.redelivered,
            headers: msg.headers,
            data: msg.body,
            acker: Arc::new(MemoryAcker {
                shared: self.shared.clone(),
                channel: self.channel,
                tag,
            }),
        }))
    }
}

struct MemoryAcker {
    shared: Arc<Shared>,
    channel: ChannelId,
    tag: u64,
}

impl MemoryAcker {
    fn settle(&self, requeue: bool) -> Result<(), ()> {
        let mut guard = self.shared.lock();
        let state = &mut *guard;

        let (queue, mut msg) = state
            .channels
            .get_mut(&self.channel)
            .filter(|ch| ch.open)
            .and_then(|ch| ch.unacked.remove(&self.tag))
            .ok_or(())?;

        if requeue {
            if let Some(q) = state.queues.get_mut(&queue) {
                msg.redelivered = true;
                q.ready.push_front(msg);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryAcker for MemoryAcker {
    async fn ack(&self) -> Result<(), AmqpError> {
        let settled = self.settle(false);
        self.shared.notify();
        settled.map_err(|_| AmqpError::AckMessageError)
    }

    async fn nack(&self, requeue: bool) -> Result<(), AmqpError> {
        let settled = self.settle(requeue);
        self.shared.notify();
        settled.map_err(|_| AmqpError::NackMessageError)
    }
}

/// Topic exchange matching: `*` matches exactly one dot-separated word, `#`
/// matches zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match pattern.split_first() {
            None => key.is_empty(),
            Some((&"#", rest)) => (0..=key.len()).any(|skip| matches(rest, &key[skip..])),
            Some((&"*", rest)) => !key.is_empty() && matches(rest, &key[1..]),
            Some((word, rest)) => key.first() == Some(word) && matches(rest, &key[1..]),
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = if routing_key.is_empty() {
        vec![]
    } else {
        routing_key.split('.').collect()
    };

    matches(&pattern, &key)
}

/// Headers exchange matching against binding arguments carrying `x-match`.
pub fn headers_match(binding_args: &MessageHeaders, headers: &MessageHeaders) -> bool {
    let mode: HeadersMatch = binding_args
        .get(AMQP_HEADERS_X_MATCH)
        .and_then(|m| m.parse().ok())
        .unwrap_or_default();

    let mut criteria = binding_args.iter().filter(|(key, _)| {
        key.as_str() != AMQP_HEADERS_X_MATCH
            && (mode.includes_x_headers() || !key.starts_with("x-"))
    });

    if mode.requires_all() {
        criteria.all(|(key, value)| headers.get(key) == Some(value))
    } else {
        criteria.any(|(key, value)| headers.get(key) == Some(value))
    }
}
